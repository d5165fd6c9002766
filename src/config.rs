// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 节点角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// 主机：持有完整数据库，调度全部任务
    Master,
    /// 从机：仅执行主机下发的任务
    Slave,
}

impl Default for NodeRole {
    fn default() -> Self {
        NodeRole::Master
    }
}

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 站点与角色配置
    #[serde(default)]
    pub site: SiteConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 集群配置
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// 任务队列配置
    #[serde(default)]
    pub task: TaskConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 数据库路径
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

/// 站点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// 本节点角色
    #[serde(default)]
    pub role: NodeRole,
    /// 站点外部访问地址（用于生成外链与回调地址）
    #[serde(default = "default_site_url")]
    pub url: String,
    /// 站点 ID（从机向主机汇报时使用）
    #[serde(default)]
    pub id: String,
    /// 站点签名密钥，留空时首次启动自动生成并写回配置
    #[serde(default)]
    pub secret: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Master,
            url: default_site_url(),
            id: String::new(),
            secret: String::new(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片上传失败的最大重试次数
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: usize,
    /// 分片重试间隔（秒）
    #[serde(default = "default_chunk_retry_sleep_secs")]
    pub chunk_retry_sleep_secs: u64,
    /// 非可寻址源是否启用临时文件重放缓冲
    #[serde(default = "default_use_temp_chunk_buffer")]
    pub use_temp_chunk_buffer: bool,
    /// 上传会话有效期（秒）
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: i64,
    /// 临时目录
    #[serde(default = "default_temp_path")]
    pub temp_path: PathBuf,
    /// 解压缩时的最大并行上传数
    #[serde(default = "default_max_parallel_transfer")]
    pub max_parallel_transfer: usize,
    /// 缩略图文件后缀
    #[serde(default = "default_thumb_suffix")]
    pub thumb_suffix: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_retries: default_chunk_retries(),
            chunk_retry_sleep_secs: default_chunk_retry_sleep_secs(),
            use_temp_chunk_buffer: default_use_temp_chunk_buffer(),
            session_ttl_secs: default_session_ttl_secs(),
            temp_path: default_temp_path(),
            max_parallel_transfer: default_max_parallel_transfer(),
            thumb_suffix: default_thumb_suffix(),
        }
    }
}

/// 集群配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// 从机心跳间隔（秒）
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// 从机失联后的恢复探测间隔（秒）
    #[serde(default = "default_recover_interval_secs")]
    pub recover_interval_secs: u64,
    /// 连续失败多少次后标记从机离线
    #[serde(default = "default_ping_retries")]
    pub ping_retries: usize,
    /// 从机 API 签名有效期（秒）
    #[serde(default = "default_slave_api_timeout_secs")]
    pub slave_api_timeout_secs: i64,
    /// 等待从机中转完成的超时（秒）
    #[serde(default = "default_transfer_wait_timeout_secs")]
    pub transfer_wait_timeout_secs: u64,
    /// 离线下载状态轮询间隔（秒）
    #[serde(default = "default_offline_poll_interval_secs")]
    pub offline_poll_interval_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            recover_interval_secs: default_recover_interval_secs(),
            ping_retries: default_ping_retries(),
            slave_api_timeout_secs: default_slave_api_timeout_secs(),
            transfer_wait_timeout_secs: default_transfer_wait_timeout_secs(),
            offline_poll_interval_secs: default_offline_poll_interval_secs(),
        }
    }
}

/// 任务队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// 工作协程数量
    #[serde(default = "default_max_worker_num")]
    pub max_worker_num: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_worker_num: default_max_worker_num(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_site_url() -> String {
    "http://localhost:5212".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("yunpan.db")
}

fn default_chunk_retries() -> usize {
    5
}

fn default_chunk_retry_sleep_secs() -> u64 {
    5
}

fn default_use_temp_chunk_buffer() -> bool {
    true
}

fn default_session_ttl_secs() -> i64 {
    86400
}

fn default_temp_path() -> PathBuf {
    PathBuf::from("temp")
}

fn default_max_parallel_transfer() -> usize {
    4
}

fn default_thumb_suffix() -> String {
    "._thumb".to_string()
}

fn default_ping_interval_secs() -> u64 {
    300
}

fn default_recover_interval_secs() -> u64 {
    600
}

fn default_ping_retries() -> usize {
    3
}

fn default_slave_api_timeout_secs() -> i64 {
    60
}

fn default_transfer_wait_timeout_secs() -> u64 {
    172800
}

fn default_offline_poll_interval_secs() -> u64 {
    10
}

fn default_max_worker_num() -> usize {
    10
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// 从 TOML 文件加载配置，文件不存在时返回默认配置
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }

    /// 将配置写回 TOML 文件
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("写入配置文件失败: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.site.role, NodeRole::Master);
        assert_eq!(config.upload.chunk_retries, 5);
        assert_eq!(config.cluster.ping_retries, 3);
        assert_eq!(config.task.max_worker_num, 10);
        assert!(config.upload.use_temp_chunk_buffer);
    }

    #[test]
    fn test_partial_toml() {
        // 只给出部分字段，其余应取默认值
        let config: AppConfig = toml::from_str(
            r#"
            [site]
            role = "slave"
            id = "slave-01"

            [upload]
            chunk_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.site.role, NodeRole::Slave);
        assert_eq!(config.site.id, "slave-01");
        assert_eq!(config.upload.chunk_retries, 2);
        assert_eq!(config.upload.session_ttl_secs, 86400);
    }

    #[test]
    fn test_load_missing_file() {
        let config = AppConfig::load(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.cluster.ping_interval_secs, 300);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.site.id = "master-main".to_string();
        config.save(&path).unwrap();

        let reloaded = AppConfig::load(&path).unwrap();
        assert_eq!(reloaded.site.id, "master-main");
    }
}
