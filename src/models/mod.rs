//! 数据模型
//!
//! 用户、存储策略、文件、目录、节点、任务与离线下载记录。
//! 字段含义与数据库表一一对应，序列化字段（策略选项、节点
//! 离线下载配置、下载状态快照）以 JSON 文本落库。

pub mod store;

use chrono::Local;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use store::Database;

/// 用户
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    /// 已用容量（字节），始终等于该用户所有文件记录的大小之和
    pub storage: u64,
    /// 容量上限（字节）
    pub max_storage: u64,
    /// 该用户上传使用的存储策略
    pub policy_id: i64,
}

impl User {
    /// 剩余可用容量，已超限时为 0
    pub fn remaining_capacity(&self) -> u64 {
        self.max_storage.saturating_sub(self.storage)
    }
}

/// 存储策略类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    /// 本机磁盘
    Local,
    /// 从机节点
    Remote,
    /// OneDrive
    Onedrive,
    /// 测试桩，不做任何物理写入
    Mock,
    /// 匿名策略，仅用于外部来源文件的占位
    Anonymous,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Local => "local",
            PolicyType::Remote => "remote",
            PolicyType::Onedrive => "onedrive",
            PolicyType::Mock => "mock",
            PolicyType::Anonymous => "anonymous",
        }
    }

    pub fn from_str(s: &str) -> Option<PolicyType> {
        match s {
            "local" => Some(PolicyType::Local),
            "remote" => Some(PolicyType::Remote),
            "onedrive" => Some(PolicyType::Onedrive),
            "mock" => Some(PolicyType::Mock),
            "anonymous" => Some(PolicyType::Anonymous),
            _ => None,
        }
    }
}

/// 策略扩展选项，整体以 JSON 落库
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOption {
    /// 允许的文件扩展名，空表示不限制
    #[serde(default)]
    pub file_type: Vec<String>,
    /// OneDrive 应用 ID
    #[serde(default)]
    pub client_id: String,
    /// OneDrive 重定向地址
    #[serde(default)]
    pub od_redirect: String,
    /// 分片上传的分片大小
    #[serde(default)]
    pub chunk_size: u64,
    /// 创建占位文件时是否预扣其声明大小
    #[serde(default)]
    pub placeholder_with_size: bool,
    /// 每秒对存储端的 API 请求上限，0 表示不限
    #[serde(default)]
    pub tps_limit: f64,
    /// API 请求爆发上限
    #[serde(default)]
    pub tps_limit_burst: usize,
}

/// 存储策略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    /// 存储端地址（从机地址 / OneDrive API 根）
    pub server: String,
    pub access_key: String,
    pub secret_key: String,
    /// 单文件大小上限（字节），0 表示不限
    pub max_size: u64,
    /// 是否按命名规则重命名物理文件
    pub auto_rename: bool,
    /// 物理目录命名规则
    pub dir_name_rule: String,
    /// 物理文件命名规则
    pub file_name_rule: String,
    /// 外链 CDN 基地址，空表示直接使用本站地址
    pub base_url: String,
    pub options: PolicyOption,
}

impl Policy {
    /// 该扩展名的文件是否可以由存储端生成缩略图
    pub fn is_thumb_exist(&self, name: &str) -> bool {
        // 各存储端支持缩略图处理的扩展名
        let list: &[&str] = match self.policy_type {
            PolicyType::Onedrive => &["*"],
            _ => &[],
        };
        if list == ["*"] {
            return true;
        }
        let ext = Path::new(name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        list.contains(&ext.as_str())
    }

    /// 缩略图是否需要由本机生成
    pub fn is_thumb_generate_needed(&self) -> bool {
        self.policy_type == PolicyType::Local
    }

    /// 目录结构是否可直接列举存储端
    pub fn can_structure_be_listed(&self) -> bool {
        !matches!(self.policy_type, PolicyType::Local | PolicyType::Remote)
    }

    /// 上传是否由客户端直传存储端（不经过本机）
    pub fn is_upload_placeholder_needed(&self) -> bool {
        matches!(self.policy_type, PolicyType::Remote | PolicyType::Onedrive)
    }

    /// 按目录命名规则生成物理存储目录
    pub fn generate_path(&self, uid: i64, origin: &str) -> String {
        let rendered = render_name_rule(&self.dir_name_rule, uid, origin, true);
        clean_path(&rendered)
    }

    /// 按文件命名规则生成物理文件名；未开启自动重命名时返回原名
    pub fn generate_file_name(&self, uid: i64, origin: &str) -> String {
        if !self.auto_rename {
            return origin.to_string();
        }
        render_name_rule(&self.file_name_rule, uid, origin, false)
    }
}

/// 展开命名规则中的魔法变量
fn render_name_rule(rule: &str, uid: i64, origin: &str, is_dir: bool) -> String {
    let now = Local::now();
    let mut out = rule.to_string();

    let pairs: Vec<(&str, String)> = vec![
        ("{randomkey16}", rand_string(16)),
        ("{randomkey8}", rand_string(8)),
        ("{timestamp}", now.timestamp().to_string()),
        ("{timestamp_nano}", now.timestamp_nanos_opt().unwrap_or_default().to_string()),
        ("{uid}", uid.to_string()),
        ("{datetime}", now.format("%Y%m%d%H%M%S").to_string()),
        ("{date}", now.format("%Y%m%d").to_string()),
        ("{year}", now.format("%Y").to_string()),
        ("{month}", now.format("%m").to_string()),
        ("{day}", now.format("%d").to_string()),
        ("{hour}", now.format("%H").to_string()),
        ("{minute}", now.format("%M").to_string()),
        ("{second}", now.format("%S").to_string()),
    ];
    for (key, val) in pairs {
        out = out.replace(key, &val);
    }

    if is_dir {
        out = out.replace("{path}", &format!("{}/", origin));
    } else {
        let ext = Path::new(origin)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        out = out.replace("{originname}", origin);
        out = out.replace("{ext}", &ext);
        out = out.replace("{uuid}", &uuid::Uuid::new_v4().to_string());
    }
    out
}

/// 生成指定长度的随机字母数字串
pub fn rand_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// 规范化路径：折叠多余分隔符与 `.` 段
fn clean_path(p: &str) -> String {
    let absolute = p.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// 文件记录
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct File {
    pub id: i64,
    /// 虚拟文件名
    pub name: String,
    /// 物理存储路径
    pub source_name: String,
    pub user_id: i64,
    pub size: u64,
    /// 图片探针信息，占位状态下为空
    pub pic_info: String,
    pub folder_id: i64,
    pub policy_id: i64,
    /// 非空表示该记录是未完成上传会话的占位文件
    pub upload_session_id: Option<String>,
    pub metadata: String,
}

impl File {
    /// 是否仍处于占位状态
    pub fn is_placeholder(&self) -> bool {
        self.upload_session_id.is_some()
    }
}

/// 目录记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: i64,
    pub name: String,
    /// 根目录的父目录为 None
    pub parent_id: Option<i64>,
    pub owner_id: i64,
}

/// 节点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Active = 0,
    Suspend = 1,
}

impl NodeStatus {
    pub fn from_i64(v: i64) -> NodeStatus {
        if v == 1 {
            NodeStatus::Suspend
        } else {
            NodeStatus::Active
        }
    }
}

/// 节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Slave = 0,
    Master = 1,
}

/// 节点的离线下载配置，以 JSON 落库
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloaderOption {
    /// 下载引擎 RPC 地址
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub token: String,
    /// 引擎的临时下载目录
    #[serde(default)]
    pub temp_path: String,
    /// 状态轮询间隔（秒），0 使用全局默认
    #[serde(default)]
    pub interval: u64,
    /// RPC 超时（秒）
    #[serde(default)]
    pub timeout: u64,
}

/// 节点记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub status: NodeStatus,
    pub name: String,
    pub node_type: NodeType,
    /// 节点地址（从机 API 根）
    pub server: String,
    /// 向从机发送请求时的签名密钥
    pub slave_key: String,
    /// 从机回调主机时的签名密钥
    pub master_key: String,
    /// 是否提供离线下载能力
    pub downloader_enabled: bool,
    pub downloader_options: DownloaderOption,
    /// 负载均衡权重序
    pub rank: i64,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued = 0,
    Processing = 1,
    Error = 2,
    Canceled = 3,
    Complete = 4,
}

impl TaskStatus {
    pub fn from_i64(v: i64) -> TaskStatus {
        match v {
            1 => TaskStatus::Processing,
            2 => TaskStatus::Error,
            3 => TaskStatus::Canceled,
            4 => TaskStatus::Complete,
            _ => TaskStatus::Queued,
        }
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    Compress = 0,
    Decompress = 1,
    Transfer = 2,
    Import = 3,
}

impl TaskType {
    pub fn from_i64(v: i64) -> Option<TaskType> {
        match v {
            0 => Some(TaskType::Compress),
            1 => Some(TaskType::Decompress),
            2 => Some(TaskType::Transfer),
            3 => Some(TaskType::Import),
            _ => None,
        }
    }
}

/// 后台任务记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub user_id: i64,
    /// 任务自定义进度阶段
    pub progress: i64,
    pub error: String,
    /// 任务参数，JSON 文本
    pub props: String,
}

/// 离线下载状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Ready = 0,
    Downloading = 1,
    Paused = 2,
    Error = 3,
    Complete = 4,
    Canceled = 5,
    Unknown = 6,
}

impl DownloadStatus {
    pub fn from_i64(v: i64) -> DownloadStatus {
        match v {
            0 => DownloadStatus::Ready,
            1 => DownloadStatus::Downloading,
            2 => DownloadStatus::Paused,
            3 => DownloadStatus::Error,
            4 => DownloadStatus::Complete,
            5 => DownloadStatus::Canceled,
            _ => DownloadStatus::Unknown,
        }
    }
}

/// 离线下载记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: i64,
    pub status: DownloadStatus,
    /// 下载源（URL 或种子）
    pub source: String,
    pub total_size: u64,
    pub downloaded_size: u64,
    /// 下载引擎分配的任务标识
    pub gid: String,
    pub speed: i64,
    /// 保存到的虚拟目录
    pub dst: String,
    /// 引擎最近一次状态快照，JSON 文本
    pub attrs: String,
    pub error: String,
    pub user_id: i64,
    /// 完成后派生的中转任务
    pub task_id: Option<i64>,
    /// 执行下载的节点
    pub node_id: i64,
}

impl DownloadRecord {
    /// 下载执行节点，历史记录中 0 代表主机
    pub fn node_id_or_master(&self) -> i64 {
        if self.node_id == 0 {
            1
        } else {
            self.node_id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy(policy_type: PolicyType) -> Policy {
        Policy {
            id: 1,
            name: "test".into(),
            policy_type,
            server: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            max_size: 0,
            auto_rename: true,
            dir_name_rule: "uploads/{uid}/{path}".into(),
            file_name_rule: "{uid}_{randomkey8}{ext}".into(),
            base_url: String::new(),
            options: PolicyOption::default(),
        }
    }

    #[test]
    fn test_remaining_capacity() {
        let mut user = User {
            id: 1,
            email: "a@b.c".into(),
            storage: 30,
            max_storage: 100,
            policy_id: 1,
        };
        assert_eq!(user.remaining_capacity(), 70);
        user.storage = 200;
        assert_eq!(user.remaining_capacity(), 0);
    }

    #[test]
    fn test_generate_path() {
        let policy = test_policy(PolicyType::Local);
        assert_eq!(policy.generate_path(42, "photos"), "uploads/42/photos");
    }

    #[test]
    fn test_generate_file_name() {
        let policy = test_policy(PolicyType::Local);
        let name = policy.generate_file_name(42, "cat.jpg");
        assert!(name.starts_with("42_"));
        assert!(name.ends_with(".jpg"));
        assert_eq!(name.len(), "42_".len() + 8 + ".jpg".len());
    }

    #[test]
    fn test_no_auto_rename_keeps_origin() {
        let mut policy = test_policy(PolicyType::Local);
        policy.auto_rename = false;
        assert_eq!(policy.generate_file_name(1, "原图.png"), "原图.png");
    }

    #[test]
    fn test_thumb_rules() {
        let local = test_policy(PolicyType::Local);
        assert!(local.is_thumb_generate_needed());
        assert!(!local.is_thumb_exist("a.jpg"));

        let od = test_policy(PolicyType::Onedrive);
        assert!(!od.is_thumb_generate_needed());
        assert!(od.is_thumb_exist("anything.bin"));
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("a//b/./c/"), "a/b/c");
        assert_eq!(clean_path("/a/../b"), "/b");
        assert_eq!(clean_path(""), ".");
    }

    #[test]
    fn test_rand_string_length() {
        assert_eq!(rand_string(16).len(), 16);
        assert_ne!(rand_string(16), rand_string(16));
    }
}
