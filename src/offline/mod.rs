//! 离线下载
//!
//! 引擎侧走 aria2 的 JSON-RPC 接口；每条活动下载记录由一个
//! [`monitor::Monitor`] 跟踪，状态落库并在完成时派生中转任务。

pub mod monitor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::cluster::NodePool;
use crate::error::DriverError;
use crate::models::{DownloadRecord, DownloaderOption};

pub use monitor::{Monitor, MonitorDeps};

// ===== 引擎侧状态字符串 =====
pub const ENGINE_ACTIVE: &str = "active";
pub const ENGINE_WAITING: &str = "waiting";
pub const ENGINE_PAUSED: &str = "paused";
pub const ENGINE_ERROR: &str = "error";
pub const ENGINE_COMPLETE: &str = "complete";
pub const ENGINE_REMOVED: &str = "removed";

/// 引擎任务中的单个文件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineFile {
    pub path: String,
    #[serde(default, with = "string_u64")]
    pub length: u64,
    /// 引擎标记为 "true" 的文件才会被转存
    #[serde(default)]
    pub selected: String,
}

impl EngineFile {
    pub fn is_selected(&self) -> bool {
        self.selected == "true"
    }
}

/// 引擎任务状态快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    #[serde(default)]
    pub gid: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, with = "string_u64")]
    pub total_length: u64,
    #[serde(default, with = "string_u64")]
    pub completed_length: u64,
    #[serde(default, with = "string_u64")]
    pub download_speed: u64,
    /// 引擎把任务重定向到的新标识（如种子元数据下载完成后）
    #[serde(default)]
    pub followed_by: Vec<String>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub files: Vec<EngineFile>,
}

// aria2 的数值字段都是十进制字符串
mod string_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let s = String::deserialize(d)?;
        if s.is_empty() {
            return Ok(0);
        }
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 下载引擎抽象
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    /// 查询任务状态
    async fn status(&self, record: &DownloadRecord) -> Result<StatusInfo, DriverError>;

    /// 取消引擎侧任务
    async fn cancel(&self, record: &DownloadRecord) -> Result<(), DriverError>;

    /// 清理引擎产生的临时文件
    async fn delete_temp_files(&self, record: &DownloadRecord) -> Result<(), DriverError>;
}

/// aria2 JSON-RPC 客户端
pub struct Aria2Engine {
    http: reqwest::Client,
    server: String,
    token: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl Aria2Engine {
    pub fn new(options: &DownloaderOption) -> Self {
        let timeout = if options.timeout > 0 {
            options.timeout
        } else {
            10
        };
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout))
                .build()
                .unwrap_or_default(),
            server: options.server.trim_end_matches('/').to_string(),
            token: options.token.clone(),
        }
    }

    async fn call(
        &self,
        method: &str,
        mut params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, DriverError> {
        params.insert(0, json!(format!("token:{}", self.token)));
        debug!(%method, "调用下载引擎 RPC");
        let resp: RpcResponse = self
            .http
            .post(format!("{}/jsonrpc", self.server))
            .json(&json!({
                "jsonrpc": "2.0",
                "id": uuid::Uuid::new_v4().to_string(),
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .json()
            .await?;
        if let Some(err) = resp.error {
            return Err(DriverError::RemoteResponse {
                code: err.code,
                msg: err.message,
            });
        }
        Ok(resp.result)
    }
}

#[async_trait]
impl DownloadEngine for Aria2Engine {
    async fn status(&self, record: &DownloadRecord) -> Result<StatusInfo, DriverError> {
        let result = self
            .call("aria2.tellStatus", vec![json!(record.gid)])
            .await?;
        serde_json::from_value(result).map_err(|e| DriverError::RemoteResponse {
            code: -1,
            msg: format!("引擎状态解析失败: {}", e),
        })
    }

    async fn cancel(&self, record: &DownloadRecord) -> Result<(), DriverError> {
        self.call("aria2.forceRemove", vec![json!(record.gid)])
            .await?;
        Ok(())
    }

    async fn delete_temp_files(&self, record: &DownloadRecord) -> Result<(), DriverError> {
        // 先让引擎忘掉任务，再按最近一次快照清理落盘文件
        let _ = self
            .call("aria2.removeDownloadResult", vec![json!(record.gid)])
            .await;
        if let Ok(snapshot) = serde_json::from_str::<StatusInfo>(&record.attrs) {
            for file in &snapshot.files {
                let _ = tokio::fs::remove_file(&file.path).await;
            }
            if let Some(parent) = snapshot
                .files
                .first()
                .and_then(|f| std::path::Path::new(&f.path).parent())
            {
                let _ = tokio::fs::remove_dir(parent).await;
            }
        }
        Ok(())
    }
}

/// 按执行节点为下载记录选择引擎
pub fn engine_for_record(
    node_pool: &NodePool,
    record: &DownloadRecord,
) -> Option<Arc<dyn DownloadEngine>> {
    let node = node_pool.get_node_by_id(record.node_id_or_master())?;
    let options = node.downloader_options();
    Some(Arc::new(Aria2Engine::new(&options)))
}
