//! 后台任务
//!
//! 任务记录落库，参数以 JSON 存于 props 字段；执行单元实现
//! [`Job`]，由令牌池调度。主机重启后排队与执行中的任务会被
//! 原样重新提交（执行中任务视为可重跑）。

pub mod compress;
pub mod decompress;
pub mod import;
pub mod pool;
pub mod transfer;

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::NodePool;
use crate::driver::DriverEnv;
use crate::error::FsError;
use crate::filesystem::FsPool;
use crate::models::{Database, TaskRecord, TaskType};

pub use pool::TaskPool;

// ===== 任务进度阶段 =====
pub const PROGRESS_PENDING: i64 = 0;
pub const PROGRESS_COMPRESSING: i64 = 1;
pub const PROGRESS_DECOMPRESSING: i64 = 2;
pub const PROGRESS_TRANSFERRING: i64 = 3;

/// 任务执行单元
#[async_trait]
pub trait Job: Send + Sync {
    /// 关联的任务记录
    fn task_id(&self) -> i64;

    async fn run(&self) -> Result<(), FsError>;
}

/// 构建任务所需的共享依赖
#[derive(Clone)]
pub struct JobDeps {
    pub db: Arc<Database>,
    pub fs_pool: Arc<FsPool>,
    pub node_pool: Arc<NodePool>,
    pub env: DriverEnv,
}

/// 从任务记录还原执行单元
pub fn job_from_record(record: &TaskRecord, deps: &JobDeps) -> Result<Arc<dyn Job>, FsError> {
    Ok(match record.task_type {
        TaskType::Transfer => Arc::new(transfer::TransferTask::from_record(record, deps)?),
        TaskType::Compress => Arc::new(compress::CompressTask::from_record(record, deps)?),
        TaskType::Decompress => Arc::new(decompress::DecompressTask::from_record(record, deps)?),
        TaskType::Import => Arc::new(import::ImportTask::from_record(record, deps)?),
    })
}

fn parse_props<T: serde::de::DeserializeOwned>(record: &TaskRecord) -> Result<T, FsError> {
    serde_json::from_str(&record.props)
        .map_err(|e| FsError::Internal(format!("任务参数解析失败: {}", e)))
}

fn encode_props<T: serde::Serialize>(props: &T) -> Result<String, FsError> {
    serde_json::to_string(props).map_err(|e| FsError::Internal(format!("任务参数序列化失败: {}", e)))
}
