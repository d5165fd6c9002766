//! 解压缩任务

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{encode_props, parse_props, Job, JobDeps, PROGRESS_DECOMPRESSING};
use crate::error::FsError;
use crate::models::{TaskRecord, TaskType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompressProps {
    pub user_id: i64,
    /// 待解压的压缩包文件
    pub src_file_id: i64,
    /// 解压目标虚拟目录
    pub dst: String,
}

pub struct DecompressTask {
    record_id: i64,
    props: DecompressProps,
    deps: JobDeps,
}

impl DecompressTask {
    pub fn create(deps: &JobDeps, props: DecompressProps) -> Result<Self, FsError> {
        let record_id =
            deps.db
                .create_task(TaskType::Decompress, props.user_id, &encode_props(&props)?)?;
        Ok(Self {
            record_id,
            props,
            deps: deps.clone(),
        })
    }

    pub fn from_record(record: &TaskRecord, deps: &JobDeps) -> Result<Self, FsError> {
        Ok(Self {
            record_id: record.id,
            props: parse_props(record)?,
            deps: deps.clone(),
        })
    }
}

#[async_trait]
impl Job for DecompressTask {
    fn task_id(&self) -> i64 {
        self.record_id
    }

    async fn run(&self) -> Result<(), FsError> {
        self.deps
            .db
            .set_task_progress(self.record_id, PROGRESS_DECOMPRESSING)?;

        let mut fs = self.deps.fs_pool.checkout(self.props.user_id)?;
        let cancel = CancellationToken::new();
        let result = fs
            .decompress(
                &self.deps.fs_pool,
                &cancel,
                self.props.src_file_id,
                &self.props.dst,
            )
            .await;
        self.deps.fs_pool.recycle(fs).await;
        result
    }
}
