//! 打包压缩任务

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{
    encode_props, parse_props, Job, JobDeps, PROGRESS_COMPRESSING, PROGRESS_TRANSFERRING,
};
use crate::error::FsError;
use crate::fsctx::UploadInfo;
use crate::models::{rand_string, TaskRecord, TaskType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressProps {
    pub user_id: i64,
    #[serde(default)]
    pub src_folders: Vec<i64>,
    #[serde(default)]
    pub src_files: Vec<i64>,
    /// 压缩包存放的虚拟目录
    pub dst: String,
    /// 压缩包文件名
    pub file_name: String,
}

pub struct CompressTask {
    record_id: i64,
    props: CompressProps,
    deps: JobDeps,
}

impl CompressTask {
    pub fn create(deps: &JobDeps, props: CompressProps) -> Result<Self, FsError> {
        let record_id =
            deps.db
                .create_task(TaskType::Compress, props.user_id, &encode_props(&props)?)?;
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
impl Job for CompressTask {
    fn task_id(&self) -> i64 {
        self.record_id
    }

    async fn run(&self) -> Result<(), FsError> {
        self.deps
            .db
            .set_task_progress(self.record_id, PROGRESS_COMPRESSING)?;

        let temp_dir = self.deps.env.upload.temp_path.clone();
        std::fs::create_dir_all(&temp_dir).map_err(|e| FsError::Driver(e.into()))?;
        let zip_path = temp_dir.join(format!("compress_{}.zip", rand_string(16)));

        let mut fs = self.deps.fs_pool.checkout(self.props.user_id)?;
        let cancel = CancellationToken::new();
        let result = async {
            let size = fs
                .compress(&cancel, &self.props.src_folders, &self.props.src_files, &zip_path)
                .await?;

            self.deps
                .db
                .set_task_progress(self.record_id, PROGRESS_TRANSFERRING)?;

            let info = UploadInfo {
                size,
                file_name: self.props.file_name.clone(),
                virtual_path: self.props.dst.clone(),
                ..Default::default()
            };
            fs.upload_from_path(&cancel, &zip_path, info).await?;
            Ok(())
        }
        .await;

        let _ = std::fs::remove_file(&zip_path);
        self.deps.fs_pool.recycle(fs).await;
        result
    }
}
