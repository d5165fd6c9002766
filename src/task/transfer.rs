//! 中转任务
//!
//! 把本机临时文件转存到目标存储策略。目标节点是从机时切换为
//! 影子驱动，由从机自取源文件执行写入；主机本地则直接读盘上传。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{encode_props, parse_props, Job, JobDeps, PROGRESS_TRANSFERRING};
use crate::error::FsError;
use crate::fsctx::{FileStream, UploadInfo, WriteMode};
use crate::models::{NodeType, TaskRecord, TaskType};

/// 待中转的单个文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
    /// 源物理路径（从机执行时为从机本地路径）
    pub path: String,
    /// 声明大小，入库与配额按它计
    pub size: u64,
    /// 目标文件名
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProps {
    pub user_id: i64,
    pub items: Vec<TransferItem>,
    /// 目标虚拟目录
    pub dst: String,
    /// 执行写入的节点，0 表示主机本地
    #[serde(default)]
    pub node_id: i64,
}

pub struct TransferTask {
    record_id: i64,
    props: TransferProps,
    deps: JobDeps,
}

impl TransferTask {
    /// 落库新任务记录并返回执行单元
    pub fn create(deps: &JobDeps, props: TransferProps) -> Result<Self, FsError> {
        let record_id =
            deps.db
                .create_task(TaskType::Transfer, props.user_id, &encode_props(&props)?)?;
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
impl Job for TransferTask {
    fn task_id(&self) -> i64 {
        self.record_id
    }

    async fn run(&self) -> Result<(), FsError> {
        self.deps
            .db
            .set_task_progress(self.record_id, PROGRESS_TRANSFERRING)?;

        let mut fs = self.deps.fs_pool.checkout(self.props.user_id)?;
        let shadow_node = if self.props.node_id > 0 {
            self.deps
                .node_pool
                .get_node_by_id(self.props.node_id)
                .filter(|n| n.model().node_type == NodeType::Slave)
        } else {
            None
        };
        let on_slave = shadow_node.is_some();
        if let Some(node) = shadow_node {
            fs.switch_to_shadow(node.model())?;
        }

        let cancel = CancellationToken::new();
        let total = self.props.items.len();
        let mut failed = 0;
        for item in &self.props.items {
            let result = if on_slave {
                // 源文件在从机上，空流只携带元信息
                let info = UploadInfo {
                    size: item.size,
                    file_name: item.name.clone(),
                    virtual_path: self.props.dst.clone(),
                    mode: WriteMode::OVERWRITE,
                    src: item.path.clone(),
                    ..Default::default()
                };
                fs.upload_from_stream(&cancel, FileStream::empty(info)).await
            } else {
                let info = UploadInfo {
                    size: item.size,
                    file_name: item.name.clone(),
                    virtual_path: self.props.dst.clone(),
                    ..Default::default()
                };
                fs.upload_from_path(&cancel, std::path::Path::new(&item.path), info)
                    .await
            };

            match result {
                Ok(_) => {
                    // 主机本地的临时源转存完即清理
                    if !on_slave {
                        let _ = std::fs::remove_file(&item.path);
                    }
                }
                Err(e) => {
                    warn!(name = %item.name, "中转文件失败: {}", e);
                    failed += 1;
                }
            }
        }
        self.deps.fs_pool.recycle(fs).await;

        if failed > 0 {
            return Err(FsError::NotFullySuccess { failed, total });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodePool;
    use crate::filesystem::tests::test_fixture;
    use crate::models::TaskStatus;

    fn deps_fixture() -> (tempfile::TempDir, JobDeps, i64) {
        let (dir, db, pool, uid) = test_fixture();
        let env = pool.env().clone();
        let node_pool = NodePool::new(db.clone(), env.clone());
        let deps = JobDeps {
            db,
            fs_pool: std::sync::Arc::new(pool),
            node_pool,
            env,
        };
        (dir, deps, uid)
    }

    #[tokio::test]
    async fn test_local_transfer_uploads_and_cleans_source() {
        let (dir, deps, uid) = deps_fixture();

        let src = dir.path().join("temp_item.bin");
        std::fs::write(&src, b"transfer-me").unwrap();

        let task = TransferTask::create(
            &deps,
            TransferProps {
                user_id: uid,
                items: vec![TransferItem {
                    path: src.to_string_lossy().to_string(),
                    size: 11,
                    name: "moved.bin".into(),
                }],
                dst: "/downloads".into(),
                node_id: 0,
            },
        )
        .unwrap();

        task.run().await.unwrap();

        assert!(!src.exists());
        assert_eq!(deps.db.get_user_by_id(uid).unwrap().storage, 11);
        let record = deps.db.get_task_by_id(task.task_id()).unwrap();
        assert_eq!(record.progress, PROGRESS_TRANSFERRING);
        // 状态由任务池收尾，这里仍是 Queued
        assert_eq!(record.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_missing_source_reports_partial_failure() {
        let (_dir, deps, uid) = deps_fixture();

        let task = TransferTask::create(
            &deps,
            TransferProps {
                user_id: uid,
                items: vec![TransferItem {
                    path: "/nonexistent/a.bin".into(),
                    size: 4,
                    name: "a.bin".into(),
                }],
                dst: "/".into(),
                node_id: 0,
            },
        )
        .unwrap();

        assert!(matches!(
            task.run().await,
            Err(FsError::NotFullySuccess { failed: 1, total: 1 })
        ));
    }
}
