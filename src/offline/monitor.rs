//! 下载任务监视器
//!
//! 每条活动下载记录一个监视器协程：在总线推送与定时器之间择一
//! 唤醒，每次唤醒只执行一次状态更新。终止与否由监视器自行决定
//! （重试耗尽或引擎报终态），外部不可取消。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{
    engine_for_record, DownloadEngine, StatusInfo, ENGINE_ACTIVE, ENGINE_COMPLETE, ENGINE_ERROR,
    ENGINE_PAUSED, ENGINE_REMOVED, ENGINE_WAITING,
};
use crate::cluster::NodePool;
use crate::error::FsError;
use crate::models::{DownloadRecord, DownloadStatus};
use crate::mq::{Message, MessageBus};
use crate::task::transfer::{TransferItem, TransferProps, TransferTask};
use crate::task::{Job, JobDeps, TaskPool};

/// 连续 RPC 失败超过该次数后放弃监视
pub const MAX_RETRY: usize = 10;

/// 监视器运行所需的共享依赖
#[derive(Clone)]
pub struct MonitorDeps {
    pub jobs: JobDeps,
    pub task_pool: Arc<TaskPool>,
    pub bus: Arc<MessageBus>,
}

pub struct Monitor {
    deps: MonitorDeps,
    engine: Arc<dyn DownloadEngine>,
    record: DownloadRecord,
    interval: Duration,
    notifier: mpsc::UnboundedReceiver<Message>,
    retries: usize,
}

impl Monitor {
    pub fn new(
        deps: MonitorDeps,
        engine: Arc<dyn DownloadEngine>,
        record: DownloadRecord,
        interval: Duration,
    ) -> Self {
        let notifier = deps.bus.subscribe(&record.gid);
        Self {
            deps,
            engine,
            record,
            interval,
            notifier,
            retries: 0,
        }
    }

    /// 启动监视协程
    pub fn spawn(
        deps: MonitorDeps,
        engine: Arc<dyn DownloadEngine>,
        record: DownloadRecord,
        interval: Duration,
    ) {
        let mut monitor = Self::new(deps, engine, record, interval);
        tokio::spawn(async move {
            // 首次快速唤醒，之后按配置间隔
            let mut next = Duration::from_millis(50);
            loop {
                tokio::select! {
                    _ = monitor.notifier.recv() => {}
                    _ = tokio::time::sleep(next) => {}
                }
                next = monitor.interval;
                if monitor.update().await {
                    break;
                }
            }
        });
    }

    /// 执行一次状态更新，返回 true 表示监视结束
    pub async fn update(&mut self) -> bool {
        let status = match self.engine.status(&self.record).await {
            Ok(status) => status,
            Err(e) => {
                self.retries += 1;
                warn!(gid = %self.record.gid, retries = self.retries, "查询下载状态失败: {}", e);
                if self.retries > MAX_RETRY {
                    self.record.error = format!("下载状态查询重试耗尽: {}", e);
                    self.record.status = DownloadStatus::Error;
                    self.persist();
                    self.cleanup().await;
                    return true;
                }
                return false;
            }
        };
        self.retries = 0;

        // 引擎把任务重定向到了新标识（种子元数据下载完成等）
        if let Some(new_gid) = status.followed_by.first() {
            info!(old = %self.record.gid, new = %new_gid, "下载任务被引擎重定向");
            self.record.gid = new_gid.clone();
            self.notifier = self.deps.bus.subscribe(&self.record.gid);
            self.persist();
            return false;
        }

        let previous_total = self.record.total_size;
        self.record.total_size = status.total_length;
        self.record.downloaded_size = status.completed_length;
        self.record.speed = status.download_speed as i64;
        self.record.attrs = serde_json::to_string(&status).unwrap_or_default();

        match status.status.as_str() {
            ENGINE_ACTIVE | ENGINE_WAITING | ENGINE_PAUSED => {
                self.record.status = match status.status.as_str() {
                    ENGINE_ACTIVE => DownloadStatus::Downloading,
                    ENGINE_WAITING => DownloadStatus::Ready,
                    _ => DownloadStatus::Paused,
                };
                if status.total_length > previous_total {
                    if let Err(e) = self.validate_quota(&status) {
                        warn!(gid = %self.record.gid, "容量不足，取消下载: {}", e);
                        if let Err(e) = self.engine.cancel(&self.record).await {
                            warn!(gid = %self.record.gid, "取消引擎任务失败: {}", e);
                        }
                        self.record.error = e.to_string();
                    }
                }
                self.persist();
                false
            }
            ENGINE_COMPLETE => {
                if let Err(e) = self.submit_transfer(&status).await {
                    warn!(gid = %self.record.gid, "派生中转任务失败: {}", e);
                    self.record.error = e.to_string();
                    self.record.status = DownloadStatus::Error;
                } else {
                    self.record.status = DownloadStatus::Complete;
                }
                self.persist();
                true
            }
            ENGINE_ERROR => {
                self.record.error = status.error_message.clone();
                self.record.status = DownloadStatus::Error;
                self.persist();
                self.cleanup().await;
                true
            }
            ENGINE_REMOVED => {
                self.record.status = DownloadStatus::Canceled;
                self.persist();
                self.cleanup().await;
                true
            }
            other => {
                warn!(gid = %self.record.gid, status = %other, "未知的引擎状态");
                self.record.status = DownloadStatus::Unknown;
                self.persist();
                false
            }
        }
    }

    /// 总大小增长时按选中文件重新校验配额
    fn validate_quota(&self, status: &StatusInfo) -> Result<(), FsError> {
        let selected: u64 = status
            .files
            .iter()
            .filter(|f| f.is_selected())
            .map(|f| f.length)
            .sum();
        let user = self.deps.jobs.db.get_user_by_id(self.record.user_id)?;
        if user.remaining_capacity() < selected {
            return Err(FsError::InsufficientCapacity);
        }
        Ok(())
    }

    /// 下载完成：把选中的文件打成一个中转任务交给任务池
    async fn submit_transfer(&mut self, status: &StatusInfo) -> Result<(), FsError> {
        let items: Vec<TransferItem> = status
            .files
            .iter()
            .filter(|f| f.is_selected())
            .map(|f| TransferItem {
                path: f.path.clone(),
                size: f.length,
                name: std::path::Path::new(&f.path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| f.path.clone()),
            })
            .collect();

        let task = TransferTask::create(
            &self.deps.jobs,
            TransferProps {
                user_id: self.record.user_id,
                items,
                dst: self.record.dst.clone(),
                node_id: self.record.node_id,
            },
        )?;
        let task_id = task.task_id();
        self.deps.task_pool.submit(Arc::new(task)).await;
        self.record.task_id = Some(task_id);
        info!(gid = %self.record.gid, task = task_id, "下载完成，中转任务已提交");
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.deps.jobs.db.save_download(&self.record) {
            warn!(gid = %self.record.gid, "持久化下载记录失败: {}", e);
        }
    }

    async fn cleanup(&self) {
        if let Err(e) = self.engine.delete_temp_files(&self.record).await {
            warn!(gid = %self.record.gid, "清理下载临时文件失败: {}", e);
        }
    }
}

/// 主机启动时为未完结的下载记录重建监视器
pub fn resume_monitors(deps: &MonitorDeps, node_pool: &NodePool) -> Result<usize, FsError> {
    let records = deps.jobs.db.get_downloads_by_status(&[
        DownloadStatus::Ready,
        DownloadStatus::Downloading,
        DownloadStatus::Paused,
        DownloadStatus::Unknown,
    ])?;
    let mut count = 0;
    for record in records {
        let Some(engine) = engine_for_record(node_pool, &record) else {
            warn!(gid = %record.gid, node = record.node_id, "下载节点不可用，跳过监视");
            continue;
        };
        let interval = interval_for(deps, node_pool, &record);
        Monitor::spawn(deps.clone(), engine, record, interval);
        count += 1;
    }
    if count > 0 {
        info!(count, "下载监视器已恢复");
    }
    Ok(count)
}

/// 轮询间隔：节点配置优先，未配置用全局默认
pub fn interval_for(deps: &MonitorDeps, node_pool: &NodePool, record: &DownloadRecord) -> Duration {
    let node_interval = node_pool
        .get_node_by_id(record.node_id_or_master())
        .map(|n| n.downloader_options().interval)
        .unwrap_or(0);
    if node_interval > 0 {
        Duration::from_secs(node_interval)
    } else {
        Duration::from_secs(deps.jobs.env.cluster.offline_poll_interval_secs)
    }
}
