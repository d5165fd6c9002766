//! 任务令牌池
//!
//! 令牌信道实现的固定容量工作池：add(n) 投放 n 枚令牌，submit
//! 异步等待令牌后在独立协程内执行任务，结束后归还令牌。任务
//! panic 被捕获并转为 Error 状态，不会拖垮工作协程。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::{job_from_record, Job, JobDeps};
use crate::error::FsError;
use crate::models::{Database, TaskStatus};

pub struct TaskPool {
    db: Arc<Database>,
    tokens_tx: mpsc::UnboundedSender<()>,
    tokens_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
}

impl TaskPool {
    pub fn new(db: Arc<Database>) -> Arc<Self> {
        let (tokens_tx, tokens_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            db,
            tokens_tx,
            tokens_rx: tokio::sync::Mutex::new(tokens_rx),
        })
    }

    /// 投放 n 枚工作令牌
    pub fn add(&self, n: usize) {
        for _ in 0..n {
            let _ = self.tokens_tx.send(());
        }
        info!(workers = n, "任务池令牌已投放");
    }

    /// 提交任务：等到空闲令牌后在后台执行
    pub async fn submit(self: &Arc<Self>, job: Arc<dyn Job>) {
        {
            // 发送端始终存活，recv 只会在拿到令牌后返回
            let mut rx = self.tokens_rx.lock().await;
            let _ = rx.recv().await;
        }

        let task_id = job.task_id();
        if let Err(e) = self.db.set_task_status(task_id, TaskStatus::Processing) {
            warn!(task = task_id, "更新任务状态失败: {}", e);
        }

        let pool = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(job.run()).catch_unwind().await;
            let persisted = match outcome {
                Ok(Ok(())) => {
                    info!(task = task_id, "任务执行完成");
                    pool.db.set_task_status(task_id, TaskStatus::Complete)
                }
                Ok(Err(e)) => {
                    warn!(task = task_id, "任务执行失败: {}", e);
                    pool.db.set_task_error(task_id, &e.to_string())
                }
                Err(panic) => {
                    let msg = panic_message(panic);
                    error!(task = task_id, "任务执行时发生严重错误: {}", msg);
                    pool.db.set_task_error(task_id, &msg)
                }
            };
            if let Err(e) = persisted {
                warn!(task = task_id, "持久化任务结果失败: {}", e);
            }
            let _ = pool.tokens_tx.send(());
        });
    }

    /// 主机启动时重新提交排队与执行中的任务
    pub async fn resume(self: &Arc<Self>, deps: &JobDeps) -> Result<usize, FsError> {
        let tasks = self
            .db
            .get_tasks_by_status(&[TaskStatus::Queued, TaskStatus::Processing])?;
        let count = tasks.len();
        for record in tasks {
            match job_from_record(&record, deps) {
                Ok(job) => self.submit(job).await,
                Err(e) => {
                    warn!(task = record.id, "任务无法还原: {}", e);
                    let _ = self.db.set_task_error(record.id, &e.to_string());
                }
            }
        }
        if count > 0 {
            info!(count, "未完成任务已重新提交");
        }
        Ok(count)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "任务执行时发生未知严重错误".to_string()
    }
}
