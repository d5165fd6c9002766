//! 应用上下文
//!
//! 所有共享组件在启动时构建一次并显式注入，不使用全局单例。
//! 主机角色额外负责节点池初始化、任务恢复和会话清扫；从机角色
//! 只保留执行中转任务所需的控制器。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cache::{CacheStore, UPLOAD_SESSION_PREFIX};
use crate::cluster::{NodePool, SlaveController};
use crate::config::{AppConfig, NodeRole};
use crate::driver::DriverEnv;
use crate::filesystem::FsPool;
use crate::models::{rand_string, Database, DownloadStatus};
use crate::mq::{Message, MessageBus};
use crate::offline::monitor::{interval_for, resume_monitors, Monitor, MonitorDeps};
use crate::offline::{engine_for_record, DownloadEngine};
use crate::request::TpsLimiter;
use crate::task::{JobDeps, TaskPool};

/// 孤儿会话清扫间隔（秒）
const SESSION_SWEEP_INTERVAL_SECS: u64 = 60;

pub struct AppContext {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub cache: Arc<CacheStore>,
    pub bus: Arc<MessageBus>,
    pub limiter: Arc<TpsLimiter>,
    pub env: DriverEnv,
    pub fs_pool: Arc<FsPool>,
    pub node_pool: Arc<NodePool>,
    pub task_pool: Arc<TaskPool>,
    /// 从机角色才有的控制器
    pub slave: Option<Arc<SlaveController>>,
}

impl AppContext {
    pub fn build(mut config: AppConfig) -> Result<Self> {
        // 首次启动补齐站点标识与密钥
        if config.site.id.is_empty() {
            config.site.id = rand_string(12);
        }
        if config.site.secret.is_empty() {
            config.site.secret = rand_string(32);
        }

        let db = Arc::new(
            Database::open(&config.db_path)
                .with_context(|| format!("打开数据库失败: {}", config.db_path.display()))?,
        );
        let cache = Arc::new(CacheStore::new());
        let bus = Arc::new(MessageBus::new());
        let limiter = Arc::new(TpsLimiter::new());

        let env = DriverEnv {
            cache: cache.clone(),
            limiter: limiter.clone(),
            upload: config.upload.clone(),
            cluster: config.cluster.clone(),
            site_url: config.site.url.clone(),
            site_id: config.site.id.clone(),
            site_secret: config.site.secret.clone(),
        };

        let fs_pool = Arc::new(FsPool::new(db.clone(), env.clone(), bus.clone()));
        let node_pool = NodePool::new(db.clone(), env.clone());
        let task_pool = TaskPool::new(db.clone());
        let slave = match config.site.role {
            NodeRole::Slave => Some(SlaveController::new(env.clone())),
            NodeRole::Master => None,
        };

        Ok(Self {
            config,
            db,
            cache,
            bus,
            limiter,
            env,
            fs_pool,
            node_pool,
            task_pool,
            slave,
        })
    }

    pub fn job_deps(&self) -> JobDeps {
        JobDeps {
            db: self.db.clone(),
            fs_pool: self.fs_pool.clone(),
            node_pool: self.node_pool.clone(),
            env: self.env.clone(),
        }
    }

    pub fn monitor_deps(&self) -> MonitorDeps {
        MonitorDeps {
            jobs: self.job_deps(),
            task_pool: self.task_pool.clone(),
            bus: self.bus.clone(),
        }
    }

    /// 启动常驻组件
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.task_pool.add(self.config.task.max_worker_num);

        if self.config.site.role == NodeRole::Master {
            self.node_pool.initialize()?;
            let resumed = self.task_pool.resume(&self.job_deps()).await?;
            info!(resumed, "主机任务队列已就绪");
            resume_monitors(&self.monitor_deps(), &self.node_pool)?;
        }

        self.spawn_session_sweeper();
        info!(role = ?self.config.site.role, site = %self.config.site.id, "应用上下文已启动");
        Ok(())
    }

    /// 为新建的下载记录挂一个监视器
    pub fn watch_download(&self, record: crate::models::DownloadRecord) -> bool {
        let Some(engine) = engine_for_record(&self.node_pool, &record) else {
            warn!(gid = %record.gid, node = record.node_id, "下载节点不可用");
            return false;
        };
        self.watch_download_with(engine, record);
        true
    }

    pub fn watch_download_with(
        &self,
        engine: Arc<dyn DownloadEngine>,
        record: crate::models::DownloadRecord,
    ) {
        let deps = self.monitor_deps();
        let interval = interval_for(&deps, &self.node_pool, &record);
        Monitor::spawn(deps, engine, record, interval);
    }

    /// 从机回调的通知经总线转发给等待方（影子驱动、下载监视器）
    pub fn handle_slave_notification(&self, topic: &str, msg: Message) -> usize {
        let delivered = self.bus.publish(topic, msg);
        if delivered == 0 {
            warn!(%topic, "通知没有订阅者");
        }
        delivered
    }

    /// 周期性清扫过期上传会话的占位文件
    fn spawn_session_sweeper(self: &Arc<Self>) {
        let ctx = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS)).await;
                ctx.sweep_expired_sessions().await;
            }
        });
    }

    async fn sweep_expired_sessions(&self) {
        for key in self.cache.collect_expired() {
            let Some(session_key) = key.strip_prefix(UPLOAD_SESSION_PREFIX) else {
                continue;
            };
            match self.db.get_file_by_upload_session(session_key) {
                Ok(Some(file)) if file.is_placeholder() => {
                    info!(session = %session_key, name = %file.name, "清理过期上传会话");
                    match self.fs_pool.checkout(file.user_id) {
                        Ok(fs) => {
                            if let Err(e) = fs.delete_files(&[file.id]).await {
                                warn!(session = %session_key, "清理占位文件失败: {}", e);
                            }
                            self.fs_pool.recycle(fs).await;
                        }
                        Err(e) => warn!(session = %session_key, "借出文件系统失败: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(session = %session_key, "查询会话占位文件失败: {}", e),
            }
        }
    }

    /// 历史下载记录里仍在进行中的数量，启动日志用
    pub fn pending_download_count(&self) -> usize {
        self.db
            .get_downloads_by_status(&[DownloadStatus::Ready, DownloadStatus::Downloading])
            .map(|r| r.len())
            .unwrap_or(0)
    }
}
