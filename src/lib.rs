//! 多存储端网盘服务核心
//!
//! 提供分片上传会话、存储策略驱动、主从节点池、离线下载监视与
//! 后台任务调度。对外暴露 [`app::AppContext`] 作为装配入口。

pub mod app;
pub mod auth;
pub mod cache;
pub mod chunk;
pub mod cluster;
pub mod config;
pub mod driver;
pub mod error;
pub mod filesystem;
pub mod fsctx;
pub mod logging;
pub mod models;
pub mod mq;
pub mod offline;
pub mod request;
pub mod task;

pub use app::AppContext;
pub use config::AppConfig;
pub use error::{ClusterError, DriverError, FsError};
