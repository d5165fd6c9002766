//! 从机影子驱动
//!
//! 当中转任务需要在从机上执行时，用它包装原始驱动：Put 不再
//! 传输字节，而是向从机提交中转请求，让从机自行取源并写入，
//! 随后阻塞等待从机经消息总线回调结果。读类操作不适用于该场景。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::timeout;
use tracing::debug;

use super::{ContentResponse, Driver, DriverEnv, Object, UploadCredential, UploadSession};
use crate::error::DriverError;
use crate::fsctx::{FileStream, ReadSeek, UploadInfo};
use crate::models::{File, Node, Policy};
use crate::mq::{MessageBus, SLAVE_TRANSFER_SUCCESS};
use crate::request::{RequestOpts, SignedClient};

/// 提交给从机的中转请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    /// 从机本地的源文件路径
    pub src: String,
    /// 目标物理路径
    pub dst: String,
    pub policy: Policy,
}

impl TransferRequest {
    /// 去重标识，同一主机对同一 src/dst 的请求只执行一次；
    /// 同时用作回调消息的总线主题
    pub fn hash(&self, site_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(site_id.as_bytes());
        hasher.update(b":");
        hasher.update(self.src.as_bytes());
        hasher.update(b":");
        hasher.update(self.dst.as_bytes());
        format!("transfer_{}", hex::encode(&hasher.finalize()[..16]))
    }
}

/// 从机回调的中转结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferResult {
    #[serde(default)]
    pub error: String,
}

pub struct ShadowDriver {
    node: Node,
    inner: Box<dyn Driver>,
    policy: Policy,
    client: SignedClient,
    bus: Arc<MessageBus>,
    site_id: String,
    wait_timeout: Duration,
}

impl ShadowDriver {
    pub fn new(
        node: Node,
        inner: Box<dyn Driver>,
        policy: Policy,
        bus: Arc<MessageBus>,
        env: &DriverEnv,
    ) -> Self {
        let endpoint = format!("{}/api/v3/slave", node.server.trim_end_matches('/'));
        let client = SignedClient::new(
            endpoint,
            node.slave_key.as_bytes().to_vec(),
            env.cluster.slave_api_timeout_secs as i64,
            env.limiter.clone(),
        )
        .with_site_meta(env.site_url.clone(), env.site_id.clone());

        Self {
            node,
            inner,
            policy,
            client,
            bus,
            site_id: env.site_id.clone(),
            wait_timeout: Duration::from_secs(env.cluster.transfer_wait_timeout_secs),
        }
    }
}

#[async_trait]
impl Driver for ShadowDriver {
    async fn put(&self, file: &mut FileStream) -> Result<(), DriverError> {
        let info = file.info.clone();
        let req = TransferRequest {
            src: info.src.clone(),
            dst: info.save_path.clone(),
            policy: self.policy.clone(),
        };
        let topic = req.hash(&self.site_id);

        // 先订阅再提交，避免回调先于订阅到达
        let mut rx = self.bus.subscribe(&topic);

        debug!(node = self.node.id, src = %req.src, dst = %req.dst, "提交从机中转请求");
        self.client
            .post_json("task/transfer", &req, RequestOpts::default())
            .await?
            .into_result()?;

        match timeout(self.wait_timeout, rx.recv()).await {
            Err(_) => Err(DriverError::WaitResultTimeout),
            Ok(None) => Err(DriverError::SlaveFailure(
                "回调通道已关闭".to_string(),
            )),
            Ok(Some(msg)) => {
                if msg.event == SLAVE_TRANSFER_SUCCESS {
                    Ok(())
                } else {
                    let result: TransferResult =
                        serde_json::from_value(msg.content).unwrap_or_default();
                    Err(DriverError::SlaveFailure(result.error))
                }
            }
        }
    }

    async fn delete(&self, files: &[String]) -> Result<Vec<String>, DriverError> {
        self.inner.delete(files).await
    }

    async fn get(&self, _path: &str) -> Result<Box<dyn ReadSeek>, DriverError> {
        Err(DriverError::NotSupported)
    }

    async fn thumb(&self, _path: &str) -> Result<ContentResponse, DriverError> {
        Err(DriverError::NotSupported)
    }

    async fn source(
        &self,
        _file: &File,
        _base_url: &str,
        _ttl: i64,
        _is_download: bool,
    ) -> Result<String, DriverError> {
        Err(DriverError::NotSupported)
    }

    async fn token(
        &self,
        _session: &UploadSession,
        _info: &UploadInfo,
    ) -> Result<UploadCredential, DriverError> {
        Err(DriverError::NotSupported)
    }

    async fn cancel_token(&self, _session: &UploadSession) -> Result<(), DriverError> {
        Ok(())
    }

    async fn list(&self, _path: &str, _recursive: bool) -> Result<Vec<Object>, DriverError> {
        Err(DriverError::NotSupported)
    }
}
