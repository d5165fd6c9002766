//! 从机侧集群控制器
//!
//! 从机可同时服务多个主机：心跳到达时登记主机记录，中转任务
//! 按内容哈希去重（同一请求重试不会重复入队），执行完成后把
//! 结果以签名通知回调给对应主机。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use super::node::PingRequest;
use crate::driver::shadow::{TransferRequest, TransferResult};
use crate::driver::{build_driver, DriverEnv};
use crate::error::{ClusterError, FsError};
use crate::fsctx::{FileStream, UploadInfo, WriteMode};
use crate::mq::{Message, SLAVE_TRANSFER_FAILED, SLAVE_TRANSFER_SUCCESS};
use crate::request::{RequestOpts, SignedClient};

/// 已登记的主机
struct MasterRecord {
    url: String,
    client: SignedClient,
}

/// 从机控制器
pub struct SlaveController {
    env: DriverEnv,
    /// site_id → 主机记录
    masters: RwLock<HashMap<String, MasterRecord>>,
    /// 已受理的中转任务哈希
    jobs: Mutex<HashSet<String>>,
}

impl SlaveController {
    pub fn new(env: DriverEnv) -> Arc<Self> {
        Arc::new(Self {
            env,
            masters: RwLock::new(HashMap::new()),
            jobs: Mutex::new(HashSet::new()),
        })
    }

    /// 处理主机心跳：登记或刷新主机记录
    pub fn handle_heartbeat(&self, req: &PingRequest) {
        let mut masters = self.masters.write();
        if req.do_register || !masters.contains_key(&req.site_id) {
            let endpoint = format!("{}/api/v3/slave", req.site_url.trim_end_matches('/'));
            let client = SignedClient::new(
                endpoint,
                req.master_key.as_bytes().to_vec(),
                self.env.cluster.slave_api_timeout_secs,
                self.env.limiter.clone(),
            );
            info!(master = %req.site_id, url = %req.site_url, "主机已登记");
            masters.insert(
                req.site_id.clone(),
                MasterRecord {
                    url: req.site_url.clone(),
                    client,
                },
            );
        }
    }

    pub fn master_url(&self, site_id: &str) -> Result<String, ClusterError> {
        self.masters
            .read()
            .get(site_id)
            .map(|m| m.url.clone())
            .ok_or_else(|| ClusterError::MasterNotFound(site_id.to_string()))
    }

    /// 受理中转任务
    ///
    /// 返回 false 表示同一内容哈希已受理过（重试请求不重复执行）。
    /// 实际传输在后台执行，结果经签名通知回调主机。
    pub fn submit_transfer(
        self: &Arc<Self>,
        master_id: &str,
        req: TransferRequest,
    ) -> Result<bool, ClusterError> {
        if !self.masters.read().contains_key(master_id) {
            return Err(ClusterError::MasterNotFound(master_id.to_string()));
        }
        let topic = req.hash(master_id);
        if !self.jobs.lock().insert(topic.clone()) {
            info!(%topic, "重复的中转请求，忽略");
            return Ok(false);
        }

        let controller = self.clone();
        let master_id = master_id.to_string();
        tokio::spawn(async move {
            let result = controller.execute_transfer(&req).await;
            let (event, payload) = match result {
                Ok(()) => (SLAVE_TRANSFER_SUCCESS, TransferResult::default()),
                Err(e) => {
                    warn!(src = %req.src, "中转任务失败: {}", e);
                    (
                        SLAVE_TRANSFER_FAILED,
                        TransferResult {
                            error: e.to_string(),
                        },
                    )
                }
            };
            let msg = Message::new(event, serde_json::to_value(&payload).unwrap_or_default());
            if let Err(e) = controller.send_notification(&master_id, &topic, &msg).await {
                warn!(%topic, "回调主机失败: {}", e);
            }
        });
        Ok(true)
    }

    /// 从机本地执行中转：按请求附带的策略写入目标存储端
    async fn execute_transfer(&self, req: &TransferRequest) -> Result<(), FsError> {
        let driver = build_driver(&req.policy, &self.env)?;
        let info = UploadInfo {
            size: std::fs::metadata(&req.src)
                .map_err(|e| FsError::Driver(e.into()))?
                .len(),
            save_path: req.dst.clone(),
            mode: WriteMode::OVERWRITE,
            src: req.src.clone(),
            ..Default::default()
        };
        let mut stream = FileStream::from_path(std::path::Path::new(&req.src), info)
            .map_err(|e| FsError::Driver(e.into()))?;
        driver.put(&mut stream).await?;
        Ok(())
    }

    /// 向主机发送签名通知
    pub async fn send_notification(
        &self,
        master_id: &str,
        topic: &str,
        msg: &Message,
    ) -> Result<(), ClusterError> {
        let client = {
            let masters = self.masters.read();
            masters
                .get(master_id)
                .map(|m| m.client.clone())
                .ok_or_else(|| ClusterError::MasterNotFound(master_id.to_string()))?
        };
        client
            .post_json(&format!("notification/{}", topic), msg, RequestOpts::default())
            .await
            .map_err(|e| ClusterError::Rpc(e.to_string()))?
            .into_result()
            .map_err(|e| ClusterError::Rpc(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::test_env;
    use crate::models::{Policy, PolicyOption, PolicyType};

    fn ping() -> PingRequest {
        PingRequest {
            site_url: "http://127.0.0.1:1".into(),
            site_id: "master-1".into(),
            master_key: "mk".into(),
            do_register: true,
        }
    }

    fn transfer_req() -> TransferRequest {
        TransferRequest {
            src: "/nonexistent/src.bin".into(),
            dst: "uploads/dst.bin".into(),
            policy: Policy {
                id: 1,
                name: "mock".into(),
                policy_type: PolicyType::Mock,
                server: String::new(),
                access_key: String::new(),
                secret_key: String::new(),
                max_size: 0,
                auto_rename: false,
                dir_name_rule: String::new(),
                file_name_rule: String::new(),
                base_url: String::new(),
                options: PolicyOption::default(),
            },
        }
    }

    #[test]
    fn test_heartbeat_registers_master() {
        let controller = SlaveController::new(test_env());
        assert!(matches!(
            controller.master_url("master-1"),
            Err(ClusterError::MasterNotFound(_))
        ));
        controller.handle_heartbeat(&ping());
        assert_eq!(controller.master_url("master-1").unwrap(), "http://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_submit_transfer_deduplicates() {
        let controller = SlaveController::new(test_env());
        controller.handle_heartbeat(&ping());

        assert!(controller.submit_transfer("master-1", transfer_req()).unwrap());
        // 同一请求重试：不重复入队
        assert!(!controller.submit_transfer("master-1", transfer_req()).unwrap());
        // 未登记的主机直接拒绝
        assert!(matches!(
            controller.submit_transfer("ghost", transfer_req()),
            Err(ClusterError::MasterNotFound(_))
        ));
    }
}
