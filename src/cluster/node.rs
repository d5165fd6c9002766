//! 从机节点的在线状态封装
//!
//! 节点池内每个从机由一个 [`SlaveNode`] 包装，心跳循环独占驱动
//! Active/Suspend 迁移：连续失败达到阈值后标记离线并放慢探测
//! 节奏，恢复期内任意一次成功立即转回在线并恢复正常节奏。

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::driver::DriverEnv;
use crate::error::ClusterError;
use crate::models::{DownloaderOption, Node};
use crate::request::{RequestOpts, SignedClient};

/// 离线下载能力的功能标签
pub const FEATURE_OFFLINE_DOWNLOAD: &str = "aria2";

/// 主机向从机宣告自身的心跳载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    /// 主机外部地址，从机回调的目的地
    pub site_url: String,
    pub site_id: String,
    /// 从机回调主机时使用的签名密钥
    pub master_key: String,
    /// 是否要求从机重新注册（首次或主机重启后）
    pub do_register: bool,
}

/// 心跳状态机，只记录迁移判定所需的计数
pub(crate) struct PingTracker {
    retries: usize,
    failures: usize,
    recovering: bool,
}

impl PingTracker {
    pub(crate) fn new(retries: usize) -> Self {
        Self {
            retries,
            failures: 0,
            recovering: false,
        }
    }

    /// 记录一次失败；恰好跨过阈值时返回 true（Active → Suspend 一次）
    pub(crate) fn on_failure(&mut self) -> bool {
        if self.recovering {
            return false;
        }
        self.failures += 1;
        if self.failures >= self.retries {
            self.recovering = true;
            return true;
        }
        false
    }

    /// 记录一次成功；正处恢复期时返回 true（Suspend → Active）
    pub(crate) fn on_success(&mut self) -> bool {
        self.failures = 0;
        if self.recovering {
            self.recovering = false;
            return true;
        }
        false
    }

    pub(crate) fn recovering(&self) -> bool {
        self.recovering
    }
}

/// 节点池内的从机
pub struct SlaveNode {
    model: RwLock<Node>,
    client: SignedClient,
    online: AtomicBool,
    /// 心跳循环的停止信号
    pub(crate) cancel: CancellationToken,
}

impl SlaveNode {
    pub fn new(node: Node, env: &DriverEnv) -> Self {
        let endpoint = format!("{}/api/v3/slave", node.server.trim_end_matches('/'));
        let client = SignedClient::new(
            endpoint,
            node.slave_key.as_bytes().to_vec(),
            env.cluster.slave_api_timeout_secs,
            env.limiter.clone(),
        )
        .with_site_meta(env.site_url.clone(), env.site_id.clone())
        .with_node_id(node.id);

        Self {
            model: RwLock::new(node),
            client,
            online: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.model.read().id
    }

    pub fn name(&self) -> String {
        self.model.read().name.clone()
    }

    pub fn model(&self) -> Node {
        self.model.read().clone()
    }

    pub fn downloader_options(&self) -> DownloaderOption {
        self.model.read().downloader_options.clone()
    }

    pub fn is_active(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.online.store(active, Ordering::SeqCst);
    }

    /// 节点启用的功能标签
    pub fn features(&self) -> Vec<&'static str> {
        let mut features = Vec::new();
        if self.model.read().downloader_enabled {
            features.push(FEATURE_OFFLINE_DOWNLOAD);
        }
        features
    }

    pub fn is_feature_enabled(&self, feature: &str) -> bool {
        self.features().contains(&feature)
    }

    /// 发送一次签名心跳
    pub async fn ping(&self, req: &PingRequest) -> Result<(), ClusterError> {
        self.client
            .post_json("heartbeat", req, RequestOpts::default())
            .await
            .map_err(|e| ClusterError::Rpc(e.to_string()))?
            .into_result()
            .map_err(|e| ClusterError::Rpc(e.to_string()))?;
        Ok(())
    }

    /// 停止心跳循环（节点被移出池时调用）
    pub fn kill(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::driver::tests::test_env;
    use crate::models::{NodeStatus, NodeType};

    pub(crate) fn test_node(id: i64, downloader: bool) -> Node {
        Node {
            id,
            status: NodeStatus::Active,
            name: format!("slave-{}", id),
            node_type: NodeType::Slave,
            server: format!("http://10.0.0.{}:5212", id),
            slave_key: "sk".into(),
            master_key: "mk".into(),
            downloader_enabled: downloader,
            downloader_options: DownloaderOption::default(),
            rank: 0,
        }
    }

    #[test]
    fn test_features_follow_downloader_flag() {
        let env = test_env();
        let with = SlaveNode::new(test_node(1, true), &env);
        let without = SlaveNode::new(test_node(2, false), &env);
        assert!(with.is_feature_enabled(FEATURE_OFFLINE_DOWNLOAD));
        assert!(without.features().is_empty());
    }

    #[test]
    fn test_ping_tracker_transitions_once() {
        let mut tracker = PingTracker::new(3);

        // 连续失败：只有第 3 次触发迁移
        assert!(!tracker.on_failure());
        assert!(!tracker.on_failure());
        assert!(tracker.on_failure());
        assert!(tracker.recovering());
        // 恢复期内继续失败不再触发
        assert!(!tracker.on_failure());

        // 恢复期第一次成功立即转回在线
        assert!(tracker.on_success());
        assert!(!tracker.recovering());
        // 在线状态下成功不触发迁移
        assert!(!tracker.on_success());
    }

    #[test]
    fn test_failure_counter_resets_on_success() {
        let mut tracker = PingTracker::new(2);
        assert!(!tracker.on_failure());
        assert!(!tracker.on_success());
        // 计数已清零，需要重新累计
        assert!(!tracker.on_failure());
        assert!(tracker.on_failure());
    }
}
