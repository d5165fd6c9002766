//! 集群节点池
//!
//! 主机侧维护全部节点的在线视图：每个从机一条心跳循环独占驱动
//! 状态迁移，状态变化时重建功能索引并持久化到数据库，负载均衡
//! 只在活跃节点上轮转。主机类型节点不参与心跳，始终视为在线。

pub mod controller;
pub mod node;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::driver::DriverEnv;
use crate::error::{ClusterError, FsError};
use crate::models::{Database, Node, NodeStatus, NodeType};

pub use controller::SlaveController;
pub use node::{PingRequest, SlaveNode, FEATURE_OFFLINE_DOWNLOAD};

/// 节点池
pub struct NodePool {
    db: Arc<Database>,
    env: DriverEnv,
    /// 回调从机时下发的签名密钥来自各节点记录
    nodes: RwLock<HashMap<i64, Arc<SlaveNode>>>,
    feature_map: RwLock<HashMap<&'static str, Vec<Arc<SlaveNode>>>>,
    round_robin: AtomicUsize,
}

impl NodePool {
    pub fn new(db: Arc<Database>, env: DriverEnv) -> Arc<Self> {
        Arc::new(Self {
            db,
            env,
            nodes: RwLock::new(HashMap::new()),
            feature_map: RwLock::new(HashMap::new()),
            round_robin: AtomicUsize::new(0),
        })
    }

    /// 从数据库装载全部节点并启动从机心跳
    pub fn initialize(self: &Arc<Self>) -> Result<(), FsError> {
        let mut all = self.db.get_nodes_by_status(NodeStatus::Active)?;
        all.extend(self.db.get_nodes_by_status(NodeStatus::Suspend)?);
        let count = all.len();
        for node in all {
            self.add(node);
        }
        info!(count, "节点池初始化完成");
        Ok(())
    }

    /// 注册节点并为从机启动心跳循环
    pub fn add(self: &Arc<Self>, node: Node) {
        let is_slave = node.node_type == NodeType::Slave;
        let wrapper = self.register(node);
        if is_slave {
            self.spawn_heartbeat(wrapper);
        }
    }

    /// 仅登记节点与功能索引，不触碰网络
    fn register(&self, node: Node) -> Arc<SlaveNode> {
        let wrapper = Arc::new(SlaveNode::new(node.clone(), &self.env));
        wrapper.set_active(node.status == NodeStatus::Active);
        self.nodes.write().insert(node.id, wrapper.clone());
        self.rebuild_feature_map();
        wrapper
    }

    /// 移除节点，停止其心跳循环
    pub fn delete(&self, id: i64) {
        if let Some(node) = self.nodes.write().remove(&id) {
            node.kill();
            info!(node = id, "节点已移出节点池");
        }
        self.rebuild_feature_map();
    }

    pub fn get_node_by_id(&self, id: i64) -> Option<Arc<SlaveNode>> {
        self.nodes.read().get(&id).cloned()
    }

    /// 在启用指定功能的活跃节点上轮转
    pub fn balance_node_by_feature(
        &self,
        feature: &str,
    ) -> Result<Arc<SlaveNode>, ClusterError> {
        let map = self.feature_map.read();
        let Some(candidates) = map.get(feature) else {
            return Err(ClusterError::FeatureNotExist(feature.to_string()));
        };
        if candidates.is_empty() {
            return Err(ClusterError::NoNodesAvailable);
        }
        let index = self.round_robin.fetch_add(1, Ordering::SeqCst) % candidates.len();
        Ok(candidates[index].clone())
    }

    /// 更新节点在线状态：迁移在线视图、重建功能索引并落库
    pub fn set_node_status(&self, id: i64, active: bool) -> Result<(), FsError> {
        let Some(node) = self.get_node_by_id(id) else {
            return Ok(());
        };
        node.set_active(active);
        self.rebuild_feature_map();

        let status = if active {
            NodeStatus::Active
        } else {
            NodeStatus::Suspend
        };
        self.db.set_node_status(id, status)?;
        info!(node = id, ?status, "节点状态已变更");
        Ok(())
    }

    /// 重建功能索引，仅收录活跃节点，按 rank 排序
    fn rebuild_feature_map(&self) {
        let nodes = self.nodes.read();
        let mut map: HashMap<&'static str, Vec<Arc<SlaveNode>>> = HashMap::new();
        map.insert(FEATURE_OFFLINE_DOWNLOAD, Vec::new());

        let mut active: Vec<&Arc<SlaveNode>> =
            nodes.values().filter(|n| n.is_active()).collect();
        active.sort_by_key(|n| (n.model().rank, n.id()));

        for node in active {
            for feature in node.features() {
                map.entry(feature).or_default().push(node.clone());
            }
        }
        *self.feature_map.write() = map;
    }

    /// 从机心跳循环：状态迁移唯一的驱动者
    fn spawn_heartbeat(self: &Arc<Self>, node: Arc<SlaveNode>) {
        let pool = self.clone();
        let cluster = self.env.cluster.clone();
        let mut req = PingRequest {
            site_url: self.env.site_url.clone(),
            site_id: self.env.site_id.clone(),
            master_key: node.model().master_key,
            do_register: true,
        };

        tokio::spawn(async move {
            let mut tracker = node::PingTracker::new(cluster.ping_retries.max(1));
            loop {
                match node.ping(&req).await {
                    Ok(()) => {
                        req.do_register = false;
                        if tracker.on_success() {
                            info!(node = node.id(), "从机恢复在线");
                            if let Err(e) = pool.set_node_status(node.id(), true) {
                                warn!(node = node.id(), "恢复节点状态失败: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(node = node.id(), "从机心跳失败: {}", e);
                        if tracker.on_failure() {
                            warn!(node = node.id(), "从机连续失联，标记离线");
                            if let Err(e) = pool.set_node_status(node.id(), false) {
                                warn!(node = node.id(), "挂起节点状态失败: {}", e);
                            }
                        }
                    }
                }

                let interval = if tracker.recovering() {
                    Duration::from_secs(cluster.recover_interval_secs)
                } else {
                    Duration::from_secs(cluster.ping_interval_secs)
                };
                tokio::select! {
                    _ = node.cancel.cancelled() => return,
                    _ = sleep(interval) => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::node::tests::test_node;
    use super::*;
    use crate::driver::tests::test_env;
    use tempfile::TempDir;

    fn pool_fixture() -> (TempDir, Arc<NodePool>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_temp(dir.path()).unwrap());
        (dir, NodePool::new(db, test_env()))
    }

    #[test]
    fn test_round_robin_single_node() {
        let (_dir, pool) = pool_fixture();
        let node = test_node(1, true);
        pool.db.save_node(&node).unwrap();
        pool.register(node);

        for _ in 0..3 {
            let picked = pool
                .balance_node_by_feature(FEATURE_OFFLINE_DOWNLOAD)
                .unwrap();
            assert_eq!(picked.id(), 1);
        }
    }

    #[test]
    fn test_no_nodes_available() {
        let (_dir, pool) = pool_fixture();
        pool.register(test_node(1, false));
        assert!(matches!(
            pool.balance_node_by_feature(FEATURE_OFFLINE_DOWNLOAD),
            Err(ClusterError::NoNodesAvailable)
        ));
        assert!(matches!(
            pool.balance_node_by_feature("unknown"),
            Err(ClusterError::FeatureNotExist(_))
        ));
    }

    #[test]
    fn test_round_robin_rotates_by_rank_order() {
        let (_dir, pool) = pool_fixture();
        for id in 1..=2 {
            pool.db.save_node(&test_node(id, true)).unwrap();
            pool.register(test_node(id, true));
        }
        let a = pool.balance_node_by_feature(FEATURE_OFFLINE_DOWNLOAD).unwrap();
        let b = pool.balance_node_by_feature(FEATURE_OFFLINE_DOWNLOAD).unwrap();
        let c = pool.balance_node_by_feature(FEATURE_OFFLINE_DOWNLOAD).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), c.id());
    }

    #[test]
    fn test_status_change_rebuilds_feature_index() {
        let (_dir, pool) = pool_fixture();
        let node = test_node(1, true);
        let id = pool.db.save_node(&node).unwrap();
        pool.register(test_node(id, true));

        pool.set_node_status(id, false).unwrap();
        assert!(matches!(
            pool.balance_node_by_feature(FEATURE_OFFLINE_DOWNLOAD),
            Err(ClusterError::NoNodesAvailable)
        ));
        assert_eq!(
            pool.db.get_node_by_id(id).unwrap().status,
            NodeStatus::Suspend
        );

        // 恢复后重新进入索引
        pool.set_node_status(id, true).unwrap();
        assert_eq!(
            pool.balance_node_by_feature(FEATURE_OFFLINE_DOWNLOAD)
                .unwrap()
                .id(),
            id
        );
    }

    #[test]
    fn test_delete_removes_from_index() {
        let (_dir, pool) = pool_fixture();
        pool.register(test_node(1, true));
        pool.delete(1);
        assert!(pool.get_node_by_id(1).is_none());
        assert!(matches!(
            pool.balance_node_by_feature(FEATURE_OFFLINE_DOWNLOAD),
            Err(ClusterError::NoNodesAvailable)
        ));
    }
}
