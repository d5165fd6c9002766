//! 进程内消息总线
//!
//! 按主题（topic）发布/订阅。从机中转完成的回调、离线下载引擎的
//! 推送通知都经由总线转发给等待方。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// 从机中转成功事件
pub const SLAVE_TRANSFER_SUCCESS: &str = "slave_transfer_success";
/// 从机中转失败事件
pub const SLAVE_TRANSFER_FAILED: &str = "slave_transfer_failed";

/// 总线消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// 事件名
    pub event: String,
    /// 事件内容
    pub content: serde_json::Value,
}

impl Message {
    pub fn new(event: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            content,
        }
    }
}

/// 消息总线
pub struct MessageBus {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// 订阅主题，返回消息接收端；接收端被丢弃后自动退订
    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// 向主题发布消息，返回实际送达的订阅者数量
    pub fn publish(&self, topic: &str, msg: Message) -> usize {
        let mut topics = self.topics.lock();
        let Some(senders) = topics.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        senders.retain(|tx| match tx.send(msg.clone()) {
            Ok(_) => {
                delivered += 1;
                true
            }
            // 接收端已关闭，顺手清理
            Err(_) => false,
        });
        if senders.is_empty() {
            topics.remove(topic);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe("job-1");

        let delivered = bus.publish("job-1", Message::new("done", serde_json::json!({"ok": true})));
        assert_eq!(delivered, 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, "done");
    }

    #[tokio::test]
    async fn test_publish_without_subscriber() {
        let bus = MessageBus::new();
        assert_eq!(bus.publish("nobody", Message::new("x", serde_json::Value::Null)), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_cleaned_up() {
        let bus = MessageBus::new();
        let rx = bus.subscribe("t");
        drop(rx);
        assert_eq!(bus.publish("t", Message::new("x", serde_json::Value::Null)), 0);
        // 主题已被移除
        assert!(bus.topics.lock().is_empty());
    }
}
