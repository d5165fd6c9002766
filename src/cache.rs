//! 进程内带 TTL 的键值缓存
//!
//! 用于上传会话、策略缓存、下载外链会话等临时数据。
//! 值以 JSON 形式存储，读取时惰性清理过期项，另有
//! `collect_expired` 供周期性回收器调用。

use chrono::Utc;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

/// 上传会话缓存键前缀
pub const UPLOAD_SESSION_PREFIX: &str = "callback_";
/// 策略缓存键前缀
pub const POLICY_PREFIX: &str = "policy_";
/// 下载会话缓存键前缀
pub const DOWNLOAD_SESSION_PREFIX: &str = "download_";

struct Entry {
    value: serde_json::Value,
    /// 过期时间戳，None 表示永不过期
    expires_at: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// TTL 键值缓存
pub struct CacheStore {
    entries: DashMap<String, Entry>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// 写入缓存，ttl_secs <= 0 表示永不过期
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: i64) {
        let expires_at = if ttl_secs > 0 {
            Some(Utc::now().timestamp() + ttl_secs)
        } else {
            None
        };
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(_) => return,
        };
        self.entries.insert(key.to_string(), Entry { value, expires_at });
    }

    /// 读取缓存，过期项视为不存在并被清理
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Utc::now().timestamp();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.entries.remove(key);
                return None;
            }
            return serde_json::from_value(entry.value.clone()).ok();
        }
        None
    }

    /// 删除单个键，返回是否存在
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// 按前缀批量删除
    pub fn delete_by_prefix(&self, prefix: &str, keys: &[String]) {
        for key in keys {
            self.entries.remove(&format!("{}{}", prefix, key));
        }
    }

    /// 回收所有过期项，返回被清理的键列表
    ///
    /// 周期性回收器用它清扫孤儿上传会话
    pub fn collect_expired(&self) -> Vec<String> {
        let now = Utc::now().timestamp();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        if !expired.is_empty() {
            debug!("缓存回收器清理了 {} 个过期项", expired.len());
        }
        expired
    }

    /// 当前缓存条目数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let cache = CacheStore::new();
        cache.set("k1", &"hello".to_string(), 0);
        assert_eq!(cache.get::<String>("k1"), Some("hello".to_string()));
        assert!(cache.delete("k1"));
        assert_eq!(cache.get::<String>("k1"), None);
        assert!(!cache.delete("k1"));
    }

    #[test]
    fn test_expired_entry_invisible() {
        let cache = CacheStore::new();
        cache.set("k", &42u64, 1);
        // 手工把过期时间改到过去
        cache.entries.get_mut("k").unwrap().expires_at = Some(Utc::now().timestamp() - 1);
        assert_eq!(cache.get::<u64>("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_collect_expired() {
        let cache = CacheStore::new();
        cache.set("live", &1u32, 3600);
        cache.set("dead", &2u32, 1);
        cache.entries.get_mut("dead").unwrap().expires_at = Some(Utc::now().timestamp() - 1);

        let collected = cache.collect_expired();
        assert_eq!(collected, vec!["dead".to_string()]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_delete_by_prefix() {
        let cache = CacheStore::new();
        cache.set("callback_abc", &1u32, 0);
        cache.set("callback_def", &2u32, 0);
        cache.delete_by_prefix(UPLOAD_SESSION_PREFIX, &["abc".to_string()]);
        assert_eq!(cache.get::<u32>("callback_abc"), None);
        assert_eq!(cache.get::<u32>("callback_def"), Some(2));
    }
}
