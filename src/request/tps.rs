//! 按令牌分桶的 TPS 限流器
//!
//! 每个令牌（通常是策略或节点标识）对应一个独立的令牌桶，
//! 超出速率的请求在桶内排队等待而不是被拒绝。

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Bucket {
    tps: f64,
    burst: f64,
    /// 当前可用令牌数
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn new(tps: f64, burst: usize) -> Self {
        let burst = (burst.max(1)) as f64;
        Self {
            tps,
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    /// 取走一个令牌，返回需要等待的时长
    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.tps).min(self.burst);
        self.last = now;

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.tps)
        }
    }
}

/// 多桶限流器
pub struct TpsLimiter {
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl Default for TpsLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl TpsLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// 等待直到令牌可用；tps <= 0 时不限流
    ///
    /// 速率参数变化时重建对应的桶
    pub async fn limit(&self, token: &str, tps: f64, burst: usize) {
        if tps <= 0.0 {
            return;
        }

        let wait = {
            let entry = self
                .buckets
                .entry(token.to_string())
                .or_insert_with(|| Mutex::new(Bucket::new(tps, burst)));
            let mut bucket = entry.lock();
            if bucket.tps != tps || bucket.burst != (burst.max(1)) as f64 {
                *bucket = Bucket::new(tps, burst);
            }
            bucket.reserve(Instant::now())
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
