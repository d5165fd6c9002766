//! 固定间隔重试计数器

use std::time::Duration;

/// 固定间隔退避
///
/// 每次 `next()` 计数加一；未超过上限时休眠固定时长并允许重试
#[derive(Debug)]
pub struct ConstantBackoff {
    /// 重试间隔
    pub sleep: Duration,
    /// 最大重试次数
    pub max: usize,
    tried: usize,
}

impl ConstantBackoff {
    pub fn new(sleep: Duration, max: usize) -> Self {
        Self {
            sleep,
            max,
            tried: 0,
        }
    }

    /// 是否允许再次重试，允许时先休眠固定间隔
    pub async fn next(&mut self) -> bool {
        self.tried += 1;
        if self.tried > self.max {
            return false;
        }
        tokio::time::sleep(self.sleep).await;
        true
    }

    /// 重置计数（进入新分片时调用）
    pub fn reset(&mut self) {
        self.tried = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backoff_exhaustion() {
        let mut backoff = ConstantBackoff::new(Duration::ZERO, 2);
        assert!(backoff.next().await);
        assert!(backoff.next().await);
        assert!(!backoff.next().await);
    }

    #[tokio::test]
    async fn test_backoff_reset() {
        let mut backoff = ConstantBackoff::new(Duration::ZERO, 1);
        assert!(backoff.next().await);
        assert!(!backoff.next().await);

        backoff.reset();
        assert!(backoff.next().await);
    }
}
