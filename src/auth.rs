//! 请求与 URL 签名
//!
//! 主从节点之间的所有请求、本地策略生成的外链均携带带过期时间的签名。
//! 签名格式为 `base64url(sha256(secret:body:expires)):expires`，
//! expires 为 0 表示永不过期。

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// 签名请求头前缀，带此前缀的头参与签名
pub const SIGN_HEADER_PREFIX: &str = "X-Yp-";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("签名校验失败")]
    AuthFailed,
    #[error("签名缺少过期时间")]
    ExpiresMissing,
    #[error("签名已过期")]
    Expired,
}

/// 基于共享密钥的签名器
#[derive(Debug, Clone)]
pub struct HmacAuth {
    secret_key: Vec<u8>,
}

impl HmacAuth {
    pub fn new(secret_key: impl Into<Vec<u8>>) -> Self {
        Self {
            secret_key: secret_key.into(),
        }
    }

    /// 对内容签名，expires 为绝对 Unix 时间戳，0 表示永不过期
    pub fn sign(&self, body: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret_key);
        hasher.update(b":");
        hasher.update(body.as_bytes());
        hasher.update(b":");
        hasher.update(expires.to_string().as_bytes());
        let digest = hasher.finalize();
        format!("{}:{}", URL_SAFE_NO_PAD.encode(digest), expires)
    }

    /// 校验签名
    pub fn check(&self, body: &str, sign: &str) -> Result<(), AuthError> {
        let expires_str = sign.rsplit(':').next().unwrap_or("");
        if expires_str.is_empty() {
            return Err(AuthError::ExpiresMissing);
        }
        let expires: i64 = expires_str
            .parse()
            .map_err(|_| AuthError::AuthFailed)?;

        if expires != 0 && expires < chrono::Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        if self.sign(body, expires) != sign {
            return Err(AuthError::AuthFailed);
        }
        Ok(())
    }

    /// 对 URI 路径签名，返回追加 sign 参数后的 URI
    ///
    /// ttl 为相对秒数，0 表示永不过期
    pub fn sign_uri(&self, path: &str, ttl: i64) -> String {
        let expires = if ttl != 0 {
            chrono::Utc::now().timestamp() + ttl
        } else {
            0
        };
        let sign = self.sign(path, expires);
        let separator = if path.contains('?') { '&' } else { '?' };
        format!("{}{}sign={}", path, separator, urlencoding::encode(&sign))
    }

    /// 校验带 sign 参数的 URI
    pub fn check_uri(&self, path: &str, sign: &str) -> Result<(), AuthError> {
        self.check(path, sign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_check() {
        let auth = HmacAuth::new("secret");
        let expires = chrono::Utc::now().timestamp() + 60;
        let sign = auth.sign("/api/v3/slave/upload", expires);
        assert!(auth.check("/api/v3/slave/upload", &sign).is_ok());
    }

    #[test]
    fn test_check_wrong_body() {
        let auth = HmacAuth::new("secret");
        let sign = auth.sign("body-a", 0);
        assert_eq!(auth.check("body-b", &sign), Err(AuthError::AuthFailed));
    }

    #[test]
    fn test_check_wrong_key() {
        let sign = HmacAuth::new("key-a").sign("body", 0);
        assert_eq!(
            HmacAuth::new("key-b").check("body", &sign),
            Err(AuthError::AuthFailed)
        );
    }

    #[test]
    fn test_check_expired() {
        let auth = HmacAuth::new("secret");
        let sign = auth.sign("body", chrono::Utc::now().timestamp() - 10);
        assert_eq!(auth.check("body", &sign), Err(AuthError::Expired));
    }

    #[test]
    fn test_zero_expires_never_expires() {
        let auth = HmacAuth::new("secret");
        let sign = auth.sign("body", 0);
        assert!(auth.check("body", &sign).is_ok());
    }

    #[test]
    fn test_sign_uri_appends_query() {
        let auth = HmacAuth::new("secret");
        let uri = auth.sign_uri("/file/get/1/a.txt", 3600);
        assert!(uri.starts_with("/file/get/1/a.txt?sign="));
    }
}
