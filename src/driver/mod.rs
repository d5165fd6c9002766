//! 存储驱动抽象
//!
//! 每种存储策略对应一个驱动实现，文件系统层只面向 [`Driver`]
//! 编程。驱动按策略类型分发；mock 与 anonymous 策略使用测试桩
//! 驱动，不做物理写入。

pub mod local;
pub mod onedrive;
pub mod remote;
pub mod shadow;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::CacheStore;
use crate::config::{ClusterConfig, UploadConfig};
use crate::error::{DriverError, FsError};
use crate::fsctx::{FileStream, ReadSeek, UploadInfo};
use crate::models::{File, Policy, PolicyType};
use crate::request::TpsLimiter;

/// 存储端对象，列举目录结构时返回
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub name: String,
    /// 相对列举根的路径
    pub relative_path: String,
    /// 物理路径
    pub source: String,
    pub size: u64,
    pub is_dir: bool,
    /// 最后修改时间（Unix 时间戳）
    pub last_modify: Option<i64>,
}

/// 上传会话，创建后缓存直至完成、取消或过期
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// 会话标识
    pub key: String,
    pub user_id: i64,
    pub policy_id: i64,
    /// 占位文件记录
    pub file_id: i64,
    pub virtual_path: String,
    pub name: String,
    pub size: u64,
    pub save_path: String,
    pub last_modified: Option<i64>,
}

/// 下发给客户端的上传凭证
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadCredential {
    pub session_id: String,
    pub chunk_size: u64,
    /// 凭证过期时间（Unix 时间戳）
    pub expires: i64,
    /// 客户端直传地址，空表示经由本机中转
    #[serde(default)]
    pub upload_urls: Vec<String>,
    /// 直传时的鉴权凭证
    #[serde(default)]
    pub credential: String,
}

/// 缩略图或文件内容响应
pub enum ContentResponse {
    /// 重定向到外部地址
    Redirect(String),
    /// 直接回源的内容
    Content(Box<dyn ReadSeek>),
}

/// 存储驱动
#[async_trait]
pub trait Driver: Send + Sync {
    /// 将字节源写入物理存储
    async fn put(&self, file: &mut FileStream) -> Result<(), DriverError>;

    /// 删除物理文件，返回删除失败的路径
    async fn delete(&self, files: &[String]) -> Result<Vec<String>, DriverError>;

    /// 读取物理文件内容
    async fn get(&self, path: &str) -> Result<Box<dyn ReadSeek>, DriverError>;

    /// 获取缩略图
    async fn thumb(&self, path: &str) -> Result<ContentResponse, DriverError>;

    /// 生成文件外链
    async fn source(
        &self,
        file: &File,
        base_url: &str,
        ttl: i64,
        is_download: bool,
    ) -> Result<String, DriverError>;

    /// 为上传会话签发客户端凭证
    async fn token(
        &self,
        session: &UploadSession,
        info: &UploadInfo,
    ) -> Result<UploadCredential, DriverError>;

    /// 撤销上传会话在存储端的资源
    async fn cancel_token(&self, session: &UploadSession) -> Result<(), DriverError>;

    /// 列举存储端目录结构
    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<Object>, DriverError>;
}

/// 驱动运行环境，由应用上下文注入
#[derive(Clone)]
pub struct DriverEnv {
    pub cache: Arc<CacheStore>,
    pub limiter: Arc<TpsLimiter>,
    pub upload: UploadConfig,
    pub cluster: ClusterConfig,
    /// 本站地址，生成外链与回调地址的基础
    pub site_url: String,
    pub site_id: String,
    /// 本站签名密钥
    pub site_secret: String,
}

/// 按策略类型构建驱动
pub fn build_driver(policy: &Policy, env: &DriverEnv) -> Result<Box<dyn Driver>, FsError> {
    match policy.policy_type {
        PolicyType::Local => Ok(Box::new(local::LocalDriver::new(policy.clone(), env))),
        PolicyType::Remote => Ok(Box::new(remote::RemoteDriver::new(policy.clone(), env))),
        PolicyType::Onedrive => Ok(Box::new(onedrive::OneDriveDriver::new(policy.clone(), env))),
        PolicyType::Mock | PolicyType::Anonymous => Ok(Box::new(MockDriver::default())),
    }
}

/// 测试桩驱动，记录调用而不触碰物理存储
#[derive(Default)]
pub struct MockDriver {
    /// 已写入的 (save_path, 内容长度)
    pub puts: Mutex<Vec<(String, u64)>>,
    pub deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl Driver for MockDriver {
    async fn put(&self, file: &mut FileStream) -> Result<(), DriverError> {
        use std::io::Read;
        let mut sink = Vec::new();
        file.read_to_end(&mut sink)?;
        self.puts
            .lock()
            .push((file.info.save_path.clone(), sink.len() as u64));
        Ok(())
    }

    async fn delete(&self, files: &[String]) -> Result<Vec<String>, DriverError> {
        self.deleted.lock().extend(files.iter().cloned());
        Ok(Vec::new())
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
        session: &UploadSession,
        _info: &UploadInfo,
    ) -> Result<UploadCredential, DriverError> {
        Ok(UploadCredential {
            session_id: session.key.clone(),
            ..Default::default()
        })
    }

    async fn cancel_token(&self, _session: &UploadSession) -> Result<(), DriverError> {
        Ok(())
    }

    async fn list(&self, _path: &str, _recursive: bool) -> Result<Vec<Object>, DriverError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::fsctx::UploadInfo;
    use std::io::Cursor;

    pub(crate) fn test_env() -> DriverEnv {
        let config = AppConfig::default();
        DriverEnv {
            cache: Arc::new(CacheStore::new()),
            limiter: Arc::new(TpsLimiter::new()),
            upload: config.upload,
            cluster: config.cluster,
            site_url: "https://pan.example.com".into(),
            site_id: "site-1".into(),
            site_secret: "secret".into(),
        }
    }

    #[tokio::test]
    async fn test_mock_driver_records_put() {
        let driver = MockDriver::default();
        let mut stream = FileStream::from_seekable(
            Cursor::new(b"hello".to_vec()),
            UploadInfo {
                save_path: "uploads/1/a.txt".into(),
                size: 5,
                ..Default::default()
            },
        );
        driver.put(&mut stream).await.unwrap();
        assert_eq!(driver.puts.lock()[0], ("uploads/1/a.txt".to_string(), 5));
    }

    #[test]
    fn test_dispatch_mock_types() {
        let env = test_env();
        let policy = Policy {
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
            options: Default::default(),
        };
        assert!(build_driver(&policy, &env).is_ok());
    }
}
