//! 从机存储驱动
//!
//! 主机把物理写入转发到从机：先在从机上建立上传会话，再把字节源
//! 切成分片逐个 POST，分片失败按固定间隔重试。从机 API 使用策略
//! 密钥签名。

use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use reqwest::Method;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::{ContentResponse, Driver, DriverEnv, Object, UploadCredential, UploadSession};
use crate::auth::{HmacAuth, SIGN_HEADER_PREFIX};
use crate::chunk::{backoff::ConstantBackoff, ChunkGroup, ProcessFn};
use crate::error::DriverError;
use crate::fsctx::{FileStream, ReadSeek, UploadInfo, WriteMode};
use crate::models::{File, Policy};
use crate::request::{RequestOpts, SignedClient};

/// 从机 API 根路径
const SLAVE_BASE_PATH: &str = "/api/v3/slave";

pub struct RemoteDriver {
    policy: Policy,
    client: Arc<SignedClient>,
    source_auth: HmacAuth,
    upload: crate::config::UploadConfig,
    session_ttl: i64,
}

impl RemoteDriver {
    pub fn new(policy: Policy, env: &DriverEnv) -> Self {
        let endpoint = format!(
            "{}{}",
            policy.server.trim_end_matches('/'),
            SLAVE_BASE_PATH
        );
        let client = SignedClient::new(
            endpoint,
            policy.secret_key.as_bytes().to_vec(),
            env.cluster.slave_api_timeout_secs as i64,
            env.limiter.clone(),
        )
        .with_site_meta(env.site_url.clone(), env.site_id.clone());

        Self {
            source_auth: HmacAuth::new(policy.secret_key.as_bytes().to_vec()),
            policy,
            client: Arc::new(client),
            upload: env.upload.clone(),
            session_ttl: env.upload.session_ttl_secs as i64,
        }
    }

    /// 在从机上建立上传会话
    async fn create_upload_session(
        &self,
        session: &UploadSession,
        overwrite: bool,
    ) -> Result<(), DriverError> {
        self.client
            .post_json(
                "upload",
                &json!({
                    "session": session,
                    "ttl": self.session_ttl,
                    "overwrite": overwrite,
                }),
                RequestOpts::default(),
            )
            .await?
            .into_result()?;
        Ok(())
    }

    /// 删除从机上的上传会话，失败仅记录
    async fn delete_upload_session(&self, key: &str) {
        let res = self
            .client
            .request_api(
                Method::DELETE,
                &format!("upload/{}", key),
                None,
                RequestOpts::default(),
            )
            .await
            .and_then(|r| r.into_result());
        if let Err(e) = res {
            warn!(session = key, "删除从机上传会话失败: {}", e);
        }
    }
}

#[async_trait]
impl Driver for RemoteDriver {
    async fn put(&self, file: &mut FileStream) -> Result<(), DriverError> {
        let info = file.info.clone();
        let overwrite = info.mode.contains(WriteMode::OVERWRITE);
        let session = UploadSession {
            key: Uuid::new_v4().to_string(),
            user_id: 0,
            policy_id: self.policy.id,
            file_id: 0,
            virtual_path: info.virtual_path.clone(),
            name: info.file_name.clone(),
            size: info.size,
            save_path: info.save_path.clone(),
            last_modified: info.last_modified,
        };

        self.create_upload_session(&session, overwrite).await?;

        let mut chunks = ChunkGroup::new(
            std::mem::replace(file, FileStream::empty(info)),
            self.policy.options.chunk_size,
            ConstantBackoff::new(
                Duration::from_secs(self.upload.chunk_retry_sleep_secs),
                self.upload.chunk_retries,
            ),
            self.upload.use_temp_chunk_buffer,
        );

        let client = self.client.clone();
        let session_key = session.key.clone();
        let mut upload_chunk: ProcessFn = Box::new(move |chunk, data| {
            let client = client.clone();
            let path = format!("upload/{}?chunk={}", session_key, chunk.index);
            async move {
                let opts = RequestOpts::default()
                    .with_content_length(data.len() as u64)
                    .with_header(
                        format!("{}Overwrite", SIGN_HEADER_PREFIX),
                        overwrite.to_string(),
                    );
                client
                    .request_api(Method::POST, &path, Some(data), opts)
                    .await?
                    .into_result()?;
                Ok(())
            }
            .boxed()
        });

        while chunks.next() {
            if let Err(e) = chunks.process(&mut upload_chunk).await {
                self.delete_upload_session(&session.key).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn delete(&self, files: &[String]) -> Result<Vec<String>, DriverError> {
        let data = self
            .client
            .post_json("file/delete", &json!({ "files": files }), RequestOpts::default())
            .await?
            .into_result()?;
        // 从机返回删除失败的路径列表
        let failed: Vec<String> = serde_json::from_value(data).unwrap_or_default();
        Ok(failed)
    }

    async fn get(&self, path: &str) -> Result<Box<dyn ReadSeek>, DriverError> {
        let resp = self
            .client
            .request(
                Method::GET,
                &format!("file/content/{}", urlencoding::encode(path)),
                None,
                RequestOpts::default(),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(DriverError::RemoteResponse {
                code: resp.status().as_u16() as i64,
                msg: "从机回源失败".to_string(),
            });
        }

        // 内容落到匿名临时文件，调用方得到可寻址读取器
        let bytes = resp.bytes().await?;
        let mut spool = tempfile::tempfile()?;
        spool.write_all(&bytes)?;
        spool.seek(SeekFrom::Start(0))?;
        Ok(Box::new(spool))
    }

    async fn thumb(&self, path: &str) -> Result<ContentResponse, DriverError> {
        let signed = self.source_auth.sign_uri(
            &format!("{}/file/thumb/{}", SLAVE_BASE_PATH, urlencoding::encode(path)),
            self.session_ttl,
        );
        Ok(ContentResponse::Redirect(format!(
            "{}{}",
            self.policy.server.trim_end_matches('/'),
            signed
        )))
    }

    async fn source(
        &self,
        file: &File,
        _base_url: &str,
        ttl: i64,
        is_download: bool,
    ) -> Result<String, DriverError> {
        let base = if self.policy.base_url.is_empty() {
            &self.policy.server
        } else {
            &self.policy.base_url
        };
        let kind = if is_download { "download" } else { "source" };
        let signed = self.source_auth.sign_uri(
            &format!(
                "{}/file/{}/{}/{}/{}",
                SLAVE_BASE_PATH,
                kind,
                file.id,
                urlencoding::encode(&file.source_name),
                urlencoding::encode(&file.name)
            ),
            ttl,
        );
        Ok(format!("{}{}", base.trim_end_matches('/'), signed))
    }

    async fn token(
        &self,
        session: &UploadSession,
        _info: &UploadInfo,
    ) -> Result<UploadCredential, DriverError> {
        // 客户端直传从机：先建会话，再下发签名的上传地址
        self.create_upload_session(session, false).await?;

        let expires = chrono::Utc::now().timestamp() + self.session_ttl;
        let upload_path = format!("{}/upload/{}", SLAVE_BASE_PATH, session.key);
        let credential = self.source_auth.sign(&upload_path, expires);

        Ok(UploadCredential {
            session_id: session.key.clone(),
            chunk_size: self.policy.options.chunk_size,
            expires,
            upload_urls: vec![format!(
                "{}{}",
                self.policy.server.trim_end_matches('/'),
                upload_path
            )],
            credential,
        })
    }

    async fn cancel_token(&self, session: &UploadSession) -> Result<(), DriverError> {
        self.delete_upload_session(&session.key).await;
        Ok(())
    }

    async fn list(&self, _path: &str, _recursive: bool) -> Result<Vec<Object>, DriverError> {
        Err(DriverError::NotSupported)
    }
}
