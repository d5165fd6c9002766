//! OneDrive 驱动
//!
//! 通过 Graph API 访问。上传走可续传会话：先 createUploadSession
//! 拿到上传地址，再按 Content-Range 分段 PUT。访问令牌由刷新令牌
//! 换取并缓存，所有 API 调用受策略的 TPS 限制。

use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{ContentResponse, Driver, DriverEnv, Object, UploadCredential, UploadSession};
use crate::cache::CacheStore;
use crate::chunk::{backoff::ConstantBackoff, ChunkGroup, ProcessFn};
use crate::error::DriverError;
use crate::fsctx::{FileStream, ReadSeek, UploadInfo};
use crate::models::{File, Policy};
use crate::request::TpsLimiter;

/// 访问令牌缓存键前缀
const TOKEN_CACHE_PREFIX: &str = "onedrive_token_";
/// 默认令牌端点
const OAUTH_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
/// 简单上传的大小上限，超过则走可续传会话
const SMALL_FILE_LIMIT: u64 = 4 << 20;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct UploadSessionResponse {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default, rename = "@microsoft.graph.downloadUrl")]
    download_url: String,
    #[serde(default)]
    folder: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChildrenResponse {
    #[serde(default)]
    value: Vec<DriveItem>,
}

pub struct OneDriveDriver {
    policy: Policy,
    http: reqwest::Client,
    cache: Arc<CacheStore>,
    limiter: Arc<TpsLimiter>,
    upload: crate::config::UploadConfig,
}

impl OneDriveDriver {
    pub fn new(policy: Policy, env: &DriverEnv) -> Self {
        Self {
            policy,
            http: reqwest::Client::new(),
            cache: env.cache.clone(),
            limiter: env.limiter.clone(),
            upload: env.upload.clone(),
        }
    }

    fn tps_token(&self) -> String {
        format!("policy_{}", self.policy.id)
    }

    async fn throttle(&self) {
        self.limiter
            .limit(
                &self.tps_token(),
                self.policy.options.tps_limit,
                self.policy.options.tps_limit_burst,
            )
            .await;
    }

    /// 物理路径对应的 Graph 资源地址
    fn item_url(&self, path: &str) -> String {
        format!(
            "{}/me/drive/root:/{}",
            self.policy.server.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// 取访问令牌，过期则用刷新令牌换新并缓存
    async fn credential(&self) -> Result<String, DriverError> {
        let cache_key = format!("{}{}", TOKEN_CACHE_PREFIX, self.policy.id);
        if let Some(token) = self.cache.get::<String>(&cache_key) {
            return Ok(token);
        }

        debug!(policy = self.policy.id, "刷新 OneDrive 访问令牌");
        let resp = self
            .http
            .post(OAUTH_TOKEN_URL)
            .form(&[
                ("client_id", self.policy.options.client_id.as_str()),
                ("client_secret", self.policy.secret_key.as_str()),
                ("redirect_uri", self.policy.options.od_redirect.as_str()),
                ("refresh_token", self.policy.access_key.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(DriverError::RemoteResponse {
                code: resp.status().as_u16() as i64,
                msg: "刷新访问令牌失败".to_string(),
            });
        }
        let token: TokenResponse = resp.json().await?;

        // 提前一分钟过期，避免边界上用到失效令牌
        self.cache
            .set(&cache_key, &token.access_token, token.expires_in - 60);
        Ok(token.access_token)
    }

    /// 建立可续传上传会话
    async fn create_upload_session(&self, save_path: &str) -> Result<String, DriverError> {
        self.throttle().await;
        let token = self.credential().await?;
        let resp = self
            .http
            .post(format!("{}:/createUploadSession", self.item_url(save_path)))
            .bearer_auth(token)
            .json(&json!({
                "item": { "@microsoft.graph.conflictBehavior": "fail" }
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(graph_error(resp).await);
        }
        let session: UploadSessionResponse = resp.json().await?;
        Ok(session.upload_url)
    }

    async fn delete_upload_session(&self, upload_url: &str) {
        if let Err(e) = self.http.delete(upload_url).send().await {
            warn!("删除 OneDrive 上传会话失败: {}", e);
        }
    }

    /// 小文件直接单次 PUT
    async fn put_small(&self, save_path: &str, data: Vec<u8>) -> Result<(), DriverError> {
        self.throttle().await;
        let token = self.credential().await?;
        let resp = self
            .http
            .put(format!("{}:/content", self.item_url(save_path)))
            .bearer_auth(token)
            .body(data)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(graph_error(resp).await);
        }
        Ok(())
    }
}

async fn graph_error(resp: reqwest::Response) -> DriverError {
    let code = resp.status().as_u16() as i64;
    let msg = resp
        .text()
        .await
        .unwrap_or_else(|_| "无法读取错误响应".to_string());
    DriverError::RemoteResponse { code, msg }
}

#[async_trait]
impl Driver for OneDriveDriver {
    async fn put(&self, file: &mut FileStream) -> Result<(), DriverError> {
        let info = file.info.clone();

        if info.size <= SMALL_FILE_LIMIT {
            use std::io::Read;
            let mut data = Vec::with_capacity(info.size as usize);
            file.read_to_end(&mut data)?;
            return self.put_small(&info.save_path, data).await;
        }

        let upload_url = self.create_upload_session(&info.save_path).await?;

        let mut chunks = ChunkGroup::new(
            std::mem::replace(file, FileStream::empty(info)),
            self.policy.options.chunk_size,
            ConstantBackoff::new(
                Duration::from_secs(self.upload.chunk_retry_sleep_secs),
                self.upload.chunk_retries,
            ),
            self.upload.use_temp_chunk_buffer,
        );

        let http = self.http.clone();
        let limiter = self.limiter.clone();
        let tps_token = self.tps_token();
        let tps = self.policy.options.tps_limit;
        let burst = self.policy.options.tps_limit_burst;
        let url = upload_url.clone();
        let mut upload_chunk: ProcessFn = Box::new(move |chunk, data| {
            let http = http.clone();
            let limiter = limiter.clone();
            let tps_token = tps_token.clone();
            let url = url.clone();
            async move {
                limiter.limit(&tps_token, tps, burst).await;
                let resp = http
                    .put(&url)
                    .header("Content-Range", chunk.range_header())
                    .header("Content-Length", data.len())
                    .body(data)
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(graph_error(resp).await);
                }
                Ok(())
            }
            .boxed()
        });

        while chunks.next() {
            if let Err(e) = chunks.process(&mut upload_chunk).await {
                self.delete_upload_session(&upload_url).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn delete(&self, files: &[String]) -> Result<Vec<String>, DriverError> {
        let mut failed = Vec::new();
        for path in files {
            self.throttle().await;
            let token = self.credential().await?;
            let resp = self
                .http
                .delete(self.item_url(path))
                .bearer_auth(token)
                .send()
                .await;
            match resp {
                // 404 表示已不存在，视为成功
                Ok(r) if r.status().is_success() || r.status().as_u16() == 404 => {}
                Ok(r) => {
                    warn!(path = %path, status = %r.status(), "OneDrive 删除失败");
                    failed.push(path.clone());
                }
                Err(e) => {
                    warn!(path = %path, "OneDrive 删除失败: {}", e);
                    failed.push(path.clone());
                }
            }
        }
        Ok(failed)
    }

    async fn get(&self, path: &str) -> Result<Box<dyn ReadSeek>, DriverError> {
        self.throttle().await;
        let token = self.credential().await?;
        let resp = self
            .http
            .get(self.item_url(path))
            .bearer_auth(token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(graph_error(resp).await);
        }
        let item: DriveItem = resp.json().await?;

        let content = self.http.get(&item.download_url).send().await?;
        let bytes = content.bytes().await?;
        let mut spool = tempfile::tempfile()?;
        spool.write_all(&bytes)?;
        spool.seek(SeekFrom::Start(0))?;
        Ok(Box::new(spool))
    }

    async fn thumb(&self, path: &str) -> Result<ContentResponse, DriverError> {
        self.throttle().await;
        let token = self.credential().await?;
        let resp = self
            .http
            .get(format!("{}:/thumbnails/0/medium", self.item_url(path)))
            .bearer_auth(token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(graph_error(resp).await);
        }
        let data: serde_json::Value = resp.json().await?;
        let url = data["url"]
            .as_str()
            .ok_or(DriverError::NotSupported)?
            .to_string();
        Ok(ContentResponse::Redirect(url))
    }

    async fn source(
        &self,
        file: &File,
        _base_url: &str,
        _ttl: i64,
        _is_download: bool,
    ) -> Result<String, DriverError> {
        self.throttle().await;
        let token = self.credential().await?;
        let resp = self
            .http
            .get(self.item_url(&file.source_name))
            .bearer_auth(token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(graph_error(resp).await);
        }
        let item: DriveItem = resp.json().await?;
        if item.download_url.is_empty() {
            return Err(DriverError::NotSupported);
        }
        Ok(item.download_url)
    }

    async fn token(
        &self,
        session: &UploadSession,
        _info: &UploadInfo,
    ) -> Result<UploadCredential, DriverError> {
        // 客户端直传 OneDrive：把上传会话地址下发给客户端
        let upload_url = self.create_upload_session(&session.save_path).await?;
        self.cache.set(
            &format!("onedrive_upload_{}", session.key),
            &upload_url,
            self.upload.session_ttl_secs as i64,
        );
        Ok(UploadCredential {
            session_id: session.key.clone(),
            chunk_size: self.policy.options.chunk_size,
            expires: chrono::Utc::now().timestamp() + self.upload.session_ttl_secs as i64,
            upload_urls: vec![upload_url],
            credential: String::new(),
        })
    }

    async fn cancel_token(&self, session: &UploadSession) -> Result<(), DriverError> {
        let cache_key = format!("onedrive_upload_{}", session.key);
        if let Some(upload_url) = self.cache.get::<String>(&cache_key) {
            self.delete_upload_session(&upload_url).await;
            self.cache.delete(&cache_key);
        }
        Ok(())
    }

    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<Object>, DriverError> {
        let mut objects = Vec::new();
        let mut queue = vec![path.trim_matches('/').to_string()];

        while let Some(current) = queue.pop() {
            self.throttle().await;
            let token = self.credential().await?;
            let url = if current.is_empty() {
                format!(
                    "{}/me/drive/root/children",
                    self.policy.server.trim_end_matches('/')
                )
            } else {
                format!("{}:/children", self.item_url(&current))
            };
            let resp = self.http.get(url).bearer_auth(token).send().await?;
            if !resp.status().is_success() {
                return Err(graph_error(resp).await);
            }
            let children: ChildrenResponse = resp.json().await?;

            for item in children.value {
                let is_dir = item.folder.is_some();
                let rel = if current.is_empty() {
                    item.name.clone()
                } else {
                    format!("{}/{}", current, item.name)
                };
                if is_dir && recursive {
                    queue.push(rel.clone());
                }
                objects.push(Object {
                    name: item.name,
                    relative_path: rel.clone(),
                    source: rel,
                    size: item.size,
                    is_dir,
                    last_modify: None,
                });
            }
        }
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::test_env;
    use crate::models::{PolicyOption, PolicyType};

    fn od_policy() -> Policy {
        Policy {
            id: 3,
            name: "od".into(),
            policy_type: PolicyType::Onedrive,
            server: "https://graph.microsoft.com/v1.0/".into(),
            access_key: "refresh-token".into(),
            secret_key: "client-secret".into(),
            max_size: 0,
            auto_rename: true,
            dir_name_rule: String::new(),
            file_name_rule: String::new(),
            base_url: String::new(),
            options: PolicyOption {
                chunk_size: 10 << 20,
                tps_limit: 5.0,
                tps_limit_burst: 10,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_item_url() {
        let driver = OneDriveDriver::new(od_policy(), &test_env());
        assert_eq!(
            driver.item_url("uploads/1/a.txt"),
            "https://graph.microsoft.com/v1.0/me/drive/root:/uploads/1/a.txt"
        );
    }

    #[test]
    fn test_cached_token_skips_refresh() {
        let env = test_env();
        let driver = OneDriveDriver::new(od_policy(), &env);
        env.cache.set(
            &format!("{}{}", TOKEN_CACHE_PREFIX, 3),
            &"cached-token".to_string(),
            3600,
        );
        let token = futures::executor::block_on(driver.credential()).unwrap();
        assert_eq!(token, "cached-token");
    }
}
