//! 带签名的 HTTP 客户端
//!
//! 主机调用从机 API、从机回调主机都走这里：请求按共享密钥签名，
//! GET/DELETE 把签名放在 URL 参数，写类请求放在 Authorization 头；
//! 附带站点与节点标识头，并可按策略令牌做 TPS 限流。

pub mod tps;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{HmacAuth, SIGN_HEADER_PREFIX};
use crate::error::DriverError;

pub use tps::TpsLimiter;

/// 节点间 API 的统一响应体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ApiResponse {
    /// code 非 0 视为远端错误
    pub fn into_result(self) -> Result<serde_json::Value, DriverError> {
        if self.code != 0 {
            return Err(DriverError::RemoteResponse {
                code: self.code,
                msg: self.msg,
            });
        }
        Ok(self.data)
    }

    pub fn decode_data<T: DeserializeOwned>(self) -> Result<T, DriverError> {
        let data = self.into_result()?;
        serde_json::from_value(data).map_err(|e| DriverError::RemoteResponse {
            code: -1,
            msg: format!("响应数据解析失败: {}", e),
        })
    }
}

/// 单次请求的可选项
#[derive(Debug, Clone, Default)]
pub struct RequestOpts {
    /// 覆盖客户端默认超时
    pub timeout: Option<Duration>,
    /// 显式声明的 Content-Length，从机端据此校验分片完整性
    pub content_length: Option<u64>,
    /// 额外请求头
    pub headers: Vec<(String, String)>,
    /// 每秒请求上限，0 表示不限
    pub tps: f64,
    pub tps_burst: usize,
    /// 限流桶令牌，同令牌的请求共享同一个桶
    pub tps_token: String,
}

impl RequestOpts {
    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_tps(mut self, token: impl Into<String>, tps: f64, burst: usize) -> Self {
        self.tps_token = token.into();
        self.tps = tps;
        self.tps_burst = burst;
        self
    }
}

/// 面向单个远端（从机或存储端 API）的签名客户端
#[derive(Clone)]
pub struct SignedClient {
    http: reqwest::Client,
    /// 远端 API 根地址，路径在其上解析
    endpoint: String,
    auth: HmacAuth,
    /// 签名有效期（秒）
    sign_ttl: i64,
    limiter: Arc<TpsLimiter>,
    /// 主机身份头：站点地址与站点 ID
    site_meta: Option<(String, String)>,
    /// 从机回调时携带的节点 ID
    node_id: Option<i64>,
}

impl SignedClient {
    pub fn new(
        endpoint: impl Into<String>,
        secret: impl Into<Vec<u8>>,
        sign_ttl: i64,
        limiter: Arc<TpsLimiter>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            auth: HmacAuth::new(secret),
            sign_ttl,
            limiter,
            site_meta: None,
            node_id: None,
        }
    }

    /// 以主机身份发送请求时携带站点信息
    pub fn with_site_meta(mut self, site_url: impl Into<String>, site_id: impl Into<String>) -> Self {
        self.site_meta = Some((site_url.into(), site_id.into()));
        self
    }

    /// 以从机身份回调时携带节点 ID
    pub fn with_node_id(mut self, node_id: i64) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn resolve(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    fn meta_headers(&self) -> Result<HeaderMap, DriverError> {
        let mut headers = HeaderMap::new();
        if let Some((url, id)) = &self.site_meta {
            headers.insert(
                header_name("Site-Url")?,
                HeaderValue::from_str(url).map_err(bad_header)?,
            );
            headers.insert(
                header_name("Site-Id")?,
                HeaderValue::from_str(id).map_err(bad_header)?,
            );
        }
        if let Some(node_id) = self.node_id {
            headers.insert(
                header_name("Node-Id")?,
                HeaderValue::from_str(&node_id.to_string()).map_err(bad_header)?,
            );
        }
        Ok(headers)
    }

    /// 发送请求，返回原始响应
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        opts: RequestOpts,
    ) -> Result<reqwest::Response, DriverError> {
        if opts.tps > 0.0 {
            self.limiter
                .limit(&opts.tps_token, opts.tps, opts.tps_burst)
                .await;
        }

        let expires = chrono::Utc::now().timestamp() + self.sign_ttl;
        let sign_target = format!("/{}", path.trim_start_matches('/'));

        // 写类请求签名放头部，读类请求签名追加到 URL
        let (url, auth_header) = match method {
            Method::PUT | Method::POST | Method::PATCH => {
                let sign = self.auth.sign(&sign_target, expires);
                (self.resolve(path), Some(format!("Bearer {}", sign)))
            }
            _ => {
                let signed = self.auth.sign_uri(&sign_target, self.sign_ttl);
                (
                    format!("{}{}", self.endpoint, signed),
                    None,
                )
            }
        };

        debug!(%method, %url, "发送节点间请求");

        let mut builder = self.http.request(method, &url);
        builder = builder.headers(self.meta_headers()?);
        if let Some(auth) = auth_header {
            builder = builder.header(AUTHORIZATION, auth);
        }
        for (key, value) in &opts.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(len) = opts.content_length {
            builder = builder.header(CONTENT_LENGTH, len);
        }
        if let Some(timeout) = opts.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        Ok(builder.send().await?)
    }

    /// 发送请求并解析统一响应体，HTTP 状态异常或 code 非 0 均报错
    pub async fn request_api(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        opts: RequestOpts,
    ) -> Result<ApiResponse, DriverError> {
        let resp = self.request(method, path, body, opts).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DriverError::RemoteResponse {
                code: status.as_u16() as i64,
                msg: format!("远端返回异常 HTTP 状态 {}", status),
            });
        }
        Ok(resp.json::<ApiResponse>().await?)
    }

    /// 以 JSON 体发送请求
    pub async fn post_json<T: Serialize>(
        &self,
        path: &str,
        payload: &T,
        opts: RequestOpts,
    ) -> Result<ApiResponse, DriverError> {
        let body = serde_json::to_vec(payload).map_err(|e| DriverError::RemoteResponse {
            code: -1,
            msg: format!("请求体序列化失败: {}", e),
        })?;
        let opts = opts.with_header("Content-Type", "application/json");
        self.request_api(Method::POST, path, Some(body), opts).await
    }
}

fn header_name(suffix: &str) -> Result<HeaderName, DriverError> {
    HeaderName::from_bytes(format!("{}{}", SIGN_HEADER_PREFIX, suffix).as_bytes())
        .map_err(|e| DriverError::RemoteResponse {
            code: -1,
            msg: format!("非法请求头: {}", e),
        })
}

fn bad_header<E: std::fmt::Display>(e: E) -> DriverError {
    DriverError::RemoteResponse {
        code: -1,
        msg: format!("非法请求头值: {}", e),
    }
}
