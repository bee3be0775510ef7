//! HTTP 客户端模块 - 远端 REST API 边界
//!
//! - `GET /api/<collection>`：返回 `{ success, data: [...] }` 或裸数组
//! - `POST / PATCH / DELETE /api/<endpoint>`：outbox 重放与直接写共用同一请求形态
//!
//! 引擎只依赖 [`RemoteApi`] trait，测试与宿主可以替换实现。

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::collections::Collection;
use crate::config::HttpClientConfig;
use crate::error::{Result, SyncError};
use crate::sync::outbox::OutboxOperation;

/// 重放时携带 outbox 条目 ID，服务端可据此去重
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// 错误响应体写入错误信息时的最大长度
const MAX_ERROR_BODY: usize = 256;

#[async_trait::async_trait]
pub trait RemoteApi: Send + Sync {
    /// 拉取整个集合
    async fn fetch_collection(&self, collection: Collection) -> Result<Vec<Value>>;

    /// 发送一次写请求；返回服务端回写的记录（如果有）
    async fn send(
        &self,
        operation: OutboxOperation,
        endpoint: &str,
        payload: &Value,
        idempotency_key: Option<&str>,
    ) -> Result<Option<Value>>;
}

/// 解析集合响应：`{success, data}` 信封或裸数组
pub fn parse_collection_body(collection: Collection, body: Value) -> Result<Vec<Value>> {
    match body {
        Value::Array(records) => Ok(records),
        Value::Object(mut map) => {
            if map.get("success").and_then(Value::as_bool) == Some(false) {
                let message = map
                    .get("error")
                    .or_else(|| map.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("success=false")
                    .to_string();
                return Err(SyncError::ServerError(message));
            }
            match map.remove("data") {
                Some(Value::Array(records)) => Ok(records),
                Some(Value::Null) | None => Ok(Vec::new()),
                Some(other) => Err(SyncError::InvalidData(format!(
                    "{} 的 data 不是数组: {}",
                    collection,
                    type_name(&other)
                ))),
            }
        }
        other => Err(SyncError::InvalidData(format!(
            "{} 的响应不是数组或对象: {}",
            collection,
            type_name(&other)
        ))),
    }
}

/// 解析写请求响应：有 `data` 时取 `data`，否则取整个对象
pub fn parse_write_body(body: Value) -> Result<Option<Value>> {
    match body {
        Value::Null => Ok(None),
        Value::Object(mut map) => {
            if map.get("success").and_then(Value::as_bool) == Some(false) {
                let message = map
                    .get("error")
                    .or_else(|| map.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("success=false")
                    .to_string();
                return Err(SyncError::ServerError(message));
            }
            match map.remove("data") {
                Some(Value::Null) => Ok(None),
                Some(data) => Ok(Some(data)),
                None => Ok(Some(Value::Object(map))),
            }
        }
        other => Ok(Some(other)),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 基于 reqwest 的 REST 客户端
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &HttpClientConfig, base_url: &str, auth_token: Option<String>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        if let Some(ua) = &config.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        let client = builder
            .build()
            .map_err(|e| SyncError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = base_url.trim_end_matches('/').to_string();
        info!("✅ HTTP 客户端已创建 (base_url: {})", base_url);
        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        let mut req = self.client.request(method, self.url(endpoint));
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// 发送请求并把非 2xx 转为 `SyncError::Http`；空响应体返回 `Value::Null`
    async fn execute(&self, req: RequestBuilder) -> Result<Value> {
        let response = req.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let mut message = String::from_utf8_lossy(&bytes).into_owned();
            if message.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            return Err(SyncError::Http {
                status: status.as_u16(),
                message,
            });
        }
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// 组装写请求；payload 非空时无论何种方法都带 JSON 请求体（DELETE 也靠它定位记录）
    fn write_request(
        &self,
        operation: OutboxOperation,
        endpoint: &str,
        payload: &Value,
        idempotency_key: Option<&str>,
    ) -> RequestBuilder {
        let method = match operation {
            OutboxOperation::Create => Method::POST,
            OutboxOperation::Update => Method::PATCH,
            OutboxOperation::Delete => Method::DELETE,
        };
        debug!("📤 {} {}", method, endpoint);

        let mut req = self.request(method, endpoint);
        if let Some(key) = idempotency_key {
            req = req.header(IDEMPOTENCY_HEADER, key);
        }
        if !payload.is_null() {
            req = req.json(payload);
        }
        req
    }
}

#[async_trait::async_trait]
impl RemoteApi for ApiClient {
    async fn fetch_collection(&self, collection: Collection) -> Result<Vec<Value>> {
        let endpoint = collection.endpoint().ok_or_else(|| {
            SyncError::InvalidArgument(format!("保留集合 {} 没有远端对应", collection))
        })?;
        debug!("📥 GET {}", endpoint);
        let body = self.execute(self.request(Method::GET, &endpoint)).await?;
        parse_collection_body(collection, body)
    }

    async fn send(
        &self,
        operation: OutboxOperation,
        endpoint: &str,
        payload: &Value,
        idempotency_key: Option<&str>,
    ) -> Result<Option<Value>> {
        let req = self.write_request(operation, endpoint, payload, idempotency_key);
        let body = self.execute(req).await.map_err(|e| {
            warn!("❌ 写请求失败 {} {}: {}", operation, endpoint, e);
            e
        })?;
        parse_write_body(body)
    }
}
