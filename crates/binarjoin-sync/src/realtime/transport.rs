//! 推送传输层
//!
//! - [`WebSocketTransport`]：首选，tokio-tungstenite
//! - [`PollingTransport`]：WebSocket 不可用时的 HTTP 长轮询回退
//!
//! 连接只负责产出原始文本消息，解析和分发在桥接层完成。

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// 建立连接的超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait::async_trait]
pub trait PushTransport: Send + Sync {
    /// 建立一条新连接
    async fn connect(&self) -> Result<Box<dyn PushConnection>>;

    fn name(&self) -> &'static str;
}

#[async_trait::async_trait]
pub trait PushConnection: Send {
    /// 下一条文本消息；对端正常关闭时返回 `Ok(None)`，连接异常时返回 `ChannelDropped`
    async fn next_message(&mut self) -> Result<Option<String>>;

    async fn close(&mut self);
}

// ========== WebSocket ==========

pub struct WebSocketTransport {
    url: String,
    auth_token: Option<String>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            url: url.into(),
            auth_token,
        }
    }
}

#[async_trait::async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn PushConnection>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::Config(format!("无效的 WebSocket 地址 {}: {}", self.url, e)))?;
        if let Some(token) = &self.auth_token {
            let value: HeaderValue = format!("Bearer {}", token)
                .parse()
                .map_err(|_| SyncError::Config("auth token 含有非法字符".to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => return Err(SyncError::ChannelDropped(format!("WebSocket 连接失败: {}", e))),
            Err(_) => return Err(SyncError::Timeout(format!("WebSocket 连接超时: {}", self.url))),
        };
        info!("🔌 WebSocket 已连接: {}", self.url);
        Ok(Box::new(WebSocketConnection { stream }))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait::async_trait]
impl PushConnection for WebSocketConnection {
    async fn next_message(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => warn!("⚠️ 忽略非 UTF-8 二进制消息"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket 对端关闭: {:?}", frame);
                    return Ok(None);
                }
                // ping/pong 由 tungstenite 处理
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SyncError::ChannelDropped(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("关闭 WebSocket 时出错（忽略）: {}", e);
        }
    }
}

// ========== HTTP 长轮询 ==========

/// 长轮询回退：`GET <poll_url>?cursor=<cursor>`，响应为 `{messages, cursor}` 或消息数组
pub struct PollingTransport {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
    poll_timeout: Duration,
}

impl PollingTransport {
    pub fn new(url: impl Into<String>, auth_token: Option<String>, poll_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Config(format!("创建长轮询客户端失败: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            auth_token,
            poll_timeout,
        })
    }
}

#[async_trait::async_trait]
impl PushTransport for PollingTransport {
    async fn connect(&self) -> Result<Box<dyn PushConnection>> {
        let mut connection = PollingConnection {
            client: self.client.clone(),
            url: self.url.clone(),
            auth_token: self.auth_token.clone(),
            // 服务端持有请求的时间 + 余量
            request_timeout: self.poll_timeout + Duration::from_secs(5),
            cursor: None,
            buffer: VecDeque::new(),
        };
        // 首次请求成功才算连上
        connection.poll_once().await?;
        info!("🔌 长轮询已连接: {}", self.url);
        Ok(Box::new(connection))
    }

    fn name(&self) -> &'static str {
        "long-poll"
    }
}

struct PollingConnection {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
    request_timeout: Duration,
    cursor: Option<String>,
    buffer: VecDeque<String>,
}

impl PollingConnection {
    async fn poll_once(&mut self) -> Result<()> {
        let mut req = self.client.get(&self.url).timeout(self.request_timeout);
        if let Some(cursor) = &self.cursor {
            req = req.query(&[("cursor", cursor)]);
        }
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| SyncError::ChannelDropped(format!("长轮询请求失败: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::ChannelDropped(format!("长轮询返回 HTTP {}", status.as_u16())));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| SyncError::ChannelDropped(format!("长轮询响应无法解析: {}", e)))?;

        let (messages, cursor) = split_poll_body(body);
        if cursor.is_some() {
            self.cursor = cursor;
        }
        self.buffer.extend(messages);
        Ok(())
    }
}

#[async_trait::async_trait]
impl PushConnection for PollingConnection {
    async fn next_message(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(message) = self.buffer.pop_front() {
                return Ok(Some(message));
            }
            self.poll_once().await?;
        }
    }

    async fn close(&mut self) {
        self.buffer.clear();
    }
}

/// 拆分长轮询响应为消息文本与新游标
pub(crate) fn split_poll_body(body: Value) -> (Vec<String>, Option<String>) {
    let (messages, cursor) = match body {
        Value::Array(items) => (items, None),
        Value::Object(mut map) => {
            let cursor = match map.remove("cursor") {
                Some(Value::String(s)) => Some(s),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            };
            let items = match map.remove("messages") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            (items, cursor)
        }
        _ => (Vec::new(), None),
    };
    let messages = messages
        .into_iter()
        .map(|m| match m {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect();
    (messages, cursor)
}
