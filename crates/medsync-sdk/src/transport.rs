//! HTTP 传输层
//!
//! 引擎通过 HttpTransport trait 访问远端服务，生产实现基于 reqwest。
//! 回放的请求不做任何改写：方法、路径、JSON 体、请求头与原始请求一致，
//! 也不追加幂等键：服务端应答丢失时回放可能重复生效，这是已记录的取舍。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MedsyncSDKError, Result};
use crate::sdk::HttpClientConfig;

/// 发往远端服务的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// HTTP 方法
    pub method: String,
    /// 路径（含 query，相对于 base_url）
    pub path: String,
    /// 请求头
    pub headers: Vec<(String, String)>,
    /// JSON 请求体
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }
}

/// 远端服务的响应
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// HTTP 传输 trait
///
/// 传输层只在网络层面失败时返回 Err（连接失败、超时等）；
/// 4xx/5xx 正常返回 ApiResponse，由上层策略分类处理。
#[async_trait]
pub trait HttpTransport: Send + Sync + std::fmt::Debug {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

/// 基于 reqwest 的生产实现
#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, config: &HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| MedsyncSDKError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| MedsyncSDKError::InvalidOperation(format!("非法 HTTP 方法: {}", e)))?;
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), request.path);

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                MedsyncSDKError::Timeout(format!("请求超时: {}", e))
            } else {
                MedsyncSDKError::Connectivity(format!("请求失败: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        // 空响应体或非 JSON 响应按 Null 处理
        let body = response.json().await.unwrap_or(serde_json::Value::Null);

        debug!("{} {} -> {}", request.method, request.path, status);

        Ok(ApiResponse { status, body })
    }
}
