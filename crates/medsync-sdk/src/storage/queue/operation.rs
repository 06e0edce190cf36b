//! 变更队列的操作记录
//!
//! 离线期间失败的写请求以带标签的操作变体落盘，外层套一个带版本号的信封，
//! 保证 schema 演进后旧记录仍然可解析。

use serde::{Deserialize, Serialize};

use crate::error::{MedsyncSDKError, Result};
use crate::resource::ResourceFamily;
use crate::transport::ApiRequest;

/// 当前落盘 schema 版本
pub const OPERATION_SCHEMA_VERSION: u32 = 1;

/// 操作类型（带显式字段的标签变体）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationKind {
    /// 新建实体
    Create { payload: serde_json::Value },
    /// 更新实体
    Update {
        entity_id: String,
        payload: serde_json::Value,
    },
    /// 删除实体
    Delete { entity_id: String },
    /// 其他写操作（方法与载荷原样透传）
    Custom {
        method: String,
        payload: Option<serde_json::Value>,
    },
}

impl OperationKind {
    /// 回放时使用的 HTTP 方法
    pub fn method(&self) -> &str {
        match self {
            OperationKind::Create { .. } => "POST",
            OperationKind::Update { .. } => "PUT",
            OperationKind::Delete { .. } => "DELETE",
            OperationKind::Custom { method, .. } => method,
        }
    }

    /// 回放时使用的请求体
    pub fn payload(&self) -> Option<&serde_json::Value> {
        match self {
            OperationKind::Create { payload } => Some(payload),
            OperationKind::Update { payload, .. } => Some(payload),
            OperationKind::Delete { .. } => None,
            OperationKind::Custom { payload, .. } => payload.as_ref(),
        }
    }
}

/// 排队中的变更操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// 单调递增 id（入队时由队列分配）
    pub id: u64,
    /// 目标端点（path + query，原样回放）
    pub endpoint: String,
    /// 操作内容
    pub kind: OperationKind,
    /// 原请求头（按原顺序原样回放）
    pub headers: Vec<(String, String)>,
    /// 所属资源族
    pub family: ResourceFamily,
    /// 入队时间（毫秒时间戳）
    pub enqueued_at: u64,
    /// 已尝试回放次数
    pub attempts: u32,
    /// 最近一次失败原因
    pub last_error: Option<String>,
}

impl QueuedOperation {
    /// 创建新的操作记录（id 与时间戳由队列在入队时填充）
    pub fn new(endpoint: impl Into<String>, kind: OperationKind) -> Self {
        let endpoint = endpoint.into();
        let family = ResourceFamily::from_path(&endpoint);
        Self {
            id: 0,
            endpoint,
            kind,
            headers: Vec::new(),
            family,
            enqueued_at: 0,
            attempts: 0,
            last_error: None,
        }
    }

    /// 附加请求头
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// 操作年龄（毫秒）
    pub fn age_ms(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis() as u64;
        now.saturating_sub(self.enqueued_at)
    }

    /// 是否超过最大存活时间
    pub fn is_older_than(&self, max_age_ms: u64) -> bool {
        self.age_ms() > max_age_ms
    }

    /// 记录一次失败尝试
    pub fn record_failure(&mut self, error: String) {
        self.attempts += 1;
        self.last_error = Some(error);
    }

    /// 构造回放请求 - 方法、路径、JSON 体和请求头与原始请求逐字节一致，
    /// 不追加幂等键（已知风险：服务端应答丢失时回放可能重复生效）
    pub fn to_request(&self) -> ApiRequest {
        let mut request = ApiRequest::new(self.kind.method(), &self.endpoint);
        request.headers = self.headers.clone();
        request.body = self.kind.payload().cloned();
        request
    }
}

/// 带版本号的落盘信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedOperation {
    pub schema_version: u32,
    pub operation: QueuedOperation,
}

impl VersionedOperation {
    pub fn wrap(operation: QueuedOperation) -> Self {
        Self {
            schema_version: OPERATION_SCHEMA_VERSION,
            operation,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| MedsyncSDKError::Serialization(format!("序列化操作记录失败: {}", e)))
    }

    /// 解析落盘记录，拒绝来自更新 schema 的记录
    pub fn decode(bytes: &[u8]) -> Result<QueuedOperation> {
        let envelope: VersionedOperation = serde_json::from_slice(bytes)
            .map_err(|e| MedsyncSDKError::Serialization(format!("解析操作记录失败: {}", e)))?;

        if envelope.schema_version > OPERATION_SCHEMA_VERSION {
            return Err(MedsyncSDKError::Serialization(format!(
                "操作记录 schema 版本过新: {} > {}",
                envelope.schema_version, OPERATION_SCHEMA_VERSION
            )));
        }

        Ok(envelope.operation)
    }
}
