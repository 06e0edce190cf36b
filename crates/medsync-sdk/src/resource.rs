//! 资源族定义
//!
//! 资源族是按后端实体类型划分的缓存/队列分区。对某个资源族的变更，
//! 会连带失效由它派生的资源族（例如修改药品后，用药计划需要重新计算）。

use serde::{Deserialize, Serialize};

/// 资源族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceFamily {
    /// 药品
    Medications,
    /// 用药计划（由药品状态派生）
    Schedule,
    /// 提醒通知
    Notifications,
    /// 静态资源（页面、脚本等）
    StaticAssets,
}

impl ResourceFamily {
    /// 所有动态 API 资源族（不含静态资源）
    pub const DYNAMIC: [ResourceFamily; 3] = [
        ResourceFamily::Medications,
        ResourceFamily::Schedule,
        ResourceFamily::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceFamily::Medications => "medications",
            ResourceFamily::Schedule => "schedule",
            ResourceFamily::Notifications => "notifications",
            ResourceFamily::StaticAssets => "static",
        }
    }

    /// 根据请求路径判断所属资源族
    ///
    /// `/api/medications...` 等动态路径归入对应资源族，其余路径视为静态资源。
    pub fn from_path(path: &str) -> Self {
        let path = path.split('?').next().unwrap_or(path);
        if path.starts_with("/api/medications") {
            ResourceFamily::Medications
        } else if path.starts_with("/api/schedule") {
            ResourceFamily::Schedule
        } else if path.starts_with("/api/notifications") {
            ResourceFamily::Notifications
        } else {
            ResourceFamily::StaticAssets
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, ResourceFamily::StaticAssets)
    }

    /// 由本资源族派生的资源族（变更时需要连带失效）
    ///
    /// 用药计划由药品状态计算得出，所以药品变更会使计划缓存失效。
    pub fn derived_families(&self) -> &'static [ResourceFamily] {
        match self {
            ResourceFamily::Medications => &[ResourceFamily::Schedule],
            _ => &[],
        }
    }

    /// 离线兜底数据
    ///
    /// 读取失败且无缓存时返回给调用方，避免把失败抛给 UI：
    /// 集合类资源返回空集合，汇总类资源返回清零的汇总。
    pub fn fallback_payload(&self) -> serde_json::Value {
        match self {
            ResourceFamily::Medications => serde_json::json!([]),
            ResourceFamily::Schedule => serde_json::json!({
                "entries": [],
                "doses_due": 0,
                "next_dose_at": null,
            }),
            ResourceFamily::Notifications => serde_json::json!([]),
            ResourceFamily::StaticAssets => serde_json::Value::Null,
        }
    }

    /// 默认缓存 TTL（毫秒）
    pub fn default_ttl_ms(&self) -> u64 {
        match self {
            ResourceFamily::StaticAssets => 86_400_000, // 24 小时
            _ => 300_000,                               // 5 分钟
        }
    }
}

impl std::fmt::Display for ResourceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_path() {
        assert_eq!(
            ResourceFamily::from_path("/api/medications"),
            ResourceFamily::Medications
        );
        assert_eq!(
            ResourceFamily::from_path("/api/medications/42"),
            ResourceFamily::Medications
        );
        assert_eq!(
            ResourceFamily::from_path("/api/schedule?day=today"),
            ResourceFamily::Schedule
        );
        assert_eq!(
            ResourceFamily::from_path("/api/notifications"),
            ResourceFamily::Notifications
        );
        assert_eq!(
            ResourceFamily::from_path("/index.html"),
            ResourceFamily::StaticAssets
        );
    }

    #[test]
    fn test_derived_families() {
        // 药品变更会派生失效用药计划
        assert_eq!(
            ResourceFamily::Medications.derived_families(),
            &[ResourceFamily::Schedule]
        );
        assert!(ResourceFamily::Schedule.derived_families().is_empty());
        assert!(ResourceFamily::Notifications.derived_families().is_empty());
    }

    #[test]
    fn test_fallback_payload_shape() {
        assert!(ResourceFamily::Medications.fallback_payload().is_array());
        let schedule = ResourceFamily::Schedule.fallback_payload();
        assert_eq!(schedule["doses_due"], 0);
        assert!(schedule["entries"].as_array().unwrap().is_empty());
    }
}
