//! Audit Log Types - 감사 로그 타입 정의

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Audit Action Type
// ============================================================================

/// 감사 대상 액션 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    /// 작업 생성
    #[serde(rename = "task.enqueue")]
    TaskEnqueue,
    /// 작업 재시도
    #[serde(rename = "task.retry")]
    TaskRetry,
    /// 확인 누락으로 거부
    #[serde(rename = "task.confirmation_rejected")]
    ConfirmationRejected,
    /// 재시작 시 중단된 작업 정리
    #[serde(rename = "task.recovered")]
    TaskRecovered,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskEnqueue => "task.enqueue",
            Self::TaskRetry => "task.retry",
            Self::ConfirmationRejected => "task.confirmation_rejected",
            Self::TaskRecovered => "task.recovered",
        }
    }
}

// ============================================================================
// Audit Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Denied,
    Failed,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Failed => "failed",
        }
    }
}

// ============================================================================
// Audit Entry
// ============================================================================

/// 감사 로그 엔트리
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// 발생 시간
    pub timestamp: DateTime<Utc>,

    /// 액션 타입
    pub action: AuditAction,

    /// 결과
    pub status: AuditStatus,

    /// 액터 (요청 사용자)
    pub actor: String,

    /// 대상 종류 (task, image, container ...)
    pub resource_type: String,

    /// 대상 ID
    pub resource_id: Option<String>,

    /// 추가 데이터
    pub detail: Option<Value>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, actor: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            status: AuditStatus::Success,
            actor: actor.into(),
            resource_type: "task".to_string(),
            resource_id: None,
            detail: None,
        }
    }

    pub fn with_status(mut self, status: AuditStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: Option<String>,
    ) -> Self {
        self.resource_type = resource_type.into();
        self.resource_id = resource_id;
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}
