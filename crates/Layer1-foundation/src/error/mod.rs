//! Error types for Harbor
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Harbor 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 권한 / 확인 관련
    // ========================================================================
    #[error(
        "Action '{action}' requires secondary confirmation: set confirm=true or X-Confirm-Action: yes"
    )]
    ConfirmationMissing { action: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // ========================================================================
    // 저장소 관련
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // Task 관련
    // ========================================================================
    #[error("Task type not registered: {0}")]
    UnregisteredTaskType(String),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Only failed tasks can be retried (task {task_id} is {status})")]
    NotRetryable { task_id: String, status: String },

    #[error("Task not ready: {0}")]
    NotReady(String),

    #[error("Task queue is full ({0} queued)")]
    QueueFull(usize),

    #[error("{0}")]
    Handler(String),

    // ========================================================================
    // 실행 관련
    // ========================================================================
    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Http(_) | Error::Runtime(_) | Error::QueueFull(_)
        )
    }

    /// 사용자에게 보여줄 수 있는 에러인지 확인
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::ConfirmationMissing { .. }
                | Error::Forbidden(_)
                | Error::UnregisteredTaskType(_)
                | Error::NotRetryable { .. }
                | Error::NotReady(_)
                | Error::QueueFull(_)
                | Error::NotFound(_)
                | Error::InvalidInput(_)
        )
    }

    /// 확인 누락 에러 생성 헬퍼
    pub fn confirmation_missing(action: impl Into<String>) -> Self {
        Error::ConfirmationMissing {
            action: action.into(),
        }
    }

    /// 잘못된 상태 전이 에러 생성 헬퍼
    pub fn invalid_transition(
        task_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Error::InvalidTransition {
            task_id: task_id.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Handler 에러 생성 헬퍼
    pub fn handler(message: impl Into<String>) -> Self {
        Error::Handler(message.into())
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_message_names_action() {
        let err = Error::confirmation_missing("delete-workspace");
        assert_eq!(
            err.to_string(),
            "Action 'delete-workspace' requires secondary confirmation: set confirm=true or X-Confirm-Action: yes"
        );
        assert!(err.is_user_facing());
    }

    #[test]
    fn test_internal_errors_are_hidden() {
        let err = Error::invalid_transition("abc", "success", "running");
        assert!(!err.is_user_facing());
        assert!(!err.is_retryable());

        let err: Error = "boom".into();
        assert!(matches!(err, Error::Internal(_)));
    }
}
