//! Audit System - 감사 로깅 시스템
//!
//! 작업 생성, 재시도, 확인 거부 같은 운영자 행위를 기록합니다.
//! 상세 데이터는 기록 전에 비밀값이 마스킹됩니다.
//!
//! ## 사용법
//!
//! ```ignore
//! use harbor_foundation::audit::{AuditAction, AuditEntry, AuditLogger, AuditStatus};
//!
//! let logger = AuditLogger::new(storage);
//! logger.log(
//!     AuditEntry::new(AuditAction::TaskRetry, "admin")
//!         .with_resource("task", Some(original_id))
//!         .with_detail(json!({"new_task_id": new_id})),
//! );
//! ```

pub mod logger;
pub mod types;

// Re-exports
pub use logger::AuditLogger;
pub use types::{AuditAction, AuditEntry, AuditStatus};
