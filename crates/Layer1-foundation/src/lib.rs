//! # harbor-foundation
//!
//! Foundation layer for Harbor:
//! - Error: 중앙 에러 타입 (`Error`, `Result`)
//! - Config: 통합 설정 (HarborConfig, JSON + 환경 변수)
//! - Storage: SQLite (작업, 감사 로그), JsonStore (범용)
//! - Permission: 위험 작업 2차 확인 (Confirmation Gate)
//! - Redact: 비밀값 마스킹
//! - Audit: 감사 로깅
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  HTTP 요청                                               │
//! │     │                                                   │
//! │     ▼                                                   │
//! │  Confirmation Gate ──(거부)──► ConfirmationMissing       │
//! │     │                                                   │
//! │     ▼                                                   │
//! │  Task Store (SQLite) ◄── Audit Logger (redacted)        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod permission;
pub mod redact;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{HarborConfig, DEFAULT_ACTOR_HEADER, DEFAULT_WORKERS, HARBOR_CONFIG_FILE};

// ============================================================================
// Permission (2차 확인)
// ============================================================================
pub use permission::{
    require_confirmation, Confirmation, DangerousAction, CONFIRM_HEADER, CONFIRM_HEADER_VALUE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::{
    // JSON (범용)
    JsonStore,
    // SQLite (런타임 데이터)
    AuditRecord,
    Storage,
    TaskOutcomeRecord,
    TaskQuery,
    TaskRecord,
};

// ============================================================================
// Audit (감사 로깅)
// ============================================================================
pub use audit::{AuditAction, AuditEntry, AuditLogger, AuditStatus};

// ============================================================================
// Redact (마스킹)
// ============================================================================
pub use redact::{is_sensitive_key, mask_secrets, redact, redact_in_place, MASK};
