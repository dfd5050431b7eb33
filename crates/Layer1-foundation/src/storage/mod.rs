//! Storage module for Harbor
//!
//! - `db`: SQLite - 런타임 데이터 (작업, 감사 로그)
//! - `json`: JSON - 설정 파일 저장/로드

mod db;
mod json;

// SQLite Storage (런타임 데이터)
pub use db::{AuditRecord, Storage, TaskOutcomeRecord, TaskQuery, TaskRecord};

// JSON Storage (범용)
pub use json::JsonStore;
