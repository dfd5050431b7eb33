//! Audit Logger - 감사 로그 기록 및 조회
//!
//! SQLite 저장소가 없으면 tracing 으로만 남긴다.

use super::types::AuditEntry;
use crate::redact::redact;
use crate::storage::{AuditRecord, Storage};
use crate::Result;
use tracing::{info, warn};

/// 감사 로거
#[derive(Clone, Default)]
pub struct AuditLogger {
    storage: Option<Storage>,
}

impl AuditLogger {
    /// SQLite 에 기록하는 로거
    pub fn new(storage: Storage) -> Self {
        Self {
            storage: Some(storage),
        }
    }

    /// tracing 전용 로거 (테스트, 인메모리 구성용)
    pub fn tracing_only() -> Self {
        Self { storage: None }
    }

    /// 감사 로그 기록. 실패해도 호출자 흐름은 막지 않는다.
    pub fn log(&self, entry: AuditEntry) {
        let detail = entry.detail.as_ref().map(redact);

        info!(
            action = entry.action.as_str(),
            status = entry.status.as_str(),
            actor = %entry.actor,
            resource_type = %entry.resource_type,
            resource_id = entry.resource_id.as_deref().unwrap_or("-"),
            "audit"
        );

        let Some(storage) = &self.storage else {
            return;
        };

        let record = AuditRecord {
            id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: entry.timestamp.to_rfc3339(),
            action: entry.action.as_str().to_string(),
            resource_type: entry.resource_type,
            resource_id: entry.resource_id,
            actor: entry.actor,
            status: entry.status.as_str().to_string(),
            detail: detail.map(|d| d.to_string()),
        };

        if let Err(e) = storage.insert_audit(&record) {
            warn!(error = %e, "Failed to persist audit entry");
        }
    }

    /// 최근 감사 로그
    pub fn recent(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        match &self.storage {
            Some(storage) => storage.recent_audit(limit),
            None => Ok(Vec::new()),
        }
    }
}
