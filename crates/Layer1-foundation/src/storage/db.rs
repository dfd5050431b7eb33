//! SQLite Storage for runtime data
//!
//! 런타임 데이터 저장:
//! - Tasks: 비동기 작업 기록 (삭제하지 않음)
//! - Audit Log: 작업 생성/재시도 감사 기록
//!
//! 설정 데이터는 JSON (storage/json.rs)에서 관리
//!
//! ## Migration System
//!
//! Database schema is versioned. Migrations run automatically on startup.
//! - Version 1: Initial schema (tasks, audit_log)
//! - Version 2: Index tasks by retry lineage and resource

use crate::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 2;

const TASK_COLUMNS: &str = "id, task_type, status, resource_type, resource_id, params, \
     result, error, retry_of, created_by, created_at, started_at, finished_at";

/// Storage service for persisting runtime data
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) a database file
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Storage(format!("Failed to create data directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        storage.initialize_schema()?;
        storage.run_migrations()?;

        info!(db_path = %db_path.display(), "Storage opened");
        Ok(storage)
    }

    /// Create an in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        storage.initialize_schema()?;
        storage.run_migrations()?;

        Ok(storage)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    /// Get current schema version from database
    pub fn get_schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;

        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to get schema version: {}", e)))
    }

    /// Initialize database schema (base tables)
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Tasks table
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('queued', 'running', 'success', 'failed')),
                resource_type TEXT,
                resource_id TEXT,
                params TEXT NOT NULL,
                result TEXT,
                error TEXT,
                retry_of TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_created
                ON tasks(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_tasks_status
                ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_type
                ON tasks(task_type);

            -- Audit log
            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT,
                actor TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_audit_timestamp
                ON audit_log(timestamp DESC);

            -- Insert initial schema version if not exists
            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Run all pending migrations
    fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version()?;

        if current_version >= CURRENT_SCHEMA_VERSION {
            debug!(
                "Database schema is up to date (version {})",
                current_version
            );
            return Ok(());
        }

        info!(
            "Running database migrations from version {} to {}",
            current_version, CURRENT_SCHEMA_VERSION
        );

        let conn = self.lock()?;

        // Run migrations sequentially
        for version in (current_version + 1)..=CURRENT_SCHEMA_VERSION {
            match version {
                2 => Self::migrate_v2(&conn)?,
                _ => {
                    warn!("Unknown migration version: {}", version);
                }
            }

            // Record migration
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                params![version],
            )
            .map_err(|e| Error::Storage(format!("Failed to record migration: {}", e)))?;

            info!("Applied migration to version {}", version);
        }

        Ok(())
    }

    fn migrate_v2(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_retry_of
                ON tasks(retry_of);
            CREATE INDEX IF NOT EXISTS idx_tasks_resource
                ON tasks(resource_type, resource_id);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Migration v2 failed: {}", e)))
    }

    // ========== Task Methods ==========

    /// Insert a new task row
    pub fn insert_task(&self, task: &TaskRecord) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.task_type,
                task.status,
                task.resource_type,
                task.resource_id,
                task.params,
                task.result,
                task.error,
                task.retry_of,
                task.created_by,
                task.created_at,
                task.started_at,
                task.finished_at,
            ],
        )
        .map_err(|e| Error::Storage(format!("Failed to insert task: {}", e)))?;

        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.lock()?;

        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            TaskRecord::from_row,
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to get task: {}", e)))
    }

    /// List tasks, newest first
    pub fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>> {
        let conn = self.lock()?;

        let mut sql = format!("SELECT {} FROM tasks WHERE 1 = 1", TASK_COLUMNS);
        let mut args: Vec<String> = Vec::new();

        let filters = [
            ("status", &query.status),
            ("task_type", &query.task_type),
            ("resource_type", &query.resource_type),
            ("resource_id", &query.resource_id),
            ("created_by", &query.created_by),
        ];
        for (column, value) in filters {
            if let Some(value) = value {
                args.push(value.clone());
                sql.push_str(&format!(" AND {} = ?{}", column, args.len()));
            }
        }

        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let tasks = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), TaskRecord::from_row)
            .map_err(|e| Error::Storage(format!("Failed to query tasks: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Storage(format!("Failed to read task row: {}", e)))?;

        Ok(tasks)
    }

    /// Ids with the given status, oldest first
    pub fn task_ids_with_status(&self, status: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare("SELECT id FROM tasks WHERE status = ?1 ORDER BY created_at ASC, rowid ASC")
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let ids = stmt
            .query_map(params![status], |row| row.get(0))
            .map_err(|e| Error::Storage(format!("Failed to query task ids: {}", e)))?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(|e| Error::Storage(format!("Failed to read task id: {}", e)))?;

        Ok(ids)
    }

    /// `queued -> running`. Returns false if the row was not queued.
    pub fn mark_task_started(&self, id: &str, started_at: &str) -> Result<bool> {
        let conn = self.lock()?;

        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'running', started_at = ?2 \
                 WHERE id = ?1 AND status = 'queued'",
                params![id, started_at],
            )
            .map_err(|e| Error::Storage(format!("Failed to start task: {}", e)))?;

        Ok(changed == 1)
    }

    /// `running -> success|failed`. Returns false if the row was not running.
    pub fn mark_task_finished(&self, id: &str, outcome: &TaskOutcomeRecord) -> Result<bool> {
        let conn = self.lock()?;

        let changed = conn
            .execute(
                "UPDATE tasks SET status = ?2, result = ?3, error = ?4, finished_at = ?5 \
                 WHERE id = ?1 AND status = 'running'",
                params![
                    id,
                    outcome.status,
                    outcome.result,
                    outcome.error,
                    outcome.finished_at
                ],
            )
            .map_err(|e| Error::Storage(format!("Failed to finish task: {}", e)))?;

        Ok(changed == 1)
    }

    pub fn count_tasks(&self) -> Result<i64> {
        let conn = self.lock()?;

        conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .map_err(|e| Error::Storage(format!("Failed to count tasks: {}", e)))
    }

    // ========== Audit Methods ==========

    pub fn insert_audit(&self, record: &AuditRecord) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            r#"
            INSERT INTO audit_log (id, timestamp, action, resource_type, resource_id, actor, status, detail)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.id,
                record.timestamp,
                record.action,
                record.resource_type,
                record.resource_id,
                record.actor,
                record.status,
                record.detail,
            ],
        )
        .map_err(|e| Error::Storage(format!("Failed to write audit log: {}", e)))?;

        Ok(())
    }

    /// Most recent audit rows, newest first
    pub fn recent_audit(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, timestamp, action, resource_type, resource_id, actor, status, detail
                FROM audit_log ORDER BY timestamp DESC, rowid DESC LIMIT ?1
                "#,
            )
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(AuditRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    action: row.get(2)?,
                    resource_type: row.get(3)?,
                    resource_id: row.get(4)?,
                    actor: row.get(5)?,
                    status: row.get(6)?,
                    detail: row.get(7)?,
                })
            })
            .map_err(|e| Error::Storage(format!("Failed to query audit log: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Storage(format!("Failed to read audit row: {}", e)))?;

        Ok(rows)
    }
}

// ============================================================================
// Records
// ============================================================================

/// Raw task row. JSON columns are kept as text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub task_type: String,
    pub status: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub params: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_of: Option<String>,
    pub created_by: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl TaskRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            status: row.get(2)?,
            resource_type: row.get(3)?,
            resource_id: row.get(4)?,
            params: row.get(5)?,
            result: row.get(6)?,
            error: row.get(7)?,
            retry_of: row.get(8)?,
            created_by: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            finished_at: row.get(12)?,
        })
    }
}

/// Terminal update for a running task
#[derive(Debug, Clone, Default)]
pub struct TaskOutcomeRecord {
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub finished_at: String,
}

/// Filter for task listing
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub created_by: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub timestamp: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub actor: String,
    pub status: String,
    pub detail: Option<String>,
}
