//! SQLite persistence for mcpd.
//!
//! The orchestrator components never reach into SQL directly; they consume
//! the [`Store`] trait, and [`Database`] is its SQLite implementation.
//! Schema is created on open, so a fresh database file is usable immediately.

pub mod types;

pub use types::*;

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

/// Persistence contract consumed by the orchestrator.
///
/// Injected as `Arc<dyn Store>` so tests can substitute doubles and the
/// orchestration logic stays independent of SQLite.
pub trait Store: Send + Sync {
    fn create_service(&self, id: &str, service: &NewService) -> Result<()>;
    fn get_service(&self, id: &str) -> Result<Option<ServiceDescriptor>>;
    fn list_services(&self) -> Result<Vec<ServiceDescriptor>>;
    fn update_service_status(&self, id: &str, status: ServiceStatus) -> Result<()>;
    fn delete_service(&self, id: &str) -> Result<()>;

    fn create_task(&self, task: &NewTask) -> Result<()>;
    fn get_task(&self, id: &str) -> Result<Option<Task>>;
    fn list_tasks(&self, limit: u32, offset: u32) -> Result<Vec<Task>>;
    fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<()>;

    fn append_task_log(&self, task_id: &str, level: LogLevel, message: &str) -> Result<()>;
    fn get_task_logs(&self, task_id: &str) -> Result<Vec<TaskLogEntry>>;

    fn upsert_connection(&self, record: &ConnectionRecord) -> Result<()>;
}

/// Database connection wrapper.
///
/// Thread-safe via internal Mutex. All database operations acquire the lock
/// for the duration of one statement; nothing awaits while holding it.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open database at a specific path, creating the schema if needed
    pub fn open_path(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(Error::Database)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (used by tests)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::Database)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Check database connectivity
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute_batch("SELECT 1").map_err(Error::Database)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS service_registry (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                version TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('active', 'inactive', 'error')),
                capabilities TEXT NOT NULL,
                launch TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_history (
                id TEXT PRIMARY KEY,
                service_id TEXT NOT NULL,
                instruction TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending', 'running', 'completed', 'failed')),
                context TEXT,
                result TEXT,
                progress INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                completed_at INTEGER,
                FOREIGN KEY (service_id) REFERENCES service_registry(id)
            );

            CREATE TABLE IF NOT EXISTS task_logs (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                level TEXT NOT NULL CHECK (level IN ('debug', 'info', 'warn', 'error')),
                message TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                FOREIGN KEY (task_id) REFERENCES task_history(id)
            );

            CREATE TABLE IF NOT EXISTS client_connections (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                client_name TEXT,
                client_version TEXT,
                platform TEXT,
                last_seen INTEGER NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('connected', 'disconnected')),
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_service_registry_status ON service_registry(status);
            CREATE INDEX IF NOT EXISTS idx_task_history_service_id ON task_history(service_id);
            CREATE INDEX IF NOT EXISTS idx_task_history_status ON task_history(status);
            CREATE INDEX IF NOT EXISTS idx_task_history_created_at ON task_history(created_at);
            CREATE INDEX IF NOT EXISTS idx_task_logs_task_id ON task_logs(task_id);
            CREATE INDEX IF NOT EXISTS idx_client_connections_client_id ON client_connections(client_id);",
        )?;
        Ok(())
    }

    fn map_service(row: &rusqlite::Row) -> rusqlite::Result<ServiceDescriptor> {
        let status: String = row.get(4)?;
        let capabilities: String = row.get(5)?;
        let launch: String = row.get(6)?;
        Ok(ServiceDescriptor {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            version: row.get(3)?,
            status: ServiceStatus::parse(&status)
                .ok_or_else(|| invalid_column(4, format!("unknown service status '{status}'")))?,
            capabilities: serde_json::from_str(&capabilities)
                .map_err(|e| invalid_column(5, e.to_string()))?,
            launch: serde_json::from_str(&launch).map_err(|e| invalid_column(6, e.to_string()))?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn map_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let status: String = row.get(3)?;
        let context: Option<String> = row.get(4)?;
        let result: Option<String> = row.get(5)?;
        let progress: i64 = row.get(6)?;
        Ok(Task {
            id: row.get(0)?,
            service_id: row.get(1)?,
            instruction: row.get(2)?,
            status: TaskStatus::parse(&status)
                .ok_or_else(|| invalid_column(3, format!("unknown task status '{status}'")))?,
            context: context
                .map(|c| serde_json::from_str(&c))
                .transpose()
                .map_err(|e| invalid_column(4, e.to_string()))?,
            result: result
                .map(|r| serde_json::from_str(&r))
                .transpose()
                .map_err(|e| invalid_column(5, e.to_string()))?,
            progress: progress.clamp(0, 100) as u8,
            error_message: row.get(7)?,
            created_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn map_task_log(row: &rusqlite::Row) -> rusqlite::Result<TaskLogEntry> {
        let level: String = row.get(2)?;
        Ok(TaskLogEntry {
            id: row.get(0)?,
            task_id: row.get(1)?,
            level: LogLevel::parse(&level)
                .ok_or_else(|| invalid_column(2, format!("unknown log level '{level}'")))?,
            message: row.get(3)?,
            timestamp: row.get(4)?,
        })
    }
}

fn invalid_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

const SERVICE_COLUMNS: &str =
    "id, name, description, version, status, capabilities, launch, created_at, updated_at";
const TASK_COLUMNS: &str = "id, service_id, instruction, status, context, result, progress, \
     error_message, created_at, completed_at";

impl Store for Database {
    fn create_service(&self, id: &str, service: &NewService) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO service_registry
             (id, name, description, version, status, capabilities, launch, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'inactive', ?5, ?6, ?7, ?7)",
            params![
                id,
                service.name,
                service.description,
                service.version,
                serde_json::to_string(&service.capabilities)?,
                serde_json::to_string(&service.launch)?,
                now,
            ],
        )?;
        Ok(())
    }

    fn get_service(&self, id: &str) -> Result<Option<ServiceDescriptor>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SERVICE_COLUMNS} FROM service_registry WHERE id = ?1"
        ))?;
        Ok(stmt.query_row(params![id], Self::map_service).optional()?)
    }

    fn list_services(&self) -> Result<Vec<ServiceDescriptor>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SERVICE_COLUMNS} FROM service_registry ORDER BY created_at"
        ))?;
        let services = stmt
            .query_map([], Self::map_service)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(services)
    }

    fn update_service_status(&self, id: &str, status: ServiceStatus) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "UPDATE service_registry SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )?;
        Ok(())
    }

    fn delete_service(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute("DELETE FROM service_registry WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn create_task(&self, task: &NewTask) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();
        let context = task
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO task_history
             (id, service_id, instruction, status, context, progress, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5)",
            params![task.id, task.service_id, task.instruction, context, now],
        )?;
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM task_history WHERE id = ?1"
        ))?;
        Ok(stmt.query_row(params![id], Self::map_task).optional()?)
    }

    fn list_tasks(&self, limit: u32, offset: u32) -> Result<Vec<Task>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM task_history
             ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let tasks = stmt
            .query_map(params![limit, offset], Self::map_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<()> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = patch.status {
            sets.push("status = ?");
            values.push(Box::new(status.as_str()));
        }
        if let Some(progress) = patch.progress {
            // Progress is monotonic non-decreasing for the lifetime of a task.
            sets.push("progress = MAX(progress, ?)");
            values.push(Box::new(i64::from(progress.min(100))));
        }
        if let Some(result) = &patch.result {
            sets.push("result = ?");
            values.push(Box::new(serde_json::to_string(result)?));
        }
        if let Some(message) = &patch.error_message {
            sets.push("error_message = ?");
            values.push(Box::new(message.clone()));
        }
        if let Some(at) = patch.completed_at {
            sets.push("completed_at = ?");
            values.push(Box::new(at));
        }
        if sets.is_empty() {
            return Ok(());
        }
        values.push(Box::new(id.to_string()));

        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let sql = format!("UPDATE task_history SET {} WHERE id = ?", sets.join(", "));
        conn.execute(&sql, rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))?;
        Ok(())
    }

    fn append_task_log(&self, task_id: &str, level: LogLevel, message: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO task_logs (id, task_id, level, message, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, task_id, level.as_str(), message, now],
        )?;
        Ok(())
    }

    fn get_task_logs(&self, task_id: &str) -> Result<Vec<TaskLogEntry>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, level, message, timestamp
             FROM task_logs WHERE task_id = ?1 ORDER BY timestamp",
        )?;
        let logs = stmt
            .query_map(params![task_id], Self::map_task_log)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    fn upsert_connection(&self, record: &ConnectionRecord) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO client_connections
             (id, client_id, client_name, client_version, platform, last_seen, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                client_id = excluded.client_id,
                client_name = excluded.client_name,
                client_version = excluded.client_version,
                platform = excluded.platform,
                last_seen = excluded.last_seen,
                status = excluded.status",
            params![
                record.id,
                record.client_id,
                record.client_name,
                record.client_version,
                record.platform,
                record.last_seen,
                record.status.as_str(),
                now,
            ],
        )?;
        Ok(())
    }
}
