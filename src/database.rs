use crate::storage::{KeyValueStore, StorageError, StoredItem};
use chrono::Utc;
use rusqlite::Error::InvalidParameterName;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

/// Log IO-related DB errors for easier diagnosis (disk full, permission denied).
/// Does not change error propagation - caller still returns Err.
fn log_io_error_if_any(context: &str, e: &rusqlite::Error) {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => {
                error!(
                    "[DB] {}: Disk full. Free space on drive or check data directory.",
                    context
                );
            }
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                error!(
                    "[DB] {}: Permission denied or read-only. Check data directory is writable.",
                    context
                );
            }
            ErrorCode::SystemIoFailure => {
                error!("[DB] {}: I/O error. Check disk and permissions.", context);
            }
            _ => {}
        }
    }
}

/// Проверка, что ошибка открытия БД означает повреждение файла (для backup + retry при старте)
pub fn is_corruption_error(e: &rusqlite::Error) -> bool {
    let text = e.to_string().to_lowercase();
    text.contains("corruption") || text.contains("integrity") || text.contains("not a database")
}

/// Локальная SQLite база: durable key-value хранилище snapshot'ов и служебных значений
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Безопасная блокировка соединения с обработкой poisoned mutex
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, rusqlite::Error> {
        self.conn.lock().map_err(|e| {
            InvalidParameterName(format!(
                "Database mutex poisoned: {}. A panic occurred while holding the lock. \
                 Please restart the application to recover.",
                e
            ))
        })
    }

    pub fn new(db_path: &str) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// БД в памяти (тесты, временные сессии)
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        // GUARD: Integrity check on startup - detect corruption before init
        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|e| InvalidParameterName(format!("Integrity check failed: {}", e)))?;
        if integrity.to_lowercase() != "ok" {
            return Err(InvalidParameterName(format!(
                "Database corruption detected: {}",
                integrity
            )));
        }

        // WAL: не критично, продолжаем с режимом по умолчанию
        if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
            warn!(
                "[DB] Failed to enable WAL mode: {}. Continuing with default journal mode.",
                e
            );
        }
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Current schema version (PRAGMA user_version). Bump when adding migrations.
    const SCHEMA_VERSION: i32 = 2;

    /// Versioned migrations using SQLite user_version pragma.
    fn run_migrations(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let current: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if current < 1 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
                [],
            )?;
        }
        // Migration 2: optimistic version per key
        if current < 2 {
            let _ = conn.execute(
                "ALTER TABLE kv_store ADD COLUMN version INTEGER NOT NULL DEFAULT 1",
                [],
            );
        }

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;
        Ok(())
    }

    fn current_version(conn: &Connection, key: &str) -> SqliteResult<u64> {
        let version: Option<i64> = conn
            .query_row(
                "SELECT version FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v.max(0) as u64).unwrap_or(0))
    }

    /// Записать значение в транзакции с проверкой версии.
    /// Ok(Err((expected, actual))) - конфликт версий, транзакция откатывается.
    fn write_versioned(
        &self,
        key: &str,
        value: &str,
        expected_version: Option<u64>,
    ) -> SqliteResult<Result<u64, (u64, u64)>> {
        let conn = self.lock_conn()?;
        let now = Utc::now().timestamp();

        // BEGIN IMMEDIATE: write lock берётся сразу, чтение версии и запись атомарны
        conn.execute("BEGIN IMMEDIATE TRANSACTION", []).map_err(|e| {
            log_io_error_if_any("write_versioned begin", &e);
            error!("[DB] Failed to begin transaction: {}", e);
            e
        })?;

        let current = match Self::current_version(&conn, key) {
            Ok(v) => v,
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                return Err(e);
            }
        };

        if let Some(expected) = expected_version {
            if expected != current {
                let _ = conn.execute("ROLLBACK", []);
                return Ok(Err((expected, current)));
            }
        }

        let next = current + 1;
        let result = conn.execute(
            "INSERT INTO kv_store (key, value, updated_at, version)
     VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT(key) DO UPDATE SET
        value = ?2,
        updated_at = ?3,
        version = ?4",
            params![key, value, now, next as i64],
        );

        match result {
            Ok(_) => {
                conn.execute("COMMIT", []).map_err(|e| {
                    log_io_error_if_any("write_versioned commit", &e);
                    error!("[DB] Failed to commit transaction: {}", e);
                    let _ = conn.execute("ROLLBACK", []);
                    e
                })?;
                Ok(Ok(next))
            }
            Err(e) => {
                log_io_error_if_any("write_versioned", &e);
                error!("[DB] Failed to write key '{}': {}. Rolling back transaction.", key, e);
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Очистить все локальные данные (смена пользователя)
    pub fn clear_user_data(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM kv_store", [])?;
        Ok(())
    }
}

impl KeyValueStore for Database {
    fn get_item(&self, key: &str) -> Result<Option<StoredItem>, StorageError> {
        let conn = self.lock_conn()?;
        let item = conn
            .query_row(
                "SELECT value, version FROM kv_store WHERE key = ?1",
                params![key],
                |row| {
                    Ok(StoredItem {
                        value: row.get(0)?,
                        version: row.get::<_, i64>(1)?.max(0) as u64,
                    })
                },
            )
            .optional()?;
        Ok(item)
    }

    fn set_item(
        &self,
        key: &str,
        value: &str,
        expected_version: Option<u64>,
    ) -> Result<u64, StorageError> {
        match self.write_versioned(key, value, expected_version)? {
            Ok(version) => Ok(version),
            Err((expected, actual)) => Err(StorageError::Conflict {
                key: key.to_string(),
                expected,
                actual,
            }),
        }
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])
            .map_err(|e| {
                log_io_error_if_any("remove_item", &e);
                e
            })?;
        Ok(())
    }
}
