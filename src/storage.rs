//! Persistence adapter: durable key-value contract and the per-project snapshot map stored on top of it.

use crate::engine::ProjectTimerState;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Ключ карты snapshot'ов таймеров проектов
pub const PROJECT_TIMERS_KEY: &str = "project_timers";
/// Ключ snapshot'а Pomodoro
pub const POMODORO_TIMER_KEY: &str = "pomodoro_timer";

/// Сколько раз SnapshotStore::update перечитывает карту при конфликте версий
const MAX_UPDATE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("version conflict on '{key}': expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("storage lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Значение из хранилища вместе с его версией
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub value: String,
    pub version: u64,
}

/// Долговременное key-value хранилище.
/// Версия отсутствующего ключа = 0; каждая успешная запись увеличивает версию на 1.
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<StoredItem>, StorageError>;

    /// Записать значение. `expected_version = Some(v)` - запись только если текущая версия равна v
    /// (иначе StorageError::Conflict). `None` - безусловная запись.
    fn set_item(
        &self,
        key: &str,
        value: &str,
        expected_version: Option<u64>,
    ) -> Result<u64, StorageError>;

    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory хранилище (тесты, запуск без БД)
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, StoredItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<StoredItem>, StorageError> {
        let items = self
            .items
            .lock()
            .map_err(|e| StorageError::LockPoisoned(e.to_string()))?;
        Ok(items.get(key).cloned())
    }

    fn set_item(
        &self,
        key: &str,
        value: &str,
        expected_version: Option<u64>,
    ) -> Result<u64, StorageError> {
        let mut items = self
            .items
            .lock()
            .map_err(|e| StorageError::LockPoisoned(e.to_string()))?;
        let current = items.get(key).map(|item| item.version).unwrap_or(0);
        if let Some(expected) = expected_version {
            if expected != current {
                return Err(StorageError::Conflict {
                    key: key.to_string(),
                    expected,
                    actual: current,
                });
            }
        }
        let version = current + 1;
        items.insert(
            key.to_string(),
            StoredItem {
                value: value.to_string(),
                version,
            },
        );
        Ok(version)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let mut items = self
            .items
            .lock()
            .map_err(|e| StorageError::LockPoisoned(e.to_string()))?;
        items.remove(key);
        Ok(())
    }
}

pub type SnapshotMap = BTreeMap<String, ProjectTimerState>;

/// Карта snapshot'ов вместе с версией, под которой она была прочитана
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionedSnapshots {
    pub version: u64,
    pub projects: SnapshotMap,
}

/// Репозиторий snapshot'ов таймеров: целиком читаем, целиком пишем
pub trait SnapshotRepository: Send + Sync {
    fn load(&self) -> Result<VersionedSnapshots, StorageError>;

    /// Записать карту, если её версия в хранилище не изменилась с момента load().
    /// Возвращает новую версию.
    fn save(&self, snapshots: &VersionedSnapshots) -> Result<u64, StorageError>;
}

/// SnapshotRepository поверх любого KeyValueStore (одна JSON-строка под PROJECT_TIMERS_KEY)
pub struct KvSnapshotRepository {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl KvSnapshotRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            key: PROJECT_TIMERS_KEY.to_string(),
        }
    }
}

impl SnapshotRepository for KvSnapshotRepository {
    fn load(&self) -> Result<VersionedSnapshots, StorageError> {
        let Some(item) = self.store.get_item(&self.key)? else {
            return Ok(VersionedSnapshots::default());
        };

        // GUARD: битый blob не должен ломать загрузку - копия под backup ключом, дальше пустая карта той же версии
        let projects = match serde_json::from_str::<SnapshotMap>(&item.value) {
            Ok(projects) => projects,
            Err(e) => {
                let backup_key = corrupted_backup_key(&self.key, item.version);
                warn!(
                    "[STORAGE] Failed to parse snapshot map (version {}): {}. Backing up to '{}', starting with empty map.",
                    item.version, e, backup_key
                );
                self.store.set_item(&backup_key, &item.value, None)?;
                SnapshotMap::new()
            }
        };

        Ok(VersionedSnapshots {
            version: item.version,
            projects,
        })
    }

    fn save(&self, snapshots: &VersionedSnapshots) -> Result<u64, StorageError> {
        let payload = serde_json::to_string(&snapshots.projects)?;
        self.store
            .set_item(&self.key, &payload, Some(snapshots.version))
    }
}

/// Ключ, под которым сохраняется нечитаемая карта (одна копия на версию)
pub fn corrupted_backup_key(key: &str, version: u64) -> String {
    format!("{}.corrupted.v{}", key, version)
}

/// Операции над картой snapshot'ов с явным разрешением конфликтов:
/// при конфликте версии карта перечитывается и изменение применяется заново (по проекту).
#[derive(Clone)]
pub struct SnapshotStore {
    repo: Arc<dyn SnapshotRepository>,
}

impl SnapshotStore {
    pub fn new(repo: Arc<dyn SnapshotRepository>) -> Self {
        Self { repo }
    }

    pub fn load_all(&self) -> Result<SnapshotMap, StorageError> {
        Ok(self.repo.load()?.projects)
    }

    pub fn get(&self, project_id: &str) -> Result<Option<ProjectTimerState>, StorageError> {
        Ok(self.repo.load()?.projects.get(project_id).cloned())
    }

    pub fn put(&self, project_id: &str, state: &ProjectTimerState) -> Result<(), StorageError> {
        self.update(|projects| {
            projects.insert(project_id.to_string(), state.clone());
            true
        })
    }

    pub fn remove(&self, project_id: &str) -> Result<(), StorageError> {
        // Запись даже без ключа: версия растёт, и параллельная запись того же проекта получит конфликт
        self.update(|projects| {
            projects.remove(project_id);
            true
        })
    }

    /// Read-modify-write с повтором при конфликте версий.
    /// `apply` вызывается заново на каждой попытке; false - изменений нет, запись пропускается.
    pub fn update<F>(&self, mut apply: F) -> Result<(), StorageError>
    where
        F: FnMut(&mut SnapshotMap) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut snapshots = self.repo.load()?;
            if !apply(&mut snapshots.projects) {
                debug!("[STORAGE] Snapshot map unchanged, write skipped");
                return Ok(());
            }

            match self.repo.save(&snapshots) {
                Ok(version) => {
                    debug!("[STORAGE] Snapshot map saved (version {})", version);
                    return Ok(());
                }
                Err(StorageError::Conflict {
                    key,
                    expected,
                    actual,
                }) if attempt < MAX_UPDATE_ATTEMPTS => {
                    warn!(
                        "[STORAGE] Snapshot map '{}' changed by another writer ({} → {}), re-applying (attempt {})",
                        key, expected, actual, attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
