use crate::api::TimeTrackerApi;
use crate::clock::Clock;
use crate::notifications::Notifier;
use crate::recorder::EntryRecorder;
use crate::storage::{SnapshotStore, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
mod core;
mod db;
mod ticker;

pub use ticker::TickHandle;

/// Параметры engine, которые тесты подменяют
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub quick_toggle_ms: u64,
    pub tick_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            quick_toggle_ms: crate::config::QUICK_TOGGLE_THRESHOLD_MS,
            tick_interval: crate::config::TICK_INTERVAL,
        }
    }
}

/// Timer Engine - строгая FSM для активного проекта
/// Все переходы атомарны через один Mutex; I/O (API, хранилище) - только после освобождения lock
pub struct TimerEngine {
    /// Активный проект и его таймер - единственный источник истины
    pub(crate) state: Mutex<EngineState>,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) recorder: EntryRecorder,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) api: Arc<dyn TimeTrackerApi>,
    pub(crate) clock: Arc<dyn Clock>,
    /// Тик-драйвер: жив только пока активный таймер RUNNING
    pub(crate) ticker: Mutex<Option<TickHandle>>,
    pub(crate) options: EngineOptions,
    /// Счётчик тиков (диагностика, тесты)
    pub(crate) ticks: AtomicU64,
    pub(crate) self_ref: Weak<TimerEngine>,
}

#[derive(Debug, Default)]
pub(crate) struct EngineState {
    pub(crate) active: Option<ActiveProject>,
    pub(crate) timer: ProjectTimerState,
    /// Номер перехода. Snapshot, снятый под lock, пишется только если номер не изменился.
    pub(crate) generation: u64,
}

impl EngineState {
    /// Отметить переход; возвращает новый номер
    pub(crate) fn bump(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveProject {
    pub id: String,
    pub name: String,
}

/// Состояние таймера - взаимоисключающие фазы, "running и paused одновременно" непредставимо
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerStatus {
    #[default]
    Idle,
    Running,
    Paused,
}

/// Snapshot таймера одного проекта (сериализуется в durable map)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectTimerState {
    pub status: TimerStatus,
    /// Unix ms начала текущего running сегмента (0 если не RUNNING)
    pub start_time: i64,
    pub elapsed_time: u64,
    pub paused_elapsed_time: u64,
    pub work_type_id: Option<String>,
    pub work_type_name: String,
    pub last_hour_mark: u64,
    #[serde(rename = "last15MinMark")]
    pub last_15_min_mark: u64,
    pub time_limit: Option<u64>,
    /// Часть elapsed_time, уже записанная как time entry
    pub recorded_elapsed: u64,
}

impl ProjectTimerState {
    pub fn is_running(&self) -> bool {
        self.status == TimerStatus::Running
    }

    pub fn is_paused(&self) -> bool {
        self.status == TimerStatus::Paused
    }

    pub fn is_idle(&self) -> bool {
        self.status == TimerStatus::Idle
    }

    /// Elapsed с учётом текущего момента (для RUNNING - now - start_time)
    pub fn live_elapsed(&self, now_ms: i64) -> u64 {
        match self.status {
            TimerStatus::Running => {
                // Clock skew (now < start_time): не уменьшаем elapsed
                let live = now_ms.saturating_sub(self.start_time).max(0) as u64;
                live.max(self.elapsed_time)
            }
            TimerStatus::Paused | TimerStatus::Idle => self.elapsed_time,
        }
    }

    /// Ещё не записанная часть elapsed
    pub fn unrecorded_elapsed(&self) -> u64 {
        self.elapsed_time.saturating_sub(self.recorded_elapsed)
    }
}

/// Ответ для UI / команд - текущее состояние активного таймера
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerStateResponse {
    pub project: Option<ActiveProject>,
    pub status: TimerStatus,
    pub elapsed_ms: u64,
    pub formatted: String,
    pub work_type_id: Option<String>,
    pub work_type_name: String,
    pub time_limit_ms: Option<u64>,
    pub last_hour_mark: u64,
    pub last_15_min_mark: u64,
    pub daily_total_ms: Option<u64>,
}

/// Результат одного тика running таймера
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub project_id: String,
    pub elapsed_ms: u64,
    pub formatted: String,
}

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("no project selected")]
    NoActiveProject,
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("state lock poisoned: {0}")]
    LockPoisoned(String),
}

impl TimerEngine {
    pub fn new(
        snapshots: SnapshotStore,
        recorder: EntryRecorder,
        notifier: Arc<dyn Notifier>,
        api: Arc<dyn TimeTrackerApi>,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(EngineState::default()),
            snapshots,
            recorder,
            notifier,
            api,
            clock,
            ticker: Mutex::new(None),
            options,
            ticks: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        })
    }

    pub fn recorder(&self) -> &EntryRecorder {
        &self.recorder
    }

    pub(crate) fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, EngineState>, TimerError> {
        self.state
            .lock()
            .map_err(|e| TimerError::LockPoisoned(e.to_string()))
    }
}

impl Drop for TimerEngine {
    fn drop(&mut self) {
        if let Ok(mut ticker) = self.ticker.lock() {
            if let Some(handle) = ticker.take() {
                handle.cancel();
            }
        }
    }
}
