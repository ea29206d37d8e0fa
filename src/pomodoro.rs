//! Pomodoro focus timer: work / short break / long break phases with an absolute phase end.

use crate::api::{PomodoroSettings, ValidationError};
use crate::clock::Clock;
use crate::format::format_time;
use crate::notifications::{Notification, Notifier};
use crate::storage::{KeyValueStore, StorageError, POMODORO_TIMER_KEY};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PomodoroPhase {
    #[default]
    Work,
    ShortBreak,
    LongBreak,
}

impl PomodoroPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::ShortBreak => "short break",
            Self::LongBreak => "long break",
        }
    }

    pub fn duration_ms(self, settings: &PomodoroSettings) -> u64 {
        let minutes = match self {
            Self::Work => settings.work_minutes,
            Self::ShortBreak => settings.short_break_minutes,
            Self::LongBreak => settings.long_break_minutes,
        };
        u64::from(minutes) * 60_000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PomodoroStatus {
    #[default]
    Idle,
    Running,
    Paused,
}

/// Snapshot помодоро (хранится под POMODORO_TIMER_KEY)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PomodoroSnapshot {
    pub phase: PomodoroPhase,
    pub status: PomodoroStatus,
    /// Unix ms окончания фазы (только RUNNING)
    pub ends_at: Option<i64>,
    /// Остаток фазы для IDLE / PAUSED
    pub remaining_ms: u64,
    pub completed_sessions: u32,
    pub settings: PomodoroSettings,
}

impl Default for PomodoroSnapshot {
    fn default() -> Self {
        Self::fresh(PomodoroSettings::default())
    }
}

impl PomodoroSnapshot {
    fn fresh(settings: PomodoroSettings) -> Self {
        Self {
            phase: PomodoroPhase::Work,
            status: PomodoroStatus::Idle,
            ends_at: None,
            remaining_ms: PomodoroPhase::Work.duration_ms(&settings),
            completed_sessions: 0,
            settings,
        }
    }

    /// Остаток с учётом текущего момента
    pub fn live_remaining(&self, now_ms: i64) -> u64 {
        match (self.status, self.ends_at) {
            (PomodoroStatus::Running, Some(ends_at)) => ends_at.saturating_sub(now_ms).max(0) as u64,
            _ => self.remaining_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PomodoroStateResponse {
    pub phase: PomodoroPhase,
    pub status: PomodoroStatus,
    pub remaining_ms: u64,
    pub formatted: String,
    pub completed_sessions: u32,
}

#[derive(Debug, Error)]
pub enum PomodoroError {
    #[error("cannot {action} while {status:?}")]
    InvalidTransition {
        action: &'static str,
        status: PomodoroStatus,
    },
    #[error(transparent)]
    Settings(#[from] ValidationError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("pomodoro lock poisoned: {0}")]
    LockPoisoned(String),
}

pub struct PomodoroTimer {
    state: Mutex<PomodoroSnapshot>,
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl PomodoroTimer {
    /// Восстановить из хранилища (или начать с чистого snapshot).
    /// Переданные настройки действуют и для восстановленного snapshot'а.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: PomodoroSettings,
    ) -> Result<Self, PomodoroError> {
        settings.validate()?;
        let snapshot = match store.get_item(POMODORO_TIMER_KEY)? {
            Some(item) => match serde_json::from_str::<PomodoroSnapshot>(&item.value) {
                Ok(mut snapshot) => {
                    if snapshot.settings != settings {
                        info!("[POMODORO] Settings changed since last run, applying");
                        apply_settings_to(&mut snapshot, settings);
                    }
                    info!(
                        "[POMODORO] Restored {} ({:?}, {} sessions done)",
                        snapshot.phase.as_str(),
                        snapshot.status,
                        snapshot.completed_sessions
                    );
                    snapshot
                }
                Err(e) => {
                    warn!("[POMODORO] Stored snapshot unreadable ({}), starting fresh", e);
                    PomodoroSnapshot::fresh(settings)
                }
            },
            None => PomodoroSnapshot::fresh(settings),
        };

        Ok(Self {
            state: Mutex::new(snapshot),
            store,
            notifier,
            clock,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, PomodoroSnapshot>, PomodoroError> {
        self.state
            .lock()
            .map_err(|e| PomodoroError::LockPoisoned(e.to_string()))
    }

    pub fn start(&self) -> Result<PomodoroStateResponse, PomodoroError> {
        self.transition("start", |snapshot, now| match snapshot.status {
            PomodoroStatus::Idle => {
                let duration = snapshot.phase.duration_ms(&snapshot.settings);
                let remaining = if snapshot.remaining_ms == 0 {
                    duration
                } else {
                    snapshot.remaining_ms.min(duration)
                };
                snapshot.ends_at = Some(now.saturating_add(remaining as i64));
                snapshot.status = PomodoroStatus::Running;
                true
            }
            _ => false,
        })
    }

    pub fn pause(&self) -> Result<PomodoroStateResponse, PomodoroError> {
        self.transition("pause", |snapshot, now| match snapshot.status {
            PomodoroStatus::Running => {
                snapshot.remaining_ms = snapshot.live_remaining(now);
                snapshot.ends_at = None;
                snapshot.status = PomodoroStatus::Paused;
                true
            }
            _ => false,
        })
    }

    pub fn resume(&self) -> Result<PomodoroStateResponse, PomodoroError> {
        self.transition("resume", |snapshot, now| match snapshot.status {
            PomodoroStatus::Paused => {
                snapshot.ends_at = Some(now.saturating_add(snapshot.remaining_ms as i64));
                snapshot.status = PomodoroStatus::Running;
                true
            }
            _ => false,
        })
    }

    /// Сброс к первой рабочей сессии
    pub fn reset(&self) -> Result<PomodoroStateResponse, PomodoroError> {
        self.transition("reset", |snapshot, _| {
            *snapshot = PomodoroSnapshot::fresh(snapshot.settings);
            true
        })
    }

    /// Пропустить текущую фазу (рабочая сессия не засчитывается)
    pub fn skip(&self) -> Result<PomodoroStateResponse, PomodoroError> {
        self.transition("skip", |snapshot, _| {
            let next = match snapshot.phase {
                PomodoroPhase::Work => PomodoroPhase::ShortBreak,
                PomodoroPhase::ShortBreak | PomodoroPhase::LongBreak => PomodoroPhase::Work,
            };
            enter_idle(snapshot, next);
            true
        })
    }

    /// Новые длительности. Текущая IDLE фаза получает новую длительность сразу.
    pub fn apply_settings(
        &self,
        settings: PomodoroSettings,
    ) -> Result<PomodoroStateResponse, PomodoroError> {
        settings.validate()?;
        self.transition("apply settings", |snapshot, _| {
            apply_settings_to(snapshot, settings);
            true
        })
    }

    /// Проверить окончание фазы. Возвращает завершённую фазу, если она закончилась на этом тике.
    pub fn tick(&self) -> Result<Option<PomodoroPhase>, PomodoroError> {
        let now = self.clock.now_ms();
        let completed = {
            let mut snapshot = self.lock()?;
            let finished = snapshot.status == PomodoroStatus::Running
                && snapshot.ends_at.is_some_and(|ends_at| now >= ends_at);
            if !finished {
                return Ok(None);
            }

            let phase = snapshot.phase;
            if phase == PomodoroPhase::Work {
                snapshot.completed_sessions += 1;
            }
            let next = next_phase(phase, snapshot.completed_sessions, &snapshot.settings);
            enter_idle(&mut *snapshot, next);
            (phase, next, snapshot.clone())
        };

        let (finished, next, snapshot) = completed;
        info!(
            "[POMODORO] {} finished, next: {}",
            finished.as_str(),
            next.as_str()
        );
        self.notifier.notify(&Notification::pomodoro_phase_complete(
            capitalize(finished.as_str()).as_str(),
            next.as_str(),
        ));
        self.persist(&snapshot)?;
        Ok(Some(finished))
    }

    pub fn state(&self) -> Result<PomodoroStateResponse, PomodoroError> {
        let now = self.clock.now_ms();
        let snapshot = self.lock()?;
        Ok(response(&snapshot, now))
    }

    fn transition<F>(&self, action: &'static str, apply: F) -> Result<PomodoroStateResponse, PomodoroError>
    where
        F: FnOnce(&mut PomodoroSnapshot, i64) -> bool,
    {
        let now = self.clock.now_ms();
        let snapshot = {
            let mut snapshot = self.lock()?;
            let status = snapshot.status;
            if !apply(&mut *snapshot, now) {
                return Err(PomodoroError::InvalidTransition { action, status });
            }
            snapshot.clone()
        };

        debug!(
            "[POMODORO] {} → {} {:?}",
            action,
            snapshot.phase.as_str(),
            snapshot.status
        );
        self.persist(&snapshot)?;
        Ok(response(&snapshot, now))
    }

    fn persist(&self, snapshot: &PomodoroSnapshot) -> Result<(), PomodoroError> {
        let payload = serde_json::to_string(snapshot).map_err(StorageError::from)?;
        self.store.set_item(POMODORO_TIMER_KEY, &payload, None)?;
        Ok(())
    }
}

/// Следующая фаза: после каждой N-й рабочей сессии длинный перерыв
fn next_phase(current: PomodoroPhase, completed_sessions: u32, settings: &PomodoroSettings) -> PomodoroPhase {
    match current {
        PomodoroPhase::Work => {
            let every = settings.sessions_before_long_break.max(1);
            if completed_sessions > 0 && completed_sessions % every == 0 {
                PomodoroPhase::LongBreak
            } else {
                PomodoroPhase::ShortBreak
            }
        }
        PomodoroPhase::ShortBreak | PomodoroPhase::LongBreak => PomodoroPhase::Work,
    }
}

/// Новые длительности; IDLE фаза получает новую длительность сразу, идущая фаза доигрывается
fn apply_settings_to(snapshot: &mut PomodoroSnapshot, settings: PomodoroSettings) {
    snapshot.settings = settings;
    if snapshot.status == PomodoroStatus::Idle {
        snapshot.remaining_ms = snapshot.phase.duration_ms(&settings);
    }
}

fn enter_idle(snapshot: &mut PomodoroSnapshot, phase: PomodoroPhase) {
    snapshot.phase = phase;
    snapshot.status = PomodoroStatus::Idle;
    snapshot.ends_at = None;
    snapshot.remaining_ms = phase.duration_ms(&snapshot.settings);
}

fn response(snapshot: &PomodoroSnapshot, now_ms: i64) -> PomodoroStateResponse {
    let remaining = snapshot.live_remaining(now_ms);
    PomodoroStateResponse {
        phase: snapshot.phase,
        status: snapshot.status,
        remaining_ms: remaining,
        formatted: format_time(remaining),
        completed_sessions: snapshot.completed_sessions,
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
