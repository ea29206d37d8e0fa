//! Entry recorder: turns finished timer segments into time entries on the API.

use crate::api::{ApiError, NewTimeEntry, TimeEntry, TimeTrackerApi, ValidationError};
use crate::clock::Clock;
use crate::notifications::{Notification, Notifier};
use crate::report;
use chrono::{DateTime, Local, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Завершённый отрезок работы над проектом
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub project_id: String,
    pub project_name: String,
    pub work_type_id: Option<String>,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub elapsed_ms: u64,
    pub time_limit_ms: Option<u64>,
}

/// Что завершило сегмент
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Pause,
    Switch,
    Finish,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(TimeEntry),
    SkippedTooShort,
    SkippedInvalidRange,
    /// API недоступно или отказало; повтора нет
    Failed(String),
}

impl RecordOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, RecordOutcome::Recorded(_))
    }
}

/// Запись, введённая пользователем вручную
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualEntry {
    pub project_id: String,
    pub work_type_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub description: Option<String>,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid entry: {0}")]
    Validation(#[from] ValidationError),
    #[error("api: {0}")]
    Api(#[from] ApiError),
}

pub struct EntryRecorder {
    api: Arc<dyn TimeTrackerApi>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    /// 0 в детерминированном режиме
    min_entry_duration_ms: u64,
    daily_total: Mutex<Option<u64>>,
}

impl EntryRecorder {
    pub fn new(
        api: Arc<dyn TimeTrackerApi>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        min_entry_duration_ms: u64,
    ) -> Self {
        Self {
            api,
            notifier,
            clock,
            min_entry_duration_ms,
            daily_total: Mutex::new(None),
        }
    }

    pub fn min_entry_duration_ms(&self) -> u64 {
        self.min_entry_duration_ms
    }

    /// Последняя известная сумма за сегодня
    pub fn daily_total(&self) -> Option<u64> {
        self.daily_total.lock().ok().and_then(|total| *total)
    }

    /// Отправить сегмент как time entry. Ошибки не пробрасываются - только лог и outcome.
    pub async fn record(&self, segment: &Segment, kind: RecordKind) -> RecordOutcome {
        if segment.elapsed_ms < self.min_entry_duration_ms {
            info!(
                "[RECORDER] Skipping {:?} entry for {}: {}ms is below minimum {}ms",
                kind, segment.project_id, segment.elapsed_ms, self.min_entry_duration_ms
            );
            return RecordOutcome::SkippedTooShort;
        }

        if segment.start_time_ms >= segment.end_time_ms {
            warn!(
                "[RECORDER] Skipping {:?} entry for {}: start {} is not before end {}",
                kind, segment.project_id, segment.start_time_ms, segment.end_time_ms
            );
            return RecordOutcome::SkippedInvalidRange;
        }

        let (Some(start_time), Some(end_time)) = (
            Utc.timestamp_millis_opt(segment.start_time_ms).single(),
            Utc.timestamp_millis_opt(segment.end_time_ms).single(),
        ) else {
            warn!(
                "[RECORDER] Skipping {:?} entry for {}: timestamps out of range",
                kind, segment.project_id
            );
            return RecordOutcome::SkippedInvalidRange;
        };

        let entry = NewTimeEntry {
            project_id: segment.project_id.clone(),
            work_type_id: segment.work_type_id.clone(),
            start_time,
            end_time,
            duration_ms: segment.elapsed_ms,
            description: None,
            time_limit_ms: segment.time_limit_ms,
        };

        match self.api.create_time_entry(&entry).await {
            Ok(created) => {
                info!(
                    "[RECORDER] {:?} entry {} recorded for {} ({}ms)",
                    kind, created.id, segment.project_id, segment.elapsed_ms
                );
                if kind == RecordKind::Finish {
                    self.notifier.notify(&Notification::work_complete(
                        &segment.project_name,
                        segment.elapsed_ms,
                    ));
                    self.refresh_daily_total().await;
                }
                RecordOutcome::Recorded(created)
            }
            Err(e) => {
                error!(
                    "[RECORDER] Failed to record {:?} entry for {}: {}",
                    kind, segment.project_id, e
                );
                RecordOutcome::Failed(e.to_string())
            }
        }
    }

    /// Ручная запись: проверки ввода до обращения к API
    pub async fn record_manual(&self, manual: ManualEntry) -> Result<TimeEntry, RecordError> {
        let now = Utc
            .timestamp_millis_opt(self.clock.now_ms())
            .single()
            .unwrap_or_else(Utc::now);
        if manual.end_time > now {
            return Err(ValidationError::InFuture(manual.end_time).into());
        }

        let duration_ms = (manual.end_time - manual.start_time)
            .num_milliseconds()
            .max(0) as u64;
        let entry = NewTimeEntry {
            project_id: manual.project_id.trim().to_string(),
            work_type_id: manual.work_type_id,
            start_time: manual.start_time,
            end_time: manual.end_time,
            duration_ms,
            description: manual
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            time_limit_ms: None,
        };
        entry.validate()?;

        let created = self.api.create_time_entry(&entry).await?;
        info!(
            "[RECORDER] Manual entry {} recorded for {} ({}ms)",
            created.id, created.project_id, created.duration_ms
        );
        self.refresh_daily_total().await;
        Ok(created)
    }

    /// Пересчитать сумму за сегодня (локальный день) по записям с сервера
    pub async fn refresh_daily_total(&self) -> Option<u64> {
        let now = Local
            .timestamp_millis_opt(self.clock.now_ms())
            .single()
            .unwrap_or_else(Local::now);
        let Some((from, to)) = report::day_bounds(now.date_naive(), &Local) else {
            warn!("[RECORDER] Cannot compute today's bounds, daily total not refreshed");
            return None;
        };

        match self.api.list_time_entries(from, to).await {
            Ok(entries) => {
                let total = report::total(&entries);
                debug!("[RECORDER] Daily total refreshed: {}ms", total);
                if let Ok(mut daily) = self.daily_total.lock() {
                    *daily = Some(total);
                }
                Some(total)
            }
            Err(e) => {
                warn!("[RECORDER] Failed to refresh daily total: {}", e);
                None
            }
        }
    }
}
