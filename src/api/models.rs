//! Явные схемы запросов и ответов REST API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Максимальная длина описания записи
pub const MAX_DESCRIPTION_LEN: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("project is required")]
    EmptyProject,
    #[error("end time {end} must be after start time {start}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("entry ends in the future ({0})")]
    InFuture(DateTime<Utc>),
    #[error("description is too long ({0} characters, max 500)")]
    DescriptionTooLong(usize),
    #[error("duration {duration_ms}ms does not match time range {range_ms}ms")]
    DurationMismatch { duration_ms: u64, range_ms: u64 },
    #[error("invalid pomodoro settings: {0}")]
    PomodoroSettings(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

/// Тело POST /time-entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTimeEntry {
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_type_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
}

impl NewTimeEntry {
    /// Проверка перед отправкой (ошибки пользовательского ввода не доходят до API)
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.project_id.trim().is_empty() {
            return Err(ValidationError::EmptyProject);
        }
        if self.start_time >= self.end_time {
            return Err(ValidationError::InvalidRange {
                start: self.start_time,
                end: self.end_time,
            });
        }
        if let Some(description) = &self.description {
            let len = description.chars().count();
            if len > MAX_DESCRIPTION_LEN {
                return Err(ValidationError::DescriptionTooLong(len));
            }
        }
        let range_ms = (self.end_time - self.start_time).num_milliseconds().max(0) as u64;
        if self.duration_ms > range_ms {
            return Err(ValidationError::DurationMismatch {
                duration_ms: self.duration_ms,
                range_ms,
            });
        }
        Ok(())
    }
}

/// Запись времени, как её возвращает API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeEntry {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub work_type_id: Option<String>,
    #[serde(default)]
    pub work_type_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub description: Option<String>,
}

impl TimeEntry {
    /// Проверка ответа сервера
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.project_id.trim().is_empty() {
            return Err(ValidationError::EmptyProject);
        }
        if self.start_time > self.end_time {
            return Err(ValidationError::InvalidRange {
                start: self.start_time,
                end: self.end_time,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PomodoroSettings {
    pub work_minutes: u32,
    pub short_break_minutes: u32,
    pub long_break_minutes: u32,
    pub sessions_before_long_break: u32,
}

impl Default for PomodoroSettings {
    fn default() -> Self {
        Self {
            work_minutes: 25,
            short_break_minutes: 5,
            long_break_minutes: 15,
            sessions_before_long_break: 4,
        }
    }
}

impl PomodoroSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let durations = [
            ("work", self.work_minutes),
            ("short break", self.short_break_minutes),
            ("long break", self.long_break_minutes),
        ];
        for (name, minutes) in durations {
            if minutes == 0 || minutes > 24 * 60 {
                return Err(ValidationError::PomodoroSettings(format!(
                    "{} duration must be between 1 and 1440 minutes, got {}",
                    name, minutes
                )));
            }
        }
        if self.sessions_before_long_break == 0 {
            return Err(ValidationError::PomodoroSettings(
                "sessions before long break must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub active_project_id: Option<String>,
    #[serde(default)]
    pub pomodoro: PomodoroSettings,
}

/// Тело PUT /settings (только изменяемые поля)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pomodoro: Option<PomodoroSettings>,
}
