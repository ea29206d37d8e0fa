use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

mod client;
pub mod models;

pub use client::{ApiConfig, HttpApiClient};
pub use models::{
    NewTimeEntry, PomodoroSettings, Project, Settings, SettingsUpdate, TimeEntry, ValidationError,
};

/// Ошибки REST API (для разбора и логирования)
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network: {0}")]
    Network(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("invalid response: {0}")]
    InvalidResponse(#[from] ValidationError),
}

/// Контракт внешнего API, от которого зависит подсистема таймера.
/// Любой вызов может завершиться ошибкой; вызывающий код ловит и логирует.
#[async_trait]
pub trait TimeTrackerApi: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<Project>, ApiError>;

    /// Переключить "активный проект" на стороне сервера
    async fn activate_project(&self, project_id: &str) -> Result<(), ApiError>;

    async fn create_time_entry(&self, entry: &NewTimeEntry) -> Result<TimeEntry, ApiError>;

    async fn list_time_entries(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeEntry>, ApiError>;

    async fn get_settings(&self) -> Result<Settings, ApiError>;

    async fn update_settings(&self, update: &SettingsUpdate) -> Result<Settings, ApiError>;
}
