use crate::api::{
    ApiError, NewTimeEntry, Project, Settings, SettingsUpdate, TimeEntry, TimeTrackerApi,
};
use crate::auth::AuthManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Конфигурация HTTP клиента (api_base_url, таймаут, app_version)
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_base_url: String,
    pub http_timeout_secs: u64,
    /// App version sent in X-App-Version header for debugging version skew
    pub app_version: String,
}

impl From<&crate::config::AppConfig> for ApiConfig {
    fn from(config: &crate::config::AppConfig) -> Self {
        Self {
            api_base_url: config.api_base_url.clone(),
            http_timeout_secs: config.http_timeout_secs,
            app_version: config.app_version.clone(),
        }
    }
}

/// REST клиент: Bearer access token, одна попытка refresh при 401
#[derive(Clone)]
pub struct HttpApiClient {
    pub(crate) api_base_url: String,
    pub(crate) auth_manager: Arc<AuthManager>,
    pub(crate) client: reqwest::Client,
    pub(crate) app_version: String,
}

impl HttpApiClient {
    pub fn new(config: ApiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let auth_manager = Arc::new(AuthManager::new(config.api_base_url.clone(), client.clone()));
        Self::with_auth(config, client, auth_manager)
    }

    pub fn with_auth(
        config: ApiConfig,
        client: reqwest::Client,
        auth_manager: Arc<AuthManager>,
    ) -> Self {
        Self {
            api_base_url: config.api_base_url,
            auth_manager,
            client,
            app_version: config.app_version,
        }
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth_manager
    }

    /// Отправить авторизованный запрос.
    /// При 401 один раз обновляет токен через AuthManager и повторяет запрос.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.api_base_url, path);
        let mut access_token = self
            .auth_manager
            .get_access_token()
            .await
            .map_err(|e| ApiError::Unauthorized(e.to_string()))?;
        let mut retry_with_refresh = true;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&access_token)
                .header("X-App-Version", &self.app_version);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ApiError::Network(e.to_string()))?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                if !retry_with_refresh {
                    return Err(ApiError::Unauthorized(format!(
                        "{} {} rejected after token refresh",
                        method, path
                    )));
                }
                retry_with_refresh = false;
                info!("[API] Token expired (401) on {} {}, refreshing", method, path);
                match self.auth_manager.refresh().await {
                    Ok(tokens) => {
                        access_token = tokens.access_token;
                        continue;
                    }
                    Err(e) => {
                        warn!("[API] Failed to refresh token: {}", e);
                        return Err(ApiError::Unauthorized(e.to_string()));
                    }
                }
            }

            if status.is_success() {
                debug!("[API] {} {} -> {}", method, path, status.as_u16());
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();
            let message = if body.is_empty() {
                status.canonical_reason().unwrap_or("Unknown").to_string()
            } else {
                body
            };
            return Err(ApiError::Http {
                status: status.as_u16(),
                message,
            });
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    fn to_body<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ApiError> {
        serde_json::to_value(value).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl TimeTrackerApi for HttpApiClient {
    async fn list_projects(&self) -> Result<Vec<Project>, ApiError> {
        let response = self.send(Method::GET, "/projects", &[], None).await?;
        Self::decode(response).await
    }

    async fn activate_project(&self, project_id: &str) -> Result<(), ApiError> {
        let path = format!("/projects/{}/activate", project_id);
        self.send(Method::POST, &path, &[], Some(serde_json::json!({})))
            .await?;
        Ok(())
    }

    async fn create_time_entry(&self, entry: &NewTimeEntry) -> Result<TimeEntry, ApiError> {
        // Клиентская валидация: некорректная запись не уходит на сервер
        entry.validate()?;
        let body = Self::to_body(entry)?;
        let response = self
            .send(Method::POST, "/time-entries", &[], Some(body))
            .await?;
        let created: TimeEntry = Self::decode(response).await?;
        created.validate()?;
        Ok(created)
    }

    async fn list_time_entries(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeEntry>, ApiError> {
        let query = [("startDate", from.to_rfc3339()), ("endDate", to.to_rfc3339())];
        let response = self
            .send(Method::GET, "/time-entries", &query, None)
            .await?;
        let entries: Vec<TimeEntry> = Self::decode(response).await?;

        // Одна битая запись не ломает весь список
        let (valid, invalid): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|entry| entry.validate().is_ok());
        if !invalid.is_empty() {
            warn!(
                "[API] Skipping {} invalid time entries in list response",
                invalid.len()
            );
        }
        Ok(valid)
    }

    async fn get_settings(&self) -> Result<Settings, ApiError> {
        let response = self.send(Method::GET, "/settings", &[], None).await?;
        let settings: Settings = Self::decode(response).await?;
        settings.pomodoro.validate()?;
        Ok(settings)
    }

    async fn update_settings(&self, update: &SettingsUpdate) -> Result<Settings, ApiError> {
        if let Some(pomodoro) = &update.pomodoro {
            pomodoro.validate()?;
        }
        let body = Self::to_body(update)?;
        let response = self.send(Method::PUT, "/settings", &[], Some(body)).await?;
        Self::decode(response).await
    }
}
