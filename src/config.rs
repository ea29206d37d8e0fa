use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Порог "случайного" переключения: пауза в пределах 5 секунд от старта не создаёт запись
pub const QUICK_TOGGLE_THRESHOLD_MS: u64 = 5_000;
/// Минимальная длительность time entry (1 минута)
pub const MIN_ENTRY_DURATION_MS: u64 = 60_000;
/// Период тика таймера
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Период фонового сохранения snapshot
pub const PERIODIC_SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Конфигурация приложения (api_base_url, таймауты, пути, режимы)
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_base_url: String,
    pub http_timeout_secs: u64,
    /// Версия приложения для заголовка X-App-Version
    pub app_version: String,
    pub data_dir: PathBuf,
    /// Детерминированный режим (интеграционные прогоны): без фильтра минимальной длительности
    pub deterministic: bool,
    /// Разрешение на системные уведомления
    pub notifications_enabled: bool,
    pub sound_enabled: bool,
    /// hex-ключ (32 байта) для шифрования refresh token
    pub encryption_key: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:4000/api".to_string(),
            http_timeout_secs: 30,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("timetrack"),
            deterministic: cfg!(feature = "deterministic"),
            notifications_enabled: true,
            sound_enabled: true,
            encryption_key: None,
            email: None,
            password: None,
        }
    }
}

impl AppConfig {
    /// Собрать конфигурацию из переменных окружения TIMETRACK_*
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// То же, что from_env, но с произвольным источником значений
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("TIMETRACK_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(raw) = lookup("TIMETRACK_HTTP_TIMEOUT_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => config.http_timeout_secs = secs,
                _ => warn!(
                    "[CONFIG] Invalid TIMETRACK_HTTP_TIMEOUT_SECS '{}', using {}s",
                    raw, config.http_timeout_secs
                ),
            }
        }
        if let Some(dir) = lookup("TIMETRACK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("TIMETRACK_DETERMINISTIC") {
            config.deterministic = config.deterministic || parse_flag(&flag);
        }
        if let Some(flag) = lookup("TIMETRACK_NOTIFICATIONS") {
            config.notifications_enabled = parse_flag(&flag);
        }
        if let Some(flag) = lookup("TIMETRACK_SOUND") {
            config.sound_enabled = parse_flag(&flag);
        }
        config.encryption_key = lookup("TIMETRACK_ENCRYPTION_KEY");
        config.email = lookup("TIMETRACK_EMAIL");
        config.password = lookup("TIMETRACK_PASSWORD");

        config
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("timetrack.db")
    }

    /// Минимальная длительность записи с учётом детерминированного режима
    pub fn min_entry_duration_ms(&self) -> u64 {
        if self.deterministic {
            0
        } else {
            MIN_ENTRY_DURATION_MS
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = AppConfig::from_lookup(|_| None);
        assert_eq!(config.api_base_url, "http://localhost:4000/api");
        assert_eq!(config.http_timeout_secs, 30);
        assert!(config.notifications_enabled);
        assert!(config.database_path().ends_with("timetrack.db"));
    }

    #[test]
    fn test_env_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("TIMETRACK_API_URL", "https://tt.example.com/api/"),
            ("TIMETRACK_HTTP_TIMEOUT_SECS", "5"),
            ("TIMETRACK_DATA_DIR", "/tmp/tt"),
            ("TIMETRACK_DETERMINISTIC", "yes"),
            ("TIMETRACK_NOTIFICATIONS", "off"),
        ]));
        assert_eq!(config.api_base_url, "https://tt.example.com/api");
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/tt/timetrack.db"));
        assert!(config.deterministic);
        assert_eq!(config.min_entry_duration_ms(), 0);
        assert!(!config.notifications_enabled);
    }

    #[test]
    fn test_invalid_timeout_keeps_default() {
        let config = AppConfig::from_lookup(lookup_from(&[("TIMETRACK_HTTP_TIMEOUT_SECS", "abc")]));
        assert_eq!(config.http_timeout_secs, 30);
    }
}
