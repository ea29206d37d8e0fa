use std::error::Error;
use std::panic;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod api;
pub mod auth;
pub mod clock;
pub mod commands;
pub mod config;
pub mod database;
pub mod engine;
pub mod format;
pub mod notifications;
pub mod pomodoro;
pub mod recorder;
pub mod report;
pub mod storage;

use crate::api::{ApiConfig, HttpApiClient, Settings, TimeTrackerApi};
use crate::auth::{AuthManager, TokenEncryption};
use crate::clock::{Clock, SystemClock};
use crate::commands::{execute, parse_command, AppContext, Command};
use crate::config::{AppConfig, PERIODIC_SAVE_INTERVAL, TICK_INTERVAL};
use crate::notifications::{DesktopNotifier, Notifier};
use crate::pomodoro::PomodoroTimer;
use crate::recorder::EntryRecorder;
use crate::storage::{KeyValueStore, KvSnapshotRepository, SnapshotStore};
pub use database::Database;
pub use engine::{EngineOptions, TimerEngine, TimerError, TimerStateResponse, TimerStatus};
pub use format::format_time;

/// Panic recovery: persist the active snapshot when a panic occurs.
static PANIC_ENGINE: OnceLock<Arc<TimerEngine>> = OnceLock::new();


type HostResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub fn run() {
    // Panic recovery: attempt to persist timer snapshot before panic unwinds
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if let Some(engine) = PANIC_ENGINE.get() {
            if let Err(e) = engine.try_save_state() {
                eprintln!("[PANIC_RECOVERY] Failed to persist timer state: {}", e);
            } else {
                eprintln!("[PANIC_RECOVERY] Timer state persisted before panic");
            }
        }
        default_hook(info);
    }));

    // Инициализация логирования: по умолчанию info (если RUST_LOG не задан)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::from_env();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("[HOST] Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run_host(config)) {
        error!("[HOST] {}", e);
        std::process::exit(1);
    }
}

/// Открыть БД в data_dir. Повреждённый файл переименовывается в backup и создаётся заново (один раз).
pub fn open_database(data_dir: &Path, db_path: &Path) -> HostResult<Arc<Database>> {
    std::fs::create_dir_all(data_dir).map_err(|e| {
        let kind = e.kind();
        let msg = match kind {
            std::io::ErrorKind::PermissionDenied => {
                "Permission denied. Check data directory is writable."
            }
            std::io::ErrorKind::StorageFull => "Disk full. Free space on drive.",
            _ => "Failed to create data directory.",
        };
        std::io::Error::new(
            kind,
            format!("{} Path: {}: {}", msg, data_dir.display(), e),
        )
    })?;

    let db_path_str = db_path.to_str().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Database path contains invalid UTF-8: {}", db_path.display()),
        )
    })?;

    match Database::new(db_path_str) {
        Ok(db) => Ok(Arc::new(db)),
        Err(e) => {
            if !database::is_corruption_error(&e) || !db_path.exists() {
                return Err(format!("Failed to initialize database: {}", e).into());
            }
            let backup_path = data_dir.join(format!(
                "timetrack.db.corrupted.{}",
                chrono::Utc::now().timestamp()
            ));
            if let Err(rename_e) = std::fs::rename(db_path, &backup_path) {
                warn!(
                    "[DB] Failed to rename corrupted DB to {:?}: {}",
                    backup_path, rename_e
                );
                return Err(format!("Database corrupted and could not backup: {}", e).into());
            }
            info!(
                "[DB] Corrupted DB backed up to {:?}, starting fresh",
                backup_path
            );
            let db = Database::new(db_path_str)
                .map_err(|e2| format!("Failed to create fresh database: {}", e2))?;
            Ok(Arc::new(db))
        }
    }
}

/// Сессия авторизации: сохранённый refresh token → refresh; иначе login по учётным данным из env
async fn restore_session(auth: &AuthManager, config: &AppConfig) {
    match auth.restore().await {
        Ok(true) => match auth.refresh().await {
            Ok(_) => {
                info!("[AUTH] Session restored");
                return;
            }
            Err(e) => warn!("[AUTH] Stored session expired: {}", e),
        },
        Ok(false) => debug!("[AUTH] No stored session"),
        Err(e) => warn!("[AUTH] Failed to restore session: {}", e),
    }

    if let (Some(email), Some(password)) = (&config.email, &config.password) {
        if let Err(e) = auth.login(email, password).await {
            error!("[AUTH] Login failed: {}", e);
        }
    } else {
        warn!("[AUTH] Not logged in; set TIMETRACK_EMAIL and TIMETRACK_PASSWORD");
    }
}

/// Периодическая задача до отмены токена
fn spawn_interval<F>(
    name: &'static str,
    period: std::time::Duration,
    token: CancellationToken,
    mut on_tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("[HOST] {} loop stopped", name);
                    break;
                }
                _ = interval.tick() => on_tick(),
            }
        }
    })
}

async fn run_host(config: AppConfig) -> HostResult<()> {
    info!(
        "[HOST] timetrack {} starting (api {}, data {})",
        config.app_version,
        config.api_base_url,
        config.data_dir.display()
    );
    if config.deterministic {
        info!("[HOST] Deterministic mode: minimum entry duration disabled");
    }

    let db = open_database(&config.data_dir, &config.database_path())?;
    let store: Arc<dyn KeyValueStore> = db;

    let api_config = ApiConfig::from(&config);
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
        .build()?;
    let encryption = TokenEncryption::new(config.encryption_key.as_deref())?;
    let auth = Arc::new(
        AuthManager::new(config.api_base_url.clone(), http.clone())
            .with_persistence(store.clone(), encryption),
    );
    restore_session(&auth, &config).await;

    let api: Arc<dyn TimeTrackerApi> = Arc::new(HttpApiClient::with_auth(api_config, http, auth));
    let notifier: Arc<dyn Notifier> = Arc::new(DesktopNotifier::new(
        "timetrack",
        config.notifications_enabled,
        config.sound_enabled,
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let recorder = EntryRecorder::new(
        api.clone(),
        notifier.clone(),
        clock.clone(),
        config.min_entry_duration_ms(),
    );
    let snapshots = SnapshotStore::new(Arc::new(KvSnapshotRepository::new(store.clone())));
    let engine = TimerEngine::new(
        snapshots,
        recorder,
        notifier.clone(),
        api.clone(),
        clock.clone(),
        EngineOptions::default(),
    );
    let _ = PANIC_ENGINE.set(engine.clone());

    // Настройки с сервера: активный проект и длительности помодоро
    let settings = match api.get_settings().await {
        Ok(settings) => settings,
        Err(e) => {
            warn!("[HOST] Failed to load settings, using defaults: {}", e);
            Settings::default()
        }
    };
    let pomodoro = Arc::new(PomodoroTimer::new(
        store.clone(),
        notifier.clone(),
        clock.clone(),
        settings.pomodoro,
    )?);

    if let Some(project_id) = settings.active_project_id {
        let name = match api.list_projects().await {
            Ok(projects) => projects
                .into_iter()
                .find(|p| p.id == project_id)
                .map(|p| p.name)
                .unwrap_or_else(|| project_id.clone()),
            Err(e) => {
                warn!("[HOST] Failed to load projects: {}", e);
                project_id.clone()
            }
        };
        if let Err(e) = engine.restore_active(&project_id, &name) {
            error!("[HOST] Failed to restore active project {}: {}", project_id, e);
        }
    }
    engine.recorder().refresh_daily_total().await;

    let shutdown = CancellationToken::new();

    // Периодическое сохранение: состояние в БД даже при force quit
    let engine_for_periodic = engine.clone();
    let periodic_save = spawn_interval(
        "periodic save",
        PERIODIC_SAVE_INTERVAL,
        shutdown.child_token(),
        move || {
            if let Err(e) = engine_for_periodic.save_state() {
                warn!("[TIMER] Failed to save state periodically: {}", e);
            } else {
                debug!("[TIMER] State saved periodically");
            }
        },
    );

    let pomodoro_for_tick = pomodoro.clone();
    let pomodoro_tick = spawn_interval(
        "pomodoro",
        TICK_INTERVAL,
        shutdown.child_token(),
        move || {
            if let Err(e) = pomodoro_for_tick.tick() {
                error!("[POMODORO] Tick failed: {}", e);
            }
        },
    );

    let ctx = AppContext {
        engine: engine.clone(),
        pomodoro,
        api,
        clock,
    };

    println!("{}", commands::describe_state(&engine.get_state()?));
    println!("type 'help' for commands");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("[HOST] Interrupted");
                break;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("[HOST] Failed to read command: {}", e);
                break;
            }
        };

        match parse_command(&line) {
            Ok(None) => {}
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => match execute(&ctx, command).await {
                Ok(output) => println!("{}", output),
                Err(e) => eprintln!("error: {}", e),
            },
            Err(e) => eprintln!("error: {}", e),
        }
    }

    // Graceful shutdown: сохранить snapshot активного проекта
    shutdown.cancel();
    if let Err(e) = engine.save_state() {
        error!("[SHUTDOWN] Failed to save timer state on exit: {}", e);
    } else {
        info!("[SHUTDOWN] Timer state saved successfully on exit");
    }
    let _ = periodic_save.await;
    let _ = pomodoro_tick.await;
    Ok(())
}
