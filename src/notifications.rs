//! Notification dispatcher: hour / 15-minute marks, time limit, work start/complete, Pomodoro phases.

use crate::format::{format_human, format_time};
use std::io;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

pub const HOUR_MS: u64 = 60 * 60 * 1000;
pub const QUARTER_HOUR_MS: u64 = 15 * 60 * 1000;

/// Результат проверки отметок: новые значения отметок, если граница пересечена
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkCrossings {
    pub hour: Option<u64>,
    pub quarter: Option<u64>,
}

impl MarkCrossings {
    pub fn any(&self) -> bool {
        self.hour.is_some() || self.quarter.is_some()
    }
}

/// Чистая функция: считается от абсолютного elapsed, поэтому нерегулярные тики
/// (спящая вкладка, лаги) не приводят ни к пропуску, ни к повтору отметки.
pub fn evaluate_marks(elapsed_ms: u64, last_hour_mark: u64, last_15_min_mark: u64) -> MarkCrossings {
    MarkCrossings {
        hour: crossed(elapsed_ms, last_hour_mark, HOUR_MS),
        quarter: crossed(elapsed_ms, last_15_min_mark, QUARTER_HOUR_MS),
    }
}

fn crossed(elapsed_ms: u64, last_mark: u64, period: u64) -> Option<u64> {
    let current = elapsed_ms / period;
    if current > last_mark / period {
        Some(current * period)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    WorkStarted,
    HourMark,
    QuarterHourMark,
    LimitReached,
    WorkComplete,
    PomodoroPhaseComplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn work_started(project: &str) -> Self {
        Self {
            kind: NotificationKind::WorkStarted,
            title: "Timer started".to_string(),
            body: format!("Tracking time on {}", project),
        }
    }

    pub fn hour_mark(project: &str, elapsed_ms: u64) -> Self {
        let hours = elapsed_ms / HOUR_MS;
        let unit = if hours == 1 { "hour" } else { "hours" };
        Self {
            kind: NotificationKind::HourMark,
            title: format!("{} {} of work", hours, unit),
            body: format!("{}: {} tracked", project, format_time(elapsed_ms)),
        }
    }

    pub fn quarter_mark(project: &str, elapsed_ms: u64) -> Self {
        Self {
            kind: NotificationKind::QuarterHourMark,
            title: format!("{} of work", format_human(elapsed_ms)),
            body: format!("{}: {} tracked", project, format_time(elapsed_ms)),
        }
    }

    pub fn limit_reached(project: &str, limit_ms: u64) -> Self {
        Self {
            kind: NotificationKind::LimitReached,
            title: "Time limit reached".to_string(),
            body: format!(
                "{}: limit of {} reached, timer stopped",
                project,
                format_human(limit_ms)
            ),
        }
    }

    pub fn work_complete(project: &str, duration_ms: u64) -> Self {
        Self {
            kind: NotificationKind::WorkComplete,
            title: "Work complete".to_string(),
            body: format!("{}: {} recorded", project, format_time(duration_ms)),
        }
    }

    pub fn pomodoro_phase_complete(finished: &str, next: &str) -> Self {
        Self {
            kind: NotificationKind::PomodoroPhaseComplete,
            title: format!("{} finished", finished),
            body: format!("Next up: {}", next),
        }
    }
}

/// Канал уведомлений. Best effort: реализация не возвращает ошибок вызывающему.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Системные уведомления (notify-rust) + звуковой сигнал через системный плеер
pub struct DesktopNotifier {
    app_name: String,
    /// Пользователь разрешил системные уведомления
    permitted: bool,
    sound: bool,
}

impl DesktopNotifier {
    pub fn new(app_name: impl Into<String>, permitted: bool, sound: bool) -> Self {
        Self {
            app_name: app_name.into(),
            permitted,
            sound,
        }
    }

    fn play_sound(&self) {
        let Some(command) = sound_command() else {
            debug!("[NOTIFY] No audio player for this platform");
            return;
        };
        // Не ждём завершения плеера; ошибка запуска - только лог
        if let Err(e) = spawn_reaped(command) {
            debug!("[NOTIFY] Failed to play sound: {}", e);
        }
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, notification: &Notification) {
        info!(
            "[NOTIFY] {:?}: {} - {}",
            notification.kind, notification.title, notification.body
        );

        if self.sound {
            self.play_sound();
        }

        if !self.permitted {
            return;
        }

        if let Err(e) = notify_rust::Notification::new()
            .appname(&self.app_name)
            .summary(&notification.title)
            .body(&notification.body)
            .show()
        {
            warn!("[NOTIFY] Failed to show system notification: {}", e);
        }
    }
}

/// Запустить процесс и дождаться его в отдельном потоке, чтобы не оставлять зомби
fn spawn_reaped(mut command: Command) -> io::Result<JoinHandle<Option<ExitStatus>>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    thread::Builder::new()
        .name("notify-sound".to_string())
        .spawn(move || match child.wait() {
            Ok(status) => Some(status),
            Err(e) => {
                debug!("[NOTIFY] Failed to wait for audio player: {}", e);
                None
            }
        })
}

#[cfg(target_os = "macos")]
fn sound_command() -> Option<Command> {
    let mut command = Command::new("afplay");
    command.arg("/System/Library/Sounds/Glass.aiff");
    Some(command)
}

#[cfg(target_os = "linux")]
fn sound_command() -> Option<Command> {
    let mut command = Command::new("paplay");
    command.arg("/usr/share/sounds/freedesktop/stereo/complete.oga");
    Some(command)
}

#[cfg(target_os = "windows")]
fn sound_command() -> Option<Command> {
    let mut command = Command::new("powershell");
    command.args([
        "-NoProfile",
        "-Command",
        "[System.Media.SystemSounds]::Asterisk.Play()",
    ]);
    Some(command)
}

#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
fn sound_command() -> Option<Command> {
    None
}

/// Notifier, который только запоминает уведомления (тесты, headless режим)
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent().iter().filter(|n| n.kind == kind).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_marks_before_first_quarter() {
        let crossings = evaluate_marks(14 * 60_000, 0, 0);
        assert!(!crossings.any());
    }

    #[test]
    fn test_quarter_mark_fires_once() {
        let first = evaluate_marks(QUARTER_HOUR_MS + 1_000, 0, 0);
        assert_eq!(first.quarter, Some(QUARTER_HOUR_MS));
        assert_eq!(first.hour, None);

        // Следующий тик с обновлённой отметкой - повтора нет
        let second = evaluate_marks(QUARTER_HOUR_MS + 2_000, 0, QUARTER_HOUR_MS);
        assert!(!second.any());
    }

    #[test]
    fn test_hour_and_quarter_fire_together_at_top_of_hour() {
        let crossings = evaluate_marks(HOUR_MS, 0, 3 * QUARTER_HOUR_MS);
        assert_eq!(crossings.hour, Some(HOUR_MS));
        assert_eq!(crossings.quarter, Some(HOUR_MS));
    }

    #[test]
    fn test_irregular_tick_jumps_to_latest_mark() {
        // Тик "проспал" 2.5 часа: одна отметка, выровненная по последней границе
        let crossings = evaluate_marks(2 * HOUR_MS + 30 * 60_000, 0, 0);
        assert_eq!(crossings.hour, Some(2 * HOUR_MS));
        assert_eq!(crossings.quarter, Some(2 * HOUR_MS + 2 * QUARTER_HOUR_MS));
    }

    #[test]
    fn test_hour_mark_message_names_project() {
        let n = Notification::hour_mark("Website", 2 * HOUR_MS);
        assert_eq!(n.title, "2 hours of work");
        assert!(n.body.contains("Website"));
        assert!(n.body.contains("02:00:00"));
    }

    #[cfg(unix)]
    #[test]
    fn test_sound_process_is_waited_for() {
        let reaper = spawn_reaped(Command::new("true")).expect("spawn true");
        let status = reaper.join().expect("reaper thread");
        assert!(status.is_some_and(|s| s.success()));
    }

    #[test]
    fn test_recording_notifier_counts_by_kind() {
        let notifier = RecordingNotifier::new();
        notifier.notify(&Notification::work_started("A"));
        notifier.notify(&Notification::limit_reached("A", HOUR_MS));
        assert_eq!(notifier.count(NotificationKind::WorkStarted), 1);
        assert_eq!(notifier.count(NotificationKind::LimitReached), 1);
        assert_eq!(notifier.count(NotificationKind::HourMark), 0);
    }
}
