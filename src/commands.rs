//! Команды headless хоста: разбор строки и выполнение над engine / pomodoro / API.

use crate::api::TimeTrackerApi;
use crate::clock::Clock;
use crate::engine::{TimerEngine, TimerStateResponse, TimerStatus};
use crate::format::format_time;
use crate::pomodoro::{PomodoroStateResponse, PomodoroTimer};
use crate::recorder::ManualEntry;
use crate::report::{self, GroupBy};
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

pub const HELP: &str = "\
commands:
  status                              current timer
  projects                            projects and their saved timers
  switch <project-id> [name]          make a project active
  toggle                              start / pause / resume
  finish                              finish the task and record it
  reset                               discard the current timer
  work-type <id> [name] | none        set the work type
  limit <minutes> | off               auto-stop after a time limit
  entry <project-id> <start> <end> [description]
                                      manual entry, RFC 3339 times
  report [project|work-type|day] [days]
  pomodoro start|pause|resume|reset|skip|status
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PomodoroAction {
    Start,
    Pause,
    Resume,
    Reset,
    Skip,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Projects,
    Switch {
        project_id: String,
        name: Option<String>,
    },
    Toggle,
    Finish,
    Reset,
    WorkType {
        id: Option<String>,
        name: String,
    },
    Limit(Option<u64>),
    Entry(ManualEntry),
    Report {
        group_by: GroupBy,
        days: u32,
    },
    Pomodoro(PomodoroAction),
    Help,
    Quit,
}

/// Разобрать строку команды. Ok(None) - пустая строка.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut parts = line.split_whitespace();
    let Some(name) = parts.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = parts.collect();

    let command = match name.to_ascii_lowercase().as_str() {
        "status" | "s" => Command::Status,
        "projects" | "p" => Command::Projects,
        "switch" => {
            let project_id = args
                .first()
                .ok_or("usage: switch <project-id> [name]")?
                .to_string();
            let name = (args.len() > 1).then(|| args[1..].join(" "));
            Command::Switch { project_id, name }
        }
        "toggle" | "t" => Command::Toggle,
        "finish" | "f" => Command::Finish,
        "reset" => Command::Reset,
        "work-type" | "wt" => match args.first() {
            None => return Err("usage: work-type <id> [name] | none".to_string()),
            Some(&"none") => Command::WorkType {
                id: None,
                name: String::new(),
            },
            Some(id) => Command::WorkType {
                id: Some(id.to_string()),
                name: if args.len() > 1 {
                    args[1..].join(" ")
                } else {
                    id.to_string()
                },
            },
        },
        "limit" => match args.first() {
            None => return Err("usage: limit <minutes> | off".to_string()),
            Some(&"off") | Some(&"none") => Command::Limit(None),
            Some(raw) => {
                let minutes: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid minutes: {}", raw))?;
                if minutes == 0 {
                    Command::Limit(None)
                } else {
                    Command::Limit(Some(minutes * 60_000))
                }
            }
        },
        "entry" => {
            if args.len() < 3 {
                return Err(
                    "usage: entry <project-id> <start> <end> [description]".to_string(),
                );
            }
            let start_time = parse_time(args[1])?;
            let end_time = parse_time(args[2])?;
            let description = (args.len() > 3).then(|| args[3..].join(" "));
            Command::Entry(ManualEntry {
                project_id: args[0].to_string(),
                work_type_id: None,
                start_time,
                end_time,
                description,
            })
        }
        "report" => {
            let group_by = match args.first() {
                Some(raw) => raw.parse::<GroupBy>()?,
                None => GroupBy::Project,
            };
            let days = match args.get(1) {
                Some(raw) => raw
                    .parse::<u32>()
                    .ok()
                    .filter(|days| *days > 0)
                    .ok_or_else(|| format!("invalid number of days: {}", raw))?,
                None => 7,
            };
            Command::Report { group_by, days }
        }
        "pomodoro" | "pomo" => {
            let action = match args.first().copied().unwrap_or("status") {
                "start" => PomodoroAction::Start,
                "pause" => PomodoroAction::Pause,
                "resume" => PomodoroAction::Resume,
                "reset" => PomodoroAction::Reset,
                "skip" => PomodoroAction::Skip,
                "status" => PomodoroAction::Status,
                other => return Err(format!("unknown pomodoro action: {}", other)),
            };
            Command::Pomodoro(action)
        }
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command '{}', type help", other)),
    };
    Ok(Some(command))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid time '{}': {}", raw, e))
}

/// Всё, над чем работают команды
pub struct AppContext {
    pub engine: Arc<TimerEngine>,
    pub pomodoro: Arc<PomodoroTimer>,
    pub api: Arc<dyn TimeTrackerApi>,
    pub clock: Arc<dyn Clock>,
}

/// Выполнить команду; текст ответа для вывода пользователю
pub async fn execute(ctx: &AppContext, command: Command) -> Result<String, String> {
    debug!("[CMD] {:?}", command);
    match command {
        Command::Status => ctx
            .engine
            .get_state()
            .map(|state| describe_state(&state))
            .map_err(|e| e.to_string()),
        Command::Projects => list_projects(ctx).await,
        Command::Switch { project_id, name } => {
            let name = match name {
                Some(name) => name,
                None => project_name(ctx, &project_id).await,
            };
            ctx.engine
                .switch_project(&project_id, &name)
                .await
                .map(|state| describe_state(&state))
                .map_err(|e| e.to_string())
        }
        Command::Toggle => ctx
            .engine
            .toggle_timer()
            .await
            .map(|state| describe_state(&state))
            .map_err(|e| e.to_string()),
        Command::Finish => ctx
            .engine
            .finish_task()
            .await
            .map(|state| describe_state(&state))
            .map_err(|e| e.to_string()),
        Command::Reset => ctx
            .engine
            .reset_timer()
            .map(|state| describe_state(&state))
            .map_err(|e| e.to_string()),
        Command::WorkType { id, name } => ctx
            .engine
            .set_work_type(id, name)
            .map(|state| describe_state(&state))
            .map_err(|e| e.to_string()),
        Command::Limit(limit) => ctx
            .engine
            .set_time_limit(limit)
            .map(|state| describe_state(&state))
            .map_err(|e| e.to_string()),
        Command::Entry(manual) => {
            let entry = ctx
                .engine
                .recorder()
                .record_manual(manual)
                .await
                .map_err(|e| e.to_string())?;
            Ok(format!(
                "recorded {} for {} ({})",
                entry.id,
                entry.project_id,
                format_time(entry.duration_ms)
            ))
        }
        Command::Report { group_by, days } => build_report(ctx, group_by, days).await,
        Command::Pomodoro(action) => {
            let pomodoro = &ctx.pomodoro;
            let result = match action {
                PomodoroAction::Start => pomodoro.start(),
                PomodoroAction::Pause => pomodoro.pause(),
                PomodoroAction::Resume => pomodoro.resume(),
                PomodoroAction::Reset => pomodoro.reset(),
                PomodoroAction::Skip => pomodoro.skip(),
                PomodoroAction::Status => pomodoro.state(),
            };
            result
                .map(|state| describe_pomodoro(&state))
                .map_err(|e| e.to_string())
        }
        Command::Help => Ok(HELP.to_string()),
        Command::Quit => Ok("bye".to_string()),
    }
}

pub fn describe_state(state: &TimerStateResponse) -> String {
    let Some(project) = &state.project else {
        return "no project selected".to_string();
    };
    let status = match state.status {
        TimerStatus::Idle => "idle",
        TimerStatus::Running => "running",
        TimerStatus::Paused => "paused",
    };
    let mut line = format!("{} [{}] {}", project.name, status, state.formatted);
    if !state.work_type_name.is_empty() {
        let _ = write!(line, " | {}", state.work_type_name);
    }
    if let Some(limit) = state.time_limit_ms {
        let _ = write!(line, " | limit {}", format_time(limit));
    }
    if let Some(total) = state.daily_total_ms {
        let _ = write!(line, " | today {}", format_time(total));
    }
    line
}

pub fn describe_pomodoro(state: &PomodoroStateResponse) -> String {
    format!(
        "pomodoro {} [{:?}] {} ({} sessions done)",
        state.phase.as_str(),
        state.status,
        state.formatted,
        state.completed_sessions
    )
}

async fn list_projects(ctx: &AppContext) -> Result<String, String> {
    let projects = ctx.api.list_projects().await.map_err(|e| e.to_string())?;
    let snapshots = ctx.engine.project_snapshots().unwrap_or_default();
    let active = ctx
        .engine
        .get_state()
        .ok()
        .and_then(|state| state.project)
        .map(|project| project.id);

    if projects.is_empty() {
        return Ok("no projects".to_string());
    }
    let mut out = String::new();
    for project in &projects {
        let marker = if active.as_deref() == Some(project.id.as_str()) {
            '*'
        } else {
            ' '
        };
        let _ = write!(out, "{} {:<12} {}", marker, project.id, project.name);
        if let Some(timer) = snapshots.get(&project.id) {
            let _ = write!(
                out,
                "  ({:?} {})",
                timer.status,
                format_time(timer.elapsed_time)
            );
        }
        out.push('\n');
    }
    Ok(out.trim_end().to_string())
}

/// Имя проекта по id (для switch без имени); при ошибке API - сам id
async fn project_name(ctx: &AppContext, project_id: &str) -> String {
    match ctx.api.list_projects().await {
        Ok(projects) => projects
            .into_iter()
            .find(|p| p.id == project_id)
            .map(|p| p.name)
            .unwrap_or_else(|| project_id.to_string()),
        Err(e) => {
            info!("[CMD] Project list unavailable ({}), using id as name", e);
            project_id.to_string()
        }
    }
}

async fn build_report(ctx: &AppContext, group_by: GroupBy, days: u32) -> Result<String, String> {
    let now = Local
        .timestamp_millis_opt(ctx.clock.now_ms())
        .single()
        .unwrap_or_else(Local::now);
    let first_day = now.date_naive() - Duration::days(i64::from(days.saturating_sub(1)));
    let (from, _) = report::day_bounds(first_day, &Local)
        .ok_or_else(|| format!("cannot compute report range starting {}", first_day))?;
    let to = now.with_timezone(&Utc);

    let entries = ctx
        .api
        .list_time_entries(from, to)
        .await
        .map_err(|e| e.to_string())?;
    Ok(report::render(&report::group_entries(&entries, group_by, &Local)))
}
