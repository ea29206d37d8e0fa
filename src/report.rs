use crate::api::TimeEntry;
use crate::format::format_time;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

/// Группировка отчёта
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Project,
    WorkType,
    Day,
}

impl FromStr for GroupBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "project" | "projects" => Ok(Self::Project),
            "work-type" | "worktype" | "type" => Ok(Self::WorkType),
            "day" | "days" | "date" => Ok(Self::Day),
            other => Err(format!(
                "unknown grouping '{}', expected project, work-type or day",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub key: String,
    pub label: String,
    pub total_ms: u64,
    pub entries: usize,
}

/// Сумма длительностей
pub fn total(entries: &[TimeEntry]) -> u64 {
    entries.iter().map(|e| e.duration_ms).sum()
}

/// Сгруппировать записи и просуммировать длительности.
/// Project/WorkType - по убыванию суммы, Day - по дате.
pub fn group_entries<Tz: TimeZone>(entries: &[TimeEntry], by: GroupBy, tz: &Tz) -> Vec<ReportRow> {
    let mut groups: BTreeMap<String, ReportRow> = BTreeMap::new();

    for entry in entries {
        let (key, label) = match by {
            GroupBy::Project => (
                entry.project_id.clone(),
                entry
                    .project_name
                    .clone()
                    .unwrap_or_else(|| entry.project_id.clone()),
            ),
            GroupBy::WorkType => match &entry.work_type_id {
                Some(id) => (
                    id.clone(),
                    entry.work_type_name.clone().unwrap_or_else(|| id.clone()),
                ),
                None => (String::new(), "(no work type)".to_string()),
            },
            GroupBy::Day => {
                let day = entry.start_time.with_timezone(tz).date_naive().to_string();
                (day.clone(), day)
            }
        };

        let row = groups.entry(key.clone()).or_insert_with(|| ReportRow {
            key,
            label,
            total_ms: 0,
            entries: 0,
        });
        row.total_ms += entry.duration_ms;
        row.entries += 1;
    }

    let mut rows: Vec<ReportRow> = groups.into_values().collect();
    if by != GroupBy::Day {
        rows.sort_by(|a, b| b.total_ms.cmp(&a.total_ms).then_with(|| a.label.cmp(&b.label)));
    }
    rows
}

/// Границы дня в часовом поясе tz, в UTC
pub fn day_bounds<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = tz
        .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .earliest()?
        .with_timezone(&Utc);
    Some((start, start + Duration::days(1)))
}

/// Текстовая таблица отчёта
pub fn render(rows: &[ReportRow]) -> String {
    if rows.is_empty() {
        return "No time entries in range".to_string();
    }
    let width = rows.iter().map(|r| r.label.chars().count()).max().unwrap_or(0);
    let mut out = String::new();
    for row in rows {
        let _ = writeln!(
            out,
            "{:<width$}  {}  ({} {})",
            row.label,
            format_time(row.total_ms),
            row.entries,
            if row.entries == 1 { "entry" } else { "entries" },
            width = width
        );
    }
    let sum: u64 = rows.iter().map(|r| r.total_ms).sum();
    let _ = write!(out, "{:<width$}  {}", "Total", format_time(sum), width = width);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(project: &str, work_type: Option<&str>, start: &str, minutes: u64) -> TimeEntry {
        let start_time: DateTime<Utc> = start.parse().unwrap();
        TimeEntry {
            id: format!("{}-{}", project, start),
            project_id: project.to_string(),
            project_name: Some(format!("Project {}", project)),
            work_type_id: work_type.map(|w| w.to_string()),
            work_type_name: work_type.map(|w| w.to_uppercase()),
            start_time,
            end_time: start_time + Duration::minutes(minutes as i64),
            duration_ms: minutes * 60_000,
            description: None,
        }
    }

    #[test]
    fn test_group_by_project_sorted_by_total() {
        let entries = vec![
            entry("a", None, "2024-03-01T09:00:00Z", 30),
            entry("b", None, "2024-03-01T10:00:00Z", 90),
            entry("a", None, "2024-03-02T09:00:00Z", 15),
        ];
        let rows = group_entries(&entries, GroupBy::Project, &Utc);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "b");
        assert_eq!(rows[0].total_ms, 90 * 60_000);
        assert_eq!(rows[1].label, "Project a");
        assert_eq!(rows[1].entries, 2);
        assert_eq!(rows[1].total_ms, 45 * 60_000);
    }

    #[test]
    fn test_group_by_work_type_collects_untyped_entries() {
        let entries = vec![
            entry("a", Some("dev"), "2024-03-01T09:00:00Z", 20),
            entry("a", None, "2024-03-01T10:00:00Z", 10),
            entry("b", Some("dev"), "2024-03-01T11:00:00Z", 20),
        ];
        let rows = group_entries(&entries, GroupBy::WorkType, &Utc);
        assert_eq!(rows[0].label, "DEV");
        assert_eq!(rows[0].total_ms, 40 * 60_000);
        assert_eq!(rows[1].label, "(no work type)");
    }

    #[test]
    fn test_group_by_day_is_chronological() {
        let entries = vec![
            entry("a", None, "2024-03-02T09:00:00Z", 60),
            entry("a", None, "2024-03-01T09:00:00Z", 5),
        ];
        let rows = group_entries(&entries, GroupBy::Day, &Utc);
        assert_eq!(rows[0].key, "2024-03-01");
        assert_eq!(rows[1].key, "2024-03-02");
    }

    #[test]
    fn test_day_bounds_utc() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let (start, end) = day_bounds(date, &Utc).unwrap();
        assert_eq!(start.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(end - start, Duration::days(1));
    }

    #[test]
    fn test_render_includes_total() {
        let entries = vec![entry("a", None, "2024-03-01T09:00:00Z", 61)];
        let text = render(&group_entries(&entries, GroupBy::Project, &Utc));
        assert!(text.contains("01:01:00"));
        assert!(text.contains("Total"));
        assert_eq!(render(&[]), "No time entries in range");
    }

    #[test]
    fn test_group_by_parse() {
        assert_eq!("work-type".parse::<GroupBy>(), Ok(GroupBy::WorkType));
        assert!("week".parse::<GroupBy>().is_err());
    }
}
