/// Форматирование длительности (мс) как `HH:MM:SS`.
/// Часы не обрезаются: 100 часов → `100:00:00`.
pub fn format_time(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Человекочитаемая длительность для уведомлений: "2 h 15 min", "45 min", "30 s"
pub fn format_human(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;

    match (hours, minutes) {
        (0, 0) => format!("{} s", total_secs),
        (0, m) => format!("{} min", m),
        (h, 0) => format!("{} h", h),
        (h, m) => format!("{} h {} min", h, m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time_one_hour_one_minute_one_second() {
        assert_eq!(format_time(3_661_000), "01:01:01");
    }

    #[test]
    fn test_format_time_zero_and_sub_second() {
        assert_eq!(format_time(0), "00:00:00");
        assert_eq!(format_time(999), "00:00:00");
    }

    #[test]
    fn test_format_time_over_99_hours() {
        assert_eq!(format_time(100 * 3_600_000), "100:00:00");
    }

    #[test]
    fn test_format_human() {
        assert_eq!(format_human(30_000), "30 s");
        assert_eq!(format_human(45 * 60_000), "45 min");
        assert_eq!(format_human(3_600_000), "1 h");
        assert_eq!(format_human(2 * 3_600_000 + 15 * 60_000), "2 h 15 min");
    }
}
