//! Table and size formatting for CLI output.

use chrono::{DateTime, Utc};
use comfy_table::{ContentArrangement, Table};

/// A borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// How long ago `dt` was, relative to now.
pub fn format_ago(dt: &DateTime<Utc>) -> String {
    format_ago_from(dt, &Utc::now())
}

fn format_ago_from(dt: &DateTime<Utc>, now: &DateTime<Utc>) -> String {
    let duration = now.signed_duration_since(*dt);
    let secs = duration.num_seconds();
    if secs < 60 {
        return "just now".to_string();
    }
    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }
    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }
    format!("{} days ago", duration.num_days())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.50 GiB");
    }

    #[test]
    fn test_format_ago() {
        let now = Utc::now();
        assert_eq!(format_ago_from(&now, &now), "just now");
        assert_eq!(format_ago_from(&(now + Duration::seconds(30)), &now), "just now");
        assert_eq!(format_ago_from(&(now - Duration::minutes(5)), &now), "5 minutes ago");
        assert_eq!(format_ago_from(&(now - Duration::hours(3)), &now), "3 hours ago");
        assert_eq!(format_ago_from(&(now - Duration::days(40)), &now), "40 days ago");
    }

    #[test]
    fn test_table_renders_rows() {
        let mut table = new_table(&["NAME", "SIZE"]);
        table.add_row(vec!["a".to_string(), format_bytes(10)]);
        let rendered = table.to_string();
        assert!(rendered.contains("NAME"));
        assert!(rendered.contains("10 B"));
    }
}
