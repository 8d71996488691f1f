//! Human-readable formatting helpers shared by the report and the CLI.

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Format a byte count with binary multiples, e.g. `1536` -> `"1.50 KB"`.
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", size, SIZE_UNITS[unit])
}

/// Shorten `text` to at most `max_chars` characters for display.
pub fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }

    let mut short: String = trimmed.chars().take(max_chars).collect();
    short.push_str("...");
    short
}

/// Three-line section banner used in logs and reports.
pub fn section(title: &str) -> String {
    let border = "─".repeat(60);
    format!("{border}\n  {title}\n{border}")
}
