//! Output formatting utilities

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of rows
pub fn print_table<T: Tabled>(rows: &[T]) {
    if rows.is_empty() {
        println!("{}", "No items found".yellow());
        return;
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format a timestamp for tables, `-` when absent
pub fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Parse a lookback such as `30m`, `24h` or `7d`
pub fn parse_lookback(raw: &str) -> anyhow::Result<chrono::Duration> {
    let raw = raw.trim();
    let Some((split, _)) = raw.char_indices().last() else {
        anyhow::bail!("empty lookback, expected e.g. 30m, 24h, 7d");
    };
    let (value, unit) = raw.split_at(split);
    let value: i64 = value
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid lookback '{}', expected e.g. 30m, 24h, 7d", raw))?;

    match unit {
        "m" => Ok(chrono::Duration::minutes(value)),
        "h" => Ok(chrono::Duration::hours(value)),
        "d" => Ok(chrono::Duration::days(value)),
        _ => anyhow::bail!("invalid lookback unit in '{}', expected m, h or d", raw),
    }
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "ok" | "up" | "synced" | "healthy" => status.green().to_string(),
        "degraded" | "queued" | "low" => status.yellow().to_string(),
        "down" | "failed" | "unhealthy" | "high" => status.red().to_string(),
        _ => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lookback() {
        assert_eq!(parse_lookback("30m").unwrap(), chrono::Duration::minutes(30));
        assert_eq!(parse_lookback("24h").unwrap(), chrono::Duration::hours(24));
        assert_eq!(parse_lookback(" 7d ").unwrap(), chrono::Duration::days(7));
        assert!(parse_lookback("7w").is_err());
        assert!(parse_lookback("h").is_err());
        assert!(parse_lookback("").is_err());
    }

    #[test]
    fn test_format_time_absent() {
        assert_eq!(format_time(None), "-");
    }
}
