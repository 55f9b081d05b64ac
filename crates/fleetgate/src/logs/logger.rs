//! Logger configuration and structured output formatting.
//!
//! Builds on `env_logger` with a compact, column-aligned format: local
//! timestamp, colored level, source location, message. Honors `RUST_LOG`
//! over the configured default filter and `NO_COLOR` for plain output.

use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::io::Write;

/// Visible width reserved for the level column.
const LEVEL_FIELD_WIDTH: usize = 5;

/// Visible width reserved for the `file:line` column.
const TARGET_FIELD_WIDTH: usize = 28;

fn level_color(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "\x1b[31m", // red
        log::Level::Warn => "\x1b[33m",  // yellow
        log::Level::Info => "\x1b[32m",  // green
        log::Level::Debug => "\x1b[36m", // cyan
        log::Level::Trace => "\x1b[90m", // bright black
    }
}

fn parse_filter(filter: &str) -> LevelFilter {
    match filter.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        "off" => LevelFilter::Off,
        other => {
            eprintln!("unknown logLevel {:?}, falling back to info", other);
            LevelFilter::Info
        }
    }
}

/// Configures the global logger.
///
/// `default_level` comes from the `logLevel` config key; a `RUST_LOG`
/// environment variable takes precedence so operators can raise verbosity
/// per-module without touching the config file.
pub fn configure_logger(default_level: &str) {
    let mut builder = Builder::new();

    if let Ok(spec) = env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    } else {
        builder.filter_level(parse_filter(default_level));
        // Keep dependency chatter down at the default level.
        builder.filter_module("actix_server", LevelFilter::Warn);
        builder.filter_module("hyper", LevelFilter::Warn);
        builder.filter_module("reqwest", LevelFilter::Warn);
    }

    let use_color = env::var_os("NO_COLOR").is_none();

    builder.format(move |buf, record| {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let target = match (record.file(), record.line()) {
            (Some(file), Some(line)) => {
                let short = file.rsplit('/').next().unwrap_or(file);
                format!("{}:{}", short, line)
            }
            _ => record.target().to_string(),
        };
        let level = record.level();
        if use_color {
            writeln!(
                buf,
                "{} {}{:<level_width$}\x1b[0m {:<target_width$} {}",
                timestamp,
                level_color(level),
                level,
                target,
                record.args(),
                level_width = LEVEL_FIELD_WIDTH,
                target_width = TARGET_FIELD_WIDTH,
            )
        } else {
            writeln!(
                buf,
                "{} {:<level_width$} {:<target_width$} {}",
                timestamp,
                level,
                target,
                record.args(),
                level_width = LEVEL_FIELD_WIDTH,
                target_width = TARGET_FIELD_WIDTH,
            )
        }
    });

    // try_init so tests calling configure twice don't panic.
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_parsing_falls_back_to_info() {
        assert_eq!(parse_filter("warn"), LevelFilter::Warn);
        assert_eq!(parse_filter("TRACE"), LevelFilter::Trace);
        assert_eq!(parse_filter("verbose"), LevelFilter::Info);
    }
}
