use std::env;
use std::fs::OpenOptions;
use std::io::Write;

use chrono::Local;

pub const LOG_ENV: &str = "TEMPDYLIB_LOG";
pub const LOG_FILE_ENV: &str = "TEMPDYLIB_LOG_FILE";

/// Verbosity read from `TEMPDYLIB_LOG`. Anything unrecognised is `Quiet`,
/// since a library should stay silent unless asked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Quiet,
    Info,
    Debug,
}

impl LogLevel {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "info" | "1" | "true" => LogLevel::Info,
            _ => LogLevel::Quiet,
        }
    }
}

fn log_level() -> LogLevel {
    env::var(LOG_ENV)
        .map(|v| LogLevel::parse(&v))
        .unwrap_or(LogLevel::Quiet)
}

fn emit(level: LogLevel, message: &str) {
    if log_level() < level {
        return;
    }
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let log_message = format!("[{}] {}", timestamp, message);
    eprintln!("{}", log_message);

    // Append-only; never read the log back.
    if let Ok(path) = env::var(LOG_FILE_ENV) {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
            let _ = writeln!(file, "{}", log_message);
        }
    }
}

pub fn log(message: &str) {
    emit(LogLevel::Info, message);
}

pub fn log_debug(message: &str) {
    emit(LogLevel::Debug, message);
}

/// Errors are printed whenever logging is enabled at all.
pub fn log_error(message: &str) {
    emit(LogLevel::Info, &format!("error: {}", message));
}
