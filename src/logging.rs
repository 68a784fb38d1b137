//! Structured logging module for Persona Anchor
//!
//! Writes daily log files with categories:
//! - CALIBRATION: Dimension calibration and cache decisions
//! - SCORING: Per-message scoring cycles
//! - DRIFT: Drift detector decisions and numerical fallbacks
//! - CORRECTION: Correction state machine transitions
//! - SESSION: Session lifecycle (chat switch, swipes, reports)
//! - ERROR: Errors and degraded paths
//!
//! Every line is also emitted as a `tracing` event, filtered by `RUST_LOG`.

use chrono::{Local, Utc};
use once_cell::sync::Lazy;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Log categories for structured logging
#[derive(Debug, Clone, Copy)]
pub enum LogCategory {
    Calibration, // Calibration requests and cache hits
    Scoring,     // Scoring cycles
    Drift,       // Drift triggers and degeneracies
    Correction,  // Correction transitions
    Session,     // Session lifecycle
    Error,       // Errors and degraded paths
}

impl LogCategory {
    fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Calibration => "CALIBRATION",
            LogCategory::Scoring => "SCORING",
            LogCategory::Drift => "DRIFT",
            LogCategory::Correction => "CORRECTION",
            LogCategory::Session => "SESSION",
            LogCategory::Error => "ERROR",
        }
    }
}

/// Log directory once initialized; file output is off until then.
static LOG_DIR: Lazy<Mutex<Option<PathBuf>>> = Lazy::new(|| Mutex::new(None));

/// Default log directory path
pub fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".local/state/persona-anchor/logs")
}

fn log_file_path(dir: &Path) -> PathBuf {
    let today = Local::now().format("%Y-%m-%d").to_string();
    dir.join(format!("persona-anchor-{}.log", today))
}

/// Initialize the logging system - creates log directory if needed.
/// Safe to call more than once.
pub fn init_logging(dir: Option<&Path>) -> std::io::Result<()> {
    let log_dir = dir.map(Path::to_path_buf).unwrap_or_else(default_log_dir);

    if !log_dir.exists() {
        fs::create_dir_all(&log_dir)?;
    }

    // A subscriber may already be installed by the host or an earlier call.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .try_init();

    if let Ok(mut guard) = LOG_DIR.lock() {
        *guard = Some(log_dir);
    }

    log(LogCategory::Session, None, "Persona Anchor logging initialized");
    Ok(())
}

/// Log a message with category and optional chat context
pub fn log(category: LogCategory, chat_id: Option<&str>, message: &str) {
    let chat_context = chat_id
        .map(|id| format!("chat={} | ", id.chars().take(8).collect::<String>()))
        .unwrap_or_default();

    match category {
        LogCategory::Error => tracing::warn!(category = category.as_str(), "{}{}", chat_context, message),
        _ => tracing::info!(category = category.as_str(), "{}{}", chat_context, message),
    }

    let dir = match LOG_DIR.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    };
    let Some(dir) = dir else {
        return;
    };

    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let log_line = format!(
        "[{}] [{}] {}{}\n",
        timestamp,
        category.as_str(),
        chat_context,
        message
    );
    if let Ok(mut file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(&dir))
    {
        let _ = file.write_all(log_line.as_bytes());
    }
}

pub fn log_calibration(chat_id: Option<&str>, message: &str) {
    log(LogCategory::Calibration, chat_id, message);
}

pub fn log_scoring(chat_id: Option<&str>, message: &str) {
    log(LogCategory::Scoring, chat_id, message);
}

pub fn log_drift(chat_id: Option<&str>, message: &str) {
    log(LogCategory::Drift, chat_id, message);
}

pub fn log_correction(chat_id: Option<&str>, message: &str) {
    log(LogCategory::Correction, chat_id, message);
}

pub fn log_session(chat_id: Option<&str>, message: &str) {
    log(LogCategory::Session, chat_id, message);
}

pub fn log_error(chat_id: Option<&str>, message: &str) {
    log(LogCategory::Error, chat_id, message);
}

/// Clean up old log files (keep last 7 days)
pub fn cleanup_old_logs() -> std::io::Result<usize> {
    let log_dir = match LOG_DIR.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    };
    let Some(log_dir) = log_dir else {
        return Ok(0);
    };
    if !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = Utc::now() - chrono::Duration::days(7);
    let mut deleted = 0;

    for entry in fs::read_dir(&log_dir)? {
        let entry = entry?;
        let path = entry.path();

        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                let modified_time: chrono::DateTime<Utc> = modified.into();
                if modified_time < cutoff && fs::remove_file(&path).is_ok() {
                    deleted += 1;
                }
            }
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_categorized_lines_to_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        init_logging(Some(dir.path())).unwrap();
        log_correction(Some("0123456789abcdef"), "opened correction for warmth");

        let contents = fs::read_to_string(log_file_path(dir.path())).unwrap();
        assert!(contents.contains("[CORRECTION] chat=01234567 | opened correction for warmth"));
        assert_eq!(cleanup_old_logs().unwrap(), 0);
    }
}
