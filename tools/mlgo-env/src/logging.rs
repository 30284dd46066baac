use crate::errors::MlgoError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

static RUN_LOGGER: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), MlgoError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| MlgoError::Io(e.to_string()))?;
        }
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
        })
        .map_err(|e| MlgoError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| MlgoError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| MlgoError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| MlgoError::Io(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            prune_log_dir(parent, &self.path, self.budget_bytes)?;
        }
        Ok(())
    }
}

fn run_logger() -> &'static Mutex<Option<JsonlLogger>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Routes [`append_run_log`] to `logger` for the rest of the process.
pub fn init_run_logger(logger: JsonlLogger) {
    *run_logger().lock().expect("run logger lock poisoned") = Some(logger);
}

pub fn clear_run_logger() {
    *run_logger().lock().expect("run logger lock poisoned") = None;
}

/// No-op until [`init_run_logger`]; a failed append degrades to a stderr line.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let guard = run_logger().lock().expect("run logger lock poisoned");
    let Some(logger) = guard.as_ref() else {
        return;
    };
    let event = LogEvent {
        level,
        event_type,
        payload,
    };
    if let Err(err) = logger.append(&event) {
        eprintln!(
            "{}",
            structured_fallback_line(event_type, level, &err.to_string())
        );
    }
}

pub fn structured_fallback_line(event_type: &str, level: &str, message: &str) -> String {
    format!(
        "event_type={event_type} level={level} message={} ",
        message.replace('\n', "\\n")
    )
}

/// Deletes the oldest `*.jsonl` files in `dir` until the total fits
/// `budget_bytes`. The file currently being written is never removed.
pub fn prune_log_dir(
    dir: &Path,
    active: &Path,
    budget_bytes: u64,
) -> Result<Vec<PathBuf>, MlgoError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| MlgoError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "jsonl"))
        .filter_map(|path| {
            let meta = fs::metadata(&path).ok()?;
            Some((meta.modified().ok(), meta.len(), path))
        })
        .collect::<Vec<_>>();
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut total = files.iter().map(|(_, len, _)| *len).sum::<u64>();
    let mut deleted = Vec::new();
    for (_, len, path) in files {
        if total <= budget_bytes {
            break;
        }
        if path == active {
            continue;
        }
        fs::remove_file(&path).map_err(|e| MlgoError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }
    Ok(deleted)
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
