use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn engine_log_path(log_root: &Path) -> PathBuf {
    log_root.join("logs/engine.log")
}

pub fn append_log_line(log_root: &Path, level: &str, event: &str, message: &str) {
    let payload = serde_json::json!({
        "timestamp": super::time::now_rfc3339(),
        "level": level,
        "event": event,
        "message": message,
    });

    let Ok(line) = serde_json::to_string(&payload) else {
        return;
    };

    let path = engine_log_path(log_root);
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = writeln!(file, "{line}");
}

/// JSON-lines log destination shared by the engine, bridges and clients.
/// A sink without a root discards everything.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    root: Option<PathBuf>,
}

impl LogSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { root: None }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn info(&self, event: &str, message: &str) {
        self.write("info", event, message);
    }

    pub fn warn(&self, event: &str, message: &str) {
        self.write("warn", event, message);
    }

    pub fn error(&self, event: &str, message: &str) {
        self.write("error", event, message);
    }

    fn write(&self, level: &str, event: &str, message: &str) {
        if let Some(root) = self.root.as_deref() {
            append_log_line(root, level, event, message);
        }
    }
}
