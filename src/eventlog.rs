//! Append-only JSON-lines event logs.
//!
//! One [`EventLog`] per file (`honeypot_hits.log`, `block_events.log`,
//! `alert_events.log`); each write is a single `O_APPEND` write of one JSON
//! line, relying on small-write atomicity rather than any cross-process
//! locking, per SPEC_FULL.md §5 — mirrors the upstream `log_event`/
//! `log_honeypot_hit` helpers.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct EventLog {
    path: PathBuf,
    // Serializes concurrent appends from this process; the file is still
    // opened in append mode so writes from other processes interleave safely.
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Append one JSON line: `{"timestamp": <iso>, "event_type": <str>, ...data}`.
    pub async fn log_event(&self, event_type: &str, data: Value) {
        let mut record = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event_type": event_type,
        });
        if let (Value::Object(record_map), Value::Object(data_map)) = (&mut record, data) {
            record_map.extend(data_map);
        }
        self.append_line(&record.to_string()).await;
    }

    pub async fn log<T: Serialize>(&self, event_type: &str, data: &T) {
        let value = serde_json::to_value(data).unwrap_or(Value::Null);
        self.log_event(event_type, value).await;
    }

    async fn append_line(&self, line: &str) {
        let _guard = self.lock.lock().await;
        if let Some(parent) = Path::new(&self.path).parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let file = OpenOptions::new().append(true).create(true).open(&self.path).await;
        match file {
            Ok(mut f) => {
                let mut payload = line.to_string();
                payload.push('\n');
                if let Err(e) = f.write_all(payload.as_bytes()).await {
                    tracing::error!(error = %e, path = %self.path.display(), "failed to append event log line");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, path = %self.path.display(), "failed to open event log file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_json_line_per_call() {
        let dir = std::env::temp_dir().join(format!("ai-defense-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("events.log");
        let log = EventLog::new(&path);

        log.log_event("BLOCKLIST_ADD", json!({"ip": "1.2.3.4"})).await;
        log.log_event("BLOCKLIST_ADD", json!({"ip": "5.6.7.8"})).await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event_type"], "BLOCKLIST_ADD");
        assert_eq!(first["ip"], "1.2.3.4");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn creates_parent_directory_if_missing() {
        let dir = std::env::temp_dir().join(format!("ai-defense-test-nested-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("events.log");
        let log = EventLog::new(&path);
        log.log_event("TEST", json!({})).await;
        assert!(path.exists());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
