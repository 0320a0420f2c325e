// restoretool/src/restore/log.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogLine {
    pub fn render(&self) -> String {
        format!("[{}] {}", self.timestamp.format("%Y-%m-%d %H:%M:%S"), self.message)
    }
}

/// A log line pushed live to whoever is watching the given session.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub session_id: Option<String>,
    pub operation: &'static str,
    pub line: LogLine,
}

/// Ordered, timestamped transcript of one restore run.
///
/// Every line goes to `tracing`, to the in-memory transcript, to the per-run
/// log file (when attached) and to the session's broadcast channel.
#[derive(Clone)]
pub struct RestoreLogger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    session_id: Option<String>,
    channel: Option<broadcast::Sender<LogEvent>>,
    lines: Mutex<Vec<LogLine>>,
    file: Mutex<Option<File>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RestoreLogger {
    pub fn new(session_id: Option<String>, channel: Option<broadcast::Sender<LogEvent>>) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                session_id,
                channel,
                lines: Mutex::new(Vec::new()),
                file: Mutex::new(None),
            }),
        }
    }

    /// Persists every subsequent line to `path` (appending).
    pub fn attach_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for line in lock(&self.inner.lines).iter() {
            writeln!(file, "{}", line.render())?;
        }
        *lock(&self.inner.file) = Some(file);
        Ok(())
    }

    pub fn log(&self, message: impl Into<String>) {
        let line = LogLine {
            timestamp: Utc::now(),
            message: message.into(),
        };
        tracing::info!(target: "restore", "{}", line.message);

        if let Some(file) = lock(&self.inner.file).as_mut() {
            if let Err(e) = writeln!(file, "{}", line.render()) {
                tracing::warn!("Failed to persist restore log line: {}", e);
            }
        }

        if let Some(channel) = &self.inner.channel {
            // No subscribers is fine; nobody is watching this session.
            let _ = channel.send(LogEvent {
                session_id: self.inner.session_id.clone(),
                operation: "restore",
                line: line.clone(),
            });
        }

        lock(&self.inner.lines).push(line);
    }

    pub fn lines(&self) -> Vec<LogLine> {
        lock(&self.inner.lines).clone()
    }

    pub fn transcript(&self) -> String {
        lock(&self.inner.lines)
            .iter()
            .map(LogLine::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn contains(&self, needle: &str) -> bool {
        lock(&self.inner.lines)
            .iter()
            .any(|line| line.message.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_ordered_and_transcribed() {
        let logger = RestoreLogger::new(None, None);
        logger.log("first");
        logger.log(String::from("second"));

        let lines = logger.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "first");
        assert!(lines[0].timestamp <= lines[1].timestamp);

        let transcript = logger.transcript();
        assert!(transcript.ends_with("] second"));
        assert_eq!(transcript.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_lines_are_broadcast_with_session() {
        let (tx, mut rx) = broadcast::channel(16);
        let logger = RestoreLogger::new(Some("session-42".to_string()), Some(tx));
        logger.log("hello");

        let event = rx.recv().await.expect("event");
        assert_eq!(event.session_id.as_deref(), Some("session-42"));
        assert_eq!(event.operation, "restore");
        assert_eq!(event.line.message, "hello");
    }

    #[test]
    fn test_attached_file_receives_earlier_and_later_lines() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("logs").join("restore.log");
        let logger = RestoreLogger::new(None, None);
        logger.log("before");
        logger.attach_file(&path)?;
        logger.log("after");

        let content = std::fs::read_to_string(&path)?;
        assert!(content.contains("] before"));
        assert!(content.contains("] after"));
        Ok(())
    }
}
