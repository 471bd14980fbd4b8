// ABOUTME: Human-readable activity trail of operator actions
// ABOUTME: Timestamped lines in a capped file, written best-effort

use crate::error::Result;
use chrono::Local;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ActivityLog {
    path: PathBuf,
    limit: usize,
    write_lock: Arc<Mutex<()>>,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit: limit.max(1),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `[YYYY-MM-DD HH:MM:SS] message`, dropping the oldest lines past the cap.
    /// Failures are logged, never returned.
    pub async fn append(&self, message: &str) {
        if let Err(e) = self.try_append(message).await {
            warn!(
                "Failed to write activity log {}: {}",
                self.path.display(),
                e
            );
        }
    }

    async fn try_append(&self, message: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;

        let existing = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };

        let entry = format!(
            "[{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            message.replace('\n', " ")
        );

        let mut lines: Vec<&str> = existing.lines().collect();
        if lines.len() >= self.limit {
            lines.drain(..lines.len() + 1 - self.limit);
        }
        lines.push(&entry);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut contents = lines.join("\n");
        contents.push('\n');
        fs::write(&self.path, contents).await
    }

    /// Full log contents, or an empty string before the first entry
    pub async fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}
