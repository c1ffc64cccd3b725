use std::fs;
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fabric::Fabric;
use crate::types::{Notification, NotificationRequest};

/// Append-only JSONL record of user-visible notifications.
///
/// Persistence first, emission second: a notification that reached disk is
/// replayable from a job's interaction history even if no session was
/// connected when it fired.
pub struct NotificationLog {
    path: PathBuf,
    // Serializes appends so interleaved writers cannot shear lines.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for NotificationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationLog").field("path", &self.path).finish()
    }
}

impl NotificationLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Persist a notification row and push a `notification_queue_update`
    /// event to the target user's sessions. Returns the new notification id.
    pub fn notify(&self, fabric: &Fabric, request: NotificationRequest) -> Result<Uuid> {
        let notification = Notification {
            id: Uuid::new_v4(),
            sender_id: request.sender_id,
            recipient_id: request.target_user,
            job_id: request.job_id,
            kind: request.kind,
            priority: request.priority,
            message: request.message,
            abstract_text: request.abstract_text,
            response_requested: request.response_requested,
            response_value: None,
            created_at: Utc::now(),
        };

        self.append(&notification)?;
        let payload = serde_json::to_value(&notification)?;
        let reached = fabric.emit_to_user(
            &notification.recipient_id,
            "notification_queue_update",
            payload,
        );
        debug!(
            id = %notification.id,
            recipient = %notification.recipient_id,
            sessions = reached,
            "notification persisted and emitted"
        );
        Ok(notification.id)
    }

    fn append(&self, notification: &Notification) -> Result<()> {
        let _guard = self.write_lock.lock().expect("notification write lock");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(notification)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<Notification>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut rows = Vec::new();
        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Notification>(&line) {
                Ok(row) => rows.push(row),
                Err(err) => warn!(
                    line = line_idx + 1,
                    %err,
                    path = %self.path.display(),
                    "corrupt notification line — skipping"
                ),
            }
        }
        Ok(rows)
    }

    /// Drop every persisted notification. Returns how many rows were cleared.
    pub fn clear(&self) -> Result<usize> {
        let cleared = self.load()?.len();
        let _guard = self.write_lock.lock().expect("notification write lock");
        if self.path.exists() {
            fs::write(&self.path, b"")?;
        }
        Ok(cleared)
    }

    /// All notifications tied to one job, newest first.
    pub fn for_job(&self, job_id: &str) -> Result<Vec<Notification>> {
        let mut rows: Vec<Notification> = self
            .load()?
            .into_iter()
            .filter(|row| row.job_id.as_deref() == Some(job_id))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    /// Latest notifications for one recipient, newest first.
    pub fn for_recipient(&self, user_id: &str, max_rows: usize) -> Result<Vec<Notification>> {
        let mut rows: Vec<Notification> = self
            .load()?
            .into_iter()
            .filter(|row| row.recipient_id == user_id)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(max_rows);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionKind;
    use crate::types::{NotificationKind, NotificationPriority};
    use serde_json::json;

    fn log_in(dir: &Path) -> NotificationLog {
        NotificationLog::new(dir.join("notifications.jsonl"))
    }

    #[tokio::test]
    async fn notify_persists_and_emits_to_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        let fabric = Fabric::new();
        let mut rx = fabric.connect(
            "wise penguin",
            ConnectionKind::Queue,
            Some("alice".to_string()),
            None,
        );

        let id = log
            .notify(
                &fabric,
                NotificationRequest::new("scheduler", "alice", "your job finished")
                    .kind(NotificationKind::Task)
                    .priority(NotificationPriority::High)
                    .job_id("job-1"),
            )
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "notification_queue_update");
        assert_eq!(event.payload["id"], json!(id.to_string()));
        assert_eq!(event.payload["message"], "your job finished");

        let rows = log.load().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].kind, NotificationKind::Task);
    }

    #[tokio::test]
    async fn notify_without_connected_session_still_persists() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        let fabric = Fabric::new();

        log.notify(&fabric, NotificationRequest::new("scheduler", "bob", "hello"))
            .unwrap();
        assert_eq!(log.load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn for_job_filters_and_sorts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        let fabric = Fabric::new();

        for (job, message) in [("job-1", "first"), ("job-2", "other"), ("job-1", "second")] {
            log.notify(
                &fabric,
                NotificationRequest::new("scheduler", "alice", message).job_id(job),
            )
            .unwrap();
        }

        let rows = log.for_job("job-1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message, "second");
        assert_eq!(rows[1].message, "first");
    }

    #[tokio::test]
    async fn for_recipient_truncates_to_max() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        let fabric = Fabric::new();

        for i in 0..5 {
            log.notify(
                &fabric,
                NotificationRequest::new("scheduler", "alice", format!("n{i}")),
            )
            .unwrap();
        }
        log.notify(&fabric, NotificationRequest::new("scheduler", "bob", "not alice"))
            .unwrap();

        let rows = log.for_recipient("alice", 3).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.recipient_id == "alice"));
    }
}
