use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Task completion (success or failure).
    Task,
    /// Progress updates during long operations.
    Progress,
    /// Warnings and important messages.
    Alert,
    /// Free-form messages.
    Custom,
    /// A message the user sent *to* a running job.
    UserInitiatedMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    /// Spoken immediately regardless of ding suppression.
    Urgent,
}

impl NotificationPriority {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "normal" => Some(Self::Medium),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// A persisted, user-visible notification row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub sender_id: String,
    pub recipient_id: String,
    pub job_id: Option<String>,
    pub kind: NotificationKind,
    pub priority: NotificationPriority,
    pub message: String,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub response_requested: bool,
    pub response_value: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What callers hand to [`crate::NotificationLog::notify`].
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub sender_id: String,
    pub target_user: String,
    pub message: String,
    pub kind: NotificationKind,
    pub priority: NotificationPriority,
    pub job_id: Option<String>,
    pub abstract_text: Option<String>,
    pub suppress_ding: bool,
    pub response_requested: bool,
}

impl NotificationRequest {
    pub fn new(
        sender_id: impl Into<String>,
        target_user: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            target_user: target_user.into(),
            message: message.into(),
            kind: NotificationKind::Custom,
            priority: NotificationPriority::Medium,
            job_id: None,
            abstract_text: None,
            suppress_ding: false,
            response_requested: false,
        }
    }

    pub fn kind(mut self, kind: NotificationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn abstract_text(mut self, text: impl Into<String>) -> Self {
        self.abstract_text = Some(text.into());
        self
    }
}
