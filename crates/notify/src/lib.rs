//! Notification and streaming fabric: session registry, per-user event
//! fan-out, and the persisted notification record.

mod fabric;
mod session;
mod store;
mod types;

pub use fabric::{Fabric, ServerEvent};
pub use session::{ConnectionKind, SubscriptionAction, audio_event_whitelist, is_valid_session_id};
pub use store::NotificationLog;
pub use types::{Notification, NotificationKind, NotificationPriority, NotificationRequest};
