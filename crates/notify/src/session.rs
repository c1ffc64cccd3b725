use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Session ids are two lowercase words ("wise penguin"). Anything else
/// (empty, whitespace, uppercase, extra words) is rejected at the door.
pub fn is_valid_session_id(session_id: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"^[a-z]+\s[a-z]+$").expect("valid regex"));
    let trimmed = session_id.trim();
    !trimmed.is_empty() && pattern.is_match(session_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// TTS stream consumers: narrow event whitelist, user binding optional.
    Audio,
    /// Queue/event subscribers: authenticated, subscriber-defined events.
    Queue,
}

/// The only events an audio session ever receives.
pub fn audio_event_whitelist() -> Vec<String> {
    ["audio_streaming_status", "audio_streaming_complete", "sys_ping"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Replace,
    Add,
    Remove,
}

impl SubscriptionAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "replace" => Some(Self::Replace),
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}
