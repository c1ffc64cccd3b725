use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7999,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub solutions_dir: PathBuf,
    pub io_log_path: PathBuf,
    pub notifications_path: PathBuf,
    pub embedding_cache_path: PathBuf,
    pub dictionary_dir: PathBuf,
    pub agent_log_dir: PathBuf,
    pub last_response_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            solutions_dir: "conf/long-term-memory/solutions".into(),
            io_log_path: "io/log/interactions.jsonl".into(),
            notifications_path: "io/log/notifications.jsonl".into(),
            embedding_cache_path: "conf/embedding-cache.redb".into(),
            dictionary_dir: "conf/dictionaries".into(),
            agent_log_dir: "io/log".into(),
            last_response_path: "io/last_response.json".into(),
        }
    }
}

/// Immutable configuration snapshot.
///
/// Every component receives a clone (or `Arc`) of this at construction time;
/// runtime "reconfiguration" means building new components from a new
/// snapshot.  Freeform string keys live in the `[keys]` table so that
/// per-routing-command lookups like `"llm spec key for agent router go to
/// math"` stay data, not code.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigSnapshot {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    keys: BTreeMap<String, String>,
}

impl ConfigSnapshot {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Build a snapshot from raw key/value pairs. Used by tests and by
    /// composition roots that assemble configuration programmatically.
    pub fn from_keys<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            keys: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn set_key(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.keys.insert(key.into(), value.into());
    }

    // ── Raw accessors ─────────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
            None => default,
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn get_f32(&self, key: &str, default: f32) -> f32 {
        self.get(key)
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Comma-separated list value. Empty or missing key yields an empty vec.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Per-routing-command keys ──────────────────────────────────────────────
    //
    // Key pattern: "{kind} for {routing_command}".

    pub fn llm_spec_key_for(&self, routing_command: &str) -> Option<&str> {
        self.get(&format!("llm spec key for {routing_command}"))
    }

    pub fn prompt_template_for(&self, routing_command: &str) -> Option<&str> {
        self.get(&format!("prompt template for {routing_command}"))
    }

    pub fn serialization_topic_for(&self, routing_command: &str) -> Option<&str> {
        self.get(&format!("serialization topic for {routing_command}"))
    }

    // ── Well-known global keys ────────────────────────────────────────────────

    pub fn embedding_model(&self) -> &str {
        self.get_or("embedding model name", "text-embedding-3-small")
    }

    pub fn normalize_for_cache(&self) -> bool {
        self.get_bool("normalize for cache", true)
    }

    pub fn expand_symbols_to_words(&self) -> bool {
        self.get_bool("expand symbols to words", false)
    }

    pub fn io_log_async(&self) -> bool {
        self.get_bool("io log async", false)
    }

    pub fn xml_parsing_strategy(&self) -> &str {
        self.get_or("xml parsing strategy", "baseline")
    }

    pub fn similarity_threshold(&self) -> f32 {
        self.get_f32("snapshot similarity threshold", 90.0)
    }

    pub fn debugger_models(&self) -> Vec<String> {
        self.get_list("debugger model list")
    }

    pub fn code_interpreter(&self) -> &str {
        self.get_or("code interpreter", "python3")
    }
}
