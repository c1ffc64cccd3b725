use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use valet_config::ConfigSnapshot;

/// How a raw answer becomes the spoken reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatterMode {
    /// Rephrase through the formatter model.
    Conversational,
    /// Return the raw computed answer verbatim.
    Terse,
}

/// Everything the execution core needs to know about one agent family.
///
/// Families differ by data, not by subclass: the core is a single engine
/// parameterized by this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    pub routing_command: String,
    pub llm_spec_key: String,
    pub template_path: PathBuf,
    /// Serialization topic — the filename prefix for persisted agent state.
    pub topic: String,
    pub expected_fields: Vec<String>,
    pub formatter_mode: FormatterMode,
    /// Whether this family generates and runs code.
    pub produces_code: bool,
    /// Whether successful answers may be stored as solution snapshots.
    /// Ephemeral families (weather) opt out.
    pub cacheable: bool,
    /// Tabular context handed to the sandbox for dataframe-backed families.
    pub data_path: Option<PathBuf>,
    /// Whether serialized agent state may be restored later.
    pub restorable: bool,
}

/// The response fields every code-producing family emits.
fn code_fields() -> Vec<String> {
    ["thoughts", "brainstorm", "evaluation", "code", "example", "returns", "explanation"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn text_fields() -> Vec<String> {
    ["category", "answer"].iter().map(ToString::to_string).collect()
}

/// Routing command → capability record, built once from configuration.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    by_command: HashMap<String, AgentCapability>,
}

impl CapabilityRegistry {
    /// Built-in family table, overridable per command through the
    /// `"{kind} for {routing_command}"` config keys.
    pub fn from_config(config: &ConfigSnapshot) -> Self {
        let defaults = [
            family("agent router go to math", "math", true, true, FormatterMode::Conversational),
            family("agent router go to date and time", "date-and-time", true, true, FormatterMode::Conversational),
            family("agent router go to calendar", "calendar", true, true, FormatterMode::Conversational),
            family("agent router go to todo list", "todo-list", true, true, FormatterMode::Conversational),
            family("agent router go to weather", "weather", false, false, FormatterMode::Terse),
            family("agent router go to receptionist", "receptionist", false, false, FormatterMode::Terse),
            family("agent router go to research", "research", false, false, FormatterMode::Conversational),
            family("agent router go to podcast", "podcast", false, false, FormatterMode::Conversational),
        ];

        let mut by_command = HashMap::new();
        for mut capability in defaults {
            let command = capability.routing_command.clone();
            if let Some(key) = config.llm_spec_key_for(&command) {
                capability.llm_spec_key = key.to_string();
            }
            if let Some(path) = config.prompt_template_for(&command) {
                capability.template_path = PathBuf::from(path);
            }
            if let Some(topic) = config.serialization_topic_for(&command) {
                capability.topic = topic.to_string();
            }
            if let Some(path) = config.get(&format!("data path for {command}")) {
                capability.data_path = Some(PathBuf::from(path));
            }
            by_command.insert(command, capability);
        }
        Self { by_command }
    }

    pub fn resolve(&self, routing_command: &str) -> Option<&AgentCapability> {
        self.by_command.get(routing_command)
    }

    pub fn is_cacheable(&self, routing_command: &str) -> bool {
        self.resolve(routing_command)
            .map(|capability| capability.cacheable)
            .unwrap_or(false)
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.by_command.keys().map(String::as_str)
    }
}

fn family(
    routing_command: &str,
    topic: &str,
    produces_code: bool,
    cacheable: bool,
    formatter_mode: FormatterMode,
) -> AgentCapability {
    AgentCapability {
        routing_command: routing_command.to_string(),
        llm_spec_key: format!("{topic} default"),
        template_path: PathBuf::from(format!("conf/prompts/{topic}.txt")),
        topic: topic.to_string(),
        expected_fields: if produces_code { code_fields() } else { text_fields() },
        formatter_mode,
        produces_code,
        cacheable,
        data_path: None,
        // Calendaring-style families keep restorable state; ephemeral ones
        // never restore.
        restorable: produces_code,
    }
}
