use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use valet_llm::CostSummary;
use valet_memory::{generate_id_hash, microsecond_stamp};

/// Job lifecycle. Transitions only move forward:
/// pending → running → {done_ok, done_error, dead}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    DoneOk,
    DoneError,
    Dead,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::DoneOk | JobStatus::DoneError | JobStatus::Dead)
    }
}

/// A request flowing through the queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// SHA-256 over a microsecond timestamp — unique across all queues.
    pub id_hash: String,
    /// Human-readable handle derived from the hash ("brisk falcon").
    pub two_word_tag: String,

    pub user_id: String,
    pub user_email: String,
    /// The WebSocket session that submitted the job, when one did.
    pub session_id: Option<String>,

    /// The question exactly as submitted.
    pub question: String,
    /// Canonical normalized form used for matching and caching.
    pub last_question_asked: String,
    pub question_gist: Option<String>,
    pub routing_command: String,
    /// Agent family name, for display.
    pub job_type: String,

    pub answer: Option<String>,
    pub answer_conversational: Option<String>,
    pub code: Vec<String>,
    pub code_example: String,
    pub code_returns: String,
    pub error: Option<String>,

    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub is_cache_hit: bool,
    /// Backing snapshot for cache hits, with the similarity score that won.
    pub snapshot_id: Option<String>,
    pub cache_hit_score: Option<f32>,

    /// Long-running agent outputs (report_path, abstract, audio_path, …).
    pub artifacts: IndexMap<String, String>,
    pub cost: CostSummary,
}

impl Job {
    pub fn new(
        question: &str,
        canonical: &str,
        user_id: &str,
        user_email: &str,
        session_id: Option<String>,
        routing_command: &str,
        job_type: &str,
    ) -> Self {
        let stamp = microsecond_stamp(Utc::now());
        let id_hash = generate_id_hash(&stamp);
        let two_word_tag = two_word_tag(&id_hash);
        Self {
            id_hash,
            two_word_tag,
            user_id: user_id.to_string(),
            user_email: user_email.to_string(),
            session_id,
            question: question.to_string(),
            last_question_asked: canonical.to_string(),
            question_gist: None,
            routing_command: routing_command.to_string(),
            job_type: job_type.to_string(),
            answer: None,
            answer_conversational: None,
            code: Vec::new(),
            code_example: String::new(),
            code_returns: String::new(),
            error: None,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            is_cache_hit: false,
            snapshot_id: None,
            cache_hit_score: None,
            artifacts: IndexMap::new(),
            cost: CostSummary::default(),
        }
    }
}

/// Metadata projection returned by queue retrieval — never the raw job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id_hash: String,
    pub two_word_tag: String,
    pub user_id: String,
    pub question: String,
    pub routing_command: String,
    pub job_type: String,
    pub status: JobStatus,
    pub is_cache_hit: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub answer_conversational: Option<String>,
    pub error: Option<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id_hash: job.id_hash.clone(),
            two_word_tag: job.two_word_tag.clone(),
            user_id: job.user_id.clone(),
            question: job.question.clone(),
            routing_command: job.routing_command.clone(),
            job_type: job.job_type.clone(),
            status: job.status,
            is_cache_hit: job.is_cache_hit,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            answer_conversational: job.answer_conversational.clone(),
            error: job.error.clone(),
        }
    }
}

const TAG_ADJECTIVES: &[&str] = &[
    "brisk", "calm", "clever", "daring", "eager", "fuzzy", "gentle", "happy",
    "keen", "lively", "mellow", "nimble", "plucky", "quiet", "rapid", "sly",
    "spry", "steady", "swift", "tidy", "vivid", "wise", "witty", "zesty",
    "bold", "bright", "crisp", "deft", "fleet", "jolly", "merry", "sunny",
];

const TAG_NOUNS: &[&str] = &[
    "badger", "beaver", "bison", "condor", "coyote", "crane", "dolphin", "falcon",
    "ferret", "gecko", "heron", "ibex", "jackal", "kestrel", "lemur", "lynx",
    "marmot", "marten", "osprey", "otter", "panda", "penguin", "plover", "puffin",
    "quokka", "raven", "seal", "stork", "tapir", "toucan", "walrus", "wren",
];

/// Deterministic two-word handle from the first hash bytes. The format
/// matches session ids (`adjective noun`, lowercase) so the same display
/// plumbing handles both.
pub fn two_word_tag(id_hash: &str) -> String {
    let bytes = id_hash.as_bytes();
    let a = bytes.first().copied().unwrap_or(0) as usize;
    let b = bytes.get(1).copied().unwrap_or(0) as usize;
    format!(
        "{} {}",
        TAG_ADJECTIVES[a % TAG_ADJECTIVES.len()],
        TAG_NOUNS[b % TAG_NOUNS.len()]
    )
}
