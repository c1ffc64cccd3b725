use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::embedding::similarity;
use crate::normalize::normalize_question;

/// Deserialize a synonym map, degrading wrong-shaped values (null, arrays,
/// non-numeric scores) to an empty map instead of failing the whole load.
/// Old snapshot files in the wild carry both kinds of corruption.
fn lenient_synonym_map<'de, D>(deserializer: D) -> Result<IndexMap<String, f32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer).unwrap_or(serde_json::Value::Null);
    let Some(object) = value.as_object() else {
        return Ok(IndexMap::new());
    };
    Ok(object
        .iter()
        .filter_map(|(k, v)| v.as_f64().map(|score| (k.clone(), score as f32)))
        .collect())
}

/// Microsecond-precision timestamp string. This is the sole input to
/// [`generate_id_hash`] — microsecond precision makes collisions a
/// non-issue without any extra counter.
pub fn microsecond_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d @ %H:%M:%S%.6f UTC").to_string()
}

/// SHA-256 hex digest over a microsecond timestamp string.
pub fn generate_id_hash(run_date: &str) -> String {
    format!("{:x}", Sha256::digest(run_date.as_bytes()))
}

/// Runtime statistics for a cached solution.
///
/// The first measured run is the expensive agentic one; subsequent runs are
/// cache replays, and `time_saved_ms` is how much wall clock the cache has
/// bought so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub first_run_ms: Option<u64>,
    pub run_count: u64,
    pub total_ms: u64,
    pub mean_run_ms: u64,
    pub last_run_ms: u64,
    pub time_saved_ms: i64,
}

impl RuntimeStats {
    pub fn update(&mut self, elapsed_ms: u64) {
        match self.first_run_ms {
            None => {
                self.first_run_ms = Some(elapsed_ms);
            }
            Some(first_run_ms) => {
                self.run_count += 1;
                self.total_ms += elapsed_ms;
                self.mean_run_ms = self.total_ms / self.run_count;
                self.last_run_ms = elapsed_ms;
                self.time_saved_ms =
                    (first_run_ms * self.run_count) as i64 - self.total_ms as i64;
            }
        }
    }
}

/// A persisted, embedding-annotated record of one successfully answered
/// question and its solution.
///
/// Five embeddings are carried, one per text facet; every non-empty facet
/// has a vector of the backend's fixed dimensionality. The synonym maps are
/// insertion-ordered and never list the canonical question twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolutionSnapshot {
    pub id_hash: String,
    /// Canonical (normalized) question text.
    pub question: String,
    pub question_gist: String,
    /// The unmodified phrasing most recently matched to this snapshot.
    pub last_question_asked: String,
    pub routing_command: String,

    pub thoughts: String,
    pub solution_summary: String,
    pub answer: String,
    pub answer_conversational: String,
    pub error: String,

    pub code: Vec<String>,
    pub code_example: String,
    pub code_returns: String,
    pub programming_language: String,
    pub language_version: String,

    #[serde(deserialize_with = "lenient_synonym_map")]
    pub synonymous_questions: IndexMap<String, f32>,
    #[serde(deserialize_with = "lenient_synonym_map")]
    pub synonymous_question_gists: IndexMap<String, f32>,
    pub non_synonymous_questions: Vec<String>,

    pub question_embedding: Vec<f32>,
    pub question_gist_embedding: Vec<f32>,
    pub solution_embedding: Vec<f32>,
    pub code_embedding: Vec<f32>,
    pub thoughts_embedding: Vec<f32>,

    pub runtime_stats: RuntimeStats,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub run_date: String,
    /// File name within the solutions directory, assigned on first write.
    pub solution_file: Option<String>,

    /// Ownership is routing metadata, not part of the persisted solution.
    #[serde(skip)]
    pub user_id: String,
}

impl Default for SolutionSnapshot {
    fn default() -> Self {
        let now = Utc::now();
        let run_date = microsecond_stamp(now);
        Self {
            id_hash: generate_id_hash(&run_date),
            question: String::new(),
            question_gist: String::new(),
            last_question_asked: String::new(),
            routing_command: String::new(),
            thoughts: String::new(),
            solution_summary: String::new(),
            answer: String::new(),
            answer_conversational: String::new(),
            error: String::new(),
            code: Vec::new(),
            code_example: String::new(),
            code_returns: String::new(),
            programming_language: "Python".to_string(),
            language_version: "3.10".to_string(),
            synonymous_questions: IndexMap::new(),
            synonymous_question_gists: IndexMap::new(),
            non_synonymous_questions: Vec::new(),
            question_embedding: Vec::new(),
            question_gist_embedding: Vec::new(),
            solution_embedding: Vec::new(),
            code_embedding: Vec::new(),
            thoughts_embedding: Vec::new(),
            runtime_stats: RuntimeStats::default(),
            created_date: now,
            updated_date: now,
            run_date,
            solution_file: None,
            user_id: String::new(),
        }
    }
}

impl SolutionSnapshot {
    /// New snapshot for a question. The question is canonicalized and seeded
    /// into its own synonym map at score 100.
    pub fn for_question(question: &str) -> Self {
        let canonical = normalize_question(question);
        let mut snapshot = Self {
            question: canonical.clone(),
            last_question_asked: question.to_string(),
            ..Self::default()
        };
        if !canonical.is_empty() {
            snapshot.synonymous_questions.insert(canonical, 100.0);
        }
        snapshot
    }

    pub fn with_gist(mut self, gist: &str) -> Self {
        self.question_gist = gist.to_string();
        if !gist.is_empty() {
            self.synonymous_question_gists.insert(gist.to_string(), 100.0);
        }
        self
    }

    /// Record a new phrasing answered by this snapshot.
    ///
    /// `raw_text` is kept verbatim as `last_question_asked`; the normalized
    /// form goes into the synonym map. Duplicate insertions are no-ops.
    /// Returns whether the map changed.
    pub fn add_synonymous_question(&mut self, raw_text: &str, score: f32) -> bool {
        self.last_question_asked = raw_text.to_string();
        let canonical = normalize_question(raw_text);
        if canonical.is_empty() || self.synonymous_questions.contains_key(&canonical) {
            return false;
        }
        self.synonymous_questions.insert(canonical, score);
        self.updated_date = Utc::now();
        true
    }

    /// Gist-side counterpart of [`Self::add_synonymous_question`].
    pub fn add_synonymous_gist(&mut self, gist: &str, score: f32) -> bool {
        if gist.is_empty() || self.synonymous_question_gists.contains_key(gist) {
            return false;
        }
        self.synonymous_question_gists.insert(gist.to_string(), score);
        self.updated_date = Utc::now();
        true
    }

    /// Record a phrasing that looked close but was confirmed *not* equivalent,
    /// so future matching can skip it.
    pub fn add_non_synonymous_question(&mut self, raw_text: &str) {
        let canonical = normalize_question(raw_text);
        if !canonical.is_empty() && !self.non_synonymous_questions.contains(&canonical) {
            self.non_synonymous_questions.push(canonical);
        }
    }

    pub fn is_known_non_synonym(&self, raw_text: &str) -> bool {
        self.non_synonymous_questions
            .contains(&normalize_question(raw_text))
    }

    pub fn question_similarity_to(&self, query_embedding: &[f32]) -> f32 {
        similarity(&self.question_embedding, query_embedding)
    }

    pub fn gist_similarity_to(&self, query_embedding: &[f32]) -> f32 {
        similarity(&self.question_gist_embedding, query_embedding)
    }

    pub fn update_runtime_stats(&mut self, elapsed_ms: u64) {
        self.runtime_stats.update(elapsed_ms);
        self.updated_date = Utc::now();
    }
}
