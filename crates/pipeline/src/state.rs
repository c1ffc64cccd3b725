use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Pipeline lifecycle.
///
/// ```text
/// initialized → running_research → research_done → running_podcast → completed
///                   \→ cancelled                      \→ cancelled
///                   \→ failed                         \→ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Initialized,
    RunningResearch,
    ResearchDone,
    RunningPodcast,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Failed | PipelineState::Cancelled
        )
    }
}

/// The single result presented to the caller: both stages' artifacts, the
/// cost of everything that actually ran, and how the workflow ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedResult {
    pub state: PipelineState,
    pub research_path: Option<String>,
    pub podcast_path: Option<String>,
    pub research_cost: f64,
    pub podcast_cost: f64,
    pub total_cost: f64,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub research_artifacts: IndexMap<String, String>,
    pub podcast_artifacts: IndexMap<String, String>,
}

impl Default for ChainedResult {
    fn default() -> Self {
        Self {
            state: PipelineState::Initialized,
            research_path: None,
            podcast_path: None,
            research_cost: 0.0,
            podcast_cost: 0.0,
            total_cost: 0.0,
            duration_ms: 0,
            error: None,
            research_artifacts: IndexMap::new(),
            podcast_artifacts: IndexMap::new(),
        }
    }
}

impl ChainedResult {
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Completed
    }

    /// Research delivered its artifact but the podcast leg did not: a
    /// distinct terminal shape exposing both the artifact and the error.
    pub fn is_partial(&self) -> bool {
        self.state == PipelineState::Failed && self.research_path.is_some()
    }

    pub fn summary(&self) -> String {
        match self.state {
            PipelineState::Completed => format!(
                "completed in {} ms (${:.4}): research={}, podcast={}",
                self.duration_ms,
                self.total_cost,
                self.research_path.as_deref().unwrap_or("-"),
                self.podcast_path.as_deref().unwrap_or("-"),
            ),
            PipelineState::Cancelled => format!(
                "cancelled after {} ms (${:.4} spent)",
                self.duration_ms, self.total_cost
            ),
            PipelineState::Failed if self.is_partial() => format!(
                "partial: research={} but podcast failed: {}",
                self.research_path.as_deref().unwrap_or("-"),
                self.error.as_deref().unwrap_or("unknown error"),
            ),
            PipelineState::Failed => format!(
                "failed: {}",
                self.error.as_deref().unwrap_or("unknown error")
            ),
            _ => format!("{:?}", self.state),
        }
    }
}
