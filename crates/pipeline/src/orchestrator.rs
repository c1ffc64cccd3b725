use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use valet_notify::{
    Fabric, NotificationKind, NotificationLog, NotificationPriority, NotificationRequest,
};

use crate::state::{ChainedResult, PipelineState};

/// What a stage hands back on success.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// The stage's primary artifact (report path, audio path).
    pub primary_path: String,
    pub cost_usd: f64,
    pub artifacts: IndexMap<String, String>,
}

/// Stage failures carry the cost already spent — the orchestrator's
/// aggregate cost includes every sub-cost regardless of outcome.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("budget exceeded (${cost_usd:.2} spent)")]
    BudgetExceeded { cost_usd: f64 },

    #[error("{message}")]
    Failed { message: String, cost_usd: f64 },

    #[error("cancelled")]
    Cancelled { cost_usd: f64 },
}

impl StageError {
    pub fn cost_usd(&self) -> f64 {
        match self {
            StageError::BudgetExceeded { cost_usd }
            | StageError::Failed { cost_usd, .. }
            | StageError::Cancelled { cost_usd } => *cost_usd,
        }
    }
}

/// Everything a stage needs: the request, the previous stage's output, and
/// the cancellation channel it must poll between sub-steps.
#[derive(Clone)]
pub struct StageContext {
    pub question: String,
    pub user_id: String,
    pub job_id: Option<String>,
    pub previous_output: Option<StageOutput>,
    pub cancel: watch::Receiver<bool>,
}

impl StageContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError>;
}

/// Runs research → podcast as one workflow.
///
/// Cancellation between sub-steps is cooperative: each stage polls the watch
/// channel and returns `StageError::Cancelled` with its partial cost. Once
/// a stage has returned, cancellation is final — artifacts already produced
/// stay on the result.
pub struct ChainedPipeline {
    research: Box<dyn PipelineStage>,
    podcast: Box<dyn PipelineStage>,
    fabric: Arc<Fabric>,
    notifications: Arc<NotificationLog>,
    question: String,
    user_id: String,
    job_id: Option<String>,
}

impl ChainedPipeline {
    pub fn new(
        research: Box<dyn PipelineStage>,
        podcast: Box<dyn PipelineStage>,
        fabric: Arc<Fabric>,
        notifications: Arc<NotificationLog>,
        question: impl Into<String>,
        user_id: impl Into<String>,
        job_id: Option<String>,
    ) -> Self {
        Self {
            research,
            podcast,
            fabric,
            notifications,
            question: question.into(),
            user_id: user_id.into(),
            job_id,
        }
    }

    pub async fn run(&self, cancel: watch::Receiver<bool>) -> ChainedResult {
        let started = Instant::now();
        let mut result = ChainedResult::default();

        let finalize = |mut result: ChainedResult, started: Instant| {
            result.total_cost = result.research_cost + result.podcast_cost;
            result.duration_ms = started.elapsed().as_millis() as u64;
            result
        };

        if *cancel.borrow() {
            result.state = PipelineState::Cancelled;
            self.notify("pipeline cancelled before it began", NotificationPriority::Urgent);
            return finalize(result, started);
        }

        // ── Stage A: deep research ───────────────────────────────────────────
        result.state = PipelineState::RunningResearch;
        self.notify(
            format!("starting deep research: {}", self.question),
            NotificationPriority::Medium,
        );
        let ctx = StageContext {
            question: self.question.clone(),
            user_id: self.user_id.clone(),
            job_id: self.job_id.clone(),
            previous_output: None,
            cancel: cancel.clone(),
        };
        let research_output = match self.research.run(&ctx).await {
            Ok(output) => {
                result.research_cost = output.cost_usd;
                result.research_path = Some(output.primary_path.clone());
                result.research_artifacts = output.artifacts.clone();
                result.state = PipelineState::ResearchDone;
                self.notify(
                    format!("research complete: {}", output.primary_path),
                    NotificationPriority::Low,
                );
                output
            }
            Err(StageError::Cancelled { cost_usd }) => {
                result.research_cost = cost_usd;
                result.state = PipelineState::Cancelled;
                info!(stage = self.research.name(), "pipeline cancelled mid-research");
                self.notify("pipeline cancelled during research", NotificationPriority::Urgent);
                return finalize(result, started);
            }
            Err(err) => {
                result.research_cost = err.cost_usd();
                result.state = PipelineState::Failed;
                result.error = Some(err.to_string());
                warn!(stage = self.research.name(), %err, "research stage failed");
                self.notify(
                    format!("research failed: {err}"),
                    NotificationPriority::Urgent,
                );
                return finalize(result, started);
            }
        };

        // ── Stage B: podcast generation ──────────────────────────────────────
        result.state = PipelineState::RunningPodcast;
        self.notify("starting podcast generation", NotificationPriority::Medium);
        let ctx = StageContext {
            question: self.question.clone(),
            user_id: self.user_id.clone(),
            job_id: self.job_id.clone(),
            previous_output: Some(research_output),
            cancel,
        };
        match self.podcast.run(&ctx).await {
            Ok(output) => {
                result.podcast_cost = output.cost_usd;
                result.podcast_path = Some(output.primary_path.clone());
                result.podcast_artifacts = output.artifacts;
                result.state = PipelineState::Completed;
                self.notify(
                    format!("podcast ready: {}", output.primary_path),
                    NotificationPriority::High,
                );
            }
            Err(StageError::Cancelled { cost_usd }) => {
                result.podcast_cost = cost_usd;
                result.state = PipelineState::Cancelled;
                info!(stage = self.podcast.name(), "pipeline cancelled mid-podcast");
                self.notify("pipeline cancelled during podcast", NotificationPriority::Urgent);
            }
            Err(err) => {
                result.podcast_cost = err.cost_usd();
                result.state = PipelineState::Failed;
                result.error = Some(err.to_string());
                warn!(stage = self.podcast.name(), %err, "podcast stage failed");
                self.notify(format!("podcast failed: {err}"), NotificationPriority::Urgent);
            }
        }

        finalize(result, started)
    }

    fn notify(&self, message: impl Into<String>, priority: NotificationPriority) {
        let mut request = NotificationRequest::new("pipeline@valet", &self.user_id, message)
            .kind(NotificationKind::Progress)
            .priority(priority);
        if let Some(job_id) = &self.job_id {
            request = request.job_id(job_id);
        }
        if let Err(err) = self.notifications.notify(&self.fabric, request) {
            warn!(%err, "pipeline progress notification failed");
        }
    }
}
