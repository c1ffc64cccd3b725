use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{debug, warn};

use valet_agent::{Agent, AgentCapability};
use valet_config::ConfigSnapshot;
use valet_exec::CodeRunner;
use valet_llm::CompletionClient;
use valet_pipeline::{PipelineStage, StageContext, StageError, StageOutput};

/// A pipeline stage driven by the agent core.
///
/// The research leg answers the user's question directly; the podcast leg
/// rewrites the research artifact. Either way the stage writes its primary
/// artifact to `output_dir` and reports the agent's accumulated cost, on
/// failure as well as success.
pub struct AgentBackedStage {
    name: &'static str,
    capability: AgentCapability,
    config: ConfigSnapshot,
    client: Arc<dyn CompletionClient>,
    runner: CodeRunner,
    output_dir: PathBuf,
    job_tag: String,
}

impl AgentBackedStage {
    pub fn new(
        name: &'static str,
        capability: AgentCapability,
        config: ConfigSnapshot,
        client: Arc<dyn CompletionClient>,
        runner: CodeRunner,
        output_dir: PathBuf,
        job_tag: impl Into<String>,
    ) -> Self {
        Self {
            name,
            capability,
            config,
            client,
            runner,
            output_dir,
            job_tag: job_tag.into(),
        }
    }

    fn artifact_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}.md", self.capability.topic, self.job_tag))
    }
}

#[async_trait]
impl PipelineStage for AgentBackedStage {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        if ctx.is_cancelled() {
            return Err(StageError::Cancelled { cost_usd: 0.0 });
        }

        // The podcast leg works from the research artifact, not the raw
        // question.
        let question = match &ctx.previous_output {
            Some(previous) => format!(
                "turn the report at {} into a two-host podcast script about: {}",
                previous.primary_path, ctx.question
            ),
            None => ctx.question.clone(),
        };

        let mut agent = Agent::new(
            self.capability.clone(),
            self.config.clone(),
            self.client.clone(),
            self.runner.clone(),
            &question,
            "",
            &ctx.user_id,
        );
        let conversational = agent.do_all().await.map_err(|err| StageError::Failed {
            message: err.to_string(),
            cost_usd: agent.cost.cost_usd,
        })?;

        // Checkpoint between the model work and artifact publication.
        if ctx.is_cancelled() {
            return Err(StageError::Cancelled { cost_usd: agent.cost.cost_usd });
        }

        let path = self.artifact_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StageError::Failed {
                message: format!("creating {}: {err}", parent.display()),
                cost_usd: agent.cost.cost_usd,
            })?;
        }
        let body = agent.answer.clone().unwrap_or_else(|| conversational.clone());
        std::fs::write(&path, &body).map_err(|err| StageError::Failed {
            message: format!("writing {}: {err}", path.display()),
            cost_usd: agent.cost.cost_usd,
        })?;
        debug!(stage = self.name, path = %path.display(), "stage artifact written");

        if let Err(err) = agent.serialize_to_file(&self.output_dir) {
            warn!(%err, stage = self.name, "agent state serialization failed");
        }

        let mut artifacts = IndexMap::new();
        artifacts.insert("abstract".to_string(), conversational);
        Ok(StageOutput {
            primary_path: path.to_string_lossy().to_string(),
            cost_usd: agent.cost.cost_usd,
            artifacts,
        })
    }
}
