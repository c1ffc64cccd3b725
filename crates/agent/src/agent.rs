use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Local, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use valet_config::ConfigSnapshot;
use valet_exec::{CodeRequest, CodeRunner, CodeResponse};
use valet_llm::{CompletionClient, CostSummary, LlmSpec};
use valet_memory::normalize_question;

use crate::capability::{AgentCapability, FormatterMode};
use crate::debugger::run_debug_loop;
use crate::error::AgentError;
use crate::response::{
    ParseStrategy, ParsedResponse, get_tag_value, parse_response, render_response_schema,
};

/// Used when a family's template file is missing so the engine still renders
/// a usable prompt.
const DEFAULT_TEMPLATE: &str = "You are a specialist assistant. Today is {date}, the time is \
{time}.\n\nAnswer this question: {question}";

const FORMATTER_TEMPLATE: &str = "You rephrase computed answers conversationally.\n\
Question: {question}\nRaw answer: {answer}\nHandled by: {routing_command}\n\n\
Reply with the rephrased answer wrapped in <rephrased-answer>…</rephrased-answer>.";

/// One agent run. Owns its prompt/response/code state and is never shared
/// across tasks; the scheduler builds a fresh instance per job.
pub struct Agent {
    pub capability: AgentCapability,
    config: ConfigSnapshot,
    client: Arc<dyn CompletionClient>,
    runner: CodeRunner,
    strategy: ParseStrategy,
    auto_debug: bool,

    /// Canonical (normalized) question.
    pub question: String,
    pub question_gist: String,
    /// The phrasing exactly as the user said it.
    pub last_question_asked: String,
    pub user_id: String,
    pub session_id: Option<String>,

    pub prompt: Option<String>,
    pub parsed: Option<ParsedResponse>,
    pub code_response: Option<CodeResponse>,
    pub answer: Option<String>,
    pub answer_conversational: Option<String>,
    pub cost: CostSummary,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("routing_command", &self.capability.routing_command)
            .field("question", &self.question)
            .field("has_answer", &self.answer.is_some())
            .finish()
    }
}

impl Agent {
    pub fn new(
        capability: AgentCapability,
        config: ConfigSnapshot,
        client: Arc<dyn CompletionClient>,
        runner: CodeRunner,
        question: &str,
        question_gist: &str,
        user_id: &str,
    ) -> Self {
        let strategy = ParseStrategy::from_config_value(config.xml_parsing_strategy());
        let auto_debug = config.get_bool("auto debug", true);
        Self {
            capability,
            config,
            client,
            runner,
            strategy,
            auto_debug,
            question: normalize_question(question),
            question_gist: question_gist.to_string(),
            last_question_asked: question.to_string(),
            user_id: user_id.to_string(),
            session_id: None,
            prompt: None,
            parsed: None,
            code_response: None,
            answer: None,
            answer_conversational: None,
            cost: CostSummary::default(),
        }
    }

    // ── Prompt ────────────────────────────────────────────────────────────────

    /// Render the family template, call the model, and parse the response.
    /// The rendered prompt stays on the agent for auditability.
    pub async fn run_prompt(&mut self) -> Result<(), AgentError> {
        let template = std::fs::read_to_string(&self.capability.template_path).unwrap_or_else(|_| {
            warn!(
                path = %self.capability.template_path.display(),
                "prompt template missing — using built-in default"
            );
            DEFAULT_TEMPLATE.to_string()
        });

        let now: DateTime<Local> = Local::now();
        let mut prompt = template
            .replace("{question}", &self.question)
            .replace("{date}", &now.format("%A, %B %-d, %Y").to_string())
            .replace("{time}", &now.format("%H:%M").to_string());
        prompt.push_str("\n\n");
        prompt.push_str(&render_response_schema(&self.capability.expected_fields));
        self.prompt = Some(prompt.clone());

        let spec = LlmSpec::resolve(&self.config, &self.capability.llm_spec_key);
        debug!(
            routing_command = %self.capability.routing_command,
            model = %spec.model,
            "running agent prompt"
        );
        let completion = self
            .client
            .complete(&spec, &prompt)
            .await
            .context("completion call failed")?;
        self.cost.add(completion.usage);

        let parsed = parse_response(
            &completion.text,
            &self.capability.expected_fields,
            self.strategy,
        )?;
        if !self.capability.produces_code {
            self.answer = parsed.get("answer").map(str::to_string);
        }
        self.parsed = Some(parsed);
        Ok(())
    }

    // ── Code ──────────────────────────────────────────────────────────────────

    fn code_request(&self) -> Result<CodeRequest, AgentError> {
        let parsed = self
            .parsed
            .as_ref()
            .ok_or_else(|| AgentError::Other(anyhow!("run_prompt must run before run_code")))?;
        Ok(CodeRequest {
            lines: parsed.code.clone(),
            example: parsed.get_or_default("example"),
            returns: parsed.get_or_default("returns"),
            data_path: self.capability.data_path.clone(),
        })
    }

    /// Execute the generated code. On failure with `auto_debug`, hand the
    /// failing code to the iterative debugger; its exhaustion is the fatal
    /// `CodeGenerationFailed` kind.
    pub async fn run_code(&mut self, auto_debug: bool) -> Result<CodeResponse, AgentError> {
        let request = self.code_request()?;
        if request.lines.is_empty() {
            return Err(AgentError::ParseFailed(
                "response contained no code to run".to_string(),
            ));
        }

        let response = self.runner.run(&request).await?;
        if response.ran_to_completion() {
            self.answer = Some(response.output.clone());
            self.code_response = Some(response.clone());
            return Ok(response);
        }

        if !auto_debug {
            self.code_response = Some(response.clone());
            return Ok(response);
        }

        let first_error = response
            .error
            .clone()
            .unwrap_or_else(|| format!("exit code {}", response.return_code));
        info!(
            routing_command = %self.capability.routing_command,
            error = %first_error,
            "generated code failed — starting debug loop"
        );

        let spec = LlmSpec::resolve(&self.config, &self.capability.llm_spec_key);
        let models = self.config.debugger_models();
        let outcome = run_debug_loop(
            &self.client,
            &self.runner,
            &spec,
            &models,
            &self.question,
            &request,
            &first_error,
            &mut self.cost,
        )
        .await?;

        if let Some(parsed) = self.parsed.as_mut() {
            parsed.code = outcome.code.clone();
            parsed
                .fields
                .insert("code".to_string(), outcome.code.join("\n"));
        }
        self.answer = Some(outcome.response.output.clone());
        self.code_response = Some(outcome.response.clone());
        Ok(outcome.response)
    }

    pub fn code_ran_to_completion(&self) -> bool {
        self.code_response
            .as_ref()
            .is_some_and(CodeResponse::ran_to_completion)
    }

    // ── Formatter ─────────────────────────────────────────────────────────────

    /// Turn the raw answer into the spoken reply. Terse families return the
    /// raw answer verbatim.
    pub async fn run_formatter(&mut self) -> Result<String, AgentError> {
        let raw = self
            .answer
            .clone()
            .ok_or_else(|| AgentError::Other(anyhow!("no raw answer to format")))?;

        if self.capability.formatter_mode == FormatterMode::Terse {
            self.answer_conversational = Some(raw.clone());
            return Ok(raw);
        }

        let spec_key = self.config.get_or("formatter llm spec key", "formatter default");
        let spec = LlmSpec::resolve(&self.config, spec_key);
        let prompt = FORMATTER_TEMPLATE
            .replace("{question}", &self.last_question_asked)
            .replace("{answer}", &raw)
            .replace("{routing_command}", &self.capability.routing_command);

        let completion = self
            .client
            .complete(&spec, &prompt)
            .await
            .context("formatter call failed")?;
        self.cost.add(completion.usage);

        let conversational =
            get_tag_value(&completion.text, "rephrased-answer").unwrap_or_else(|| {
                warn!("formatter response missing <rephrased-answer> — using raw text");
                completion.text.trim().to_string()
            });
        self.answer_conversational = Some(conversational.clone());
        Ok(conversational)
    }

    pub fn formatter_ran_to_completion(&self) -> bool {
        self.answer_conversational.is_some()
    }

    // ── Whole run ─────────────────────────────────────────────────────────────

    /// run_prompt → run_code (code families) → run_formatter.
    pub async fn do_all(&mut self) -> Result<String, AgentError> {
        self.run_prompt().await?;
        if self.capability.produces_code {
            self.run_code(self.auto_debug).await?;
            if !self.code_ran_to_completion() {
                let detail = self
                    .code_response
                    .as_ref()
                    .and_then(|r| r.error.clone())
                    .unwrap_or_else(|| "code did not run to completion".to_string());
                return Err(AgentError::Other(anyhow!(detail)));
            }
        }
        self.run_formatter().await
    }

    // ── Serialization ─────────────────────────────────────────────────────────

    /// Persist the agent's run state as JSON under
    /// `{topic}-{short-question}-{Y-M-D-H-m-s}.json`. Live connections,
    /// config handles, and routing-only identifiers are not written.
    pub fn serialize_to_file(&self, dir: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let short_question: String = self
            .question
            .chars()
            .take(32)
            .map(|ch| if ch == ' ' { '-' } else { ch })
            .collect();
        let stamp = Utc::now().format("%Y-%-m-%-d-%-H-%-M-%-S");
        let path = dir.join(format!("{}-{}-{}.json", self.capability.topic, short_question, stamp));

        let state = AgentStateFile::from(self);
        let rendered = serde_json::to_string_pretty(&state)?;
        std::fs::write(&path, rendered)?;
        debug!(path = %path.display(), "agent state serialized");
        Ok(path)
    }

    /// Load previously serialized state into this agent. Only families that
    /// opted into restoration support it.
    pub fn restore_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), AgentError> {
        if !self.capability.restorable {
            return Err(AgentError::RestoreUnsupported(
                self.capability.routing_command.clone(),
            ));
        }
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading agent state from {}", path.as_ref().display()))?;
        let state: AgentStateFile = serde_json::from_str(&raw).context("parsing agent state")?;

        self.question = state.question;
        self.question_gist = state.question_gist;
        self.last_question_asked = state.last_question_asked;
        self.prompt = state.prompt;
        self.parsed = Some(ParsedResponse {
            fields: state.response_fields,
            code: state.code,
        });
        self.code_response = state.code_response;
        self.answer = state.answer;
        self.answer_conversational = state.answer_conversational;
        self.cost = state.cost;
        Ok(())
    }
}

/// The serialized form of an agent run. Client handles, configuration, and
/// session/user identifiers deliberately have no counterpart here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateFile {
    pub routing_command: String,
    pub topic: String,
    pub question: String,
    pub question_gist: String,
    pub last_question_asked: String,
    pub prompt: Option<String>,
    pub response_fields: IndexMap<String, String>,
    pub code: Vec<String>,
    pub code_response: Option<CodeResponse>,
    pub answer: Option<String>,
    pub answer_conversational: Option<String>,
    pub cost: CostSummary,
    pub saved_at: DateTime<Utc>,
}

impl From<&Agent> for AgentStateFile {
    fn from(agent: &Agent) -> Self {
        Self {
            routing_command: agent.capability.routing_command.clone(),
            topic: agent.capability.topic.clone(),
            question: agent.question.clone(),
            question_gist: agent.question_gist.clone(),
            last_question_asked: agent.last_question_asked.clone(),
            prompt: agent.prompt.clone(),
            response_fields: agent
                .parsed
                .as_ref()
                .map(|parsed| parsed.fields.clone())
                .unwrap_or_default(),
            code: agent
                .parsed
                .as_ref()
                .map(|parsed| parsed.code.clone())
                .unwrap_or_default(),
            code_response: agent.code_response.clone(),
            answer: agent.answer.clone(),
            answer_conversational: agent.answer_conversational.clone(),
            cost: agent.cost,
            saved_at: Utc::now(),
        }
    }
}
