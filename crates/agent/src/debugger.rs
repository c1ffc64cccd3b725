use std::sync::Arc;

use tracing::{info, warn};

use valet_exec::{CodeRequest, CodeRunner, CodeResponse};
use valet_llm::{CompletionClient, CostSummary, LlmSpec};

use crate::error::AgentError;
use crate::response::extract_code_lines;

/// Result of a successful debug pass: the corrected code, its execution
/// output, and the model that produced it.
#[derive(Debug, Clone)]
pub struct DebugOutcome {
    pub code: Vec<String>,
    pub response: CodeResponse,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebugPass {
    /// Smallest prompt: just the code and a one-line instruction.
    Minimalist,
    /// Full prompt: error trace plus every prior attempt.
    Full,
}

/// Iterative code repair.
///
/// Two passes, minimalist then full, each walking the configured model
/// list until a candidate runs to completion. Exhausting every attempt is
/// the one fatal agent error: the job goes to the dead queue.
pub async fn run_debug_loop(
    client: &Arc<dyn CompletionClient>,
    runner: &CodeRunner,
    base_spec: &LlmSpec,
    models: &[String],
    question: &str,
    failing: &CodeRequest,
    first_error: &str,
    cost: &mut CostSummary,
) -> Result<DebugOutcome, AgentError> {
    let models: Vec<String> = if models.is_empty() {
        vec![base_spec.model.clone()]
    } else {
        models.to_vec()
    };

    let mut attempts: Vec<(String, String)> = Vec::new();
    let mut last_error = first_error.to_string();

    for pass in [DebugPass::Minimalist, DebugPass::Full] {
        for model in &models {
            let prompt = build_debug_prompt(pass, question, failing, &last_error, &attempts);
            let spec = base_spec.with_model(model.clone());

            let completion = match client.complete(&spec, &prompt).await {
                Ok(completion) => completion,
                Err(err) => {
                    warn!(model = %model, ?pass, %err, "debug attempt: model unavailable");
                    attempts.push((model.clone(), format!("model unavailable: {err}")));
                    continue;
                }
            };
            cost.add(completion.usage);

            let candidate = extract_code_lines(&completion.text);
            if candidate.is_empty() {
                warn!(model = %model, ?pass, "debug attempt: no code in response");
                attempts.push((model.clone(), "response contained no code".to_string()));
                continue;
            }

            let request = CodeRequest {
                lines: candidate.clone(),
                example: failing.example.clone(),
                returns: failing.returns.clone(),
                data_path: failing.data_path.clone(),
            };
            let response = runner.run(&request).await?;
            if response.ran_to_completion() {
                info!(model = %model, ?pass, "debug attempt succeeded");
                return Ok(DebugOutcome {
                    code: candidate,
                    response,
                    model: model.clone(),
                });
            }

            last_error = response
                .error
                .clone()
                .unwrap_or_else(|| format!("exit code {}", response.return_code));
            warn!(model = %model, ?pass, error = %last_error, "debug attempt failed");
            attempts.push((model.clone(), last_error.clone()));
        }
    }

    Err(AgentError::CodeGenerationFailed(format!(
        "{} debug attempts exhausted; last error: {last_error}",
        attempts.len()
    )))
}

fn build_debug_prompt(
    pass: DebugPass,
    question: &str,
    failing: &CodeRequest,
    last_error: &str,
    attempts: &[(String, String)],
) -> String {
    let code_block = failing
        .lines
        .iter()
        .map(|line| format!("    <line>{line}</line>"))
        .collect::<Vec<_>>()
        .join("\n");

    match pass {
        DebugPass::Minimalist => format!(
            "This code fails to run. Return a corrected version wrapped in \
             <code><line>…</line></code> tags, nothing else.\n\n<code>\n{code_block}\n</code>"
        ),
        DebugPass::Full => {
            let history = if attempts.is_empty() {
                String::from("(none)")
            } else {
                attempts
                    .iter()
                    .map(|(model, error)| format!("- {model}: {error}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            format!(
                "The code below was generated to answer: \"{question}\"\n\
                 It fails with:\n{last_error}\n\n\
                 Prior repair attempts:\n{history}\n\n\
                 <code>\n{code_block}\n</code>\n\n\
                 Return a fully corrected version wrapped in \
                 <code><line>…</line></code> tags, nothing else."
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::ScriptedCompletionClient;

    fn spec() -> LlmSpec {
        LlmSpec {
            model: "base".to_string(),
            base_url: "http://localhost/v1".to_string(),
            temperature: 0.0,
            max_tokens: 512,
        }
    }

    fn failing_request() -> CodeRequest {
        CodeRequest {
            lines: vec!["exit 1".to_string()],
            ..CodeRequest::default()
        }
    }

    #[tokio::test]
    async fn second_model_succeeds_after_first_fails() {
        let client: Arc<dyn CompletionClient> = Arc::new(ScriptedCompletionClient::new([
            // Minimalist pass, model-a: still-broken code.
            "<code><line>exit 2</line></code>",
            // Minimalist pass, model-b: fixed.
            "<code><line>echo fixed</line></code>",
        ]));
        let runner = CodeRunner::new("sh", Duration::from_secs(5));
        let mut cost = CostSummary::default();

        let outcome = run_debug_loop(
            &client,
            &runner,
            &spec(),
            &["model-a".to_string(), "model-b".to_string()],
            "test question",
            &failing_request(),
            "exit code 1",
            &mut cost,
        )
        .await
        .unwrap();

        assert_eq!(outcome.code, vec!["echo fixed"]);
        assert_eq!(outcome.response.output, "fixed");
        assert_eq!(outcome.model, "model-b");
        assert_eq!(cost.calls, 2);
    }

    #[tokio::test]
    async fn exhaustion_is_code_generation_failed() {
        // Both passes, both models: every candidate still fails.
        let client: Arc<dyn CompletionClient> = Arc::new(ScriptedCompletionClient::new([
            "<code><line>exit 3</line></code>",
            "<code><line>exit 3</line></code>",
            "<code><line>exit 3</line></code>",
            "<code><line>exit 3</line></code>",
        ]));
        let runner = CodeRunner::new("sh", Duration::from_secs(5));
        let mut cost = CostSummary::default();

        let err = run_debug_loop(
            &client,
            &runner,
            &spec(),
            &["model-a".to_string(), "model-b".to_string()],
            "test question",
            &failing_request(),
            "exit code 1",
            &mut cost,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AgentError::CodeGenerationFailed(_)));
        assert!(err.is_fatal());
        assert!(err.to_string().starts_with("Code generation failed"));
    }

    #[tokio::test]
    async fn transient_model_failure_moves_to_next_attempt() {
        let client: Arc<dyn CompletionClient> = Arc::new(ScriptedCompletionClient::new([
            "<<fail>>",
            "<code><line>echo ok</line></code>",
        ]));
        let runner = CodeRunner::new("sh", Duration::from_secs(5));
        let mut cost = CostSummary::default();

        let outcome = run_debug_loop(
            &client,
            &runner,
            &spec(),
            &["model-a".to_string(), "model-b".to_string()],
            "q",
            &failing_request(),
            "boom",
            &mut cost,
        )
        .await
        .unwrap();

        assert_eq!(outcome.model, "model-b");
        // The failed call never returned usage.
        assert_eq!(cost.calls, 1);
    }

    #[tokio::test]
    async fn empty_model_list_falls_back_to_base_spec_model() {
        let client = Arc::new(ScriptedCompletionClient::new([
            "<code><line>echo base</line></code>",
        ]));
        let seen = client.clone();
        let client: Arc<dyn CompletionClient> = client;
        let runner = CodeRunner::new("sh", Duration::from_secs(5));
        let mut cost = CostSummary::default();

        let outcome = run_debug_loop(
            &client, &runner, &spec(), &[], "q", &failing_request(), "boom", &mut cost,
        )
        .await
        .unwrap();

        assert_eq!(outcome.model, "base");
        assert_eq!(seen.models_seen.lock().unwrap().as_slice(), ["base"]);
    }
}
