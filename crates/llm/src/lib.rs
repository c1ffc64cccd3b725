use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use valet_config::ConfigSnapshot;

// ── Model specs ───────────────────────────────────────────────────────────────

/// Resolved model parameters for one completion call.
///
/// Specs are looked up by key ("math default", "debugger minimalist", …) so
/// that routing commands reference a spec indirectly through configuration
/// rather than hard-coding model ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSpec {
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmSpec {
    /// Resolve a spec from configuration.
    ///
    /// Keys follow the pattern `"llm spec {field} for {spec_key}"`; missing
    /// fields fall back to sane defaults so a bare model name is enough.
    pub fn resolve(config: &ConfigSnapshot, spec_key: &str) -> Self {
        Self {
            model: config
                .get_or(&format!("llm spec model for {spec_key}"), "gpt-4o-mini")
                .to_string(),
            base_url: config
                .get_or(
                    &format!("llm spec base url for {spec_key}"),
                    config.get_or("llm base url", "http://localhost:11434/v1"),
                )
                .to_string(),
            temperature: config.get_f32(&format!("llm spec temperature for {spec_key}"), 0.0),
            max_tokens: config.get_u64(&format!("llm spec max tokens for {spec_key}"), 2048) as u32,
        }
    }

    /// Same spec pointed at a different model. Used by the debugger when it
    /// walks its model list.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }
}

// ── Usage and cost accounting ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

/// Running total across an agent's (or pipeline stage's) lifetime.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl CostSummary {
    pub fn add(&mut self, usage: Usage) {
        self.calls += 1;
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.cost_usd += usage.cost_usd;
    }

    pub fn merge(&mut self, other: CostSummary) {
        self.calls += other.calls;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// Per-model pricing, USD per 1k tokens. Missing models cost zero so cost
/// accounting never blocks a run.
#[derive(Debug, Clone, Default)]
pub struct CostTable {
    config: ConfigSnapshot,
}

impl CostTable {
    pub fn new(config: ConfigSnapshot) -> Self {
        Self { config }
    }

    pub fn price_usd(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let prompt_rate = self
            .config
            .get_f32(&format!("cost per 1k prompt tokens for {model}"), 0.0) as f64;
        let completion_rate = self
            .config
            .get_f32(&format!("cost per 1k completion tokens for {model}"), 0.0)
            as f64;
        (prompt_tokens as f64 / 1000.0) * prompt_rate
            + (completion_tokens as f64 / 1000.0) * completion_rate
    }
}

// ── Completion client ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, spec: &LlmSpec, prompt: &str) -> Result<Completion>;
}

/// OpenAI-compatible `/chat/completions` client.
///
/// The API key is read from `VALET_API_KEY` at call time; local endpoints
/// (Ollama's compatibility layer) work without one.
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    client: reqwest::Client,
    cost_table: CostTable,
}

impl HttpCompletionClient {
    pub fn new(cost_table: CostTable) -> Self {
        Self {
            client: reqwest::Client::new(),
            cost_table,
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, spec: &LlmSpec, prompt: &str) -> Result<Completion> {
        let endpoint = format!("{}/chat/completions", spec.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": spec.model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "temperature": spec.temperature,
            "max_tokens": spec.max_tokens,
        });

        let mut request = self.client.post(&endpoint).json(&payload);
        if let Ok(api_key) = std::env::var("VALET_API_KEY") {
            if !api_key.trim().is_empty() {
                request = request.bearer_auth(api_key);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(anyhow!("completion endpoint returned {status}: {body}"));
        }

        parse_completion_body(&body, &spec.model, &self.cost_table)
    }
}

fn parse_completion_body(
    body: &serde_json::Value,
    model: &str,
    cost_table: &CostTable,
) -> Result<Completion> {
    let text = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .ok_or_else(|| anyhow!("completion response missing choices[0].message.content"))?
        .to_string();

    let prompt_tokens = body
        .get("usage")
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = body
        .get("usage")
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    Ok(Completion {
        text,
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            cost_usd: cost_table.price_usd(model, prompt_tokens, completion_tokens),
        },
    })
}

// ── Embedding client ──────────────────────────────────────────────────────────

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>>;
}

/// OpenAI-compatible `/embeddings` client.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEmbeddingClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let endpoint = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let payload = json!({ "model": model, "input": text });

        let mut request = self.client.post(&endpoint).json(&payload);
        if let Ok(api_key) = std::env::var("VALET_API_KEY") {
            if !api_key.trim().is_empty() {
                request = request.bearer_auth(api_key);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(anyhow!("embedding endpoint returned {status}: {body}"));
        }

        parse_embedding_body(&body)
    }
}

fn parse_embedding_body(body: &serde_json::Value) -> Result<Vec<f32>> {
    let vector = body
        .get("data")
        .and_then(|data| data.get(0))
        .and_then(|item| item.get("embedding"))
        .and_then(|emb| emb.as_array())
        .ok_or_else(|| anyhow!("embedding response missing data[0].embedding"))?
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect::<Vec<f32>>();

    if vector.is_empty() {
        return Err(anyhow!("embedding response contained an empty vector"));
    }
    Ok(vector)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cost_table() -> CostTable {
        CostTable::new(ConfigSnapshot::from_keys([
            ("cost per 1k prompt tokens for gpt-4o-mini", "0.15"),
            ("cost per 1k completion tokens for gpt-4o-mini", "0.6"),
        ]))
    }

    // ── Completion body parsing ────────────────────────────────────────────

    #[test]
    fn parse_completion_extracts_text_and_usage() {
        let body = json!({
            "choices": [{"message": {"content": "The answer is 4."}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 10}
        });
        let completion = parse_completion_body(&body, "gpt-4o-mini", &cost_table()).unwrap();
        assert_eq!(completion.text, "The answer is 4.");
        assert_eq!(completion.usage.prompt_tokens, 100);
        assert_eq!(completion.usage.completion_tokens, 10);
        // 0.1 * 0.15 + 0.01 * 0.6
        assert!((completion.usage.cost_usd - 0.021).abs() < 1e-9);
    }

    #[test]
    fn parse_completion_missing_content_is_error() {
        let body = json!({"choices": []});
        assert!(parse_completion_body(&body, "m", &CostTable::default()).is_err());
    }

    #[test]
    fn parse_completion_without_usage_defaults_to_zero() {
        let body = json!({"choices": [{"message": {"content": "ok"}}]});
        let completion = parse_completion_body(&body, "m", &CostTable::default()).unwrap();
        assert_eq!(completion.usage.prompt_tokens, 0);
        assert_eq!(completion.usage.cost_usd, 0.0);
    }

    // ── Embedding body parsing ─────────────────────────────────────────────

    #[test]
    fn parse_embedding_extracts_vector() {
        let body = json!({"data": [{"embedding": [0.1, 0.2, 0.3]}]});
        let vector = parse_embedding_body(&body).unwrap();
        assert_eq!(vector.len(), 3);
        assert!((vector[1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn parse_embedding_rejects_empty_or_missing() {
        assert!(parse_embedding_body(&json!({"data": []})).is_err());
        assert!(parse_embedding_body(&json!({"data": [{"embedding": []}]})).is_err());
    }

    // ── Cost accounting ────────────────────────────────────────────────────

    #[test]
    fn cost_summary_accumulates_usage() {
        let mut summary = CostSummary::default();
        summary.add(Usage { prompt_tokens: 10, completion_tokens: 5, cost_usd: 0.01 });
        summary.add(Usage { prompt_tokens: 20, completion_tokens: 15, cost_usd: 0.02 });
        assert_eq!(summary.calls, 2);
        assert_eq!(summary.prompt_tokens, 30);
        assert_eq!(summary.completion_tokens, 20);
        assert!((summary.cost_usd - 0.03).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let table = CostTable::default();
        assert_eq!(table.price_usd("mystery-model", 1000, 1000), 0.0);
    }

    // ── Spec resolution ────────────────────────────────────────────────────

    #[test]
    fn spec_resolves_from_config_with_defaults() {
        let config = ConfigSnapshot::from_keys([
            ("llm spec model for math default", "deepseek-coder"),
            ("llm base url", "http://localhost:8080/v1"),
        ]);
        let spec = LlmSpec::resolve(&config, "math default");
        assert_eq!(spec.model, "deepseek-coder");
        assert_eq!(spec.base_url, "http://localhost:8080/v1");
        assert_eq!(spec.temperature, 0.0);

        let fallback = LlmSpec::resolve(&config, "unknown key");
        assert_eq!(fallback.model, "gpt-4o-mini");
    }

    #[test]
    fn with_model_keeps_other_fields() {
        let spec = LlmSpec {
            model: "a".into(),
            base_url: "http://x/v1".into(),
            temperature: 0.2,
            max_tokens: 512,
        };
        let swapped = spec.with_model("b");
        assert_eq!(swapped.model, "b");
        assert_eq!(swapped.base_url, "http://x/v1");
        assert_eq!(swapped.max_tokens, 512);
    }
}
