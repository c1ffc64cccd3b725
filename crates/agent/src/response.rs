use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::error::AgentError;

/// How strictly the XML-ish model output is interpreted.
///
/// `Structured` demands every expected field; `Hybrid` runs both parsers,
/// logs their disagreements, and returns the structured result, falling back
/// to baseline when structured parsing fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseStrategy {
    #[default]
    Baseline,
    Structured,
    Hybrid,
}

impl ParseStrategy {
    pub fn from_config_value(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "structured" => ParseStrategy::Structured,
            "hybrid" => ParseStrategy::Hybrid,
            _ => ParseStrategy::Baseline,
        }
    }
}

/// Named fields pulled from one model response, plus the code body when the
/// family produces code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub fields: IndexMap<String, String>,
    pub code: Vec<String>,
}

impl ParsedResponse {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn get_or_default(&self, field: &str) -> String {
        self.fields.get(field).cloned().unwrap_or_default()
    }
}

/// First `<tag>…</tag>` body in `text`, trimmed. Tag scan, not an XML parser
/// — model output is too loose for one.
pub fn get_tag_value(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].trim().to_string())
}

/// Code bodies arrive either as `<code><line>…</line>…</code>` or as a bare
/// newline-separated block inside `<code>`.
pub fn extract_code_lines(text: &str) -> Vec<String> {
    let Some(body) = get_tag_value(text, "code") else {
        return Vec::new();
    };
    if body.contains("<line>") {
        let mut lines = Vec::new();
        let mut rest = body.as_str();
        while let Some(start) = rest.find("<line>") {
            let after = &rest[start + "<line>".len()..];
            let Some(end) = after.find("</line>") else { break };
            lines.push(after[..end].to_string());
            rest = &after[end + "</line>".len()..];
        }
        lines
    } else {
        body.lines().map(str::to_string).collect()
    }
}

pub fn parse_response(
    text: &str,
    expected_fields: &[String],
    strategy: ParseStrategy,
) -> Result<ParsedResponse, AgentError> {
    match strategy {
        ParseStrategy::Baseline => parse_baseline(text, expected_fields),
        ParseStrategy::Structured => match parse_structured(text, expected_fields) {
            Ok(parsed) => Ok(parsed),
            Err(err) => {
                warn!(%err, "structured parse failed — falling back to baseline");
                parse_baseline(text, expected_fields)
            }
        },
        ParseStrategy::Hybrid => parse_hybrid(text, expected_fields),
    }
}

/// Tag-scan every expected field; a field that is absent is simply omitted.
/// Only a response with *no* recognizable field at all is a parse error.
fn parse_baseline(text: &str, expected_fields: &[String]) -> Result<ParsedResponse, AgentError> {
    let mut parsed = ParsedResponse::default();
    for field in expected_fields {
        if field == "code" {
            parsed.code = extract_code_lines(text);
            if !parsed.code.is_empty() {
                parsed.fields.insert(field.clone(), parsed.code.join("\n"));
            }
            continue;
        }
        if let Some(value) = get_tag_value(text, field) {
            parsed.fields.insert(field.clone(), value);
        }
    }
    if parsed.fields.is_empty() && parsed.code.is_empty() {
        return Err(AgentError::ParseFailed(format!(
            "no expected tags found in response ({} expected)",
            expected_fields.len()
        )));
    }
    Ok(parsed)
}

/// Validate against the declared schema: every expected field must be
/// present and non-empty.
fn parse_structured(text: &str, expected_fields: &[String]) -> Result<ParsedResponse, AgentError> {
    let parsed = parse_baseline(text, expected_fields)?;
    for field in expected_fields {
        let present = if field == "code" {
            !parsed.code.is_empty()
        } else {
            parsed.get(field).is_some_and(|value| !value.is_empty())
        };
        if !present {
            return Err(AgentError::ParseFailed(format!(
                "structured parse: missing required field <{field}>"
            )));
        }
    }
    Ok(parsed)
}

/// Run both parsers, log field-level differences, return the structured
/// result (or baseline when structured fails — callers never lose a
/// parseable response to strictness).
fn parse_hybrid(text: &str, expected_fields: &[String]) -> Result<ParsedResponse, AgentError> {
    let baseline = parse_baseline(text, expected_fields);
    match parse_structured(text, expected_fields) {
        Ok(structured) => {
            if let Ok(baseline) = baseline {
                for (field, value) in &structured.fields {
                    if baseline.get(field) != Some(value.as_str()) {
                        debug!(field = %field, "hybrid parse: baseline/structured disagree");
                    }
                }
            }
            Ok(structured)
        }
        Err(err) => {
            warn!(%err, "hybrid parse: structured side failed — using baseline");
            baseline
        }
    }
}

/// The dynamic response-schema block appended to prompts so the model knows
/// exactly which tags to emit.
pub fn render_response_schema(expected_fields: &[String]) -> String {
    let mut schema = String::from("Respond with exactly this XML structure:\n<response>\n");
    for field in expected_fields {
        if field == "code" {
            schema.push_str("  <code>\n    <line>first line</line>\n    <line>…</line>\n  </code>\n");
        } else {
            schema.push_str(&format!("  <{field}>…</{field}>\n"));
        }
    }
    schema.push_str("</response>");
    schema
}
