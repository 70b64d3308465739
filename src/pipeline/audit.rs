//! Narrative auditor: model-based judgement of extracted text.
//!
//! [`NarrativeAuditor`] sends page text to a reasoning model served by Ollama
//! and parses its verdict. The response parser is total and tries, in order:
//!
//! 1. the whole response as one JSON object;
//! 2. a JSON object starting at each successive `{` (models that prepend
//!    commentary before the JSON);
//! 3. a keyword scan of the raw text.
//!
//! Malformed output therefore never surfaces as an error; the worst case is
//! [`Verdict::Unknown`].

use crate::config::AuditConfig;
use crate::prompts::audit_prompt;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

const TRUNCATION_MARKER: &str = "\n\n[... truncated for audit ...]";
const REASONING_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Acceptable,
    NeedsReview,
    Poor,
    #[default]
    Unknown,
}

impl Verdict {
    fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "acceptable" => Verdict::Acceptable,
            "needs_review" => Verdict::NeedsReview,
            "poor" => Verdict::Poor,
            _ => Verdict::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Acceptable => "acceptable",
            Verdict::NeedsReview => "needs_review",
            Verdict::Poor => "poor",
            Verdict::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditVerdict {
    pub verdict: Verdict,
    pub confidence: f32,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub reasoning: String,
}

impl AuditVerdict {
    /// Only an `acceptable` verdict clears a flagged page.
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Acceptable
    }

    fn unknown(issue: String) -> Self {
        Self {
            issues: vec![issue],
            ..Default::default()
        }
    }

    fn from_object(obj: &Map<String, Value>) -> Self {
        let strings = |key: &str| -> Vec<String> {
            obj.get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let confidence = match obj.get("confidence") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        };
        Self {
            verdict: obj
                .get("verdict")
                .and_then(Value::as_str)
                .map(Verdict::from_label)
                .unwrap_or_default(),
            confidence: (confidence as f32).clamp(0.0, 1.0),
            issues: strings("issues"),
            suggestions: strings("suggestions"),
            reasoning: obj
                .get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

/// Which parser tier produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseTier {
    WholeJson,
    EmbeddedJson,
    Keywords,
}

/// Find a JSON object in model output: the whole string first, then each
/// successive `{` position.
pub fn extract_json_object(text: &str) -> Option<(Map<String, Value>, ParseTier)> {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) {
        return Some((obj, ParseTier::WholeJson));
    }
    text.match_indices('{').find_map(|(start, _)| {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(obj))) => Some((obj, ParseTier::EmbeddedJson)),
            _ => None,
        }
    })
}

/// Parse an audit response. Never fails.
pub fn parse_audit_response(response: &str) -> (AuditVerdict, ParseTier) {
    if let Some((obj, tier)) = extract_json_object(response) {
        return (AuditVerdict::from_object(&obj), tier);
    }

    let lower = response.to_lowercase();
    let verdict = if lower.contains("acceptable") {
        Verdict::Acceptable
    } else if lower.contains("poor") {
        Verdict::Poor
    } else if lower.contains("needs_review") || lower.contains("review") {
        Verdict::NeedsReview
    } else {
        Verdict::Unknown
    };
    (
        AuditVerdict {
            verdict,
            reasoning: response.chars().take(REASONING_PREVIEW_CHARS).collect(),
            ..Default::default()
        },
        ParseTier::Keywords,
    )
}

/// Cut `text` to `max_chars` characters, marking the cut.
fn truncate_for_audit(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{}", &text[..byte_idx], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

/// A model-based text auditor.
///
/// Callers probe [`TextAuditor::is_available`] once and stop using the
/// auditor for the run if it reports false.
#[async_trait]
pub trait TextAuditor: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn audit(&self, text: &str) -> AuditVerdict;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    #[serde(default)]
    name: String,
}

/// Ollama-backed [`TextAuditor`].
#[derive(Debug, Clone)]
pub struct NarrativeAuditor {
    client: Client,
    host: String,
    model: String,
    max_chars: usize,
}

impl NarrativeAuditor {
    pub fn new(config: &AuditConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!("Audit HTTP client config rejected ({e}); using defaults");
                Client::new()
            });
        Self {
            client,
            host: config.ollama_host.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_chars: config.max_chars,
        }
    }

    /// Model name without its `:tag` suffix.
    fn base_name(name: &str) -> &str {
        name.split(':').next().unwrap_or(name)
    }
}

#[async_trait]
impl TextAuditor for NarrativeAuditor {
    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.host);
        let resp = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!("Audit probe {}: HTTP {}", url, r.status());
                return false;
            }
            Err(e) => {
                debug!("Audit probe {} failed: {}", url, e);
                return false;
            }
        };
        match resp.json::<TagsResponse>().await {
            Ok(tags) => {
                let wanted = Self::base_name(&self.model);
                tags.models
                    .iter()
                    .any(|m| Self::base_name(&m.name) == wanted)
            }
            Err(_) => false,
        }
    }

    async fn audit(&self, text: &str) -> AuditVerdict {
        if text.trim().is_empty() {
            return AuditVerdict {
                verdict: Verdict::Poor,
                confidence: 1.0,
                issues: vec!["Empty text output".into()],
                reasoning: "No text was extracted".into(),
                ..Default::default()
            };
        }

        let request = GenerateRequest {
            model: &self.model,
            prompt: audit_prompt(&truncate_for_audit(text, self.max_chars)),
            stream: false,
            format: "json",
        };
        let url = format!("{}/api/generate", self.host);
        let resp = match self.client.post(&url).json(&request).send().await {
            Ok(r) => r,
            Err(e) => return AuditVerdict::unknown(format!("Audit error: {e}")),
        };
        if !resp.status().is_success() {
            return AuditVerdict::unknown(format!("Ollama error: {}", resp.status().as_u16()));
        }
        match resp.json::<GenerateResponse>().await {
            Ok(body) => {
                let (verdict, tier) = parse_audit_response(&body.response);
                debug!("Audit verdict {} (parsed via {:?})", verdict.verdict.as_str(), tier);
                verdict
            }
            Err(e) => AuditVerdict::unknown(format!("Audit error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_one_whole_json() {
        let (v, tier) = parse_audit_response(
            r#"{"verdict":"poor","confidence":0.7,"issues":["garbled"],"suggestions":[],"reasoning":"bad"}"#,
        );
        assert_eq!(tier, ParseTier::WholeJson);
        assert_eq!(v.verdict, Verdict::Poor);
        assert_eq!(v.issues, vec!["garbled".to_string()]);
        assert!((v.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn tier_two_commentary_prefix() {
        let (v, tier) = parse_audit_response(r#"Sure! {"verdict":"acceptable","confidence":0.9}"#);
        assert_eq!(tier, ParseTier::EmbeddedJson);
        assert_eq!(v.verdict, Verdict::Acceptable);
        assert!(v.passed());
        assert!((v.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn tier_two_skips_broken_brace() {
        let (v, tier) = parse_audit_response(
            r#"<think>{not json</think> {"verdict":"needs_review","confidence":"0.4","issues":[]} trailing"#,
        );
        assert_eq!(tier, ParseTier::EmbeddedJson);
        assert_eq!(v.verdict, Verdict::NeedsReview);
        assert!((v.confidence - 0.4).abs() < 1e-6);
    }

    #[test]
    fn tier_three_keywords_in_priority_order() {
        let (v, tier) = parse_audit_response("The text is poor but acceptable overall");
        assert_eq!(tier, ParseTier::Keywords);
        assert_eq!(v.verdict, Verdict::Acceptable);

        let (v, _) = parse_audit_response("Quality is POOR.");
        assert_eq!(v.verdict, Verdict::Poor);

        let (v, _) = parse_audit_response("I would send this for review");
        assert_eq!(v.verdict, Verdict::NeedsReview);

        let (v, _) = parse_audit_response("¯\\_(ツ)_/¯");
        assert_eq!(v.verdict, Verdict::Unknown);
    }

    #[test]
    fn keyword_reasoning_is_capped() {
        let long = "x".repeat(2000);
        let (v, _) = parse_audit_response(&long);
        assert_eq!(v.reasoning.chars().count(), REASONING_PREVIEW_CHARS);
    }

    #[test]
    fn unknown_label_maps_to_unknown() {
        let (v, _) = parse_audit_response(r#"{"verdict":"great"}"#);
        assert_eq!(v.verdict, Verdict::Unknown);
        assert!(!v.passed());
    }

    #[test]
    fn truncation_marks_cut() {
        assert_eq!(truncate_for_audit("short", 10), "short");
        let t = truncate_for_audit("ééééé", 2);
        assert!(t.starts_with("éé\n\n[... truncated"));
    }

    #[test]
    fn model_base_name_ignores_tag() {
        assert_eq!(NarrativeAuditor::base_name("deepseek-r1:32b"), "deepseek-r1");
        assert_eq!(NarrativeAuditor::base_name("llama3"), "llama3");
    }

    #[tokio::test]
    async fn empty_text_is_poor_without_network() {
        let auditor = NarrativeAuditor::new(&AuditConfig {
            ollama_host: "http://127.0.0.1:9".into(),
            ..Default::default()
        });
        let v = auditor.audit("  ").await;
        assert_eq!(v.verdict, Verdict::Poor);
        assert_eq!(v.confidence, 1.0);
        assert_eq!(v.issues, vec!["Empty text output".to_string()]);
    }
}
