//! A [`Backend`] over any edgequake-llm vision provider.
//!
//! The same type serves local models (Ollama) and remote APIs (OpenAI,
//! Gemini, Mistral, ...); the difference is only in the [`BackendSpec`]
//! capabilities and provider name.
//!
//! ## Retry Strategy
//!
//! Transient API errors are retried with exponential backoff
//! (`retry_backoff_ms * 2^(attempt-1)`): with 500 ms base and 3 retries the
//! wait sequence is 500 ms → 1 s → 2 s.

use crate::backend::{Backend, BackendCapabilities};
use crate::config::BackendSpec;
use crate::document::Page;
use crate::error::{BackendError, DocrError};
use crate::output::{FigureRecord, PageRecord};
use crate::pipeline::audit::extract_json_object;
use crate::pipeline::encode::encode_image;
use crate::prompts::{figure_user_prompt, FIGURE_SYSTEM_PROMPT, PAGE_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

struct ChatReply {
    content: String,
    prompt_tokens: u64,
    completion_tokens: u64,
}

pub struct VisionLlmBackend {
    spec: BackendSpec,
    provider: Arc<dyn LLMProvider>,
    http: reqwest::Client,
}

impl std::fmt::Debug for VisionLlmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionLlmBackend")
            .field("spec", &self.spec)
            .field("provider", &"<dyn LLMProvider>")
            .finish()
    }
}

impl VisionLlmBackend {
    pub fn new(spec: BackendSpec, provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            spec,
            provider,
            http: reqwest::Client::new(),
        }
    }

    /// Construct the provider named in `spec` via [`ProviderFactory`].
    ///
    /// API keys are read from the environment by the factory.
    pub fn from_spec(spec: BackendSpec) -> Result<Self, DocrError> {
        let provider =
            ProviderFactory::create_llm_provider(&spec.provider, &spec.model).map_err(|e| {
                DocrError::ProviderNotConfigured {
                    backend: spec.name.clone(),
                    provider: spec.provider.clone(),
                    hint: format!("{e}"),
                }
            })?;
        Ok(Self::new(spec, provider))
    }

    pub fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.spec.temperature),
            max_tokens: Some(self.spec.max_tokens),
            ..Default::default()
        }
    }

    async fn chat_with_retry(
        &self,
        label: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatReply, BackendError> {
        let options = self.options();
        let mut last_err: Option<String> = None;

        for attempt in 0..=self.spec.max_retries {
            if attempt > 0 {
                let backoff = self.spec.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "{} [{}]: retry {}/{} after {}ms",
                    label, self.spec.name, attempt, self.spec.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(messages, Some(&options)).await {
                Ok(response) => {
                    return Ok(ChatReply {
                        content: response.content,
                        prompt_tokens: response.prompt_tokens as u64,
                        completion_tokens: response.completion_tokens as u64,
                    });
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    warn!(
                        "{} [{}]: attempt {} failed: {}",
                        label,
                        self.spec.name,
                        attempt + 1,
                        msg
                    );
                    last_err = Some(msg);
                }
            }
        }

        Err(BackendError::CallFailed {
            backend: self.spec.name.clone(),
            detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
        })
    }
}

#[async_trait]
impl Backend for VisionLlmBackend {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            id: self.spec.name.clone(),
            is_local: self.spec.local,
            cost_per_page: self.spec.cost_per_page,
            supports_figures: self.spec.supports_figures,
            best_for: self.spec.best_for.clone(),
        }
    }

    async fn is_available(&self) -> bool {
        let Some(url) = self.spec.probe_url.as_deref() else {
            return true;
        };
        match self.http.get(url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("{}: probe {} failed: {}", self.spec.name, url, e);
                false
            }
        }
    }

    fn availability_hint(&self) -> String {
        match &self.spec.probe_url {
            Some(url) => format!("{}: {} did not respond", self.spec.name, url),
            None => format!("{}: check the {} API key", self.spec.name, self.spec.provider),
        }
    }

    async fn process_page(&self, page: &Page) -> PageRecord {
        let start = Instant::now();
        let label = format!("Page {}", page.index);

        let image_data = match encode_image(&page.image) {
            Ok(d) => d,
            Err(e) => {
                let err = BackendError::ImageEncoding(e.to_string());
                return PageRecord::error(page.index, self.name(), err.to_string())
                    .with_elapsed_ms(start.elapsed().as_millis() as u64);
            }
        };
        let messages = vec![
            ChatMessage::system(PAGE_SYSTEM_PROMPT),
            ChatMessage::user_with_images("", vec![image_data]),
        ];

        match self.chat_with_retry(&label, &messages).await {
            Ok(reply) => {
                debug!(
                    "{} [{}]: {} input tokens, {} output tokens, {:?}",
                    label,
                    self.spec.name,
                    reply.prompt_tokens,
                    reply.completion_tokens,
                    start.elapsed()
                );
                PageRecord::success(page.index, self.name(), strip_outer_fence(&reply.content))
                    .with_cost(self.spec.cost_per_page)
                    .with_elapsed_ms(start.elapsed().as_millis() as u64)
            }
            Err(e) => PageRecord::error(page.index, self.name(), e.to_string())
                .with_elapsed_ms(start.elapsed().as_millis() as u64),
        }
    }

    async fn describe_figure(&self, image: &DynamicImage, context: &str) -> FigureRecord {
        let mut record = super::unsupported_figure(self.name());
        if !self.spec.supports_figures {
            return record;
        }

        let image_data = match encode_image(image) {
            Ok(d) => d,
            Err(e) => {
                record.description = format!("Figure description failed: {e}");
                return record;
            }
        };
        let messages = vec![
            ChatMessage::system(FIGURE_SYSTEM_PROMPT),
            ChatMessage::user_with_images(figure_user_prompt(context), vec![image_data]),
        ];

        match self.chat_with_retry("Figure", &messages).await {
            Ok(reply) => {
                let (figure_type, description) = parse_figure_reply(&reply.content);
                record.figure_type = figure_type;
                record.description = description;
            }
            Err(e) => {
                record.description = format!("Figure description failed: {e}");
            }
        }
        record
    }
}

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md|json)?\n(.*)\n```\s*$").unwrap());

/// Remove a single fence wrapping the whole reply.
fn strip_outer_fence(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCE.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

/// Read `{figure_type, description}` from a reply, falling back to the raw
/// text as the description.
fn parse_figure_reply(content: &str) -> (String, String) {
    let text = strip_outer_fence(content);
    match extract_json_object(&text) {
        Some((obj, _)) => {
            let figure_type = obj
                .get("figure_type")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .unwrap_or("unknown")
                .to_lowercase();
            let description = obj
                .get("description")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or(text);
            (figure_type, description)
        }
        None => ("unknown".to_string(), text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_fence() {
        assert_eq!(strip_outer_fence("```markdown\n# Title\n```"), "# Title");
        assert_eq!(strip_outer_fence("```\nplain\n```\n"), "plain");
        assert_eq!(strip_outer_fence("  no fence  "), "no fence");
    }

    #[test]
    fn figure_reply_json() {
        let (t, d) = parse_figure_reply(
            r#"```json
{"figure_type": "Chart", "description": "GDP growth 2010-2020"}
```"#,
        );
        assert_eq!(t, "chart");
        assert_eq!(d, "GDP growth 2010-2020");
    }

    #[test]
    fn figure_reply_with_preamble() {
        let (t, d) = parse_figure_reply(
            r#"Here you go: {"figure_type": "diagram", "description": "flow"}"#,
        );
        assert_eq!(t, "diagram");
        assert_eq!(d, "flow");
    }

    #[test]
    fn figure_reply_plain_text() {
        let (t, d) = parse_figure_reply("A photo of a bridge.");
        assert_eq!(t, "unknown");
        assert_eq!(d, "A photo of a bridge.");
    }
}
