//! Configuration types for a docr pipeline run.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`] or loaded from JSON with
//! [`PipelineConfig::from_json_file`]. Every section deserialises with
//! defaults, so a config file only needs the keys it changes.

use crate::error::DocrError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Configuration for one document-processing run.
///
/// # Example
/// ```rust
/// use docr::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .page_concurrency(8)
///     .figures_enabled(false)
///     .primary_override("gemini")
///     .build()
///     .unwrap();
/// assert_eq!(config.page_concurrency, 8);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent page extractions in stages 1, 2 and 3. Default: 4.
    ///
    /// A value of 1 processes pages strictly sequentially.
    pub page_concurrency: usize,

    /// Concurrent figure descriptions in stage 4. Default: 2.
    pub figure_concurrency: usize,

    /// Per-page backend call timeout in seconds. Default: 300.
    ///
    /// Local models on CPU can take minutes per page; a timeout surfaces as an
    /// `error` record for that page, never as a run failure.
    pub backend_timeout_secs: u64,

    /// Per-figure description timeout in seconds. Default: 180.
    pub figure_timeout_secs: u64,

    /// Rendering DPI for page rasterisation. Range: 72–400. Default: 150.
    pub render_dpi: u32,

    /// Maximum rendered page dimension in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    pub routing: RoutingConfig,
    pub audit: AuditConfig,
    pub figures: FigureConfig,

    /// Declarative backend list used by the CLI. Empty means "derive from
    /// environment".
    pub backends: Vec<BackendSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_concurrency: 4,
            figure_concurrency: 2,
            backend_timeout_secs: 300,
            figure_timeout_secs: 180,
            render_dpi: 150,
            max_rendered_pixels: 2000,
            password: None,
            routing: RoutingConfig::default(),
            audit: AuditConfig::default(),
            figures: FigureConfig::default(),
            backends: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load a config from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DocrError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| DocrError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig =
            serde_json::from_str(&raw).map_err(|e| DocrError::ConfigParse {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the builder would otherwise enforce.
    pub fn validate(&self) -> Result<(), DocrError> {
        if self.page_concurrency == 0 || self.figure_concurrency == 0 {
            return Err(DocrError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if !(72..=400).contains(&self.render_dpi) || !(72..=400).contains(&self.figures.render_dpi)
        {
            return Err(DocrError::InvalidConfig(format!(
                "DPI must be 72–400, got {} (pages) / {} (figures)",
                self.render_dpi, self.figures.render_dpi
            )));
        }
        if self.figures.enabled && self.figures.render_dpi <= self.render_dpi {
            return Err(DocrError::InvalidConfig(format!(
                "Figure DPI ({}) must be higher than page DPI ({})",
                self.figures.render_dpi, self.render_dpi
            )));
        }
        let h = &self.audit.heuristics;
        if h.min_avg_word_length > h.max_avg_word_length {
            return Err(DocrError::InvalidConfig(format!(
                "min_avg_word_length ({}) exceeds max_avg_word_length ({})",
                h.min_avg_word_length, h.max_avg_word_length
            )));
        }
        if !(0.0..=1.0).contains(&h.max_garbage_ratio) {
            return Err(DocrError::InvalidConfig(format!(
                "max_garbage_ratio must be within 0–1, got {}",
                h.max_garbage_ratio
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        for spec in &self.backends {
            if !seen.insert(spec.name.as_str()) {
                return Err(DocrError::InvalidConfig(format!(
                    "duplicate backend name '{}'",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.page_concurrency = n.max(1);
        self
    }

    pub fn figure_concurrency(mut self, n: usize) -> Self {
        self.config.figure_concurrency = n.max(1);
        self
    }

    pub fn backend_timeout_secs(mut self, secs: u64) -> Self {
        self.config.backend_timeout_secs = secs.max(1);
        self
    }

    pub fn figure_timeout_secs(mut self, secs: u64) -> Self {
        self.config.figure_timeout_secs = secs.max(1);
        self
    }

    pub fn render_dpi(mut self, dpi: u32) -> Self {
        self.config.render_dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn routing(mut self, routing: RoutingConfig) -> Self {
        self.config.routing = routing;
        self
    }

    pub fn enable_backend(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.config.routing.enabled.insert(name.into(), enabled);
        self
    }

    pub fn primary_override(mut self, name: impl Into<String>) -> Self {
        self.config.routing.primary_override = Some(name.into());
        self
    }

    pub fn fallback_override(mut self, name: impl Into<String>) -> Self {
        self.config.routing.fallback_override = Some(name.into());
        self
    }

    pub fn figure_override(mut self, name: impl Into<String>) -> Self {
        self.config.routing.figure_override = Some(name.into());
        self
    }

    pub fn audit(mut self, audit: AuditConfig) -> Self {
        self.config.audit = audit;
        self
    }

    pub fn heuristics(mut self, thresholds: HeuristicThresholds) -> Self {
        self.config.audit.heuristics = thresholds;
        self
    }

    pub fn narrative_audit(mut self, enabled: bool) -> Self {
        self.config.audit.narrative_enabled = enabled;
        self
    }

    pub fn cross_check(mut self, enabled: bool) -> Self {
        self.config.audit.cross_check_enabled = enabled;
        self
    }

    pub fn figures(mut self, figures: FigureConfig) -> Self {
        self.config.figures = figures;
        self
    }

    pub fn figures_enabled(mut self, enabled: bool) -> Self {
        self.config.figures.enabled = enabled;
        self
    }

    pub fn figure_save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.figures.save_dir = Some(dir.into());
        self
    }

    pub fn backend(mut self, spec: BackendSpec) -> Self {
        self.config.backends.push(spec);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, DocrError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Read-only routing input for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Per-backend enable flags. A backend missing from the map is enabled.
    pub enabled: BTreeMap<String, bool>,
    pub primary_override: Option<String>,
    pub fallback_override: Option<String>,
    pub figure_override: Option<String>,
    /// Tie-break order among otherwise equal candidates. Backends not listed
    /// keep registration order after the listed ones.
    pub priority: Vec<String>,
}

impl RoutingConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.get(name).copied().unwrap_or(true)
    }

    /// Position of `name` in the priority list, or `usize::MAX` when unlisted.
    pub fn priority_of(&self, name: &str) -> usize {
        self.priority
            .iter()
            .position(|p| p == name)
            .unwrap_or(usize::MAX)
    }
}

/// Stage-2 settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub heuristics: HeuristicThresholds,
    /// Run the narrative auditor on pages still flagged after heuristics.
    pub narrative_enabled: bool,
    /// Base URL of the Ollama server hosting the audit model.
    pub ollama_host: String,
    pub model: String,
    /// Input truncation budget in characters.
    pub max_chars: usize,
    pub timeout_secs: u64,
    /// At most this many flagged pages are narratively audited per run.
    pub max_narrative_pages: usize,
    pub cross_check_enabled: bool,
    pub cross_check_pages: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            heuristics: HeuristicThresholds::default(),
            narrative_enabled: true,
            ollama_host: "http://localhost:11434".to_string(),
            model: "deepseek-r1:32b".to_string(),
            max_chars: 4000,
            timeout_secs: 60,
            max_narrative_pages: 3,
            cross_check_enabled: false,
            cross_check_pages: 2,
        }
    }
}

/// Thresholds for the quality metrics engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicThresholds {
    pub min_word_count: usize,
    pub max_garbage_ratio: f64,
    pub min_avg_word_length: f64,
    pub max_avg_word_length: f64,
}

impl Default for HeuristicThresholds {
    fn default() -> Self {
        Self {
            min_word_count: 50,
            max_garbage_ratio: 0.15,
            min_avg_word_length: 2.0,
            max_avg_word_length: 15.0,
        }
    }
}

/// Stage-4 settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FigureConfig {
    pub enabled: bool,
    /// Document-wide cap on extracted figures.
    pub max_total: usize,
    pub max_per_page: usize,
    /// Characters of page text passed to the describer as context.
    pub context_max_chars: usize,
    /// DPI used to render figure clips. Must exceed the page DPI while
    /// figures are enabled.
    pub render_dpi: u32,
    /// Longest side of a figure image after downscaling.
    pub max_dimension: u32,
    /// When set, each figure image is written here as `figure_{n}_page{p}.png`.
    pub save_dir: Option<PathBuf>,
}

impl Default for FigureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_total: 25,
            max_per_page: 3,
            context_max_chars: 1200,
            render_dpi: 200,
            max_dimension: 1024,
            save_dir: None,
        }
    }
}

/// Declarative description of one vision-LLM backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSpec {
    /// Identifier used in routing (`enabled`, overrides, priority).
    pub name: String,
    /// edgequake-llm provider name, e.g. `ollama`, `openai`, `gemini`, `mistral`.
    pub provider: String,
    pub model: String,
    pub local: bool,
    /// USD per page.
    pub cost_per_page: f64,
    pub supports_figures: bool,
    /// Preference tags, e.g. `academic`.
    pub best_for: Vec<String>,
    /// URL whose successful GET means "available". Absent means always available.
    pub probe_url: Option<String>,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for BackendSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            provider: String::new(),
            model: String::new(),
            local: false,
            cost_per_page: 0.0,
            supports_figures: true,
            best_for: Vec::new(),
            probe_url: None,
            max_retries: 3,
            retry_backoff_ms: 500,
            temperature: 0.1,
            max_tokens: 4096,
        }
    }
}
