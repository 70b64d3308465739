//! Extraction backends: the trait, capability metadata, and the registry.
//!
//! A backend is anything that can turn a rendered page into text and,
//! optionally, describe a cropped figure. The router never inspects concrete
//! backend types; it only reads [`BackendCapabilities`] and the availability
//! map in an [`AvailabilitySnapshot`].

pub mod vlm;

use crate::config::{BackendSpec, RoutingConfig};
use crate::document::Page;
use crate::output::{FigureRecord, PageRecord};
use crate::prompts::FIGURE_NOT_SUPPORTED;
use async_trait::async_trait;
use futures::future::join_all;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub use vlm::VisionLlmBackend;

/// Backend identifier as used in routing configuration.
pub type BackendId = String;

/// Static description of a backend, declared at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub id: String,
    pub is_local: bool,
    /// USD per page.
    pub cost_per_page: f64,
    pub supports_figures: bool,
    /// Preference tags such as `academic`.
    pub best_for: Vec<String>,
}

impl BackendCapabilities {
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_local: true,
            cost_per_page: 0.0,
            supports_figures: false,
            best_for: Vec::new(),
        }
    }

    pub fn remote(id: impl Into<String>, cost_per_page: f64) -> Self {
        Self {
            id: id.into(),
            is_local: false,
            cost_per_page,
            supports_figures: false,
            best_for: Vec::new(),
        }
    }

    pub fn with_figures(mut self, supported: bool) -> Self {
        self.supports_figures = supported;
        self
    }

    pub fn best_for(mut self, tag: impl Into<String>) -> Self {
        self.best_for.push(tag.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.best_for.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// An interchangeable extraction or figure-description provider.
///
/// Implementations must tolerate concurrent calls. Per-call failures are
/// reported in-band: `process_page` returns an `error`-status record rather
/// than an `Err`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Identifier used by routing config and recorded on every result.
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Cheap, idempotent readiness probe.
    async fn is_available(&self) -> bool;

    /// What to do to make the backend available.
    fn availability_hint(&self) -> String {
        format!("{} is not reachable", self.name())
    }

    async fn process_page(&self, page: &Page) -> PageRecord;

    /// Describe one cropped figure.
    ///
    /// The returned record's `figure_num`, `page_num`, `bbox` and
    /// `image_path` are placeholders; the orchestrator fills them in.
    async fn describe_figure(&self, image: &DynamicImage, context: &str) -> FigureRecord {
        let _ = (image, context);
        unsupported_figure(self.name())
    }
}

/// The standard record for backends without figure support.
pub fn unsupported_figure(backend: &str) -> FigureRecord {
    FigureRecord {
        figure_num: 0,
        page_num: 0,
        figure_type: "unknown".to_string(),
        description: FIGURE_NOT_SUPPORTED.to_string(),
        bbox: None,
        backend: backend.to_string(),
        image_path: None,
    }
}

/// Availability of every enabled backend, probed once.
///
/// Disabled backends are never probed and read as unavailable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvailabilitySnapshot {
    available: BTreeMap<String, bool>,
}

impl AvailabilitySnapshot {
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        Self {
            available: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.available.get(name).copied().unwrap_or(false)
    }

    pub fn available_names(&self) -> Vec<&str> {
        self.available
            .iter()
            .filter(|(_, &up)| up)
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

/// Holds the configured backends in registration order.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.backends.iter().map(|b| b.name()))
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. A backend with the same name replaces the old one.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        if let Some(slot) = self
            .backends
            .iter_mut()
            .find(|b| b.name() == backend.name())
        {
            *slot = backend;
        } else {
            self.backends.push(backend);
        }
    }

    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.iter().find(|b| b.name() == name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn capabilities(&self) -> Vec<BackendCapabilities> {
        self.backends.iter().map(|b| b.capabilities()).collect()
    }

    /// Build vision-LLM backends from declarative specs.
    ///
    /// A spec whose provider cannot be constructed (typically a missing API
    /// key) is logged and left out.
    pub fn from_specs(specs: &[BackendSpec]) -> Self {
        let mut registry = Self::new();
        for spec in specs {
            match VisionLlmBackend::from_spec(spec.clone()) {
                Ok(backend) => registry.register(Arc::new(backend)),
                Err(e) => warn!("Skipping backend '{}': {}", spec.name, e),
            }
        }
        registry
    }

    /// Names of backends the routing config leaves enabled.
    pub fn enabled_names(&self, routing: &RoutingConfig) -> Vec<String> {
        self.backends
            .iter()
            .map(|b| b.name())
            .filter(|n| routing.is_enabled(n))
            .map(str::to_string)
            .collect()
    }

    /// Probe every enabled backend concurrently.
    pub async fn snapshot(&self, routing: &RoutingConfig) -> AvailabilitySnapshot {
        let probes = self
            .backends
            .iter()
            .filter(|b| routing.is_enabled(b.name()))
            .map(|b| async move { (b.name().to_string(), b.is_available().await) });
        let pairs = join_all(probes).await;
        for (name, up) in &pairs {
            debug!("Backend {}: {}", name, if *up { "available" } else { "unavailable" });
        }
        AvailabilitySnapshot::from_pairs(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        up: bool,
    }

    #[async_trait]
    impl Backend for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities::local(self.name)
        }
        async fn is_available(&self) -> bool {
            self.up
        }
        async fn process_page(&self, page: &Page) -> PageRecord {
            PageRecord::success(page.index, self.name, "text")
        }
    }

    #[tokio::test]
    async fn snapshot_skips_disabled_backends() {
        let registry = BackendRegistry::new()
            .with(Arc::new(Fixed { name: "a", up: true }))
            .with(Arc::new(Fixed { name: "b", up: true }))
            .with(Arc::new(Fixed { name: "c", up: false }));
        let mut routing = RoutingConfig::default();
        routing.enabled.insert("b".into(), false);

        let snap = registry.snapshot(&routing).await;
        assert!(snap.is_available("a"));
        assert!(!snap.is_available("b"));
        assert!(!snap.is_available("c"));
        assert_eq!(snap.available_names(), vec!["a"]);
        assert_eq!(registry.enabled_names(&routing), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn default_describe_figure_is_not_supported() {
        let b = Fixed { name: "a", up: true };
        let fig = b.describe_figure(&DynamicImage::new_rgb8(4, 4), "ctx").await;
        assert_eq!(fig.description, FIGURE_NOT_SUPPORTED);
        assert_eq!(fig.backend, "a");
    }

    #[test]
    fn register_replaces_same_name() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(Fixed { name: "a", up: false }));
        registry.register(Arc::new(Fixed { name: "a", up: true }));
        assert_eq!(registry.names(), vec!["a"]);
    }

    #[test]
    fn tags_are_case_insensitive() {
        let caps = BackendCapabilities::local("nougat").best_for("Academic");
        assert!(caps.has_tag("academic"));
        assert!(!caps.has_tag("general"));
    }
}
