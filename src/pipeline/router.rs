//! Backend router: primary, fallback, cross-check and figure selection.
//!
//! A [`Router`] is a pure view over one routing config, the declared
//! capabilities, and one [`AvailabilitySnapshot`]. Nothing is re-probed while
//! a decision is made and no selection is remembered between calls.
//!
//! Preference order for the primary role:
//!
//! 1. local backends tagged for the document type;
//! 2. untagged (general) local backends;
//! 3. local backends tagged only for other document types;
//! 4. remote backends, cheapest first.
//!
//! Ties keep the `priority` list order, then registration order.

use crate::backend::{AvailabilitySnapshot, BackendCapabilities};
use crate::config::RoutingConfig;
use crate::document::DocumentType;
use crate::error::DocrError;
use crate::observer::PipelineObserver;
use std::cmp::Ordering;
use tracing::{debug, warn};

pub struct Router<'a> {
    routing: &'a RoutingConfig,
    backends: &'a [BackendCapabilities],
    snapshot: &'a AvailabilitySnapshot,
    observer: Option<&'a dyn PipelineObserver>,
}

impl<'a> Router<'a> {
    pub fn new(
        routing: &'a RoutingConfig,
        backends: &'a [BackendCapabilities],
        snapshot: &'a AvailabilitySnapshot,
    ) -> Self {
        Self {
            routing,
            backends,
            snapshot,
            observer: None,
        }
    }

    /// Send routing warnings to `observer` as well as the log.
    pub fn with_observer(mut self, observer: &'a dyn PipelineObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn warning(&self, message: String) {
        warn!("{}", message);
        if let Some(o) = self.observer {
            o.on_warning(&message);
        }
    }

    fn caps(&self, name: &str) -> Option<&'a BackendCapabilities> {
        self.backends.iter().find(|c| c.id == name)
    }

    fn usable(&self, caps: &BackendCapabilities) -> bool {
        self.routing.is_enabled(&caps.id) && self.snapshot.is_available(&caps.id)
    }

    /// Registration index, used as the last tie-break.
    fn position(&self, caps: &BackendCapabilities) -> usize {
        self.backends
            .iter()
            .position(|c| c.id == caps.id)
            .unwrap_or(usize::MAX)
    }

    fn by_priority(&self, a: &BackendCapabilities, b: &BackendCapabilities) -> Ordering {
        self.routing
            .priority_of(&a.id)
            .cmp(&self.routing.priority_of(&b.id))
            .then_with(|| self.position(a).cmp(&self.position(b)))
    }

    fn by_cost(&self, a: &BackendCapabilities, b: &BackendCapabilities) -> Ordering {
        a.cost_per_page
            .partial_cmp(&b.cost_per_page)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.by_priority(a, b))
    }

    fn local_rank(caps: &BackendCapabilities, tag: &str) -> u8 {
        if caps.has_tag(tag) {
            0
        } else if caps.best_for.is_empty() {
            1
        } else {
            2
        }
    }

    /// Every declared backend in primary preference order for `doc_type`.
    pub fn primary_order(&self, doc_type: DocumentType) -> Vec<&'a BackendCapabilities> {
        let tag = doc_type.as_str();
        let mut locals: Vec<_> = self.backends.iter().filter(|c| c.is_local).collect();
        locals.sort_by(|a, b| {
            Self::local_rank(a, tag)
                .cmp(&Self::local_rank(b, tag))
                .then_with(|| self.by_priority(a, b))
        });
        let mut remotes: Vec<_> = self.backends.iter().filter(|c| !c.is_local).collect();
        remotes.sort_by(|a, b| self.by_cost(a, b));
        locals.into_iter().chain(remotes).collect()
    }

    /// Every declared backend in fallback preference order: remote backends
    /// cheapest first, then local backends.
    pub fn fallback_order(&self) -> Vec<&'a BackendCapabilities> {
        let mut remotes: Vec<_> = self.backends.iter().filter(|c| !c.is_local).collect();
        remotes.sort_by(|a, b| self.by_cost(a, b));
        let mut locals: Vec<_> = self.backends.iter().filter(|c| c.is_local).collect();
        locals.sort_by(|a, b| self.by_priority(a, b));
        remotes.into_iter().chain(locals).collect()
    }

    /// Check an override; `None` (with a warning) if it cannot be used.
    fn usable_override(&self, role: &str, name: &str) -> Option<String> {
        match self.caps(name) {
            Some(caps) if self.usable(caps) => Some(caps.id.clone()),
            Some(_) => {
                self.warning(format!(
                    "{role} override '{name}' is disabled or unavailable; using automatic selection"
                ));
                None
            }
            None => {
                self.warning(format!(
                    "{role} override '{name}' is not a configured backend; using automatic selection"
                ));
                None
            }
        }
    }

    /// Choose the stage-1 backend.
    ///
    /// Fails with [`DocrError::NoBackendAvailable`] when no enabled backend is
    /// available.
    pub fn select_primary(&self, doc_type: DocumentType) -> Result<String, DocrError> {
        if let Some(name) = self.routing.primary_override.as_deref() {
            if let Some(chosen) = self.usable_override("Primary", name) {
                return Ok(chosen);
            }
        }
        match self
            .primary_order(doc_type)
            .into_iter()
            .find(|c| self.usable(c))
        {
            Some(c) => {
                debug!("Primary backend for {} document: {}", doc_type, c.id);
                Ok(c.id.clone())
            }
            None => Err(DocrError::NoBackendAvailable {
                enabled: self
                    .backends
                    .iter()
                    .filter(|c| self.routing.is_enabled(&c.id))
                    .map(|c| c.id.clone())
                    .collect(),
            }),
        }
    }

    /// Choose a stage-3 backend different from `primary`. `None` is not an
    /// error: flagged pages are left as they are.
    pub fn select_fallback(&self, primary: &str) -> Option<String> {
        if let Some(name) = self.routing.fallback_override.as_deref() {
            if name == primary {
                self.warning(format!(
                    "Fallback override '{name}' is the primary backend; using automatic selection"
                ));
            } else if let Some(chosen) = self.usable_override("Fallback", name) {
                return Some(chosen);
            }
        }
        self.fallback_order()
            .into_iter()
            .find(|c| c.id != primary && self.usable(c))
            .map(|c| c.id.clone())
    }

    /// Choose a local backend other than `primary` for a cheap second opinion.
    pub fn select_cross_check(&self, primary: &str) -> Option<String> {
        let mut locals: Vec<_> = self
            .backends
            .iter()
            .filter(|c| c.is_local && c.id != primary && self.usable(c))
            .collect();
        locals.sort_by(|a, b| self.by_priority(a, b));
        locals.first().map(|c| c.id.clone())
    }

    /// Choose a figure-capable backend for stage 4.
    pub fn select_figure(&self) -> Option<String> {
        if let Some(name) = self.routing.figure_override.as_deref() {
            match self.caps(name) {
                Some(c) if self.usable(c) && c.supports_figures => return Some(c.id.clone()),
                _ => self.warning(format!(
                    "Figure override '{name}' is unavailable or cannot describe figures; using automatic selection"
                )),
            }
        }
        let mut capable: Vec<_> = self
            .backends
            .iter()
            .filter(|c| c.supports_figures && self.usable(c))
            .collect();
        capable.sort_by(|a, b| self.by_priority(a, b));
        capable.first().map(|c| c.id.clone())
    }
}
