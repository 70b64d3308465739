//! Observer trait for warnings and progress events.
//!
//! Pass an [`Arc<dyn PipelineObserver>`] to
//! [`crate::orchestrator::Pipeline::with_observer`] to receive events as the
//! pipeline runs. Without one, events are dropped ([`NoopObserver`]); warnings
//! are still emitted as `tracing` events either way.
//!
//! # Example
//!
//! ```rust
//! use docr::{PipelineObserver, Stage};
//! use std::sync::{Arc, Mutex};
//!
//! #[derive(Default)]
//! struct WarningLog(Mutex<Vec<String>>);
//!
//! impl PipelineObserver for WarningLog {
//!     fn on_warning(&self, message: &str) {
//!         self.0.lock().unwrap().push(message.to_string());
//!     }
//! }
//!
//! let log = Arc::new(WarningLog::default());
//! log.on_stage_start(Stage::Primary, 3);
//! log.on_warning("no fallback backend available");
//! assert_eq!(log.0.lock().unwrap().len(), 1);
//! ```

use crate::output::{PageStatus, ProcessingStats};
use std::sync::Arc;

/// The four pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Primary,
    Audit,
    Fallback,
    Figures,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Primary => "primary",
            Stage::Audit => "audit",
            Stage::Fallback => "fallback",
            Stage::Figures => "figures",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives pipeline events.
///
/// Page and figure events may arrive concurrently from different tasks, so
/// implementations must synchronise any shared mutable state. All methods
/// default to no-ops.
pub trait PipelineObserver: Send + Sync {
    /// Called once after pages are loaded.
    fn on_run_start(&self, document: &str, total_pages: usize) {
        let _ = (document, total_pages);
    }

    /// Called when a stage begins. `items` is the number of pages or figures
    /// the stage will dispatch.
    fn on_stage_start(&self, stage: Stage, items: usize) {
        let _ = (stage, items);
    }

    /// Called as each page call finishes, in completion order.
    fn on_page_complete(&self, stage: Stage, page_num: usize, status: PageStatus) {
        let _ = (stage, page_num, status);
    }

    /// Called as each figure description finishes, in completion order.
    fn on_figure_complete(&self, figure_num: usize, page_num: usize) {
        let _ = (figure_num, page_num);
    }

    /// A degraded but non-fatal condition: override unavailable, auditor
    /// disabled, no fallback backend.
    fn on_warning(&self, message: &str) {
        let _ = message;
    }

    /// Called once with the final statistics.
    fn on_run_complete(&self, stats: &ProcessingStats) {
        let _ = stats;
    }
}

/// Drops every event.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

pub type SharedObserver = Arc<dyn PipelineObserver>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        pages: AtomicUsize,
        warnings: AtomicUsize,
    }

    impl PipelineObserver for Counting {
        fn on_page_complete(&self, _stage: Stage, _page_num: usize, _status: PageStatus) {
            self.pages.fetch_add(1, Ordering::SeqCst);
        }

        fn on_warning(&self, _message: &str) {
            self.warnings.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let o = NoopObserver;
        o.on_run_start("a.pdf", 2);
        o.on_stage_start(Stage::Figures, 0);
        o.on_page_complete(Stage::Primary, 1, PageStatus::Success);
        o.on_warning("x");
        o.on_run_complete(&ProcessingStats::default());
    }

    #[test]
    fn overridden_methods_receive_events() {
        let o: Arc<Counting> = Arc::new(Counting::default());
        let shared: SharedObserver = o.clone();
        shared.on_page_complete(Stage::Fallback, 3, PageStatus::Error);
        shared.on_warning("fallback unavailable");
        shared.on_figure_complete(1, 3);
        assert_eq!(o.pages.load(Ordering::SeqCst), 1);
        assert_eq!(o.warnings.load(Ordering::SeqCst), 1);
    }
}
