//! # docr
//!
//! Multi-backend document OCR. Each page of a document is routed to one of
//! several interchangeable extraction backends (local vision models, remote
//! APIs), the text is quality-checked, weak pages are escalated to a
//! different backend, and figures are detected and described.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ Load     rasterise pages via pdfium (spawn_blocking), classify by filename
//!  ├─ Stage 1  primary backend, all pages, bounded concurrency
//!  ├─ Stage 2  heuristics → optional local cross-check → optional narrative audit
//!  ├─ Stage 3  fallback backend for pages still flagged
//!  ├─ Stage 4  figure regions (vector clusters, image blocks, rasters) → descriptions
//!  └─ Output   AggregateResult with per-page records and folded statistics
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docr::{export, BackendRegistry, OutputFormat, Pipeline, PipelineConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::from_json_file("docr.json")?;
//!     let registry = BackendRegistry::from_specs(&config.backends);
//!     let result = Pipeline::new(config, registry).process_pdf("paper.pdf").await?;
//!     export::save_output(&result, OutputFormat::Markdown, None, Path::new("output")).await?;
//!     eprintln!("{}/{} pages ok", result.stats.pages_success, result.stats.total_pages);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docr` binary (clap + anyhow + indicatif + tracing-subscriber) |

pub mod backend;
pub mod config;
pub mod document;
pub mod error;
pub mod export;
pub mod observer;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod prompts;

pub use backend::{
    AvailabilitySnapshot, Backend, BackendCapabilities, BackendId, BackendRegistry,
    VisionLlmBackend,
};
pub use config::{
    AuditConfig, BackendSpec, FigureConfig, HeuristicThresholds, PipelineConfig,
    PipelineConfigBuilder, RoutingConfig,
};
pub use document::{classify_filename, Document, DocumentType, Page, PageSource};
pub use error::{BackendError, DocrError};
pub use export::OutputFormat;
pub use observer::{NoopObserver, PipelineObserver, SharedObserver, Stage};
pub use orchestrator::{AbortHandle, Pipeline};
pub use output::{
    AggregateResult, BoundingBox, FigureRecord, PageRecord, PageStatus, ProcessingStats,
};
pub use pipeline::audit::{AuditVerdict, NarrativeAuditor, TextAuditor, Verdict};
pub use pipeline::figures::{PageGeometry, RasterImageRef};
pub use pipeline::heuristics::{HeuristicsReport, QualityChecker};
pub use pipeline::render::{PdfiumGeometry, PdfiumPageSource};
