//! Building blocks of the four-stage OCR pipeline.
//!
//! ```text
//! render ──▶ router ──▶ backend ──▶ heuristics/audit ──▶ fallback ──▶ figures
//! (pdfium)  (select)   (VLM call)  (quality gate)       (escalate)   (detect+describe)
//! ```
//!
//! The stages themselves are sequenced by [`crate::orchestrator::Pipeline`];
//! each module here is independently testable.

pub mod audit;
pub mod cluster;
pub mod encode;
pub mod figures;
pub mod heuristics;
pub mod render;
pub mod router;
