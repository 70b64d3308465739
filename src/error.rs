//! Error types for the docr library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`DocrError`] is **fatal**: the run cannot proceed at all (no usable
//!   backend, unreadable PDF, invalid configuration). Returned as
//!   `Err(DocrError)` from [`crate::orchestrator::Pipeline::process`] and the
//!   export helpers.
//!
//! * [`BackendError`] is **non-fatal**: a single page or figure call failed
//!   (network error, timeout, image encoding). Backends fold it into an
//!   `error`-status [`crate::output::PageRecord`] or a substituted figure
//!   description, so one bad page never aborts the batch.
//!
//! Degraded paths that are not failures at all (auditor unreachable, no
//! fallback backend) are reported through
//! [`crate::observer::PipelineObserver::on_warning`] instead of either type.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the docr library.
#[derive(Debug, Error)]
pub enum DocrError {
    // ── Routing ───────────────────────────────────────────────────────────
    /// Stage 1 found no enabled backend that reports itself available.
    #[error(
        "No OCR backends are available. Enabled in config: {}.\n\
Check dependencies, API keys and the local inference server, or enable at least one backend.",
        format_enabled(.enabled)
    )]
    NoBackendAvailable { enabled: Vec<String> },

    /// A configured backend's LLM provider could not be constructed.
    #[error("Backend '{backend}': provider '{provider}' is not configured: {hint}")]
    ProviderNotConfigured {
        backend: String,
        provider: String,
        hint: String,
    },

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.")]
    PasswordRequired { path: PathBuf },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or place the library next to the binary."
    )]
    PdfiumBindingFailed(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::config::PipelineConfig`].
    #[error("Failed to parse config file '{path}': {detail}")]
    ConfigParse { path: PathBuf, detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_enabled(enabled: &[String]) -> String {
    if enabled.is_empty() {
        "none".to_string()
    } else {
        format!("[{}]", enabled.join(", "))
    }
}

/// A non-fatal error for a single backend call.
///
/// Never propagated out of a stage: the orchestrator records it on the
/// affected page or figure and moves on.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum BackendError {
    /// The backend call returned an error after any retries.
    #[error("{backend}: call failed: {detail}")]
    CallFailed { backend: String, detail: String },

    /// The backend call exceeded the configured timeout.
    #[error("{backend}: call timed out after {secs}s")]
    Timeout { backend: String, secs: u64 },

    /// The page or figure image could not be encoded for the request.
    #[error("image encoding failed: {0}")]
    ImageEncoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_backend_lists_enabled() {
        let e = DocrError::NoBackendAvailable {
            enabled: vec!["nougat".into(), "gemini".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("[nougat, gemini]"), "got: {msg}");
    }

    #[test]
    fn no_backend_reports_none() {
        let e = DocrError::NoBackendAvailable { enabled: vec![] };
        assert!(e.to_string().contains("Enabled in config: none"));
    }

    #[test]
    fn timeout_display() {
        let e = BackendError::Timeout {
            backend: "mistral".into(),
            secs: 300,
        };
        assert!(e.to_string().contains("300s"));
        assert!(e.to_string().contains("mistral"));
    }
}
