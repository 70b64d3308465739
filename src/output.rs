//! Result types: per-page records, figure records, and the aggregate result.
//!
//! [`AggregateResult`] holds at most one [`PageRecord`] per page index.
//! Adding a record for an index that already exists replaces it wholesale
//! (text, status and figures). Because of that replacement, statistics are
//! never maintained incrementally: [`AggregateResult::recalculate_stats`]
//! folds over the current record set whenever it changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Confidence below which a page is considered worth reprocessing.
const LOW_CONFIDENCE: f32 = 0.6;

/// Processing status of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    #[default]
    Pending,
    Success,
    /// Processed but with quality concerns.
    Warning,
    Error,
    Skipped,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::Pending => "pending",
            PageStatus::Success => "success",
            PageStatus::Warning => "warning",
            PageStatus::Error => "error",
            PageStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for PageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned bounding box in page units (points), origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center_y(&self) -> f32 {
        (self.y0 + self.y1) / 2.0
    }

    /// Smallest box containing both `self` and `other`.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Integer key used to deduplicate regions found by different strategies.
    ///
    /// Truncates toward zero so that float noise from different object
    /// sources maps to the same key.
    pub fn region_key(&self) -> (i32, i32, i32, i32) {
        (
            self.x0 as i32,
            self.y0 as i32,
            self.x1 as i32,
            self.y1 as i32,
        )
    }
}

/// Description of one detected figure. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureRecord {
    /// Dense, document-wide figure number starting at 1.
    pub figure_num: usize,
    /// 1-based index of the page the figure was found on.
    pub page_num: usize,
    /// Label such as `chart`, `diagram`, `table`, `image`.
    pub figure_type: String,
    pub description: String,
    pub bbox: Option<BoundingBox>,
    pub backend: String,
    pub image_path: Option<String>,
}

/// The authoritative, replaceable result for one page index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    /// 1-based page index.
    pub page_num: usize,
    pub text: String,
    pub status: PageStatus,
    /// Identifier of the backend that produced this record.
    pub backend: String,
    /// Backend-reported confidence in `0.0..=1.0`, when available.
    pub confidence: Option<f32>,
    pub elapsed_ms: u64,
    /// Monetary cost of producing this record, in USD.
    pub cost: f64,
    pub error_message: Option<String>,
    pub figures: Vec<FigureRecord>,
    pub audit_passed: bool,
    pub audit_notes: Vec<String>,
}

impl PageRecord {
    /// A pending record with no content.
    pub fn new(page_num: usize) -> Self {
        Self {
            page_num,
            text: String::new(),
            status: PageStatus::Pending,
            backend: String::new(),
            confidence: None,
            elapsed_ms: 0,
            cost: 0.0,
            error_message: None,
            figures: Vec::new(),
            audit_passed: true,
            audit_notes: Vec::new(),
        }
    }

    /// A successful extraction.
    pub fn success(page_num: usize, backend: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: PageStatus::Success,
            backend: backend.into(),
            ..Self::new(page_num)
        }
    }

    /// A failed extraction carrying the error message.
    pub fn error(page_num: usize, backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: PageStatus::Error,
            backend: backend.into(),
            error_message: Some(message.into()),
            ..Self::new(page_num)
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_elapsed_ms(mut self, ms: u64) -> Self {
        self.elapsed_ms = ms;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == PageStatus::Error
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    /// Whether the page should go through another backend.
    pub fn needs_reprocessing(&self) -> bool {
        if self.status == PageStatus::Error || !self.audit_passed {
            return true;
        }
        matches!(self.confidence, Some(c) if c < LOW_CONFIDENCE)
    }
}

/// Rolled-up statistics. Always derived from the current page set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_pages: usize,
    pub pages_success: usize,
    pub pages_warning: usize,
    pub pages_error: usize,
    pub pages_skipped: usize,
    pub figures_detected: usize,
    pub total_time_secs: f64,
    pub total_cost: f64,
    /// Pages attributed to each backend in the final record set.
    pub backends_used: BTreeMap<String, usize>,
}

impl ProcessingStats {
    fn add_page(&mut self, page: &PageRecord) {
        self.total_pages += 1;
        match page.status {
            PageStatus::Success => self.pages_success += 1,
            PageStatus::Warning => self.pages_warning += 1,
            PageStatus::Error => self.pages_error += 1,
            PageStatus::Skipped => self.pages_skipped += 1,
            PageStatus::Pending => {}
        }
        self.figures_detected += page.figures.len();
        self.total_cost += page.cost;
        if !page.backend.is_empty() {
            *self.backends_used.entry(page.backend.clone()).or_insert(0) += 1;
        }
    }

    /// Fraction of pages that produced usable text (success or warning).
    pub fn success_rate(&self) -> f64 {
        if self.total_pages == 0 {
            return 0.0;
        }
        (self.pages_success + self.pages_warning) as f64 / self.total_pages as f64
    }
}

/// Complete result for one document run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateResult {
    pub document_path: String,
    /// Keyed by page index; not required to be contiguous.
    pages: BTreeMap<usize, PageRecord>,
    pub stats: ProcessingStats,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AggregateResult {
    pub fn new(document_path: impl Into<String>) -> Self {
        Self {
            document_path: document_path.into(),
            ..Default::default()
        }
    }

    /// Add a page record, replacing any existing record for the same page.
    pub fn add_page_result(&mut self, record: PageRecord) {
        self.pages.insert(record.page_num, record);
    }

    /// Rebuild [`ProcessingStats`] from the current page set.
    ///
    /// `total_time_secs` is wall-clock run time, not derivable from pages, so
    /// it survives the rebuild.
    pub fn recalculate_stats(&mut self) {
        let total_time_secs = self.stats.total_time_secs;
        self.stats = self
            .pages
            .values()
            .fold(ProcessingStats::default(), |mut stats, page| {
                stats.add_page(page);
                stats
            });
        self.stats.total_time_secs = total_time_secs;
    }

    pub fn get_page(&self, page_num: usize) -> Option<&PageRecord> {
        self.pages.get(&page_num)
    }

    pub fn get_page_mut(&mut self, page_num: usize) -> Option<&mut PageRecord> {
        self.pages.get_mut(&page_num)
    }

    /// Page records in ascending page order.
    pub fn pages(&self) -> impl Iterator<Item = &PageRecord> {
        self.pages.values()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages_needing_reprocessing(&self) -> Vec<usize> {
        self.pages
            .values()
            .filter(|p| p.needs_reprocessing())
            .map(|p| p.page_num)
            .collect()
    }

    /// Concatenated text of every page that has any, with page markers.
    pub fn full_text(&self, separator: &str) -> String {
        self.pages
            .values()
            .filter(|p| !p.text.is_empty())
            .map(|p| format!("--- Page {} ---\n{}", p.page_num, p.text))
            .collect::<Vec<_>>()
            .join(separator)
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}
