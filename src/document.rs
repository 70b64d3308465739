//! Documents, rendered pages, and the page-source seam.

use crate::error::DocrError;
use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Coarse document class used to bias primary-backend preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    /// Research papers, scientific articles.
    Academic,
    Policy,
    Financial,
    #[default]
    General,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Academic => "academic",
            DocumentType::Policy => "policy",
            DocumentType::Financial => "financial",
            DocumentType::General => "general",
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const ACADEMIC_KEYWORDS: &[&str] = &["paper", "article", "journal", "arxiv", "nber", "working"];
const POLICY_KEYWORDS: &[&str] = &["policy", "report", "fed", "ecb", "imf", "oecd"];
const FINANCIAL_KEYWORDS: &[&str] = &["financial", "annual", "quarterly", "10k", "10q"];

/// Classify a document by keywords in its file name.
///
/// Returns the type plus the feature tags that triggered it. First matching
/// class wins, checked academic, policy, financial.
pub fn classify_filename(path: &Path) -> (DocumentType, Vec<String>) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let classes = [
        (DocumentType::Academic, ACADEMIC_KEYWORDS),
        (DocumentType::Policy, POLICY_KEYWORDS),
        (DocumentType::Financial, FINANCIAL_KEYWORDS),
    ];
    for (doc_type, keywords) in classes {
        if keywords.iter().any(|kw| name.contains(kw)) {
            return (doc_type, vec![format!("{}_filename", doc_type.as_str())]);
        }
    }
    (DocumentType::General, Vec::new())
}

/// One rendered page. Immutable once created.
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based page index.
    pub index: usize,
    pub image: Arc<DynamicImage>,
    pub width: u32,
    pub height: u32,
}

impl Page {
    pub fn new(index: usize, image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        Self {
            index,
            image: Arc::new(image),
            width,
            height,
        }
    }

    pub fn is_landscape(&self) -> bool {
        self.width > self.height
    }
}

/// A loaded document: its path, class, and rendered pages in order.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: PathBuf,
    pub doc_type: DocumentType,
    pub detected_features: Vec<String>,
    pub pages: Vec<Page>,
}

impl Document {
    /// Build a document from already-rendered images, classifying by file name.
    pub fn from_images(path: impl Into<PathBuf>, images: Vec<DynamicImage>) -> Self {
        let path = path.into();
        let (doc_type, detected_features) = classify_filename(&path);
        let pages = images
            .into_iter()
            .enumerate()
            .map(|(i, img)| Page::new(i + 1, img))
            .collect();
        Self {
            path,
            doc_type,
            detected_features,
            pages,
        }
    }

    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn page(&self, index: usize) -> Option<&Page> {
        self.pages.iter().find(|p| p.index == index)
    }
}

/// Supplies rendered pages and a document-type tag.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn load(&self) -> Result<Document, DocrError>;
}

#[async_trait]
impl PageSource for Document {
    async fn load(&self) -> Result<Document, DocrError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_first_matching_class() {
        let (t, f) = classify_filename(Path::new("/tmp/NBER_Working_Paper_123.pdf"));
        assert_eq!(t, DocumentType::Academic);
        assert_eq!(f, vec!["academic_filename".to_string()]);

        let (t, _) = classify_filename(Path::new("imf-annual-report.pdf"));
        assert_eq!(t, DocumentType::Policy);

        let (t, f) = classify_filename(Path::new("q3_quarterly.pdf"));
        assert_eq!(t, DocumentType::Financial);
        assert_eq!(f, vec!["financial_filename".to_string()]);

        let (t, f) = classify_filename(Path::new("scan.pdf"));
        assert_eq!(t, DocumentType::General);
        assert!(f.is_empty());
    }

    #[test]
    fn pages_are_one_based() {
        let doc = Document::from_images(
            "slides.pdf",
            vec![DynamicImage::new_rgb8(20, 10), DynamicImage::new_rgb8(10, 20)],
        );
        assert_eq!(doc.pages[0].index, 1);
        assert!(doc.pages[0].is_landscape());
        assert!(!doc.page(2).map(|p| p.is_landscape()).unwrap_or(true));
        assert!(doc.page(3).is_none());
    }
}
