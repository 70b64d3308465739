//! Rendering and saving an [`AggregateResult`].
//!
//! Three formats: a Markdown report with inline figure descriptions, a JSON
//! document, and plain text. [`save_output`] writes the main file atomically
//! (temp file + rename) and a `metadata.json` next to it.

use crate::error::DocrError;
use crate::output::AggregateResult;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Markdown,
    Json,
    Text,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "md",
            OutputFormat::Json => "json",
            OutputFormat::Text => "txt",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Json => "json",
            OutputFormat::Text => "txt",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = DocrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            "json" => Ok(OutputFormat::Json),
            "txt" | "text" => Ok(OutputFormat::Text),
            other => Err(DocrError::InvalidConfig(format!(
                "unknown output format '{other}' (expected markdown, json or txt)"
            ))),
        }
    }
}

fn document_name(result: &AggregateResult) -> String {
    Path::new(&result.document_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Markdown report: summary, then every page with its figures.
pub fn to_markdown(result: &AggregateResult) -> String {
    let stats = &result.stats;
    let mut lines = vec![
        format!("# OCR Result: {}", document_name(result)),
        String::new(),
        "## Summary".to_string(),
        format!(
            "- Pages: {}/{} successful",
            stats.pages_success, stats.total_pages
        ),
        format!("- Figures: {}", stats.figures_detected),
        format!("- Cost: ${:.4}", stats.total_cost),
        String::new(),
        "## Content".to_string(),
        String::new(),
    ];

    for page in result.pages() {
        lines.push(format!("--- Page {} ---", page.page_num));
        if !page.text.is_empty() {
            lines.push(page.text.clone());
        }
        if !page.figures.is_empty() {
            lines.push(String::new());
            for fig in &page.figures {
                lines.push(format!("**[Figure {}]** ({})", fig.figure_num, fig.figure_type));
                lines.push(format!("> {}", fig.description));
                lines.push(String::new());
            }
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

pub fn to_json(result: &AggregateResult) -> serde_json::Value {
    let pages: Vec<_> = result.pages().collect();
    json!({
        "document": result.document_path,
        "pages": pages,
        "stats": result.stats,
        "metadata": result.metadata,
    })
}

pub fn render(result: &AggregateResult, format: OutputFormat) -> Result<String, DocrError> {
    match format {
        OutputFormat::Markdown => Ok(to_markdown(result)),
        OutputFormat::Json => serde_json::to_string_pretty(&to_json(result))
            .map_err(|e| DocrError::Internal(format!("JSON serialisation failed: {e}"))),
        OutputFormat::Text => Ok(result.full_text("\n\n")),
    }
}

/// Default location: `<output_dir>/<stem>/<stem>.<ext>`.
pub fn default_output_path(document: &Path, format: OutputFormat, output_dir: &Path) -> PathBuf {
    let stem = document
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output_dir
        .join(&stem)
        .join(format!("{}.{}", stem, format.extension()))
}

/// Resolve where the main file goes. An `out` with an extension is a file
/// path; without one it is a directory.
pub fn resolve_output_path(
    document: &Path,
    format: OutputFormat,
    out: Option<&Path>,
    output_dir: &Path,
) -> PathBuf {
    match out {
        Some(p) if p.extension().is_some() => {
            let ext = p
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            if ext != format.extension() {
                warn!(
                    "Output extension '.{}' doesn't match format '{}' (expected '.{}')",
                    ext,
                    format.as_str(),
                    format.extension()
                );
            }
            p.to_path_buf()
        }
        Some(dir) => {
            let stem = document
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "output".to_string());
            dir.join(format!("{}.{}", stem, format.extension()))
        }
        None => default_output_path(document, format, output_dir),
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<(), DocrError> {
    let write_err = |e: std::io::Error| DocrError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, content).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)
}

fn run_metadata(result: &AggregateResult, main_file: &Path, format: OutputFormat) -> serde_json::Value {
    let created_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let stats = &result.stats;
    json!({
        "document": result.document_path,
        "output_file": main_file.to_string_lossy(),
        "format": format.as_str(),
        "created_at_unix": created_at,
        "stats": {
            "total_pages": stats.total_pages,
            "pages_success": stats.pages_success,
            "pages_warning": stats.pages_warning,
            "pages_error": stats.pages_error,
            "total_cost": stats.total_cost,
            "total_time_secs": stats.total_time_secs,
        },
        "backends_used": stats.backends_used,
        "figures": stats.figures_detected,
        "pages_needing_reprocessing": result.pages_needing_reprocessing(),
        "document_metadata": result.metadata,
    })
}

/// Write `result` in `format` and a sibling `metadata.json`.
///
/// Returns the path of the main file.
pub async fn save_output(
    result: &AggregateResult,
    format: OutputFormat,
    out: Option<&Path>,
    output_dir: &Path,
) -> Result<PathBuf, DocrError> {
    let main_file = resolve_output_path(Path::new(&result.document_path), format, out, output_dir);
    write_atomic(&main_file, &render(result, format)?).await?;

    let meta_path = main_file
        .parent()
        .map(|p| p.join("metadata.json"))
        .unwrap_or_else(|| PathBuf::from("metadata.json"));
    let meta = serde_json::to_string_pretty(&run_metadata(result, &main_file, format))
        .map_err(|e| DocrError::Internal(format!("JSON serialisation failed: {e}")))?;
    write_atomic(&meta_path, &meta).await?;

    info!("Saved {} and {}", main_file.display(), meta_path.display());
    Ok(main_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{FigureRecord, PageRecord};

    fn sample() -> AggregateResult {
        let mut result = AggregateResult::new("/data/annual_report.pdf");
        let mut p1 = PageRecord::success(1, "gemini", "First page.").with_cost(0.0002);
        p1.figures.push(FigureRecord {
            figure_num: 1,
            page_num: 1,
            figure_type: "chart".into(),
            description: "Revenue by quarter".into(),
            bbox: None,
            backend: "gemini".into(),
            image_path: None,
        });
        result.add_page_result(PageRecord::error(2, "gemini", "timeout"));
        result.add_page_result(p1);
        result.recalculate_stats();
        result
    }

    #[test]
    fn markdown_lists_pages_in_order_with_figures() {
        let md = to_markdown(&sample());
        assert!(md.starts_with("# OCR Result: annual_report.pdf"));
        assert!(md.contains("- Pages: 1/2 successful"));
        assert!(md.contains("**[Figure 1]** (chart)\n> Revenue by quarter"));
        let p1 = md.find("--- Page 1 ---").unwrap();
        let p2 = md.find("--- Page 2 ---").unwrap();
        assert!(p1 < p2);
    }

    #[test]
    fn json_pages_are_an_ordered_array() {
        let v = to_json(&sample());
        let pages = v["pages"].as_array().unwrap();
        assert_eq!(pages[0]["page_num"], 1);
        assert_eq!(pages[1]["status"], "error");
        assert_eq!(v["stats"]["figures_detected"], 1);
    }

    #[test]
    fn format_parsing() {
        assert_eq!("md".parse::<OutputFormat>().unwrap(), OutputFormat::Markdown);
        assert_eq!("TXT".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert!("pdf".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn output_path_resolution() {
        let doc = Path::new("/in/paper.pdf");
        let out_dir = Path::new("output");
        assert_eq!(
            resolve_output_path(doc, OutputFormat::Json, None, out_dir),
            PathBuf::from("output/paper/paper.json")
        );
        assert_eq!(
            resolve_output_path(doc, OutputFormat::Markdown, Some(Path::new("res")), out_dir),
            PathBuf::from("res/paper.md")
        );
        assert_eq!(
            resolve_output_path(doc, OutputFormat::Markdown, Some(Path::new("x/r.txt")), out_dir),
            PathBuf::from("x/r.txt")
        );
    }

    #[tokio::test]
    async fn save_writes_main_file_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let result = sample();
        let main = save_output(&result, OutputFormat::Text, None, dir.path())
            .await
            .unwrap();
        assert_eq!(main, dir.path().join("annual_report/annual_report.txt"));
        let text = std::fs::read_to_string(&main).unwrap();
        assert_eq!(text, "--- Page 1 ---\nFirst page.");

        let meta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("annual_report/metadata.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["format"], "txt");
        assert_eq!(meta["pages_needing_reprocessing"], json!([2]));
        assert!(!dir.path().join("annual_report/annual_report.txt.tmp").exists());
    }
}
