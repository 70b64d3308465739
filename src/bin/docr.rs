//! CLI binary for docr.
//!
//! A thin shim over the library crate that maps CLI flags onto
//! `PipelineConfig`, shows progress, and saves the result.

use anyhow::{Context, Result};
use clap::Parser;
use docr::{
    export, BackendRegistry, BackendSpec, OutputFormat, PageStatus, Pipeline, PipelineConfig,
    PipelineObserver, ProcessingStats, Stage,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Progress observer using indicatif ────────────────────────────────────────

/// One progress bar, restyled at each stage start. Page and figure events
/// arrive in completion order, so lines are printed as they land.
struct CliObserver {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Loading");
        bar.set_message("Rendering pages…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl PipelineObserver for CliObserver {
    fn on_run_start(&self, document: &str, total_pages: usize) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{document}: {total_pages} pages"))
        ));
    }

    fn on_stage_start(&self, stage: Stage, items: usize) {
        let unit = if stage == Stage::Figures { "figures" } else { "pages" };
        let style = ProgressStyle::with_template(&format!(
            "{{spinner:.cyan}} {{prefix:.bold}}  [{{bar:42.green/238}}] {{pos:>3}}/{{len}} {unit}  ⏱ {{elapsed_precise}}"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_style(style);
        self.bar.set_length(items as u64);
        self.bar.set_position(0);
        self.bar.set_prefix(stage.as_str().to_string());
        self.bar.reset_eta();
    }

    fn on_page_complete(&self, stage: Stage, page_num: usize, status: PageStatus) {
        if status == PageStatus::Error {
            self.errors.fetch_add(1, Ordering::SeqCst);
            self.bar.println(format!(
                "  {} {:<8} page {:>3}",
                red("✗"),
                stage.as_str(),
                page_num
            ));
        } else if stage != Stage::Audit {
            self.bar.println(format!(
                "  {} {:<8} page {:>3}",
                green("✓"),
                stage.as_str(),
                page_num
            ));
        }
        self.bar.inc(1);
    }

    fn on_figure_complete(&self, figure_num: usize, page_num: usize) {
        self.bar.println(format!(
            "  {} figure {:>3}  {}",
            green("✓"),
            figure_num,
            dim(&format!("page {page_num}"))
        ));
        self.bar.inc(1);
    }

    fn on_warning(&self, message: &str) {
        self.bar.println(format!("  {} {}", yellow("⚠"), message));
    }

    fn on_run_complete(&self, stats: &ProcessingStats) {
        self.bar.finish_and_clear();
        let mark = if stats.pages_error == 0 {
            green("✔")
        } else if stats.pages_error == stats.total_pages {
            red("✘")
        } else {
            cyan("⚠")
        };
        eprintln!(
            "{} {}/{} pages ok  {} figures  ${:.4}  {:.1}s",
            mark,
            bold(&stats.pages_success.to_string()),
            stats.total_pages,
            stats.figures_detected,
            stats.total_cost,
            stats.total_time_secs,
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process with default backends, Markdown report under output/<stem>/
  docr paper.pdf

  # JSON output to a chosen file, figures saved next to it
  docr report.pdf -o out/report.json --format json --save-figures

  # Force backends and skip the narrative audit
  docr scan.pdf --primary deepseek --fallback gemini --no-audit

  # Full configuration from a file
  docr scan.pdf --config docr.json

DEFAULT BACKENDS (used when the config file lists none):
  deepseek   ollama  deepseek-ocr:latest   local   $0        probe localhost:11434
  gemini     gemini  gemini-2.5-flash      remote  $0.0002   needs GEMINI_API_KEY
  openai     openai  gpt-4.1-nano          remote  $0.0004   needs OPENAI_API_KEY

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY     OpenAI API key
  GEMINI_API_KEY     Google Gemini API key
  OLLAMA_HOST        Ollama endpoint for local backends and the narrative auditor
  PDFIUM_LIB_PATH    Path to libpdfium (file or directory)
  RUST_LOG           tracing filter, e.g. docr=debug
"#;

/// Route PDF pages across vision models, audit quality, escalate failures,
/// describe figures.
#[derive(Parser, Debug)]
#[command(
    name = "docr",
    version,
    about = "Multi-backend document OCR with quality audit and fallback",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF file to process.
    input: PathBuf,

    /// JSON configuration file.
    #[arg(long, env = "DOCR_CONFIG")]
    config: Option<PathBuf>,

    /// Output file, or directory when it has no extension.
    #[arg(short, long, env = "DOCR_OUTPUT")]
    output: Option<PathBuf>,

    /// Output format: markdown, json, txt.
    #[arg(long, env = "DOCR_FORMAT", default_value = "markdown")]
    format: String,

    /// Base directory for the default output location.
    #[arg(long, env = "DOCR_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Concurrent page calls (1 = sequential).
    #[arg(long)]
    pages_parallel: Option<usize>,

    /// Concurrent figure descriptions.
    #[arg(long)]
    figures_parallel: Option<usize>,

    /// Skip figure detection and description.
    #[arg(long)]
    no_figures: bool,

    /// Save figure crops as PNG next to the output.
    #[arg(long)]
    save_figures: bool,

    /// Skip the narrative (LLM) audit.
    #[arg(long)]
    no_audit: bool,

    /// Re-run flagged pages on another local backend before falling back.
    #[arg(long)]
    cross_check: bool,

    /// Force the primary backend.
    #[arg(long)]
    primary: Option<String>,

    /// Force the fallback backend.
    #[arg(long)]
    fallback: Option<String>,

    /// Force the figure-description backend.
    #[arg(long)]
    figures_backend: Option<String>,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "DOCR_PASSWORD")]
    password: Option<String>,

    /// Disable the progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the feedback; keep library INFO logs quiet
    // unless asked for.
    let show_progress = !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let format: OutputFormat = cli.format.parse()?;
    let config = build_config(&cli, format)?;

    let specs = if config.backends.is_empty() {
        default_backends(&config.audit.ollama_host)
    } else {
        config.backends.clone()
    };
    let registry = BackendRegistry::from_specs(&specs);

    let mut pipeline = Pipeline::new(config, registry);
    if show_progress {
        pipeline = pipeline.with_observer(CliObserver::new());
    }

    let abort = pipeline.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", yellow("Interrupted; finishing with partial results…"));
            abort.abort();
        }
    });

    let result = pipeline
        .process_pdf(&cli.input)
        .await
        .context("Processing failed")?;

    let saved = export::save_output(&result, format, cli.output.as_deref(), &cli.output_dir)
        .await
        .context("Failed to save output")?;
    eprintln!("   →  {}", bold(&saved.display().to_string()));

    let reprocess = result.pages_needing_reprocessing();
    if !reprocess.is_empty() {
        eprintln!(
            "   {} pages may need another pass: {:?}",
            yellow(&reprocess.len().to_string()),
            reprocess
        );
    }
    Ok(())
}

/// Load the config file (if any) and apply CLI overrides.
fn build_config(cli: &Cli, format: OutputFormat) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };

    if let Ok(host) = std::env::var("OLLAMA_HOST") {
        if !host.is_empty() {
            config.audit.ollama_host = host;
        }
    }
    if let Some(n) = cli.pages_parallel {
        config.page_concurrency = n.max(1);
    }
    if let Some(n) = cli.figures_parallel {
        config.figure_concurrency = n.max(1);
    }
    if cli.no_figures {
        config.figures.enabled = false;
    }
    if cli.no_audit {
        config.audit.narrative_enabled = false;
    }
    if cli.cross_check {
        config.audit.cross_check_enabled = true;
    }
    if cli.primary.is_some() {
        config.routing.primary_override = cli.primary.clone();
    }
    if cli.fallback.is_some() {
        config.routing.fallback_override = cli.fallback.clone();
    }
    if cli.figures_backend.is_some() {
        config.routing.figure_override = cli.figures_backend.clone();
    }
    if cli.password.is_some() {
        config.password = cli.password.clone();
    }
    if cli.save_figures {
        let main = export::resolve_output_path(&cli.input, format, cli.output.as_deref(), &cli.output_dir);
        let base = main.parent().unwrap_or(Path::new("."));
        config.figures.save_dir = Some(base.join("figures"));
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Backends used when the config file declares none.
fn default_backends(ollama_host: &str) -> Vec<BackendSpec> {
    vec![
        BackendSpec {
            name: "deepseek".into(),
            provider: "ollama".into(),
            model: "deepseek-ocr:latest".into(),
            local: true,
            best_for: vec!["general".into(), "tables".into()],
            probe_url: Some(format!("{}/api/tags", ollama_host.trim_end_matches('/'))),
            ..Default::default()
        },
        BackendSpec {
            name: "gemini".into(),
            provider: "gemini".into(),
            model: "gemini-2.5-flash".into(),
            cost_per_page: 0.0002,
            best_for: vec!["general".into(), "figures".into()],
            ..Default::default()
        },
        BackendSpec {
            name: "openai".into(),
            provider: "openai".into(),
            model: "gpt-4.1-nano".into(),
            cost_per_page: 0.0004,
            ..Default::default()
        },
    ]
}
