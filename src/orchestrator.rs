//! The four-stage pipeline: primary → audit → fallback → figures.
//!
//! Stages run strictly in sequence. Inside a stage, independent backend calls
//! fan out through `buffer_unordered` with the configured bound, and results
//! are collected into a `BTreeMap` keyed by page or figure number so that the
//! aggregate is always assembled in key order, whatever the completion order.
//!
//! Only a complete absence of usable backends in stage 1 is returned as an
//! error. Every other failure is recorded in-band on the affected record and
//! reported through [`PipelineObserver::on_warning`].

use crate::backend::{AvailabilitySnapshot, Backend, BackendRegistry};
use crate::config::PipelineConfig;
use crate::document::{Document, Page, PageSource};
use crate::error::{BackendError, DocrError};
use crate::observer::{NoopObserver, PipelineObserver, SharedObserver, Stage};
use crate::output::{AggregateResult, FigureRecord, PageRecord};
use crate::pipeline::audit::{NarrativeAuditor, TextAuditor, Verdict};
use crate::pipeline::figures::{FigureCandidate, FigureDetector, PageContext, PageGeometry};
use crate::pipeline::heuristics::QualityChecker;
use crate::pipeline::render::PdfiumPageSource;
use crate::pipeline::router::Router;
use futures::future;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Requests a whole-run abort.
///
/// Aborting stops new backend calls from being scheduled, stops waiting for
/// calls already in flight, and skips the remaining stages. Records that
/// completed before the abort stay in the result. An aborted pipeline stays
/// aborted.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Pipeline orchestrator.
///
/// ```rust,no_run
/// use docr::{BackendRegistry, Pipeline, PipelineConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = PipelineConfig::builder().page_concurrency(4).build()?;
/// let registry = BackendRegistry::from_specs(&config.backends);
/// let result = Pipeline::new(config, registry).process_pdf("paper.pdf").await?;
/// println!("{}", result.full_text("\n\n"));
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    registry: BackendRegistry,
    observer: SharedObserver,
    auditor: Option<Arc<dyn TextAuditor>>,
    geometry: Option<Arc<dyn PageGeometry>>,
    abort: AbortHandle,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("auditor", &self.auditor.is_some())
            .field("geometry", &self.geometry.is_some())
            .field("aborted", &self.abort.is_aborted())
            .finish()
    }
}

impl Pipeline {
    /// Build a pipeline. When narrative audit is enabled in `config`, an
    /// Ollama-backed auditor is installed; replace it with
    /// [`with_auditor`](Self::with_auditor).
    pub fn new(config: PipelineConfig, registry: BackendRegistry) -> Self {
        let auditor: Option<Arc<dyn TextAuditor>> = if config.audit.narrative_enabled {
            Some(Arc::new(NarrativeAuditor::new(&config.audit)))
        } else {
            None
        };
        Self {
            config,
            registry,
            observer: Arc::new(NoopObserver),
            auditor,
            geometry: None,
            abort: AbortHandle::new(),
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_auditor(mut self, auditor: Arc<dyn TextAuditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    pub fn without_auditor(mut self) -> Self {
        self.auditor = None;
        self
    }

    /// Page geometry for the figure stage of [`process`](Self::process).
    pub fn with_geometry(mut self, geometry: Arc<dyn PageGeometry>) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Render `path` with pdfium and run the pipeline over it.
    ///
    /// Page geometry for the figure stage is read from the same file unless
    /// one was supplied with [`with_geometry`](Self::with_geometry).
    pub async fn process_pdf(&self, path: impl AsRef<Path>) -> Result<AggregateResult, DocrError> {
        let source = PdfiumPageSource::new(
            path.as_ref(),
            self.config.render_dpi,
            self.config.max_rendered_pixels,
        )
        .with_password(self.config.password.clone());

        let geometry = match (&self.geometry, self.config.figures.enabled) {
            (Some(g), _) => Some(Arc::clone(g)),
            (None, true) => match source.geometry().await {
                Ok(g) => Some(Arc::new(g) as Arc<dyn PageGeometry>),
                Err(e) => {
                    self.warn(format!("Cannot read page geometry, figures disabled: {e}"));
                    None
                }
            },
            (None, false) => None,
        };
        self.run(&source, geometry).await
    }

    /// Run all stages over the pages supplied by `source`.
    pub async fn process(&self, source: &dyn PageSource) -> Result<AggregateResult, DocrError> {
        self.run(source, self.geometry.clone()).await
    }

    fn warn(&self, message: String) {
        warn!("{}", message);
        self.observer.on_warning(&message);
    }

    /// Tell the user how to bring each enabled backend up.
    fn report_unavailable(&self, snapshot: &AvailabilitySnapshot) {
        for name in self.registry.enabled_names(&self.config.routing) {
            if snapshot.is_available(&name) {
                continue;
            }
            if let Some(backend) = self.registry.get(&name) {
                self.warn(format!("Backend unavailable: {}", backend.availability_hint()));
            }
        }
    }

    fn backend(&self, name: &str) -> Result<Arc<dyn Backend>, DocrError> {
        self.registry
            .get(name)
            .ok_or_else(|| DocrError::Internal(format!("router selected unknown backend '{name}'")))
    }

    async fn run(
        &self,
        source: &dyn PageSource,
        geometry: Option<Arc<dyn PageGeometry>>,
    ) -> Result<AggregateResult, DocrError> {
        let started = Instant::now();
        let document = source.load().await?;
        info!(
            "Processing {} ({} pages, type {})",
            document.filename(),
            document.pages.len(),
            document.doc_type
        );

        let mut result = AggregateResult::new(document.path.to_string_lossy());
        result.set_metadata("doc_type", document.doc_type.as_str());
        result.set_metadata("detected_features", document.detected_features.clone());
        self.observer
            .on_run_start(&document.filename(), document.pages.len());

        let snapshot = self.registry.snapshot(&self.config.routing).await;
        info!("Available backends: {:?}", snapshot.available_names());
        let caps = self.registry.capabilities();
        let router = Router::new(&self.config.routing, &caps, &snapshot)
            .with_observer(self.observer.as_ref());

        // Stage 1
        let primary = match router.select_primary(document.doc_type) {
            Ok(name) => name,
            Err(e) => {
                self.report_unavailable(&snapshot);
                return Err(e);
            }
        };
        result.set_metadata("primary_backend", primary.as_str());
        info!("Stage 1: {} pages on {}", document.pages.len(), primary);
        let backend = self.backend(&primary)?;
        let pages: Vec<&Page> = document.pages.iter().collect();
        for record in self.dispatch_pages(Stage::Primary, &backend, pages).await.into_values() {
            result.add_page_result(record);
        }

        // Stage 2
        let mut flagged = BTreeSet::new();
        if !self.abort.is_aborted() {
            flagged = self.audit_stage(&router, &primary, &document, &mut result).await;
            result.set_metadata("flagged_pages", flagged.iter().copied().collect::<Vec<_>>());
        }

        // Stage 3
        if !self.abort.is_aborted() && !flagged.is_empty() {
            self.fallback_stage(&router, &primary, &document, &flagged, &mut result)
                .await?;
        }

        // Stage 4
        if !self.abort.is_aborted() && self.config.figures.enabled {
            match geometry {
                Some(g) => self.figure_stage(&router, g, &mut result).await?,
                None => self.warn("No page geometry available; figure stage skipped".into()),
            }
        }

        let aborted = self.abort.is_aborted();
        if aborted {
            warn!("Run aborted; returning partial results");
        }
        result.set_metadata("aborted", aborted);
        result.recalculate_stats();
        result.stats.total_time_secs = started.elapsed().as_secs_f64();
        info!(
            "Done: {}/{} pages ok, {} figures, ${:.4}, {:.1}s",
            result.stats.pages_success,
            result.stats.total_pages,
            result.stats.figures_detected,
            result.stats.total_cost,
            result.stats.total_time_secs
        );
        self.observer.on_run_complete(&result.stats);
        Ok(result)
    }

    /// Execute keyed tasks with at most `limit` in flight.
    ///
    /// Stops scheduling and stops waiting as soon as an abort is requested.
    async fn run_bounded<Fut, R>(&self, tasks: Vec<(usize, Fut)>, limit: usize) -> BTreeMap<usize, R>
    where
        Fut: Future<Output = R>,
    {
        let gate = self.abort.clone();
        let mut abort_rx = self.abort.subscribe();
        let completions = stream::iter(tasks)
            .take_while(move |_| future::ready(!gate.is_aborted()))
            .map(|(key, task)| async move { (key, task.await) })
            .buffer_unordered(limit.max(1));
        tokio::pin!(completions);

        let mut done = BTreeMap::new();
        loop {
            tokio::select! {
                biased;
                _ = abort_rx.wait_for(|aborted| *aborted) => {
                    debug!("Abort requested with {} results collected", done.len());
                    break;
                }
                next = completions.next() => match next {
                    Some((key, value)) => {
                        done.insert(key, value);
                    }
                    None => break,
                },
            }
        }
        done
    }

    /// Send `pages` to `backend` under the page-call timeout.
    async fn dispatch_pages(
        &self,
        stage: Stage,
        backend: &Arc<dyn Backend>,
        pages: Vec<&Page>,
    ) -> BTreeMap<usize, PageRecord> {
        self.observer.on_stage_start(stage, pages.len());
        let secs = self.config.backend_timeout_secs;
        let tasks: Vec<_> = pages
            .into_iter()
            .map(|page| {
                let backend = Arc::clone(backend);
                let observer = Arc::clone(&self.observer);
                let task = async move {
                    let started = Instant::now();
                    let mut record =
                        match tokio::time::timeout(Duration::from_secs(secs), backend.process_page(page))
                            .await
                        {
                            Ok(record) => record,
                            Err(_) => {
                                let err = BackendError::Timeout {
                                    backend: backend.name().to_string(),
                                    secs,
                                };
                                PageRecord::error(page.index, backend.name(), err.to_string())
                                    .with_elapsed_ms(started.elapsed().as_millis() as u64)
                            }
                        };
                    record.page_num = page.index;
                    match &record.error_message {
                        Some(e) if record.is_error() => {
                            warn!("{} page {}: {}", stage, page.index, e)
                        }
                        _ => debug!("{} page {}: {} chars", stage, page.index, record.char_count()),
                    }
                    observer.on_page_complete(stage, page.index, record.status);
                    record
                };
                (page.index, task)
            })
            .collect();
        self.run_bounded(tasks, self.config.page_concurrency).await
    }

    /// Heuristics, optional cross-check, optional narrative audit.
    /// Returns the pages still flagged for reprocessing.
    async fn audit_stage(
        &self,
        router: &Router<'_>,
        primary: &str,
        document: &Document,
        result: &mut AggregateResult,
    ) -> BTreeSet<usize> {
        let audit = &self.config.audit;
        let checker = QualityChecker::new(audit.heuristics.clone());
        let mut flagged = BTreeSet::new();

        let page_nums: Vec<usize> = result.pages().map(|p| p.page_num).collect();
        self.observer.on_stage_start(Stage::Audit, page_nums.len());
        for page_num in page_nums {
            let Some(record) = result.get_page_mut(page_num) else {
                continue;
            };
            if record.is_error() {
                flagged.insert(page_num);
            } else {
                let report = checker.check(&record.text);
                if !report.passed {
                    record.audit_passed = false;
                    record.audit_notes.extend(report.errors);
                    flagged.insert(page_num);
                }
            }
            self.observer
                .on_page_complete(Stage::Audit, page_num, record.status);
        }
        info!("Stage 2: {} of {} pages flagged by heuristics", flagged.len(), result.page_count());

        if audit.cross_check_enabled && !flagged.is_empty() {
            if let Some(name) = router.select_cross_check(primary) {
                if let Ok(backend) = self.backend(&name) {
                    let pages: Vec<&Page> = flagged
                        .iter()
                        .take(audit.cross_check_pages)
                        .filter_map(|&n| document.page(n))
                        .collect();
                    info!("Cross-checking {} pages on {}", pages.len(), name);
                    let rerun = self.dispatch_pages(Stage::Audit, &backend, pages).await;
                    for (page_num, mut record) in rerun {
                        if record.is_error() || !checker.check(&record.text).passed {
                            continue;
                        }
                        record
                            .audit_notes
                            .push(format!("Replaced via cross-check ({name})"));
                        result.add_page_result(record);
                        flagged.remove(&page_num);
                    }
                }
            } else {
                debug!("Cross-check enabled but no local backend besides {primary}");
            }
        }

        if flagged.is_empty() || self.abort.is_aborted() {
            return flagged;
        }
        let Some(auditor) = &self.auditor else {
            return flagged;
        };
        if !auditor.is_available().await {
            self.warn("Narrative audit skipped (auditor or model not available)".into());
            return flagged;
        }

        let candidates: Vec<usize> = flagged
            .iter()
            .copied()
            .take(audit.max_narrative_pages)
            .collect();
        for page_num in candidates {
            if self.abort.is_aborted() {
                break;
            }
            let Some(record) = result.get_page_mut(page_num) else {
                continue;
            };
            if record.text.is_empty() {
                continue;
            }
            let verdict = auditor.audit(&record.text).await;
            debug!("Page {}: narrative verdict {}", page_num, verdict.verdict.as_str());
            let note = if verdict.reasoning.is_empty() {
                format!("Narrative audit: {}", verdict.verdict.as_str())
            } else {
                format!(
                    "Narrative audit: {} ({})",
                    verdict.verdict.as_str(),
                    verdict.reasoning
                )
            };
            record.audit_notes.push(note);
            if verdict.verdict == Verdict::Acceptable {
                record.audit_passed = true;
                flagged.remove(&page_num);
            }
        }
        flagged
    }

    async fn fallback_stage(
        &self,
        router: &Router<'_>,
        primary: &str,
        document: &Document,
        flagged: &BTreeSet<usize>,
        result: &mut AggregateResult,
    ) -> Result<(), DocrError> {
        let Some(name) = router.select_fallback(primary) else {
            self.warn(format!(
                "No fallback backend available; leaving {} flagged pages as-is",
                flagged.len()
            ));
            return Ok(());
        };
        result.set_metadata("fallback_backend", name.as_str());
        info!("Stage 3: {} pages on {}", flagged.len(), name);

        let backend = self.backend(&name)?;
        let pages: Vec<&Page> = flagged.iter().filter_map(|&n| document.page(n)).collect();
        for record in self.dispatch_pages(Stage::Fallback, &backend, pages).await.into_values() {
            result.add_page_result(record);
        }
        Ok(())
    }

    async fn figure_stage(
        &self,
        router: &Router<'_>,
        geometry: Arc<dyn PageGeometry>,
        result: &mut AggregateResult,
    ) -> Result<(), DocrError> {
        let Some(name) = router.select_figure() else {
            self.warn("No figure-capable backend available; figure stage skipped".into());
            return Ok(());
        };
        result.set_metadata("figure_backend", name.as_str());
        let backend = self.backend(&name)?;

        let contexts: Vec<PageContext> = result
            .pages()
            .map(|p| PageContext {
                page_num: p.page_num,
                text: p.text.clone(),
            })
            .collect();
        let detector = FigureDetector::new(self.config.figures.clone());
        let candidates = match tokio::task::spawn_blocking(move || {
            detector.extract(geometry.as_ref(), &contexts)
        })
        .await
        {
            Ok(c) => c,
            Err(e) => {
                self.warn(format!("Figure extraction failed: {e}"));
                return Ok(());
            }
        };
        info!("Stage 4: {} figures detected, describing on {}", candidates.len(), name);

        for (figure_num, record) in self.describe_figures(&backend, candidates).await {
            match result.get_page_mut(record.page_num) {
                Some(page) => page.figures.push(record),
                None => debug!("Figure {} has no page record", figure_num),
            }
        }
        Ok(())
    }

    async fn describe_figures(
        &self,
        backend: &Arc<dyn Backend>,
        candidates: Vec<FigureCandidate>,
    ) -> BTreeMap<usize, FigureRecord> {
        self.observer.on_stage_start(Stage::Figures, candidates.len());
        let secs = self.config.figure_timeout_secs;
        let tasks: Vec<_> = candidates
            .into_iter()
            .map(|candidate| {
                let backend = Arc::clone(backend);
                let observer = Arc::clone(&self.observer);
                let key = candidate.figure_num;
                let task = async move {
                    let described = tokio::time::timeout(
                        Duration::from_secs(secs),
                        backend.describe_figure(&candidate.image, &candidate.context),
                    )
                    .await;
                    let mut record = described.unwrap_or_else(|_| {
                        warn!("Figure {}: description timed out", candidate.figure_num);
                        let err = BackendError::Timeout {
                            backend: backend.name().to_string(),
                            secs,
                        };
                        FigureRecord {
                            figure_num: 0,
                            page_num: 0,
                            figure_type: "unknown".into(),
                            description: format!("Figure description failed: {err}"),
                            bbox: None,
                            backend: String::new(),
                            image_path: None,
                        }
                    });
                    record.figure_num = candidate.figure_num;
                    record.page_num = candidate.page_num;
                    record.bbox = candidate.bbox;
                    record.image_path = candidate.image_path;
                    if record.backend.is_empty() {
                        record.backend = backend.name().to_string();
                    }
                    observer.on_figure_complete(record.figure_num, record.page_num);
                    record
                };
                (key, task)
            })
            .collect();
        self.run_bounded(tasks, self.config.figure_concurrency).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_bounded_resequences_by_key() {
        let config = PipelineConfig::builder()
            .narrative_audit(false)
            .build()
            .unwrap();
        let pipeline = Pipeline::new(config, BackendRegistry::new());
        let tasks: Vec<_> = [5usize, 1, 3]
            .into_iter()
            .map(|k| {
                (k, async move {
                    tokio::time::sleep(Duration::from_millis(k as u64)).await;
                    k * 10
                })
            })
            .collect();
        let out = pipeline.run_bounded(tasks, 3).await;
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec![(1, 10), (3, 30), (5, 50)]);
    }

    #[tokio::test]
    async fn aborted_pipeline_schedules_nothing() {
        let config = PipelineConfig::builder()
            .narrative_audit(false)
            .build()
            .unwrap();
        let pipeline = Pipeline::new(config, BackendRegistry::new());
        pipeline.abort_handle().abort();
        let tasks: Vec<_> = (1..=3usize).map(|k| (k, async move { k })).collect();
        assert!(pipeline.run_bounded(tasks, 2).await.is_empty());
    }

    #[test]
    fn abort_handle_is_shared() {
        let handle = AbortHandle::new();
        let other = handle.clone();
        assert!(!other.is_aborted());
        handle.abort();
        assert!(other.is_aborted());
    }
}
