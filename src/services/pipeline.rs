//! Extraction pipeline: catalog walk, embedding, generation publish.
//!
//! Run state lives in a per-project registry. A project has at most one
//! pending or running extraction; its finished runs stay queryable up to the
//! configured history limit.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use super::embedding::Embedder;
use super::index::{EmbeddedRecord, GenerationHashes, VectorIndex};
use crate::error::PipelineError;
use crate::models::{
    BatchErrorPolicy, ColumnRecord, Config, ExtractRequest, ExtractionRun, IndexStats, TableRef,
};
use crate::sources::MetadataSource;

/// Tunables taken from `[extraction]` and `[catalog]`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub on_batch_error: BatchErrorPolicy,
    pub history_limit: usize,
    pub default_project: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.extraction.batch_size.max(1),
            concurrency: config.extraction.concurrency.max(1),
            on_batch_error: config.extraction.on_batch_error,
            history_limit: config.extraction.history_limit.max(1),
            default_project: config.catalog.project_id.clone(),
        }
    }
}

#[derive(Default)]
struct ProjectRuns {
    active: Option<String>,
    cancel: Option<watch::Sender<bool>>,
    /// Newest first.
    history: VecDeque<ExtractionRun>,
}

impl ProjectRuns {
    fn find_mut(&mut self, run_id: &str) -> Option<&mut ExtractionRun> {
        self.history.iter_mut().find(|r| r.run_id == run_id)
    }
}

/// Per-project run state.
#[derive(Clone)]
pub struct RunRegistry {
    projects: Arc<Mutex<HashMap<String, ProjectRuns>>>,
    history_limit: usize,
}

impl RunRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            projects: Arc::default(),
            history_limit: history_limit.max(1),
        }
    }

    /// Claim the project's extraction slot.
    async fn start(
        &self,
        project_id: &str,
        force_refresh: bool,
    ) -> Result<(ExtractionRun, watch::Receiver<bool>), PipelineError> {
        let mut projects = self.projects.lock().await;
        let runs = projects.entry(project_id.to_string()).or_default();

        if let Some(ref run_id) = runs.active {
            return Err(PipelineError::Conflict {
                project_id: project_id.to_string(),
                run_id: run_id.clone(),
            });
        }

        let run = ExtractionRun::new(project_id, force_refresh);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        runs.active = Some(run.run_id.clone());
        runs.cancel = Some(cancel_tx);
        runs.history.push_front(run.clone());
        runs.history.truncate(self.history_limit);

        Ok((run, cancel_rx))
    }

    async fn update<F>(&self, project_id: &str, run_id: &str, f: F) -> Option<ExtractionRun>
    where
        F: FnOnce(&mut ExtractionRun),
    {
        let mut projects = self.projects.lock().await;
        let run = projects.get_mut(project_id)?.find_mut(run_id)?;
        f(run);
        Some(run.clone())
    }

    /// Apply the terminal transition and release the slot.
    async fn finish<F>(&self, project_id: &str, run_id: &str, f: F) -> Option<ExtractionRun>
    where
        F: FnOnce(&mut ExtractionRun),
    {
        let mut projects = self.projects.lock().await;
        let runs = projects.get_mut(project_id)?;
        if runs.active.as_deref() == Some(run_id) {
            runs.active = None;
            runs.cancel = None;
        }
        let run = runs.find_mut(run_id)?;
        f(run);
        Some(run.clone())
    }

    pub async fn get(&self, run_id: &str) -> Option<ExtractionRun> {
        let projects = self.projects.lock().await;
        projects
            .values()
            .flat_map(|runs| runs.history.iter())
            .find(|r| r.run_id == run_id)
            .cloned()
    }

    /// Most recently started run, optionally within one project.
    pub async fn latest(&self, project_id: Option<&str>) -> Option<ExtractionRun> {
        let projects = self.projects.lock().await;
        match project_id {
            Some(project_id) => projects.get(project_id)?.history.front().cloned(),
            None => projects
                .values()
                .filter_map(|runs| runs.history.front())
                .max_by_key(|r| r.started_at)
                .cloned(),
        }
    }

    pub async fn active(&self, project_id: &str) -> Option<ExtractionRun> {
        let projects = self.projects.lock().await;
        let runs = projects.get(project_id)?;
        let run_id = runs.active.as_deref()?;
        runs.history.iter().find(|r| r.run_id == run_id).cloned()
    }

    /// Signal the project's active run to stop.
    pub async fn cancel(&self, project_id: &str) -> Result<ExtractionRun, PipelineError> {
        let projects = self.projects.lock().await;
        let not_running = || PipelineError::NotRunning(project_id.to_string());

        let runs = projects.get(project_id).ok_or_else(not_running)?;
        let run_id = runs.active.as_deref().ok_or_else(not_running)?;
        if let Some(ref cancel) = runs.cancel {
            cancel.send_replace(true);
        }
        runs.history
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
            .ok_or_else(not_running)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    datasets: u64,
    tables: u64,
    records: u64,
    reused: u64,
    skipped: u64,
    stale: u64,
}

impl Progress {
    fn apply(&self, run: &mut ExtractionRun) {
        run.datasets_processed = self.datasets;
        run.tables_processed = self.tables;
        run.records_processed = self.records;
        run.records_reused = self.reused;
        run.records_skipped = self.skipped;
        run.records_stale = self.stale;
    }
}

/// Everything one run needs while it walks the catalog.
struct RunContext {
    project_id: String,
    run_id: String,
    /// Active generation's vectors; loaded for reuse, and as a fallback
    /// for batches skipped after an embedding failure.
    previous: GenerationHashes,
    reuse_unchanged: bool,
    cancel: watch::Receiver<bool>,
    progress: Progress,
}

impl RunContext {
    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if *self.cancel.borrow() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

async fn wait_cancelled(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        // sender dropped without cancelling: never fires
        std::future::pending::<()>().await;
    }
}

/// Race an operation against the run's cancel signal.
async fn until_cancelled<T, E, F>(
    cancel: &watch::Receiver<bool>,
    operation: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<PipelineError>,
{
    tokio::select! {
        biased;
        _ = wait_cancelled(cancel.clone()) => Err(PipelineError::Cancelled),
        result = operation => result.map_err(Into::into),
    }
}

#[derive(Clone)]
pub struct ExtractionPipeline {
    source: Arc<dyn MetadataSource>,
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
    settings: PipelineSettings,
    registry: RunRegistry,
}

impl ExtractionPipeline {
    pub fn new(
        source: Arc<dyn MetadataSource>,
        embedder: Embedder,
        index: Arc<dyn VectorIndex>,
        settings: PipelineSettings,
    ) -> Self {
        let registry = RunRegistry::new(settings.history_limit);
        Self {
            source,
            embedder,
            index,
            settings,
            registry,
        }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn source(&self) -> &Arc<dyn MetadataSource> {
        &self.source
    }

    fn resolve_project(&self, request: &ExtractRequest) -> Result<String, PipelineError> {
        request
            .project_id
            .as_deref()
            .or(self.settings.default_project.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::Validation(
                    "project_id is required (no catalog.project_id configured)".to_string(),
                )
            })
    }

    /// Start a run in the background and return it in `pending` state.
    pub async fn trigger(&self, request: ExtractRequest) -> Result<ExtractionRun, PipelineError> {
        let project_id = self.resolve_project(&request)?;
        let (run, cancel) = self
            .registry
            .start(&project_id, request.force_refresh)
            .await?;

        let pipeline = self.clone();
        let run_id = run.run_id.clone();
        tokio::spawn(async move {
            pipeline.execute(project_id, run_id, cancel).await;
        });

        Ok(run)
    }

    /// Run an extraction to completion and return its final state.
    pub async fn extract(&self, request: ExtractRequest) -> Result<ExtractionRun, PipelineError> {
        let project_id = self.resolve_project(&request)?;
        let (run, cancel) = self
            .registry
            .start(&project_id, request.force_refresh)
            .await?;
        Ok(self.execute(project_id, run.run_id, cancel).await)
    }

    pub async fn cancel(&self, project_id: &str) -> Result<ExtractionRun, PipelineError> {
        let run = self.registry.cancel(project_id).await?;
        info!(project = project_id, run_id = %run.run_id, "cancellation requested");
        Ok(run)
    }

    /// A specific run, or the latest one (optionally for a project).
    pub async fn status(
        &self,
        run_id: Option<&str>,
        project_id: Option<&str>,
    ) -> Result<ExtractionRun, PipelineError> {
        match run_id {
            Some(run_id) => self
                .registry
                .get(run_id)
                .await
                .ok_or_else(|| PipelineError::RunNotFound(run_id.to_string())),
            None => self.registry.latest(project_id).await.ok_or_else(|| {
                PipelineError::RunNotFound(match project_id {
                    Some(project_id) => format!("no runs for project {project_id}"),
                    None => "no runs yet".to_string(),
                })
            }),
        }
    }

    pub async fn stats(&self) -> Result<IndexStats, PipelineError> {
        Ok(self.index.stats().await?)
    }

    async fn execute(
        &self,
        project_id: String,
        run_id: String,
        cancel: watch::Receiver<bool>,
    ) -> ExtractionRun {
        let force_refresh = self
            .registry
            .update(&project_id, &run_id, |run| run.mark_running())
            .await
            .map(|run| run.force_refresh)
            .unwrap_or(true);

        info!(
            project = %project_id,
            run_id = %run_id,
            force_refresh,
            source = self.source.name(),
            "extraction started"
        );

        let mut ctx = RunContext {
            project_id: project_id.clone(),
            run_id: run_id.clone(),
            previous: GenerationHashes::new(),
            reuse_unchanged: !force_refresh,
            cancel,
            progress: Progress::default(),
        };

        let outcome = self.build_generation(&mut ctx, force_refresh).await;
        let progress = ctx.progress;

        let finished = match outcome {
            Ok(()) => {
                info!(
                    project = %project_id,
                    run_id = %run_id,
                    records = progress.records,
                    reused = progress.reused,
                    skipped = progress.skipped,
                    "extraction succeeded"
                );
                self.registry
                    .finish(&project_id, &run_id, |run| {
                        progress.apply(run);
                        run.mark_succeeded();
                    })
                    .await
            }
            Err(e) => {
                if let Err(abort_err) = self.index.abort_generation(&run_id).await {
                    warn!(run_id = %run_id, "failed to abort generation: {}", abort_err);
                }
                let reason = match e {
                    PipelineError::Cancelled => "cancelled".to_string(),
                    ref other => other.to_string(),
                };
                error!(
                    project = %project_id,
                    run_id = %run_id,
                    records = progress.records,
                    "extraction failed: {}",
                    reason
                );
                self.registry
                    .finish(&project_id, &run_id, |run| {
                        progress.apply(run);
                        run.mark_failed(reason);
                    })
                    .await
            }
        };

        finished.unwrap_or_else(|| {
            let mut run = ExtractionRun::new(project_id, force_refresh);
            run.mark_failed("run state lost");
            run
        })
    }

    async fn build_generation(
        &self,
        ctx: &mut RunContext,
        force_refresh: bool,
    ) -> Result<(), PipelineError> {
        self.index
            .begin_generation(&ctx.project_id, &ctx.run_id)
            .await?;

        if !force_refresh || self.settings.on_batch_error == BatchErrorPolicy::Skip {
            if let Some(active) = self.index.active_generation(&ctx.project_id).await? {
                ctx.previous = self.index.generation_hashes(&active.generation_id).await?;
                debug!(
                    generation = %active.generation_id,
                    reusable = ctx.previous.len(),
                    force_refresh,
                    "loaded previous generation"
                );
            }
        }

        let source = Arc::clone(&self.source);
        let project_id = ctx.project_id.clone();
        let mut pending: Vec<ColumnRecord> = Vec::new();
        let mut datasets = source.list_datasets(&project_id);

        while let Some(dataset) = until_cancelled(&ctx.cancel, async {
            Ok::<_, PipelineError>(datasets.next().await)
        })
        .await?
        {
            let dataset = dataset?;
            debug!(dataset = %dataset.dataset_name, "walking dataset");

            let tables: Vec<TableRef> =
                until_cancelled(&ctx.cancel, source.list_tables(&dataset).try_collect()).await?;

            let fetches: Vec<_> = tables
                .iter()
                .map(|table| source.get_columns(table))
                .collect();
            let mut columns = stream::iter(fetches).buffer_unordered(self.settings.concurrency);

            while let Some(fetched) = until_cancelled(&ctx.cancel, async {
                Ok::<_, PipelineError>(columns.next().await)
            })
            .await?
            {
                pending.extend(fetched?);
                ctx.progress.tables += 1;

                while pending.len() >= self.settings.batch_size {
                    let batch: Vec<ColumnRecord> =
                        pending.drain(..self.settings.batch_size).collect();
                    self.flush(ctx, batch).await?;
                }
                self.report(ctx).await;
            }

            ctx.progress.datasets += 1;
            self.report(ctx).await;
        }

        if !pending.is_empty() {
            self.flush(ctx, std::mem::take(&mut pending)).await?;
        }

        ctx.check_cancelled()?;
        let previous = self.index.publish(&ctx.run_id).await?;
        info!(
            project = %ctx.project_id,
            generation = %ctx.run_id,
            records = ctx.progress.records,
            "generation published"
        );

        if let Some(previous) = previous {
            match self.index.retire_generation(&previous).await {
                Ok(deleted) => debug!(generation = %previous, deleted, "generation retired"),
                Err(e) => warn!(generation = %previous, "failed to retire generation: {}", e),
            }
        }

        Ok(())
    }

    /// Embed (or reuse) one batch and append it to the building generation.
    async fn flush(
        &self,
        ctx: &mut RunContext,
        batch: Vec<ColumnRecord>,
    ) -> Result<(), PipelineError> {
        ctx.check_cancelled()?;

        let mut embedded: Vec<EmbeddedRecord> = Vec::with_capacity(batch.len());
        let mut to_embed: Vec<ColumnRecord> = Vec::new();

        let dimension = self.embedder.dimension();
        for record in batch {
            let reusable = ctx
                .previous
                .get(&record.identity)
                .filter(|_| ctx.reuse_unchanged)
                .filter(|(hash, vector)| {
                    *hash == record.content_hash() && vector.len() == dimension
                })
                .map(|(_, vector)| vector.clone());
            match reusable {
                Some(vector) => embedded.push((record, vector)),
                None => to_embed.push(record),
            }
        }
        let reused = embedded.len() as u64;

        let mut skipped = 0u64;
        let mut stale = 0u64;
        if !to_embed.is_empty() {
            let texts: Vec<String> = to_embed.iter().map(|r| r.embedding_text()).collect();
            match until_cancelled(&ctx.cancel, self.embedder.embed(&texts)).await {
                Ok(vectors) => embedded.extend(to_embed.into_iter().zip(vectors)),
                Err(PipelineError::Embedding(e))
                    if self.settings.on_batch_error == BatchErrorPolicy::Skip =>
                {
                    warn!(
                        run_id = %ctx.run_id,
                        records = to_embed.len(),
                        "skipping batch after embedding failure: {}",
                        e
                    );
                    // Identities already indexed keep their old vector; only
                    // new ones are dropped.
                    for record in to_embed {
                        let previous = ctx
                            .previous
                            .get(&record.identity)
                            .filter(|(_, vector)| vector.len() == dimension)
                            .map(|(_, vector)| vector.clone());
                        match previous {
                            Some(vector) => {
                                embedded.push((record, vector));
                                stale += 1;
                            }
                            None => skipped += 1,
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let appended = embedded.len() as u64;
        if appended > 0 {
            until_cancelled(&ctx.cancel, self.index.append(&ctx.run_id, embedded)).await?;
        }

        ctx.progress.records += appended;
        ctx.progress.reused += reused;
        ctx.progress.skipped += skipped;
        ctx.progress.stale += stale;
        debug!(
            run_id = %ctx.run_id,
            appended,
            reused,
            stale,
            skipped,
            total = ctx.progress.records,
            "batch flushed"
        );
        self.report(ctx).await;
        Ok(())
    }

    async fn report(&self, ctx: &RunContext) {
        let progress = ctx.progress;
        self.registry
            .update(&ctx.project_id, &ctx.run_id, |run| progress.apply(run))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmbeddingError;
    use crate::models::{ColumnMode, QueryFilter, RunStatus};
    use crate::services::embedding::EmbeddingProvider;
    use crate::services::index::SqliteIndex;
    use crate::sources::{
        CatalogSnapshot, SnapshotColumn, SnapshotDataset, SnapshotProject, SnapshotSource,
        SnapshotTable,
    };
    use crate::utils::RetryConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    const DIM: usize = 4;

    /// Letter-frequency vectors; stalls forever while `hold` is set.
    #[derive(Default)]
    struct TestProvider {
        hold: AtomicBool,
        fail: AtomicBool,
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for TestProvider {
        fn name(&self) -> &str {
            "test"
        }

        fn model(&self) -> &str {
            "test"
        }

        fn max_batch_size(&self) -> usize {
            16
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            if self.hold.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(EmbeddingError::ClientError {
                    status: 400,
                    body: "rejected".to_string(),
                });
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.1; DIM];
                    for (i, b) in t.bytes().enumerate() {
                        v[i % DIM] += f32::from(b) / 255.0;
                    }
                    v
                })
                .collect())
        }
    }

    fn catalog(columns_per_table: usize) -> CatalogSnapshot {
        let table = |name: &str| SnapshotTable {
            name: name.to_string(),
            columns: (0..columns_per_table)
                .map(|i| {
                    SnapshotColumn::new(format!("{name}_col{i}"), "STRING")
                        .with_mode(ColumnMode::Nullable)
                })
                .collect(),
        };
        CatalogSnapshot {
            projects: vec![SnapshotProject {
                project_id: "acme".to_string(),
                datasets: vec![
                    SnapshotDataset {
                        name: "crm".to_string(),
                        tables: vec![table("customers"), table("contacts")],
                    },
                    SnapshotDataset {
                        name: "sales".to_string(),
                        tables: vec![table("orders")],
                    },
                ],
            }],
        }
    }

    fn pipeline(
        catalog: CatalogSnapshot,
        provider: Arc<TestProvider>,
        settings: PipelineSettings,
    ) -> ExtractionPipeline {
        let retry = RetryConfig::new(1).with_initial_delay(Duration::from_millis(1));
        ExtractionPipeline::new(
            Arc::new(SnapshotSource::new(catalog)),
            Embedder::new(provider, DIM, retry),
            Arc::new(SqliteIndex::open_in_memory("test", DIM).unwrap()),
            settings,
        )
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            batch_size: 5,
            concurrency: 2,
            default_project: Some("acme".to_string()),
            ..Default::default()
        }
    }

    async fn wait_terminal(pipeline: &ExtractionPipeline, run_id: &str) -> ExtractionRun {
        for _ in 0..500 {
            let run = pipeline.status(Some(run_id), None).await.unwrap();
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {run_id} did not finish");
    }

    #[tokio::test]
    async fn test_extract_builds_generation() {
        let provider = Arc::new(TestProvider::default());
        let pipeline = pipeline(catalog(4), provider, settings());

        let run = pipeline.extract(ExtractRequest::default()).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.project_id, "acme");
        assert_eq!(run.datasets_processed, 2);
        assert_eq!(run.tables_processed, 3);
        assert_eq!(run.records_processed, 12);

        let active = pipeline.index().active_generation("acme").await.unwrap();
        assert_eq!(active.unwrap().generation_id, run.run_id);
        assert_eq!(pipeline.stats().await.unwrap().total_records, 12);
    }

    #[tokio::test]
    async fn test_missing_project_is_validation_error() {
        let provider = Arc::new(TestProvider::default());
        let settings = PipelineSettings {
            default_project: None,
            ..settings()
        };
        let pipeline = pipeline(catalog(1), provider, settings);

        let result = pipeline.extract(ExtractRequest::default()).await;
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_incremental_refresh_reuses_vectors() {
        let provider = Arc::new(TestProvider::default());
        let pipeline = pipeline(catalog(4), provider.clone(), settings());

        pipeline.extract(ExtractRequest::default()).await.unwrap();
        let embedded_first = provider.texts.load(Ordering::SeqCst);
        assert_eq!(embedded_first, 12);

        let run = pipeline.extract(ExtractRequest::default()).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.records_processed, 12);
        assert_eq!(run.records_reused, 12);
        assert_eq!(provider.texts.load(Ordering::SeqCst), embedded_first);

        let forced = pipeline
            .extract(ExtractRequest {
                project_id: None,
                force_refresh: true,
            })
            .await
            .unwrap();
        assert_eq!(forced.records_reused, 0);
        assert_eq!(provider.texts.load(Ordering::SeqCst), embedded_first + 12);
    }

    #[tokio::test]
    async fn test_conflict_while_running_then_cancel() {
        let provider = Arc::new(TestProvider::default());
        provider.hold.store(true, Ordering::SeqCst);
        let pipeline = pipeline(catalog(2), provider.clone(), settings());

        let run = pipeline.trigger(ExtractRequest::default()).await.unwrap();
        assert!(run.status.is_active());

        let conflict = pipeline.trigger(ExtractRequest::default()).await;
        assert!(matches!(conflict, Err(PipelineError::Conflict { .. })));

        // wait until the run is stuck inside the provider
        for _ in 0..500 {
            if provider.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pipeline.cancel("acme").await.unwrap();
        let finished = wait_terminal(&pipeline, &run.run_id).await;
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.error.as_deref(), Some("cancelled"));

        assert!(pipeline.index().active_generation("acme").await.unwrap().is_none());
        assert!(pipeline.index().generation(&run.run_id).await.unwrap().is_none());
        assert!(matches!(
            pipeline.cancel("acme").await,
            Err(PipelineError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_generation() {
        let provider = Arc::new(TestProvider::default());
        let pipeline = pipeline(catalog(2), provider.clone(), settings());

        let first = pipeline.extract(ExtractRequest::default()).await.unwrap();
        provider.fail.store(true, Ordering::SeqCst);

        let failed = pipeline
            .extract(ExtractRequest {
                project_id: None,
                force_refresh: true,
            })
            .await
            .unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("rejected"));

        let active = pipeline.index().active_generation("acme").await.unwrap();
        assert_eq!(active.unwrap().generation_id, first.run_id);
        let hits = pipeline
            .index()
            .query(&[1.0, 1.0, 1.0, 1.0], 100, &QueryFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 6);

        // the slot is free again
        provider.fail.store(false, Ordering::SeqCst);
        let again = pipeline.extract(ExtractRequest::default()).await.unwrap();
        assert_eq!(again.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_skip_policy_drops_failed_batches() {
        let provider = Arc::new(TestProvider::default());
        provider.fail.store(true, Ordering::SeqCst);
        let settings = PipelineSettings {
            on_batch_error: BatchErrorPolicy::Skip,
            ..settings()
        };
        let pipeline = pipeline(catalog(2), provider, settings);

        let run = pipeline.extract(ExtractRequest::default()).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.records_processed, 0);
        assert_eq!(run.records_skipped, 6);
    }

    #[tokio::test]
    async fn test_skip_policy_keeps_indexed_columns() {
        let provider = Arc::new(TestProvider::default());
        let settings = PipelineSettings {
            on_batch_error: BatchErrorPolicy::Skip,
            ..settings()
        };
        let first_pipeline = pipeline(catalog(2), provider.clone(), settings.clone());
        let first = first_pipeline
            .extract(ExtractRequest::default())
            .await
            .unwrap();
        assert_eq!(first.records_processed, 6);

        // same index, one extra column per table
        let pipeline = ExtractionPipeline::new(
            Arc::new(SnapshotSource::new(catalog(3))),
            Embedder::new(
                provider.clone(),
                DIM,
                RetryConfig::new(1).with_initial_delay(Duration::from_millis(1)),
            ),
            Arc::clone(first_pipeline.index()),
            settings,
        );
        provider.fail.store(true, Ordering::SeqCst);

        let second = pipeline
            .extract(ExtractRequest {
                project_id: None,
                force_refresh: true,
            })
            .await
            .unwrap();
        assert_eq!(second.status, RunStatus::Succeeded);
        assert_eq!(second.records_stale, 6);
        assert_eq!(second.records_skipped, 3);
        assert_eq!(second.records_processed, 6);
        assert_eq!(second.records_reused, 0);

        assert_eq!(pipeline.stats().await.unwrap().total_records, 6);
        let active = pipeline.index().active_generation("acme").await.unwrap();
        assert_eq!(active.unwrap().generation_id, second.run_id);

        let kept = pipeline
            .index()
            .generation_hashes(&second.run_id)
            .await
            .unwrap();
        let mut names: Vec<_> = kept.keys().map(|id| id.column_name.clone()).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "contacts_col0",
                "contacts_col1",
                "customers_col0",
                "customers_col1",
                "orders_col0",
                "orders_col1",
            ]
        );
    }

    #[tokio::test]
    async fn test_status_lookup() {
        let provider = Arc::new(TestProvider::default());
        let pipeline = pipeline(catalog(1), provider, settings());

        assert!(matches!(
            pipeline.status(None, None).await,
            Err(PipelineError::RunNotFound(_))
        ));

        let run = pipeline.extract(ExtractRequest::default()).await.unwrap();
        let latest = pipeline.status(None, Some("acme")).await.unwrap();
        assert_eq!(latest.run_id, run.run_id);
        assert!(matches!(
            pipeline.status(Some("missing"), None).await,
            Err(PipelineError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_history_limit() {
        let registry = RunRegistry::new(2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (run, _cancel) = registry.start("acme", false).await.unwrap();
            registry
                .finish("acme", &run.run_id, |r| r.mark_succeeded())
                .await;
            ids.push(run.run_id);
        }
        assert!(registry.get(&ids[0]).await.is_none());
        assert!(registry.get(&ids[2]).await.is_some());
        assert_eq!(registry.latest(None).await.unwrap().run_id, ids[2]);
    }

    #[tokio::test]
    async fn test_different_projects_run_concurrently() {
        let registry = RunRegistry::new(5);
        let (a, _ca) = registry.start("acme", false).await.unwrap();
        let (b, _cb) = registry.start("beta", false).await.unwrap();
        assert_ne!(a.run_id, b.run_id);
        assert!(matches!(
            registry.start("acme", true).await,
            Err(PipelineError::Conflict { .. })
        ));
        assert_eq!(registry.active("beta").await.unwrap().run_id, b.run_id);
    }
}
