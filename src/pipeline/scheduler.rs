//! Pipeline scheduler
//!
//! Owns the task table and runs each submitted pipeline on a spawned
//! worker. `submit` validates synchronously and returns a task ID as soon
//! as the record is queued; progress is observed through `poll` and
//! stopped through `cancel`. A task ends `Failed` only when every item in
//! it failed; any partial progress is a success with per-stage counts
//! telling the rest of the story.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::pipeline::stages::{self, DownloadOutcome};
use crate::pipeline::CancelToken;
use crate::sources::{Downloader, SearchClient};
use crate::storage::images::{ImageStore, StoreError};
use crate::storage::settings::HiveSettings;
use crate::system::devices::DeviceInventory;
use crate::types::image::{CaptionOptions, ImageRecord, ResultItem};
use crate::types::task::{PipelineKind, StageCounts, TaskRequest, TaskSnapshot, TaskStatus};
use crate::vision::backend::ModelSpec;
use crate::vision::dispatcher::Dispatcher;
use crate::vision::registry::{RegistryError, VisionRegistry};

pub const STAGE_SEARCH: &str = "search";
pub const STAGE_DOWNLOAD: &str = "download";
pub const STAGE_ANALYZE: &str = "analyze";

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("no task with id {0}")]
    NotFound(String),
}

/// Tunables the scheduler reads per task.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub download_concurrency: usize,
    pub download_retries: u32,
    pub caption_options: CaptionOptions,
    pub model_spec: ModelSpec,
    /// Free-memory threshold for picking an accelerator, in MiB
    pub min_free_vram_mb: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&HiveSettings::default())
    }
}

impl From<&HiveSettings> for SchedulerConfig {
    fn from(settings: &HiveSettings) -> Self {
        Self {
            download_concurrency: settings.download_concurrency,
            download_retries: settings.download_retries,
            caption_options: CaptionOptions {
                need_objects: settings.need_objects,
                timeout: std::time::Duration::from_secs(settings.inference_timeout_secs),
            },
            model_spec: ModelSpec {
                name: settings.model_name.clone(),
                footprint_mb: settings.model_footprint_mb,
            },
            min_free_vram_mb: settings.min_free_vram_mb,
        }
    }
}

struct TaskState {
    status: TaskStatus,
    stage: String,
    stages: Vec<(String, StageCounts)>,
    last_error: Option<String>,
    created_at: chrono::DateTime<Utc>,
    finished_at: Option<chrono::DateTime<Utc>>,
}

struct TaskRecord {
    id: String,
    kind: PipelineKind,
    cancel: CancelToken,
    state: Mutex<TaskState>,
}

impl TaskRecord {
    fn new(kind: PipelineKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            cancel: CancelToken::new(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Queued,
                stage: String::new(),
                stages: Vec::new(),
                last_error: None,
                created_at: Utc::now(),
                finished_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin_stage(&self, name: &str) {
        let mut state = self.lock();
        state.stage = name.to_string();
        state.stages.push((name.to_string(), StageCounts::default()));
    }

    fn set_counts(&self, name: &str, counts: &StageCounts) {
        let mut state = self.lock();
        if counts.last_error.is_some() {
            state.last_error = counts.last_error.clone();
        }
        if let Some(slot) = state.stages.iter_mut().find(|(n, _)| n == name) {
            slot.1 = counts.clone();
        }
    }

    fn finish(&self, status: TaskStatus) {
        let mut state = self.lock();
        state.status = status;
        state.finished_at = Some(Utc::now());
    }

    fn snapshot(&self) -> TaskSnapshot {
        let state = self.lock();
        TaskSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            status: state.status,
            stage: state.stage.clone(),
            stages: state.stages.clone(),
            last_error: state.last_error.clone(),
            created_at: state.created_at,
            finished_at: state.finished_at,
        }
    }
}

/// Runs submitted pipelines and tracks their lifecycle.
pub struct PipelineScheduler {
    search: Arc<dyn SearchClient>,
    downloader: Arc<dyn Downloader>,
    store: Arc<dyn ImageStore>,
    registry: Arc<VisionRegistry>,
    dispatcher: Dispatcher,
    inventory: DeviceInventory,
    config: SchedulerConfig,
    tasks: DashMap<String, Arc<TaskRecord>>,
}

impl PipelineScheduler {
    pub fn new(
        search: Arc<dyn SearchClient>,
        downloader: Arc<dyn Downloader>,
        store: Arc<dyn ImageStore>,
        registry: Arc<VisionRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            search,
            downloader,
            store,
            registry,
            dispatcher: Dispatcher::new(),
            inventory: DeviceInventory::new(),
            config,
            tasks: DashMap::new(),
        }
    }

    /// Queue a pipeline task.
    ///
    /// Validates the request synchronously, then returns the ID of the
    /// queued task without waiting for any stage to run.
    pub fn submit(self: &Arc<Self>, request: TaskRequest) -> Result<String, SchedulerError> {
        self.validate(&request)?;

        let record = Arc::new(TaskRecord::new(request.kind()));
        let id = record.id.clone();
        self.tasks.insert(id.clone(), Arc::clone(&record));
        tracing::info!("Task {} queued ({})", id, record.kind);

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.drive(record, request).await;
        });

        Ok(id)
    }

    /// Point-in-time snapshot of one task.
    pub fn poll(&self, id: &str) -> Result<TaskSnapshot, SchedulerError> {
        self.tasks
            .get(id)
            .map(|record| record.snapshot())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    /// Request cancellation of a task.
    ///
    /// Best-effort: items already in flight run to completion, further
    /// items and stages are skipped. Cancelling a terminal task changes
    /// nothing and returns its final snapshot.
    pub fn cancel(&self, id: &str) -> Result<TaskSnapshot, SchedulerError> {
        let record = self
            .tasks
            .get(id)
            .map(|record| Arc::clone(record.value()))
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        if !record.lock().status.is_terminal() {
            tracing::info!("Task {} cancellation requested", id);
            record.cancel.cancel();
        }
        Ok(record.snapshot())
    }

    /// Snapshots of every known task, oldest first.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> = self
            .tasks
            .iter()
            .map(|record| record.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    fn validate(&self, request: &TaskRequest) -> Result<(), SchedulerError> {
        let err = |message: &str| Err(SchedulerError::InvalidParameters(message.to_string()));

        match request {
            TaskRequest::SearchDownload { query, sources, limit }
            | TaskRequest::FullPipeline { query, sources, limit, .. } => {
                if query.trim().is_empty() {
                    return err("query must not be empty");
                }
                if sources.is_empty() {
                    return err("at least one source is required");
                }
                if *limit == 0 {
                    return err("limit must be at least 1");
                }
                let known = self.search.sources();
                for (source, pages) in sources {
                    if !known.iter().any(|k| k.eq_ignore_ascii_case(source)) {
                        return Err(SchedulerError::InvalidParameters(format!(
                            "unknown source: {}",
                            source
                        )));
                    }
                    if *pages == 0 {
                        return err("page count must be at least 1");
                    }
                }
            }
            TaskRequest::DownloadAnalyze { url, .. } => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return err("url must be absolute http(s)");
                }
            }
            TaskRequest::AnalyzeUnprocessed { limit, .. }
            | TaskRequest::SmartAnalyze { limit, .. } => {
                if *limit == 0 {
                    return err("limit must be at least 1");
                }
            }
        }
        Ok(())
    }

    async fn drive(self: Arc<Self>, record: Arc<TaskRecord>, request: TaskRequest) {
        record.lock().status = TaskStatus::Running;

        match request {
            TaskRequest::SearchDownload { query, sources, limit } => {
                self.run_search_download(&record, query, sources, limit).await;
            }
            TaskRequest::DownloadAnalyze { url, tags, source, query } => {
                self.run_download_analyze(&record, url, tags, source, query).await;
            }
            TaskRequest::AnalyzeUnprocessed { limit, sources } => {
                let (records, seed) = self.collect_unprocessed(limit, &sources).await;
                if records.is_empty() {
                    self.record_analyze_only(&record, seed);
                } else {
                    self.run_analyze_stage(&record, records, seed).await;
                }
            }
            TaskRequest::SmartAnalyze { ids, limit, auto_unload } => {
                self.run_smart_analyze(&record, ids, limit, auto_unload).await;
            }
            TaskRequest::FullPipeline { query, sources, limit, auto_unload } => {
                self.run_full_pipeline(&record, query, sources, limit, auto_unload).await;
            }
        }

        let status = self.conclude(&record);
        record.finish(status);
        tracing::info!("Task {} finished: {}", record.id, status_name(status));
    }

    /// Terminal status from the accumulated counts. Cancellation wins;
    /// otherwise a task fails only when nothing in it succeeded.
    ///
    /// Search hits are leads, not delivered work: only the item-bearing
    /// stages (download, analyze) decide the outcome when any of them ran.
    /// A task that never got past search is judged on the search counts.
    fn conclude(&self, record: &TaskRecord) -> TaskStatus {
        if record.cancel.is_cancelled() {
            return TaskStatus::Cancelled;
        }

        let snapshot = record.snapshot();
        let ran_batch_stage = snapshot
            .stages
            .iter()
            .any(|(name, _)| name != STAGE_SEARCH);

        let mut totals = StageCounts::default();
        for (name, counts) in &snapshot.stages {
            if ran_batch_stage && name == STAGE_SEARCH {
                continue;
            }
            totals = totals.merged(counts);
        }

        if totals.succeeded == 0 && totals.failed > 0 {
            TaskStatus::Failed
        } else {
            TaskStatus::Succeeded
        }
    }

    async fn run_search_download(
        &self,
        record: &Arc<TaskRecord>,
        query: String,
        sources: BTreeMap<String, u32>,
        limit: usize,
    ) {
        let items = self.search_stage(record, query.clone(), sources, limit).await;
        if record.cancel.is_cancelled() || items.is_empty() {
            return;
        }
        self.download_stage(record, items, query).await;
    }

    async fn run_download_analyze(
        &self,
        record: &Arc<TaskRecord>,
        url: String,
        tags: Vec<String>,
        source: String,
        query: String,
    ) {
        let item = ResultItem {
            url,
            source,
            source_id: None,
            tags,
            alt: String::new(),
        };
        let downloaded = self.download_stage(record, vec![item], query).await;
        if record.cancel.is_cancelled() || downloaded.is_empty() {
            return;
        }
        self.run_analyze_stage(record, downloaded, StageCounts::default())
            .await;
    }

    async fn run_smart_analyze(
        &self,
        record: &Arc<TaskRecord>,
        ids: Vec<String>,
        limit: usize,
        auto_unload: bool,
    ) {
        let (targets, seed) = if ids.is_empty() {
            self.collect_unprocessed(limit, &[]).await
        } else {
            self.collect_by_id(&ids).await
        };

        if record.cancel.is_cancelled() {
            return;
        }

        if targets.is_empty() {
            self.record_analyze_only(record, seed);
        } else {
            match self.ensure_instance().await {
                Ok(()) => self.run_analyze_stage(record, targets, seed).await,
                Err(e) => self.fail_analyze(record, seed, targets.len(), &e.to_string()),
            }
        }

        if auto_unload {
            self.sweep_instances(record).await;
        }
    }

    async fn run_full_pipeline(
        &self,
        record: &Arc<TaskRecord>,
        query: String,
        sources: BTreeMap<String, u32>,
        limit: usize,
        auto_unload: bool,
    ) {
        let items = self.search_stage(record, query.clone(), sources, limit).await;

        let downloaded = if record.cancel.is_cancelled() || items.is_empty() {
            Vec::new()
        } else {
            self.download_stage(record, items, query).await
        };

        if !record.cancel.is_cancelled() && !downloaded.is_empty() {
            match self.ensure_instance().await {
                Ok(()) => {
                    self.run_analyze_stage(record, downloaded, StageCounts::default())
                        .await;
                }
                Err(e) => {
                    self.fail_analyze(record, StageCounts::default(), downloaded.len(), &e.to_string());
                }
            }
        }

        if auto_unload {
            self.sweep_instances(record).await;
        }
    }

    async fn search_stage(
        &self,
        record: &Arc<TaskRecord>,
        query: String,
        sources: BTreeMap<String, u32>,
        limit: usize,
    ) -> Vec<ResultItem> {
        record.begin_stage(STAGE_SEARCH);
        let outcome =
            stages::run_search(Arc::clone(&self.search), query, sources, limit).await;
        record.set_counts(STAGE_SEARCH, &outcome.counts);
        outcome.items
    }

    async fn download_stage(
        &self,
        record: &Arc<TaskRecord>,
        items: Vec<ResultItem>,
        query: String,
    ) -> Vec<ImageRecord> {
        record.begin_stage(STAGE_DOWNLOAD);
        let progress_record = Arc::clone(record);
        let DownloadOutcome { records, counts } = stages::run_download(
            Arc::clone(&self.downloader),
            Arc::clone(&self.store),
            items,
            query,
            self.config.download_concurrency,
            self.config.download_retries,
            record.cancel.clone(),
            move |counts| progress_record.set_counts(STAGE_DOWNLOAD, counts),
        )
        .await;
        record.set_counts(STAGE_DOWNLOAD, &counts);
        records
    }

    /// Run the analyze batch over `targets`, folding `seed` (failures
    /// recorded while collecting the batch) into the stage counts so they
    /// survive in the snapshot.
    async fn run_analyze_stage(
        &self,
        record: &Arc<TaskRecord>,
        targets: Vec<ImageRecord>,
        seed: StageCounts,
    ) {
        record.begin_stage(STAGE_ANALYZE);
        record.set_counts(STAGE_ANALYZE, &seed);

        let progress_record = Arc::clone(record);
        let progress_seed = seed.clone();
        let outcome = stages::run_analyze(
            Arc::clone(&self.registry),
            self.dispatcher,
            Arc::clone(&self.store),
            targets,
            self.config.caption_options.clone(),
            record.cancel.clone(),
            move |counts| {
                progress_record.set_counts(STAGE_ANALYZE, &progress_seed.merged(counts));
            },
        )
        .await;
        record.set_counts(STAGE_ANALYZE, &seed.merged(&outcome.counts));
    }

    /// Record an analyze stage that never ran a batch, if the collection
    /// pass produced anything worth reporting.
    fn record_analyze_only(&self, record: &TaskRecord, seed: StageCounts) {
        if seed != StageCounts::default() {
            record.begin_stage(STAGE_ANALYZE);
            record.set_counts(STAGE_ANALYZE, &seed);
        }
    }

    /// Mark every pending item as an analyze failure with one reason,
    /// on top of failures already collected in `seed`.
    fn fail_analyze(&self, record: &TaskRecord, seed: StageCounts, pending: usize, reason: &str) {
        let mut counts = seed;
        for _ in 0..pending {
            counts.record_err(reason.to_string());
        }
        record.begin_stage(STAGE_ANALYZE);
        record.set_counts(STAGE_ANALYZE, &counts);
    }

    async fn collect_unprocessed(
        &self,
        limit: usize,
        sources: &[String],
    ) -> (Vec<ImageRecord>, StageCounts) {
        match self.store.list_unprocessed(limit, sources).await {
            Ok(records) => (records, StageCounts::default()),
            Err(e) => {
                let mut counts = StageCounts::default();
                counts.record_err(format!("listing unprocessed images: {}", e));
                (Vec::new(), counts)
            }
        }
    }

    /// Resolve explicit image IDs; unknown IDs become analyze-stage
    /// failures rather than aborting the batch.
    async fn collect_by_id(&self, ids: &[String]) -> (Vec<ImageRecord>, StageCounts) {
        let mut targets = Vec::new();
        let mut missing = StageCounts::default();

        for id in ids {
            match self.store.get(id).await {
                Ok(image) => targets.push(image),
                Err(StoreError::NotFound(_)) => {
                    missing.record_err(format!("no image with id {}", id));
                }
                Err(e) => missing.record_err(format!("{}: {}", id, e)),
            }
        }

        (targets, missing)
    }

    /// Make sure at least one instance is ready, loading one onto the
    /// recommended device if none is.
    async fn ensure_instance(&self) -> Result<(), RegistryError> {
        if !self.registry.ready_devices().is_empty() {
            return Ok(());
        }

        let device = self.inventory.recommend(self.config.min_free_vram_mb);
        self.registry
            .load(&device, &self.config.model_spec)
            .await
            .map(|_| ())
    }

    async fn sweep_instances(&self, record: &TaskRecord) {
        for (device, e) in self.registry.unload_all().await {
            tracing::warn!("Task {}: unload on {} failed: {}", record.id, device, e);
        }
    }
}

fn status_name(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Queued => "queued",
        TaskStatus::Running => "running",
        TaskStatus::Succeeded => "succeeded",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}
