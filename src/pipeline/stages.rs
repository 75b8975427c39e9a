//! Pipeline stage drivers
//!
//! Each stage is a function from (collaborators, input) to (counts,
//! output). Item-level failures inside a batch are recorded in the stage
//! counts and never abort the batch; the scheduler aggregates them into
//! the task's terminal status. Batch fan-out is bounded: a fixed
//! concurrency cap for network fetches, and one worker per ready device
//! for analysis.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::pipeline::CancelToken;
use crate::sources::{Downloader, SearchClient, SourceError};
use crate::storage::images::{ImageStore, SaveRequest, StoreError};
use crate::types::image::{CaptionOptions, ImageRecord, ResultItem};
use crate::types::task::StageCounts;
use crate::vision::dispatcher::Dispatcher;
use crate::vision::registry::VisionRegistry;

/// Base delay for transient-failure backoff; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

pub struct SearchOutcome {
    pub items: Vec<ResultItem>,
    pub counts: StageCounts,
}

/// Query every requested source, fanning pages out concurrently.
///
/// `sources` maps a source name to a page count. Results are deduplicated
/// by URL and truncated to `limit`. A failed source page is one recorded
/// failure; collected items count as successes.
pub async fn run_search(
    search: Arc<dyn SearchClient>,
    query: String,
    sources: BTreeMap<String, u32>,
    limit: usize,
) -> SearchOutcome {
    let mut set: JoinSet<Result<Vec<ResultItem>, SourceError>> = JoinSet::new();

    for (source, pages) in &sources {
        for page in 1..=*pages {
            let search = Arc::clone(&search);
            let source = source.clone();
            let query = query.clone();
            set.spawn(async move { search.search(&source, &query, page).await });
        }
    }

    let mut counts = StageCounts::default();
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(page_items)) => {
                for item in page_items {
                    if seen.insert(item.url.clone()) {
                        items.push(item);
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Search page failed: {}", e);
                counts.record_err(e.to_string());
            }
            Err(e) => counts.record_err(format!("search worker panicked: {}", e)),
        }
    }

    items.truncate(limit);
    counts.succeeded = items.len() as u64;
    SearchOutcome { items, counts }
}

pub struct DownloadOutcome {
    pub records: Vec<ImageRecord>,
    pub counts: StageCounts,
}

enum ItemOutcome<T> {
    Done(T),
    Skipped,
    Failed(String),
    Cancelled,
}

/// Fetch and persist a batch of search results.
///
/// Concurrency is capped at `concurrency` to respect third-party rate
/// limits. Transient fetch failures retry up to `retries` times with
/// exponential backoff; URLs already stored or blocked are skipped.
pub async fn run_download<P>(
    downloader: Arc<dyn Downloader>,
    store: Arc<dyn ImageStore>,
    items: Vec<ResultItem>,
    query: String,
    concurrency: usize,
    retries: u32,
    cancel: CancelToken,
    mut progress: P,
) -> DownloadOutcome
where
    P: FnMut(&StageCounts),
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set: JoinSet<ItemOutcome<ImageRecord>> = JoinSet::new();

    for item in items {
        let downloader = Arc::clone(&downloader);
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let query = query.clone();

        set.spawn(async move {
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => return ItemOutcome::Cancelled,
            };
            if cancel.is_cancelled() {
                return ItemOutcome::Cancelled;
            }
            download_one(&*downloader, &*store, item, query, retries).await
        });
    }

    let mut counts = StageCounts::default();
    let mut records = Vec::new();

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(ItemOutcome::Done(record)) => {
                counts.record_ok();
                records.push(record);
            }
            Ok(ItemOutcome::Skipped) => counts.record_skip(),
            Ok(ItemOutcome::Failed(message)) => counts.record_err(message),
            Ok(ItemOutcome::Cancelled) => {}
            Err(e) => counts.record_err(format!("download worker panicked: {}", e)),
        }
        progress(&counts);
    }

    DownloadOutcome { records, counts }
}

async fn download_one(
    downloader: &dyn Downloader,
    store: &dyn ImageStore,
    item: ResultItem,
    query: String,
    retries: u32,
) -> ItemOutcome<ImageRecord> {
    if store.contains_url(&item.url).await {
        tracing::debug!("Skipping already stored url {}", item.url);
        return ItemOutcome::Skipped;
    }

    let bytes = {
        let mut attempt = 0u32;
        loop {
            match downloader.fetch(&item.url).await {
                Ok(bytes) => break bytes,
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                    tracing::debug!(
                        "Transient fetch failure for {} (attempt {}): {}",
                        item.url,
                        attempt,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return ItemOutcome::Failed(format!("{}: {}", item.url, e)),
            }
        }
    };

    let request = SaveRequest {
        url: item.url.clone(),
        source: item.source,
        source_id: item.source_id,
        query,
        tags: item.tags,
        alt: item.alt,
    };

    match store.save(&bytes, request).await {
        Ok(record) => ItemOutcome::Done(record),
        Err(StoreError::Duplicate(_)) => ItemOutcome::Skipped,
        Err(e) => ItemOutcome::Failed(format!("{}: {}", item.url, e)),
    }
}

pub struct AnalyzeOutcome {
    pub counts: StageCounts,
}

/// Caption a batch of stored images.
///
/// Items are assigned round-robin over the devices holding a ready
/// instance, with at most one in-flight call per instance; with no ready
/// instance every item fails (loading is the caller's decision, not this
/// stage's).
pub async fn run_analyze<P>(
    registry: Arc<VisionRegistry>,
    dispatcher: Dispatcher,
    store: Arc<dyn ImageStore>,
    records: Vec<ImageRecord>,
    options: CaptionOptions,
    cancel: CancelToken,
    mut progress: P,
) -> AnalyzeOutcome
where
    P: FnMut(&StageCounts),
{
    let mut counts = StageCounts::default();

    let devices = registry.ready_devices();
    if devices.is_empty() {
        for record in &records {
            counts.record_err(format!("{}: no vision instance loaded", record.id));
        }
        progress(&counts);
        return AnalyzeOutcome { counts };
    }

    // One permit per device so calls against one instance never stack.
    let limiters: Vec<Arc<Semaphore>> = devices
        .iter()
        .map(|_| Arc::new(Semaphore::new(1)))
        .collect();
    let mut set: JoinSet<ItemOutcome<()>> = JoinSet::new();

    for (idx, record) in records.into_iter().enumerate() {
        let registry = Arc::clone(&registry);
        let store = Arc::clone(&store);
        let slot = idx % devices.len();
        let limiter = Arc::clone(&limiters[slot]);
        let cancel = cancel.clone();
        let options = options.clone();
        let device = devices[slot];

        set.spawn(async move {
            let _permit = match limiter.acquire().await {
                Ok(permit) => permit,
                Err(_) => return ItemOutcome::Cancelled,
            };
            if cancel.is_cancelled() {
                return ItemOutcome::Cancelled;
            }

            let handle = match registry.acquire(device) {
                Ok(handle) => handle,
                Err(e) => return ItemOutcome::Failed(format!("{}: {}", record.id, e)),
            };

            let bytes = match store.read_bytes(&record).await {
                Ok(bytes) => bytes,
                Err(e) => return ItemOutcome::Failed(format!("{}: {}", record.id, e)),
            };

            let caption = match dispatcher.infer(&handle, &bytes, &options).await {
                Ok(caption) => caption,
                Err(e) => return ItemOutcome::Failed(format!("{}: {}", record.id, e)),
            };

            match store.update_caption(&record.id, &caption).await {
                Ok(()) => ItemOutcome::Done(()),
                Err(e) => ItemOutcome::Failed(format!("{}: {}", record.id, e)),
            }
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(ItemOutcome::Done(())) => counts.record_ok(),
            Ok(ItemOutcome::Skipped) => counts.record_skip(),
            Ok(ItemOutcome::Failed(message)) => counts.record_err(message),
            Ok(ItemOutcome::Cancelled) => {}
            Err(e) => counts.record_err(format!("analyze worker panicked: {}", e)),
        }
        progress(&counts);
    }

    AnalyzeOutcome { counts }
}
