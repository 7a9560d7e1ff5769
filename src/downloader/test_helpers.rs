//! Shared test helpers for creating MediaDownloader instances in tests.

use crate::config::Config;
use crate::content::ContentItem;
use crate::downloader::MediaDownloader;
use crate::error::ProviderError;
use crate::provider::{OnDiskUnit, ParsedFileName, Repository, SeriesInfo, Unit};
use crate::types::{ContentState, DownloadRequest, Event, Provider};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// A page coordinate within a scripted series: (unit number, page number),
/// both 1-based
pub(crate) type PageKey = (usize, usize);

/// Behavior script for a [`MockRepository`]
#[derive(Clone, Default)]
pub(crate) struct MockScript {
    /// Number of units the series reports
    pub(crate) units: usize,
    /// Number of pages per unit
    pub(crate) pages_per_unit: usize,
    /// Pages that fail exactly once, then succeed
    pub(crate) fail_once: HashSet<PageKey>,
    /// Pages that fail on every attempt
    pub(crate) fail_always: HashSet<PageKey>,
    /// Pages that hang until cancelled
    pub(crate) stall: HashSet<PageKey>,
    /// Artificial delay before series metadata resolves
    pub(crate) series_delay: Duration,
    /// Fail the metadata fetch outright
    pub(crate) series_error: bool,
}

impl MockScript {
    pub(crate) fn with_units(units: usize, pages_per_unit: usize) -> Self {
        Self {
            units,
            pages_per_unit,
            ..Self::default()
        }
    }
}

/// Scripted in-memory provider for pipeline and lifecycle tests
pub(crate) struct MockRepository {
    provider: Provider,
    script: MockScript,
    already_failed: Mutex<HashSet<PageKey>>,
    /// Total sub-unit fetch attempts, including retries
    pub(crate) fetch_count: AtomicU64,
}

impl MockRepository {
    pub(crate) fn new(provider: Provider, script: MockScript) -> Self {
        Self {
            provider,
            script,
            already_failed: Mutex::new(HashSet::new()),
            fetch_count: AtomicU64::new(0),
        }
    }

    pub(crate) fn fetches(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    fn page_key(unit: &Unit, index: usize) -> PageKey {
        (unit.chapter.parse().unwrap_or(0), index)
    }
}

#[async_trait]
impl Repository for MockRepository {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn series_info(
        &self,
        id: &str,
        _request: &DownloadRequest,
    ) -> Result<SeriesInfo, ProviderError> {
        if !self.script.series_delay.is_zero() {
            tokio::time::sleep(self.script.series_delay).await;
        }
        if self.script.series_error {
            return Err(ProviderError::new("series info unavailable"));
        }

        let units = (1..=self.script.units)
            .map(|n| Unit {
                id: format!("{id}-u{n}"),
                title: format!("Unit {n}"),
                volume: String::new(),
                chapter: n.to_string(),
                url: format!("https://mock/{id}/{n}"),
            })
            .collect();

        Ok(SeriesInfo {
            id: id.to_string(),
            title: format!("Series {id}"),
            ref_url: format!("https://mock/{id}"),
            units,
            ..SeriesInfo::default()
        })
    }

    async fn unit_resources(&self, unit: &Unit) -> Result<Vec<String>, ProviderError> {
        Ok((1..=self.script.pages_per_unit)
            .map(|page| format!("https://mock/{}/{page}.png", unit.chapter))
            .collect())
    }

    async fn fetch_sub_unit(
        &self,
        index: usize,
        unit: &Unit,
        url: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let key = Self::page_key(unit, index);

        if self.script.stall.contains(&key) {
            // Hangs until the worker's cancellation select tears it down
            futures::future::pending::<()>().await;
        }

        if self.script.fail_always.contains(&key) {
            return Err(ProviderError::new(format!("permanent failure for {url}")));
        }

        if self.script.fail_once.contains(&key) {
            let mut seen = self.already_failed.lock().unwrap();
            if seen.insert(key) {
                return Err(ProviderError::new(format!("transient failure for {url}")));
            }
        }

        Ok(format!("payload {url}").into_bytes())
    }

    fn parse_on_disk(&self, file_name: &str) -> Option<ParsedFileName> {
        let stem = file_name.strip_suffix(".cbz")?;
        let chapter_raw = stem.rsplit(" Ch. ").next()?;
        let chapter: f64 = chapter_raw.parse().ok()?;

        // Undo the zero padding so markers compare equal to provider ones
        let chapter = if chapter.fract() == 0.0 {
            format!("{}", chapter as i64)
        } else {
            format!("{chapter}")
        };
        Some(ParsedFileName {
            volume: String::new(),
            chapter,
        })
    }

    fn volume_on_disk(&self, on_disk: &OnDiskUnit) -> Result<Option<String>, ProviderError> {
        Ok(Some(on_disk.volume.clone()))
    }
}

/// Test config: temp root, tight timeouts, effectively unlimited rate
pub(crate) fn test_config(root: &Path) -> Config {
    Config {
        root_dir: root.to_path_buf(),
        max_concurrent_images: 2,
        images_per_second: Some(10_000),
        small_unit_delay: Duration::ZERO,
        progress_interval: Duration::from_millis(50),
        cancel_wait: Duration::from_secs(2),
        abort_wait: Duration::from_secs(2),
        queue_shutdown_wait: Duration::from_secs(2),
        cleanup_shutdown_wait: Duration::from_secs(5),
        ..Config::default()
    }
}

pub(crate) async fn create_test_downloader() -> (MediaDownloader, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let downloader = MediaDownloader::new(test_config(temp_dir.path()))
        .await
        .unwrap();
    (downloader, temp_dir)
}

/// Register a scripted repository for `provider` and return it for assertions
pub(crate) fn register_mock(
    downloader: &MediaDownloader,
    provider: Provider,
    script: MockScript,
) -> Arc<MockRepository> {
    let repository = Arc::new(MockRepository::new(provider, script));
    let shared = Arc::clone(&repository);
    downloader.register_provider(
        provider,
        Arc::new(move |_req| Ok(Arc::clone(&shared) as Arc<dyn Repository>)),
    );
    repository
}

pub(crate) fn request(provider: Provider, id: &str) -> DownloadRequest {
    DownloadRequest {
        provider,
        id: id.to_string(),
        base_dir: "Manga".to_string(),
        temp_title: format!("Temp {id}"),
        start_immediately: true,
        extra: HashMap::new(),
    }
}

/// Collects every event emitted after attachment
pub(crate) struct EventCollector {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventCollector {
    pub(crate) fn attach(downloader: &MediaDownloader) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut receiver = downloader.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                sink.lock().unwrap().push(event);
            }
        });
        Self { events }
    }

    pub(crate) fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn states_for(&self, id: &str) -> Vec<ContentState> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::StateChanged {
                    id: event_id,
                    state,
                } if event_id == id => Some(state),
                _ => None,
            })
            .collect()
    }
}

/// Poll `cond` until it returns true or the deadline passes
pub(crate) async fn wait_until<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if cond().await {
            return;
        }
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Insert an item directly into the active map with a forced state,
/// bypassing the queues — for admission-policy tests
pub(crate) async fn insert_item_with_state(
    downloader: &MediaDownloader,
    provider: Provider,
    id: &str,
    state: ContentState,
) -> Arc<ContentItem> {
    let repository = Arc::new(MockRepository::new(provider, MockScript::with_units(1, 1)));
    let item = ContentItem::new(
        repository,
        request(provider, id),
        downloader.get_config(),
        downloader.event_tx.clone(),
        downloader.command_tx.clone(),
        Arc::new(crate::transform::NoOpTransform),
    );

    // Walk the lifecycle table to the requested state
    match state {
        ContentState::Queued => {}
        ContentState::Loading => item.set_state(ContentState::Loading),
        ContentState::Waiting => {
            item.set_state(ContentState::Loading);
            item.set_state(ContentState::Waiting);
        }
        ContentState::Ready => {
            item.set_state(ContentState::Loading);
            item.set_state(ContentState::Ready);
        }
        ContentState::Downloading => {
            item.set_state(ContentState::Loading);
            item.set_state(ContentState::Ready);
            item.set_state(ContentState::Downloading);
        }
        ContentState::Cleanup => item.set_state(ContentState::Cleanup),
    }
    assert_eq!(item.state(), state, "helper failed to reach requested state");

    downloader
        .state
        .active
        .lock()
        .await
        .insert(id.to_string(), Arc::clone(&item));
    item
}
