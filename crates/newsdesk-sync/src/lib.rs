//! Feed ingestion orchestration: registry, config, one-pass runner and scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use newsdesk_adapters::{normalize, FetchError, HttpFeedReader, RetryingFetcher};
use newsdesk_core::{FeedSource, IngestionSummary};
use newsdesk_storage::{ArticleStore, HttpClientConfig, HttpFetcher, RetryPolicy};
use serde::Deserialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsdesk-sync";

/// Ordered list of feeds to poll. Order here is processing order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedRegistry {
    pub sources: Vec<FeedSource>,
}

impl FeedRegistry {
    pub fn builtin() -> Self {
        Self {
            sources: vec![
                FeedSource::new("https://rss.app/feeds/MLuDKqkwFtd2tuMr.xml", "Technology"),
                FeedSource::new("https://www.autobild.de/rss/22590661.xml", "Automotive"),
                FeedSource::new("https://rss.app/feed/AY3gpY8fWOkfCCWR", "General"),
            ],
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sources_file: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://news.db?mode=rwc".to_string()),
            sources_file: std::env::var("NEWSDESK_SOURCES_FILE")
                .ok()
                .map(PathBuf::from)
                .or_else(|| default_sources_file(Path::new("."))),
            retry: RetryPolicy {
                max_retries: std::env::var("NEWSDESK_MAX_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.max_retries),
                retry_delay: std::env::var("NEWSDESK_RETRY_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry_delay),
            },
            scheduler_enabled: std::env::var("NEWSDESK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            sync_cron: std::env::var("NEWSDESK_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            user_agent: std::env::var("NEWSDESK_USER_AGENT")
                .unwrap_or_else(|_| "newsdesk/0.1".to_string()),
            http_timeout_secs: std::env::var("NEWSDESK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    /// `sources_file` when set, otherwise the built-in feed list.
    pub async fn load_registry(&self) -> Result<FeedRegistry> {
        match &self.sources_file {
            Some(path) => FeedRegistry::load(path).await,
            None => Ok(FeedRegistry::builtin()),
        }
    }
}

/// `sources.yaml` under `dir`, if present.
pub fn default_sources_file(dir: &Path) -> Option<PathBuf> {
    let path = dir.join("sources.yaml");
    path.is_file().then_some(path)
}

#[derive(Debug, Default)]
struct Tally {
    feeds_failed: usize,
    success_count: usize,
    error_count: usize,
    duplicate_count: usize,
}

/// Fetch → normalize → store, one feed at a time in registry order.
pub struct IngestionPipeline {
    registry: FeedRegistry,
    fetcher: RetryingFetcher,
    store: ArticleStore,
}

impl IngestionPipeline {
    pub fn new(registry: FeedRegistry, fetcher: RetryingFetcher, store: ArticleStore) -> Self {
        Self {
            registry,
            fetcher,
            store,
        }
    }

    pub async fn from_config(config: &SyncConfig, store: ArticleStore) -> Result<Self> {
        let registry = config.load_registry().await?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let fetcher = RetryingFetcher::new(Box::new(HttpFeedReader::new(http)), config.retry);
        Ok(Self::new(registry, fetcher, store))
    }

    pub fn registry(&self) -> &FeedRegistry {
        &self.registry
    }

    /// Run one full pass. Never fails: feed, item and storage errors are
    /// logged and folded into `error_count`.
    pub async fn run(&self) -> IngestionSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingestion_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> IngestionSummary {
        let started_at = Utc::now();
        let mut tally = Tally::default();

        for source in &self.registry.sources {
            info!(url = %source.url, category = %source.category, "fetching feed");
            if let Err(err) = self.ingest_feed(source, &mut tally).await {
                tally.feeds_failed += 1;
                tally.error_count += 1;
                error!(url = %source.url, attempts = err.attempts, error = %err, "feed failed");
            }
        }

        info!(
            added = tally.success_count,
            duplicates = tally.duplicate_count,
            errors = tally.error_count,
            feeds_failed = tally.feeds_failed,
            "feed update completed"
        );

        IngestionSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            feeds_total: self.registry.sources.len(),
            feeds_failed: tally.feeds_failed,
            success_count: tally.success_count,
            error_count: tally.error_count,
            duplicate_count: tally.duplicate_count,
        }
    }

    async fn ingest_feed(&self, source: &FeedSource, tally: &mut Tally) -> Result<(), FetchError> {
        let document = self.fetcher.fetch(&source.url).await?;

        for item in &document.items {
            let article = match normalize(item, &source.category) {
                Ok(article) => article,
                Err(err) => {
                    tally.error_count += 1;
                    error!(url = %source.url, error = %err, "skipping malformed item");
                    continue;
                }
            };

            match self.store.add_article(&article).await {
                Ok(true) => tally.success_count += 1,
                Ok(false) => tally.duplicate_count += 1,
                Err(err) => {
                    tally.error_count += 1;
                    error!(url = %source.url, guid = %article.guid, error = %err, "storing article failed");
                }
            }
        }
        Ok(())
    }
}

/// Cron scheduler that triggers `pipeline.run()`; `None` when disabled.
pub async fn build_scheduler(
    pipeline: Arc<IngestionPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            info!("running scheduled feed update");
            pipeline.run().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn open_store(config: &SyncConfig) -> Result<ArticleStore> {
    let store = ArticleStore::connect(&config.database_url).await?;
    store.migrate().await.context("migrating article schema")?;
    Ok(store)
}

pub async fn run_sync_once(config: &SyncConfig) -> Result<IngestionSummary> {
    let store = open_store(config).await?;
    let pipeline = IngestionPipeline::from_config(config, store).await?;
    Ok(pipeline.run().await)
}
