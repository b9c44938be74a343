//! Core domain model for newsdesk: feed sources, raw feed items and canonical articles.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsdesk-core";

/// One feed endpoint to poll, with the category stamped on every article it yields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub url: String,
    pub category: String,
}

impl FeedSource {
    pub fn new(url: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            category: category.into(),
        }
    }
}

/// Loosely-typed item as it comes out of a feed document. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFeedItem {
    pub guid: Option<String>,
    pub link: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub content_encoded: Option<String>,
    /// RSS `pubDate`, unparsed.
    pub pub_date: Option<String>,
    /// Atom `published`/`updated`, unparsed.
    pub iso_date: Option<String>,
    /// Media enclosure URL (`media:content@url` or an image enclosure).
    pub media_url: Option<String>,
}

/// Parsed feed document, items kept in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFeedDocument {
    pub title: Option<String>,
    pub items: Vec<RawFeedItem>,
}

/// Normalized, storage-ready article. `guid` is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalArticle {
    pub guid: String,
    pub title: String,
    pub description: String,
    pub content: Option<String>,
    pub link: Option<String>,
    /// ISO-8601, UTC, millisecond precision.
    pub published_at: String,
    pub image_url: Option<String>,
    pub category: String,
}

/// Persisted article row including engagement counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredArticle {
    pub id: i64,
    pub guid: String,
    pub title: String,
    pub description: Option<String>,
    pub content: Option<String>,
    pub link: Option<String>,
    pub published_at: String,
    pub image_url: Option<String>,
    pub category: String,
    pub views: i64,
    pub shares: i64,
    pub created_at: String,
}

/// Publication window accepted by the listing API as `24h`, `7d`, `30d` or `all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeFrame {
    Last24Hours,
    Last7Days,
    Last30Days,
    #[default]
    All,
}

impl TimeFrame {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "24h" => Some(Self::Last24Hours),
            "7d" => Some(Self::Last7Days),
            "30d" => Some(Self::Last30Days),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// Earliest publication instant still inside the window, `None` for `All`.
    pub fn threshold(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Last24Hours => Some(now - Duration::hours(24)),
            Self::Last7Days => Some(now - Duration::days(7)),
            Self::Last30Days => Some(now - Duration::days(30)),
            Self::All => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticleFilters {
    pub category: Option<String>,
    pub time_frame: TimeFrame,
    pub limit: Option<u32>,
    /// Rows to skip after ordering.
    pub offset: Option<u32>,
}

/// Outcome of one ingestion pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds_total: usize,
    pub feeds_failed: usize,
    /// Newly inserted articles.
    pub success_count: usize,
    /// Failed feeds + malformed items + storage failures.
    pub error_count: usize,
    /// Items ignored because their guid was already stored.
    pub duplicate_count: usize,
}

/// Serialize a timestamp the way stored `published_at` values are written.
pub fn to_iso8601(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
