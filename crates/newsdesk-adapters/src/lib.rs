//! Feed readers, retrying fetch and article normalization.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use newsdesk_core::{to_iso8601, CanonicalArticle, RawFeedDocument, RawFeedItem};
use newsdesk_storage::{HttpError, HttpFetcher, RetryPolicy};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "newsdesk-adapters";

static TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag pattern compiles"));

static IMG_SRC_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<img[^>]+src\s*=\s*["']([^"'>]+)["']"#).expect("img pattern compiles")
});

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document is neither RSS ({rss}) nor Atom ({atom})")]
    Unrecognized { rss: String, atom: String },
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Feed could not be fetched and parsed within the retry budget.
#[derive(Debug, Error)]
#[error("fetching {url} failed after {attempts} attempts: {source}")]
pub struct FetchError {
    pub url: String,
    pub attempts: usize,
    #[source]
    pub source: ReadError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedItemError {
    #[error("item has neither guid nor link")]
    MissingIdentifier,
    #[error("item {guid} has no publication date")]
    MissingDate { guid: String },
    #[error("item {guid} has unparseable publication date {value:?}")]
    InvalidDate { guid: String, value: String },
}

/// One fetch-and-parse attempt against a feed URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedReader: Send + Sync {
    async fn read_feed(&self, url: &str) -> Result<RawFeedDocument, ReadError>;
}

/// HTTP GET followed by RSS/Atom parsing.
#[derive(Debug, Clone)]
pub struct HttpFeedReader {
    http: HttpFetcher,
}

impl HttpFeedReader {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl FeedReader for HttpFeedReader {
    async fn read_feed(&self, url: &str) -> Result<RawFeedDocument, ReadError> {
        let body = self.http.fetch_bytes(url).await?;
        debug!(url, bytes = body.len(), "feed downloaded");
        Ok(parse_feed(&body)?)
    }
}

/// Wraps a [`FeedReader`] with a fixed-delay bounded retry loop.
///
/// Holds no mutable state, so concurrent fetches of different URLs do not
/// interfere with each other.
pub struct RetryingFetcher {
    reader: Box<dyn FeedReader>,
    policy: RetryPolicy,
}

impl RetryingFetcher {
    pub fn new(reader: Box<dyn FeedReader>, policy: RetryPolicy) -> Self {
        Self { reader, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn fetch(&self, url: &str) -> Result<RawFeedDocument, FetchError> {
        let mut remaining = self.policy.max_retries;
        let mut attempts = 0usize;

        loop {
            attempts += 1;
            match self.reader.read_feed(url).await {
                Ok(document) => return Ok(document),
                Err(err) if remaining > 0 => {
                    warn!(url, remaining, error = %err, "retrying feed fetch");
                    tokio::time::sleep(self.policy.retry_delay).await;
                    remaining -= 1;
                }
                Err(err) => {
                    return Err(FetchError {
                        url: url.to_string(),
                        attempts,
                        source: err,
                    })
                }
            }
        }
    }
}

/// Parse a feed body as RSS 2.0, falling back to Atom.
pub fn parse_feed(bytes: &[u8]) -> Result<RawFeedDocument, ParseError> {
    let rss_err = match rss::Channel::read_from(bytes) {
        Ok(channel) => return Ok(rss_channel_to_document(&channel)),
        Err(err) => err.to_string(),
    };
    match atom_syndication::Feed::read_from(bytes) {
        Ok(feed) => Ok(atom_feed_to_document(&feed)),
        Err(err) => Err(ParseError::Unrecognized {
            rss: rss_err,
            atom: err.to_string(),
        }),
    }
}

fn rss_channel_to_document(channel: &rss::Channel) -> RawFeedDocument {
    RawFeedDocument {
        title: Some(channel.title().to_string()).filter(|t| !t.is_empty()),
        items: channel.items().iter().map(rss_item_to_raw).collect(),
    }
}

fn rss_item_to_raw(item: &rss::Item) -> RawFeedItem {
    let media_content = item
        .extensions()
        .get("media")
        .and_then(|ns| ns.get("content"))
        .and_then(|contents| contents.iter().find_map(|ext| ext.attrs().get("url").cloned()));
    let image_enclosure = item
        .enclosure()
        .filter(|enc| enc.mime_type().starts_with("image/"))
        .map(|enc| enc.url().to_string());

    // content:encoded replaces the description as body when the item has one
    let content = item.content().or(item.description());

    RawFeedItem {
        guid: item.guid().map(|g| g.value().to_string()),
        link: item.link().map(ToString::to_string),
        title: item.title().map(ToString::to_string),
        description: item.description().map(ToString::to_string),
        content: content.map(ToString::to_string),
        content_encoded: item.content().map(ToString::to_string),
        pub_date: item.pub_date().map(ToString::to_string),
        iso_date: None,
        media_url: media_content.or(image_enclosure),
    }
}

fn atom_feed_to_document(feed: &atom_syndication::Feed) -> RawFeedDocument {
    RawFeedDocument {
        title: Some(feed.title().value.clone()).filter(|t| !t.is_empty()),
        items: feed.entries().iter().map(atom_entry_to_raw).collect(),
    }
}

fn atom_entry_to_raw(entry: &atom_syndication::Entry) -> RawFeedItem {
    let link = entry
        .links()
        .iter()
        .find(|l| l.rel() == "alternate")
        .or_else(|| entry.links().first())
        .map(|l| l.href().to_string());
    let media_url = entry
        .links()
        .iter()
        .find(|l| {
            l.rel() == "enclosure" && l.mime_type().is_some_and(|m| m.starts_with("image/"))
        })
        .map(|l| l.href().to_string());
    let published = entry.published().copied().unwrap_or(*entry.updated());

    RawFeedItem {
        guid: Some(entry.id().to_string()).filter(|id| !id.is_empty()),
        link,
        title: Some(entry.title().value.clone()),
        description: entry.summary().map(|s| s.value.clone()),
        content: entry.content().and_then(|c| c.value()).map(ToString::to_string),
        content_encoded: None,
        pub_date: None,
        iso_date: Some(published.to_rfc3339()),
        media_url,
    }
}

/// Map a raw item to the storage shape, stamping `category` from its feed.
pub fn normalize(item: &RawFeedItem, category: &str) -> Result<CanonicalArticle, MalformedItemError> {
    let guid = non_blank(&item.guid)
        .or_else(|| non_blank(&item.link))
        .ok_or(MalformedItemError::MissingIdentifier)?
        .to_string();

    let raw_date = non_blank(&item.pub_date)
        .or_else(|| non_blank(&item.iso_date))
        .ok_or_else(|| MalformedItemError::MissingDate { guid: guid.clone() })?;
    let published_at = parse_timestamp(raw_date).ok_or_else(|| MalformedItemError::InvalidDate {
        guid: guid.clone(),
        value: raw_date.to_string(),
    })?;

    let content = item.content.clone().or_else(|| item.content_encoded.clone());
    let image_url = non_blank(&item.media_url)
        .map(ToString::to_string)
        .or_else(|| content.as_deref().and_then(first_img_src));

    Ok(CanonicalArticle {
        guid,
        title: item.title.clone().unwrap_or_default(),
        description: item.description.as_deref().map(strip_tags).unwrap_or_default(),
        content,
        link: item.link.clone(),
        published_at: to_iso8601(published_at),
        image_url,
        category: category.to_string(),
    })
}

/// Drop every `<...>` tag. Entities are left untouched.
pub fn strip_tags(html: &str) -> String {
    TAG_PATTERN.replace_all(html, "").into_owned()
}

pub fn first_img_src(html: &str) -> Option<String> {
    IMG_SRC_PATTERN
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// RFC 2822 (RSS `pubDate`) first, then RFC 3339 (Atom). Timestamps without
/// any zone are read as UTC; named zones such as `CET` are rejected.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let zoned = DateTime::parse_from_rfc2822(value).or_else(|_| DateTime::parse_from_rfc3339(value));
    if let Ok(ts) = zoned {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// The value as given, unless it is missing or whitespace only.
fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}
