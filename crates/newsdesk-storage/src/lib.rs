//! SQLite article store + HTTP fetch utilities for newsdesk.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use newsdesk_core::{to_iso8601, ArticleFilters, CanonicalArticle, StoredArticle};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "newsdesk-storage";

const ARTICLE_COLUMNS: &str = "id, guid, title, description, content, link, published_at, \
     image_url, category, views, shares, created_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Article repository backed by a SQLite pool.
///
/// `guid` carries a UNIQUE constraint; the constraint violation surfaced by
/// SQLite is what makes [`ArticleStore::add_article`] insert-if-absent.
#[derive(Debug, Clone)]
pub struct ArticleStore {
    pool: SqlitePool,
}

impl ArticleStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database. The connection is never recycled,
    /// otherwise the data would vanish with it.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("building in-memory sqlite options")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("opening in-memory sqlite")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                guid TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                description TEXT,
                content TEXT,
                link TEXT,
                published_at TEXT NOT NULL,
                image_url TEXT,
                category TEXT NOT NULL,
                views INTEGER NOT NULL DEFAULT 0,
                shares INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_published_at ON articles(published_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_category ON articles(category)")
            .execute(&self.pool)
            .await?;

        info!("article schema ready");
        Ok(())
    }

    /// Insert the article unless its guid is already stored.
    ///
    /// Returns `Ok(true)` for a new row and `Ok(false)` when the unique
    /// constraint on `guid` rejected the insert. The existing row, counters
    /// included, is left untouched.
    pub async fn add_article(&self, article: &CanonicalArticle) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO articles
                (guid, title, description, content, link, published_at, image_url, category)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&article.guid)
        .bind(&article.title)
        .bind(&article.description)
        .bind(&article.content)
        .bind(&article.link)
        .bind(&article.published_at)
        .bind(&article.image_url)
        .bind(&article.category)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                debug!(guid = %article.guid, "article already stored");
                Ok(false)
            }
            Err(err) => Err(StorageError::Database(err)),
        }
    }

    /// Returns `false` when no article has this id.
    pub async fn increment_views(&self, id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE articles SET views = views + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns `false` when no article has this id.
    pub async fn increment_shares(&self, id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE articles SET shares = shares + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_article(&self, id: i64) -> Result<Option<StoredArticle>, StorageError> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| article_from_row(&r)).transpose().map_err(Into::into)
    }

    pub async fn get_articles(
        &self,
        filters: &ArticleFilters,
    ) -> Result<Vec<StoredArticle>, StorageError> {
        self.get_articles_at(filters, Utc::now()).await
    }

    /// Filtered listing, newest first, with the time window anchored at `now`.
    pub async fn get_articles_at(
        &self,
        filters: &ArticleFilters,
        now: DateTime<Utc>,
    ) -> Result<Vec<StoredArticle>, StorageError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE 1 = 1"));

        if let Some(category) = filters.category.as_deref().filter(|c| !c.is_empty()) {
            qb.push(" AND category = ").push_bind(category.to_string());
        }
        if let Some(threshold) = filters.time_frame.threshold(now) {
            // published_at is stored as fixed-width UTC ISO-8601, so text order is time order.
            qb.push(" AND published_at >= ").push_bind(to_iso8601(threshold));
        }
        qb.push(" ORDER BY published_at DESC, id DESC");
        // SQLite only accepts OFFSET after a LIMIT; -1 means unbounded.
        if filters.limit.is_some() || filters.offset.is_some() {
            let limit = filters.limit.map_or(-1, i64::from);
            qb.push(" LIMIT ").push_bind(limit);
        }
        if let Some(offset) = filters.offset {
            qb.push(" OFFSET ").push_bind(i64::from(offset));
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(article_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub async fn count_articles(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

fn article_from_row(row: &SqliteRow) -> Result<StoredArticle, sqlx::Error> {
    Ok(StoredArticle {
        id: row.try_get("id")?,
        guid: row.try_get("guid")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        content: row.try_get("content")?,
        link: row.try_get("link")?,
        published_at: row.try_get("published_at")?,
        image_url: row.try_get("image_url")?,
        category: row.try_get("category")?,
        views: row.try_get("views")?,
        shares: row.try_get("shares")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Fixed-delay retry budget. `max_retries` counts retries, not attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt GET client. Retrying is left to the caller.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, HttpError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();

        if !status.is_success() {
            return Err(HttpError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        if resp.url().as_str() != url {
            debug!(url, final_url = %resp.url(), "feed request redirected");
        }
        Ok(resp.bytes().await?.to_vec())
    }
}
