//! Axum JSON API over the article store.

use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use newsdesk_core::{ArticleFilters, TimeFrame};
use newsdesk_storage::{ArticleStore, StorageError};
use newsdesk_sync::IngestionPipeline;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "newsdesk-web";

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: ArticleStore,
    /// Backs `POST /fetch-news`; the route answers 503 without it.
    pub pipeline: Option<Arc<IngestionPipeline>>,
}

impl AppState {
    pub fn new(store: ArticleStore) -> Self {
        Self {
            store,
            pipeline: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<IngestionPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ArticlesQuery {
    category: Option<String>,
    time_frame: Option<String>,
    limit: Option<u32>,
    #[serde(alias = "offset")]
    skip: Option<u32>,
}

impl ArticlesQuery {
    /// `None` when `timeFrame` is not one of `24h`, `7d`, `30d`, `all`, or
    /// when `limit` falls outside `1..=MAX_PAGE_SIZE`.
    fn into_filters(self) -> Option<ArticleFilters> {
        let time_frame = match self.time_frame.as_deref() {
            None | Some("") => TimeFrame::All,
            Some(value) => TimeFrame::parse(value)?,
        };
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return None;
        }
        Some(ArticleFilters {
            category: self.category.filter(|c| !c.is_empty()),
            time_frame,
            limit: Some(limit),
            offset: self.skip.filter(|&skip| skip > 0),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Views,
    Shares,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/articles", get(list_articles_handler))
        .route("/api/articles/{id}", get(article_detail_handler))
        .route("/api/articles/{id}/view", post(view_handler))
        .route("/api/articles/{id}/share", post(share_handler))
        .route("/fetch-news", post(fetch_news_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "server running");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn list_articles_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ArticlesQuery>, QueryRejection>,
) -> Response {
    let Some(filters) = query.ok().and_then(|Query(q)| q.into_filters()) else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid request");
    };
    match state.store.get_articles(&filters).await {
        Ok(articles) => Json(articles).into_response(),
        Err(err) => server_error("listing articles", err),
    }
}

async fn article_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.store.get_article(id).await {
        Ok(Some(article)) => Json(article).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Article not found"),
        Err(err) => server_error("loading article", err),
    }
}

async fn view_handler(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    bump(&state.store, id, Counter::Views).await
}

async fn share_handler(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    bump(&state.store, id, Counter::Shares).await
}

async fn bump(store: &ArticleStore, id: i64, counter: Counter) -> Response {
    let result = match counter {
        Counter::Views => store.increment_views(id).await,
        Counter::Shares => store.increment_shares(id).await,
    };
    match result {
        Ok(true) => Json(json!({ "success": true })).into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "Article not found"),
        Err(err) => server_error("incrementing counter", err),
    }
}

async fn fetch_news_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(pipeline) = state.pipeline.as_ref() else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "Feed fetching is not configured");
    };
    info!("manual feed fetch requested");
    let summary = pipeline.run().await;
    Json(json!({
        "success": true,
        "message": "Feed fetch completed",
        "added": summary.success_count,
        "duplicates": summary.duplicate_count,
        "errors": summary.error_count,
    }))
    .into_response()
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(action: &str, err: StorageError) -> Response {
    error!(action, error = %err, "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use http_body_util::BodyExt;
    use newsdesk_adapters::{parse_feed, FeedReader, ReadError, RetryingFetcher};
    use newsdesk_core::{to_iso8601, CanonicalArticle, FeedSource, RawFeedDocument};
    use newsdesk_storage::RetryPolicy;
    use newsdesk_sync::FeedRegistry;
    use tower::ServiceExt;

    const TWO_ITEM_FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>t</title><link>https://x.example</link><description>d</description>
  <item><title>One</title><guid>feed-1</guid><pubDate>Tue, 10 Mar 2026 08:30:00 GMT</pubDate></item>
  <item><title>Two</title><guid>feed-2</guid><pubDate>Tue, 10 Mar 2026 09:30:00 GMT</pubDate></item>
</channel></rss>"#;

    struct StaticReader;

    #[async_trait]
    impl FeedReader for StaticReader {
        async fn read_feed(&self, _url: &str) -> Result<RawFeedDocument, ReadError> {
            Ok(parse_feed(TWO_ITEM_FEED.as_bytes())?)
        }
    }

    async fn seeded_state() -> AppState {
        let store = ArticleStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let fresh = to_iso8601(Utc::now() - Duration::hours(1));
        for (guid, category, published_at) in [
            ("fresh-tech", "Technology", fresh.as_str()),
            ("old-tech", "Technology", "2001-01-01T00:00:00.000Z"),
            ("fresh-auto", "Automotive", fresh.as_str()),
        ] {
            store
                .add_article(&CanonicalArticle {
                    guid: guid.to_string(),
                    title: guid.to_string(),
                    description: String::new(),
                    content: None,
                    link: None,
                    published_at: published_at.to_string(),
                    image_url: None,
                    category: category.to_string(),
                })
                .await
                .unwrap();
        }
        AppState::new(store)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn lists_all_articles_as_json() {
        let app = app(seeded_state().await);
        let resp = app.oneshot(get_req("/api/articles")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = body_json(resp).await;
        assert_eq!(body.as_array().unwrap().len(), 3);
        assert!(body[0].get("publishedAt").is_some());
    }

    #[tokio::test]
    async fn filters_by_category_and_time_frame() {
        let app = app(seeded_state().await);
        let resp = app
            .oneshot(get_req("/api/articles?category=Technology&timeFrame=24h"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["guid"], "fresh-tech");
    }

    #[tokio::test]
    async fn unknown_time_frame_is_bad_request() {
        let app = app(seeded_state().await);
        let resp = app
            .oneshot(get_req("/api/articles?timeFrame=forever"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "Invalid request");
    }

    #[tokio::test]
    async fn view_and_share_bump_counters() {
        let state = seeded_state().await;
        let id = state.store.get_articles(&ArticleFilters::default()).await.unwrap()[0].id;
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(post_req(&format!("/api/articles/{id}/view")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["success"], true);

        let resp = app
            .clone()
            .oneshot(post_req(&format!("/api/articles/{id}/share")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(get_req(&format!("/api/articles/{id}")))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["views"], 1);
        assert_eq!(body["shares"], 1);
    }

    #[tokio::test]
    async fn counters_on_missing_article_are_not_found() {
        let app = app(seeded_state().await);
        let resp = app
            .clone()
            .oneshot(post_req("/api/articles/9999/view"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app.oneshot(get_req("/api/articles/9999")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_numeric_id_is_rejected() {
        let app = app(seeded_state().await);
        let resp = app.oneshot(post_req("/api/articles/abc/view")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn skip_and_limit_page_through_results() {
        let app = app(seeded_state().await);
        let resp = app
            .clone()
            .oneshot(get_req("/api/articles?limit=1&skip=2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["guid"], "old-tech");

        let resp = app.oneshot(get_req("/api/articles?skip=3")).await.unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn default_page_is_capped() {
        let store = ArticleStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        for n in 0..25 {
            store
                .add_article(&CanonicalArticle {
                    guid: format!("bulk-{n}"),
                    title: format!("bulk {n}"),
                    description: String::new(),
                    content: None,
                    link: None,
                    published_at: format!("2026-03-10T08:{n:02}:00.000Z"),
                    image_url: None,
                    category: "General".to_string(),
                })
                .await
                .unwrap();
        }
        let app = app(AppState::new(store));

        let resp = app.clone().oneshot(get_req("/api/articles")).await.unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 20);

        let resp = app.oneshot(get_req("/api/articles?limit=100")).await.unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 25);
    }

    #[tokio::test]
    async fn out_of_range_paging_is_bad_request() {
        let app = app(seeded_state().await);
        for uri in [
            "/api/articles?limit=0",
            "/api/articles?limit=101",
            "/api/articles?skip=-1",
            "/api/articles?limit=ten",
        ] {
            let resp = app.clone().oneshot(get_req(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body_json(resp).await["error"], "Invalid request");
        }
    }

    #[tokio::test]
    async fn fetch_news_runs_one_ingestion_pass() {
        let store = ArticleStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let fetcher = RetryingFetcher::new(
            Box::new(StaticReader),
            RetryPolicy {
                max_retries: 0,
                retry_delay: std::time::Duration::ZERO,
            },
        );
        let registry = FeedRegistry {
            sources: vec![FeedSource::new("https://x.example/rss", "Technology")],
        };
        let pipeline = Arc::new(IngestionPipeline::new(registry, fetcher, store.clone()));
        let app = app(AppState::new(store.clone()).with_pipeline(pipeline));

        let resp = app.clone().oneshot(post_req("/fetch-news")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Feed fetch completed");
        assert_eq!(body["added"], 2);
        assert_eq!(store.count_articles().await.unwrap(), 2);

        let resp = app.oneshot(post_req("/fetch-news")).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["added"], 0);
        assert_eq!(body["duplicates"], 2);
    }

    #[tokio::test]
    async fn fetch_news_without_pipeline_is_unavailable() {
        let app = app(seeded_state().await);
        let resp = app.oneshot(post_req("/fetch-news")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(seeded_state().await);
        let resp = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(body_json(resp).await["status"], "ok");
    }
}
