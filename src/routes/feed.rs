//! Feed generator endpoints - skeleton pages, generator metadata, and
//! the did:web identity document.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::AppState;
use crate::constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::domain::{feeds, indexed_posts};
use crate::models::IndexedPost;
use crate::services::error::LogErr;
use crate::skeleton;

// How deep to read raw candidates per fetch while filling a page.
const MAX_FETCH_CHUNK: i64 = 300;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/xrpc/app.bsky.feed.getFeedSkeleton",
            get(get_feed_skeleton),
        )
        .route(
            "/xrpc/app.bsky.feed.describeFeedGenerator",
            get(describe_feed_generator),
        )
        .route("/.well-known/did.json", get(did_document))
}

#[derive(Debug, Deserialize)]
pub struct SkeletonQuery {
    pub feed: String,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SkeletonResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub feed: Vec<SkeletonItem>,
}

#[derive(Debug, Serialize)]
pub struct SkeletonItem {
    pub post: String,
}

/// GET /xrpc/app.bsky.feed.getFeedSkeleton - One page of post uris
async fn get_feed_skeleton(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SkeletonQuery>,
) -> Result<Json<SkeletonResponse>, StatusCode> {
    let slug = feed_slug(&query.feed).ok_or(StatusCode::BAD_REQUEST)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let cursor = match &query.cursor {
        Some(c) => Some(skeleton::decode_cursor(c).ok_or(StatusCode::BAD_REQUEST)?),
        None => None,
    };

    let feed = feeds::get_enabled_by_slug(&state.db, &slug)
        .await
        .log_500("Failed to load feed")?
        .ok_or(StatusCode::NOT_FOUND)?;

    let chunk = (limit * 3).min(MAX_FETCH_CHUNK);
    let lang = feed.lang.as_deref();

    // Source path: keyword rules over the enrolled authors, or over the
    // whole index when the feed has no enrolled sources.
    let mut sourced: Vec<IndexedPost> = Vec::new();
    let source_dids = feeds::get_sources(&state.db, feed.id)
        .await
        .log_500("Failed to load feed sources")?;
    let authors = author_filter(&source_dids);
    let mut pos = cursor.clone();
    loop {
        let pos_ref = pos.as_ref().map(|(at, uri)| (*at, uri.as_str()));
        let page = indexed_posts::page_by_authors(&state.db, authors, lang, pos_ref, chunk)
            .await
            .log_500("Failed to page feed sources")?;
        let exhausted = (page.len() as i64) < chunk;
        let last = page.last().map(|p| (p.created_at, p.uri.clone()));
        sourced.extend(
            page.into_iter()
                .filter(|p| skeleton::passes_filters(&feed, &p.text)),
        );
        if sourced.len() as i64 >= limit || exhausted {
            break;
        }
        pos = last;
    }

    // Submission path: tagged posts from anyone, gated only by excludes.
    let mut submitted: Vec<IndexedPost> = Vec::new();
    if feed.submission_enabled {
        if let Some(tag) = feed.submission_tag.clone() {
            let mut pos = cursor.clone();
            loop {
                let pos_ref = pos.as_ref().map(|(at, uri)| (*at, uri.as_str()));
                let page = indexed_posts::page_with_tag(&state.db, &tag, lang, pos_ref, chunk)
                    .await
                    .log_500("Failed to page submissions")?;
                let exhausted = (page.len() as i64) < chunk;
                let last = page.last().map(|p| (p.created_at, p.uri.clone()));
                submitted.extend(page.into_iter().filter(|p| {
                    skeleton::has_hashtag(&p.text, &tag) && skeleton::passes_excludes(&feed, &p.text)
                }));
                if submitted.len() as i64 >= limit || exhausted {
                    break;
                }
                pos = last;
            }
        }
    }

    let merged = skeleton::merge_posts(sourced, submitted);
    let page: Vec<IndexedPost> = merged.into_iter().take(limit as usize).collect();
    // A trailing cursor past the end just produces one empty page.
    let next_cursor = page
        .last()
        .map(|p| skeleton::encode_cursor(p.created_at, &p.uri));

    Ok(Json(SkeletonResponse {
        cursor: next_cursor,
        feed: page
            .into_iter()
            .map(|p| SkeletonItem { post: p.uri })
            .collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct DescribeResponse {
    pub did: String,
    pub feeds: Vec<DescribedFeed>,
}

#[derive(Debug, Serialize)]
pub struct DescribedFeed {
    pub uri: String,
}

/// GET /xrpc/app.bsky.feed.describeFeedGenerator - Advertise the feeds
/// this service answers for
async fn describe_feed_generator(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DescribeResponse>, StatusCode> {
    let slugs = feeds::list_enabled_slugs(&state.db)
        .await
        .log_500("Failed to list feeds")?;
    Ok(Json(DescribeResponse {
        did: state.service_did.clone(),
        feeds: slugs
            .into_iter()
            .map(|slug| DescribedFeed {
                uri: format!(
                    "at://{}/app.bsky.feed.generator/{}",
                    state.publisher_did, slug
                ),
            })
            .collect(),
    }))
}

/// GET /.well-known/did.json - did:web identity document
async fn did_document(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": state.service_did,
        "service": [{
            "id": "#bsky_fg",
            "type": "BskyFeedGenerator",
            "serviceEndpoint": format!("https://{}", state.hostname),
        }]
    }))
}

/// Author restriction for the source path. An empty enrollment list
/// means no restriction, not an empty feed.
fn author_filter(source_dids: &[String]) -> Option<&[String]> {
    if source_dids.is_empty() {
        None
    } else {
        Some(source_dids)
    }
}

/// Extract and validate the slug from a feed reference. Accepts either a
/// full at:// generator uri or a bare slug.
fn feed_slug(feed: &str) -> Option<String> {
    let slug = if feed.starts_with("at://") {
        feed.rsplit('/').next()?
    } else {
        feed
    };
    if slug.is_empty()
        || !slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return None;
    }
    Some(slug.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_list_means_no_author_restriction() {
        assert_eq!(author_filter(&[]), None);
        let dids = vec!["did:plc:abc".to_string()];
        assert_eq!(author_filter(&dids), Some(dids.as_slice()));
    }

    #[test]
    fn test_feed_slug() {
        assert_eq!(
            feed_slug("at://did:plc:abc/app.bsky.feed.generator/rust-news"),
            Some("rust-news".to_string())
        );
        assert_eq!(feed_slug("rust_news"), Some("rust_news".to_string()));
        assert_eq!(feed_slug("at://did:plc:abc/app.bsky.feed.generator/"), None);
        assert_eq!(feed_slug("bad slug"), None);
        assert_eq!(feed_slug(""), None);
        assert_eq!(feed_slug("dots.not.allowed"), None);
    }
}
