//! Bluesky client - the network boundary for publishing and reads.
//!
//! Covers the five capabilities skypost consumes: app-password session
//! creation, posting a record, reading an author feed, searching recent
//! mentions, and resolving a handle to a DID. Everything else on the
//! network side (likes, follows, moderation) is out of scope.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct BskyClient {
    service_url: String,
    http: Client,
}

impl BskyClient {
    pub fn new(service_url: &str) -> Self {
        Self {
            service_url: service_url.trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    /// Authenticate with an app password, yielding a short-lived session.
    /// Sessions are created per publish; skypost does not refresh them.
    pub async fn create_session(
        &self,
        identifier: &str,
        app_password: &str,
    ) -> Result<Session, BskyError> {
        let url = format!("{}/xrpc/com.atproto.server.createSession", self.service_url);

        let body = serde_json::json!({
            "identifier": identifier,
            "password": app_password,
        });

        let resp = self.http.post(&url).json(&body).send().await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(BskyError::Api(text));
        }

        let session: Session = resp.json().await?;
        Ok(session)
    }

    /// Publish a text post to the session's repo.
    ///
    /// Returns the at:// uri and cid of the created record.
    pub async fn create_post(
        &self,
        session: &Session,
        text: &str,
    ) -> Result<PostRef, BskyError> {
        let url = format!("{}/xrpc/com.atproto.repo.createRecord", self.service_url);

        let body = serde_json::json!({
            "repo": session.did,
            "collection": "app.bsky.feed.post",
            "record": {
                "$type": "app.bsky.feed.post",
                "text": text,
                "createdAt": Utc::now().to_rfc3339(),
            }
        });

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", session.access_jwt))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(BskyError::Api(text));
        }

        let post_ref: PostRef = resp.json().await?;
        Ok(post_ref)
    }

    /// Fetch an account's recent posts (public endpoint, no session).
    pub async fn get_author_feed(
        &self,
        actor: &str,
        limit: i64,
    ) -> Result<Vec<NetworkPost>, BskyError> {
        let url = format!(
            "{}/xrpc/app.bsky.feed.getAuthorFeed?actor={}&limit={}&filter=posts_no_replies",
            self.service_url,
            percent_encode(actor),
            limit
        );

        let resp = self.http.get(&url).send().await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(BskyError::Api(text));
        }

        let wrapper: AuthorFeedResponse = resp.json().await?;
        Ok(wrapper
            .feed
            .into_iter()
            .map(|item| item.post.into_network_post())
            .collect())
    }

    /// Search recent posts mentioning the given handle.
    pub async fn search_mentions(
        &self,
        handle: &str,
        limit: i64,
    ) -> Result<Vec<NetworkPost>, BskyError> {
        let url = format!(
            "{}/xrpc/app.bsky.feed.searchPosts?q={}&limit={}&sort=latest",
            self.service_url,
            percent_encode(&format!("@{}", handle)),
            limit
        );

        let resp = self.http.get(&url).send().await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(BskyError::Api(text));
        }

        let wrapper: SearchPostsResponse = resp.json().await?;
        Ok(wrapper
            .posts
            .into_iter()
            .map(|p| p.into_network_post())
            .collect())
    }

    /// Resolve a handle to its DID.
    pub async fn resolve_handle(&self, handle: &str) -> Result<String, BskyError> {
        let url = format!(
            "{}/xrpc/com.atproto.identity.resolveHandle?handle={}",
            self.service_url,
            percent_encode(handle)
        );

        let resp = self.http.get(&url).send().await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(BskyError::Api(text));
        }

        let wrapper: ResolveHandleResponse = resp.json().await?;
        Ok(wrapper.did)
    }
}

fn percent_encode(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Session {
    pub did: String,
    #[serde(rename = "accessJwt")]
    pub access_jwt: String,
    pub handle: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostRef {
    pub uri: String,
    pub cid: String,
}

/// A post as read back from the network, flattened for indexing.
#[derive(Debug, Clone)]
pub struct NetworkPost {
    pub uri: String,
    pub author_did: String,
    pub author_handle: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub lang: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorFeedResponse {
    feed: Vec<FeedItem>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    post: PostView,
}

#[derive(Debug, Deserialize)]
struct SearchPostsResponse {
    posts: Vec<PostView>,
}

#[derive(Debug, Deserialize)]
struct PostView {
    uri: String,
    author: AuthorView,
    record: PostRecord,
}

#[derive(Debug, Deserialize)]
struct AuthorView {
    did: String,
    handle: String,
}

#[derive(Debug, Deserialize)]
struct PostRecord {
    #[serde(default)]
    text: String,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
    #[serde(default)]
    langs: Option<Vec<String>>,
}

impl PostView {
    fn into_network_post(self) -> NetworkPost {
        NetworkPost {
            uri: self.uri,
            author_did: self.author.did,
            author_handle: self.author.handle,
            text: self.record.text,
            created_at: self.record.created_at,
            lang: self.record.langs.and_then(|l| l.into_iter().next()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

#[derive(Debug)]
pub enum BskyError {
    Http(reqwest::Error),
    Api(String),
}

impl From<reqwest::Error> for BskyError {
    fn from(e: reqwest::Error) -> Self {
        BskyError::Http(e)
    }
}

impl std::fmt::Display for BskyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BskyError::Http(e) => write!(f, "HTTP error: {}", e),
            BskyError::Api(s) => write!(f, "Bluesky API error: {}", s),
        }
    }
}

impl std::error::Error for BskyError {}
