//! Shared data models used across modules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One pending or attempted publish of a draft to a connected account.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduledPost {
    pub id: i64,
    pub user_id: i64,
    /// Absent when the connected account was removed after scheduling;
    /// a permanent, non-retryable condition.
    pub account_id: Option<i64>,
    pub draft_id: i64,
    pub run_at: DateTime<Utc>,
    pub status: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub posted_uri: Option<String>,
    pub posted_cid: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One request to generate an image from a prompt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AiJob {
    pub id: i64,
    pub user_id: i64,
    pub model_id: String,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    /// Free-form generation options: width/height or a "WxH" size string,
    /// steps, guidance.
    pub params: serde_json::Value,
    pub status: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub error: Option<String>,
    pub provider_request_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A denormalized, searchable copy of one network post, keyed by uri.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IndexedPost {
    pub uri: String,
    pub author_did: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub lang: Option<String>,
}
