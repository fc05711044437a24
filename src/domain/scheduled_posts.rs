//! Scheduled post domain - claim and terminal-state queries.
//!
//! The claim is the single concurrency primitive: one atomic CTE update
//! with `FOR UPDATE SKIP LOCKED`, so two workers racing it can never
//! receive the same row. Everything after the claim is a single-row
//! update keyed by id.

use sqlx::{Executor, Postgres};

use crate::models::ScheduledPost;

/// Credentials for a connected account, as needed to publish.
#[derive(Debug, sqlx::FromRow)]
pub struct AccountCreds {
    pub did: String,
    pub handle: String,
    pub app_password: String,
    pub service_url: Option<String>,
}

/// Atomically claim up to `limit` due posts for this worker.
///
/// Eligible rows are due, under the attempt cap, and either queued and
/// unlocked, or holding a lock older than `lock_seconds` in either the
/// queued or posting state (a crashed worker's leftovers). The claim
/// also counts the attempt, so a crash mid-processing still consumes one.
pub async fn claim_due<'e, E>(
    executor: E,
    limit: i64,
    lock_seconds: i64,
    worker_id: &str,
) -> Result<Vec<ScheduledPost>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        WITH claimed AS (
            SELECT id
            FROM scheduled_posts
            WHERE run_at <= NOW()
              AND attempt_count < max_attempts
              AND (
                  (status = 'queued'
                   AND (locked_at IS NULL
                        OR locked_at < NOW() - ($1::text || ' seconds')::interval))
                  OR
                  (status = 'posting'
                   AND locked_at < NOW() - ($1::text || ' seconds')::interval)
              )
            ORDER BY run_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        UPDATE scheduled_posts p
        SET status = 'posting',
            locked_at = NOW(),
            locked_by = $3,
            attempt_count = p.attempt_count + 1
        FROM claimed
        WHERE p.id = claimed.id
        RETURNING p.*
        "#,
    )
    .bind(lock_seconds)
    .bind(limit)
    .bind(worker_id)
    .fetch_all(executor)
    .await
}

/// Finalize a successful publish: record the post reference, clear the
/// lock and any stale error.
pub async fn mark_posted<'e, E>(
    executor: E,
    post_id: i64,
    uri: &str,
    cid: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE scheduled_posts
        SET status = 'posted',
            posted_uri = $2,
            posted_cid = $3,
            last_error = NULL,
            locked_at = NULL,
            locked_by = NULL
        WHERE id = $1
        "#,
    )
    .bind(post_id)
    .bind(uri)
    .bind(cid)
    .execute(executor)
    .await?;
    Ok(())
}

/// Record a retryable failure: back to queued with the lock cleared, so
/// the row is eligible again on the next poll.
pub async fn requeue_after_failure<'e, E>(
    executor: E,
    post_id: i64,
    error: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE scheduled_posts
        SET status = 'queued',
            last_error = $2,
            locked_at = NULL,
            locked_by = NULL
        WHERE id = $1
        "#,
    )
    .bind(post_id)
    .bind(error)
    .execute(executor)
    .await?;
    Ok(())
}

/// Record a terminal failure after retries are exhausted.
pub async fn mark_failed<'e, E>(
    executor: E,
    post_id: i64,
    error: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE scheduled_posts
        SET status = 'failed',
            last_error = $2,
            locked_at = NULL,
            locked_by = NULL
        WHERE id = $1
        "#,
    )
    .bind(post_id)
    .bind(error)
    .execute(executor)
    .await?;
    Ok(())
}

/// Record a permanent precondition failure (e.g. the connected account is
/// gone). Forces the attempt counter to the cap so the row can never be
/// retried, even by an external requeue.
pub async fn mark_failed_permanent<'e, E>(
    executor: E,
    post_id: i64,
    error: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE scheduled_posts
        SET status = 'failed',
            attempt_count = max_attempts,
            last_error = $2,
            locked_at = NULL,
            locked_by = NULL
        WHERE id = $1
        "#,
    )
    .bind(post_id)
    .bind(error)
    .execute(executor)
    .await?;
    Ok(())
}

/// Fetch the draft text to publish (collaborator-owned table).
pub async fn get_draft_text<'e, E>(
    executor: E,
    draft_id: i64,
) -> Result<Option<String>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT text FROM drafts WHERE id = $1")
        .bind(draft_id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|r| r.0))
}

/// Fetch credentials for a connected account (collaborator-owned table).
pub async fn get_account<'e, E>(
    executor: E,
    account_id: i64,
) -> Result<Option<AccountCreds>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT did, handle, app_password, service_url
        FROM accounts WHERE id = $1
        "#,
    )
    .bind(account_id)
    .fetch_optional(executor)
    .await
}
