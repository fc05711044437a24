//! AI image job domain - claim, terminal-state and asset queries.
//!
//! Same claim shape as scheduled posts, minus the due-time predicate:
//! jobs become eligible the moment they are queued and are picked up
//! oldest first.

use sqlx::{Executor, Postgres};

use crate::models::AiJob;

/// Atomically claim up to `limit` queued jobs for this worker. A stale
/// running job (expired lock) counts as queued again.
pub async fn claim_queued<'e, E>(
    executor: E,
    limit: i64,
    lock_seconds: i64,
    worker_id: &str,
) -> Result<Vec<AiJob>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, AiJob>(
        r#"
        WITH claimed AS (
            SELECT id
            FROM ai_jobs
            WHERE attempt_count < max_attempts
              AND (
                  (status = 'queued'
                   AND (locked_at IS NULL
                        OR locked_at < NOW() - ($1::text || ' seconds')::interval))
                  OR
                  (status = 'running'
                   AND locked_at < NOW() - ($1::text || ' seconds')::interval)
              )
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        UPDATE ai_jobs j
        SET status = 'running',
            locked_at = NOW(),
            locked_by = $3,
            attempt_count = j.attempt_count + 1
        FROM claimed
        WHERE j.id = claimed.id
        RETURNING j.*
        "#,
    )
    .bind(lock_seconds)
    .bind(limit)
    .bind(worker_id)
    .fetch_all(executor)
    .await
}

pub async fn mark_succeeded<'e, E>(
    executor: E,
    job_id: i64,
    provider_request_id: Option<&str>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE ai_jobs
        SET status = 'succeeded',
            provider_request_id = $2,
            error = NULL,
            locked_at = NULL,
            locked_by = NULL
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(provider_request_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Put a failed job back in the queue for another attempt.
pub async fn requeue_after_failure<'e, E>(
    executor: E,
    job_id: i64,
    error: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE ai_jobs
        SET status = 'queued',
            error = $2,
            locked_at = NULL,
            locked_by = NULL
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(error)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn mark_failed<'e, E>(executor: E, job_id: i64, error: &str) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE ai_jobs
        SET status = 'failed',
            error = $2,
            locked_at = NULL,
            locked_by = NULL
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(error)
    .execute(executor)
    .await?;
    Ok(())
}

/// Record the stored output of a succeeded job.
#[allow(clippy::too_many_arguments)]
pub async fn insert_asset<'e, E>(
    executor: E,
    job_id: i64,
    user_id: i64,
    bucket: &str,
    path: &str,
    mime_type: &str,
    width: i32,
    height: i32,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO ai_assets (job_id, user_id, bucket, path, mime_type, width, height)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(job_id)
    .bind(user_id)
    .bind(bucket)
    .bind(path)
    .bind(mime_type)
    .bind(width)
    .bind(height)
    .fetch_one(executor)
    .await?;
    Ok(row.0)
}
