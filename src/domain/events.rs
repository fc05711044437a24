//! Append-only event log and worker heartbeats.

use sqlx::{Executor, Postgres};

/// Append one event. Failures here are logged by callers and never abort
/// the operation being recorded.
pub async fn record_event<'e, E>(
    executor: E,
    user_id: i64,
    subject_id: Option<i64>,
    event_type: &str,
    detail: serde_json::Value,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO events (user_id, subject_id, event_type, detail)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(user_id)
    .bind(subject_id)
    .bind(event_type)
    .bind(detail)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn upsert_heartbeat<'e, E>(
    executor: E,
    worker_id: &str,
    detail: serde_json::Value,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO worker_heartbeats (worker_id, last_seen_at, detail)
        VALUES ($1, NOW(), $2)
        ON CONFLICT (worker_id) DO UPDATE
        SET last_seen_at = NOW(), detail = EXCLUDED.detail
        "#,
    )
    .bind(worker_id)
    .bind(detail)
    .execute(executor)
    .await?;
    Ok(())
}
