//! Background worker using apalis
//!
//! Runs as a scheduled cron job; each tick claims and processes a batch
//! of due scheduled posts, then a batch of queued image jobs, then
//! writes a heartbeat. Rows are claimed with a lock lease, so a second
//! worker on the same database never double-processes, and a crashed
//! worker's rows become claimable again once the lease expires.

use apalis::prelude::*;
use apalis_cron::{CronStream, Schedule};
use apalis_sql::postgres::PostgresStorage;
use image::ImageReader;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::env;
use std::io::Cursor;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use crate::bluesky::BskyClient;
use crate::constants::MAX_ERROR_LEN;
use crate::domain::{ai_jobs, events, indexed_posts, scheduled_posts};
use crate::imagegen::{GenerateRequest, ImageGenClient};
use crate::models::{AiJob, IndexedPost, ScheduledPost};
use crate::storage;

const DEFAULT_CRON_SECONDS: u64 = 5;
const DEFAULT_POST_BATCH_SIZE: i64 = 10;
const DEFAULT_POST_LOCK_SECONDS: i64 = 60;
const DEFAULT_AI_BATCH_SIZE: i64 = 2;
const DEFAULT_AI_LOCK_SECONDS: i64 = 300;
const DEFAULT_SERVICE_URL: &str = "https://bsky.social";
const DEFAULT_IMAGE_SIZE: u32 = 1024;

/// Job input - marker for batch processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickJob {
    pub scheduled_at: chrono::DateTime<chrono::Utc>,
}

impl From<chrono::DateTime<chrono::Utc>> for TickJob {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        TickJob { scheduled_at: dt }
    }
}

/// Shared context for batch processing
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: PgPool,
    pub imagegen: ImageGenClient,
    pub gcs: Option<google_cloud_storage::client::Storage>,
    pub local_storage_path: Option<PathBuf>,
    pub bucket_name: String,
    pub worker_id: String,
}

/// Per-queue outcome counts for one tick
#[derive(Default)]
struct BatchStats {
    claimed: usize,
    ok: usize,
    failed: usize,
    last_error: Option<String>,
}

/// Job handler - one tick of both queues
/// Always returns Ok - individual row failures are logged, not bubbled
async fn process_tick_job(_job: TickJob, ctx: Data<WorkerContext>) -> Result<(), Error> {
    let posts = process_post_batch(&ctx).await;
    let ai = process_ai_batch(&ctx).await;

    if posts.claimed > 0 || ai.claimed > 0 {
        println!(
            "[worker] Tick complete: {}/{} posts published, {}/{} images generated",
            posts.ok, posts.claimed, ai.ok, ai.claimed
        );
    }

    let detail = serde_json::json!({
        "posts_claimed": posts.claimed,
        "posts_ok": posts.ok,
        "posts_failed": posts.failed,
        "ai_claimed": ai.claimed,
        "ai_ok": ai.ok,
        "ai_failed": ai.failed,
        "last_error": ai.last_error.or(posts.last_error),
    });
    if let Err(e) = events::upsert_heartbeat(&ctx.pool, &ctx.worker_id, detail).await {
        eprintln!("[worker] Heartbeat write failed: {}", e);
    }
    Ok(())
}

/// Start the background worker. Runs until the process exits.
pub async fn run_worker(
    pool: PgPool,
    imagegen: ImageGenClient,
    gcs: Option<google_cloud_storage::client::Storage>,
    local_storage_path: Option<PathBuf>,
    bucket_name: String,
) {
    let ctx = WorkerContext {
        pool: pool.clone(),
        imagegen,
        gcs,
        local_storage_path,
        bucket_name,
        worker_id: worker_id(),
    };

    let cron_seconds = worker_cron_seconds();
    let schedule_expr = format!("*/{} * * * * *", cron_seconds);

    // Run apalis migrations
    PostgresStorage::setup(&pool)
        .await
        .expect("Failed to set up apalis storage");

    let storage: PostgresStorage<TickJob> = PostgresStorage::new(pool.clone());
    let schedule = Schedule::from_str(&schedule_expr).expect("Invalid worker schedule");
    let cron = CronStream::new(schedule);
    let backend = cron.pipe_to_storage(storage);

    println!(
        "[worker] Apalis worker starting as {} (every {}s, post batch {}, ai batch {})",
        ctx.worker_id,
        cron_seconds,
        post_batch_size(),
        ai_batch_size()
    );

    let worker = WorkerBuilder::new("skypost-worker")
        .data(ctx)
        .backend(backend)
        .build_fn(process_tick_job);

    Monitor::new()
        .register(worker)
        .run()
        .await
        .expect("Worker monitor failed");
}

/// Claim and publish due posts, one at a time.
async fn process_post_batch(ctx: &WorkerContext) -> BatchStats {
    let mut stats = BatchStats::default();
    let posts = match scheduled_posts::claim_due(
        &ctx.pool,
        post_batch_size(),
        post_lock_seconds(),
        &ctx.worker_id,
    )
    .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("[worker] Post claim error: {}", e);
            stats.last_error = Some(truncate_error(&e.to_string()));
            return stats;
        }
    };

    stats.claimed = posts.len();
    for post in posts {
        record(
            &ctx.pool,
            post.user_id,
            Some(post.id),
            "claimed",
            serde_json::json!({ "worker_id": ctx.worker_id, "attempt": post.attempt_count }),
        )
        .await;

        match publish_one(ctx, &post).await {
            Ok(()) => stats.ok += 1,
            Err(e) => {
                eprintln!("[worker] Scheduled post {} failed: {}", post.id, e);
                stats.failed += 1;
                stats.last_error = Some(truncate_error(&e.to_string()));
            }
        }
    }
    stats
}

/// Publish a single claimed post and settle its terminal or requeued state.
async fn publish_one(
    ctx: &WorkerContext,
    post: &ScheduledPost,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Missing account or draft cannot heal on retry; burn the remaining
    // attempts and fail now.
    let account_id = match post.account_id {
        Some(id) => id,
        None => return settle_precondition(ctx, post, Precondition::MissingAccount).await,
    };

    let account = match scheduled_posts::get_account(&ctx.pool, account_id).await {
        Ok(Some(a)) => a,
        Err(e) => return settle_lookup_error(ctx, post, e).await,
        Ok(None) => return settle_precondition(ctx, post, Precondition::MissingAccount).await,
    };

    let text = match scheduled_posts::get_draft_text(&ctx.pool, post.draft_id).await {
        Ok(Some(t)) => t,
        Err(e) => return settle_lookup_error(ctx, post, e).await,
        Ok(None) => return settle_precondition(ctx, post, Precondition::MissingDraft).await,
    };

    record(
        &ctx.pool,
        post.user_id,
        Some(post.id),
        "post_attempt",
        serde_json::json!({ "attempt": post.attempt_count, "handle": account.handle }),
    )
    .await;

    let service_url = account
        .service_url
        .clone()
        .unwrap_or_else(bsky_service_url);
    let client = BskyClient::new(&service_url);

    let started = Instant::now();
    let result = async {
        let session = client
            .create_session(&account.handle, &account.app_password)
            .await?;
        client.create_post(&session, &text).await
    }
    .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(post_ref) => {
            // The post is live; if the bookkeeping write fails the row
            // stays claimable and may be published twice after the lock
            // expires. Recorded as worker_error for diagnosis.
            if let Err(e) =
                scheduled_posts::mark_posted(&ctx.pool, post.id, &post_ref.uri, &post_ref.cid).await
            {
                record(
                    &ctx.pool,
                    post.user_id,
                    Some(post.id),
                    "worker_error",
                    serde_json::json!({ "error": truncate_error(&e.to_string()), "uri": post_ref.uri }),
                )
                .await;
                return Err(Box::new(e));
            }
            record(
                &ctx.pool,
                post.user_id,
                Some(post.id),
                "post_success",
                serde_json::json!({
                    "uri": post_ref.uri,
                    "cid": post_ref.cid,
                    "duration_ms": duration_ms,
                }),
            )
            .await;

            // Make the published post immediately visible to its feeds.
            let indexed = IndexedPost {
                uri: post_ref.uri,
                author_did: account.did,
                text,
                created_at: chrono::Utc::now(),
                lang: None,
            };
            if let Err(e) = indexed_posts::upsert(&ctx.pool, &indexed).await {
                eprintln!(
                    "[worker] Failed to index published post {}: {}",
                    indexed.uri, e
                );
            }
            Ok(())
        }
        Err(e) => {
            let error = truncate_error(&e.to_string());
            let terminal = settle_post_failure(ctx, post, &error).await?;
            record(
                &ctx.pool,
                post.user_id,
                Some(post.id),
                "post_failed",
                serde_json::json!({
                    "error": error,
                    "attempt": post.attempt_count,
                    "terminal": terminal,
                    "duration_ms": duration_ms,
                }),
            )
            .await;
            Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        }
    }
}

/// Preconditions a retry can never repair. Each gets its own event tag
/// so the publish-call failures stay distinguishable in the event log.
#[derive(Clone, Copy)]
enum Precondition {
    MissingAccount,
    MissingDraft,
}

impl Precondition {
    fn event_type(self) -> &'static str {
        match self {
            Precondition::MissingAccount => "missing_account",
            Precondition::MissingDraft => "missing_draft",
        }
    }

    fn message(self) -> &'static str {
        match self {
            Precondition::MissingAccount => "connected account was removed",
            Precondition::MissingDraft => "draft no longer exists",
        }
    }
}

/// Fail a post permanently over a precondition that cannot heal.
async fn settle_precondition(
    ctx: &WorkerContext,
    post: &ScheduledPost,
    what: Precondition,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let msg = what.message();
    scheduled_posts::mark_failed_permanent(&ctx.pool, post.id, msg).await?;
    record(
        &ctx.pool,
        post.user_id,
        Some(post.id),
        what.event_type(),
        serde_json::json!({ "error": msg, "terminal": true }),
    )
    .await;
    Err(msg.into())
}

/// Requeue or freeze a post after a retryable failure, depending on the
/// attempts already spent. Returns whether the failure was terminal.
async fn settle_post_failure(
    ctx: &WorkerContext,
    post: &ScheduledPost,
    error: &str,
) -> Result<bool, sqlx::Error> {
    let terminal = post.attempt_count >= post.max_attempts;
    if terminal {
        scheduled_posts::mark_failed(&ctx.pool, post.id, error).await?;
    } else {
        scheduled_posts::requeue_after_failure(&ctx.pool, post.id, error).await?;
    }
    Ok(terminal)
}

/// Settle a database error hit before the publish call ever went out.
/// The row is released for retry rather than left to sit on its lock.
async fn settle_lookup_error(
    ctx: &WorkerContext,
    post: &ScheduledPost,
    e: sqlx::Error,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let error = truncate_error(&e.to_string());
    let terminal = settle_post_failure(ctx, post, &error).await?;
    record(
        &ctx.pool,
        post.user_id,
        Some(post.id),
        "worker_error",
        serde_json::json!({
            "error": error,
            "attempt": post.attempt_count,
            "terminal": terminal,
        }),
    )
    .await;
    Err(Box::new(e))
}

/// Claim and run queued image jobs, one at a time.
async fn process_ai_batch(ctx: &WorkerContext) -> BatchStats {
    let mut stats = BatchStats::default();
    let jobs = match ai_jobs::claim_queued(
        &ctx.pool,
        ai_batch_size(),
        ai_lock_seconds(),
        &ctx.worker_id,
    )
    .await
    {
        Ok(j) => j,
        Err(e) => {
            eprintln!("[worker] Job claim error: {}", e);
            stats.last_error = Some(truncate_error(&e.to_string()));
            return stats;
        }
    };

    stats.claimed = jobs.len();
    for job in jobs {
        match generate_one(ctx, &job).await {
            Ok(()) => {
                println!("[worker] Generated asset for job {}", job.id);
                stats.ok += 1;
            }
            Err(e) => {
                eprintln!("[worker] Image job {} failed: {}", job.id, e);
                stats.failed += 1;
                stats.last_error = Some(truncate_error(&e.to_string()));
            }
        }
    }
    stats
}

async fn generate_one(
    ctx: &WorkerContext,
    job: &AiJob,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (width, height) = resolve_size(&job.params);
    let request = GenerateRequest {
        model: job.model_id.clone(),
        prompt: job.prompt.clone(),
        negative_prompt: job.negative_prompt.clone(),
        width,
        height,
        steps: job.params.get("steps").and_then(|v| v.as_u64()).map(|v| v as u32),
        guidance: job.params.get("guidance").and_then(|v| v.as_f64()),
    };

    let result = ctx.imagegen.generate(&request).await;
    let image = match result {
        Ok(image) => image,
        Err(e) => {
            let error = truncate_error(&e.to_string());
            let terminal = job.attempt_count >= job.max_attempts;
            if terminal {
                ai_jobs::mark_failed(&ctx.pool, job.id, &error).await?;
            } else {
                ai_jobs::requeue_after_failure(&ctx.pool, job.id, &error).await?;
            }
            record(
                &ctx.pool,
                job.user_id,
                Some(job.id),
                "ai_failed",
                serde_json::json!({
                    "error": error,
                    "attempt": job.attempt_count,
                    "terminal": terminal,
                }),
            )
            .await;
            return Err(Box::new(e));
        }
    };

    // Actual dimensions can differ from the request; read them back from
    // the bytes before recording the asset.
    let (actual_w, actual_h) = match ImageReader::new(Cursor::new(&image.bytes))
        .with_guessed_format()
        .ok()
        .and_then(|r| r.into_dimensions().ok())
    {
        Some((w, h)) => (w as i32, h as i32),
        None => (width as i32, height as i32),
    };

    let path = storage::generated_asset_path(job.user_id, job.id);
    let settle = async {
        storage::put_object(
            ctx.gcs.as_ref(),
            ctx.local_storage_path.as_ref(),
            &ctx.bucket_name,
            &path,
            &image.bytes,
        )
        .await?;
        ai_jobs::insert_asset(
            &ctx.pool,
            job.id,
            job.user_id,
            &ctx.bucket_name,
            &path,
            "image/png",
            actual_w,
            actual_h,
        )
        .await?;
        ai_jobs::mark_succeeded(&ctx.pool, job.id, image.request_id.as_deref()).await?;
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    }
    .await;

    if let Err(e) = settle {
        // The generation itself worked; storage or bookkeeping did not.
        let error = truncate_error(&e.to_string());
        let terminal = job.attempt_count >= job.max_attempts;
        if terminal {
            ai_jobs::mark_failed(&ctx.pool, job.id, &error).await?;
        } else {
            ai_jobs::requeue_after_failure(&ctx.pool, job.id, &error).await?;
        }
        record(
            &ctx.pool,
            job.user_id,
            Some(job.id),
            "worker_error",
            serde_json::json!({
                "error": error,
                "attempt": job.attempt_count,
                "terminal": terminal,
            }),
        )
        .await;
        return Err(e);
    }
    Ok(())
}

/// Append an event, logging instead of failing when the write errors.
async fn record(
    pool: &PgPool,
    user_id: i64,
    subject_id: Option<i64>,
    event_type: &str,
    detail: serde_json::Value,
) {
    if let Err(e) = events::record_event(pool, user_id, subject_id, event_type, detail).await {
        eprintln!("[worker] Failed to record {} event: {}", event_type, e);
    }
}

/// Clip an error message to what the error columns hold, on a char
/// boundary.
fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

/// Requested output size: explicit width/height keys win, then a
/// "WxH" size string, then the default square.
fn resolve_size(params: &serde_json::Value) -> (u32, u32) {
    let dim = |key: &str| {
        params
            .get(key)
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
    };
    if let (Some(w), Some(h)) = (dim("width"), dim("height")) {
        if w > 0 && h > 0 {
            return (w, h);
        }
    }
    if let Some(size) = params.get("size").and_then(|v| v.as_str()) {
        if let Some((w, h)) = size.split_once('x') {
            if let (Ok(w), Ok(h)) = (w.trim().parse::<u32>(), h.trim().parse::<u32>()) {
                if w > 0 && h > 0 {
                    return (w, h);
                }
            }
        }
    }
    (DEFAULT_IMAGE_SIZE, DEFAULT_IMAGE_SIZE)
}

/// Stable identity for lock attribution. Overridable so deployments with
/// one worker per host can pick their own names.
fn worker_id() -> String {
    if let Ok(id) = env::var("WORKER_ID") {
        if !id.is_empty() {
            return id;
        }
    }
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("{}-{}", host, std::process::id())
}

fn bsky_service_url() -> String {
    env::var("BSKY_SERVICE_URL").unwrap_or_else(|_| DEFAULT_SERVICE_URL.to_string())
}

fn worker_cron_seconds() -> u64 {
    env::var("WORKER_POLL_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0 && *v <= 59)
        .unwrap_or(DEFAULT_CRON_SECONDS)
}

fn post_batch_size() -> i64 {
    env::var("POST_BATCH_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_POST_BATCH_SIZE)
}

fn post_lock_seconds() -> i64 {
    env::var("POST_LOCK_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_POST_LOCK_SECONDS)
}

fn ai_batch_size() -> i64 {
    env::var("AI_BATCH_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_AI_BATCH_SIZE)
}

fn ai_lock_seconds() -> i64 {
    env::var("AI_LOCK_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_AI_LOCK_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_size() {
        assert_eq!(
            resolve_size(&serde_json::json!({ "width": 512, "height": 768 })),
            (512, 768)
        );
        assert_eq!(
            resolve_size(&serde_json::json!({ "size": "640x480" })),
            (640, 480)
        );
        assert_eq!(resolve_size(&serde_json::json!({})), (1024, 1024));
        assert_eq!(
            resolve_size(&serde_json::json!({ "size": "wide" })),
            (1024, 1024)
        );
        assert_eq!(
            resolve_size(&serde_json::json!({ "width": 0, "height": 512 })),
            (1024, 1024)
        );
        // out of u32 range falls back to the default, never wraps
        assert_eq!(
            resolve_size(&serde_json::json!({ "width": 4294967297u64, "height": 512 })),
            (1024, 1024)
        );
        // explicit keys win over the size string
        assert_eq!(
            resolve_size(&serde_json::json!({ "width": 256, "height": 256, "size": "640x480" })),
            (256, 256)
        );
    }

    #[test]
    fn precondition_events_are_distinct_from_publish_failures() {
        assert_eq!(Precondition::MissingAccount.event_type(), "missing_account");
        assert_eq!(Precondition::MissingDraft.event_type(), "missing_draft");
    }

    #[test]
    fn test_truncate_error() {
        assert_eq!(truncate_error("short"), "short");
        let long = "x".repeat(MAX_ERROR_LEN + 100);
        assert_eq!(truncate_error(&long).len(), MAX_ERROR_LEN);
        // never splits a multibyte char
        let emoji = "é".repeat(MAX_ERROR_LEN);
        let clipped = truncate_error(&emoji);
        assert!(clipped.len() <= MAX_ERROR_LEN);
        assert!(clipped.chars().all(|c| c == 'é'));
    }
}
