//! Feed definition domain - feed lookups, curated sources, and the
//! opt-in enrollment tables.

use sqlx::{Executor, Postgres};

/// A configured feed as served by getFeedSkeleton.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedDefinition {
    pub id: i64,
    pub slug: String,
    pub is_enabled: bool,
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    /// 'any' or 'all'; how include_keywords combine.
    pub include_mode: String,
    pub case_insensitive: bool,
    pub lang: Option<String>,
    pub submission_tag: Option<String>,
    pub submission_enabled: bool,
}

/// A feed that accepts hashtag enrollment, as needed by the indexer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OptInRule {
    pub feed_id: i64,
    pub slug: String,
    pub join_tag: String,
    /// 'public' adds the author directly; 'moderated' files a request.
    pub join_mode: String,
}

pub async fn get_enabled_by_slug<'e, E>(
    executor: E,
    slug: &str,
) -> Result<Option<FeedDefinition>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, FeedDefinition>(
        r#"
        SELECT id, slug, is_enabled, include_keywords, exclude_keywords,
               include_mode, case_insensitive, lang,
               submission_tag, submission_enabled
        FROM feeds
        WHERE slug = $1 AND is_enabled = TRUE
        "#,
    )
    .bind(slug)
    .fetch_optional(executor)
    .await
}

/// Slugs advertised by describeFeedGenerator.
pub async fn list_enabled_slugs<'e, E>(executor: E) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT slug FROM feeds WHERE is_enabled = TRUE ORDER BY slug")
            .fetch_all(executor)
            .await?;
    Ok(rows.into_iter().map(|(s,)| s).collect())
}

pub async fn get_sources<'e, E>(executor: E, feed_id: i64) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT did FROM feed_sources WHERE feed_id = $1")
            .bind(feed_id)
            .fetch_all(executor)
            .await?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}

/// Every distinct account enrolled in any enabled feed. This is the
/// indexer's crawl list.
pub async fn distinct_source_dids<'e, E>(executor: E) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT s.did
        FROM feed_sources s
        JOIN feeds f ON f.id = s.feed_id
        WHERE f.is_enabled = TRUE
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}

pub async fn list_opt_in_rules<'e, E>(executor: E) -> Result<Vec<OptInRule>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, OptInRule>(
        r#"
        SELECT id AS feed_id, slug, join_tag, join_mode
        FROM feeds
        WHERE is_enabled = TRUE
          AND source_mode = 'opt_in'
          AND join_tag IS NOT NULL
        "#,
    )
    .fetch_all(executor)
    .await
}

/// Enroll an account in a feed. Returns false when it was already there.
pub async fn add_source<'e, E>(executor: E, feed_id: i64, did: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO feed_sources (feed_id, did)
        VALUES ($1, $2)
        ON CONFLICT (feed_id, did) DO NOTHING
        "#,
    )
    .bind(feed_id)
    .bind(did)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// File a pending join request for a moderated feed. Returns false when
/// one already exists for this account.
pub async fn add_join_request<'e, E>(
    executor: E,
    feed_id: i64,
    did: &str,
    handle: Option<&str>,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO feed_join_requests (feed_id, did, handle)
        VALUES ($1, $2, $3)
        ON CONFLICT (feed_id, did) DO NOTHING
        "#,
    )
    .bind(feed_id)
    .bind(did)
    .bind(handle)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}
