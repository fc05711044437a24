//! Indexed post domain - upserts from the indexer and keyset page reads.
//!
//! Pages are ordered by (created_at DESC, uri DESC), a total order since
//! uri is the primary key. The cursor is the (created_at, uri) pair of
//! the last row of the previous page; rows strictly below it in that
//! order form the next page.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres};

use crate::models::IndexedPost;

/// Insert or refresh one post. Re-indexing an edited post overwrites the
/// stored copy in place.
pub async fn upsert<'e, E>(executor: E, post: &IndexedPost) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO indexed_posts (uri, author_did, text, created_at, lang)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (uri) DO UPDATE
        SET author_did = EXCLUDED.author_did,
            text = EXCLUDED.text,
            created_at = EXCLUDED.created_at,
            lang = EXCLUDED.lang
        "#,
    )
    .bind(&post.uri)
    .bind(&post.author_did)
    .bind(&post.text)
    .bind(post.created_at)
    .bind(&post.lang)
    .execute(executor)
    .await?;
    Ok(())
}

/// One page of posts, newest first, optionally restricted to the given
/// authors. `None` reads the whole index (a feed with no enrolled
/// sources serves keyword matches from everything indexed).
pub async fn page_by_authors<'e, E>(
    executor: E,
    author_dids: Option<&[String]>,
    lang: Option<&str>,
    cursor: Option<(DateTime<Utc>, &str)>,
    limit: i64,
) -> Result<Vec<IndexedPost>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let (cursor_at, cursor_uri) = match cursor {
        Some((at, uri)) => (Some(at), Some(uri)),
        None => (None, None),
    };
    sqlx::query_as::<_, IndexedPost>(
        r#"
        SELECT uri, author_did, text, created_at, lang
        FROM indexed_posts
        WHERE ($1::text[] IS NULL OR author_did = ANY($1))
          AND ($2::text IS NULL OR lang = $2)
          AND ($3::timestamptz IS NULL OR (created_at, uri) < ($3, $4))
        ORDER BY created_at DESC, uri DESC
        LIMIT $5
        "#,
    )
    .bind(author_dids)
    .bind(lang)
    .bind(cursor_at)
    .bind(cursor_uri)
    .bind(limit)
    .fetch_all(executor)
    .await
}

/// One page of posts whose text mentions `tag`, newest first.
///
/// ILIKE is a coarse prefilter; the caller still runs the exact
/// whole-token check, since '#cat' here would also match '#cats'.
pub async fn page_with_tag<'e, E>(
    executor: E,
    tag: &str,
    lang: Option<&str>,
    cursor: Option<(DateTime<Utc>, &str)>,
    limit: i64,
) -> Result<Vec<IndexedPost>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let (cursor_at, cursor_uri) = match cursor {
        Some((at, uri)) => (Some(at), Some(uri)),
        None => (None, None),
    };
    sqlx::query_as::<_, IndexedPost>(
        r#"
        SELECT uri, author_did, text, created_at, lang
        FROM indexed_posts
        WHERE text ILIKE '%' || $1 || '%'
          AND ($2::text IS NULL OR lang = $2)
          AND ($3::timestamptz IS NULL OR (created_at, uri) < ($3, $4))
        ORDER BY created_at DESC, uri DESC
        LIMIT $5
        "#,
    )
    .bind(format!("#{}", escape_like(tag)))
    .bind(lang)
    .bind(cursor_at)
    .bind(cursor_uri)
    .bind(limit)
    .fetch_all(executor)
    .await
}

/// Escape LIKE metacharacters so a tag only ever matches literally.
/// Postgres treats backslash as the default ESCAPE character.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_patterns_match_tags_literally() {
        assert_eq!(escape_like("launch"), "launch");
        assert_eq!(escape_like("rust_news"), "rust\\_news");
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
    }
}
