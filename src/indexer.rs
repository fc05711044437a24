//! Content indexer background loop
//!
//! Periodically crawls the authors enrolled in curated feeds, copying
//! their recent posts into indexed_posts, and scans mentions of the
//! service handle for hashtag enrollment requests. Runs as a plain
//! interval loop; ticks are sequential, so a slow crawl can never
//! overlap the next one.

use rand::Rng;
use rand::seq::SliceRandom;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::env;
use std::time::{Duration, Instant};

use crate::bluesky::BskyClient;
use crate::domain::{feeds, indexed_posts};
use crate::models::IndexedPost;
use crate::services::rate_limit::{EnrollmentRateLimiter, RateLimitConfig};

const DEFAULT_JITTER_MS: u64 = 30_000;
const DEFAULT_TICK_SECONDS: u64 = 180;
const DEFAULT_ACCOUNTS_PER_TICK: usize = 25;
const DEFAULT_COOLDOWN_SECONDS: u64 = 900;
const DEFAULT_APPVIEW_URL: &str = "https://public.api.bsky.app";
const DEFAULT_ENROLL_MAX_PER_HOUR: u32 = 20;
const AUTHOR_FEED_LIMIT: i64 = 30;
const MENTION_SEARCH_LIMIT: i64 = 50;

/// Per-process crawl state. Lost on restart, which only means one
/// early re-crawl per account.
struct CrawlState {
    cooldowns: HashMap<String, Instant>,
    resolved_handles: HashMap<String, String>,
    enroll_limiter: EnrollmentRateLimiter,
}

/// Run the indexer loop. Never returns.
pub async fn run_indexer(pool: PgPool) {
    // Desynchronize replicas started at the same moment.
    let jitter = rand::rng().random_range(0..=indexer_jitter_ms());
    if jitter > 0 {
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }

    let tick_seconds = indexer_tick_seconds();
    println!("[indexer] Starting (every {}s)", tick_seconds);

    let client = BskyClient::new(&appview_url());
    let mut state = CrawlState {
        cooldowns: HashMap::new(),
        resolved_handles: HashMap::new(),
        enroll_limiter: EnrollmentRateLimiter::new(RateLimitConfig {
            max_per_window: enroll_max_per_hour(),
            window: Duration::from_secs(3600),
        }),
    };

    let mut interval = tokio::time::interval(Duration::from_secs(tick_seconds));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        match crawl_sources(&pool, &client, &mut state).await {
            Ok(indexed) => {
                if indexed > 0 {
                    println!("[indexer] Indexed {} posts", indexed);
                }
            }
            Err(e) => {
                eprintln!("[indexer] Crawl error: {}", e);
            }
        }

        if let Err(e) = process_enrollment(&pool, &client, &mut state).await {
            eprintln!("[indexer] Enrollment error: {}", e);
        }

        state.enroll_limiter.cleanup();
    }
}

/// Crawl a sample of enrolled authors and upsert their recent posts.
async fn crawl_sources(
    pool: &PgPool,
    client: &BskyClient,
    state: &mut CrawlState,
) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    let cooldown = Duration::from_secs(indexer_cooldown_seconds());
    let mut dids: Vec<String> = feeds::distinct_source_dids(pool)
        .await?
        .into_iter()
        .filter(|did| is_valid_did(did))
        .filter(|did| {
            state
                .cooldowns
                .get(did)
                .is_none_or(|at| at.elapsed() >= cooldown)
        })
        .collect();
    dids.shuffle(&mut rand::rng());
    dids.truncate(accounts_per_tick());

    let mut indexed = 0;
    for did in dids {
        match client.get_author_feed(&did, AUTHOR_FEED_LIMIT).await {
            Ok(posts) => {
                for post in posts {
                    let row = IndexedPost {
                        uri: post.uri,
                        author_did: post.author_did,
                        text: post.text,
                        created_at: post.created_at,
                        lang: post.lang,
                    };
                    match indexed_posts::upsert(pool, &row).await {
                        Ok(()) => indexed += 1,
                        Err(e) => eprintln!("[indexer] Upsert failed for {}: {}", row.uri, e),
                    }
                }
            }
            Err(e) => {
                eprintln!("[indexer] Feed fetch failed for {}: {}", did, e);
            }
        }
        state.cooldowns.insert(did, Instant::now());

        // Pace requests so the crawl doesn't read as a burst.
        let pause = rand::rng().random_range(250..=750);
        tokio::time::sleep(Duration::from_millis(pause)).await;
    }
    Ok(indexed)
}

/// Scan mentions of the service handle for hashtag enrollment.
async fn process_enrollment(
    pool: &PgPool,
    client: &BskyClient,
    state: &mut CrawlState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(service_handle) = service_handle() else {
        return Ok(());
    };
    let rules = feeds::list_opt_in_rules(pool).await?;
    if rules.is_empty() {
        return Ok(());
    }

    // Resolving our own handle confirms it exists before searching;
    // cache it for the life of the process.
    if !state.resolved_handles.contains_key(&service_handle) {
        let did = client.resolve_handle(&service_handle).await?;
        state.resolved_handles.insert(service_handle.clone(), did);
    }

    let mentions = client
        .search_mentions(&service_handle, MENTION_SEARCH_LIMIT)
        .await?;

    // Each author counts once per feed per tick no matter how many
    // mentions they posted.
    let mut handled: HashSet<(i64, String)> = HashSet::new();
    for mention in mentions {
        if !is_valid_did(&mention.author_did) {
            continue;
        }
        let tags = extract_hashtags(&mention.text);
        for rule in &rules {
            if !tags.contains(&rule.join_tag.to_lowercase()) {
                continue;
            }
            if !handled.insert((rule.feed_id, mention.author_did.clone())) {
                continue;
            }
            if !state.enroll_limiter.check(rule.feed_id) {
                println!(
                    "[indexer] Enrollment rate limit hit for feed {}, skipping {}",
                    rule.slug, mention.author_did
                );
                continue;
            }
            let added = if rule.join_mode == "moderated" {
                feeds::add_join_request(
                    pool,
                    rule.feed_id,
                    &mention.author_did,
                    Some(&mention.author_handle),
                )
                .await?
            } else {
                feeds::add_source(pool, rule.feed_id, &mention.author_did).await?
            };
            if added {
                println!(
                    "[indexer] Enrolled {} in feed {} ({})",
                    mention.author_did, rule.slug, rule.join_mode
                );
            }
        }
    }
    Ok(())
}

/// Only did:plc and did:web identifiers are crawled; anything else in
/// the sources table is ignored.
fn is_valid_did(did: &str) -> bool {
    let Some(rest) = did
        .strip_prefix("did:plc:")
        .or_else(|| did.strip_prefix("did:web:"))
    else {
        return false;
    };
    !rest.is_empty() && !rest.chars().any(char::is_whitespace)
}

/// Hashtags in the text, lowercased, first occurrence order. A '#'
/// inside a word (e.g. "c#") starts nothing.
fn extract_hashtags(text: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut seen = HashSet::new();
    let mut chars = text.char_indices().peekable();
    let mut prev_is_word = false;
    while let Some((_, c)) = chars.next() {
        if c == '#' && !prev_is_word {
            let mut tag = String::new();
            while let Some(&(_, next)) = chars.peek() {
                if next.is_alphanumeric() || next == '_' {
                    tag.extend(next.to_lowercase());
                    chars.next();
                } else {
                    break;
                }
            }
            if !tag.is_empty() && seen.insert(tag.clone()) {
                tags.push(tag);
            }
            prev_is_word = true;
        } else {
            prev_is_word = c.is_alphanumeric() || c == '_';
        }
    }
    tags
}

fn indexer_jitter_ms() -> u64 {
    env::var("INDEXER_JITTER_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_JITTER_MS)
}

fn indexer_tick_seconds() -> u64 {
    env::var("INDEXER_TICK_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_TICK_SECONDS)
}

fn accounts_per_tick() -> usize {
    env::var("INDEXER_ACCOUNTS_PER_TICK")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_ACCOUNTS_PER_TICK)
}

fn indexer_cooldown_seconds() -> u64 {
    env::var("INDEXER_COOLDOWN_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_COOLDOWN_SECONDS)
}

fn appview_url() -> String {
    env::var("BSKY_APPVIEW_URL").unwrap_or_else(|_| DEFAULT_APPVIEW_URL.to_string())
}

/// Handle whose mentions carry enrollment requests. Enrollment is off
/// when unset.
fn service_handle() -> Option<String> {
    env::var("INDEXER_SERVICE_HANDLE")
        .ok()
        .filter(|s| !s.is_empty())
}

fn enroll_max_per_hour() -> u32 {
    env::var("ENROLL_MAX_PER_HOUR")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_ENROLL_MAX_PER_HOUR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_dids() {
        assert!(is_valid_did("did:plc:abcd1234"));
        assert!(is_valid_did("did:web:example.com"));
        assert!(!is_valid_did("did:key:z6Mk"));
        assert!(!is_valid_did("did:plc:"));
        assert!(!is_valid_did("alice.bsky.social"));
        assert!(!is_valid_did("did:web:has space"));
    }

    #[test]
    fn test_extract_hashtags() {
        assert_eq!(
            extract_hashtags("join #RustFeed and #rustfeed please"),
            vec!["rustfeed"]
        );
        assert_eq!(
            extract_hashtags("#one two #three_4"),
            vec!["one", "three_4"]
        );
        assert_eq!(extract_hashtags("nothing here"), Vec::<String>::new());
        // '#' stuck to a word is not a tag
        assert_eq!(extract_hashtags("i write c# daily"), Vec::<String>::new());
        assert_eq!(extract_hashtags("trailing #"), Vec::<String>::new());
        assert_eq!(extract_hashtags("(#parens)"), vec!["parens"]);
    }
}
