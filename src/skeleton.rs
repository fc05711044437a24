//! Feed skeleton assembly - cursors, keyword rules, and page merging.
//!
//! The database gives us candidate pages (by author set or by submission
//! tag); everything here is the in-process half: exact keyword
//! filtering, dedup across the two paths, and the opaque cursor.

use std::collections::HashSet;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};

use crate::domain::feeds::FeedDefinition;
use crate::models::IndexedPost;

/// Encode the page cursor: base64url of `{micros}|{uri}`.
pub fn encode_cursor(created_at: DateTime<Utc>, uri: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}|{}", created_at.timestamp_micros(), uri))
}

/// Decode a client-supplied cursor. None means the cursor is malformed
/// and the request should be rejected rather than silently restarted.
pub fn decode_cursor(cursor: &str) -> Option<(DateTime<Utc>, String)> {
    let raw = String::from_utf8(URL_SAFE_NO_PAD.decode(cursor).ok()?).ok()?;
    let (micros, uri) = raw.split_once('|')?;
    let created_at = DateTime::from_timestamp_micros(micros.parse().ok()?)?;
    if uri.is_empty() {
        return None;
    }
    Some((created_at, uri.to_string()))
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whole-token containment: `keyword` must appear in `text` with a
/// non-word character (or the string edge) on both sides, so "cat"
/// never matches inside "cats" or "concatenate".
pub fn keyword_matches(text: &str, keyword: &str, case_insensitive: bool) -> bool {
    if keyword.is_empty() {
        return false;
    }
    let (hay, needle) = if case_insensitive {
        (text.to_lowercase(), keyword.to_lowercase())
    } else {
        (text.to_string(), keyword.to_string())
    };
    let mut from = 0;
    while let Some(offset) = hay[from..].find(&needle) {
        let at = from + offset;
        let before = hay[..at].chars().next_back();
        let after = hay[at + needle.len()..].chars().next();
        if before.is_none_or(|c| !is_word_char(c)) && after.is_none_or(|c| !is_word_char(c)) {
            return true;
        }
        // step one char so overlapping occurrences are still considered
        from = at + hay[at..].chars().next().map_or(1, |c| c.len_utf8());
    }
    false
}

/// True when the text trips none of the feed's exclude keywords.
/// Excludes apply to every candidate path, submissions included.
pub fn passes_excludes(feed: &FeedDefinition, text: &str) -> bool {
    !feed
        .exclude_keywords
        .iter()
        .any(|k| keyword_matches(text, k, feed.case_insensitive))
}

/// Full rule check for the source-based path: excludes win, then the
/// includes combine per include_mode. An empty include list admits
/// everything that survives the excludes.
pub fn passes_filters(feed: &FeedDefinition, text: &str) -> bool {
    if !passes_excludes(feed, text) {
        return false;
    }
    if feed.include_keywords.is_empty() {
        return true;
    }
    let hit = |k: &String| keyword_matches(text, k, feed.case_insensitive);
    match feed.include_mode.as_str() {
        "all" => feed.include_keywords.iter().all(hit),
        _ => feed.include_keywords.iter().any(hit),
    }
}

/// True when the text carries `#tag` as a whole token. Tags compare
/// case-insensitively regardless of the feed's keyword setting.
pub fn has_hashtag(text: &str, tag: &str) -> bool {
    keyword_matches(text, &format!("#{tag}"), true)
}

/// Combine the source page with the submission page: first occurrence
/// of a uri wins, then the union is re-sorted into page order.
pub fn merge_posts(mut primary: Vec<IndexedPost>, extra: Vec<IndexedPost>) -> Vec<IndexedPost> {
    let mut seen: HashSet<String> = primary.iter().map(|p| p.uri.clone()).collect();
    for post in extra {
        if seen.insert(post.uri.clone()) {
            primary.push(post);
        }
    }
    primary.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.uri.cmp(&a.uri))
    });
    primary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn feed(include: &[&str], exclude: &[&str], mode: &str) -> FeedDefinition {
        FeedDefinition {
            id: 1,
            slug: "test".to_string(),
            is_enabled: true,
            include_keywords: include.iter().map(|s| s.to_string()).collect(),
            exclude_keywords: exclude.iter().map(|s| s.to_string()).collect(),
            include_mode: mode.to_string(),
            case_insensitive: true,
            lang: None,
            submission_tag: None,
            submission_enabled: false,
        }
    }

    fn post(uri: &str, micros: i64) -> IndexedPost {
        IndexedPost {
            uri: uri.to_string(),
            author_did: "did:plc:abc".to_string(),
            text: String::new(),
            created_at: Utc.timestamp_micros(micros).single().unwrap(),
            lang: None,
        }
    }

    #[test]
    fn keyword_requires_whole_token() {
        assert!(keyword_matches("I love my cat.", "cat", true));
        assert!(keyword_matches("cat", "cat", true));
        assert!(keyword_matches("(cat)", "cat", true));
        assert!(!keyword_matches("cats are great", "cat", true));
        assert!(!keyword_matches("concatenate", "cat", true));
        assert!(!keyword_matches("my_cat", "cat", true));
        assert!(!keyword_matches("", "cat", true));
    }

    #[test]
    fn keyword_case_sensitivity() {
        assert!(keyword_matches("Rust is fun", "rust", true));
        assert!(!keyword_matches("Rust is fun", "rust", false));
    }

    #[test]
    fn hashtag_boundary() {
        assert!(has_hashtag("shipping #launch today", "launch"));
        assert!(has_hashtag("shipping #LAUNCH today", "launch"));
        assert!(!has_hashtag("shipping #launches today", "launch"));
        assert!(!has_hashtag("no tag launch here", "launch"));
    }

    #[test]
    fn excludes_always_win() {
        let f = feed(&["launch"], &["spam"], "any");
        assert!(passes_filters(&f, "big launch today"));
        assert!(!passes_filters(&f, "big launch today, no spam I promise"));
        // submission path still runs excludes
        assert!(!passes_excludes(&f, "spam spam spam"));
        assert!(passes_excludes(&f, "just a launch"));
    }

    #[test]
    fn keyword_rules_build_the_page_without_an_author_restriction() {
        // A feed with no enrolled sources pages the whole index and
        // keeps only what the keyword rules admit.
        let f = feed(&["launch"], &["spam"], "any");
        let candidates = vec![
            ("at://1", "Big launch today"),
            ("at://2", "launch, but also spam"),
            ("at://3", "unrelated chatter"),
        ];
        let page: Vec<&str> = candidates
            .into_iter()
            .filter(|(_, text)| passes_filters(&f, text))
            .map(|(uri, _)| uri)
            .collect();
        assert_eq!(page, vec!["at://1"]);
    }

    #[test]
    fn include_mode_all_vs_any() {
        let any = feed(&["rust", "go"], &[], "any");
        let all = feed(&["rust", "go"], &[], "all");
        assert!(passes_filters(&any, "writing rust today"));
        assert!(!passes_filters(&all, "writing rust today"));
        assert!(passes_filters(&all, "rust or go, pick one"));
    }

    #[test]
    fn empty_includes_admit_everything() {
        let f = feed(&[], &["spam"], "any");
        assert!(passes_filters(&f, "anything at all"));
        assert!(!passes_filters(&f, "spam though"));
    }

    #[test]
    fn cursor_round_trip_and_rejection() {
        let at = Utc.timestamp_micros(1_700_000_123_456_789).single().unwrap();
        let uri = "at://did:plc:abc/app.bsky.feed.post/3k1";
        let cursor = encode_cursor(at, uri);
        assert_eq!(decode_cursor(&cursor), Some((at, uri.to_string())));

        assert_eq!(decode_cursor("not base64!!"), None);
        let no_sep = URL_SAFE_NO_PAD.encode("12345");
        assert_eq!(decode_cursor(&no_sep), None);
        let bad_micros = URL_SAFE_NO_PAD.encode("abc|at://x");
        assert_eq!(decode_cursor(&bad_micros), None);
        let empty_uri = URL_SAFE_NO_PAD.encode("12345|");
        assert_eq!(decode_cursor(&empty_uri), None);
    }

    #[test]
    fn merge_dedupes_and_resorts() {
        let a = post("at://a", 300);
        let b = post("at://b", 100);
        let b_dup = post("at://b", 100);
        let c = post("at://c", 200);
        let merged = merge_posts(vec![a, b], vec![b_dup, c]);
        let uris: Vec<&str> = merged.iter().map(|p| p.uri.as_str()).collect();
        assert_eq!(uris, vec!["at://a", "at://c", "at://b"]);
    }

    #[test]
    fn merge_ties_break_by_uri_desc() {
        let merged = merge_posts(vec![post("at://a", 100)], vec![post("at://b", 100)]);
        let uris: Vec<&str> = merged.iter().map(|p| p.uri.as_str()).collect();
        assert_eq!(uris, vec!["at://b", "at://a"]);
    }
}
