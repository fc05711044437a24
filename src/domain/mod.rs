//! Database query modules.
//!
//! All functions use the generic Executor pattern, allowing them to work
//! with both `&PgPool` (for standalone queries) and `&mut PgConnection`
//! (for transactions). No query here touches more than one table per
//! statement; the claim statements are the only place where correctness
//! under concurrency matters, and they are single atomic statements.

pub mod ai_jobs;
pub mod events;
pub mod feeds;
pub mod indexed_posts;
pub mod scheduled_posts;
