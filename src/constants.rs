//! Application constants

/// Default GCS bucket name for generated assets
pub const BUCKET_NAME: &str = "skypost_generated_assets";

/// Errors persisted onto job rows are truncated to this many bytes
pub const MAX_ERROR_LEN: usize = 500;

/// Default page size for the feed skeleton endpoint
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Maximum page size for the feed skeleton endpoint
pub const MAX_PAGE_SIZE: i64 = 100;
