pub mod error;
pub mod rate_limit;
