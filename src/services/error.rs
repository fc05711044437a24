//! Error-to-status conversion for route handlers.

use axum::http::StatusCode;

/// Logs a handler error with context and collapses it to a 500. Route
/// handlers surface nothing else about internal failures.
pub trait LogErr<T> {
    fn log_500(self, context: &str) -> Result<T, StatusCode>;
}

impl<T, E: std::fmt::Display> LogErr<T> for Result<T, E> {
    fn log_500(self, context: &str) -> Result<T, StatusCode> {
        self.map_err(|e| {
            eprintln!("[http] {}: {}", context, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_errors_to_500_and_passes_ok_through() {
        let err: Result<(), &str> = Err("boom");
        assert_eq!(err.log_500("ctx"), Err(StatusCode::INTERNAL_SERVER_ERROR));
        let ok: Result<i32, &str> = Ok(7);
        assert_eq!(ok.log_500("ctx"), Ok(7));
    }
}
