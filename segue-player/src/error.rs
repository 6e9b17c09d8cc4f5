//! Error types for segue-player
//!
//! One thiserror enum carries the whole pipeline taxonomy. Failure scope
//! matters more than failure site here:
//! - retryable: `Network`, `RateLimited`
//! - permanent, track-level: `Unavailable`, `Decode`
//! - pipeline-level: `Starvation`
//!
//! Track-level errors are absorbed by the prebuffer manager (the track is
//! skipped); only `Starvation` surfaces to the control surface as a failure.

use thiserror::Error;

/// Main error type for segue-player
#[derive(Error, Debug)]
pub enum Error {
    /// Transient transfer failure; retried with backoff
    #[error("network error: {0}")]
    Network(String),

    /// Source throttled the request; retried with a longer backoff
    #[error("rate limited by source")]
    RateLimited,

    /// Source no longer exists; the track is marked and never retried
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Audio decoding failed; permanent for the track
    #[error("audio decode error: {0}")]
    Decode(String),

    /// No track in the remaining playlist can be prepared
    #[error("pipeline starved: {0}")]
    Starvation(String),

    /// Cache index errors
    #[error("cache error: {0}")]
    Cache(#[from] sqlx::Error),

    /// File I/O errors
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Playlist loading/validation errors
    #[error("playlist error: {0}")]
    Playlist(String),

    /// Audio output device errors
    #[error("audio output error: {0}")]
    AudioOutput(String),

    /// Operation not valid in the current transport state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// Other errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the downloader should retry after this failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::RateLimited)
    }

    /// Whether this failure permanently disqualifies the track
    pub fn is_track_fatal(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Decode(_))
    }
}

impl From<segue_common::config::ConfigError> for Error {
    fn from(e: segue_common::config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// Convenience Result type using the segue-player Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("timeout".into()).is_retryable());
        assert!(Error::RateLimited.is_retryable());
        assert!(!Error::Unavailable("gone".into()).is_retryable());
        assert!(!Error::Decode("bad frame".into()).is_retryable());
    }

    #[test]
    fn test_track_fatal_classification() {
        assert!(Error::Unavailable("gone".into()).is_track_fatal());
        assert!(Error::Decode("bad frame".into()).is_track_fatal());
        assert!(!Error::Network("timeout".into()).is_track_fatal());
        assert!(!Error::Starvation("all failed".into()).is_track_fatal());
    }
}
