//! Error types for the collection and aggregation pipelines.
//!
//! Per-cycle and per-file failures are contained where they happen; only a
//! [`FetchError::Unrecoverable`] is allowed to stop a collection loop.

use std::path::PathBuf;
use thiserror::Error;

/// Why a feed snapshot could not be obtained.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to decode feed body: {0}")]
    Decode(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("TLS failure: {0}")]
    Tls(String),
    #[error("too many redirects: {0}")]
    TooManyRedirects(String),
    #[error("unrecoverable transport failure: {0}")]
    Unrecoverable(String),
    #[error("unexpected fetch failure: {0}")]
    Unknown(String),
}

impl FetchError {
    /// Returns `true` when the collection loop must terminate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Unrecoverable(_))
    }

    /// Short tag used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Decode(_) => "decode_error",
            FetchError::Timeout(_) => "timeout",
            FetchError::Tls(_) => "ssl_error",
            FetchError::TooManyRedirects(_) => "too_many_redirects",
            FetchError::Unrecoverable(_) => "request_exception",
            FetchError::Unknown(_) => "unknown",
        }
    }

    /// Classifies a transport error from `reqwest`.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let message = err.to_string();
        if err.is_timeout() {
            FetchError::Timeout(message)
        } else if err.is_redirect() {
            FetchError::TooManyRedirects(message)
        } else if err.is_status() {
            FetchError::Unrecoverable(message)
        } else if err.is_decode() || err.is_body() {
            FetchError::Unknown(message)
        } else if is_tls_error(err) {
            FetchError::Tls(message)
        } else {
            FetchError::Unrecoverable(message)
        }
    }
}

impl From<prost::DecodeError> for FetchError {
    fn from(err: prost::DecodeError) -> Self {
        FetchError::Decode(err.to_string())
    }
}

/// `reqwest` does not expose a TLS predicate, so walk the source chain. The
/// top-level message embeds the request URL and is skipped.
fn is_tls_error(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
            return true;
        }
        source = e.source();
    }
    false
}

/// A finalized trajectory could not be written.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize trajectory for entity {entity_id}: {source}")]
    Serialize {
        entity_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("entity {0} has no parseable first timestamp")]
    MissingDate(String),
}

/// One persisted trajectory file could not be folded into a daily merge.
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a trajectory FeatureCollection: {source}")]
    InvalidFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// An artifact could not be shipped to object storage.
#[derive(Error, Debug)]
#[error("upload of s3://{bucket}/{key} failed: {message}")]
pub struct UploadError {
    pub bucket: String,
    pub key: String,
    pub message: String,
}
