//! Error types for the search, extraction and enrichment pipeline.
//!
//! Only configuration and automation failures abort a run. Everything at
//! the listing or enrichment level degrades to sentinel values instead.

use std::path::PathBuf;
use thiserror::Error;

use crate::models::ListingField;

/// The main error type for house-hunt operations
#[derive(Error, Debug)]
pub enum ScoutError {
    /// A site capability or config file is malformed. Raised before any
    /// browser or API work starts.
    #[error("invalid configuration for `{site}`: {reason}")]
    Configuration { site: String, reason: String },

    /// A navigation or interaction kept failing after the retry budget.
    #[error("automation failed after {attempts} attempt(s) during {action}: {reason}")]
    AutomationFailure {
        action: String,
        attempts: u32,
        reason: String,
    },

    /// The page served a bot challenge instead of content.
    #[error("bot challenge detected at {url} (marker `{marker}`)")]
    ChallengeDetected { url: String, marker: String },

    /// The run was cancelled or hit its deadline.
    #[error("run cancelled")]
    Cancelled,

    /// Distance API failure for one batch.
    #[error("distance API error: {0}")]
    EnrichmentApi(#[from] DistanceApiError),

    /// The distance cache file could not be read or written.
    #[error("distance cache I/O failed for {path}: {reason}")]
    CacheIo { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScoutError {
    pub fn configuration(site: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            site: site.into(),
            reason: reason.into(),
        }
    }

    pub fn cache_io(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CacheIo {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error is allowed to end a run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::AutomationFailure { .. }
                | Self::ChallengeDetected { .. }
                | Self::Cancelled
        )
    }
}

/// Errors returned by a [`DistanceApi`](crate::enrichment::DistanceApi) call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistanceApiError {
    /// Network trouble, 5xx, 429 or a quota status. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),

    /// The request itself was refused (bad key, invalid request).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl DistanceApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A field whose extraction rule matched nothing on one listing.
///
/// Not an error: the field is recorded as unknown and extraction moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionGap {
    pub listing_id: String,
    pub field: ListingField,
}

/// Result type alias for house-hunt operations
pub type Result<T> = std::result::Result<T, ScoutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ScoutError::configuration("domain", "missing price rule").is_fatal());
        assert!(ScoutError::Cancelled.is_fatal());
        assert!(ScoutError::ChallengeDetected {
            url: "https://example.com".into(),
            marker: "captcha".into(),
        }
        .is_fatal());
        assert!(!ScoutError::cache_io("/tmp/cache.json", "denied").is_fatal());
        assert!(!ScoutError::EnrichmentApi(DistanceApiError::Transient("503".into())).is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = ScoutError::AutomationFailure {
            action: "goto https://www.domain.com.au/".into(),
            attempts: 3,
            reason: "timeout".into(),
        };
        assert_eq!(
            err.to_string(),
            "automation failed after 3 attempt(s) during goto https://www.domain.com.au/: timeout"
        );
        assert!(DistanceApiError::Transient("x".into()).is_transient());
        assert!(!DistanceApiError::Rejected("x".into()).is_transient());
    }
}
