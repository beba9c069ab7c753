//! Error taxonomy shared by discovery sources, enrichment and output writers.
//!
//! Startup errors ([`DiscoveryError`]) abort construction of a single source.
//! Per-cycle errors are logged by the poller and only flip the source's
//! `up` flag. [`WriteError::Conflict`] is the one variant the retry
//! combinator treats as transient.

use thiserror::Error;

/// Errors raised while creating or polling a discovery source.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No factory is registered under the requested name.
    #[error("invalid discovery name '{name}', must be one of: {}", available.join(", "))]
    UnknownSource {
        name: String,
        available: Vec<String>,
    },

    /// The config fragment could not be rendered or decoded.
    #[error("invalid configuration for discovery '{name}': {message}")]
    Config { name: String, message: String },

    /// A target-selection policy the source does not support.
    #[error("unsupported target selection '{0}'")]
    UnsupportedTarget(String),

    /// Authentication or client setup against a backend failed.
    #[error("backend setup failed: {0}")]
    Setup(String),

    /// A list or lookup call against an inventory backend failed.
    #[error("backend request failed: {0}")]
    Backend(String),

    /// A record that cannot be turned into a target group.
    #[error("unsupported record {id}: {reason}")]
    UnsupportedRecord { id: String, reason: String },
}

impl DiscoveryError {
    pub fn config(name: &str, message: impl Into<String>) -> Self {
        DiscoveryError::Config {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(e: reqwest::Error) -> Self {
        DiscoveryError::Backend(e.to_string())
    }
}

/// Errors from a single ownership lookup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The caller is missing the role needed to read ownership data.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lookup failed: {0}")]
    Failed(String),
}

impl From<reqwest::Error> for LookupError {
    fn from(e: reqwest::Error) -> Self {
        match e.status().map(|s| s.as_u16()) {
            Some(401) | Some(403) => LookupError::PermissionDenied(e.to_string()),
            Some(404) => LookupError::NotFound(e.to_string()),
            _ => LookupError::Failed(e.to_string()),
        }
    }
}

/// Errors from reading or writing published payloads.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The object changed between read and update.
    #[error("conflict updating {0}")]
    Conflict(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("api error: {0}")]
    Api(String),

    /// Every retry attempt ended in a conflict.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<WriteError>,
    },
}

impl WriteError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, WriteError::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_source_lists_registered_names() {
        let err = DiscoveryError::UnknownSource {
            name: "foo".to_string(),
            available: vec!["ironic".to_string(), "netbox".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "invalid discovery name 'foo', must be one of: ironic, netbox"
        );
    }

    #[test]
    fn only_conflict_is_conflict() {
        assert!(WriteError::Conflict("cm".into()).is_conflict());
        assert!(!WriteError::Api("boom".into()).is_conflict());
    }
}
