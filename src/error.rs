//! Error types for warcdex operations
//!
//! This module defines the error taxonomy used throughout warcdex,
//! providing clear error messages and proper error chaining support.
//! Absence of a matching record is never an error: resolution lookups
//! return `Ok(None)` so callers can render a fallback.

use thiserror::Error;

/// Main error type for all warcdex operations
#[derive(Debug, Error)]
pub enum WarcdexError {
    /// Request validation failed before any network call
    #[error("Invalid request: {field} - {reason}. {suggestion}")]
    InvalidRequest {
        field: String,
        reason: String,
        suggestion: String,
    },

    /// Network or backend error during a page fetch
    #[error("Transport error during {operation}: {reason}")]
    Transport { operation: String, reason: String },

    /// Resource limits exceeded
    #[error("Resource exhausted: {resource} - {reason}. {suggestion}")]
    ResourceExhausted {
        resource: String,
        reason: String,
        suggestion: String,
    },

    /// A single shard's stream failed, aborting the merge
    #[error("Shard '{shard}' failed: {source}")]
    Shard {
        shard: String,
        #[source]
        source: Box<WarcdexError>,
    },

    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl WarcdexError {
    /// Create an invalid request error
    pub fn invalid_request(
        field: impl Into<String>,
        reason: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::InvalidRequest {
            field: field.into(),
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a transport error naming the failed operation
    pub fn transport(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(
        resource: impl Into<String>,
        reason: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Wrap an error with the shard it originated from
    pub fn shard(shard: impl Into<String>, source: WarcdexError) -> Self {
        Self::Shard {
            shard: shard.into(),
            source: Box::new(source),
        }
    }

    /// Create a detailed config error
    pub fn config_error(
        field: impl Into<String>,
        reason: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Config(format!(
            "{} - {}: {}",
            field.into(),
            reason.into(),
            suggestion.into()
        ))
    }

    /// True for errors callers may reasonably retry at their own policy level.
    ///
    /// The streaming core never retries internally; this only helps callers
    /// distinguish "backend down" from "result set too large to deduplicate".
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Http(_) => true,
            Self::Shard { source, .. } => source.is_transport(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_message() {
        let err =
            WarcdexError::invalid_request("fields", "must not be empty", "List the fields to export");
        assert_eq!(
            err.to_string(),
            "Invalid request: fields - must not be empty. List the fields to export"
        );
    }

    #[test]
    fn test_shard_error_preserves_source() {
        let inner = WarcdexError::transport("page fetch", "connection refused");
        let err = WarcdexError::shard("shard2", inner);
        assert!(err.to_string().contains("shard2"));
        assert!(err.is_transport());
    }

    #[test]
    fn test_resource_exhausted_is_not_transport() {
        let err = WarcdexError::resource_exhausted(
            "unique tracker",
            "5000000 unique ids exceeded",
            "Raise max_unique or drop the uniqueness guarantee",
        );
        assert!(!err.is_transport());
    }
}
