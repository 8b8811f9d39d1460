//! Domain error type.
//!
//! Most of the crate returns `anyhow::Result`. Failures that the HTTP layer
//! must map to a specific status are raised as a [`CxError`] inside the
//! `anyhow::Error` and recovered with [`CxError::find`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CxError {
    /// Input failed a domain rule (400).
    #[error("{0}")]
    Validation(String),

    /// Caller lacks the permission or ownership required (403).
    #[error("{0}")]
    Forbidden(String),

    /// Entity does not exist or is soft-deleted (404).
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Operation would violate a uniqueness rule (409).
    #[error("{0}")]
    Conflict(String),

    /// A required integration (embeddings, chat) is disabled in config.
    #[error("{0} is disabled")]
    Disabled(String),
}

impl CxError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Looks for a `CxError` anywhere in an `anyhow` error chain.
    pub fn find(err: &anyhow::Error) -> Option<&CxError> {
        err.chain().find_map(|e| e.downcast_ref::<CxError>())
    }
}

/// Returns a [`CxError::Validation`] when `cond` is false.
pub fn ensure_valid(cond: bool, message: impl Into<String>) -> anyhow::Result<()> {
    if cond {
        Ok(())
    } else {
        Err(CxError::Validation(message.into()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn find_sees_through_context() {
        let err: anyhow::Error = Err::<(), _>(CxError::not_found("thread", "abc"))
            .context("loading thread")
            .unwrap_err();
        match CxError::find(&err) {
            Some(CxError::NotFound { entity, id }) => {
                assert_eq!(*entity, "thread");
                assert_eq!(id, "abc");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn ensure_valid_produces_validation_error() {
        let err = ensure_valid(false, "name is required").unwrap_err();
        assert!(matches!(CxError::find(&err), Some(CxError::Validation(_))));
        assert!(ensure_valid(true, "unused").is_ok());
    }
}
