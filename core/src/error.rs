//! Error taxonomy for the moderation pipeline.
//!
//! Classifier-side failures (`ClassifierUnavailable`, `DecodeFailure`,
//! `InferenceFailure`, `InferenceTimeout`) are recovered by the gates into a
//! fail-open / fail-closed verdict and never escape the authoritative gate.
//! `PolicyMisconfigured` only comes out of configuration loading.
//! Policy violations are not errors at all: see [`crate::Rejection`].

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the moderation pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum ModerationError {
    /// The classifier model is not loaded or its load failed.
    #[error("classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    /// The artifact bytes are not a decodable image.
    #[error("artifact is not a valid image: {0}")]
    DecodeFailure(String),

    /// A classification call on a valid buffer failed.
    #[error("inference failed: {0}")]
    InferenceFailure(String),

    /// A classification call did not complete within the configured budget.
    #[error("inference timed out after {0:?}")]
    InferenceTimeout(Duration),

    /// Configuration values are out of range or unparsable.
    #[error("moderation policy misconfigured: {0}")]
    PolicyMisconfigured(String),

    /// Artifact storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The post repository refused or failed to persist a record.
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl ModerationError {
    /// Returns `true` for errors raised while trying to classify an artifact.
    ///
    /// These are the ones the gates fold into a fail-open/fail-closed verdict.
    #[must_use]
    pub const fn is_classifier_error(&self) -> bool {
        matches!(
            self,
            Self::ClassifierUnavailable(_)
                | Self::DecodeFailure(_)
                | Self::InferenceFailure(_)
                | Self::InferenceTimeout(_)
        )
    }
}

/// Errors raised by an [`crate::storage::ArtifactStorage`] backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No artifact is stored under this handle.
    #[error("artifact {0} not found")]
    NotFound(String),

    /// The handle contains characters that are not allowed in a handle.
    #[error("invalid artifact handle {0:?}")]
    InvalidHandle(String),

    /// Underlying I/O failure.
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T, E = ModerationError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_errors_are_flagged() {
        assert!(ModerationError::ClassifierUnavailable("x".into()).is_classifier_error());
        assert!(ModerationError::DecodeFailure("x".into()).is_classifier_error());
        assert!(ModerationError::InferenceFailure("x".into()).is_classifier_error());
        assert!(ModerationError::InferenceTimeout(Duration::from_secs(1)).is_classifier_error());

        assert!(!ModerationError::PolicyMisconfigured("x".into()).is_classifier_error());
        assert!(!ModerationError::Persistence("x".into()).is_classifier_error());
        assert!(
            !ModerationError::Storage(StorageError::NotFound("h".into())).is_classifier_error()
        );
    }

    #[test]
    fn storage_errors_convert() {
        let err: ModerationError = StorageError::InvalidHandle("../etc".into()).into();
        assert!(err.to_string().contains("invalid artifact handle"));
    }
}
