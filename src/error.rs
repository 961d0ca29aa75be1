use thiserror::Error;

/// Failure of a single object store call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Rejected locally, before any request was issued.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// Non-2xx response, or a transport failure when `status` is `None`.
    #[error("{}", remote_message(*status, message))]
    Remote { status: Option<u16>, message: String },

    #[error("request cancelled")]
    Cancelled,
}

fn remote_message(status: Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("remote returned {code}: {message}"),
        None => format!("transport error: {message}"),
    }
}

impl StoreError {
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Remote {
            status: None,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Remote { status, .. } => *status,
            _ => None,
        }
    }

    /// True for primary or secondary rate-limit rejections.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Remote {
                status: Some(429), ..
            } => true,
            Self::Remote {
                status: Some(403),
                message,
            } => message.to_ascii_lowercase().contains("rate limit"),
            _ => false,
        }
    }

    /// True when the entry never reached the remote.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::PayloadTooLarge { .. } | Self::Cancelled)
    }
}

/// Run-level failure of a publish operation.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid source: {0}")]
    InvalidSource(String),

    #[error("file collection failed: {0}")]
    Collection(String),

    #[error("nothing to publish: no files were collected")]
    NothingToPublish,

    #[error("repository '{0}' already exists")]
    AlreadyExists(String),

    #[error("repository provisioning failed: {0}")]
    Provisioning(#[source] StoreError),

    #[error("no files were uploaded successfully")]
    NoFilesUploaded,

    #[error("tree creation failed: {0}")]
    TreeCreation(#[source] StoreError),

    #[error("commit creation failed: {0}")]
    CommitCreation(#[source] StoreError),

    #[error("branch update to commit {commit} failed: {source}")]
    RefUpdateFailed {
        commit: String,
        #[source]
        source: StoreError,
    },

    #[error("publish cancelled")]
    Cancelled,
}

impl PublishError {
    /// Map a provisioning-stage store error, treating cancellation uniformly.
    pub(crate) fn provisioning(err: StoreError) -> Self {
        match err {
            StoreError::Cancelled => Self::Cancelled,
            other => Self::Provisioning(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_display_includes_status() {
        let err = StoreError::remote(422, "Validation Failed");
        assert_eq!(err.to_string(), "remote returned 422: Validation Failed");
        assert_eq!(err.status(), Some(422));
    }

    #[test]
    fn transport_error_has_no_status() {
        let err = StoreError::transport("connection reset");
        assert_eq!(err.status(), None);
        assert!(err.to_string().starts_with("transport error"));
    }

    #[test]
    fn rate_limit_detection() {
        assert!(StoreError::remote(429, "slow down").is_rate_limited());
        assert!(StoreError::remote(403, "API rate limit exceeded for user").is_rate_limited());
        assert!(!StoreError::remote(403, "Resource not accessible").is_rate_limited());
        assert!(!StoreError::PayloadTooLarge { size: 2, limit: 1 }.is_rate_limited());
    }

    #[test]
    fn cancellation_during_provisioning_is_a_cancel() {
        assert!(matches!(
            PublishError::provisioning(StoreError::Cancelled),
            PublishError::Cancelled
        ));
        assert!(matches!(
            PublishError::provisioning(StoreError::remote(500, "boom")),
            PublishError::Provisioning(_)
        ));
    }
}
