use thiserror::Error;

pub type Result<T> = std::result::Result<T, MnemonError>;

/// Which cooperative role produced an inference failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceRole {
    Observer,
    Reflector,
}

impl InferenceRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observer => "observer",
            Self::Reflector => "reflector",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceFailureKind {
    /// Retryable on a later cycle (network, 5xx, 429).
    Transient,
    /// Misconfiguration or a rejected request; retrying will not help.
    Fatal,
    /// The model answered but the payload could not be interpreted.
    Schema,
}

#[derive(Debug, Error)]
pub enum MnemonError {
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("memory operation aborted")]
    Aborted,

    #[error("{} inference failed: {message}", inference_role.as_str())]
    Inference {
        inference_role: InferenceRole,
        kind: InferenceFailureKind,
        message: String,
    },

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MnemonError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidScope(_) => "INVALID_SCOPE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::Aborted => "ABORTED",
            Self::Inference { .. } => "INFERENCE_FAILED",
            Self::LockPoisoned(_) => "LOCK_POISONED",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Sqlite(_) => "SQLITE_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    pub(crate) fn lock_poisoned(which: &'static str) -> Self {
        Self::LockPoisoned(which)
    }
}

pub(crate) fn observer_error(kind: InferenceFailureKind, message: impl Into<String>) -> MnemonError {
    MnemonError::Inference {
        inference_role: InferenceRole::Observer,
        kind,
        message: message.into(),
    }
}

pub(crate) fn reflector_error(
    kind: InferenceFailureKind,
    message: impl Into<String>,
) -> MnemonError {
    MnemonError::Inference {
        inference_role: InferenceRole::Reflector,
        kind,
        message: message.into(),
    }
}

pub(crate) fn status_failure_kind(status: reqwest::StatusCode) -> InferenceFailureKind {
    if status.is_server_error() || status.as_u16() == 429 {
        InferenceFailureKind::Transient
    } else {
        InferenceFailureKind::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_error_carries_role_in_display() {
        let err = observer_error(InferenceFailureKind::Transient, "connection reset");
        assert_eq!(err.code(), "INFERENCE_FAILED");
        assert!(err.to_string().contains("observer"));
    }

    #[test]
    fn status_classification_treats_5xx_and_429_as_transient() {
        assert_eq!(
            status_failure_kind(reqwest::StatusCode::BAD_GATEWAY),
            InferenceFailureKind::Transient
        );
        assert_eq!(
            status_failure_kind(reqwest::StatusCode::TOO_MANY_REQUESTS),
            InferenceFailureKind::Transient
        );
        assert_eq!(
            status_failure_kind(reqwest::StatusCode::BAD_REQUEST),
            InferenceFailureKind::Fatal
        );
    }
}
