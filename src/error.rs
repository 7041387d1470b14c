//! Error taxonomy for the pipeline.
//!
//! Library code returns [`Result`] with a closed set of [`Error`] variants.
//! Callers that need to branch on *what* went wrong (retry, degrade, skip)
//! match on [`Error::kind`] instead of message text. Command-line glue wraps
//! these in `anyhow` the same way the rest of the binary does.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], stable for tests and control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// External call failed in a way that may succeed on retry.
    TransientExternal,
    /// External service refused the request; retrying will not help.
    ExternalRejected,
    /// Response could not be parsed into the expected shape.
    MalformedResponse,
    /// An algorithm or backend is not usable for this input.
    MissingDependency,
    /// Relationship endpoint does not exist in the graph store.
    ReferentialIntegrity,
    /// Stage cannot continue (input, output, or manifest failure).
    StageFatal,
    /// Invalid configuration or parameters.
    Config,
    /// Store backend failure.
    Store,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transient external failure: {0}")]
    Transient(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("external service rejected request: {0}")]
    Rejected(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("cannot write {rel} from {from} to {to}: endpoint {missing} does not exist")]
    ReferentialIntegrity {
        rel: String,
        from: String,
        to: String,
        missing: String,
    },

    #[error("stage '{stage}' failed: {reason}")]
    StageFatal { stage: String, reason: String },

    #[error("manifest {} is corrupt at line {line}", path.display())]
    ManifestCorrupt { path: PathBuf, line: usize },

    #[error("artifact {} line {line}: {reason}", path.display())]
    Artifact {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient(_) | Error::Timeout(_) => ErrorKind::TransientExternal,
            Error::Rejected(_) => ErrorKind::ExternalRejected,
            Error::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Error::MissingDependency(_) => ErrorKind::MissingDependency,
            Error::ReferentialIntegrity { .. } => ErrorKind::ReferentialIntegrity,
            Error::StageFatal { .. }
            | Error::ManifestCorrupt { .. }
            | Error::Artifact { .. }
            | Error::Io(_) => ErrorKind::StageFatal,
            Error::Config(_) => ErrorKind::Config,
            Error::Store(_) | Error::Database(_) => ErrorKind::Store,
        }
    }

    /// Whether a retry of the same call might succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientExternal
    }

    pub(crate) fn stage_fatal(stage: &str, reason: impl std::fmt::Display) -> Self {
        Error::StageFatal {
            stage: stage.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            return Error::Transient(e.to_string());
        }
        match e.status() {
            Some(status) if status.as_u16() == 429 || status.is_server_error() => {
                Error::Transient(e.to_string())
            }
            Some(_) => Error::Rejected(e.to_string()),
            None if e.is_decode() => Error::MalformedResponse(e.to_string()),
            None => Error::Transient(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedResponse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            Error::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::TransientExternal
        );
        assert!(Error::Transient("503".into()).is_transient());
        assert!(!Error::Rejected("400".into()).is_transient());
        assert_eq!(
            Error::ManifestCorrupt {
                path: PathBuf::from("m.log"),
                line: 3
            }
            .kind(),
            ErrorKind::StageFatal
        );
        let ri = Error::ReferentialIntegrity {
            rel: "PART_OF".into(),
            from: "Chunk:a".into(),
            to: "Message:b".into(),
            missing: "Message:b".into(),
        };
        assert_eq!(ri.kind(), ErrorKind::ReferentialIntegrity);
        assert!(ri.to_string().contains("Message:b"));
    }

    #[test]
    fn test_json_error_is_malformed() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }
}
