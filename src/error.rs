//! Error taxonomy for the enrichment and migration pipeline.
//!
//! Store and setup code works in `anyhow::Result` like the rest of the
//! crate. Anything that flows through the retry controller or is reported
//! per record is a [`PipelineError`], because the variant decides whether
//! it is retried and whether it aborts the run.

use std::fmt;

use course_harness_core::models::RecordRef;
use course_harness_core::validate::ShapeIssue;
use thiserror::Error;

/// Flavors of failure that are worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    RateLimited,
    Upstream(u16),
    Network,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientKind::Timeout => write!(f, "timeout"),
            TransientKind::RateLimited => write!(f, "rate limited"),
            TransientKind::Upstream(status) => write!(f, "upstream {}", status),
            TransientKind::Network => write!(f, "network"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{kind}: {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("malformed response from enrichment service: {0}")]
    MalformedResponse(String),

    #[error("enrichment service authentication failed: {0}")]
    Auth(String),

    #[error("enrichment service rejected the input: {0}")]
    Rejected(String),

    #[error("enrichment service is disabled")]
    Disabled,

    #[error("invalid record shape: {0}")]
    DataShape(ShapeIssue),

    #[error("batch commit failed, {count} staged mutations lost: {cause:#}", count = .lost.len())]
    CommitFailed {
        lost: Vec<RecordRef>,
        cause: anyhow::Error,
    },

    #[error("backup failed: {0:#}")]
    Backup(anyhow::Error),

    #[error("store error: {0:#}")]
    Store(anyhow::Error),

    #[error("setup failed: {0}")]
    Setup(String),
}

impl PipelineError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        PipelineError::Transient {
            kind,
            message: message.into(),
        }
    }

    /// Map an HTTP status from the enrichment service onto the taxonomy.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body);
        match status {
            429 => PipelineError::transient(TransientKind::RateLimited, message),
            500..=599 => PipelineError::transient(TransientKind::Upstream(status), message),
            408 => PipelineError::transient(TransientKind::Timeout, message),
            401 | 403 => PipelineError::Auth(message),
            _ => PipelineError::Rejected(message),
        }
    }

    /// Timeouts, rate limits, 5xx and network failures are retried;
    /// everything else fails immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient { .. })
    }

    /// Short machine-readable name, used in logs and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Transient { .. } => "transient",
            PipelineError::MalformedResponse(_) => "malformed_response",
            PipelineError::Auth(_) => "auth",
            PipelineError::Rejected(_) => "rejected",
            PipelineError::Disabled => "disabled",
            PipelineError::DataShape(_) => "data_shape",
            PipelineError::CommitFailed { .. } => "commit_failed",
            PipelineError::Backup(_) => "backup_failed",
            PipelineError::Store(_) => "store",
            PipelineError::Setup(_) => "setup",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(PipelineError::from_http_status(429, "").is_retryable());
        assert!(PipelineError::from_http_status(503, "").is_retryable());
        assert!(PipelineError::from_http_status(408, "").is_retryable());
        assert!(matches!(
            PipelineError::from_http_status(401, ""),
            PipelineError::Auth(_)
        ));
        assert!(matches!(
            PipelineError::from_http_status(422, "bad"),
            PipelineError::Rejected(_)
        ));
        assert!(!PipelineError::from_http_status(400, "").is_retryable());
    }

    #[test]
    fn commit_failure_message_counts_lost() {
        let e = PipelineError::CommitFailed {
            lost: vec![RecordRef::collection("a"), RecordRef::collection("b")],
            cause: anyhow::anyhow!("disk full"),
        };
        assert_eq!(
            e.to_string(),
            "batch commit failed, 2 staged mutations lost: disk full"
        );
    }
}
