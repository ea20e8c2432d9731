use std::time::Duration;

use thiserror::Error;

use crate::job::{JobKind, JobOutcome};
use crate::penalty::SubProtocol;
use crate::protocol::{TextEncoding, TransportError};

/// Failures surfaced by the protocol client and the HTTP guard.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Every resend timed out.
    #[error("no reply after {attempts} attempt(s)")]
    TransportTimeout { attempts: u32 },

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The reply could not be parsed or its code does not fit the request.
    #[error("unexpected reply (code {code:?}): {payload}")]
    ProtocolViolation { code: Option<u16>, payload: String },

    /// The provider no longer recognises the session. The slot was cleared.
    #[error("session expired")]
    SessionExpired,

    /// Credentials were refused. Calls fail fast until they are replaced.
    #[error("login rejected: {reason}")]
    LoginFailed { reason: String },

    #[error("banned on {sub_protocol}, retry in {retry_in:?}")]
    Banned {
        sub_protocol: SubProtocol,
        retry_in: Duration,
    },

    #[error("{sub_protocol} server busy, retry in {retry_in:?}")]
    ServerBusy {
        sub_protocol: SubProtocol,
        retry_in: Duration,
    },

    #[error("server error {code}: {message}")]
    ServerError { code: u16, message: String },

    /// The provider refused the request itself; resending will not help.
    #[error("request rejected with {code}: {message}")]
    Rejected { code: u16, message: String },

    #[error("cannot convert text as {encoding}: {detail}")]
    Encoding {
        encoding: TextEncoding,
        detail: String,
    },
}

impl ProtocolError {
    pub(crate) fn violation(code: Option<u16>, payload: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            code,
            payload: payload.into(),
        }
    }

    /// Whether resending later has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.outcome(), JobOutcome::Fail { .. })
    }

    /// Maps the failure onto the job outcome an executor should report.
    ///
    /// Bans and overload defer the job without spending an attempt, timeouts
    /// and server-side errors retry with backoff, and everything that points
    /// at a bad request or bad credentials fails terminally.
    pub fn outcome(&self) -> JobOutcome {
        match self {
            ProtocolError::Banned { retry_in, .. }
            | ProtocolError::ServerBusy { retry_in, .. } => {
                JobOutcome::deferred(self.to_string(), *retry_in)
            }
            ProtocolError::TransportTimeout { .. }
            | ProtocolError::Transport(_)
            | ProtocolError::SessionExpired
            | ProtocolError::ServerError { .. } => JobOutcome::retry(self.to_string()),
            ProtocolError::ProtocolViolation { .. }
            | ProtocolError::LoginFailed { .. }
            | ProtocolError::Rejected { .. }
            | ProtocolError::Encoding { .. } => JobOutcome::fail(self.to_string()),
        }
    }
}

/// Failures surfaced by the scheduler API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no job type registered as `{0}`")]
    UnknownJobKind(JobKind),

    #[error("invalid input for `{kind}`: {reason}")]
    InvalidInput { kind: JobKind, reason: String },

    /// A slot claim pushed a counter past its ceiling. Indicates a bug.
    #[error("{scope} has {in_flight} jobs in flight, ceiling is {ceiling}")]
    ConcurrencyCeilingExceeded {
        scope: String,
        in_flight: usize,
        ceiling: usize,
    },

    #[error("execution lock `{name}` could not be acquired")]
    LockUnavailable { name: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bans_defer_without_failing() {
        let err = ProtocolError::Banned {
            sub_protocol: SubProtocol::Udp,
            retry_in: Duration::from_secs(300),
        };

        match err.outcome() {
            JobOutcome::Deferred { retry_in, .. } => {
                assert_eq!(retry_in, Duration::from_secs(300))
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(err.is_retryable());
    }

    #[test]
    fn violations_are_terminal() {
        let err = ProtocolError::violation(Some(220), "1|2");
        assert!(matches!(err.outcome(), JobOutcome::Fail { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeouts_retry() {
        let err = ProtocolError::TransportTimeout { attempts: 3 };
        assert!(matches!(err.outcome(), JobOutcome::Retry { .. }));
    }
}
