use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

// -----------------------------------------------------------------------------
// ----- BackendError ----------------------------------------------------------

/// Failures talking to the messaging backend, independent of the transport
/// that produced them.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connect to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("subscribe to {subject} failed: {reason}")]
    Subscribe { subject: String, reason: String },

    #[error("no reply within {0:?}")]
    ReplyTimeout(Duration),

    #[error("reply subscription closed")]
    MailboxClosed,
}

// -----------------------------------------------------------------------------
// ----- PoolError -------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("backend dial failed: {0}")]
    Dial(#[from] BackendError),
}

// -----------------------------------------------------------------------------
// ----- Admission -------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all {capacity} slots are busy")]
pub struct AdmissionDenied {
    pub capacity: usize,
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Busy(#[from] AdmissionDenied),

    #[error("backend unavailable: {0}")]
    Backend(#[from] PoolError),
}

impl AdmissionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::Busy(_) => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            AdmissionError::Busy(_) => "busy",
            AdmissionError::Backend(_) => "backend",
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SessionError ----------------------------------------------------------

/// Terminal cause reported by one of a session's stages or its supervisor.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("client closed the connection")]
    ClientClosed,

    #[error("client transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("backend publish failed: {0}")]
    BackendPublish(BackendError),

    #[error("backend reply subscription failed: {0}")]
    BackendSubscribe(BackendError),

    #[error("no backend reply within {0:?}")]
    ReplyTimeout(Duration),

    #[error("no outbound activity within {0:?}")]
    InactivityTimeout(Duration),
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SessionError::ReplyTimeout(_) | SessionError::InactivityTimeout(_)
        )
    }
}

// -----------------------------------------------------------------------------
// ----- SessionEnd ------------------------------------------------------------

/// Why a session stopped. Only `Failed` is an internal fault.
#[derive(Debug)]
pub enum SessionEnd {
    ClientClosed,
    Shutdown,
    TimedOut(SessionError),
    Failed(SessionError),
}

impl SessionEnd {
    pub fn is_failure(&self) -> bool {
        matches!(self, SessionEnd::Failed(_))
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            SessionEnd::ClientClosed => "client_closed",
            SessionEnd::Shutdown => "shutdown",
            SessionEnd::TimedOut(_) => "timed_out",
            SessionEnd::Failed(_) => "failed",
        }
    }
}

impl From<SessionError> for SessionEnd {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::ClientClosed => SessionEnd::ClientClosed,
            err if err.is_timeout() => SessionEnd::TimedOut(err),
            err => SessionEnd::Failed(err),
        }
    }
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::ClientClosed => f.write_str("client closed"),
            SessionEnd::Shutdown => f.write_str("server shutdown"),
            SessionEnd::TimedOut(err) => write!(f, "timed out: {err}"),
            SessionEnd::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_too_many_requests() {
        let err = AdmissionError::from(AdmissionDenied { capacity: 4 });
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.to_string(), "all 4 slots are busy");
    }

    #[test]
    fn dial_failure_maps_to_service_unavailable() {
        let err = AdmissionError::from(PoolError::Dial(BackendError::Connect {
            target: "nats://nowhere".into(),
            reason: "refused".into(),
        }));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.as_label(), "backend");
    }

    #[test]
    fn timeouts_are_not_failures() {
        let end = SessionEnd::from(SessionError::ReplyTimeout(Duration::from_secs(1)));
        assert!(matches!(end, SessionEnd::TimedOut(_)));
        assert!(!end.is_failure());
        assert_eq!(end.as_label(), "timed_out");

        let end = SessionEnd::from(SessionError::ClientClosed);
        assert!(matches!(end, SessionEnd::ClientClosed));

        let end = SessionEnd::from(SessionError::BackendPublish(BackendError::MailboxClosed));
        assert!(end.is_failure());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
