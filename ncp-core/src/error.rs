use std::fmt;

/// Classification used by the Health Monitor to decide whether a failure is
/// worth quarantining an endpoint over. Mirrors the taxonomy in spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network blip, timeout — the endpoint may well still be fine.
    Transient,
    /// Auth, protocol, or repeated spawn failure — the endpoint is broken
    /// until something changes out of band.
    Fatal,
}

/// The orchestrator's closed error taxonomy. Kept distinct from the
/// `anyhow::Error` used for ambient plumbing because the Pool/HealthMonitor
/// need to pattern-match on *kind* to decide `FailureClass`.
#[derive(Debug, thiserror::Error)]
pub enum NcpError {
    #[error("invalid profile: {0}")]
    ConfigInvalid(String),

    #[error("command rejected: {0}")]
    CommandUnsafe(String),

    #[error("failed to spawn endpoint transport: {0}")]
    SpawnFailed(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("request timed out")]
    Timeout,

    #[error("endpoint or tool not found: {0}")]
    NotFound(String),

    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl NcpError {
    /// Classify this error for Health Monitor bookkeeping. `None` means "not
    /// a failure the monitor should record at all" (e.g. `not_found`,
    /// `cancelled` per spec §7's recovery table).
    pub fn classify(&self) -> Option<FailureClass> {
        match self {
            NcpError::NetworkError(_) | NcpError::Timeout => Some(FailureClass::Transient),
            NcpError::AuthFailed(_) | NcpError::ProtocolError(_) | NcpError::SpawnFailed(_) => {
                Some(FailureClass::Fatal)
            }
            NcpError::ConfigInvalid(_)
            | NcpError::CommandUnsafe(_)
            | NcpError::NotFound(_)
            | NcpError::Unavailable(_)
            | NcpError::Cancelled => None,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Transient => write!(f, "transient"),
            FailureClass::Fatal => write!(f, "fatal"),
        }
    }
}

pub type Result<T> = std::result::Result<T, NcpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_classify_transient() {
        assert_eq!(
            NcpError::Timeout.classify(),
            Some(FailureClass::Transient)
        );
        assert_eq!(
            NcpError::NetworkError("boom".into()).classify(),
            Some(FailureClass::Transient)
        );
    }

    #[test]
    fn fatal_errors_classify_fatal() {
        assert_eq!(
            NcpError::AuthFailed("boom".into()).classify(),
            Some(FailureClass::Fatal)
        );
        assert_eq!(
            NcpError::ProtocolError("boom".into()).classify(),
            Some(FailureClass::Fatal)
        );
        assert_eq!(
            NcpError::SpawnFailed("boom".into()).classify(),
            Some(FailureClass::Fatal)
        );
    }

    #[test]
    fn not_found_and_cancelled_are_unclassified() {
        assert_eq!(NcpError::NotFound("x".into()).classify(), None);
        assert_eq!(NcpError::Cancelled.classify(), None);
    }
}
