//! Errors surfaced to application code.
//!
//! Connection failures are deliberately absent: they are recovered by the
//! reconnecting client and only visible as connection state.

use std::fmt;

/// Failure of a request issued over a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session ended before a response arrived.
    Closed,
    /// No response within the caller-supplied deadline.
    Timeout,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Session closed"),
            Self::Timeout => write!(f, "Request timed out"),
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(SessionError::Closed.to_string(), "Session closed");
        assert_eq!(SessionError::Timeout.to_string(), "Request timed out");
    }

    #[test]
    fn test_converts_into_anyhow() {
        let err: anyhow::Error = SessionError::Closed.into();
        assert!(err.downcast_ref::<SessionError>().is_some());
    }
}
