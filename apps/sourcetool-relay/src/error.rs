use std::error::Error as StdError;

use sourcetool_proto::Exception;
use thiserror::Error;

use crate::connection::ConnectionError;
use crate::persistence::PersistenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The peer sent something wrong; logged at warn.
    Client,
    /// The relay or one of its backends failed; logged at error.
    Server,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("transport error: {0}")]
    TransientIo(#[from] ConnectionError),
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl RelayError {
    pub fn protocol(detail: impl Into<String>) -> Self {
        RelayError::Protocol(detail.into())
    }

    pub fn authorization(detail: impl Into<String>) -> Self {
        RelayError::Authorization(detail.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        RelayError::NotFound(what.into())
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        RelayError::Unavailable(detail.into())
    }

    pub fn severity(&self) -> Severity {
        match self {
            RelayError::Protocol(_) | RelayError::Authorization(_) | RelayError::NotFound(_) => {
                Severity::Client
            }
            RelayError::Unavailable(_) | RelayError::TransientIo(_) | RelayError::Persistence(_) => {
                Severity::Server
            }
        }
    }

    /// Label used for the `kind` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Protocol(_) => "protocol",
            RelayError::Authorization(_) => "authorization",
            RelayError::NotFound(_) => "not_found",
            RelayError::Unavailable(_) => "unavailable",
            RelayError::TransientIo(_) => "transient_io",
            RelayError::Persistence(_) => "persistence",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            RelayError::Protocol(_) => "ProtocolError",
            RelayError::Authorization(_) => "AuthorizationError",
            RelayError::NotFound(_) => "NotFoundError",
            RelayError::Unavailable(_) => "UnavailableError",
            RelayError::TransientIo(_) => "TransientIOError",
            RelayError::Persistence(_) => "PersistenceError",
        }
    }

    /// Structured reply sent back on the socket that triggered the error.
    pub fn to_exception(&self, session_id: Option<&str>) -> Exception {
        let mut stack_trace = Vec::new();
        let mut source = self.source();
        while let Some(cause) = source {
            stack_trace.push(cause.to_string());
            source = cause.source();
        }
        Exception {
            title: self.title().to_string(),
            message: self.to_string(),
            stack_trace,
            session_id: session_id.unwrap_or_default().to_string(),
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_splits_client_and_server_faults() {
        assert_eq!(RelayError::protocol("bad").severity(), Severity::Client);
        assert_eq!(RelayError::not_found("session").severity(), Severity::Client);
        assert_eq!(RelayError::unavailable("no host").severity(), Severity::Server);
        assert_eq!(
            RelayError::from(PersistenceError::Backend("down".into())).severity(),
            Severity::Server
        );
    }

    #[test]
    fn exception_carries_cause_chain() {
        let err = RelayError::from(PersistenceError::Backend("pool timed out".into()));
        let exception = err.to_exception(Some("s-1"));
        assert_eq!(exception.title, "PersistenceError");
        assert_eq!(exception.session_id, "s-1");
        assert_eq!(
            exception.stack_trace,
            vec!["persistence backend error: pool timed out".to_string()]
        );
    }
}
