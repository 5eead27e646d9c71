use std::io;
use std::sync::Arc;

use rdp_proto::license::LicenseErrorCode;
use rdp_proto::nego::{FailureCode, SecurityProtocol};
use rdp_proto::sspi::SspiError;
use thiserror::Error;

pub type RdpResult<T> = Result<T, RdpError>;

/// Why the connection request was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NegotiationFailure {
    #[error("server refused the request ({0})")]
    Server(FailureCode),
    #[error("server selected {0:?}, which was not offered")]
    UnexpectedProtocol(SecurityProtocol),
}

/// Every way a session can fail.
///
/// Only [`RdpError::Decode`] errors scoped to a single update batch are recovered from;
/// everything else terminates the connection.
#[derive(Debug, Clone, Error)]
pub enum RdpError {
    #[error("connection lost")]
    ConnectionLost(#[source] Arc<io::Error>),
    #[error("malformed frame")]
    MalformedFrame(#[source] rdp_proto::Error),
    #[error("failed to decode PDU")]
    Decode(#[from] rdp_proto::Error),
    #[error("negotiation rejected: {0}")]
    NegotiationRejected(NegotiationFailure),
    #[error("failed to join channel {0}")]
    ChannelSetupFailed(u16),
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),
    #[error("integrity check failed for {0}")]
    IntegrityViolation(&'static str),
    #[error("license denied: {0}")]
    LicenseDenied(LicenseErrorCode),
    #[error("TLS upgrade failed")]
    Tls(#[source] Arc<io::Error>),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl RdpError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    pub(crate) fn unexpected_eof() -> Self {
        Self::ConnectionLost(Arc::new(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection",
        )))
    }
}

impl From<io::Error> for RdpError {
    fn from(error: io::Error) -> Self {
        Self::ConnectionLost(Arc::new(error))
    }
}

impl From<SspiError> for RdpError {
    fn from(error: SspiError) -> Self {
        Self::AuthenticationRejected(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_human_readable() {
        let error = RdpError::NegotiationRejected(NegotiationFailure::Server(FailureCode::HYBRID_REQUIRED_BY_SERVER));
        assert!(error.to_string().starts_with("negotiation rejected: server refused the request"));

        let error = RdpError::ChannelSetupFailed(1004);
        assert_eq!(error.to_string(), "failed to join channel 1004");

        let error = RdpError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(error, RdpError::ConnectionLost(_)));
    }
}
