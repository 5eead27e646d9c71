//! X.224 security protocol negotiation and the TLS upgrade that follows it.

use std::io;
use std::sync::Arc;

use rdp_proto::nego::{
    ConnectionConfirm, ConnectionRequest, NegotiatedProtocol, NegotiationRequestFlags, NegotiationResponseFlags,
    ProtocolSet, SecurityProtocol,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ClientConfig;
use crate::error::{NegotiationFailure, RdpError, RdpResult};
use crate::tls;
use crate::transport::{ErasedStream, Frame, Framed};

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiation {
    pub protocol: NegotiatedProtocol,
    /// Raw `selectedProtocol`, echoed back in the client core data.
    pub selected: SecurityProtocol,
    pub flags: NegotiationResponseFlags,
}

impl Negotiation {
    /// Whether the server sends the early user authorization result after CredSSP.
    pub fn early_user_auth(&self) -> bool {
        self.selected.contains(SecurityProtocol::HYBRID_EX)
    }
}

pub fn connection_request(config: &ClientConfig) -> ConnectionRequest {
    ConnectionRequest {
        cookie: Some(config.credentials.username.clone()),
        flags: NegotiationRequestFlags::empty(),
        protocol: config.protocols.to_requested(),
    }
}

/// Checks the server answer against what was offered.
pub fn process_confirm(offered: ProtocolSet, confirm: ConnectionConfirm) -> RdpResult<Negotiation> {
    match confirm {
        ConnectionConfirm::Failure { code } => Err(RdpError::NegotiationRejected(NegotiationFailure::Server(code))),
        ConnectionConfirm::Response { flags, protocol } => {
            let negotiated = NegotiatedProtocol::from_selected(protocol)
                .filter(|negotiated| offered.contains_protocol(*negotiated))
                .ok_or(RdpError::NegotiationRejected(NegotiationFailure::UnexpectedProtocol(protocol)))?;

            Ok(Negotiation {
                protocol: negotiated,
                selected: protocol,
                flags,
            })
        }
    }
}

/// Sends the connection request and waits for the confirm, bounded by the connect timeout.
#[instrument(skip_all)]
pub async fn negotiate<S>(framed: &mut Framed<S>, config: &ClientConfig) -> RdpResult<Negotiation>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = connection_request(config);

    let mut buf = Vec::new();
    request.encode(&mut buf)?;
    framed.write_all(&buf).await?;

    debug!(requested = ?request.protocol, "Idle -> RequestSent");

    let frame = tokio::time::timeout(config.connect_timeout, framed.read_frame())
        .await
        .map_err(|_| RdpError::Timeout("connection confirm"))??;

    let Frame::SlowPath(frame) = frame else {
        return Err(RdpError::protocol("fast-path frame received before negotiation completed"));
    };

    let confirm = ConnectionConfirm::decode(&frame)?;

    match process_confirm(config.protocols, confirm) {
        Ok(negotiation) => {
            debug!(protocol = %negotiation.protocol, selected = ?negotiation.selected, "RequestSent -> Negotiated");
            Ok(negotiation)
        }
        Err(error) => {
            debug!(%error, "RequestSent -> Failed");
            Err(error)
        }
    }
}

/// Runs the TLS handshake over the negotiated stream and returns the new transport along with the
/// server public key.
#[instrument(skip_all)]
pub async fn upgrade_to_tls(framed: Framed<ErasedStream>, server_name: &str) -> RdpResult<(Framed<ErasedStream>, Vec<u8>)> {
    let max_frame_size = framed.max_frame_size();
    let (stream, leftover) = framed.into_inner();

    if !leftover.is_empty() {
        return Err(RdpError::protocol("unexpected data before the TLS handshake"));
    }

    let tls_stream = tls::connect(server_name, stream)
        .await
        .map_err(|e| RdpError::Tls(Arc::new(e)))?;

    let public_key = tls::server_public_key(&tls_stream).map_err(|e| RdpError::Tls(Arc::new(io::Error::other(e))))?;

    debug!(public_key_len = public_key.len(), "TLS upgrade completed");

    Ok((Framed::new(Box::new(tls_stream), max_frame_size), public_key))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use proptest::prelude::*;
    use rdp_proto::nego::{FailureCode, select_protocol};

    use super::*;

    fn selected_protocol(protocol: NegotiatedProtocol) -> SecurityProtocol {
        match protocol {
            NegotiatedProtocol::Plain => SecurityProtocol::RDP,
            NegotiatedProtocol::TransportEncrypted => SecurityProtocol::SSL,
            NegotiatedProtocol::HybridCredentialDelegation => SecurityProtocol::HYBRID,
        }
    }

    fn protocol_set() -> impl Strategy<Value = ProtocolSet> {
        (1u8..8).prop_map(ProtocolSet::from_bits_truncate)
    }

    #[test]
    fn failure_code_is_surfaced() {
        let result = process_confirm(
            ProtocolSet::all(),
            ConnectionConfirm::Failure {
                code: FailureCode::HYBRID_REQUIRED_BY_SERVER,
            },
        );

        assert!(matches!(
            result,
            Err(RdpError::NegotiationRejected(NegotiationFailure::Server(
                FailureCode::HYBRID_REQUIRED_BY_SERVER
            )))
        ));
    }

    #[test]
    fn hybrid_ex_maps_to_hybrid() {
        let negotiation = process_confirm(
            ProtocolSet::HYBRID,
            ConnectionConfirm::Response {
                flags: NegotiationResponseFlags::empty(),
                protocol: SecurityProtocol::HYBRID_EX,
            },
        )
        .unwrap();

        assert_eq!(negotiation.protocol, NegotiatedProtocol::HybridCredentialDelegation);
        assert!(negotiation.early_user_auth());
    }

    #[test]
    fn protocol_outside_the_offer_is_rejected() {
        let result = process_confirm(
            ProtocolSet::PLAIN | ProtocolSet::TRANSPORT_ENCRYPTED,
            ConnectionConfirm::Response {
                flags: NegotiationResponseFlags::empty(),
                protocol: SecurityProtocol::HYBRID,
            },
        );

        assert!(matches!(
            result,
            Err(RdpError::NegotiationRejected(NegotiationFailure::UnexpectedProtocol(_)))
        ));
    }

    proptest! {
        #[test]
        fn negotiated_protocol_is_offered_and_allowed(offered in protocol_set(), allowed in protocol_set()) {
            let request = ConnectionRequest {
                cookie: None,
                flags: NegotiationRequestFlags::empty(),
                protocol: offered.to_requested(),
            };

            // What a server can read out of the request, and what it picks from it.
            let server_view = ProtocolSet::from_requested(request.protocol);
            let chosen = select_protocol(server_view, allowed);

            let confirm = match chosen {
                Some(protocol) => ConnectionConfirm::Response {
                    flags: NegotiationResponseFlags::empty(),
                    protocol: selected_protocol(protocol),
                },
                None => ConnectionConfirm::Failure {
                    code: FailureCode::SSL_NOT_ALLOWED_BY_SERVER,
                },
            };

            match (chosen, process_confirm(offered, confirm)) {
                (Some(protocol), Ok(negotiation)) => {
                    prop_assert_eq!(negotiation.protocol, protocol);
                    prop_assert!(offered.contains_protocol(protocol));
                    prop_assert!(allowed.contains_protocol(protocol));
                }
                (Some(protocol), Err(RdpError::NegotiationRejected(NegotiationFailure::UnexpectedProtocol(_)))) => {
                    prop_assert!(!offered.contains_protocol(protocol));
                }
                (None, Err(RdpError::NegotiationRejected(NegotiationFailure::Server(_)))) => {}
                (chosen, result) => prop_assert!(false, "chosen {:?}, result {:?}", chosen, result),
            }
        }
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        use crate::config::Credentials;

        let (client, _server) = tokio::io::duplex(1024);
        let config = ClientConfig::builder()
            .credentials(Credentials::builder().username("alice").password("hunter2").build())
            .connect_timeout(core::time::Duration::from_millis(50))
            .build();

        let mut framed = Framed::new(client, config.max_frame_size);
        let result = negotiate(&mut framed, &config).await;

        assert!(matches!(result, Err(RdpError::Timeout("connection confirm"))));
    }
}
