//! Network Level Authentication: the CredSSP exchange run over TLS before any MCS traffic.

use rdp_proto::credssp::ts_request::TsRequest;
use rdp_proto::credssp::{CredSsp as _, CredSspClient, CredSspResult};
use rdp_proto::sspi::AuthIdentity;
use secrecy::ExposeSecret as _;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::Credentials;
use crate::error::{RdpError, RdpResult};
use crate::transport::Framed;

/// Early User Authorization Result PDU values.
const AUTHZ_SUCCESS: u32 = 0x0000_0000;
const AUTHZ_ACCESS_DENIED: u32 = 0x0000_0005;

/// Authenticates with NTLM inside CredSSP, bound to `public_key`, then reads the early user
/// authorization result when the server selected `HYBRID_EX`.
#[instrument(skip_all)]
pub async fn authenticate<S>(
    framed: &mut Framed<S>,
    public_key: Vec<u8>,
    credentials: &Credentials,
    early_user_auth: bool,
) -> RdpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let identity = AuthIdentity::new(
        credentials.username.as_str(),
        credentials.domain.as_str(),
        credentials.password.expose_secret(),
    );
    let mut credssp = CredSspClient::new(public_key, identity);

    loop {
        match credssp.process()? {
            CredSspResult::ReplyNeeded(ts_request) => {
                write_ts_request(framed, &ts_request).await?;

                // Servers commonly hang up instead of answering a bad NTLM authenticate message.
                let carries_credentials = ts_request.pub_key_auth.is_some();
                let bytes = match framed.read_by_hint(TsRequest::frame_length).await {
                    Ok(bytes) => bytes,
                    Err(RdpError::ConnectionLost(error)) if carries_credentials && is_hangup(&error) => {
                        return Err(RdpError::AuthenticationRejected(format!(
                            "server closed the connection after the authenticate message: {error}"
                        )));
                    }
                    Err(error) => return Err(error),
                };
                let ts_request = TsRequest::decode(&bytes)
                    .map_err(|e| RdpError::AuthenticationRejected(format!("malformed TSRequest: {e}")))?;
                trace!(version = ts_request.version, "Received TSRequest");

                credssp.update_ts_request(ts_request)?;
            }
            CredSspResult::FinalMessage(ts_request) => {
                write_ts_request(framed, &ts_request).await?;
                break;
            }
            CredSspResult::Finished => break,
        }
    }

    debug!("CredSSP completed");

    if early_user_auth {
        let result = framed.read_exact(4).await?;
        let result = u32::from_le_bytes([result[0], result[1], result[2], result[3]]);

        match result {
            AUTHZ_SUCCESS => debug!("Early user authorization granted"),
            AUTHZ_ACCESS_DENIED => {
                return Err(RdpError::AuthenticationRejected(
                    "access denied by early user authorization".to_owned(),
                ));
            }
            other => {
                return Err(RdpError::AuthenticationRejected(format!(
                    "unknown early user authorization result 0x{other:08X}"
                )));
            }
        }
    }

    Ok(())
}

fn is_hangup(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        error.kind(),
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

async fn write_ts_request<S>(framed: &mut Framed<S>, ts_request: &TsRequest) -> RdpResult<()>
where
    S: AsyncWrite + Unpin,
{
    let encoded = ts_request
        .encode()
        .map_err(|e| RdpError::AuthenticationRejected(format!("failed to encode TSRequest: {e}")))?;
    trace!(len = encoded.len(), "Send TSRequest");
    framed.write_all(&encoded).await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rdp_proto::credssp::CredSspServer;
    use rdp_proto::credssp::ts_request::TS_REQUEST_VERSION;
    use rdp_proto::sspi::STATUS_LOGON_FAILURE;
    use tokio::io::DuplexStream;

    use super::*;

    const PUBLIC_KEY: &[u8] = &[0x30, 0x0D, 0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01];

    fn credentials(password: &str) -> Credentials {
        Credentials::builder()
            .domain("CONTOSO")
            .username("alice")
            .password(password)
            .build()
    }

    /// Runs the server side. A failed authentication is answered with an error TSRequest, or with
    /// a hangup when `hang_up_on_failure` is set.
    async fn serve(stream: DuplexStream, early_user_auth_result: Option<u32>, hang_up_on_failure: bool) {
        let mut framed = Framed::new(stream, 0xFFFF);
        let mut server = CredSspServer::new(
            PUBLIC_KEY.to_vec(),
            AuthIdentity::new("alice", "CONTOSO", "hunter2"),
            TS_REQUEST_VERSION,
        );

        loop {
            let Ok(bytes) = framed.read_by_hint(TsRequest::frame_length).await else {
                return;
            };
            let ts_request = TsRequest::decode(&bytes).unwrap();

            let result = server.update_ts_request(ts_request).and_then(|()| server.process());
            match result {
                Ok(CredSspResult::ReplyNeeded(reply)) => {
                    framed.write_all(&reply.encode().unwrap()).await.unwrap();
                }
                Ok(CredSspResult::FinalMessage(_) | CredSspResult::Finished) => break,
                Err(_) if hang_up_on_failure => return,
                Err(error) => {
                    let reply = TsRequest::error(server.version(), error.nt_status());
                    framed.write_all(&reply.encode().unwrap()).await.unwrap();
                    return;
                }
            }
        }

        if let Some(result) = early_user_auth_result {
            framed.write_all(&result.to_le_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn valid_credentials_authenticate() {
        let (client, server) = tokio::io::duplex(8192);
        let server = tokio::spawn(serve(server, Some(AUTHZ_SUCCESS), false));

        let mut framed = Framed::new(client, 0xFFFF);
        authenticate(&mut framed, PUBLIC_KEY.to_vec(), &credentials("hunter2"), true)
            .await
            .unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let (client, server) = tokio::io::duplex(8192);
        let server = tokio::spawn(serve(server, None, false));

        let mut framed = Framed::new(client, 0xFFFF);
        let result = authenticate(&mut framed, PUBLIC_KEY.to_vec(), &credentials("wrong"), false).await;

        assert!(matches!(result, Err(RdpError::AuthenticationRejected(_))));
        server.await.unwrap();

        assert_eq!(
            TsRequest::error(TS_REQUEST_VERSION, STATUS_LOGON_FAILURE).error_code,
            Some(STATUS_LOGON_FAILURE)
        );
    }

    #[tokio::test]
    async fn early_user_authorization_denial_is_rejected() {
        let (client, server) = tokio::io::duplex(8192);
        let server = tokio::spawn(serve(server, Some(AUTHZ_ACCESS_DENIED), false));

        let mut framed = Framed::new(client, 0xFFFF);
        let result = authenticate(&mut framed, PUBLIC_KEY.to_vec(), &credentials("hunter2"), true).await;

        assert!(matches!(result, Err(RdpError::AuthenticationRejected(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn hangup_after_authenticate_message_is_a_rejection() {
        let (client, server) = tokio::io::duplex(8192);
        let server = tokio::spawn(serve(server, None, true));

        let mut framed = Framed::new(client, 0xFFFF);
        let result = authenticate(&mut framed, PUBLIC_KEY.to_vec(), &credentials("wrong"), false).await;

        assert!(matches!(result, Err(RdpError::AuthenticationRejected(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn hangup_before_the_challenge_is_a_lost_connection() {
        let (client, server) = tokio::io::duplex(8192);
        drop(server);

        let mut framed = Framed::new(client, 0xFFFF);
        let result = authenticate(&mut framed, PUBLIC_KEY.to_vec(), &credentials("hunter2"), false).await;

        assert!(matches!(result, Err(RdpError::ConnectionLost(_))));
    }
}
