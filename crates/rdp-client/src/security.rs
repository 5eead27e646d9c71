//! Standard RDP security: key exchange, client info, licensing, and per-PDU encryption and MACs
//! on both output paths.
//!
//! With TLS or CredSSP the transport already protects the data and this layer only adds the
//! basic security headers that client info and licensing PDUs always carry.

use rand::Rng as _;
use rdp_proto::encryption::{CLIENT_RANDOM_SIZE, RdpCipher, SessionKeys};
use rdp_proto::fast_path::{self, FastPathFlags, FastPathHeader, FastPathInputEvent};
use rdp_proto::gcc::ServerSecurityData;
use rdp_proto::license::{ClientLicenseExchange, LicenseOutcome, LicensePdu};
use rdp_proto::nego::NegotiatedProtocol;
use rdp_proto::sec::{
    ClientInfo, InfoFlags, PerformanceFlags, RsaPublicKey, SecurityExchangePdu, SecurityFlags, SecurityHeader,
    ServerCertificate,
};
use secrecy::ExposeSecret as _;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ClientConfig;
use crate::error::{RdpError, RdpResult};
use crate::mcs::{ChannelLayer, McsMessage, read_slow_path};
use crate::negotiation::Negotiation;
use crate::transport::{Framed, encode_fast_path};

const CLIENT_ADDRESS: &str = "0.0.0.0";
const CLIENT_DIR: &str = "C:\\Windows\\System32\\mstscax.dll";

struct Ciphers {
    encryptor: RdpCipher,
    decryptor: RdpCipher,
}

/// A slow-path payload with its security header removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unprotected {
    pub flags: SecurityFlags,
    pub payload: Vec<u8>,
}

pub struct SecurityLayer {
    ciphers: Option<Ciphers>,
    salted: bool,
}

impl core::fmt::Debug for SecurityLayer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SecurityLayer")
            .field("encrypted", &self.is_encrypted())
            .field("salted", &self.salted)
            .finish()
    }
}

impl SecurityLayer {
    /// Pass-through layer, for TLS, CredSSP, and standard security without encryption.
    pub fn none() -> Self {
        Self {
            ciphers: None,
            salted: false,
        }
    }

    pub fn standard(keys: &SessionKeys) -> RdpResult<Self> {
        Ok(Self {
            ciphers: Some(Ciphers {
                encryptor: RdpCipher::encryptor(keys, false)?,
                decryptor: RdpCipher::decryptor(keys, false)?,
            }),
            salted: false,
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.ciphers.is_some()
    }

    /// Outbound MACs are salted with the packet count once both ends agreed to it.
    pub fn set_salted_checksum(&mut self, salted: bool) {
        self.salted = salted;
        if let Some(ciphers) = &mut self.ciphers {
            ciphers.encryptor.set_salted(salted);
        }
    }

    /// Protects a share control PDU.
    pub fn protect(&mut self, payload: &[u8]) -> RdpResult<Vec<u8>> {
        self.wrap(SecurityFlags::empty(), payload, true)
    }

    pub fn protect_client_info(&mut self, info: &ClientInfo) -> RdpResult<Vec<u8>> {
        let mut payload = Vec::new();
        info.encode(&mut payload)?;
        self.wrap(SecurityFlags::INFO_PKT, &payload, true)
    }

    /// Client licensing PDUs are never encrypted.
    pub fn protect_license(&mut self, pdu: &LicensePdu) -> RdpResult<Vec<u8>> {
        let mut payload = Vec::new();
        pdu.encode(&mut payload)?;
        self.wrap(SecurityFlags::LICENSE_PKT, &payload, false)
    }

    fn wrap(&mut self, mut flags: SecurityFlags, payload: &[u8], encrypt: bool) -> RdpResult<Vec<u8>> {
        let salted = self.salted;
        let has_header = !flags.is_empty() || self.ciphers.is_some();
        let mut out = Vec::with_capacity(payload.len() + 12);

        match self.ciphers.as_mut().filter(|_| encrypt) {
            Some(ciphers) => {
                flags |= SecurityFlags::ENCRYPT;
                if salted {
                    flags |= SecurityFlags::SECURE_CHECKSUM;
                }

                let mut data = payload.to_vec();
                let signature = ciphers.encryptor.encrypt(&mut data)?;

                SecurityHeader {
                    flags,
                    signature: Some(signature),
                }
                .encode(&mut out);
                out.extend_from_slice(&data);
            }
            None if has_header => {
                SecurityHeader::basic(flags).encode(&mut out);
                out.extend_from_slice(payload);
            }
            None => out.extend_from_slice(payload),
        }

        Ok(out)
    }

    /// Strips and checks the security header of an inbound slow-path PDU.
    pub fn unprotect(&mut self, user_data: &[u8]) -> RdpResult<Unprotected> {
        if self.ciphers.is_none() {
            return Ok(Unprotected {
                flags: SecurityFlags::empty(),
                payload: user_data.to_vec(),
            });
        }

        self.unwrap_with_header(user_data)
    }

    /// Licensing PDUs carry a security header whatever the negotiated protocol.
    pub fn unprotect_license(&mut self, user_data: &[u8]) -> RdpResult<Vec<u8>> {
        let unprotected = self.unwrap_with_header(user_data)?;

        if !unprotected.flags.contains(SecurityFlags::LICENSE_PKT) {
            return Err(RdpError::protocol(format!(
                "expected a licensing PDU, got security flags {:?}",
                unprotected.flags
            )));
        }

        Ok(unprotected.payload)
    }

    fn unwrap_with_header(&mut self, mut user_data: &[u8]) -> RdpResult<Unprotected> {
        let header = SecurityHeader::decode(&mut user_data)?;
        let mut payload = user_data.to_vec();

        if let Some(signature) = header.signature {
            let ciphers = self
                .ciphers
                .as_mut()
                .ok_or_else(|| RdpError::protocol("encrypted PDU received without standard security"))?;

            ciphers
                .decryptor
                .set_salted(header.flags.contains(SecurityFlags::SECURE_CHECKSUM));
            ciphers
                .decryptor
                .decrypt(&mut payload, &signature)
                .map_err(|_| RdpError::IntegrityViolation("slow-path PDU"))?;
        }

        Ok(Unprotected {
            flags: header.flags,
            payload,
        })
    }

    pub fn unprotect_fast_path(&mut self, header: &FastPathHeader, payload: &[u8]) -> RdpResult<Vec<u8>> {
        let mut payload = payload.to_vec();

        if header.flags.contains(FastPathFlags::ENCRYPTED) {
            let (Some(ciphers), Some(signature)) = (self.ciphers.as_mut(), header.signature) else {
                return Err(RdpError::protocol(
                    "encrypted fast-path PDU received without standard security",
                ));
            };

            ciphers
                .decryptor
                .set_salted(header.flags.contains(FastPathFlags::SECURE_CHECKSUM));
            ciphers
                .decryptor
                .decrypt(&mut payload, &signature)
                .map_err(|_| RdpError::IntegrityViolation("fast-path PDU"))?;
        }

        Ok(payload)
    }

    /// Builds a complete fast-path input frame.
    pub fn encode_input(&mut self, events: &[FastPathInputEvent]) -> RdpResult<Vec<u8>> {
        let mut payload = Vec::new();
        let num_events = fast_path::encode_input_events(&mut payload, events)?;

        let header = match self.ciphers.as_mut() {
            Some(ciphers) => {
                let mut flags = FastPathFlags::ENCRYPTED;
                if self.salted {
                    flags |= FastPathFlags::SECURE_CHECKSUM;
                }

                FastPathHeader {
                    flags,
                    num_events,
                    signature: Some(ciphers.encryptor.encrypt(&mut payload)?),
                }
            }
            None => FastPathHeader {
                flags: FastPathFlags::empty(),
                num_events,
                signature: None,
            },
        };

        encode_fast_path(&header, &payload)
    }
}

pub fn client_info(config: &ClientConfig) -> ClientInfo {
    ClientInfo {
        code_page: 0,
        flags: InfoFlags::MOUSE
            | InfoFlags::DISABLE_CTRL_ALT_DEL
            | InfoFlags::AUTOLOGON
            | InfoFlags::UNICODE
            | InfoFlags::MAXIMIZE_SHELL
            | InfoFlags::LOGON_NOTIFY
            | InfoFlags::ENABLE_WINDOWS_KEY
            | InfoFlags::LOGON_ERRORS,
        domain: config.credentials.domain.clone(),
        username: config.credentials.username.clone(),
        password: config.credentials.password.expose_secret().to_owned(),
        alternate_shell: String::new(),
        working_dir: String::new(),
        client_address: CLIENT_ADDRESS.to_owned(),
        client_dir: CLIENT_DIR.to_owned(),
        performance_flags: PerformanceFlags::DISABLE_WALLPAPER
            | PerformanceFlags::DISABLE_FULL_WINDOW_DRAG
            | PerformanceFlags::DISABLE_MENU_ANIMATIONS
            | PerformanceFlags::DISABLE_THEMING,
    }
}

/// Runs the security exchange when standard security encrypts, then client info and licensing.
#[instrument(skip_all)]
pub async fn establish<S>(
    framed: &mut Framed<S>,
    channels: &ChannelLayer,
    negotiation: &Negotiation,
    server_security: &ServerSecurityData,
    config: &ClientConfig,
) -> RdpResult<SecurityLayer>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut security, server_key) =
        if negotiation.protocol == NegotiatedProtocol::Plain && !server_security.encryption_method.is_empty() {
            let (security, server_key) = exchange_keys(framed, channels, server_security).await?;
            (security, Some(server_key))
        } else {
            (SecurityLayer::none(), None)
        };

    let info = security.protect_client_info(&client_info(config))?;
    framed.write_all(&channels.encode_io(&info)?).await?;
    debug!(encrypted = security.is_encrypted(), "Client info sent");

    license(framed, channels, &mut security, server_key, config).await?;

    Ok(security)
}

async fn exchange_keys<S>(
    framed: &mut Framed<S>,
    channels: &ChannelLayer,
    server_security: &ServerSecurityData,
) -> RdpResult<(SecurityLayer, RsaPublicKey)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_random = server_security
        .server_random
        .ok_or_else(|| RdpError::protocol("server random is missing"))?;
    let certificate = ServerCertificate::decode(&server_security.server_certificate)?;

    let mut client_random = [0u8; CLIENT_RANDOM_SIZE];
    rand::thread_rng().fill(&mut client_random[..]);

    let mut pdu = Vec::new();
    SecurityExchangePdu {
        encrypted_client_random: certificate.public_key.encrypt(&client_random)?,
    }
    .encode(&mut pdu)?;
    framed.write_all(&channels.encode_io(&pdu)?).await?;

    let keys = SessionKeys::derive_client(&client_random, &server_random, server_security.encryption_method)?;
    debug!(method = ?keys.method, level = server_security.encryption_level.0, "Session keys derived");

    Ok((SecurityLayer::standard(&keys)?, certificate.public_key))
}

async fn license<S>(
    framed: &mut Framed<S>,
    channels: &ChannelLayer,
    security: &mut SecurityLayer,
    server_key: Option<RsaPublicKey>,
    config: &ClientConfig,
) -> RdpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut exchange = ClientLicenseExchange::new(
        config.credentials.username.as_str(),
        config.client_name.as_str(),
        server_key,
    );

    loop {
        let frame = read_slow_path(framed).await?;

        let user_data = match channels.decode(&frame)? {
            McsMessage::Data { channel_id, user_data } if channel_id == channels.io_channel() => user_data,
            McsMessage::Data { channel_id, .. } => {
                trace!(channel_id, "Ignoring virtual channel data during licensing");
                continue;
            }
            McsMessage::Disconnect(reason) => {
                return Err(RdpError::from(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    format!("server disconnected during licensing ({reason})"),
                )));
            }
        };

        let pdu = LicensePdu::decode(&security.unprotect_license(user_data)?)?;
        trace!(message = ?pdu.message_type(), "Received licensing PDU");

        match exchange.process(pdu) {
            Ok(LicenseOutcome::Reply(reply)) => {
                trace!(message = ?reply.message_type(), "Send licensing PDU");
                let reply = security.protect_license(&reply)?;
                framed.write_all(&channels.encode_io(&reply)?).await?;
            }
            Ok(LicenseOutcome::Granted) => {
                info!("License granted");
                return Ok(());
            }
            Ok(LicenseOutcome::Denied(code)) => {
                warn!(%code, "License denied");
                return Err(RdpError::LicenseDenied(code));
            }
            Err(rdp_proto::Error::Crypto(_)) => return Err(RdpError::IntegrityViolation("platform challenge")),
            Err(error) => return Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rdp_proto::fast_path::{KeyboardFlags, decode_input_events};
    use rdp_proto::gcc::EncryptionMethod;
    use rstest::rstest;

    use super::*;

    fn key_pair(method: EncryptionMethod) -> (SecurityLayer, SecurityLayer) {
        let client_random = [0x11; 32];
        let server_random = [0x22; 32];

        let client = SessionKeys::derive_client(&client_random, &server_random, method).unwrap();
        let server = SessionKeys::derive_server(&client_random, &server_random, method).unwrap();

        (
            SecurityLayer::standard(&client).unwrap(),
            SecurityLayer::standard(&server).unwrap(),
        )
    }

    #[rstest]
    #[case(EncryptionMethod::BIT_40)]
    #[case(EncryptionMethod::BIT_56)]
    #[case(EncryptionMethod::BIT_128)]
    fn encrypted_pdus_reach_the_peer(#[case] method: EncryptionMethod) {
        let (mut client, mut server) = key_pair(method);

        for message in [&b"first"[..], b"second", b"third"] {
            let protected = client.protect(message).unwrap();
            assert_ne!(&protected[12..], message);

            let unprotected = server.unprotect(&protected).unwrap();
            assert!(unprotected.flags.contains(SecurityFlags::ENCRYPT));
            assert_eq!(unprotected.payload, message);
        }
    }

    #[test]
    fn tampered_pdu_is_an_integrity_violation() {
        let (mut client, mut server) = key_pair(EncryptionMethod::BIT_128);

        let mut protected = client.protect(b"share control").unwrap();
        let last = protected.len() - 1;
        protected[last] ^= 0x01;

        assert!(matches!(
            server.unprotect(&protected),
            Err(RdpError::IntegrityViolation("slow-path PDU"))
        ));
    }

    #[test]
    fn salted_checksums_follow_the_packet_flag() {
        let (mut client, mut server) = key_pair(EncryptionMethod::BIT_128);

        let plain = client.protect(b"before").unwrap();
        client.set_salted_checksum(true);
        let salted = client.protect(b"after").unwrap();

        assert_eq!(server.unprotect(&plain).unwrap().payload, b"before");

        let unprotected = server.unprotect(&salted).unwrap();
        assert!(unprotected.flags.contains(SecurityFlags::SECURE_CHECKSUM));
        assert_eq!(unprotected.payload, b"after");
    }

    #[test]
    fn transport_security_adds_headers_only_where_required() {
        let mut layer = SecurityLayer::none();

        assert_eq!(layer.protect(b"pdu").unwrap(), b"pdu");

        let license = layer
            .protect_license(&LicensePdu::ErrorAlert(rdp_proto::license::LicenseErrorMessage::valid_client()))
            .unwrap();
        assert_eq!(&license[..2], SecurityFlags::LICENSE_PKT.bits().to_le_bytes());

        let mut server = SecurityLayer::none();
        let payload = server.unprotect_license(&license).unwrap();
        assert!(matches!(LicensePdu::decode(&payload).unwrap(), LicensePdu::ErrorAlert(_)));

        // A basic header without SEC_LICENSE_PKT.
        let not_license = [0x00, 0x00, 0x00, 0x00, 0xAA];
        assert!(matches!(server.unprotect_license(&not_license), Err(RdpError::Protocol(_))));
    }

    #[test]
    fn encrypted_fast_path_input_is_readable_by_the_peer() {
        let (mut client, mut server) = key_pair(EncryptionMethod::BIT_128);
        client.set_salted_checksum(true);

        let events = vec![
            FastPathInputEvent::Scancode {
                flags: KeyboardFlags::empty(),
                code: 0x1E,
            },
            FastPathInputEvent::Unicode {
                release: true,
                code: 0x0041,
            },
        ];

        let frame = client.encode_input(&events).unwrap();
        let (header, payload) = FastPathHeader::decode(&frame).unwrap();
        assert!(header.flags.contains(FastPathFlags::ENCRYPTED | FastPathFlags::SECURE_CHECKSUM));

        let payload = server.unprotect_fast_path(&header, payload).unwrap();
        assert_eq!(decode_input_events(&payload, header.num_events).unwrap(), events);
    }

    #[test]
    fn encrypted_fast_path_without_keys_is_rejected() {
        let (mut client, _) = key_pair(EncryptionMethod::BIT_128);
        let frame = client.encode_input(&[FastPathInputEvent::Unicode { release: false, code: 1 }]).unwrap();
        let (header, payload) = FastPathHeader::decode(&frame).unwrap();

        let mut layer = SecurityLayer::none();
        assert!(matches!(layer.unprotect_fast_path(&header, payload), Err(RdpError::Protocol(_))));
    }
}
