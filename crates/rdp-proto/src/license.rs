//! Server licensing PDUs (MS-RDPELE) and the client side of the licensing exchange.

use bytes::{Buf as _, BufMut as _};
use rand::Rng as _;

use crate::encryption::{CLIENT_RANDOM_SIZE, LicensingKeys};
use crate::sec::{RsaPublicKey, ServerCertificate};
use crate::utils::{read_array, split_to, u16_len, u32_len};
use crate::{Error, Result};

pub const PREAMBLE_SIZE: usize = 4;
pub const MAC_SIZE: usize = 16;
pub const PREMASTER_SECRET_SIZE: usize = 48;

const PREAMBLE_VERSION_3_0: u8 = 0x03;
const EXTENDED_ERROR_MSG_SUPPORTED: u8 = 0x80;

const KEY_EXCHANGE_ALG_RSA: u32 = 0x0000_0001;
const PLATFORM_ID: u32 = 0x0400_0000 | 0x0001_0000; // WINNT_POST_52 | MICROSOFT
const HWID_SIZE: usize = 20;

const RESPONSE_VERSION: u16 = 0x0100;
const CLIENT_TYPE_WIN32: u16 = 0x0100;
const LICENSE_DETAIL_DETAIL: u16 = 0x0003;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LicenseMessageType {
    LicenseRequest = 0x01,
    PlatformChallenge = 0x02,
    NewLicense = 0x03,
    UpgradeLicense = 0x04,
    LicenseInfo = 0x12,
    NewLicenseRequest = 0x13,
    PlatformChallengeResponse = 0x15,
    ErrorAlert = 0xFF,
}

impl TryFrom<u8> for LicenseMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::LicenseRequest),
            0x02 => Ok(Self::PlatformChallenge),
            0x03 => Ok(Self::NewLicense),
            0x04 => Ok(Self::UpgradeLicense),
            0x12 => Ok(Self::LicenseInfo),
            0x13 => Ok(Self::NewLicenseRequest),
            0x15 => Ok(Self::PlatformChallengeResponse),
            0xFF => Ok(Self::ErrorAlert),
            _ => Err(Error::UnexpectedMessage {
                name: "licensing bMsgType",
                got: u32::from(value),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BlobType {
    Any = 0x0000,
    Data = 0x0001,
    Random = 0x0002,
    Certificate = 0x0003,
    Error = 0x0004,
    EncryptedData = 0x0009,
    KeyExchangeAlgorithm = 0x000D,
    Scope = 0x000E,
    ClientUserName = 0x000F,
    ClientMachineName = 0x0010,
}

/// LICENSE_BINARY_BLOB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseBlob {
    pub blob_type: u16,
    pub data: Vec<u8>,
}

impl LicenseBlob {
    pub fn new(blob_type: BlobType, data: Vec<u8>) -> Self {
        Self {
            blob_type: blob_type as u16,
            data,
        }
    }

    pub fn empty(blob_type: BlobType) -> Self {
        Self::new(blob_type, Vec::new())
    }

    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.put_u16_le(self.blob_type);
        dst.put_u16_le(u16_len(self.data.len(), "LICENSE_BINARY_BLOB wBlobLen")?);
        dst.put_slice(&self.data);
        Ok(())
    }

    pub fn decode(src: &mut &[u8]) -> Result<Self> {
        ensure_size!(src[4] for "LICENSE_BINARY_BLOB");
        let blob_type = src.get_u16_le();
        let length = usize::from(src.get_u16_le());
        let data = split_to(src, length, "LICENSE_BINARY_BLOB blobData")?.to_vec();
        Ok(Self { blob_type, data })
    }
}

/// SERVER_LICENSE_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseRequest {
    pub server_random: [u8; 32],
    pub product_version: u32,
    pub company_name: Vec<u8>,
    pub product_id: Vec<u8>,
    /// Certificate blob contents, often empty when the session runs over TLS.
    pub server_certificate: Vec<u8>,
    pub scopes: Vec<Vec<u8>>,
}

impl LicenseRequest {
    fn encode_body(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.put_slice(&self.server_random);
        dst.put_u32_le(self.product_version);
        dst.put_u32_le(u32_len(self.company_name.len(), "cbCompanyName")?);
        dst.put_slice(&self.company_name);
        dst.put_u32_le(u32_len(self.product_id.len(), "cbProductId")?);
        dst.put_slice(&self.product_id);
        LicenseBlob::new(BlobType::KeyExchangeAlgorithm, KEY_EXCHANGE_ALG_RSA.to_le_bytes().to_vec()).encode(dst)?;
        LicenseBlob::new(BlobType::Certificate, self.server_certificate.clone()).encode(dst)?;
        dst.put_u32_le(u32_len(self.scopes.len(), "ScopeCount")?);
        for scope in &self.scopes {
            LicenseBlob::new(BlobType::Scope, scope.clone()).encode(dst)?;
        }
        Ok(())
    }

    fn decode_body(mut src: &[u8]) -> Result<Self> {
        let server_random = read_array::<32>(&mut src, "SERVER_LICENSE_REQUEST ServerRandom")?;
        ensure_size!(src[8] for "PRODUCT_INFO");
        let product_version = src.get_u32_le();
        let company_len = src.get_u32_le() as usize;
        let company_name = split_to(&mut src, company_len, "pbCompanyName")?.to_vec();
        ensure_size!(src[4] for "PRODUCT_INFO");
        let product_len = src.get_u32_le() as usize;
        let product_id = split_to(&mut src, product_len, "pbProductId")?.to_vec();
        let _key_exchange_list = LicenseBlob::decode(&mut src)?;
        let server_certificate = LicenseBlob::decode(&mut src)?.data;

        let scopes = if src.len() >= 4 {
            let count = src.get_u32_le();
            (0..count)
                .map(|_| LicenseBlob::decode(&mut src).map(|blob| blob.data))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        Ok(Self {
            server_random,
            product_version,
            company_name,
            product_id,
            server_certificate,
            scopes,
        })
    }
}

/// CLIENT_NEW_LICENSE_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLicenseRequest {
    pub client_random: [u8; CLIENT_RANDOM_SIZE],
    /// RSA-encrypted premaster secret followed by 8 bytes of zero padding.
    pub encrypted_premaster_secret: Vec<u8>,
    pub user_name: String,
    pub machine_name: String,
}

impl NewLicenseRequest {
    fn encode_body(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.put_u32_le(KEY_EXCHANGE_ALG_RSA);
        dst.put_u32_le(PLATFORM_ID);
        dst.put_slice(&self.client_random);
        LicenseBlob::new(BlobType::Random, self.encrypted_premaster_secret.clone()).encode(dst)?;
        LicenseBlob::new(BlobType::ClientUserName, ansi_null_terminated(&self.user_name)).encode(dst)?;
        LicenseBlob::new(BlobType::ClientMachineName, ansi_null_terminated(&self.machine_name)).encode(dst)?;
        Ok(())
    }

    fn decode_body(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[8] for "CLIENT_NEW_LICENSE_REQUEST");
        let _key_exchange_alg = src.get_u32_le();
        let _platform_id = src.get_u32_le();
        let client_random = read_array(&mut src, "CLIENT_NEW_LICENSE_REQUEST ClientRandom")?;
        let encrypted_premaster_secret = LicenseBlob::decode(&mut src)?.data;
        let user_name = from_ansi(&LicenseBlob::decode(&mut src)?.data);
        let machine_name = from_ansi(&LicenseBlob::decode(&mut src)?.data);

        Ok(Self {
            client_random,
            encrypted_premaster_secret,
            user_name,
            machine_name,
        })
    }
}

/// SERVER_PLATFORM_CHALLENGE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformChallenge {
    pub encrypted_challenge: Vec<u8>,
    pub mac: [u8; MAC_SIZE],
}

impl PlatformChallenge {
    fn encode_body(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.put_u32_le(0); // ConnectFlags
        LicenseBlob::new(BlobType::Any, self.encrypted_challenge.clone()).encode(dst)?;
        dst.put_slice(&self.mac);
        Ok(())
    }

    fn decode_body(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[4] for "SERVER_PLATFORM_CHALLENGE");
        let _connect_flags = src.get_u32_le();
        let encrypted_challenge = LicenseBlob::decode(&mut src)?.data;
        let mac = read_array(&mut src, "SERVER_PLATFORM_CHALLENGE MACData")?;
        Ok(Self { encrypted_challenge, mac })
    }
}

/// CLIENT_PLATFORM_CHALLENGE_RESPONSE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformChallengeResponse {
    pub encrypted_response: Vec<u8>,
    pub encrypted_hwid: Vec<u8>,
    pub mac: [u8; MAC_SIZE],
}

impl PlatformChallengeResponse {
    fn encode_body(&self, dst: &mut Vec<u8>) -> Result<()> {
        LicenseBlob::new(BlobType::EncryptedData, self.encrypted_response.clone()).encode(dst)?;
        LicenseBlob::new(BlobType::EncryptedData, self.encrypted_hwid.clone()).encode(dst)?;
        dst.put_slice(&self.mac);
        Ok(())
    }

    fn decode_body(mut src: &[u8]) -> Result<Self> {
        let encrypted_response = LicenseBlob::decode(&mut src)?.data;
        let encrypted_hwid = LicenseBlob::decode(&mut src)?.data;
        let mac = read_array(&mut src, "CLIENT_PLATFORM_CHALLENGE_RESPONSE MACData")?;
        Ok(Self {
            encrypted_response,
            encrypted_hwid,
            mac,
        })
    }
}

/// LICENSE_ERROR_MESSAGE error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LicenseErrorCode(pub u32);

impl LicenseErrorCode {
    pub const INVALID_SERVER_CERTIFICATE: Self = Self(0x0000_0001);
    pub const NO_LICENSE: Self = Self(0x0000_0002);
    pub const INVALID_SCOPE: Self = Self(0x0000_0004);
    pub const NO_LICENSE_SERVER: Self = Self(0x0000_0006);
    pub const STATUS_VALID_CLIENT: Self = Self(0x0000_0007);
    pub const INVALID_CLIENT: Self = Self(0x0000_0008);
    pub const INVALID_PRODUCT_ID: Self = Self(0x0000_000B);
    pub const INVALID_MESSAGE_LENGTH: Self = Self(0x0000_000C);
    pub const INVALID_MAC: Self = Self(0x0000_0003);
}

impl core::fmt::Display for LicenseErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match *self {
            Self::INVALID_SERVER_CERTIFICATE => "ERR_INVALID_SERVER_CERTIFICATE",
            Self::NO_LICENSE => "ERR_NO_LICENSE",
            Self::INVALID_MAC => "ERR_INVALID_MAC",
            Self::INVALID_SCOPE => "ERR_INVALID_SCOPE",
            Self::NO_LICENSE_SERVER => "ERR_NO_LICENSE_SERVER",
            Self::STATUS_VALID_CLIENT => "STATUS_VALID_CLIENT",
            Self::INVALID_CLIENT => "ERR_INVALID_CLIENT",
            Self::INVALID_PRODUCT_ID => "ERR_INVALID_PRODUCTID",
            Self::INVALID_MESSAGE_LENGTH => "ERR_INVALID_MESSAGE_LEN",
            _ => "unknown licensing error",
        };
        write!(f, "{name} (0x{:X})", self.0)
    }
}

pub const ST_TOTAL_ABORT: u32 = 0x0000_0001;
pub const ST_NO_TRANSITION: u32 = 0x0000_0002;
pub const ST_RESET_PHASE_TO_START: u32 = 0x0000_0003;
pub const ST_RESEND_LAST_MESSAGE: u32 = 0x0000_0004;

/// LICENSE_ERROR_MESSAGE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseErrorMessage {
    pub error_code: LicenseErrorCode,
    pub state_transition: u32,
    pub error_info: Vec<u8>,
}

impl LicenseErrorMessage {
    pub fn valid_client() -> Self {
        Self {
            error_code: LicenseErrorCode::STATUS_VALID_CLIENT,
            state_transition: ST_NO_TRANSITION,
            error_info: Vec::new(),
        }
    }

    fn encode_body(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.put_u32_le(self.error_code.0);
        dst.put_u32_le(self.state_transition);
        LicenseBlob::new(BlobType::Error, self.error_info.clone()).encode(dst)
    }

    fn decode_body(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[8] for "LICENSE_ERROR_MESSAGE");
        let error_code = LicenseErrorCode(src.get_u32_le());
        let state_transition = src.get_u32_le();
        let error_info = if src.is_empty() {
            Vec::new()
        } else {
            LicenseBlob::decode(&mut src)?.data
        };

        Ok(Self {
            error_code,
            state_transition,
            error_info,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicensePdu {
    LicenseRequest(LicenseRequest),
    PlatformChallenge(PlatformChallenge),
    NewLicense(Vec<u8>),
    UpgradeLicense(Vec<u8>),
    NewLicenseRequest(NewLicenseRequest),
    PlatformChallengeResponse(PlatformChallengeResponse),
    ErrorAlert(LicenseErrorMessage),
}

impl LicensePdu {
    pub fn message_type(&self) -> LicenseMessageType {
        match self {
            Self::LicenseRequest(_) => LicenseMessageType::LicenseRequest,
            Self::PlatformChallenge(_) => LicenseMessageType::PlatformChallenge,
            Self::NewLicense(_) => LicenseMessageType::NewLicense,
            Self::UpgradeLicense(_) => LicenseMessageType::UpgradeLicense,
            Self::NewLicenseRequest(_) => LicenseMessageType::NewLicenseRequest,
            Self::PlatformChallengeResponse(_) => LicenseMessageType::PlatformChallengeResponse,
            Self::ErrorAlert(_) => LicenseMessageType::ErrorAlert,
        }
    }

    /// Writes the preamble and message, without the security header.
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let mut body = Vec::new();
        match self {
            Self::LicenseRequest(pdu) => pdu.encode_body(&mut body)?,
            Self::PlatformChallenge(pdu) => pdu.encode_body(&mut body)?,
            Self::NewLicense(data) | Self::UpgradeLicense(data) => {
                LicenseBlob::new(BlobType::EncryptedData, data.clone()).encode(&mut body)?;
                body.put_bytes(0, MAC_SIZE);
            }
            Self::NewLicenseRequest(pdu) => pdu.encode_body(&mut body)?,
            Self::PlatformChallengeResponse(pdu) => pdu.encode_body(&mut body)?,
            Self::ErrorAlert(pdu) => pdu.encode_body(&mut body)?,
        }

        dst.put_u8(self.message_type() as u8);
        dst.put_u8(PREAMBLE_VERSION_3_0 | EXTENDED_ERROR_MSG_SUPPORTED);
        dst.put_u16_le(u16_len(body.len() + PREAMBLE_SIZE, "LICENSE_PREAMBLE wMsgSize")?);
        dst.put_slice(&body);

        Ok(())
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[PREAMBLE_SIZE] for "LICENSE_PREAMBLE");
        let message_type = LicenseMessageType::try_from(src.get_u8())?;
        let _flags = src.get_u8();
        let size = usize::from(src.get_u16_le());
        let body = split_to(&mut src, size.saturating_sub(PREAMBLE_SIZE), "licensing message")?;

        match message_type {
            LicenseMessageType::LicenseRequest => LicenseRequest::decode_body(body).map(Self::LicenseRequest),
            LicenseMessageType::PlatformChallenge => PlatformChallenge::decode_body(body).map(Self::PlatformChallenge),
            LicenseMessageType::NewLicense => Ok(Self::NewLicense(decode_license_info(body)?)),
            LicenseMessageType::UpgradeLicense => Ok(Self::UpgradeLicense(decode_license_info(body)?)),
            LicenseMessageType::NewLicenseRequest => NewLicenseRequest::decode_body(body).map(Self::NewLicenseRequest),
            LicenseMessageType::PlatformChallengeResponse => {
                PlatformChallengeResponse::decode_body(body).map(Self::PlatformChallengeResponse)
            }
            LicenseMessageType::ErrorAlert => LicenseErrorMessage::decode_body(body).map(Self::ErrorAlert),
            LicenseMessageType::LicenseInfo => Err(Error::UnexpectedMessage {
                name: "licensing message",
                got: LicenseMessageType::LicenseInfo as u32,
            }),
        }
    }
}

fn decode_license_info(mut body: &[u8]) -> Result<Vec<u8>> {
    Ok(LicenseBlob::decode(&mut body)?.data)
}

fn ansi_null_terminated(value: &str) -> Vec<u8> {
    let mut bytes: Vec<u8> = value.bytes().filter(u8::is_ascii).collect();
    bytes.push(0);
    bytes
}

fn from_ansi(value: &[u8]) -> String {
    value.iter().take_while(|b| **b != 0).map(|b| char::from(*b)).collect()
}

/// Result of feeding one server licensing message to [`ClientLicenseExchange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseOutcome {
    Reply(LicensePdu),
    Granted,
    Denied(LicenseErrorCode),
}

/// Client side of the licensing exchange.
///
/// The session's public key (from the GCC server security data) is used when the license request
/// carries no certificate of its own.
#[derive(Debug)]
pub struct ClientLicenseExchange {
    user_name: String,
    machine_name: String,
    fallback_key: Option<RsaPublicKey>,
    keys: Option<LicensingKeys>,
}

impl ClientLicenseExchange {
    pub fn new(user_name: impl Into<String>, machine_name: impl Into<String>, fallback_key: Option<RsaPublicKey>) -> Self {
        Self {
            user_name: user_name.into(),
            machine_name: machine_name.into(),
            fallback_key,
            keys: None,
        }
    }

    pub fn process(&mut self, pdu: LicensePdu) -> Result<LicenseOutcome> {
        match pdu {
            LicensePdu::ErrorAlert(alert) if alert.error_code == LicenseErrorCode::STATUS_VALID_CLIENT => {
                Ok(LicenseOutcome::Granted)
            }
            LicensePdu::ErrorAlert(alert) => Ok(LicenseOutcome::Denied(alert.error_code)),
            LicensePdu::NewLicense(_) | LicensePdu::UpgradeLicense(_) => Ok(LicenseOutcome::Granted),
            LicensePdu::LicenseRequest(request) => self.new_license_request(&request).map(LicenseOutcome::Reply),
            LicensePdu::PlatformChallenge(challenge) => {
                self.challenge_response(&challenge).map(LicenseOutcome::Reply)
            }
            other => Err(Error::UnexpectedMessage {
                name: "server licensing message",
                got: other.message_type() as u32,
            }),
        }
    }

    fn new_license_request(&mut self, request: &LicenseRequest) -> Result<LicensePdu> {
        let public_key = if request.server_certificate.is_empty() {
            self.fallback_key
                .clone()
                .ok_or_else(|| Error::invalid("SERVER_LICENSE_REQUEST", "ServerCertificate", "no public key available"))?
        } else {
            ServerCertificate::decode(&request.server_certificate)?.public_key
        };

        let client_random: [u8; CLIENT_RANDOM_SIZE] = rand::random();
        let mut premaster_secret = [0u8; PREMASTER_SECRET_SIZE];
        rand::thread_rng().fill(&mut premaster_secret[..]);

        let mut encrypted_premaster_secret = public_key.encrypt(&premaster_secret)?;
        encrypted_premaster_secret.put_bytes(0, 8);

        self.keys = Some(LicensingKeys::derive(
            &premaster_secret,
            &client_random,
            &request.server_random,
        ));

        Ok(LicensePdu::NewLicenseRequest(NewLicenseRequest {
            client_random,
            encrypted_premaster_secret,
            user_name: self.user_name.clone(),
            machine_name: self.machine_name.clone(),
        }))
    }

    fn challenge_response(&mut self, challenge: &PlatformChallenge) -> Result<LicensePdu> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::invalid("SERVER_PLATFORM_CHALLENGE", "bMsgType", "received before license request"))?;

        let decrypted_challenge = keys.rc4()?.process_vec(&challenge.encrypted_challenge);
        if keys.mac(&decrypted_challenge) != challenge.mac {
            return Err(Error::Crypto("platform challenge MAC mismatch"));
        }

        let mut response = Vec::with_capacity(8 + decrypted_challenge.len());
        response.put_u16_le(RESPONSE_VERSION);
        response.put_u16_le(CLIENT_TYPE_WIN32);
        response.put_u16_le(LICENSE_DETAIL_DETAIL);
        response.put_u16_le(u16_len(decrypted_challenge.len(), "cbChallenge")?);
        response.put_slice(&decrypted_challenge);

        let mut hwid = Vec::with_capacity(HWID_SIZE);
        hwid.put_u32_le(PLATFORM_ID);
        hwid.extend(crate::encryption::md5(&[self.machine_name.as_bytes()]));

        let mut mac_data = response.clone();
        mac_data.extend_from_slice(&hwid);

        Ok(LicensePdu::PlatformChallengeResponse(PlatformChallengeResponse {
            encrypted_response: keys.rc4()?.process_vec(&response),
            encrypted_hwid: keys.rc4()?.process_vec(&hwid),
            mac: keys.mac(&mac_data),
        }))
    }
}

/// Decrypts the premaster secret of a new license request. Exposed for in-process test servers.
pub fn decrypt_premaster_secret(encrypted: &[u8], modulus: &[u8], private_exponent: &[u8]) -> Vec<u8> {
    use num_bigint::BigUint;

    let n = BigUint::from_bytes_le(modulus);
    let c = BigUint::from_bytes_le(&encrypted[..modulus.len().min(encrypted.len())]);
    let m = c.modpow(&BigUint::from_bytes_le(private_exponent), &n);
    let mut out = m.to_bytes_le();
    out.resize(PREMASTER_SECRET_SIZE, 0);
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rstest::rstest;

    use super::*;

    fn encode(pdu: &LicensePdu) -> Vec<u8> {
        let mut buf = Vec::new();
        pdu.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn valid_client_alert_bytes() {
        let buf = encode(&LicensePdu::ErrorAlert(LicenseErrorMessage::valid_client()));
        assert_eq!(
            buf,
            [
                0xFF, 0x83, 0x10, 0x00, 0x07, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00
            ]
        );
    }

    #[rstest]
    #[case(LicenseErrorMessage::valid_client(), LicenseOutcome::Granted)]
    #[case(
        LicenseErrorMessage { error_code: LicenseErrorCode::NO_LICENSE, state_transition: ST_TOTAL_ABORT, error_info: Vec::new() },
        LicenseOutcome::Denied(LicenseErrorCode::NO_LICENSE)
    )]
    fn error_alert_outcome(#[case] alert: LicenseErrorMessage, #[case] expected: LicenseOutcome) {
        let mut exchange = ClientLicenseExchange::new("alice", "WORKSTATION", None);
        let pdu = LicensePdu::decode(&encode(&LicensePdu::ErrorAlert(alert))).unwrap();
        assert_eq!(exchange.process(pdu).unwrap(), expected);
    }

    // p = 61, q = 53, n = 3233, e = 17, d = 2753. The premaster secret is only meaningful modulo n
    // with such a small key, so this test checks message flow and MAC agreement, not secrecy.
    #[test]
    fn full_exchange_with_platform_challenge() {
        let key = RsaPublicKey {
            exponent: 17,
            modulus: vec![0xA1, 0x0C],
        };
        let mut exchange = ClientLicenseExchange::new("alice", "WORKSTATION", Some(key));

        let request = LicenseRequest {
            server_random: [7; 32],
            product_version: 0x0006_0000,
            company_name: b"M\0i\0c\0r\0o\0s\0o\0f\0t\0\0\0".to_vec(),
            product_id: b"A02\0".to_vec(),
            server_certificate: Vec::new(),
            scopes: vec![b"microsoft.com\0".to_vec()],
        };
        let request = LicensePdu::decode(&encode(&LicensePdu::LicenseRequest(request))).unwrap();

        let LicenseOutcome::Reply(reply) = exchange.process(request).unwrap() else {
            panic!("expected a new license request");
        };
        let LicensePdu::NewLicenseRequest(new_request) = LicensePdu::decode(&encode(&reply)).unwrap() else {
            panic!("unexpected reply");
        };
        assert_eq!(new_request.user_name, "alice");
        assert_eq!(new_request.machine_name, "WORKSTATION");
        assert_eq!(new_request.encrypted_premaster_secret.len(), 2 + 8);

        // Server side uses the client's keys directly.
        let keys = exchange.keys.clone().unwrap();
        let challenge = b"challenge bytes".to_vec();
        let server_challenge = PlatformChallenge {
            encrypted_challenge: keys.rc4().unwrap().process_vec(&challenge),
            mac: keys.mac(&challenge),
        };

        let LicenseOutcome::Reply(LicensePdu::PlatformChallengeResponse(response)) =
            exchange.process(LicensePdu::PlatformChallenge(server_challenge)).unwrap()
        else {
            panic!("expected a challenge response");
        };

        let response_data = keys.rc4().unwrap().process_vec(&response.encrypted_response);
        let hwid = keys.rc4().unwrap().process_vec(&response.encrypted_hwid);
        assert_eq!(&response_data[8..], challenge.as_slice());
        assert_eq!(hwid.len(), HWID_SIZE);

        let mut mac_data = response_data;
        mac_data.extend_from_slice(&hwid);
        assert_eq!(keys.mac(&mac_data), response.mac);
    }

    #[test]
    fn tampered_challenge_is_rejected() {
        let mut exchange = ClientLicenseExchange::new("alice", "WORKSTATION", None);
        exchange.keys = Some(LicensingKeys::derive(&[1; 48], &[2; 32], &[3; 32]));
        let keys = exchange.keys.clone().unwrap();

        let challenge = PlatformChallenge {
            encrypted_challenge: keys.rc4().unwrap().process_vec(b"abc"),
            mac: [0; MAC_SIZE],
        };
        assert!(matches!(
            exchange.process(LicensePdu::PlatformChallenge(challenge)),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn challenge_before_request_is_invalid() {
        let mut exchange = ClientLicenseExchange::new("alice", "WORKSTATION", None);
        let challenge = PlatformChallenge {
            encrypted_challenge: vec![1, 2, 3],
            mac: [0; MAC_SIZE],
        };
        assert!(exchange.process(LicensePdu::PlatformChallenge(challenge)).is_err());
    }

    #[test]
    fn decrypting_premaster_inverts_rsa() {
        let key = RsaPublicKey {
            exponent: 17,
            modulus: vec![0xA1, 0x0C],
        };
        let encrypted = key.encrypt(&[65]).unwrap();
        let decrypted = decrypt_premaster_secret(&encrypted, &key.modulus, &2753u32.to_le_bytes());
        assert_eq!(decrypted[0], 65);
        assert!(decrypted[1..].iter().all(|b| *b == 0));
    }
}
