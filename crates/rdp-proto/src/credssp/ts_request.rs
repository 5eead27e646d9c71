//! `TSRequest` and `TSCredentials` DER structures (MS-CSSP 2.2.1).

use crate::ber;
use crate::sspi::{self, AuthIdentity, SspiError, SspiErrorType, STATUS_LOGON_FAILURE};
use crate::utils::{from_utf16_bytes, to_utf16_bytes};
use crate::{Error, Result};

pub const TS_REQUEST_VERSION: u32 = 6;
pub const NONCE_SIZE: usize = 32;

/// `TSCredentials.credType` for `TSPasswordCreds`.
const CRED_TYPE_PASSWORD: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsRequest {
    pub version: u32,
    /// Version announced by the peer, known once a request was received.
    pub peer_version: Option<u32>,
    pub nego_tokens: Option<Vec<u8>>,
    pub auth_info: Option<Vec<u8>>,
    pub pub_key_auth: Option<Vec<u8>>,
    pub error_code: Option<u32>,
    pub client_nonce: Option<[u8; NONCE_SIZE]>,
}

impl Default for TsRequest {
    fn default() -> Self {
        Self {
            version: TS_REQUEST_VERSION,
            peer_version: None,
            nego_tokens: None,
            auth_info: None,
            pub_key_auth: None,
            error_code: None,
            client_nonce: None,
        }
    }
}

impl TsRequest {
    pub fn with_random_nonce(version: u32) -> Self {
        Self {
            version,
            client_nonce: (version >= 5).then(rand::random),
            ..Self::default()
        }
    }

    /// Request reporting a failed handshake to the client.
    pub fn error(version: u32, status: u32) -> Self {
        Self {
            version,
            error_code: Some(status),
            ..Self::default()
        }
    }

    /// Takes over the fields of an incoming request, keeping our own version.
    pub fn update(&mut self, incoming: TsRequest) {
        self.peer_version = Some(incoming.version);
        self.nego_tokens = incoming.nego_tokens;
        self.auth_info = incoming.auth_info;
        self.pub_key_auth = incoming.pub_key_auth;
        self.error_code = incoming.error_code;
        if incoming.client_nonce.is_some() {
            self.client_nonce = incoming.client_nonce;
        }
    }

    pub fn check_error(&self) -> sspi::Result<()> {
        match self.error_code {
            None | Some(0) => Ok(()),
            Some(STATUS_LOGON_FAILURE) => Err(SspiError::new(
                SspiErrorType::LogonDenied,
                "server rejected the credentials (STATUS_LOGON_FAILURE)",
            )),
            Some(code) => Err(SspiError::new(
                SspiErrorType::InternalError,
                format!("server returned NTSTATUS 0x{code:08X}"),
            )),
        }
    }

    /// Version both sides agreed on, which selects the public key binding scheme.
    pub fn negotiated_version(&self) -> Option<u32> {
        self.peer_version.map(|peer| peer.min(self.version))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut fields = Vec::new();

        let mut version = Vec::new();
        ber::write_integer(&mut version, self.version);
        ber::write_contextual(&mut fields, 0, &version)?;

        if let Some(nego_tokens) = &self.nego_tokens {
            let mut token = Vec::new();
            ber::write_octet_string(&mut token, nego_tokens)?;
            let mut nego_data_item = Vec::new();
            ber::write_contextual(&mut nego_data_item, 0, &token)?;
            let mut item = Vec::new();
            ber::write_sequence(&mut item, &nego_data_item)?;
            let mut nego_data = Vec::new();
            ber::write_sequence(&mut nego_data, &item)?;
            ber::write_contextual(&mut fields, 1, &nego_data)?;
        }

        write_optional_octet_string(&mut fields, 2, self.auth_info.as_deref())?;
        write_optional_octet_string(&mut fields, 3, self.pub_key_auth.as_deref())?;

        if let Some(error_code) = self.error_code {
            let mut code = Vec::new();
            ber::write_integer(&mut code, error_code);
            ber::write_contextual(&mut fields, 4, &code)?;
        }

        write_optional_octet_string(&mut fields, 5, self.client_nonce.as_ref().map(|nonce| nonce.as_slice()))?;

        let mut out = Vec::with_capacity(fields.len() + 4);
        ber::write_sequence(&mut out, &fields)?;
        Ok(out)
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut src = src;
        let mut fields = ber::read_sequence(&mut src)?;

        let mut version_field = ber::read_contextual(&mut fields, 0)?;
        let version = ber::read_integer(&mut version_field)?;

        let nego_tokens = if ber::peek_contextual(fields, 1) {
            let mut nego_data = ber::read_contextual(&mut fields, 1)?;
            let mut items = ber::read_sequence(&mut nego_data)?;
            let mut item = ber::read_sequence(&mut items)?;
            let mut token = ber::read_contextual(&mut item, 0)?;
            Some(ber::read_octet_string(&mut token)?.to_vec())
        } else {
            None
        };

        let auth_info = read_optional_octet_string(&mut fields, 2)?;
        let pub_key_auth = read_optional_octet_string(&mut fields, 3)?;

        let error_code = if ber::peek_contextual(fields, 4) {
            let mut code = ber::read_contextual(&mut fields, 4)?;
            Some(ber::read_integer(&mut code)?)
        } else {
            None
        };

        let client_nonce = read_optional_octet_string(&mut fields, 5)?
            .map(|nonce| {
                <[u8; NONCE_SIZE]>::try_from(nonce.as_slice())
                    .map_err(|_| Error::invalid("TSRequest", "clientNonce", "must be 32 bytes"))
            })
            .transpose()?;

        Ok(Self {
            version,
            peer_version: None,
            nego_tokens,
            auth_info,
            pub_key_auth,
            error_code,
            client_nonce,
        })
    }

    /// Total size of the DER `TSRequest` starting at `header`, once enough of it is known.
    pub fn frame_length(header: &[u8]) -> Result<Option<usize>> {
        let Some((&tag, rest)) = header.split_first() else {
            return Ok(None);
        };
        if tag != 0x30 {
            return Err(Error::UnexpectedMessage {
                name: "TSRequest tag",
                got: u32::from(tag),
            });
        }

        let Some(&first) = rest.first() else {
            return Ok(None);
        };
        let length_size = if first & 0x80 == 0 { 1 } else { 1 + usize::from(first & 0x7F) };
        if rest.len() < length_size {
            return Ok(None);
        }

        let mut length_bytes = rest;
        let content = ber::read_length(&mut length_bytes)?;
        Ok(Some(1 + length_size + content))
    }
}

fn write_optional_octet_string(dst: &mut Vec<u8>, n: u8, value: Option<&[u8]>) -> Result<()> {
    if let Some(value) = value {
        let mut octets = Vec::with_capacity(value.len() + 4);
        ber::write_octet_string(&mut octets, value)?;
        ber::write_contextual(dst, n, &octets)?;
    }
    Ok(())
}

fn read_optional_octet_string(src: &mut &[u8], n: u8) -> Result<Option<Vec<u8>>> {
    if !ber::peek_contextual(src, n) {
        return Ok(None);
    }
    let mut field = ber::read_contextual(src, n)?;
    Ok(Some(ber::read_octet_string(&mut field)?.to_vec()))
}

/// `TSCredentials` carrying `TSPasswordCreds`, all strings UTF-16LE.
pub fn write_ts_credentials(identity: &AuthIdentity) -> Result<Vec<u8>> {
    let mut password_fields = Vec::new();
    for (n, value) in [(0, &identity.domain), (1, &identity.user), (2, &identity.password)] {
        write_optional_octet_string(&mut password_fields, n, Some(&to_utf16_bytes(value)))?;
    }
    let mut password_creds = Vec::new();
    ber::write_sequence(&mut password_creds, &password_fields)?;

    let mut fields = Vec::new();
    let mut cred_type = Vec::new();
    ber::write_integer(&mut cred_type, CRED_TYPE_PASSWORD);
    ber::write_contextual(&mut fields, 0, &cred_type)?;
    write_optional_octet_string(&mut fields, 1, Some(&password_creds))?;

    let mut out = Vec::new();
    ber::write_sequence(&mut out, &fields)?;
    Ok(out)
}

pub fn read_ts_credentials(src: &[u8]) -> Result<AuthIdentity> {
    let mut src = src;
    let mut fields = ber::read_sequence(&mut src)?;

    let mut cred_type = ber::read_contextual(&mut fields, 0)?;
    let cred_type = ber::read_integer(&mut cred_type)?;
    if cred_type != CRED_TYPE_PASSWORD {
        return Err(Error::UnexpectedMessage {
            name: "TSCredentials credType",
            got: cred_type,
        });
    }

    let password_creds = read_optional_octet_string(&mut fields, 1)?
        .ok_or_else(|| Error::invalid("TSCredentials", "credentials", "missing"))?;
    let mut password_creds = password_creds.as_slice();
    let mut password_fields = ber::read_sequence(&mut password_creds)?;

    let mut strings = [String::new(), String::new(), String::new()];
    for (n, slot) in (0u8..).zip(strings.iter_mut()) {
        let value = read_optional_octet_string(&mut password_fields, n)?
            .ok_or_else(|| Error::invalid("TSPasswordCreds", "field", "missing"))?;
        *slot = from_utf16_bytes(&value);
    }
    let [domain, user, password] = strings;

    Ok(AuthIdentity { user, domain, password })
}
