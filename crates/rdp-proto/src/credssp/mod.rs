//! CredSSP (MS-CSSP) over NTLM, client and server state machines.

pub mod ts_request;

use self::ts_request::{NONCE_SIZE, TS_REQUEST_VERSION, TsRequest};
use crate::encryption::compute_sha256;
use crate::ntlm::{NTLM_VERSION, Ntlm};
use crate::sspi::{self, AuthIdentity, PackageType, Sspi, SspiError, SspiErrorType, SspiOk};

const HASH_MAGIC_LEN: usize = 38;
const SERVER_CLIENT_HASH_MAGIC: &[u8; HASH_MAGIC_LEN] = b"CredSSP Server-To-Client Binding Hash\0";
const CLIENT_SERVER_HASH_MAGIC: &[u8; HASH_MAGIC_LEN] = b"CredSSP Client-To-Server Binding Hash\0";

/// First version binding the public key with a nonce-salted hash instead of an echo.
const HASH_BINDING_VERSION: u32 = 5;

pub struct CredSspClient {
    state: CredSspState,
    ts_request: TsRequest,
    context: Option<CredSspContext>,
    identity: AuthIdentity,
    public_key: Vec<u8>,
}

pub struct CredSspServer {
    state: CredSspState,
    ts_request: TsRequest,
    context: Option<CredSspContext>,
    identity: AuthIdentity,
    public_key: Vec<u8>,
}

#[derive(Debug)]
pub enum CredSspResult {
    ReplyNeeded(TsRequest),
    FinalMessage(TsRequest),
    Finished,
}

pub trait CredSsp {
    fn update_ts_request(&mut self, ts_request: TsRequest) -> sspi::Result<()>;
    fn process(&mut self) -> sspi::Result<CredSspResult>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CredSspState {
    Initial,
    NegoToken,
    AuthInfo,
    Final,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum EndpointType {
    Client,
    Server,
}

struct CredSspContext {
    sspi_context: SspiProvider,
    send_seq_num: u32,
    recv_seq_num: u32,
}

enum SspiProvider {
    NtlmContext(Ntlm),
}

impl CredSspClient {
    /// `public_key` is the SubjectPublicKey of the server's TLS certificate.
    pub fn new(public_key: Vec<u8>, identity: AuthIdentity) -> Self {
        Self::with_version(public_key, identity, TS_REQUEST_VERSION)
    }

    pub fn with_version(public_key: Vec<u8>, identity: AuthIdentity, version: u32) -> Self {
        Self {
            state: CredSspState::Initial,
            ts_request: TsRequest::with_random_nonce(version),
            context: None,
            identity,
            public_key,
        }
    }
}

impl CredSspServer {
    /// `identity` holds the only credentials the server accepts.
    pub fn new(public_key: Vec<u8>, identity: AuthIdentity, version: u32) -> Self {
        Self {
            state: CredSspState::Initial,
            ts_request: TsRequest {
                version,
                ..TsRequest::default()
            },
            context: None,
            identity,
            public_key,
        }
    }

    pub fn version(&self) -> u32 {
        self.ts_request.version
    }
}

impl SspiProvider {
    fn new_ntlm(identity: AuthIdentity) -> Self {
        SspiProvider::NtlmContext(Ntlm::new(identity, NTLM_VERSION))
    }
}

fn no_context() -> SspiError {
    SspiError::new(SspiErrorType::OutOfSequence, "CredSSP context is not initialized")
}

fn no_peer_version() -> SspiError {
    SspiError::new(
        SspiErrorType::OutOfSequence,
        "public key binding requires a TSRequest from the peer",
    )
}

impl CredSsp for CredSspClient {
    fn update_ts_request(&mut self, ts_request: TsRequest) -> sspi::Result<()> {
        self.ts_request.update(ts_request);
        self.ts_request.check_error()
    }

    fn process(&mut self) -> sspi::Result<CredSspResult> {
        loop {
            match self.state {
                CredSspState::Initial => {
                    self.context = Some(CredSspContext::new(SspiProvider::new_ntlm(self.identity.clone())));
                    self.state = CredSspState::NegoToken;
                }
                CredSspState::NegoToken => {
                    let input = self.ts_request.nego_tokens.take().unwrap_or_default();
                    let context = self.context.as_mut().ok_or_else(no_context)?;

                    let mut output = Vec::new();
                    let status = context
                        .sspi_context
                        .initialize_security_context(&input, &mut output)?;
                    self.ts_request.nego_tokens = Some(output);

                    if status == SspiOk::CompleteNeeded {
                        let version = self.ts_request.negotiated_version().ok_or_else(no_peer_version)?;
                        self.ts_request.pub_key_auth = Some(context.encrypt_public_key(
                            &self.public_key,
                            EndpointType::Client,
                            self.ts_request.client_nonce.as_ref(),
                            version,
                        )?);
                        self.state = CredSspState::AuthInfo;
                    }

                    return Ok(CredSspResult::ReplyNeeded(self.ts_request.clone()));
                }
                CredSspState::AuthInfo => {
                    self.ts_request.nego_tokens = None;

                    let pub_key_auth = self
                        .ts_request
                        .pub_key_auth
                        .take()
                        .ok_or_else(|| SspiError::new(SspiErrorType::InvalidToken, "expected an encrypted public key"))?;
                    let version = self.ts_request.negotiated_version().ok_or_else(no_peer_version)?;
                    let context = self.context.as_mut().ok_or_else(no_context)?;

                    context.decrypt_public_key(
                        &self.public_key,
                        &pub_key_auth,
                        EndpointType::Client,
                        self.ts_request.client_nonce.as_ref(),
                        version,
                    )?;

                    self.ts_request.auth_info = Some(context.encrypt_ts_credentials()?);
                    self.state = CredSspState::Final;

                    return Ok(CredSspResult::FinalMessage(self.ts_request.clone()));
                }
                CredSspState::Final => return Ok(CredSspResult::Finished),
            }
        }
    }
}

impl CredSsp for CredSspServer {
    fn update_ts_request(&mut self, ts_request: TsRequest) -> sspi::Result<()> {
        self.ts_request.update(ts_request);
        Ok(())
    }

    fn process(&mut self) -> sspi::Result<CredSspResult> {
        loop {
            match self.state {
                CredSspState::Initial => {
                    self.context = Some(CredSspContext::new(SspiProvider::new_ntlm(self.identity.clone())));
                    self.state = CredSspState::NegoToken;
                }
                CredSspState::NegoToken => {
                    let input = self
                        .ts_request
                        .nego_tokens
                        .take()
                        .ok_or_else(|| SspiError::new(SspiErrorType::InvalidToken, "got empty nego_tokens field"))?;
                    let context = self.context.as_mut().ok_or_else(no_context)?;

                    let mut output = Vec::new();
                    match context.sspi_context.accept_security_context(&input, &mut output)? {
                        SspiOk::ContinueNeeded => {
                            self.ts_request.nego_tokens = Some(output);
                        }
                        SspiOk::CompleteNeeded => {
                            context.sspi_context.complete_auth_token()?;
                            self.ts_request.nego_tokens = None;

                            let pub_key_auth = self.ts_request.pub_key_auth.take().ok_or_else(|| {
                                SspiError::new(SspiErrorType::InvalidToken, "expected an encrypted public key")
                            })?;
                            let version = self.ts_request.negotiated_version().ok_or_else(no_peer_version)?;

                            context.decrypt_public_key(
                                &self.public_key,
                                &pub_key_auth,
                                EndpointType::Server,
                                self.ts_request.client_nonce.as_ref(),
                                version,
                            )?;
                            self.ts_request.pub_key_auth = Some(context.encrypt_public_key(
                                &self.public_key,
                                EndpointType::Server,
                                self.ts_request.client_nonce.as_ref(),
                                version,
                            )?);

                            self.state = CredSspState::AuthInfo;
                        }
                    }

                    return Ok(CredSspResult::ReplyNeeded(self.ts_request.clone()));
                }
                CredSspState::AuthInfo => {
                    let auth_info = self
                        .ts_request
                        .auth_info
                        .take()
                        .ok_or_else(|| SspiError::new(SspiErrorType::InvalidToken, "expected encrypted TSCredentials"))?;
                    let context = self.context.as_mut().ok_or_else(no_context)?;
                    let delegated = context.decrypt_ts_credentials(&auth_info)?;
                    self.state = CredSspState::Final;

                    if delegated != self.identity {
                        return Err(SspiError::new(
                            SspiErrorType::LogonDenied,
                            "delegated credentials do not match the authenticated identity",
                        ));
                    }

                    return Ok(CredSspResult::Finished);
                }
                CredSspState::Final => return Ok(CredSspResult::Finished),
            }
        }
    }
}

impl CredSspContext {
    fn new(sspi_context: SspiProvider) -> Self {
        Self {
            send_seq_num: 0,
            recv_seq_num: 0,
            sspi_context,
        }
    }

    fn encrypt_public_key(
        &mut self,
        public_key: &[u8],
        endpoint: EndpointType,
        client_nonce: Option<&[u8; NONCE_SIZE]>,
        version: u32,
    ) -> sspi::Result<Vec<u8>> {
        let hash_magic = match endpoint {
            EndpointType::Client => CLIENT_SERVER_HASH_MAGIC,
            EndpointType::Server => SERVER_CLIENT_HASH_MAGIC,
        };

        if version < HASH_BINDING_VERSION {
            self.encrypt_public_key_echo(public_key, endpoint)
        } else {
            let client_nonce = client_nonce.ok_or_else(missing_nonce)?;
            self.encrypt_message(&binding_hash(hash_magic, client_nonce, public_key))
        }
    }

    fn decrypt_public_key(
        &mut self,
        public_key: &[u8],
        encrypted_public_key: &[u8],
        endpoint: EndpointType,
        client_nonce: Option<&[u8; NONCE_SIZE]>,
        version: u32,
    ) -> sspi::Result<()> {
        let hash_magic = match endpoint {
            EndpointType::Client => SERVER_CLIENT_HASH_MAGIC,
            EndpointType::Server => CLIENT_SERVER_HASH_MAGIC,
        };

        if version < HASH_BINDING_VERSION {
            self.decrypt_public_key_echo(public_key, encrypted_public_key, endpoint)
        } else {
            let client_nonce = client_nonce.ok_or_else(missing_nonce)?;
            let decrypted = self.decrypt_message(encrypted_public_key)?;
            if decrypted != binding_hash(hash_magic, client_nonce, public_key) {
                return Err(SspiError::new(
                    SspiErrorType::MessageAltered,
                    "could not verify the public key hash",
                ));
            }
            Ok(())
        }
    }

    fn encrypt_public_key_echo(&mut self, public_key: &[u8], endpoint: EndpointType) -> sspi::Result<Vec<u8>> {
        let mut public_key = public_key.to_vec();

        match self.sspi_context.package_type() {
            PackageType::Ntlm => {
                if endpoint == EndpointType::Server {
                    integer_increment_le(&mut public_key);
                }
            }
        }

        self.encrypt_message(&public_key)
    }

    fn decrypt_public_key_echo(
        &mut self,
        public_key: &[u8],
        encrypted_public_key: &[u8],
        endpoint: EndpointType,
    ) -> sspi::Result<()> {
        let mut decrypted_public_key = self.decrypt_message(encrypted_public_key)?;
        if endpoint == EndpointType::Client {
            integer_decrement_le(&mut decrypted_public_key);
        }

        if public_key != decrypted_public_key.as_slice() {
            return Err(SspiError::new(
                SspiErrorType::MessageAltered,
                "could not verify the public key echo",
            ));
        }

        Ok(())
    }

    fn encrypt_ts_credentials(&mut self) -> sspi::Result<Vec<u8>> {
        let ts_credentials = ts_request::write_ts_credentials(self.sspi_context.identity())?;
        self.encrypt_message(&ts_credentials)
    }

    fn decrypt_ts_credentials(&mut self, auth_info: &[u8]) -> sspi::Result<AuthIdentity> {
        let ts_credentials = self.decrypt_message(auth_info)?;
        Ok(ts_request::read_ts_credentials(&ts_credentials)?)
    }

    fn encrypt_message(&mut self, buffer: &[u8]) -> sspi::Result<Vec<u8>> {
        let encrypted = self.sspi_context.encrypt_message(buffer, self.send_seq_num)?;
        self.send_seq_num += 1;
        Ok(encrypted)
    }

    fn decrypt_message(&mut self, buffer: &[u8]) -> sspi::Result<Vec<u8>> {
        let decrypted = self.sspi_context.decrypt_message(buffer, self.recv_seq_num)?;
        self.recv_seq_num += 1;
        Ok(decrypted)
    }
}

impl Sspi for SspiProvider {
    fn package_type(&self) -> PackageType {
        match self {
            SspiProvider::NtlmContext(ntlm) => ntlm.package_type(),
        }
    }

    fn identity(&self) -> &AuthIdentity {
        match self {
            SspiProvider::NtlmContext(ntlm) => ntlm.identity(),
        }
    }

    fn initialize_security_context(&mut self, input: &[u8], output: &mut Vec<u8>) -> sspi::SspiResult {
        match self {
            SspiProvider::NtlmContext(ntlm) => ntlm.initialize_security_context(input, output),
        }
    }

    fn accept_security_context(&mut self, input: &[u8], output: &mut Vec<u8>) -> sspi::SspiResult {
        match self {
            SspiProvider::NtlmContext(ntlm) => ntlm.accept_security_context(input, output),
        }
    }

    fn complete_auth_token(&mut self) -> sspi::Result<()> {
        match self {
            SspiProvider::NtlmContext(ntlm) => ntlm.complete_auth_token(),
        }
    }

    fn encrypt_message(&mut self, input: &[u8], message_seq_number: u32) -> sspi::Result<Vec<u8>> {
        match self {
            SspiProvider::NtlmContext(ntlm) => ntlm.encrypt_message(input, message_seq_number),
        }
    }

    fn decrypt_message(&mut self, input: &[u8], message_seq_number: u32) -> sspi::Result<Vec<u8>> {
        match self {
            SspiProvider::NtlmContext(ntlm) => ntlm.decrypt_message(input, message_seq_number),
        }
    }
}

fn missing_nonce() -> SspiError {
    SspiError::new(
        SspiErrorType::InvalidToken,
        "client nonce from the TSRequest is empty, but the negotiated version is >= 5",
    )
}

fn binding_hash(hash_magic: &[u8], client_nonce: &[u8], public_key: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(hash_magic.len() + client_nonce.len() + public_key.len());
    data.extend_from_slice(hash_magic);
    data.extend_from_slice(client_nonce);
    data.extend_from_slice(public_key);
    compute_sha256(&data)
}

fn integer_decrement_le(buffer: &mut [u8]) {
    for elem in buffer.iter_mut() {
        let (value, overflow) = elem.overflowing_sub(1);
        *elem = value;
        if !overflow {
            break;
        }
    }
}

fn integer_increment_le(buffer: &mut [u8]) {
    for elem in buffer.iter_mut() {
        let (value, overflow) = elem.overflowing_add(1);
        *elem = value;
        if !overflow {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rstest::rstest;

    use super::*;

    const PUBLIC_KEY: &[u8] = &[0x30, 0x0D, 0x02, 0x06, 0xFF, 0x01, 0x02, 0x03, 0x04, 0x05, 0x02, 0x03, 0x01, 0x00, 0x01];

    fn alice(password: &str) -> AuthIdentity {
        AuthIdentity::new("alice", "CONTOSO", password)
    }

    /// Drives both ends through encoded TSRequests until the client is done.
    fn run(client: &mut CredSspClient, server: &mut CredSspServer) -> sspi::Result<()> {
        loop {
            let request = match client.process()? {
                CredSspResult::ReplyNeeded(request) => request,
                CredSspResult::FinalMessage(request) => {
                    let decoded = TsRequest::decode(&request.encode()?)?;
                    server.update_ts_request(decoded)?;
                    return match server.process()? {
                        CredSspResult::Finished => Ok(()),
                        other => panic!("unexpected server result: {other:?}"),
                    };
                }
                CredSspResult::Finished => return Ok(()),
            };

            server.update_ts_request(TsRequest::decode(&request.encode()?)?)?;
            let reply = match server.process() {
                Ok(CredSspResult::ReplyNeeded(reply)) => reply,
                Ok(other) => panic!("unexpected server result: {other:?}"),
                Err(error) => TsRequest::error(server.version(), error.nt_status()),
            };
            client.update_ts_request(TsRequest::decode(&reply.encode()?)?)?;
        }
    }

    #[rstest]
    #[case::hash_binding(6, 6)]
    #[case::echo_binding(6, 3)]
    #[case::old_client(2, 6)]
    fn handshake_succeeds(#[case] client_version: u32, #[case] server_version: u32) {
        let mut client = CredSspClient::with_version(PUBLIC_KEY.to_vec(), alice("hunter2"), client_version);
        let mut server = CredSspServer::new(PUBLIC_KEY.to_vec(), alice("hunter2"), server_version);

        run(&mut client, &mut server).unwrap();
        assert!(matches!(client.process().unwrap(), CredSspResult::Finished));
    }

    #[test]
    fn wrong_password_is_rejected_with_error_code() {
        let mut client = CredSspClient::new(PUBLIC_KEY.to_vec(), alice("letmein"));
        let mut server = CredSspServer::new(PUBLIC_KEY.to_vec(), alice("hunter2"), TS_REQUEST_VERSION);

        let error = run(&mut client, &mut server).unwrap_err();
        assert_eq!(error.error_type, SspiErrorType::LogonDenied);
    }

    #[test]
    fn public_key_mismatch_is_detected() {
        let mut client = CredSspClient::new(PUBLIC_KEY.to_vec(), alice("hunter2"));
        let mut server = CredSspServer::new(vec![0x42; PUBLIC_KEY.len()], alice("hunter2"), TS_REQUEST_VERSION);

        assert!(run(&mut client, &mut server).is_err());
    }

    #[test]
    fn echo_carries_into_next_byte() {
        let mut key = [0xFF, 0x00, 0x10];
        integer_increment_le(&mut key);
        assert_eq!(key, [0x00, 0x01, 0x10]);
        integer_decrement_le(&mut key);
        assert_eq!(key, [0xFF, 0x00, 0x10]);
    }
}
