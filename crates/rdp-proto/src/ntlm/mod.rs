//! NTLMv2 security package, client and server sides.

pub mod computations;
pub mod messages;

use bitflags::bitflags;
use rand::Rng as _;

use self::computations::{SESSION_KEY_SIZE, SealingKeys};
use self::messages::{
    AuthenticateMessage, AvId, AvPair, CHALLENGE_SIZE, ChallengeMessage, MIC_OFFSET, MIC_SIZE, NegotiateMessage,
    encode_av_pairs, find_av_pair,
};
use crate::encryption::{Rc4, hmac_md5};
use crate::sspi::{self, AuthIdentity, PackageType, Sspi, SspiError, SspiErrorType, SspiOk};
use crate::utils::{from_utf16_bytes, to_utf16_bytes};

pub const NTLM_VERSION_SIZE: usize = 8;
pub const SIGNATURE_SIZE: usize = 16;

/// Windows 10 build 19041, NTLMSSP_REVISION_W2K3.
pub const NTLM_VERSION: [u8; NTLM_VERSION_SIZE] = [10, 0, 0x61, 0x4A, 0, 0, 0, 0x0F];

const SIGNATURE_VERSION: u32 = 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NegotiateFlags: u32 {
        const NEGOTIATE_56 = 0x8000_0000;
        const KEY_EXCH = 0x4000_0000;
        const NEGOTIATE_128 = 0x2000_0000;
        const VERSION = 0x0200_0000;
        const TARGET_INFO = 0x0080_0000;
        const EXTENDED_SESSION_SECURITY = 0x0008_0000;
        const TARGET_TYPE_SERVER = 0x0002_0000;
        const TARGET_TYPE_DOMAIN = 0x0001_0000;
        const ALWAYS_SIGN = 0x0000_8000;
        const ANONYMOUS = 0x0000_0800;
        const NTLM = 0x0000_0200;
        const LM_KEY = 0x0000_0080;
        const DATAGRAM = 0x0000_0040;
        const SEAL = 0x0000_0020;
        const SIGN = 0x0000_0010;
        const REQUEST_TARGET = 0x0000_0004;
        const OEM = 0x0000_0002;
        const UNICODE = 0x0000_0001;
    }
}

pub const CLIENT_FLAGS: NegotiateFlags = NegotiateFlags::NEGOTIATE_56
    .union(NegotiateFlags::KEY_EXCH)
    .union(NegotiateFlags::NEGOTIATE_128)
    .union(NegotiateFlags::VERSION)
    .union(NegotiateFlags::TARGET_INFO)
    .union(NegotiateFlags::EXTENDED_SESSION_SECURITY)
    .union(NegotiateFlags::ALWAYS_SIGN)
    .union(NegotiateFlags::NTLM)
    .union(NegotiateFlags::SEAL)
    .union(NegotiateFlags::SIGN)
    .union(NegotiateFlags::REQUEST_TARGET)
    .union(NegotiateFlags::UNICODE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NtlmState {
    Initial,
    Challenge,
    Authenticate,
    Completion,
    Final,
}

/// Directional RC4 sealing state once the session key is known.
struct SecurityContext {
    send_signing_key: [u8; 16],
    recv_signing_key: [u8; 16],
    send_sealing: Rc4,
    recv_sealing: Rc4,
    key_exchange: bool,
}

impl SecurityContext {
    fn new(keys: &SealingKeys, is_client: bool, key_exchange: bool) -> crate::Result<Self> {
        let (send_signing_key, recv_signing_key, send_sealing, recv_sealing) = if is_client {
            (
                keys.client_signing,
                keys.server_signing,
                &keys.client_sealing,
                &keys.server_sealing,
            )
        } else {
            (
                keys.server_signing,
                keys.client_signing,
                &keys.server_sealing,
                &keys.client_sealing,
            )
        };

        Ok(Self {
            send_signing_key,
            recv_signing_key,
            send_sealing: Rc4::new(send_sealing)?,
            recv_sealing: Rc4::new(recv_sealing)?,
            key_exchange,
        })
    }
}

/// NTLM context. The same type drives `initialize_security_context` (client) and
/// `accept_security_context` (server).
pub struct Ntlm {
    identity: AuthIdentity,
    version: [u8; NTLM_VERSION_SIZE],
    state: NtlmState,
    flags: NegotiateFlags,
    negotiate_message: Vec<u8>,
    challenge_message: Vec<u8>,
    server_challenge: [u8; CHALLENGE_SIZE],
    context: Option<SecurityContext>,
}

impl core::fmt::Debug for Ntlm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ntlm")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Ntlm {
    pub fn new(identity: AuthIdentity, version: [u8; NTLM_VERSION_SIZE]) -> Self {
        Self {
            identity,
            version,
            state: NtlmState::Initial,
            flags: CLIENT_FLAGS,
            negotiate_message: Vec::new(),
            challenge_message: Vec::new(),
            server_challenge: [0; CHALLENGE_SIZE],
            context: None,
        }
    }

    fn write_negotiate(&mut self, output: &mut Vec<u8>) -> sspi::SspiResult {
        let message = NegotiateMessage {
            flags: CLIENT_FLAGS,
            version: self.version,
        }
        .encode()?;

        output.extend_from_slice(&message);
        self.negotiate_message = message;
        self.state = NtlmState::Challenge;

        Ok(SspiOk::ContinueNeeded)
    }

    fn process_challenge(&mut self, input: &[u8], output: &mut Vec<u8>) -> sspi::SspiResult {
        let challenge = ChallengeMessage::decode(input)?;
        self.challenge_message = input.to_vec();
        self.server_challenge = challenge.server_challenge;
        self.flags = challenge.flags & CLIENT_FLAGS;

        if !self.flags.contains(NegotiateFlags::EXTENDED_SESSION_SECURITY) {
            return Err(SspiError::new(
                SspiErrorType::InvalidToken,
                "server does not support extended session security",
            ));
        }

        let server_timestamp = find_av_pair(&challenge.target_info, AvId::Timestamp)
            .and_then(|value| <[u8; 8]>::try_from(value).ok());
        let timestamp = server_timestamp.unwrap_or_else(computations::now_filetime);
        let client_challenge: [u8; CHALLENGE_SIZE] = rand::random();

        let target_info = encode_av_pairs(&computations::client_target_info(&challenge.target_info))?;
        let response_key = computations::ntowf_v2(&self.identity.password, &self.identity.user, &self.identity.domain)?;

        let blob = computations::client_blob(&timestamp, &client_challenge, &target_info);
        let nt_proof = computations::nt_proof(&response_key, &self.server_challenge, &blob)?;
        let mut nt_response = nt_proof.to_vec();
        nt_response.extend_from_slice(&blob);

        let lm_response = if server_timestamp.is_some() {
            vec![0; computations::LM_RESPONSE_SIZE]
        } else {
            computations::lm_v2_response(&response_key, &self.server_challenge, &client_challenge)?
        };

        let key_exchange_key = computations::session_base_key(&response_key, &nt_proof)?;
        let (exported_session_key, encrypted_random_session_key) = if self.flags.contains(NegotiateFlags::KEY_EXCH) {
            let mut exported = [0u8; SESSION_KEY_SIZE];
            rand::thread_rng().fill(&mut exported[..]);
            let encrypted = computations::rc4k(&key_exchange_key, &exported)?;
            (exported, encrypted)
        } else {
            (key_exchange_key, Vec::new())
        };

        let mut message = AuthenticateMessage {
            lm_response,
            nt_response,
            domain: to_utf16_bytes(&self.identity.domain),
            user: to_utf16_bytes(&self.identity.user),
            workstation: Vec::new(),
            encrypted_random_session_key,
            flags: self.flags,
            version: self.version,
            mic: [0; MIC_SIZE],
        }
        .encode()?;

        let mic = computations::compute_mic(
            &exported_session_key,
            &[&self.negotiate_message, &self.challenge_message, &message],
        )?;
        message[MIC_OFFSET..MIC_OFFSET + MIC_SIZE].copy_from_slice(&mic);

        self.context = Some(SecurityContext::new(
            &computations::sealing_keys(&exported_session_key),
            true,
            self.flags.contains(NegotiateFlags::KEY_EXCH),
        )?);

        output.extend_from_slice(&message);
        self.state = NtlmState::Final;

        Ok(SspiOk::CompleteNeeded)
    }

    fn process_negotiate(&mut self, input: &[u8], output: &mut Vec<u8>) -> sspi::SspiResult {
        let negotiate = NegotiateMessage::decode(input)?;
        self.negotiate_message = input.to_vec();
        self.flags = (negotiate.flags & CLIENT_FLAGS) | NegotiateFlags::TARGET_INFO | NegotiateFlags::TARGET_TYPE_DOMAIN;

        self.server_challenge = rand::random();
        let domain = to_utf16_bytes(&self.identity.domain);

        let message = ChallengeMessage {
            target_name: domain.clone(),
            flags: self.flags,
            server_challenge: self.server_challenge,
            target_info: vec![
                AvPair::new(AvId::NbDomainName, domain.clone()),
                AvPair::new(AvId::NbComputerName, to_utf16_bytes("RDP-SERVER")),
                AvPair::new(AvId::DnsDomainName, domain),
                AvPair::new(AvId::DnsComputerName, to_utf16_bytes("rdp-server")),
                AvPair::new(AvId::Timestamp, computations::now_filetime().to_vec()),
            ],
            version: self.version,
        }
        .encode()?;

        output.extend_from_slice(&message);
        self.challenge_message = message;
        self.state = NtlmState::Authenticate;

        Ok(SspiOk::ContinueNeeded)
    }

    fn process_authenticate(&mut self, input: &[u8]) -> sspi::SspiResult {
        let message = AuthenticateMessage::decode(input)?;

        let user = from_utf16_bytes(&message.user);
        let domain = from_utf16_bytes(&message.domain);
        if !user.eq_ignore_ascii_case(&self.identity.user) || !domain.eq_ignore_ascii_case(&self.identity.domain) {
            return Err(SspiError::new(SspiErrorType::LogonDenied, "unknown user"));
        }

        if message.nt_response.len() < computations::NT_PROOF_SIZE + 28 {
            return Err(SspiError::new(SspiErrorType::InvalidToken, "NTLMv2 response is too short"));
        }
        let (received_proof, blob) = message.nt_response.split_at(computations::NT_PROOF_SIZE);

        let response_key = computations::ntowf_v2(&self.identity.password, &user, &domain)?;
        let nt_proof = computations::nt_proof(&response_key, &self.server_challenge, blob)?;
        if nt_proof.as_slice() != received_proof {
            return Err(SspiError::new(SspiErrorType::LogonDenied, "NT proof mismatch"));
        }

        let key_exchange_key = computations::session_base_key(&response_key, &nt_proof)?;
        let exported_session_key = if message.flags.contains(NegotiateFlags::KEY_EXCH) {
            let unwrapped = computations::rc4k(&key_exchange_key, &message.encrypted_random_session_key)?;
            <[u8; SESSION_KEY_SIZE]>::try_from(unwrapped.as_slice())
                .map_err(|_| SspiError::new(SspiErrorType::InvalidToken, "invalid encrypted session key size"))?
        } else {
            key_exchange_key
        };

        let mut zeroed = input.to_vec();
        zeroed[MIC_OFFSET..MIC_OFFSET + MIC_SIZE].fill(0);
        let mic = computations::compute_mic(
            &exported_session_key,
            &[&self.negotiate_message, &self.challenge_message, &zeroed],
        )?;
        if mic != message.mic {
            return Err(SspiError::new(SspiErrorType::MessageAltered, "MIC mismatch"));
        }

        self.flags = message.flags;
        self.context = Some(SecurityContext::new(
            &computations::sealing_keys(&exported_session_key),
            false,
            self.flags.contains(NegotiateFlags::KEY_EXCH),
        )?);
        self.state = NtlmState::Completion;

        Ok(SspiOk::CompleteNeeded)
    }

    fn context_mut(&mut self) -> sspi::Result<&mut SecurityContext> {
        self.context
            .as_mut()
            .ok_or_else(|| SspiError::new(SspiErrorType::OutOfSequence, "security context is not established"))
    }
}

fn checksum(
    signing_key: &[u8; 16],
    sealing: &mut Rc4,
    key_exchange: bool,
    sequence_number: u32,
    message: &[u8],
) -> sspi::Result<[u8; 8]> {
    let digest = hmac_md5(signing_key, &[&sequence_number.to_le_bytes(), message])?;
    let mut checksum = [0u8; 8];
    checksum.copy_from_slice(&digest[..8]);
    if key_exchange {
        sealing.process(&mut checksum);
    }
    Ok(checksum)
}

impl Sspi for Ntlm {
    fn package_type(&self) -> PackageType {
        PackageType::Ntlm
    }

    fn identity(&self) -> &AuthIdentity {
        &self.identity
    }

    fn initialize_security_context(&mut self, input: &[u8], output: &mut Vec<u8>) -> sspi::SspiResult {
        match self.state {
            NtlmState::Initial => self.write_negotiate(output),
            NtlmState::Challenge => self.process_challenge(input, output),
            _ => Err(SspiError::new(SspiErrorType::OutOfSequence, "NTLM client is not expecting a token")),
        }
    }

    fn accept_security_context(&mut self, input: &[u8], output: &mut Vec<u8>) -> sspi::SspiResult {
        match self.state {
            NtlmState::Initial => self.process_negotiate(input, output),
            NtlmState::Authenticate => self.process_authenticate(input),
            _ => Err(SspiError::new(SspiErrorType::OutOfSequence, "NTLM server is not expecting a token")),
        }
    }

    fn complete_auth_token(&mut self) -> sspi::Result<()> {
        if self.state != NtlmState::Completion {
            return Err(SspiError::new(SspiErrorType::OutOfSequence, "nothing to complete"));
        }
        self.state = NtlmState::Final;
        Ok(())
    }

    /// Seals `input`; the output is the 16-byte signature followed by the encrypted data.
    fn encrypt_message(&mut self, input: &[u8], message_seq_number: u32) -> sspi::Result<Vec<u8>> {
        let context = self.context_mut()?;

        let mut encrypted = input.to_vec();
        context.send_sealing.process(&mut encrypted);
        let checksum = checksum(
            &context.send_signing_key,
            &mut context.send_sealing,
            context.key_exchange,
            message_seq_number,
            input,
        )?;

        let mut output = Vec::with_capacity(SIGNATURE_SIZE + encrypted.len());
        output.extend_from_slice(&SIGNATURE_VERSION.to_le_bytes());
        output.extend_from_slice(&checksum);
        output.extend_from_slice(&message_seq_number.to_le_bytes());
        output.extend_from_slice(&encrypted);

        Ok(output)
    }

    fn decrypt_message(&mut self, input: &[u8], message_seq_number: u32) -> sspi::Result<Vec<u8>> {
        if input.len() < SIGNATURE_SIZE {
            return Err(SspiError::new(SspiErrorType::InvalidToken, "sealed message is shorter than its signature"));
        }
        let (signature, encrypted) = input.split_at(SIGNATURE_SIZE);
        let context = self.context_mut()?;

        let mut decrypted = encrypted.to_vec();
        context.recv_sealing.process(&mut decrypted);
        let expected = checksum(
            &context.recv_signing_key,
            &mut context.recv_sealing,
            context.key_exchange,
            message_seq_number,
            &decrypted,
        )?;

        if signature[4..12] != expected || signature[12..16] != message_seq_number.to_le_bytes() {
            return Err(SspiError::new(SspiErrorType::MessageAltered, "signature verification failed"));
        }

        Ok(decrypted)
    }
}
