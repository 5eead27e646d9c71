//! NTLMv2 key and response computations (MS-NLMP 3.3.2 and 3.4).

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BufMut as _;

use super::messages::{AvId, AvPair, CHALLENGE_SIZE, MSV_AV_FLAGS_MIC_PRESENT, find_av_pair};
use crate::Result;
use crate::encryption::{Rc4, hmac_md5, md4, md5};
use crate::utils::to_utf16_bytes;

pub const SESSION_KEY_SIZE: usize = 16;
pub const NT_PROOF_SIZE: usize = 16;
pub const LM_RESPONSE_SIZE: usize = 24;

const CLIENT_SIGN_MAGIC: &[u8] = b"session key to client-to-server signing key magic constant\0";
const SERVER_SIGN_MAGIC: &[u8] = b"session key to server-to-client signing key magic constant\0";
const CLIENT_SEAL_MAGIC: &[u8] = b"session key to client-to-server sealing key magic constant\0";
const SERVER_SEAL_MAGIC: &[u8] = b"session key to server-to-client sealing key magic constant\0";

/// 100-nanosecond intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET: u64 = 116_444_736_000_000_000;

pub fn now_filetime() -> [u8; 8] {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let intervals = FILETIME_UNIX_OFFSET + since_epoch.as_secs() * 10_000_000 + u64::from(since_epoch.subsec_nanos() / 100);
    intervals.to_le_bytes()
}

/// NTOWFv2: HMAC_MD5(MD4(UNICODE(password)), UNICODE(UPPERCASE(user) + domain)).
pub fn ntowf_v2(password: &str, user: &str, domain: &str) -> Result<[u8; 16]> {
    let nt_hash = md4(&to_utf16_bytes(password));
    let identity = to_utf16_bytes(&format!("{}{domain}", user.to_uppercase()));
    hmac_md5(&nt_hash, &[&identity])
}

/// The client blob (`temp`) hashed into the NT proof.
pub fn client_blob(timestamp: &[u8; 8], client_challenge: &[u8; CHALLENGE_SIZE], target_info: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(28 + target_info.len() + 4);
    blob.put_u8(1); // RespType
    blob.put_u8(1); // HiRespType
    blob.put_bytes(0, 6);
    blob.put_slice(timestamp);
    blob.put_slice(client_challenge);
    blob.put_bytes(0, 4);
    blob.put_slice(target_info);
    blob.put_bytes(0, 4);
    blob
}

pub fn nt_proof(response_key: &[u8; 16], server_challenge: &[u8; CHALLENGE_SIZE], blob: &[u8]) -> Result<[u8; NT_PROOF_SIZE]> {
    hmac_md5(response_key, &[server_challenge, blob])
}

/// LMv2 response, only sent when the server did not provide a timestamp.
pub fn lm_v2_response(
    response_key: &[u8; 16],
    server_challenge: &[u8; CHALLENGE_SIZE],
    client_challenge: &[u8; CHALLENGE_SIZE],
) -> Result<Vec<u8>> {
    let mut response = hmac_md5(response_key, &[server_challenge, client_challenge])?.to_vec();
    response.extend_from_slice(client_challenge);
    Ok(response)
}

pub fn session_base_key(response_key: &[u8; 16], nt_proof: &[u8; NT_PROOF_SIZE]) -> Result<[u8; SESSION_KEY_SIZE]> {
    hmac_md5(response_key, &[nt_proof])
}

/// RC4K, used to wrap and unwrap the exported session key.
pub fn rc4k(key: &[u8; SESSION_KEY_SIZE], data: &[u8]) -> Result<Vec<u8>> {
    Ok(Rc4::new(key)?.process_vec(data))
}

/// Target info the client echoes back: the server's pairs with the MIC flag set.
pub fn client_target_info(server_pairs: &[AvPair]) -> Vec<AvPair> {
    let mut pairs: Vec<AvPair> = server_pairs
        .iter()
        .filter(|pair| pair.id != AvId::Flags as u16)
        .cloned()
        .collect();

    let flags = find_av_pair(server_pairs, AvId::Flags)
        .and_then(|value| value.get(..4))
        .map_or(0, |value| u32::from_le_bytes([value[0], value[1], value[2], value[3]]));

    pairs.push(AvPair::new(
        AvId::Flags,
        (flags | MSV_AV_FLAGS_MIC_PRESENT).to_le_bytes().to_vec(),
    ));
    pairs
}

pub fn compute_mic(exported_session_key: &[u8; SESSION_KEY_SIZE], messages: &[&[u8]]) -> Result<[u8; 16]> {
    hmac_md5(exported_session_key, messages)
}

pub struct SealingKeys {
    pub client_signing: [u8; 16],
    pub server_signing: [u8; 16],
    pub client_sealing: [u8; 16],
    pub server_sealing: [u8; 16],
}

pub fn sealing_keys(exported_session_key: &[u8; SESSION_KEY_SIZE]) -> SealingKeys {
    SealingKeys {
        client_signing: md5(&[exported_session_key, CLIENT_SIGN_MAGIC]),
        server_signing: md5(&[exported_session_key, SERVER_SIGN_MAGIC]),
        client_sealing: md5(&[exported_session_key, CLIENT_SEAL_MAGIC]),
        server_sealing: md5(&[exported_session_key, SERVER_SEAL_MAGIC]),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    // MS-NLMP 4.2.4 test vectors
    const USER: &str = "User";
    const DOMAIN: &str = "Domain";
    const PASSWORD: &str = "Password";
    const SERVER_CHALLENGE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];
    const CLIENT_CHALLENGE: [u8; 8] = [0xAA; 8];

    #[test]
    fn ntowf_v2_vector() {
        assert_eq!(
            ntowf_v2(PASSWORD, USER, DOMAIN).unwrap(),
            [
                0x0C, 0x86, 0x8A, 0x40, 0x3B, 0xFD, 0x7A, 0x93, 0xA3, 0x00, 0x1E, 0xF2, 0x2E, 0xF0, 0x2E, 0x3F
            ]
        );
    }

    #[test]
    fn lm_v2_response_vector() {
        let key = ntowf_v2(PASSWORD, USER, DOMAIN).unwrap();
        assert_eq!(
            lm_v2_response(&key, &SERVER_CHALLENGE, &CLIENT_CHALLENGE).unwrap(),
            [
                0x86, 0xC3, 0x50, 0x97, 0xAC, 0x9C, 0xEC, 0x10, 0x25, 0x54, 0x76, 0x4A, 0x57, 0xCC, 0xCC, 0x19, 0xAA,
                0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA
            ]
        );
    }

    #[test]
    fn nt_proof_vector() {
        let key = ntowf_v2(PASSWORD, USER, DOMAIN).unwrap();
        let target_info = [
            0x02, 0x00, 0x0C, 0x00, 0x44, 0x00, 0x6F, 0x00, 0x6D, 0x00, 0x61, 0x00, 0x69, 0x00, 0x6E, 0x00, 0x01, 0x00,
            0x0C, 0x00, 0x53, 0x00, 0x65, 0x00, 0x72, 0x00, 0x76, 0x00, 0x65, 0x00, 0x72, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let blob = client_blob(&[0; 8], &CLIENT_CHALLENGE, &target_info);
        let proof = nt_proof(&key, &SERVER_CHALLENGE, &blob).unwrap();

        assert_eq!(
            proof,
            [
                0x68, 0xCD, 0x0A, 0xB8, 0x51, 0xE5, 0x1C, 0x96, 0xAA, 0xBC, 0x92, 0x7B, 0xEB, 0xEF, 0x6A, 0x1C
            ]
        );
        assert_eq!(
            session_base_key(&key, &proof).unwrap(),
            [
                0x8D, 0xE4, 0x0C, 0xCA, 0xDB, 0xC1, 0x4A, 0x82, 0xF1, 0x5C, 0xB0, 0xAD, 0x0D, 0xE9, 0x5C, 0xA3
            ]
        );
    }

    #[test]
    fn key_exchange_is_symmetric() {
        let key_exchange_key = [0x55; 16];
        let exported = [0x11; 16];
        let wrapped = rc4k(&key_exchange_key, &exported).unwrap();
        assert_ne!(wrapped, exported);
        assert_eq!(rc4k(&key_exchange_key, &wrapped).unwrap(), exported);
    }

    #[test]
    fn mic_flag_is_added_once() {
        let pairs = vec![
            AvPair::new(AvId::Flags, 0x1u32.to_le_bytes().to_vec()),
            AvPair::new(AvId::Timestamp, vec![0; 8]),
        ];
        let echoed = client_target_info(&pairs);

        let flags: Vec<_> = echoed.iter().filter(|pair| pair.id == AvId::Flags as u16).collect();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].value, 0x3u32.to_le_bytes());
    }
}
