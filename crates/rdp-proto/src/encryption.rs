//! Hash helpers, RC4 and standard RDP security (MS-RDPBCGR 5.3.5 to 5.3.7).

use hmac::{Hmac, Mac};
use md4::Md4;
use md5::{Digest as _, Md5};
use rc4::consts::{U8, U16};
use rc4::{KeyInit as _, StreamCipher as _};
use sha1::Sha1;
use sha2::Sha256;

use crate::gcc::EncryptionMethod;
use crate::{Error, Result};

pub const MAC_SIGNATURE_SIZE: usize = 8;
pub const CLIENT_RANDOM_SIZE: usize = 32;

/// Number of packets after which session keys are refreshed.
pub const KEY_UPDATE_INTERVAL: u32 = 4096;

const PAD1: [u8; 40] = [0x36; 40];
const PAD2: [u8; 48] = [0x5C; 48];
const SALT_40: [u8; 3] = [0xD1, 0x26, 0x9E];
const SALT_56: [u8; 1] = [0xD1];

pub fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn md4(data: &[u8]) -> [u8; 16] {
    let mut out = [0; 16];
    out.copy_from_slice(&Md4::digest(data));
    out
}

pub fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn compute_sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

pub fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16]> {
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(key).map_err(|_| Error::Crypto("invalid HMAC-MD5 key"))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// RC4 keystream for the two key sizes RDP uses (64-bit salted keys and 128-bit keys).
pub enum Rc4 {
    Key64(rc4::Rc4<U8>),
    Key128(rc4::Rc4<U16>),
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            8 => rc4::Rc4::<U8>::new_from_slice(key).map(Self::Key64),
            16 => rc4::Rc4::<U16>::new_from_slice(key).map(Self::Key128),
            _ => return Err(Error::Crypto("unsupported RC4 key size")),
        }
        .map_err(|_| Error::Crypto("invalid RC4 key"))
    }

    pub fn process(&mut self, data: &mut [u8]) {
        match self {
            Self::Key64(cipher) => cipher.apply_keystream(data),
            Self::Key128(cipher) => cipher.apply_keystream(data),
        }
    }

    pub fn process_vec(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.process(&mut out);
        out
    }
}

impl core::fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Rc4")
    }
}

/// `SaltedHash(S, I) = MD5(S + SHA(I + S + first + second))`
pub fn salted_hash(secret: &[u8], input: &[u8], first: &[u8], second: &[u8]) -> [u8; 16] {
    let sha = sha1(&[input, secret, first, second]);
    md5(&[secret, &sha])
}

/// Derives a 48-byte blob from a 48-byte secret with the `A`, `BB`, `CCC` salts (or `X`, `YY`, `ZZZ`).
fn triple_salted_hash(secret: &[u8], salts: [&[u8]; 3], first: &[u8], second: &[u8]) -> [u8; 48] {
    let mut out = [0; 48];
    for (chunk, salt) in out.chunks_exact_mut(16).zip(salts) {
        chunk.copy_from_slice(&salted_hash(secret, salt, first, second));
    }
    out
}

fn final_hash(key: &[u8], client_random: &[u8], server_random: &[u8]) -> [u8; 16] {
    md5(&[key, client_random, server_random])
}

fn key_size(method: EncryptionMethod) -> Result<usize> {
    if method.contains(EncryptionMethod::BIT_128) {
        Ok(16)
    } else if method.intersects(EncryptionMethod::BIT_40 | EncryptionMethod::BIT_56) {
        Ok(8)
    } else {
        Err(Error::Crypto("unsupported encryption method"))
    }
}

fn reduce_entropy(key: &mut Vec<u8>, method: EncryptionMethod) {
    key.truncate(if method.contains(EncryptionMethod::BIT_128) { 16 } else { 8 });

    if method.contains(EncryptionMethod::BIT_128) {
        return;
    }

    if method.contains(EncryptionMethod::BIT_40) {
        key[..3].copy_from_slice(&SALT_40);
    } else if method.contains(EncryptionMethod::BIT_56) {
        key[..1].copy_from_slice(&SALT_56);
    }
}

/// Session keys for standard RDP security, from the point of view of one endpoint.
#[derive(Clone)]
pub struct SessionKeys {
    pub method: EncryptionMethod,
    pub mac_key: Vec<u8>,
    pub encrypt_key: Vec<u8>,
    pub decrypt_key: Vec<u8>,
}

impl core::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionKeys").field("method", &self.method).finish_non_exhaustive()
    }
}

impl SessionKeys {
    pub fn derive_client(client_random: &[u8], server_random: &[u8], method: EncryptionMethod) -> Result<Self> {
        key_size(method)?;

        if client_random.len() != CLIENT_RANDOM_SIZE || server_random.len() != CLIENT_RANDOM_SIZE {
            return Err(Error::Crypto("client and server randoms must be 32 bytes long"));
        }

        let mut pre_master_secret = Vec::with_capacity(48);
        pre_master_secret.extend_from_slice(&client_random[..24]);
        pre_master_secret.extend_from_slice(&server_random[..24]);

        let master_secret = triple_salted_hash(
            &pre_master_secret,
            [b"A", b"BB", b"CCC"],
            client_random,
            server_random,
        );
        let session_key_blob =
            triple_salted_hash(&master_secret, [b"X", b"YY", b"ZZZ"], client_random, server_random);

        let mut mac_key = session_key_blob[..16].to_vec();
        let mut decrypt_key = final_hash(&session_key_blob[16..32], client_random, server_random).to_vec();
        let mut encrypt_key = final_hash(&session_key_blob[32..48], client_random, server_random).to_vec();

        reduce_entropy(&mut mac_key, method);
        reduce_entropy(&mut decrypt_key, method);
        reduce_entropy(&mut encrypt_key, method);

        Ok(Self {
            method,
            mac_key,
            encrypt_key,
            decrypt_key,
        })
    }

    /// Keys as seen by the server side of the same exchange.
    pub fn derive_server(client_random: &[u8], server_random: &[u8], method: EncryptionMethod) -> Result<Self> {
        let client = Self::derive_client(client_random, server_random, method)?;

        Ok(Self {
            encrypt_key: client.decrypt_key,
            decrypt_key: client.encrypt_key,
            ..client
        })
    }
}

/// MAC over `data` (MS-RDPBCGR 5.3.6.1), salted with the encryption count when given.
pub fn mac_signature(mac_key: &[u8], data: &[u8], encryption_count: Option<u32>) -> [u8; MAC_SIGNATURE_SIZE] {
    let length = (data.len() as u32).to_le_bytes();
    let count = encryption_count.map(u32::to_le_bytes);

    let sha = match &count {
        Some(count) => sha1(&[mac_key, &PAD1, &length, data, count]),
        None => sha1(&[mac_key, &PAD1, &length, data]),
    };
    let md5 = md5(&[mac_key, &PAD2, &sha]);

    let mut signature = [0; MAC_SIGNATURE_SIZE];
    signature.copy_from_slice(&md5[..MAC_SIGNATURE_SIZE]);
    signature
}

fn update_key(initial_key: &[u8], current_key: &[u8], method: EncryptionMethod) -> Result<Vec<u8>> {
    let key_len = initial_key.len();
    let sha = sha1(&[initial_key, &PAD1, current_key]);
    let temp = md5(&[initial_key, &PAD2, &sha]);

    let mut new_key = temp[..key_len].to_vec();
    Rc4::new(&temp[..key_len])?.process(&mut new_key);
    reduce_entropy(&mut new_key, method);

    Ok(new_key)
}

/// One direction of standard RDP security: RC4 stream, key refresh and MAC.
#[derive(Debug)]
pub struct RdpCipher {
    method: EncryptionMethod,
    mac_key: Vec<u8>,
    initial_key: Vec<u8>,
    current_key: Vec<u8>,
    rc4: Rc4,
    use_count: u32,
    encryption_count: u32,
    salted: bool,
}

impl RdpCipher {
    pub fn new(method: EncryptionMethod, mac_key: &[u8], key: &[u8], salted: bool) -> Result<Self> {
        Ok(Self {
            method,
            mac_key: mac_key.to_vec(),
            initial_key: key.to_vec(),
            current_key: key.to_vec(),
            rc4: Rc4::new(key)?,
            use_count: 0,
            encryption_count: 0,
            salted,
        })
    }

    pub fn encryptor(keys: &SessionKeys, salted: bool) -> Result<Self> {
        Self::new(keys.method, &keys.mac_key, &keys.encrypt_key, salted)
    }

    pub fn decryptor(keys: &SessionKeys, salted: bool) -> Result<Self> {
        Self::new(keys.method, &keys.mac_key, &keys.decrypt_key, salted)
    }

    pub fn is_salted(&self) -> bool {
        self.salted
    }

    /// Switches between plain and salted MACs; the peer announces the salted form per packet.
    pub fn set_salted(&mut self, salted: bool) {
        self.salted = salted;
    }

    /// Number of packets processed so far.
    pub fn encryption_count(&self) -> u32 {
        self.encryption_count
    }

    fn refresh_if_needed(&mut self) -> Result<()> {
        if self.use_count >= KEY_UPDATE_INTERVAL {
            self.current_key = update_key(&self.initial_key, &self.current_key, self.method)?;
            self.rc4 = Rc4::new(&self.current_key)?;
            self.use_count = 0;
        }
        Ok(())
    }

    fn signature(&self, data: &[u8]) -> [u8; MAC_SIGNATURE_SIZE] {
        let count = self.salted.then_some(self.encryption_count);
        mac_signature(&self.mac_key, data, count)
    }

    /// Encrypts `data` in place and returns its signature.
    pub fn encrypt(&mut self, data: &mut [u8]) -> Result<[u8; MAC_SIGNATURE_SIZE]> {
        self.refresh_if_needed()?;

        let signature = self.signature(data);
        self.rc4.process(data);

        self.use_count += 1;
        self.encryption_count = self.encryption_count.wrapping_add(1);

        Ok(signature)
    }

    /// Decrypts `data` in place and checks it against `signature`.
    pub fn decrypt(&mut self, data: &mut [u8], signature: &[u8]) -> Result<()> {
        self.refresh_if_needed()?;

        self.rc4.process(data);
        let expected = self.signature(data);

        self.use_count += 1;
        self.encryption_count = self.encryption_count.wrapping_add(1);

        if expected.as_slice() != signature {
            return Err(Error::Crypto("MAC signature mismatch"));
        }

        Ok(())
    }
}

/// Licensing keys (MS-RDPELE 5.1.3).
#[derive(Clone)]
pub struct LicensingKeys {
    pub mac_salt_key: [u8; 16],
    pub encryption_key: [u8; 16],
}

impl LicensingKeys {
    pub fn derive(pre_master_secret: &[u8], client_random: &[u8], server_random: &[u8]) -> Self {
        let master_secret = triple_salted_hash(
            pre_master_secret,
            [b"A", b"BB", b"CCC"],
            client_random,
            server_random,
        );
        // Randoms are swapped for the second round
        let session_key_blob =
            triple_salted_hash(&master_secret, [b"A", b"BB", b"CCC"], server_random, client_random);

        let mut mac_salt_key = [0; 16];
        mac_salt_key.copy_from_slice(&session_key_blob[..16]);
        let encryption_key = md5(&[&session_key_blob[16..32], client_random, server_random]);

        Self {
            mac_salt_key,
            encryption_key,
        }
    }

    /// Full 16-byte MAC used by licensing messages.
    pub fn mac(&self, data: &[u8]) -> [u8; 16] {
        let length = (data.len() as u32).to_le_bytes();
        let sha = sha1(&[&self.mac_salt_key, &PAD1, &length, data]);
        md5(&[&self.mac_salt_key, &PAD2, &sha])
    }

    pub fn rc4(&self) -> Result<Rc4> {
        Rc4::new(&self.encryption_key)
    }
}

impl core::fmt::Debug for LicensingKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LicensingKeys").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    const CLIENT_RANDOM: [u8; 32] = [0x11; 32];
    const SERVER_RANDOM: [u8; 32] = [0x22; 32];

    fn pair(method: EncryptionMethod, salted: bool) -> (RdpCipher, RdpCipher) {
        let client = SessionKeys::derive_client(&CLIENT_RANDOM, &SERVER_RANDOM, method).unwrap();
        let server = SessionKeys::derive_server(&CLIENT_RANDOM, &SERVER_RANDOM, method).unwrap();
        (
            RdpCipher::encryptor(&client, salted).unwrap(),
            RdpCipher::decryptor(&server, salted).unwrap(),
        )
    }

    #[rstest]
    #[case(EncryptionMethod::BIT_40, 8, Some(&SALT_40[..]))]
    #[case(EncryptionMethod::BIT_56, 8, Some(&SALT_56[..]))]
    #[case(EncryptionMethod::BIT_128, 16, None)]
    fn key_sizes_follow_the_method(
        #[case] method: EncryptionMethod,
        #[case] size: usize,
        #[case] salt: Option<&[u8]>,
    ) {
        let keys = SessionKeys::derive_client(&CLIENT_RANDOM, &SERVER_RANDOM, method).unwrap();

        for key in [&keys.mac_key, &keys.encrypt_key, &keys.decrypt_key] {
            assert_eq!(key.len(), size);
            if let Some(salt) = salt {
                assert!(key.starts_with(salt));
            }
        }
    }

    #[test]
    fn hmac_md5_matches_rfc_2202() {
        let mac = hmac_md5(&[0x0B; 16], &[b"Hi ", b"There"]).unwrap();
        assert_eq!(
            mac,
            [
                0x92, 0x94, 0x72, 0x7A, 0x36, 0x38, 0xBB, 0x1C, 0x13, 0xF4, 0x8E, 0xF8, 0x15, 0x8B, 0xFC, 0x9D
            ]
        );
    }

    #[test]
    fn client_and_server_keys_mirror_each_other() {
        let client = SessionKeys::derive_client(&CLIENT_RANDOM, &SERVER_RANDOM, EncryptionMethod::BIT_128).unwrap();
        let server = SessionKeys::derive_server(&CLIENT_RANDOM, &SERVER_RANDOM, EncryptionMethod::BIT_128).unwrap();

        assert_eq!(client.encrypt_key, server.decrypt_key);
        assert_eq!(client.decrypt_key, server.encrypt_key);
        assert_ne!(client.encrypt_key, client.decrypt_key);
    }

    #[test]
    fn keys_are_refreshed_in_lockstep() {
        let (mut encryptor, mut decryptor) = pair(EncryptionMethod::BIT_128, true);

        for i in 0..(KEY_UPDATE_INTERVAL + 10) {
            let plain = i.to_le_bytes();
            let mut data = plain;
            let signature = encryptor.encrypt(&mut data).unwrap();
            decryptor.decrypt(&mut data, &signature).unwrap();
            assert_eq!(data, plain);
        }
    }

    #[test]
    fn replayed_packet_fails_salted_mac() {
        let (mut encryptor, mut decryptor) = pair(EncryptionMethod::BIT_128, true);

        let mut first = *b"first packet";
        let first_signature = encryptor.encrypt(&mut first).unwrap();
        let mut second = *b"first packet";
        let _ = encryptor.encrypt(&mut second).unwrap();

        decryptor.decrypt(&mut first, &first_signature).unwrap();
        // Reusing the first signature on the second packet is detected
        assert!(decryptor.decrypt(&mut second, &first_signature).is_err());
    }

    fn method() -> impl Strategy<Value = EncryptionMethod> {
        prop_oneof![
            Just(EncryptionMethod::BIT_40),
            Just(EncryptionMethod::BIT_56),
            Just(EncryptionMethod::BIT_128),
        ]
    }

    proptest! {
        #[test]
        fn encrypt_then_decrypt_round_trips(
            method in method(),
            salted in any::<bool>(),
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..256), 1..8),
        ) {
            let (mut encryptor, mut decryptor) = pair(method, salted);

            for payload in payloads {
                let mut data = payload.clone();
                let signature = encryptor.encrypt(&mut data).unwrap();
                decryptor.decrypt(&mut data, &signature).unwrap();
                prop_assert_eq!(data, payload);
            }
        }

        #[test]
        fn single_bit_corruption_is_detected(
            method in method(),
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            bit in any::<prop::sample::Index>(),
        ) {
            let (mut encryptor, mut decryptor) = pair(method, true);

            let mut data = payload;
            let signature = encryptor.encrypt(&mut data).unwrap();

            let bit = bit.index(data.len() * 8);
            data[bit / 8] ^= 1 << (bit % 8);

            prop_assert!(decryptor.decrypt(&mut data, &signature).is_err());
        }
    }
}
