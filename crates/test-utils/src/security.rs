use anyhow::Context as _;
use rdp_proto::encryption::{RdpCipher, SessionKeys};
use rdp_proto::fast_path::{FastPathFlags, FastPathHeader};
use rdp_proto::gcc::EncryptionMethod;
use rdp_proto::license::decrypt_premaster_secret;
use rdp_proto::sec::{RsaPublicKey, SecurityFlags, SecurityHeader, ServerCertificate};

/// 512-bit RSA key of the scripted server. Little-endian, as RDP carries it.
const TEST_KEY_MODULUS: [u8; 64] = [
    0x71, 0x9C, 0x08, 0x9E, 0xB7, 0xCE, 0xF5, 0x25, 0x60, 0x2D, 0xA5, 0x71, 0xCF, 0x3D, 0x07, 0x97,
    0x67, 0x7D, 0x84, 0x93, 0xA8, 0x5D, 0xE2, 0xCA, 0xF7, 0x29, 0xFB, 0x28, 0x59, 0x88, 0x2E, 0x70,
    0x39, 0x47, 0x7D, 0x6A, 0xCB, 0xA2, 0x87, 0xF2, 0xB9, 0xE3, 0xFB, 0x64, 0xF3, 0x39, 0x33, 0xB1,
    0xB4, 0x1C, 0xBE, 0x70, 0xD8, 0x31, 0xB1, 0x3B, 0x8F, 0xFC, 0x59, 0x44, 0x06, 0x46, 0x2D, 0xAC,
];

const TEST_KEY_PRIVATE_EXPONENT: [u8; 64] = [
    0xAD, 0x8A, 0xAD, 0xDA, 0xBB, 0x49, 0x0B, 0x1E, 0x36, 0xEF, 0xEE, 0xB6, 0x7D, 0xAD, 0xF4, 0x5C,
    0xFA, 0xF6, 0xF4, 0xCF, 0x9C, 0xD9, 0xE8, 0xD7, 0x99, 0x2F, 0xEA, 0x75, 0x17, 0x5B, 0x69, 0x93,
    0x27, 0xA0, 0xF1, 0x7B, 0xC3, 0x7C, 0xF4, 0xAC, 0x17, 0xF4, 0xC6, 0x25, 0x20, 0x03, 0x0E, 0x5A,
    0x58, 0x5D, 0xAD, 0x51, 0x10, 0x89, 0x52, 0x4D, 0x9B, 0x03, 0xEB, 0x90, 0x25, 0x49, 0xEB, 0x79,
];

const TEST_KEY_EXPONENT: u32 = 65537;

/// Proprietary certificate carrying the test key, or a zeroed modulus of the same size.
pub(crate) fn server_certificate(zero_modulus: bool) -> anyhow::Result<Vec<u8>> {
    let modulus = if zero_modulus {
        vec![0; TEST_KEY_MODULUS.len()]
    } else {
        TEST_KEY_MODULUS.to_vec()
    };

    let mut certificate = Vec::new();
    ServerCertificate {
        public_key: RsaPublicKey {
            exponent: TEST_KEY_EXPONENT,
            modulus,
        },
    }
    .encode_proprietary(&mut certificate)?;
    Ok(certificate)
}

/// Raw RSA decryption with the test key, truncated to `size` bytes.
pub(crate) fn decrypt(encrypted: &[u8], size: usize) -> Vec<u8> {
    let mut decrypted = decrypt_premaster_secret(encrypted, &TEST_KEY_MODULUS, &TEST_KEY_PRIVATE_EXPONENT);
    decrypted.resize(size, 0);
    decrypted
}

/// Server half of standard RDP security.
pub(crate) struct ServerSecurity {
    ciphers: Option<(RdpCipher, RdpCipher)>,
    salted: bool,
}

impl ServerSecurity {
    pub(crate) fn none() -> Self {
        Self {
            ciphers: None,
            salted: false,
        }
    }

    pub(crate) fn standard(client_random: &[u8], server_random: &[u8], method: EncryptionMethod) -> anyhow::Result<Self> {
        let keys = SessionKeys::derive_server(client_random, server_random, method)?;

        Ok(Self {
            ciphers: Some((RdpCipher::encryptor(&keys, false)?, RdpCipher::decryptor(&keys, false)?)),
            salted: false,
        })
    }

    pub(crate) fn is_encrypted(&self) -> bool {
        self.ciphers.is_some()
    }

    pub(crate) fn set_salted(&mut self, salted: bool) {
        self.salted = salted;
        if let Some((encryptor, _)) = &mut self.ciphers {
            encryptor.set_salted(salted);
        }
    }

    /// Share PDUs: encrypted under standard security, bare otherwise.
    pub(crate) fn protect(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(payload.len() + 12);

        match &mut self.ciphers {
            Some((encryptor, _)) => {
                let mut flags = SecurityFlags::ENCRYPT;
                if self.salted {
                    flags |= SecurityFlags::SECURE_CHECKSUM;
                }

                let mut data = payload.to_vec();
                let signature = encryptor.encrypt(&mut data)?;
                SecurityHeader {
                    flags,
                    signature: Some(signature),
                }
                .encode(&mut out);
                out.extend_from_slice(&data);
            }
            None => out.extend_from_slice(payload),
        }

        Ok(out)
    }

    /// Strips the security header, which is present on every PDU under standard security and on
    /// info and licensing PDUs regardless.
    pub(crate) fn unprotect(&mut self, mut user_data: &[u8], has_header: bool) -> anyhow::Result<(SecurityFlags, Vec<u8>)> {
        if !has_header && self.ciphers.is_none() {
            return Ok((SecurityFlags::empty(), user_data.to_vec()));
        }

        let header = SecurityHeader::decode(&mut user_data)?;
        let mut payload = user_data.to_vec();

        if let Some(signature) = header.signature {
            let (_, decryptor) = self.ciphers.as_mut().context("encrypted PDU without session keys")?;
            decryptor.set_salted(header.flags.contains(SecurityFlags::SECURE_CHECKSUM));
            decryptor.decrypt(&mut payload, &signature).context("client MAC")?;
        }

        Ok((header.flags, payload))
    }

    pub(crate) fn protect_fast_path(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut data = payload.to_vec();

        let header = match &mut self.ciphers {
            Some((encryptor, _)) => {
                let mut flags = FastPathFlags::ENCRYPTED;
                if self.salted {
                    flags |= FastPathFlags::SECURE_CHECKSUM;
                }

                FastPathHeader {
                    flags,
                    num_events: 0,
                    signature: Some(encryptor.encrypt(&mut data)?),
                }
            }
            None => FastPathHeader {
                flags: FastPathFlags::empty(),
                num_events: 0,
                signature: None,
            },
        };

        let mut frame = Vec::with_capacity(data.len() + 11);
        header.encode(&mut frame, data.len())?;
        frame.extend_from_slice(&data);
        Ok(frame)
    }

    /// Returns the header event count and the decrypted payload of a fast-path input frame.
    pub(crate) fn unprotect_fast_path(&mut self, frame: &[u8]) -> anyhow::Result<(u8, Vec<u8>)> {
        let (header, payload) = FastPathHeader::decode(frame)?;
        let mut payload = payload.to_vec();

        if let Some(signature) = header.signature {
            let (_, decryptor) = self.ciphers.as_mut().context("encrypted input without session keys")?;
            decryptor.set_salted(header.flags.contains(FastPathFlags::SECURE_CHECKSUM));
            decryptor.decrypt(&mut payload, &signature).context("client input MAC")?;
        }

        Ok((header.num_events, payload))
    }
}
