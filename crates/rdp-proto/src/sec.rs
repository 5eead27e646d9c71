//! Security header, Security Exchange PDU, Client Info PDU and server certificates.

use bitflags::bitflags;
use bytes::{Buf as _, BufMut as _};
use num_bigint::BigUint;
use x509_cert::der::Decode as _;

use crate::encryption::MAC_SIGNATURE_SIZE;
use crate::utils::{from_utf16_bytes, read_array, split_to, to_utf16_bytes, u16_len, u32_len};
use crate::{Error, Result, ber};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SecurityFlags: u16 {
        const EXCHANGE_PKT = 0x0001;
        const TRANSPORT_REQ = 0x0002;
        const TRANSPORT_RSP = 0x0004;
        const ENCRYPT = 0x0008;
        const RESET_SEQNO = 0x0010;
        const IGNORE_SEQNO = 0x0020;
        const INFO_PKT = 0x0040;
        const LICENSE_PKT = 0x0080;
        const LICENSE_ENCRYPT = 0x0200;
        const REDIRECTION_PKT = 0x0400;
        const SECURE_CHECKSUM = 0x0800;
        const AUTODETECT_REQ = 0x1000;
        const AUTODETECT_RSP = 0x2000;
        const HEARTBEAT = 0x4000;
        const FLAGSHI_VALID = 0x8000;
    }
}

/// TS_SECURITY_HEADER, optionally followed by the MAC signature of TS_SECURITY_HEADER1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityHeader {
    pub flags: SecurityFlags,
    pub signature: Option<[u8; MAC_SIGNATURE_SIZE]>,
}

impl SecurityHeader {
    pub const NAME: &'static str = "TS_SECURITY_HEADER";
    pub const BASIC_SIZE: usize = 4;

    pub fn basic(flags: SecurityFlags) -> Self {
        Self { flags, signature: None }
    }

    pub fn encode(&self, dst: &mut Vec<u8>) {
        dst.put_u16_le(self.flags.bits());
        dst.put_u16_le(0); // flagsHi

        if let Some(signature) = &self.signature {
            dst.put_slice(signature);
        }
    }

    /// Reads the header; the signature is present whenever `SEC_ENCRYPT` is set.
    pub fn decode(src: &mut &[u8]) -> Result<Self> {
        ensure_size!(src[Self::BASIC_SIZE] for Self::NAME);

        let flags = SecurityFlags::from_bits_truncate(src.get_u16_le());
        let _flags_hi = src.get_u16_le();

        let signature = if flags.contains(SecurityFlags::ENCRYPT) {
            Some(read_array::<MAC_SIGNATURE_SIZE>(src, "TS_SECURITY_HEADER1 dataSignature")?)
        } else {
            None
        };

        Ok(Self { flags, signature })
    }
}

/// TS_SECURITY_PACKET: the client random encrypted with the server public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityExchangePdu {
    pub encrypted_client_random: Vec<u8>,
}

impl SecurityExchangePdu {
    const PADDING: usize = 8;

    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        SecurityHeader::basic(SecurityFlags::EXCHANGE_PKT | SecurityFlags::LICENSE_ENCRYPT).encode(dst);
        dst.put_u32_le(u32_len(
            self.encrypted_client_random.len() + Self::PADDING,
            "TS_SECURITY_PACKET length",
        )?);
        dst.put_slice(&self.encrypted_client_random);
        dst.put_bytes(0, Self::PADDING);
        Ok(())
    }

    /// Decodes the body following the basic security header.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[4] for "TS_SECURITY_PACKET");
        let length = src.get_u32_le() as usize;
        let data = split_to(&mut src, length, "TS_SECURITY_PACKET encryptedClientRandom")?;
        let random_len = length.saturating_sub(Self::PADDING);

        Ok(Self {
            encrypted_client_random: data[..random_len].to_vec(),
        })
    }
}

/// RSA public key as carried by server certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    pub exponent: u32,
    /// Little-endian modulus without padding.
    pub modulus: Vec<u8>,
}

impl RsaPublicKey {
    /// Raw RSA (`m^e mod n`) over little-endian integers, as RDP uses it. Output is modulus-sized.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let n = BigUint::from_bytes_le(&self.modulus);
        if n.bits() == 0 {
            return Err(Error::invalid("RSA_PUBLIC_KEY", "modulus", "zero modulus"));
        }

        let m = BigUint::from_bytes_le(data);
        let c = m.modpow(&BigUint::from(self.exponent), &n);

        let mut out = c.to_bytes_le();
        out.resize(self.modulus.len(), 0);
        Ok(out)
    }

    fn decode_proprietary_blob(mut src: &[u8]) -> Result<Self> {
        const RSA1_MAGIC: u32 = 0x3141_5352;

        ensure_size!(src[20] for "RSA_PUBLIC_KEY");
        let magic = src.get_u32_le();
        if magic != RSA1_MAGIC {
            return Err(Error::invalid("RSA_PUBLIC_KEY", "magic", "not RSA1"));
        }
        let key_len = src.get_u32_le() as usize;
        let bit_len = src.get_u32_le() as usize;
        let _data_len = src.get_u32_le();
        let exponent = src.get_u32_le();

        if bit_len == 0 {
            return Err(Error::invalid("RSA_PUBLIC_KEY", "bitlen", "zero"));
        }

        let modulus = split_to(&mut src, key_len, "RSA_PUBLIC_KEY modulus")?;
        let modulus = &modulus[..(bit_len / 8).min(modulus.len())];
        if modulus.iter().all(|b| *b == 0) {
            return Err(Error::invalid("RSA_PUBLIC_KEY", "modulus", "zero modulus"));
        }

        Ok(Self {
            exponent,
            modulus: modulus.to_vec(),
        })
    }

    /// Reads a DER `RSAPublicKey` (big-endian integers).
    pub fn from_pkcs1_der(mut src: &[u8]) -> Result<Self> {
        let mut content = ber::read_sequence(&mut src)?;
        let modulus_be = ber::read_integer_bytes(&mut content)?;
        let exponent_be = ber::read_integer_bytes(&mut content)?;

        let exponent = exponent_be
            .iter()
            .skip_while(|b| **b == 0)
            .try_fold(0u32, |acc, b| acc.checked_mul(256).map(|acc| acc + u32::from(*b)))
            .ok_or_else(|| Error::invalid("RSAPublicKey", "publicExponent", "too large"))?;

        let mut modulus: Vec<u8> = modulus_be.iter().skip_while(|b| **b == 0).copied().collect();
        if modulus.is_empty() {
            return Err(Error::invalid("RSAPublicKey", "modulus", "zero modulus"));
        }
        modulus.reverse();

        Ok(Self { exponent, modulus })
    }

    pub fn encode_proprietary_blob(&self, dst: &mut Vec<u8>) -> Result<()> {
        const RSA1_MAGIC: u32 = 0x3141_5352;
        let key_len = self.modulus.len() + 8;

        dst.put_u32_le(RSA1_MAGIC);
        dst.put_u32_le(u32_len(key_len, "RSA_PUBLIC_KEY keylen")?);
        dst.put_u32_le(u32_len(self.modulus.len() * 8, "RSA_PUBLIC_KEY bitlen")?);
        dst.put_u32_le(u32_len(self.modulus.len().saturating_sub(1), "RSA_PUBLIC_KEY datalen")?);
        dst.put_u32_le(self.exponent);
        dst.put_slice(&self.modulus);
        dst.put_bytes(0, 8);
        Ok(())
    }
}

const CERT_CHAIN_VERSION_1: u32 = 0x0000_0001;
const CERT_CHAIN_VERSION_2: u32 = 0x0000_0002;
const BB_RSA_KEY_BLOB: u16 = 0x0006;
const BB_RSA_SIGNATURE_BLOB: u16 = 0x0008;
const SIGNATURE_ALG_RSA: u32 = 0x0000_0001;
const KEY_EXCHANGE_ALG_RSA: u32 = 0x0000_0001;

/// SERVER_CERTIFICATE: proprietary or X.509 chain. Only the public key is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCertificate {
    pub public_key: RsaPublicKey,
}

impl ServerCertificate {
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[4] for "SERVER_CERTIFICATE");
        let version = src.get_u32_le() & 0x7FFF_FFFF;

        match version {
            CERT_CHAIN_VERSION_1 => {
                ensure_size!(src[12] for "PROPRIETARYSERVERCERTIFICATE");
                let _sig_alg = src.get_u32_le();
                let _key_alg = src.get_u32_le();
                let blob_type = src.get_u16_le();
                if blob_type != BB_RSA_KEY_BLOB {
                    return Err(Error::invalid("PROPRIETARYSERVERCERTIFICATE", "wPublicKeyBlobType", "not an RSA key blob"));
                }
                let blob_len = usize::from(src.get_u16_le());
                let blob = split_to(&mut src, blob_len, "PROPRIETARYSERVERCERTIFICATE PublicKeyBlob")?;

                Ok(Self {
                    public_key: RsaPublicKey::decode_proprietary_blob(blob)?,
                })
            }
            CERT_CHAIN_VERSION_2 => {
                ensure_size!(src[4] for "X509 certificate chain");
                let count = src.get_u32_le();
                let mut last = None;
                for _ in 0..count {
                    ensure_size!(src[4] for "X509 certificate chain");
                    let len = src.get_u32_le() as usize;
                    last = Some(split_to(&mut src, len, "X509 certificate")?);
                }

                let der = last.ok_or_else(|| Error::invalid("X509 certificate chain", "NumCertBlobs", "empty"))?;
                let certificate = x509_cert::Certificate::from_der(der)
                    .map_err(|_| Error::invalid("X509 certificate chain", "certificate", "malformed DER"))?;
                let key = certificate
                    .tbs_certificate
                    .subject_public_key_info
                    .subject_public_key
                    .as_bytes()
                    .ok_or_else(|| Error::invalid("X509 certificate", "subjectPublicKey", "unaligned bit string"))?;

                Ok(Self {
                    public_key: RsaPublicKey::from_pkcs1_der(key)?,
                })
            }
            _ => Err(Error::UnexpectedMessage {
                name: "SERVER_CERTIFICATE version",
                got: version,
            }),
        }
    }

    /// Proprietary certificate with an empty signature blob.
    pub fn encode_proprietary(&self, dst: &mut Vec<u8>) -> Result<()> {
        let mut blob = Vec::new();
        self.public_key.encode_proprietary_blob(&mut blob)?;

        dst.put_u32_le(CERT_CHAIN_VERSION_1);
        dst.put_u32_le(SIGNATURE_ALG_RSA);
        dst.put_u32_le(KEY_EXCHANGE_ALG_RSA);
        dst.put_u16_le(BB_RSA_KEY_BLOB);
        dst.put_u16_le(u16_len(blob.len(), "PublicKeyBlob")?);
        dst.put_slice(&blob);
        dst.put_u16_le(BB_RSA_SIGNATURE_BLOB);
        dst.put_u16_le(72);
        dst.put_bytes(0, 72);
        Ok(())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InfoFlags: u32 {
        const MOUSE = 0x0000_0001;
        const DISABLE_CTRL_ALT_DEL = 0x0000_0002;
        const AUTOLOGON = 0x0000_0008;
        const UNICODE = 0x0000_0010;
        const MAXIMIZE_SHELL = 0x0000_0020;
        const LOGON_NOTIFY = 0x0000_0040;
        const COMPRESSION = 0x0000_0080;
        const ENABLE_WINDOWS_KEY = 0x0000_0100;
        const REMOTE_CONSOLE_AUDIO = 0x0000_2000;
        const FORCE_ENCRYPTED_CS_PDU = 0x0000_4000;
        const RAIL = 0x0000_8000;
        const LOGON_ERRORS = 0x0001_0000;
        const MOUSE_HAS_WHEEL = 0x0002_0000;
        const PASSWORD_IS_SC_PIN = 0x0004_0000;
        const NO_AUDIO_PLAYBACK = 0x0008_0000;
        const USING_SAVED_CREDS = 0x0010_0000;
        const AUDIO_CAPTURE = 0x0020_0000;
        const VIDEO_DISABLE = 0x0040_0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PerformanceFlags: u32 {
        const DISABLE_WALLPAPER = 0x0000_0001;
        const DISABLE_FULL_WINDOW_DRAG = 0x0000_0002;
        const DISABLE_MENU_ANIMATIONS = 0x0000_0004;
        const DISABLE_THEMING = 0x0000_0008;
        const DISABLE_CURSOR_SHADOW = 0x0000_0020;
        const DISABLE_CURSOR_SETTINGS = 0x0000_0040;
        const ENABLE_FONT_SMOOTHING = 0x0000_0080;
        const ENABLE_DESKTOP_COMPOSITION = 0x0000_0100;
    }
}

const AF_INET: u16 = 0x0002;
const TIME_ZONE_INFORMATION_SIZE: usize = 172;

/// TS_INFO_PACKET with its TS_EXTENDED_INFO_PACKET.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub code_page: u32,
    pub flags: InfoFlags,
    pub domain: String,
    pub username: String,
    pub password: String,
    pub alternate_shell: String,
    pub working_dir: String,
    pub client_address: String,
    pub client_dir: String,
    pub performance_flags: PerformanceFlags,
}

impl core::fmt::Debug for ClientInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClientInfo")
            .field("code_page", &self.code_page)
            .field("flags", &self.flags)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("performance_flags", &self.performance_flags)
            .finish_non_exhaustive()
    }
}

impl ClientInfo {
    pub const NAME: &'static str = "TS_INFO_PACKET";

    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let domain = to_utf16_bytes(&self.domain);
        let username = to_utf16_bytes(&self.username);
        let password = to_utf16_bytes(&self.password);
        let alternate_shell = to_utf16_bytes(&self.alternate_shell);
        let working_dir = to_utf16_bytes(&self.working_dir);

        dst.put_u32_le(self.code_page);
        dst.put_u32_le(self.flags.bits());
        for field in [&domain, &username, &password, &alternate_shell, &working_dir] {
            dst.put_u16_le(u16_len(field.len(), "TS_INFO_PACKET string")?);
        }
        for field in [&domain, &username, &password, &alternate_shell, &working_dir] {
            dst.put_slice(field);
            dst.put_u16(0);
        }

        let client_address = to_utf16_bytes(&self.client_address);
        let client_dir = to_utf16_bytes(&self.client_dir);

        dst.put_u16_le(AF_INET);
        dst.put_u16_le(u16_len(client_address.len() + 2, "clientAddress")?);
        dst.put_slice(&client_address);
        dst.put_u16(0);
        dst.put_u16_le(u16_len(client_dir.len() + 2, "clientDir")?);
        dst.put_slice(&client_dir);
        dst.put_u16(0);
        dst.put_bytes(0, TIME_ZONE_INFORMATION_SIZE);
        dst.put_u32_le(0); // clientSessionId
        dst.put_u32_le(self.performance_flags.bits());
        dst.put_u16_le(0); // cbAutoReconnectCookie

        Ok(())
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[18] for Self::NAME);

        let code_page = src.get_u32_le();
        let flags = InfoFlags::from_bits_truncate(src.get_u32_le());
        let lengths: [usize; 5] = core::array::from_fn(|_| usize::from(src.get_u16_le()));

        let mut strings = Vec::with_capacity(5);
        for length in lengths {
            let bytes = split_to(&mut src, length + 2, Self::NAME)?;
            strings.push(from_utf16_bytes(bytes));
        }

        let (client_address, client_dir, performance_flags) = if src.len() >= 4 {
            let _family = src.get_u16_le();
            let address_len = usize::from(src.get_u16_le());
            let client_address = from_utf16_bytes(split_to(&mut src, address_len, "clientAddress")?);
            ensure_size!(src[2] for "cbClientDir");
            let dir_len = usize::from(src.get_u16_le());
            let client_dir = from_utf16_bytes(split_to(&mut src, dir_len, "clientDir")?);
            crate::utils::skip(&mut src, TIME_ZONE_INFORMATION_SIZE + 4, "clientTimeZone")?;
            ensure_size!(src[4] for "performanceFlags");
            let performance_flags = PerformanceFlags::from_bits_truncate(src.get_u32_le());
            (client_address, client_dir, performance_flags)
        } else {
            (String::new(), String::new(), PerformanceFlags::empty())
        };

        let mut strings = strings.into_iter();
        let mut next = || strings.next().unwrap_or_default();

        Ok(Self {
            code_page,
            flags,
            domain: next(),
            username: next(),
            password: next(),
            alternate_shell: next(),
            working_dir: next(),
            client_address,
            client_dir,
            performance_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rstest::rstest;

    use super::*;

    fn sample_key() -> RsaPublicKey {
        // n = 3233 (61 * 53), e = 17
        RsaPublicKey {
            exponent: 17,
            modulus: vec![0xA1, 0x0C],
        }
    }

    #[test]
    fn rsa_encrypt_is_little_endian_modpow() {
        // 65^17 mod 3233 = 2790 = 0x0AE6
        assert_eq!(sample_key().encrypt(&[65]).unwrap(), vec![0xE6, 0x0A]);
    }

    #[rstest]
    #[case::zeroed(vec![0; 64])]
    #[case::empty(Vec::new())]
    fn zero_modulus_is_refused_by_encrypt(#[case] modulus: Vec<u8>) {
        let key = RsaPublicKey { exponent: 65537, modulus };

        assert!(matches!(
            key.encrypt(&[0x11; 32]),
            Err(Error::InvalidField { field: "modulus", .. })
        ));
    }

    #[test]
    fn certificate_with_zero_modulus_is_rejected() {
        let certificate = ServerCertificate {
            public_key: RsaPublicKey {
                exponent: 65537,
                modulus: vec![0; 64],
            },
        };
        let mut buf = Vec::new();
        certificate.encode_proprietary(&mut buf).unwrap();

        assert!(matches!(
            ServerCertificate::decode(&buf),
            Err(Error::InvalidField { field: "modulus", .. })
        ));
    }

    #[test]
    fn certificate_with_zero_bit_length_is_rejected() {
        let mut blob = Vec::new();
        sample_key().encode_proprietary_blob(&mut blob).unwrap();
        // bitlen follows magic and keylen.
        blob[8..12].copy_from_slice(&0u32.to_le_bytes());

        assert!(matches!(
            RsaPublicKey::decode_proprietary_blob(&blob),
            Err(Error::InvalidField { field: "bitlen", .. })
        ));
    }

    #[test]
    fn proprietary_certificate_round_trips() {
        let certificate = ServerCertificate { public_key: sample_key() };
        let mut buf = Vec::new();
        certificate.encode_proprietary(&mut buf).unwrap();

        assert_eq!(ServerCertificate::decode(&buf).unwrap(), certificate);
    }

    #[test]
    fn pkcs1_public_key_is_read_big_endian() {
        let der = [0x30, 0x08, 0x02, 0x03, 0x00, 0x0C, 0xA1, 0x02, 0x01, 0x11];
        let key = RsaPublicKey::from_pkcs1_der(&der).unwrap();
        assert_eq!(key, sample_key());
    }

    #[test]
    fn encrypted_header_carries_a_signature() {
        let header = SecurityHeader {
            flags: SecurityFlags::ENCRYPT,
            signature: Some([1, 2, 3, 4, 5, 6, 7, 8]),
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);

        assert_eq!(buf.len(), 12);
        assert_eq!(SecurityHeader::decode(&mut buf.as_slice()).unwrap(), header);
    }

    #[test]
    fn client_info_round_trips() {
        let info = ClientInfo {
            code_page: 0,
            flags: InfoFlags::MOUSE | InfoFlags::UNICODE | InfoFlags::AUTOLOGON | InfoFlags::LOGON_NOTIFY,
            domain: "CONTOSO".to_owned(),
            username: "alice".to_owned(),
            password: "hunter2".to_owned(),
            alternate_shell: String::new(),
            working_dir: String::new(),
            client_address: "10.0.0.2".to_owned(),
            client_dir: "C:\\Windows\\System32\\mstscax.dll".to_owned(),
            performance_flags: PerformanceFlags::DISABLE_WALLPAPER,
        };
        let mut buf = Vec::new();
        info.encode(&mut buf).unwrap();

        assert_eq!(ClientInfo::decode(&buf).unwrap(), info);
    }
}
