use core::fmt;

pub type SspiResult = core::result::Result<SspiOk, SspiError>;
pub type Result<T> = core::result::Result<T, SspiError>;

/// Security support provider, as driven by CredSSP.
pub trait Sspi {
    fn package_type(&self) -> PackageType;
    fn identity(&self) -> &AuthIdentity;
    fn initialize_security_context(&mut self, input: &[u8], output: &mut Vec<u8>) -> SspiResult;
    fn accept_security_context(&mut self, input: &[u8], output: &mut Vec<u8>) -> SspiResult;
    fn complete_auth_token(&mut self) -> Result<()>;
    fn encrypt_message(&mut self, input: &[u8], message_seq_number: u32) -> Result<Vec<u8>>;
    fn decrypt_message(&mut self, input: &[u8], message_seq_number: u32) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageType {
    Ntlm,
}

#[derive(Clone, PartialEq, Eq, Default)]
pub struct AuthIdentity {
    pub user: String,
    pub domain: String,
    pub password: String,
}

impl AuthIdentity {
    pub fn new(user: impl Into<String>, domain: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            domain: domain.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() || self.password.is_empty()
    }
}

impl fmt::Debug for AuthIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthIdentity")
            .field("user", &self.user)
            .field("domain", &self.domain)
            .field("password", &"***")
            .finish()
    }
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SspiErrorType {
    InternalError = 0x8009_0304,
    InvalidToken = 0x8009_0308,
    OutOfSequence = 0x8009_0310,
    MessageAltered = 0x8009_030F,
    TargetUnknown = 0x8009_0303,
    LogonDenied = 0x8009_030C,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("{error_type:?}: {description}")]
pub struct SspiError {
    pub error_type: SspiErrorType,
    pub description: String,
}

impl SspiError {
    pub fn new(error_type: SspiErrorType, description: impl Into<String>) -> Self {
        Self {
            error_type,
            description: description.into(),
        }
    }

    /// NTSTATUS carried in the TSRequest `errorCode` field.
    pub fn nt_status(&self) -> u32 {
        match self.error_type {
            SspiErrorType::LogonDenied => STATUS_LOGON_FAILURE,
            other => ((other as u32) & 0x0000_FFFF) | (0x7 << 16) | 0xC000_0000,
        }
    }
}

pub const STATUS_LOGON_FAILURE: u32 = 0xC000_006D;

impl From<crate::Error> for SspiError {
    fn from(error: crate::Error) -> Self {
        match error {
            crate::Error::Crypto(reason) => Self::new(SspiErrorType::MessageAltered, reason),
            other => Self::new(SspiErrorType::InvalidToken, other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SspiOk {
    ContinueNeeded = 0x0009_0312,
    CompleteNeeded = 0x0009_0313,
}

impl fmt::Display for SspiOk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
