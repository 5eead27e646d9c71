pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("not enough bytes provided to decode {name}: received {received} bytes, expected {expected} bytes")]
    NotEnoughBytes {
        name: &'static str,
        received: usize,
        expected: usize,
    },
    #[error("invalid `{field}` in {name}: {reason}")]
    InvalidField {
        name: &'static str,
        field: &'static str,
        reason: &'static str,
    },
    #[error("unexpected {name}: got 0x{got:X}")]
    UnexpectedMessage { name: &'static str, got: u32 },
    #[error("{name} oversized: max is {max}, got {size}")]
    Oversized { name: &'static str, size: usize, max: usize },
    #[error("cryptographic failure: {0}")]
    Crypto(&'static str),
}

impl Error {
    pub(crate) fn invalid(name: &'static str, field: &'static str, reason: &'static str) -> Self {
        Self::InvalidField { name, field, reason }
    }
}
