//! Wire codecs for the client side of the RDP connection sequence.
//!
//! Layers, from the wire up:
//!
//! - [`tpdu`]: TPKT and X.224 framing, and fast-path frame detection.
//! - [`nego`]: X.224 connection request/confirm with `RDP_NEG_*` data.
//! - [`gcc`] and [`mcs`]: GCC conference create data inside MCS connect PDUs, and MCS domain PDUs.
//! - [`ntlm`], [`credssp`]: the NLA handshake run over TLS when hybrid security is negotiated.
//! - [`sec`], [`license`], [`encryption`]: standard RDP security, client info and licensing.
//! - [`share`], [`capabilities`], [`update`], [`fast_path`]: share control/data PDUs and updates.
//!
//! Everything here is synchronous and operates on byte slices; I/O lives in `rdp-client`.

macro_rules! ensure_size {
    ($buf:ident [$expected:expr] for $name:expr) => {{
        let received = $buf.len();
        let expected = $expected;
        if !(received >= expected) {
            return Err($crate::Error::NotEnoughBytes {
                name: $name,
                received,
                expected,
            });
        }
    }};
}

mod error;
mod utils;

pub mod ber;
pub mod capabilities;
pub mod credssp;
pub mod encryption;
pub mod fast_path;
pub mod gcc;
pub mod license;
pub mod mcs;
pub mod nego;
pub mod ntlm;
pub mod per;
pub mod sec;
pub mod share;
pub mod sspi;
pub mod tpdu;
pub mod update;

pub use self::error::{Error, Result};
