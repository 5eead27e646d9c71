//! Client side of the RDP connection sequence on top of tokio.
//!
//! [`RdpClient::login`] negotiates security, authenticates, sets up channels and licensing, then
//! runs the session and reports what happens through [`RdpEvent`]s.

#[macro_use]
extern crate tracing;

mod client;
mod task;

pub mod config;
pub mod error;
pub mod event;
pub mod mcs;
pub mod negotiation;
pub mod nla;
pub mod pdu;
pub mod security;
pub mod tls;
pub mod transport;

pub use rdp_proto;

pub use client::{RdpClient, SessionHandle};
pub use config::{ClientConfig, ConfigError, Credentials};
pub use error::{NegotiationFailure, RdpError, RdpResult};
pub use event::{EventReceiver, RdpEvent, UpdateRectangle};
