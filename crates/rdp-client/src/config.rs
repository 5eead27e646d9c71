use core::time::Duration;

use rdp_proto::capabilities::ClientCapabilities;
use rdp_proto::nego::ProtocolSet;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Deserializer};
use typed_builder::TypedBuilder;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound of the TPKT length field.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 0xFFFF;

pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: &'static str },
}

#[derive(Debug, Deserialize, TypedBuilder)]
pub struct Credentials {
    #[serde(default)]
    #[builder(default, setter(into))]
    pub domain: String,
    #[builder(setter(into))]
    pub username: String,
    #[builder(setter(transform = |password: &str| SecretString::from(password)))]
    pub password: SecretString,
}

#[derive(Debug, Deserialize, TypedBuilder)]
pub struct ClientConfig {
    pub credentials: Credentials,

    /// Host name presented during the TLS upgrade.
    #[serde(default = "default_server_name")]
    #[builder(default = default_server_name(), setter(into))]
    pub server_name: String,

    #[serde(default = "ProtocolSet::all", deserialize_with = "deserialize_protocols")]
    #[builder(default = ProtocolSet::all())]
    pub protocols: ProtocolSet,

    #[serde(default = "default_desktop_width")]
    #[builder(default = default_desktop_width())]
    pub desktop_width: u16,

    #[serde(default = "default_desktop_height")]
    #[builder(default = default_desktop_height())]
    pub desktop_height: u16,

    #[serde(default = "default_color_depth")]
    #[builder(default = default_color_depth())]
    pub color_depth: u16,

    #[serde(default = "default_keyboard_layout")]
    #[builder(default = default_keyboard_layout())]
    pub keyboard_layout: u32,

    #[serde(default = "default_client_name")]
    #[builder(default = default_client_name(), setter(into))]
    pub client_name: String,

    /// Static virtual channels requested next to the I/O channel.
    #[serde(default)]
    #[builder(default)]
    pub channels: Vec<String>,

    /// Deadline for the first server response; nothing is timed once the session is up.
    #[serde(default = "default_connect_timeout", deserialize_with = "deserialize_millis", rename = "connect_timeout_ms")]
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,

    #[serde(default = "default_max_frame_size")]
    #[builder(default = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,

    #[serde(default = "default_event_channel_capacity")]
    #[builder(default = DEFAULT_EVENT_CHANNEL_CAPACITY)]
    pub event_channel_capacity: usize,
}

impl ClientConfig {
    /// Checks everything that can be checked before dialing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credentials.username.is_empty() {
            return Err(ConfigError::Missing("username"));
        }

        if self.credentials.password.expose_secret().is_empty() {
            return Err(ConfigError::Missing("password"));
        }

        if self.protocols.is_empty() {
            return Err(ConfigError::Invalid {
                name: "protocols",
                reason: "at least one security protocol must be allowed",
            });
        }

        if !matches!(self.color_depth, 8 | 15 | 16 | 24 | 32) {
            return Err(ConfigError::Invalid {
                name: "color_depth",
                reason: "must be one of 8, 15, 16, 24 or 32",
            });
        }

        if self.desktop_width == 0 || self.desktop_height == 0 {
            return Err(ConfigError::Invalid {
                name: "desktop size",
                reason: "width and height must be non-zero",
            });
        }

        if self.channels.iter().any(|name| name.is_empty() || name.len() > 7 || !name.is_ascii()) {
            return Err(ConfigError::Invalid {
                name: "channels",
                reason: "channel names are 1 to 7 ASCII characters",
            });
        }

        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "event_channel_capacity",
                reason: "must be non-zero",
            });
        }

        Ok(())
    }

    pub(crate) fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            desktop_width: self.desktop_width,
            desktop_height: self.desktop_height,
            color_depth: self.color_depth,
            keyboard_layout: self.keyboard_layout,
            ..ClientCapabilities::default()
        }
    }
}

fn default_server_name() -> String {
    "localhost".to_owned()
}

fn default_desktop_width() -> u16 {
    1024
}

fn default_desktop_height() -> u16 {
    768
}

fn default_color_depth() -> u16 {
    16
}

fn default_keyboard_layout() -> u32 {
    0x0409 // en-US
}

fn default_client_name() -> String {
    "rdp-client".to_owned()
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn deserialize_protocols<'de, D>(deserializer: D) -> Result<ProtocolSet, D::Error>
where
    D: Deserializer<'de>,
{
    const VARIANTS: &[&str] = &["plain", "tls", "hybrid"];

    let names = Vec::<String>::deserialize(deserializer)?;

    names.iter().try_fold(ProtocolSet::empty(), |set, name| match name.as_str() {
        "plain" => Ok(set | ProtocolSet::PLAIN),
        "tls" => Ok(set | ProtocolSet::TRANSPORT_ENCRYPTED),
        "hybrid" => Ok(set | ProtocolSet::HYBRID),
        other => Err(serde::de::Error::unknown_variant(other, VARIANTS)),
    })
}
