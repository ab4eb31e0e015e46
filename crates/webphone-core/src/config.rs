//! Phone configuration and negotiation policy
//!
//! [`PhoneConfig`] carries the static policy every other module reads: the
//! audio codec allow-list, whether ICE is restricted to relay candidates, the
//! STUN/TURN servers handed to the negotiation layer, and the knobs of the
//! diagnostics sampler.
//!
//! # Usage Examples
//!
//! ```rust
//! use webphone_core::config::{IceTransportPolicy, PhoneConfig};
//! use std::time::Duration;
//!
//! let config = PhoneConfig::new()
//!     .with_force_relay(true)
//!     .with_stats_interval(Duration::from_secs(5));
//!
//! assert_eq!(config.ice_transport_policy(), IceTransportPolicy::Relay);
//! assert!(config.allows_codec("PCMU"));
//! assert!(!config.allows_codec("opus"));
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PhoneError, PhoneResult};

/// Codec names kept by the default allow-list (G.711 only)
pub const G711_CODECS: [&str; 2] = ["pcmu", "pcma"];

/// The RFC 4733 DTMF event codec
pub const DTMF_CODEC: &str = "telephone-event";

/// Default TURN/STUN host
pub const DEFAULT_TURN_HOST: &str = "phone.srve.cc";

/// Default port for STUN and plain TURN
pub const DEFAULT_TURN_PORT: u16 = 3478;

/// Default port for TURN over TLS
pub const DEFAULT_TURNS_PORT: u16 = 5349;

/// Which ICE candidates the negotiation layer may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    /// host, srflx and relay candidates
    All,
    /// TURN relay candidates only
    Relay,
}

impl std::fmt::Display for IceTransportPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IceTransportPolicy::All => write!(f, "all"),
            IceTransportPolicy::Relay => write!(f, "relay"),
        }
    }
}

/// One STUN or TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (`stun:`, `turn:` or `turns:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// A STUN server entry without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// The STUN + TURN (udp, tcp, tls) set for one coturn host
    pub fn defaults_for(host: &str, username: &str, credential: &str) -> Vec<Self> {
        vec![
            Self::stun(format!("stun:{host}:{DEFAULT_TURN_PORT}")),
            Self {
                urls: vec![
                    format!("turn:{host}:{DEFAULT_TURN_PORT}?transport=udp"),
                    format!("turn:{host}:{DEFAULT_TURN_PORT}?transport=tcp"),
                    format!("turns:{host}:{DEFAULT_TURNS_PORT}?transport=tcp"),
                ],
                username: Some(username.to_string()),
                credential: Some(credential.to_string()),
            },
        ]
    }
}

/// Static negotiation policy and diagnostics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    /// Rewrite offers/answers to the codec allow-list
    pub codec_filter_enabled: bool,
    /// Lowercase codec names kept by the filter
    pub allowed_codecs: BTreeSet<String>,
    /// Restrict ICE to relay candidates
    pub force_relay: bool,
    /// STUN/TURN servers handed to the negotiation layer
    pub ice_servers: Vec<IceServerConfig>,
    /// Transport-quality sampling period
    #[serde(with = "duration_ms", rename = "stats_interval_ms")]
    pub stats_interval: Duration,
    /// Maximum characters of a candidate line kept in reports
    pub candidate_preview_len: usize,
    /// Log secrets in clear (debugging only)
    pub show_password: bool,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            codec_filter_enabled: true,
            allowed_codecs: G711_CODECS.iter().map(|c| c.to_string()).collect(),
            force_relay: false,
            ice_servers: IceServerConfig::defaults_for(DEFAULT_TURN_HOST, "turnuser", "turnpass"),
            stats_interval: Duration::from_secs(2),
            candidate_preview_len: 140,
            show_password: false,
            event_capacity: 256,
        }
    }
}

impl PhoneConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON configuration; absent fields take their defaults
    pub fn from_json_str(json: &str) -> PhoneResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PhoneError::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the phone cannot run with
    pub fn validate(&self) -> PhoneResult<()> {
        if self.stats_interval.is_zero() {
            return Err(PhoneError::config("stats interval must be non-zero"));
        }
        if self.codec_filter_enabled && self.allowed_codecs.is_empty() {
            return Err(PhoneError::config(
                "codec filter enabled with an empty allow-list",
            ));
        }
        Ok(())
    }

    /// Enable or disable the codec filter
    pub fn with_codec_filter(mut self, enabled: bool) -> Self {
        self.codec_filter_enabled = enabled;
        self
    }

    /// Replace the codec allow-list (names are lowercased)
    pub fn with_allowed_codecs<I, S>(mut self, codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_codecs = codecs
            .into_iter()
            .map(|c| c.as_ref().trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        self
    }

    /// Keep or drop the DTMF event codec in the allow-list
    pub fn with_dtmf(mut self, enabled: bool) -> Self {
        if enabled {
            self.allowed_codecs.insert(DTMF_CODEC.to_string());
        } else {
            self.allowed_codecs.remove(DTMF_CODEC);
        }
        self
    }

    /// Force TURN relay candidates only
    pub fn with_force_relay(mut self, force: bool) -> Self {
        self.force_relay = force;
        self
    }

    /// Replace the ICE server list
    pub fn with_ice_servers(mut self, servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Set the transport-quality sampling period
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Log secrets in clear
    pub fn with_show_password(mut self, show: bool) -> Self {
        self.show_password = show;
        self
    }

    /// ICE transport policy derived from `force_relay`
    pub fn ice_transport_policy(&self) -> IceTransportPolicy {
        if self.force_relay {
            IceTransportPolicy::Relay
        } else {
            IceTransportPolicy::All
        }
    }

    /// Case-insensitive allow-list membership
    pub fn allows_codec(&self, codec: &str) -> bool {
        self.allowed_codecs.contains(&codec.to_ascii_lowercase())
    }

    /// Mask a secret for logging according to `show_password`
    pub fn mask(&self, secret: &str) -> String {
        if self.show_password {
            secret.to_string()
        } else {
            mask_password(secret)
        }
    }
}

/// Registration input
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Extension or user part
    pub identity: String,
    /// Authorization password
    pub secret: String,
    /// SIP domain
    pub domain: String,
    /// WebSocket server (`wss://host/ws`, or a bare host)
    pub server: String,
}

impl Credentials {
    /// Build credentials; identity and domain are trimmed, the secret is not
    pub fn new(
        identity: impl Into<String>,
        secret: impl Into<String>,
        domain: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into().trim().to_string(),
            secret: secret.into(),
            domain: domain.into().trim().to_string(),
            server: server.into(),
        }
    }

    /// True when identity, secret and domain are all present
    pub fn is_complete(&self) -> bool {
        !self.identity.is_empty() && !self.secret.is_empty() && !self.domain.is_empty()
    }
}

/// Mask a password for logs: `ab****z (len=7)`
pub fn mask_password(secret: &str) -> String {
    let len = secret.chars().count();
    match len {
        0 => String::new(),
        1 | 2 => "*".repeat(len),
        _ => {
            let head: String = secret.chars().take(2).collect();
            let tail = secret.chars().last().unwrap_or_default();
            format!("{head}****{tail} (len={len})")
        }
    }
}

/// Normalize a WebSocket server entry, falling back to `fallback` when empty
///
/// `ws://` and `wss://` URLs are kept verbatim; a bare host becomes
/// `wss://<host>/ws`.
pub fn normalize_server(value: &str, fallback: &str) -> String {
    let raw = if value.trim().is_empty() { fallback } else { value }.trim();
    if raw.is_empty() {
        return String::new();
    }
    if raw.starts_with("ws://") || raw.starts_with("wss://") {
        return raw.to_string();
    }
    format!("wss://{}/ws", raw.strip_suffix('/').unwrap_or(raw))
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
