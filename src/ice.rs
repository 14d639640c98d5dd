#![forbid(unsafe_code)]

// STUN server configuration handed to clients for address discovery.
// The server never relays media and runs no TURN fallback — clients only
// need somewhere to learn their reflexive addresses.

use serde::{Deserialize, Serialize};

/// Public STUN servers used when STUN_URLS is not set.
const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// ICE server entry sent to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
}

/// STUN configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct StunConfig {
    /// STUN server URLs (e.g. ["stun:stun.example.com:3478"])
    pub urls: Vec<String>,
}

impl StunConfig {
    /// Load from the STUN_URLS environment variable (comma-separated).
    /// Falls back to the public Google STUN pair.
    pub fn from_env() -> Self {
        match std::env::var("STUN_URLS") {
            Ok(raw) if !raw.trim().is_empty() => Self { urls: parse_urls(&raw) },
            _ => Self::default(),
        }
    }

    /// The ICE server list clients should pass to their peer-connection setup.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        vec![IceServer { urls: self.urls.clone() }]
    }
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            urls: DEFAULT_STUN_URLS.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

fn parse_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
