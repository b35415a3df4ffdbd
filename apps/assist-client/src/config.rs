use std::env;

use peer_signal::{PeerId, RelayConfig};

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
    pub secure: bool,
}

impl BackendConfig {
    /// Root every backend route is appended to, without a trailing slash.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let base = self.base_path.trim_matches('/');
        if base.is_empty() {
            format!("{scheme}://{}:{}", self.host, self.port)
        } else {
            format!("{scheme}://{}:{}/{base}", self.host, self.port)
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Requested relay id; the relay issues one when unset.
    pub peer_id: Option<PeerId>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub relay: RelayConfig,
    pub backend: BackendConfig,
    pub credentials: Credentials,
    pub peer: PeerInfo,
    pub ice_servers: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(default)
        };
        let port = |key: &str, default: u16| {
            lookup(key)
                .and_then(|value| value.parse().ok())
                .unwrap_or(default)
        };

        let relay = RelayConfig {
            host: lookup("ASSIST_RELAY_HOST").unwrap_or_else(|| "localhost".into()),
            port: port("ASSIST_RELAY_PORT", 9000),
            path: lookup("ASSIST_RELAY_PATH").unwrap_or_else(|| "/".into()),
            key: lookup("ASSIST_RELAY_KEY").unwrap_or_else(|| "peerjs".into()),
            secure: flag("ASSIST_RELAY_SECURE", true),
        };
        let backend = BackendConfig {
            host: lookup("ASSIST_BACKEND_HOST").unwrap_or_else(|| "localhost".into()),
            port: port("ASSIST_BACKEND_PORT", 3000),
            base_path: lookup("ASSIST_BACKEND_PATH").unwrap_or_else(|| "api".into()),
            secure: flag("ASSIST_BACKEND_SECURE", false),
        };
        let credentials = Credentials {
            username: lookup("ASSIST_USERNAME").unwrap_or_default(),
            password: lookup("ASSIST_PASSWORD").unwrap_or_default(),
        };
        let peer = PeerInfo {
            peer_id: lookup("ASSIST_PEER_ID")
                .filter(|id| !id.trim().is_empty())
                .map(PeerId::from),
            description: lookup("ASSIST_PEER_DESCRIPTION").unwrap_or_else(|| "assist-client".into()),
        };
        let ice_servers = lookup("ASSIST_ICE_SERVERS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|server| !server.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_else(|| vec![DEFAULT_STUN_SERVER.to_string()]);

        Self {
            relay,
            backend,
            credentials,
            peer,
            ice_servers,
        }
    }
}
