use std::time::Duration;

use url::Url;

use crate::error::{SignalError, SignalResult};
use crate::ids::{random_token, PeerId};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(20_000);
pub const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_millis(20_000);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);

const SOCKET_ENDPOINT: &str = "peerjs";
const ID_ENDPOINT: [&str; 2] = ["api", "id"];
const PEERS_ENDPOINT: [&str; 2] = ["api", "peers"];

/// Where the relay lives and how to authenticate with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Path prefix the relay is mounted under, `/` when at the root.
    pub path: String,
    pub key: String,
    pub secure: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 9000,
            path: "/".into(),
            key: "peerjs".into(),
            secure: true,
        }
    }
}

impl RelayConfig {
    pub fn id_url(&self) -> SignalResult<Url> {
        self.endpoint(self.http_scheme(), &ID_ENDPOINT)
    }

    pub fn peers_url(&self, auth: &AuthParams) -> SignalResult<Url> {
        let mut url = self.endpoint(self.http_scheme(), &PEERS_ENDPOINT)?;
        auth.append_to(&mut url);
        Ok(url)
    }

    pub fn websocket_url(&self, auth: &AuthParams) -> SignalResult<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = self.endpoint(scheme, &[SOCKET_ENDPOINT])?;
        auth.append_to(&mut url);
        Ok(url)
    }

    fn http_scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    fn endpoint(&self, scheme: &str, segments: &[&str]) -> SignalResult<Url> {
        let mut url = Url::parse(&format!("{scheme}://{}:{}/", self.host, self.port))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SignalError::Setup(format!("relay host {} cannot be a base", self.host)))?;
            path.pop_if_empty();
            path.extend(self.path.split('/').filter(|segment| !segment.is_empty()));
            path.extend(segments);
        }
        Ok(url)
    }
}

/// Query parameters identifying one relay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthParams {
    pub key: String,
    pub id: PeerId,
    pub token: String,
}

impl AuthParams {
    /// Parameters for a new session; every session gets a fresh token.
    pub fn new(key: impl Into<String>, id: PeerId) -> Self {
        Self {
            key: key.into(),
            id,
            token: random_token(),
        }
    }

    fn append_to(&self, url: &mut Url) {
        url.query_pairs_mut()
            .append_pair("key", &self.key)
            .append_pair("id", self.id.as_str())
            .append_pair("token", &self.token);
    }
}

/// Timing of the signalling session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignallingOptions {
    pub heartbeat_interval: Duration,
    pub offer_timeout: Duration,
    /// Upper bound for opening a relay session, id request included. Also
    /// applies to every REST call.
    pub connect_timeout: Duration,
}

impl Default for SignallingOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            offer_timeout: DEFAULT_OFFER_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}
