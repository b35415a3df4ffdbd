//! Login and peer subscription against the assistance backend.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use peer_signal::PeerId;

use crate::config::{BackendConfig, Credentials};

const LOGIN_PATH: &str = "/auth/login";
const ADD_PEER_PATH: &str = "/peer/peers";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserDetails {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user: UserDetails,
    pub token: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddPeerRequest<'a> {
    peer_id: &'a str,
    user_id: &'a str,
    description: &'a str,
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl BackendClient {
    pub fn new(config: &BackendConfig, credentials: Credentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url(),
            credentials,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        Ok(Url::parse(&format!("{}{path}", self.base_url))?)
    }

    pub async fn login(&self) -> Result<LoginResponse, BackendError> {
        let response = self
            .http
            .post(self.endpoint(LOGIN_PATH)?)
            .json(&LoginRequest {
                username: &self.credentials.username,
                password: &self.credentials.password,
            })
            .send()
            .await?
            .error_for_status()?
            .json::<LoginResponse>()
            .await?;
        tracing::debug!(user = %response.user.id, "logged into backend");
        Ok(response)
    }

    /// Logs in and announces `peer_id` as an available operator.
    pub async fn subscribe(&self, peer_id: &PeerId, description: &str) -> Result<(), BackendError> {
        let login = self.login().await?;
        self.http
            .post(self.endpoint(ADD_PEER_PATH)?)
            .bearer_auth(&login.token)
            .json(&AddPeerRequest {
                peer_id: peer_id.as_str(),
                user_id: &login.user.id,
                description,
            })
            .send()
            .await?
            .error_for_status()?;
        tracing::info!(peer = %peer_id, "registered as available peer");
        Ok(())
    }
}
