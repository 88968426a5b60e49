//! HTTP client for the relay's admission API.

use crate::error::ClientError;
use gatelink_core::api::{ConnectionResponse, UserRecord, PROTOCOL_VERSION};
use gatelink_core::proto::Token;
use gatelink_core::UserKey;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Total deadline for one admission request
const ADMISSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Client version, sent as the `client` query parameter
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AdmissionClient {
    http: reqwest::Client,
    server_url: String,
    user_key: UserKey,
}

impl AdmissionClient {
    pub fn new(server_url: &str, user_key: UserKey) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("gatelink/", env!("CARGO_PKG_VERSION")))
            .timeout(ADMISSION_TIMEOUT)
            .build()
            .map_err(|err| ClientError::Network(err.to_string()))?;

        Ok(Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
            user_key,
        })
    }

    /// Request a session: the relay allocates a public UDP port and issues
    /// the token that authenticates the tunnel.
    pub async fn connect(&self) -> Result<(u16, Token), ClientError> {
        let url = format!("{}/api/connect", self.server_url);
        debug!("admission: POST {url}");

        let response = self
            .http
            .post(&url)
            .query(&[("proto", PROTOCOL_VERSION), ("client", CLIENT_VERSION)])
            .bearer_auth(self.user_key.to_string())
            .send()
            .await
            .map_err(|err| ClientError::Network(err.to_string()))?;

        let response = check_status(response)?;
        let body: ConnectionResponse = response
            .json()
            .await
            .map_err(|err| ClientError::InvalidServer(format!("bad response body: {err}")))?;

        if let Some(code) = body.error_code {
            return Err(ClientError::Refused(code));
        }
        if let Some(message) = body.error_message {
            return Err(ClientError::InvalidServer(message));
        }

        match (body.port, body.token) {
            (Some(port), Some(token)) => Ok((port, token)),
            _ => Err(ClientError::InvalidServer(
                "response is missing port or token".to_string(),
            )),
        }
    }

    /// Fetch the account record behind the configured key. Pure probe, used
    /// to validate a key before starting a session.
    pub async fn get_user(&self) -> Result<UserRecord, ClientError> {
        let url = format!("{}/api/user", self.server_url);
        debug!("admission: GET {url}");

        let response = self
            .http
            .get(&url)
            .bearer_auth(self.user_key.to_string())
            .send()
            .await
            .map_err(|err| ClientError::Network(err.to_string()))?;

        check_status(response)?
            .json()
            .await
            .map_err(|err| ClientError::InvalidServer(format!("bad response body: {err}")))
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    match response.status() {
        StatusCode::OK => Ok(response),
        StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
        StatusCode::SERVICE_UNAVAILABLE => Err(ClientError::Maintenance),
        status => Err(ClientError::InvalidServer(format!(
            "unexpected status {status}"
        ))),
    }
}
