//! Relay HTTP client
//!
//! Pure request/response wrapper over the relay's session/track API. Every
//! call is a single HTTP exchange; retries and timeouts belong to the caller.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use relaycall_core::config::RelayConfig;
use relaycall_core::error::RelayError;
use relaycall_core::models::SessionId;
use relaycall_core::traits::{PushResult, RelayApi};
use relaycall_proto::relay::{
    ErrorEnvelope, NewSessionResponse, RenegotiateRequest, SessionDescription, TrackObject,
    TracksRequest, TracksResponse,
};

/// Relay API client
///
/// - `POST {base}/sessions/new`
/// - `POST {base}/sessions/{id}/tracks/new`
/// - `PUT  {base}/sessions/{id}/renegotiate`
pub struct RelayClient {
    base_url: String,
    app_token: String,
    client: Client,
}

impl RelayClient {
    /// Create a client; `base_url` must be an absolute http(s) URL
    pub fn new(
        base_url: impl Into<String>,
        app_token: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, RelayError> {
        let base_url = base_url.into();
        let parsed = Url::parse(&base_url)
            .map_err(|e| RelayError::InvalidConfig(format!("base url {base_url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RelayError::InvalidConfig(format!(
                "base url must be http or https, got {}",
                parsed.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            app_token: app_token.into(),
            client,
        })
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self, RelayError> {
        Self::new(
            config.base_url.clone(),
            config.app_token.clone(),
            config.request_timeout(),
        )
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn build_headers(&self) -> Result<HeaderMap, RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if !self.app_token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.app_token))
                .map_err(|e| RelayError::InvalidConfig(format!("app token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(headers)
    }

    /// Send a request and return the body of a successful response
    async fn execute(&self, operation: &str, request: RequestBuilder) -> Result<String, RelayError> {
        let response = request
            .headers(self.build_headers()?)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        debug!(operation, status = status.as_u16(), "Relay responded");

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RelayError::Authentication(error_message(status, &body)));
        }
        if !status.is_success() {
            warn!(operation, status = status.as_u16(), "Relay request failed");
            return Err(RelayError::Api {
                status: status.as_u16(),
                message: error_message(status, &body),
            });
        }

        // Some failures come back as 2xx with an error envelope
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
            if let Some(code) = envelope.error_code {
                return Err(RelayError::Api {
                    status: status.as_u16(),
                    message: envelope
                        .error_description
                        .map_or_else(|| code.clone(), |desc| format!("{code}: {desc}")),
                });
            }
        }

        Ok(body)
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T, RelayError> {
        let body = self.execute(operation, request).await?;
        serde_json::from_str(&body)
            .map_err(|e| RelayError::MalformedResponse(format!("{operation}: {e}")))
    }
}

/// Prefer the relay's `errorDescription`, then its `errorCode`, then the raw body
fn error_message(status: StatusCode, body: &str) -> String {
    let envelope = serde_json::from_str::<ErrorEnvelope>(body).unwrap_or_default();
    envelope
        .error_description
        .or(envelope.error_code)
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
        .unwrap_or_else(|| status.to_string())
}

#[async_trait]
impl RelayApi for RelayClient {
    async fn create_session(&self) -> Result<SessionId, RelayError> {
        let request = self.client.post(self.url("sessions/new"));
        let resp: NewSessionResponse = self.execute_json("create_session", request).await?;

        if resp.session_id.is_empty() {
            return Err(RelayError::MalformedResponse(
                "create_session: empty sessionId".to_string(),
            ));
        }
        Ok(SessionId::new(resp.session_id))
    }

    async fn push_tracks(
        &self,
        session_id: &SessionId,
        offer: SessionDescription,
        tracks: Vec<TrackObject>,
    ) -> Result<PushResult, RelayError> {
        let body = TracksRequest {
            session_description: Some(offer),
            tracks,
        };
        let request = self
            .client
            .post(self.url(&format!("sessions/{session_id}/tracks/new")))
            .json(&body);
        let resp: TracksResponse = self.execute_json("push_tracks", request).await?;

        let Some(remote_description) = resp.session_description else {
            return Err(RelayError::MalformedResponse(
                "push_tracks: response has no sessionDescription".to_string(),
            ));
        };

        Ok(PushResult {
            remote_description,
            tracks: resp.tracks,
            requires_immediate_renegotiation: resp.requires_immediate_renegotiation,
        })
    }

    async fn pull_tracks(
        &self,
        session_id: &SessionId,
        tracks: Vec<TrackObject>,
    ) -> Result<TracksResponse, RelayError> {
        let body = TracksRequest {
            session_description: None,
            tracks,
        };
        let request = self
            .client
            .post(self.url(&format!("sessions/{session_id}/tracks/new")))
            .json(&body);
        self.execute_json("pull_tracks", request).await
    }

    async fn renegotiate(
        &self,
        session_id: &SessionId,
        answer: SessionDescription,
    ) -> Result<(), RelayError> {
        let body = RenegotiateRequest {
            session_description: answer,
        };
        let request = self
            .client
            .put(self.url(&format!("sessions/{session_id}/renegotiate")))
            .json(&body);
        self.execute("renegotiate", request).await.map(|_| ())
    }
}
