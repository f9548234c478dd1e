//! reqwest-backed [`RecommendationService`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use super::{FetchOutcome, RecommendationBody, RecommendationService, Session, SessionChanges};
use crate::error::{Result, TuneError};
use crate::observation::Observation;

/// Connection settings for the recommendation service.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Base URL, e.g. `http://127.0.0.1:5000`.
    pub base_url: String,
    /// TCP connection timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout.
    pub request_timeout: Duration,
}

impl HttpClientConfig {
    /// Defaults: 3 s connect, 30 s per request. A bare `host:port` gets `http://`.
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&backend.into()),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
        }
    }
}

fn normalize_base_url(backend: &str) -> String {
    let trimmed = backend.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// HTTP client for the tuning server's result and session endpoints.
///
/// The underlying `reqwest::Client` is owned by this value; nothing is shared
/// process-wide. Build with [`HttpRecommendationClient::builder`].
pub struct HttpRecommendationClient {
    config: HttpClientConfig,
    client: reqwest::Client,
}

impl HttpRecommendationClient {
    pub fn builder(backend: impl Into<String>) -> HttpRecommendationClientBuilder {
        HttpRecommendationClientBuilder::new(backend)
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn generate_url(&self, session: &Session) -> String {
        format!("{}/api/result/generate/{}", self.config.base_url, session.name())
    }

    fn query_url(&self, session: &Session) -> String {
        format!("{}/api/result/query/{}", self.config.base_url, session.name())
    }

    fn show_url(&self, session: &Session) -> String {
        format!("{}/api/session/show/{}", self.config.base_url, session.name())
    }

    fn unavailable(&self, e: reqwest::Error) -> TuneError {
        TuneError::SourceUnavailable {
            target: self.config.base_url.clone(),
            detail: e.to_string(),
        }
    }

    /// POST `body` as JSON to `path` and return the response text.
    async fn post_document<B>(&self, path: &str, body: &B) -> Result<String>
    where
        B: Serialize + ?Sized + Sync,
    {
        let url = format!("{}{path}", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.unavailable(e))?;
        if !status.is_success() {
            return Err(TuneError::RequestRejected {
                url,
                status: status.as_u16(),
                body: text.trim().to_string(),
            });
        }
        debug!(url = %url, status = status.as_u16(), "request accepted");
        Ok(text)
    }

    /// Register a system type and version (`/api/system/register`).
    ///
    /// The document must carry `system_type` and `version`.
    pub async fn register_system(&self, system: &serde_json::Value) -> Result<String> {
        self.post_document("/api/system/register", system).await
    }

    /// Register the knob catalog of a system (`/api/knob/register/catalog`).
    pub async fn register_knob_catalog(&self, catalog: &serde_json::Value) -> Result<String> {
        self.post_document("/api/knob/register/catalog", catalog).await
    }

    /// Register the metric catalog of a system (`/api/metric/register/catalog`).
    pub async fn register_metric_catalog(&self, catalog: &serde_json::Value) -> Result<String> {
        self.post_document("/api/metric/register/catalog", catalog).await
    }

    /// Create a session from a rendered session document (`/api/session/create`).
    pub async fn create_session(&self, session: &serde_json::Value) -> Result<String> {
        self.post_document("/api/session/create", session).await
    }

    /// Choose the knobs a session tunes (`/api/knob/tuning`).
    pub async fn register_tuning_knobs(&self, tuning_knobs: &serde_json::Value) -> Result<String> {
        self.post_document("/api/knob/tuning", tuning_knobs).await
    }

    /// Change the algorithm, target or tuned knobs of an existing session.
    ///
    /// # Errors
    /// - `SourceUnavailable` when the service cannot be reached.
    /// - `RequestRejected` on a non-success status, e.g. an unknown session.
    pub async fn modify_session(&self, changes: &SessionChanges) -> Result<String> {
        let out = self.post_document("/api/session/modify", changes).await?;
        info!(session = %changes.name, "session modified");
        Ok(out)
    }

    /// Fetch the session description from `/api/session/show/{session}`.
    ///
    /// # Errors
    /// - `SourceUnavailable` when the service cannot be reached.
    /// - `QueryFailed` on a non-success status, with the body as detail.
    /// - `MalformedResponse` when the body is not JSON.
    pub async fn show_session(&self, session: &Session) -> Result<serde_json::Value> {
        let url = self.show_url(session);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.unavailable(e))?;
        if !status.is_success() {
            return Err(TuneError::QueryFailed {
                statement: format!("GET {url}"),
                detail: format!("HTTP {}: {}", status.as_u16(), body.trim()),
            });
        }
        serde_json::from_str(&body).map_err(|e| TuneError::MalformedResponse {
            url,
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl RecommendationService for HttpRecommendationClient {
    async fn request_recommendation(
        &self,
        session: &Session,
        observation: &Observation,
    ) -> Result<String> {
        let url = self.generate_url(session);
        let request = observation
            .to_submission()
            .map_err(|e| TuneError::Config(format!("cannot encode observation: {e}")))?;

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.unavailable(e))?;

        if !status.is_success() {
            return Err(TuneError::SubmissionRejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(session = %session, "observation submitted");
        Ok(body)
    }

    async fn fetch_recommendation(&self, session: &Session) -> Result<FetchOutcome> {
        let url = self.query_url(session);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| self.unavailable(e))?;

        if !status.is_success() {
            return Ok(FetchOutcome::NotReady {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let body: RecommendationBody =
            serde_json::from_slice(&bytes).map_err(|e| TuneError::MalformedResponse {
                url: url.clone(),
                detail: e.to_string(),
            })?;
        let rec = body.into_recommendation(session);
        debug!(session = %session, knobs = rec.knobs.len(), "fetched recommendation");
        Ok(FetchOutcome::Ready(rec))
    }
}

/// Builder for [`HttpRecommendationClient`].
pub struct HttpRecommendationClientBuilder {
    config: HttpClientConfig,
}

impl HttpRecommendationClientBuilder {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            config: HttpClientConfig::new(backend),
        }
    }

    /// Override the TCP connect timeout (default 3 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Override the per-request timeout (default 30 s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// # Panics
    /// This function never panics.
    pub fn build(self) -> HttpRecommendationClient {
        // Builder failure falls back to a default client.
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .build()
            .unwrap_or_default();
        HttpRecommendationClient {
            config: self.config,
            client,
        }
    }
}
