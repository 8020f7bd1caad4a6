use std::time::Duration;

use mneme_core::config::KnowledgeConfig;
use mneme_core::error::AppError;
use mneme_core::models::{
    IntelligenceLevel, QueryRequest, QueryResponse, ServiceStats, TeachEntry, TeachRequest,
    TeachResponse,
};
use mneme_core::traits::KnowledgeTransport;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
const USER_AGENT: &str = concat!("mneme/", env!("CARGO_PKG_VERSION"));

/// Knowledge service client over HTTP/JSON.
///
/// Endpoints, relative to the base URL:
/// - `POST /query` with `{"urls": [...], "intelligence": "medium"}`
/// - `POST /teach` with `{"entries": [{"url": ..., "data": ...}]}`
/// - `GET /stats`
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        Self::build(base_url, None, DEFAULT_TIMEOUT)
    }

    /// Builds a transport from the service settings in `config`.
    pub fn from_config(config: &KnowledgeConfig) -> Result<Self, AppError> {
        Self::build(&config.base_url, config.api_key.clone(), config.timeout())
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(&self.base_url, self.api_key, timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, AppError> {
        url::Url::parse(base_url).map_err(|e| {
            AppError::ConfigError(format!("Invalid knowledge service URL '{base_url}': {e}"))
        })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, AppError> {
        let response = self.authorized(builder).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout.as_millis() as u64)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            if status_code == 429 {
                return Err(AppError::RateLimitExceeded);
            }

            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error)
                .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));

            return Err(AppError::ServiceError {
                message,
                status_code,
                retryable: status_code >= 500,
            });
        }

        response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse service response: {e}")))
    }
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(alias = "message")]
    error: String,
}

impl KnowledgeTransport for HttpTransport {
    async fn query(
        &self,
        urls: &[String],
        intelligence: IntelligenceLevel,
    ) -> Result<QueryResponse, AppError> {
        let request = QueryRequest {
            urls: urls.to_vec(),
            intelligence,
        };
        tracing::debug!(batch_size = urls.len(), %intelligence, "POST /query");
        self.send(self.client.post(self.endpoint("query")).json(&request))
            .await
    }

    async fn teach(&self, entries: &[TeachEntry]) -> Result<TeachResponse, AppError> {
        let request = TeachRequest {
            entries: entries.to_vec(),
        };
        tracing::debug!(entries = entries.len(), "POST /teach");
        self.send(self.client.post(self.endpoint("teach")).json(&request))
            .await
    }

    async fn stats(&self) -> Result<ServiceStats, AppError> {
        self.send(self.client.get(self.endpoint("stats"))).await
    }
}
