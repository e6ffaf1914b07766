use super::Transport;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use reqwest::{Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;
use tillsync_engine::{
    BatchRequest, BatchResponse, ConflictId, ConflictLogEntry, ConflictQuery, PullQuery,
    PullResponse, ResolveRequest, ResolveResponse, SchemaInfo, SchemaVersion,
};

/// Error body returned by the cloud service.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    details: Option<String>,
}

/// JSON-over-HTTP transport with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    /// `None` keeps the device offline: every call fails as a network error
    base_url: Option<String>,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            api_key,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(
            config.server_url.clone(),
            config.api_key.clone(),
            config.request_timeout,
        )
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| ClientError::network("no server configured"))?;
        let builder = self.client.request(method, format!("{base}{path}"));

        Ok(match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        })
    }

    async fn send<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let text = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(ErrorBody {
                error,
                details: Some(details),
            }) => format!("{error}: {details}"),
            Ok(body) => body.error,
            Err(_) => text,
        };
        Err(ClientError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

impl Transport for HttpTransport {
    async fn schema_version(&self) -> Result<SchemaVersion> {
        let info: SchemaInfo = Self::send(self.request(Method::GET, "/sync/schema")?).await?;
        Ok(info.schema_version)
    }

    async fn upload(&self, request: &BatchRequest) -> Result<BatchResponse> {
        Self::send(self.request(Method::POST, "/sync/batch")?.json(request)).await
    }

    async fn pull(&self, query: PullQuery) -> Result<PullResponse> {
        Self::send(self.request(Method::GET, "/sync/pull")?.query(&query)).await
    }

    async fn list_conflicts(&self, query: &ConflictQuery) -> Result<Vec<ConflictLogEntry>> {
        Self::send(self.request(Method::GET, "/sync/conflicts")?.query(query)).await
    }

    async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        request: &ResolveRequest,
    ) -> Result<ResolveResponse> {
        let path = format!("/sync/conflicts/{conflict_id}/resolve");
        Self::send(self.request(Method::POST, &path)?.json(request)).await
    }
}
