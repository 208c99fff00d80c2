/// HTTP transport for the progress API
///
/// Conceptual REST framing: `POST /progress` for single-record saves,
/// `POST /progress/batch` for batches, `GET /progress?since=<RFC3339>`
/// for incremental loads. All requests carry a bearer token.

use async_trait::async_trait;
use chrono::{SecondsFormat, TimeZone, Utc};

use psync_core::{Error, RemoteRecord, Result};

use super::{BatchSaveRequest, BatchSaveResponse, LoadResponse, ProgressTransport, SaveData};

/// Transport backed by an HTTP progress API
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for the API rooted at `base_url`
    /// (e.g. `https://api.example.com/v1`).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::Transport(e.to_string())
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::Transport(format!("server returned {}", status)))
    }
}

/// Format an epoch-millisecond watermark as RFC 3339 for the `since` query
fn format_since(since_ms: i64) -> Result<String> {
    let timestamp = Utc
        .timestamp_millis_opt(since_ms)
        .single()
        .ok_or_else(|| Error::InvalidArgument(format!("timestamp out of range: {}", since_ms)))?;
    Ok(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[async_trait]
impl ProgressTransport for HttpTransport {
    async fn save(&self, data: &SaveData, token: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url("/progress"))
            .bearer_auth(token)
            .json(data)
            .send()
            .await
            .map_err(transport_error)?;

        check_status(response)?;
        Ok(())
    }

    async fn save_batch(
        &self,
        request: &BatchSaveRequest,
        token: &str,
    ) -> Result<BatchSaveResponse> {
        let response = self
            .client
            .post(self.url("/progress/batch"))
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        check_status(response)?
            .json::<BatchSaveResponse>()
            .await
            .map_err(|e| Error::Parse(e.to_string()))
    }

    async fn load_since(&self, since_ms: Option<i64>, token: &str) -> Result<Vec<RemoteRecord>> {
        let mut request = self.client.get(self.url("/progress")).bearer_auth(token);

        if let Some(since) = since_ms {
            request = request.query(&[("since", format_since(since)?)]);
        }

        let response = request.send().await.map_err(transport_error)?;

        let body = check_status(response)?
            .json::<LoadResponse>()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        Ok(body.records)
    }
}
