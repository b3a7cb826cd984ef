use async_trait::async_trait;
use callwatch_core::{CallRecord, CallwatchError, Result};

pub const DEFAULT_FEED_URL: &str = "https://hc911server.com/api/calls";

/// Supplies the complete list of currently open incidents on demand.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<CallRecord>>;
}

/// Fetches snapshots as a JSON array from the call feed over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSnapshotSource {
    /// # Errors
    /// Returns [`CallwatchError::Network`] when the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("callwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| CallwatchError::Network(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self) -> Result<Vec<CallRecord>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| CallwatchError::Network(format!("request to {} failed: {err}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallwatchError::Network(format!(
                "feed {} returned HTTP {status}",
                self.url
            )));
        }

        response
            .json::<Vec<CallRecord>>()
            .await
            .map_err(|err| CallwatchError::Network(format!("failed to decode feed payload: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_feed_is_a_network_error() {
        let source = match HttpSnapshotSource::new("http://127.0.0.1:9/api/calls") {
            Ok(value) => value,
            Err(err) => panic!("failed to build source: {err}"),
        };
        assert_eq!(source.url(), "http://127.0.0.1:9/api/calls");

        let result = source.fetch().await;
        assert!(matches!(result, Err(CallwatchError::Network(_))));
    }
}
