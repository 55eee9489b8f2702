use crate::error::FetchError;
use crate::trains::{TrainBundle, TrainDataResponse};
use futures::future::BoxFuture;
use std::time::Duration;
use tracing::debug;

/// Source of train snapshots. One call is one snapshot; retrying is the caller's business.
pub trait TrainDataSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<Vec<TrainBundle>, FetchError>>;
}

pub struct HttpTrainDataSource {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpTrainDataSource {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            url: format!("{}/api/train-data", base_url.trim_end_matches('/')),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl TrainDataSource for HttpTrainDataSource {
    fn fetch(&self) -> BoxFuture<'_, Result<Vec<TrainBundle>, FetchError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(&self.url)
                .timeout(self.timeout)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status(status));
            }

            let bytes = response.bytes().await?;
            let data: TrainDataResponse = serde_json::from_slice(&bytes)?;

            debug!(
                "Fetched {} trains from {} (snapshot {:?})",
                data.payload.len(),
                self.url,
                data.timestamp
            );

            Ok(data.payload)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_derived_from_base() {
        let client = reqwest::Client::new();
        let source =
            HttpTrainDataSource::new(client, "http://localhost:8000/", Duration::from_secs(30));
        assert_eq!(source.url(), "http://localhost:8000/api/train-data");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_fetch_error() {
        let client = reqwest::Client::new();
        // port 9 (discard) on loopback is closed on test machines
        let source = HttpTrainDataSource::new(client, "http://127.0.0.1:9", Duration::from_secs(2));

        let result = source.fetch().await;

        assert!(matches!(
            result,
            Err(FetchError::Http(_)) | Err(FetchError::Timeout)
        ));
    }
}
