use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

/// Last-gasp notification that frees the remote instance when the app goes
/// away. Short timeout, no retries: if the beacon is lost the backend's own
/// idle reaper reclaims the instance.
pub struct ReleaseBeacon {
    client: reqwest::Client,
    endpoint: Url,
}

#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseRequest<'a> {
    instance_id: &'a str,
}

impl ReleaseBeacon {
    pub fn new(endpoint: Url) -> Result<Self, BeaconError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .timeout(Duration::from_secs(2))
            .no_proxy()
            .build()
            .map_err(BeaconError::Client)?;
        Ok(Self { client, endpoint })
    }

    /// Fire the release notification. Failures are logged and swallowed;
    /// there is nothing useful a caller can do with them at shutdown.
    pub async fn release(&self, instance_id: &str) {
        let request = ReleaseRequest { instance_id };
        match self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!(
                    target = "fitspace::teardown",
                    instance_id, "instance release acknowledged"
                );
            }
            Ok(response) => {
                warn!(
                    target = "fitspace::teardown",
                    instance_id,
                    status = %response.status(),
                    "instance release rejected"
                );
            }
            Err(err) => {
                warn!(
                    target = "fitspace::teardown",
                    instance_id,
                    error = %err,
                    "instance release beacon lost"
                );
            }
        }
    }
}
