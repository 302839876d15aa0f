//! Detection service client.
//!
//! The detector exposes `POST /predict?imgName=<key>&predictionId=<id>` and, as
//! a side effect, writes an annotated image and a label text file under a
//! directory keyed by the prediction id. The JSON reply may name the label
//! artifact directly; when it doesn't, the orchestrator falls back to the
//! conventional path.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("detector api error: {0}")]
    Api(String),
}

/// What the detection service reported back. Both fields are advisory; the
/// artifacts on disk are the contract.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorReply {
    #[serde(default)]
    pub prediction_id: Option<String>,
    /// Path of the label artifact, when the service reports it.
    #[serde(default)]
    pub labels_path: Option<PathBuf>,
}

/// Object-detection capability: run inference on a staged image.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(
        &self,
        prediction_id: &str,
        image_key: &str,
    ) -> Result<DetectorReply, DetectorError>;
}

/// HTTP client for the detection sidecar.
#[derive(Clone)]
pub struct HttpDetector {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDetector {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DetectorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(
        &self,
        prediction_id: &str,
        image_key: &str,
    ) -> Result<DetectorReply, DetectorError> {
        let url = format!("{}/predict", self.base_url);
        let res = self
            .client
            .post(&url)
            .query(&[("imgName", image_key), ("predictionId", prediction_id)])
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(DetectorError::Api(format!("{} {}", status, body)));
        }
        // A 2xx with an unparseable body still counts as a completed run: the
        // reply is advisory and the orchestrator falls back to the
        // conventional artifact path.
        let reply = res.json::<DetectorReply>().await.unwrap_or_else(|e| {
            log::debug!("ignoring malformed detector reply body: {}", e);
            DetectorReply::default()
        });
        Ok(reply)
    }
}
