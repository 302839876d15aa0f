//! Prediction orchestration: one staged image in, one summary (or a
//! distinguishable failure) out.
//!
//! Per call: generate a fresh prediction id, invoke the detector, locate the
//! label artifact it wrote, parse it, and assemble the summary. The annotated
//! image is published by the detector under the `predicted/` prefix; the
//! summary only references it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::detector::{Detector, DetectorError};
use crate::labels::{parse_labels, Detection, LabelParseError};

/// Storage key prefix for user-submitted originals.
pub const PHOTOS_PREFIX: &str = "photos/";
/// Storage key prefix for annotated outputs. Distinct from `PHOTOS_PREFIX` so
/// an annotated image can never overwrite its original.
pub const PREDICTED_PREFIX: &str = "predicted/";

/// An image that has been placed in the blob store: its local staging path
/// and its storage key (`photos/<basename>`).
#[derive(Debug, Clone)]
pub struct StagedImage {
    pub local_path: PathBuf,
    pub key: String,
}

impl StagedImage {
    /// Stage a local file under the `photos/` prefix, keyed by its basename.
    pub fn from_local(local_path: impl Into<PathBuf>) -> Self {
        let local_path = local_path.into();
        let basename = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            key: format!("{}{}", PHOTOS_PREFIX, basename),
            local_path,
        }
    }

    /// File name without the prefix (used for the annotated counterpart key).
    pub fn basename(&self) -> &str {
        self.key.strip_prefix(PHOTOS_PREFIX).unwrap_or(&self.key)
    }
}

/// Result of one successful pipeline run. Written at most once to the record
/// store; never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionSummary {
    pub prediction_id: String,
    pub original_key: String,
    pub predicted_key: String,
    pub detections: Vec<Detection>,
    pub created_at: DateTime<Utc>,
}

/// Terminal failure of one orchestration run. The kinds are distinguishable
/// so the controller can word each user reply differently.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("detector invocation failed: {0}")]
    Invocation(#[from] DetectorError),

    #[error("prediction {prediction_id}: no label artifact at {path}")]
    NotFound {
        prediction_id: String,
        path: PathBuf,
    },

    #[error("prediction {prediction_id}: {source}")]
    Parse {
        prediction_id: String,
        #[source]
        source: LabelParseError,
    },

    #[error("prediction {prediction_id}: reading label artifact {path}: {source}")]
    ArtifactRead {
        prediction_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Drives one detection run per staged image. Each run owns a fresh uuid
/// prediction id naming its artifact namespace, so concurrent runs never
/// contend over paths or keys.
pub struct PredictionOrchestrator {
    detector: Arc<dyn Detector>,
    artifact_dir: PathBuf,
    class_names: Vec<String>,
}

impl PredictionOrchestrator {
    pub fn new(
        detector: Arc<dyn Detector>,
        artifact_dir: impl Into<PathBuf>,
        class_names: Vec<String>,
    ) -> Self {
        Self {
            detector,
            artifact_dir: artifact_dir.into(),
            class_names,
        }
    }

    /// Conventional label artifact path: `<artifact dir>/<id>/labels/<stem>.txt`.
    fn conventional_labels_path(&self, prediction_id: &str, staged: &StagedImage) -> PathBuf {
        let stem = Path::new(staged.basename())
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| staged.basename().to_string());
        self.artifact_dir
            .join(prediction_id)
            .join("labels")
            .join(format!("{}.txt", stem))
    }

    /// Run the detector on a staged image and assemble the summary.
    pub async fn predict(&self, staged: &StagedImage) -> Result<PredictionSummary, PredictError> {
        let prediction_id = uuid::Uuid::new_v4().to_string();
        log::info!("prediction {}: start ({})", prediction_id, staged.key);

        let reply = self.detector.detect(&prediction_id, &staged.key).await?;

        let labels_path = reply
            .labels_path
            .unwrap_or_else(|| self.conventional_labels_path(&prediction_id, staged));
        if !labels_path.exists() {
            // Detector ran but produced no output (corrupted input, unsupported format).
            return Err(PredictError::NotFound {
                prediction_id,
                path: labels_path,
            });
        }

        let raw = tokio::fs::read_to_string(&labels_path).await.map_err(|e| {
            PredictError::ArtifactRead {
                prediction_id: prediction_id.clone(),
                path: labels_path.clone(),
                source: e,
            }
        })?;
        let detections = parse_labels(&raw, &self.class_names).map_err(|e| PredictError::Parse {
            prediction_id: prediction_id.clone(),
            source: e,
        })?;
        log::info!(
            "prediction {}: {} detection(s)",
            prediction_id,
            detections.len()
        );

        Ok(PredictionSummary {
            prediction_id,
            original_key: staged.key.clone(),
            predicted_key: format!("{}{}", PREDICTED_PREFIX, staged.basename()),
            detections,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorReply;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fake detector that writes a canned label artifact into the expected
    /// namespace, mimicking the real service's side effect.
    struct FakeDetector {
        artifact_dir: PathBuf,
        labels: Option<String>,
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Detector for FakeDetector {
        async fn detect(
            &self,
            prediction_id: &str,
            image_key: &str,
        ) -> Result<DetectorReply, DetectorError> {
            self.calls.lock().unwrap().push(image_key.to_string());
            if self.fail {
                return Err(DetectorError::Api("503 overloaded".to_string()));
            }
            if let Some(ref labels) = self.labels {
                let stem = Path::new(image_key)
                    .file_stem()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned();
                let dir = self.artifact_dir.join(prediction_id).join("labels");
                std::fs::create_dir_all(&dir).unwrap();
                std::fs::write(dir.join(format!("{}.txt", stem)), labels).unwrap();
            }
            Ok(DetectorReply::default())
        }
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lookout-predict-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn names() -> Vec<String> {
        vec!["person".to_string(), "dog".to_string(), "cat".to_string()]
    }

    fn orchestrator(artifact_dir: &Path, labels: Option<&str>, fail: bool) -> PredictionOrchestrator {
        PredictionOrchestrator::new(
            Arc::new(FakeDetector {
                artifact_dir: artifact_dir.to_path_buf(),
                labels: labels.map(String::from),
                calls: Mutex::new(Vec::new()),
                fail,
            }),
            artifact_dir,
            names(),
        )
    }

    #[test]
    fn staged_image_key_uses_photos_prefix() {
        let staged = StagedImage::from_local("/tmp/stage/pic.jpg");
        assert_eq!(staged.key, "photos/pic.jpg");
        assert_eq!(staged.basename(), "pic.jpg");
    }

    #[tokio::test]
    async fn successful_run_assembles_summary() {
        let dir = temp_dir();
        let orch = orchestrator(&dir, Some("1 0.5 0.5 0.2 0.2\n2 0.1 0.1 0.1 0.1\n"), false);
        let staged = StagedImage::from_local(dir.join("pic.jpg"));

        let summary = orch.predict(&staged).await.expect("predict");
        assert_eq!(summary.original_key, "photos/pic.jpg");
        assert_eq!(summary.predicted_key, "predicted/pic.jpg");
        assert_ne!(summary.predicted_key, summary.original_key);
        assert_eq!(summary.detections.len(), 2);
        assert_eq!(summary.detections[0].class, "dog");
        assert_eq!(summary.detections[1].class, "cat");
        assert!(!summary.prediction_id.is_empty());
    }

    #[tokio::test]
    async fn prediction_ids_are_unique_per_run() {
        let dir = temp_dir();
        let orch = orchestrator(&dir, Some(""), false);
        let staged = StagedImage::from_local(dir.join("pic.jpg"));
        let a = orch.predict(&staged).await.expect("first");
        let b = orch.predict(&staged).await.expect("second");
        assert_ne!(a.prediction_id, b.prediction_id);
    }

    #[tokio::test]
    async fn empty_artifact_is_a_zero_detection_success() {
        let dir = temp_dir();
        let orch = orchestrator(&dir, Some(""), false);
        let staged = StagedImage::from_local(dir.join("pic.jpg"));
        let summary = orch.predict(&staged).await.expect("predict");
        assert!(summary.detections.is_empty());
    }

    #[tokio::test]
    async fn detector_failure_maps_to_invocation() {
        let dir = temp_dir();
        let orch = orchestrator(&dir, None, true);
        let staged = StagedImage::from_local(dir.join("pic.jpg"));
        let err = orch.predict(&staged).await.unwrap_err();
        assert!(matches!(err, PredictError::Invocation(_)));
    }

    #[tokio::test]
    async fn missing_artifact_maps_to_not_found() {
        let dir = temp_dir();
        let orch = orchestrator(&dir, None, false);
        let staged = StagedImage::from_local(dir.join("pic.jpg"));
        let err = orch.predict(&staged).await.unwrap_err();
        assert!(matches!(err, PredictError::NotFound { .. }));
    }

    #[tokio::test]
    async fn bad_labels_map_to_parse_error() {
        let dir = temp_dir();
        let orch = orchestrator(&dir, Some("99 0.5 0.5 0.2 0.2\n"), false);
        let staged = StagedImage::from_local(dir.join("pic.jpg"));
        let err = orch.predict(&staged).await.unwrap_err();
        assert!(matches!(err, PredictError::Parse { .. }));
    }
}
