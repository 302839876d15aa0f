//! Prediction record persistence: the `RecordStore` capability and the
//! best-effort summary writer.
//!
//! Records are telemetry, not part of the user-visible contract: a failed
//! write is logged and reported upward, never allowed to block the reply.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use crate::predict::PredictionSummary;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("encoding record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("writing record: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only document store for prediction summaries.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert one summary; returns the new record id.
    async fn insert(&self, summary: &PredictionSummary) -> Result<String, RecordError>;
}

/// JSON-lines file store: one serialized record per line, append-only.
#[derive(Clone)]
pub struct JsonlRecordStore {
    path: PathBuf,
}

#[derive(serde::Serialize)]
struct RecordLine<'a> {
    record_id: &'a str,
    #[serde(flatten)]
    summary: &'a PredictionSummary,
}

impl JsonlRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordStore for JsonlRecordStore {
    async fn insert(&self, summary: &PredictionSummary) -> Result<String, RecordError> {
        let record_id = format!("rec-{}", uuid::Uuid::new_v4());
        let mut line = serde_json::to_string(&RecordLine {
            record_id: &record_id,
            summary,
        })?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, line.as_bytes()).await?;
        Ok(record_id)
    }
}

/// Persist a summary, tolerating failure. Returns the record id when the
/// write succeeded so callers can log it.
pub async fn persist_summary(
    store: &dyn RecordStore,
    summary: &PredictionSummary,
) -> Option<String> {
    match store.insert(summary).await {
        Ok(record_id) => {
            log::info!(
                "prediction {} persisted as {}",
                summary.prediction_id,
                record_id
            );
            Some(record_id)
        }
        Err(e) => {
            log::warn!(
                "prediction {} not persisted: {}",
                summary.prediction_id,
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Detection;

    fn sample_summary() -> PredictionSummary {
        PredictionSummary {
            prediction_id: "p-1".to_string(),
            original_key: "photos/a.jpg".to_string(),
            predicted_key: "predicted/a.jpg".to_string(),
            detections: vec![Detection {
                class: "dog".to_string(),
                cx: 0.5,
                cy: 0.5,
                width: 0.1,
                height: 0.1,
            }],
            created_at: chrono::Utc::now(),
        }
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("lookout-records-test-{}", uuid::Uuid::new_v4()))
            .join("predictions.jsonl")
    }

    #[tokio::test]
    async fn insert_appends_one_line_per_record() {
        let path = temp_path();
        let store = JsonlRecordStore::new(&path);
        let id1 = store.insert(&sample_summary()).await.expect("insert");
        let id2 = store.insert(&sample_summary()).await.expect("insert");
        assert_ne!(id1, id2);
        assert!(id1.starts_with("rec-"));

        let contents = std::fs::read_to_string(&path).expect("read back");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(first.get("record_id").and_then(|v| v.as_str()), Some(id1.as_str()));
        assert_eq!(
            first.get("original_key").and_then(|v| v.as_str()),
            Some("photos/a.jpg")
        );
        assert_eq!(
            first
                .get("detections")
                .and_then(|v| v.as_array())
                .map(|a| a.len()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn persist_summary_swallows_write_failure() {
        // Point the store at a path whose parent is a file so the write fails.
        let base = std::env::temp_dir().join(format!("lookout-records-bad-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&base).expect("mkdir");
        let blocker = base.join("blocker");
        std::fs::write(&blocker, b"x").expect("write blocker");
        let store = JsonlRecordStore::new(blocker.join("predictions.jsonl"));
        assert!(persist_summary(&store, &sample_summary()).await.is_none());
    }
}
