//! Conversation controller: one state machine per inbound message.
//!
//! Text is echoed, unknown content gets a fixed notice, and photos run the
//! full pipeline: fetch from Telegram → stage in the blob store → detect →
//! persist summary → reply with class counts and the annotated image. Every
//! branch terminates with the user informed; storage and record failures
//! degrade instead of crashing the run.

use std::path::PathBuf;
use std::sync::Arc;

use crate::channels::{InboundMessage, MessageKind, Messenger, PhotoAttachment};
use crate::labels::Detection;
use crate::predict::{PredictError, PredictionOrchestrator, StagedImage};
use crate::records::{persist_summary, RecordStore};
use crate::storage::{download_to_file, upload_file, BlobStore};

const TEXT_REPLY_PREFIX: &str = "Your original message: ";
const UNSUPPORTED_REPLY: &str = "Unsupported message type.";
const SUMMARY_HEADER: &str = "Detected Objects:\n";

const RETRIEVE_FAILED_REPLY: &str =
    "Could not retrieve your photo from Telegram, please send it again.";
const UPLOAD_FAILED_REPLY: &str = "Failed to upload your image to storage.";
const DETECTOR_UNAVAILABLE_REPLY: &str =
    "The detection service is unavailable right now, please try again later.";
const NO_RESULT_REPLY: &str =
    "The detection service produced no result for this image. It may be corrupted or in an unsupported format.";
const UNREADABLE_RESULT_REPLY: &str =
    "The detection result could not be read, please try again.";

/// Deployment-specific knobs the controller needs.
#[derive(Debug, Clone)]
pub struct BotSettings {
    /// Bucket holding `photos/` and `predicted/` objects.
    pub bucket: String,
    /// Local staging directory for attachment downloads.
    pub staging_dir: PathBuf,
    /// Optional "processing" animation; skipped when unset.
    pub loading_animation: Option<PathBuf>,
}

/// The photo-analysis bot. All collaborators are injected so tests can
/// substitute fakes.
pub struct DetectionBot {
    messenger: Arc<dyn Messenger>,
    blob_store: Arc<dyn BlobStore>,
    orchestrator: PredictionOrchestrator,
    record_store: Arc<dyn RecordStore>,
    settings: BotSettings,
}

/// Count detections per class name in first-appearance order and render
/// `"<class>: <count>"` lines under the fixed header.
pub fn format_summary(detections: &[Detection]) -> String {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for d in detections {
        match counts.iter_mut().find(|(name, _)| *name == d.class) {
            Some((_, n)) => *n += 1,
            None => counts.push((&d.class, 1)),
        }
    }
    let mut out = String::from(SUMMARY_HEADER);
    for (name, n) in counts {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(&n.to_string());
        out.push('\n');
    }
    out
}

/// User-facing reply for each terminal orchestration failure; wording is
/// distinct per kind so failures are tellable apart in the chat.
fn predict_failure_reply(err: &PredictError) -> &'static str {
    match err {
        PredictError::Invocation(_) => DETECTOR_UNAVAILABLE_REPLY,
        PredictError::NotFound { .. } => NO_RESULT_REPLY,
        PredictError::Parse { .. } | PredictError::ArtifactRead { .. } => UNREADABLE_RESULT_REPLY,
    }
}

impl DetectionBot {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        blob_store: Arc<dyn BlobStore>,
        orchestrator: PredictionOrchestrator,
        record_store: Arc<dyn RecordStore>,
        settings: BotSettings,
    ) -> Self {
        Self {
            messenger,
            blob_store,
            orchestrator,
            record_store,
            settings,
        }
    }

    /// Handle one inbound message to completion. Delivery failures are logged,
    /// not retried: the conversation may have gone away mid-pipeline.
    pub async fn handle_message(&self, msg: InboundMessage) {
        match msg.kind {
            MessageKind::Text(ref text) => {
                let reply = format!("{}{}", TEXT_REPLY_PREFIX, text);
                self.reply_text(&msg.conversation_id, &reply).await;
            }
            MessageKind::Photo(ref attachment) => {
                self.run_photo_pipeline(&msg.conversation_id, attachment)
                    .await;
            }
            MessageKind::Other => {
                self.reply_text(&msg.conversation_id, UNSUPPORTED_REPLY).await;
            }
        }
    }

    async fn reply_text(&self, conversation_id: &str, text: &str) {
        if let Err(e) = self.messenger.send_text(conversation_id, text).await {
            log::warn!("send_text to {} failed: {}", conversation_id, e);
        }
    }

    /// Send the optional loading animation. Purely cosmetic: failure is
    /// logged and the pipeline continues without a placeholder.
    async fn acquire_placeholder(&self, conversation_id: &str) -> Option<i64> {
        let animation = self.settings.loading_animation.as_ref()?;
        match self
            .messenger
            .send_placeholder(conversation_id, animation)
            .await
        {
            Ok(message_id) => Some(message_id),
            Err(e) => {
                log::debug!("placeholder not sent: {}", e);
                None
            }
        }
    }

    /// Release the placeholder if one was acquired. Called on every pipeline
    /// exit after acquisition.
    async fn release_placeholder(&self, conversation_id: &str, placeholder: Option<i64>) {
        if let Some(message_id) = placeholder {
            if let Err(e) = self
                .messenger
                .delete_placeholder(conversation_id, message_id)
                .await
            {
                log::debug!("placeholder not deleted: {}", e);
            }
        }
    }

    async fn run_photo_pipeline(&self, conversation_id: &str, attachment: &PhotoAttachment) {
        let local = match self
            .messenger
            .fetch_attachment(attachment, &self.settings.staging_dir)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                log::warn!("attachment retrieval failed: {}", e);
                self.reply_text(conversation_id, RETRIEVE_FAILED_REPLY).await;
                return;
            }
        };
        let staged = StagedImage::from_local(local);

        let placeholder = self.acquire_placeholder(conversation_id).await;

        if let Err(e) = upload_file(
            self.blob_store.as_ref(),
            &staged.local_path,
            &self.settings.bucket,
            &staged.key,
        )
        .await
        {
            log::warn!("upload of {} failed: {}", staged.key, e);
            self.release_placeholder(conversation_id, placeholder).await;
            self.reply_text(conversation_id, UPLOAD_FAILED_REPLY).await;
            return;
        }

        let summary = match self.orchestrator.predict(&staged).await {
            Ok(summary) => summary,
            Err(e) => {
                log::warn!("prediction failed for {}: {}", staged.key, e);
                self.release_placeholder(conversation_id, placeholder).await;
                self.reply_text(conversation_id, predict_failure_reply(&e))
                    .await;
                return;
            }
        };
        self.release_placeholder(conversation_id, placeholder).await;

        // Best-effort telemetry; never withholds the reply.
        persist_summary(self.record_store.as_ref(), &summary).await;

        self.reply_text(conversation_id, &format_summary(&summary.detections))
            .await;

        // Annotated image is a bonus on top of the text summary: a failed
        // download is partial success, not a pipeline failure.
        if let Err(e) = download_to_file(
            self.blob_store.as_ref(),
            &self.settings.bucket,
            &summary.predicted_key,
            &staged.local_path,
        )
        .await
        {
            log::warn!(
                "annotated image {} not retrieved, text summary only: {}",
                summary.predicted_key,
                e
            );
            return;
        }
        if let Err(e) = self
            .messenger
            .send_photo(conversation_id, &staged.local_path)
            .await
        {
            log::warn!("send_photo to {} failed: {}", conversation_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{Detector, DetectorError, DetectorReply};
    use crate::records::RecordError;
    use crate::storage::BlobError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    const ORIGINAL_BYTES: &[u8] = b"original-jpeg";
    const ANNOTATED_BYTES: &[u8] = b"annotated-jpeg";

    struct FakeMessenger {
        texts: Mutex<Vec<String>>,
        photos: Mutex<Vec<Vec<u8>>>,
        placeholders_sent: AtomicI64,
        placeholders_deleted: Mutex<Vec<i64>>,
        fail_fetch: bool,
    }

    impl FakeMessenger {
        fn new(fail_fetch: bool) -> Self {
            Self {
                texts: Mutex::new(Vec::new()),
                photos: Mutex::new(Vec::new()),
                placeholders_sent: AtomicI64::new(0),
                placeholders_deleted: Mutex::new(Vec::new()),
                fail_fetch,
            }
        }

        fn texts(&self) -> Vec<String> {
            self.texts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Messenger for FakeMessenger {
        async fn send_text(&self, _conversation_id: &str, text: &str) -> Result<(), String> {
            self.texts.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_photo(&self, _conversation_id: &str, image: &Path) -> Result<(), String> {
            let bytes = std::fs::read(image).map_err(|e| e.to_string())?;
            self.photos.lock().unwrap().push(bytes);
            Ok(())
        }

        async fn send_placeholder(
            &self,
            _conversation_id: &str,
            _animation: &Path,
        ) -> Result<i64, String> {
            Ok(self.placeholders_sent.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn delete_placeholder(
            &self,
            _conversation_id: &str,
            message_id: i64,
        ) -> Result<(), String> {
            self.placeholders_deleted.lock().unwrap().push(message_id);
            Ok(())
        }

        async fn fetch_attachment(
            &self,
            _attachment: &PhotoAttachment,
            staging_dir: &Path,
        ) -> Result<PathBuf, String> {
            if self.fail_fetch {
                return Err("getFile failed: 400".to_string());
            }
            std::fs::create_dir_all(staging_dir).map_err(|e| e.to_string())?;
            let local = staging_dir.join("pic.jpg");
            std::fs::write(&local, ORIGINAL_BYTES).map_err(|e| e.to_string())?;
            Ok(local)
        }
    }

    struct MemBlobStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        fail_put: bool,
    }

    impl MemBlobStore {
        fn new(fail_put: bool) -> Self {
            Self {
                objects: Mutex::new(HashMap::new()),
                fail_put,
            }
        }

        fn seed(&self, bucket: &str, key: &str, bytes: &[u8]) {
            self.objects
                .lock()
                .unwrap()
                .insert(format!("{}/{}", bucket, key), bytes.to_vec());
        }

        fn contains(&self, bucket: &str, key: &str) -> bool {
            self.objects
                .lock()
                .unwrap()
                .contains_key(&format!("{}/{}", bucket, key))
        }
    }

    #[async_trait]
    impl BlobStore for MemBlobStore {
        async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
            if self.fail_put {
                return Err(BlobError::Api("PUT: 403 forbidden".to_string()));
            }
            self.objects
                .lock()
                .unwrap()
                .insert(format!("{}/{}", bucket, key), bytes);
            Ok(())
        }

        async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
            self.objects
                .lock()
                .unwrap()
                .get(&format!("{}/{}", bucket, key))
                .cloned()
                .ok_or_else(|| BlobError::Api(format!("GET {}/{}: 404", bucket, key)))
        }
    }

    /// Writes a canned label artifact into the run's namespace, like the real
    /// service; `None` labels simulate a run that produced no output.
    struct FakeDetector {
        artifact_dir: PathBuf,
        labels: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Detector for FakeDetector {
        async fn detect(
            &self,
            prediction_id: &str,
            image_key: &str,
        ) -> Result<DetectorReply, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
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

    struct MemRecordStore {
        inserted: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RecordStore for MemRecordStore {
        async fn insert(
            &self,
            _summary: &crate::predict::PredictionSummary,
        ) -> Result<String, RecordError> {
            if self.fail {
                return Err(RecordError::Io(std::io::Error::other("disk full")));
            }
            self.inserted.fetch_add(1, Ordering::SeqCst);
            Ok("rec-test".to_string())
        }
    }

    struct Harness {
        messenger: Arc<FakeMessenger>,
        blob_store: Arc<MemBlobStore>,
        detector: Arc<FakeDetector>,
        records: Arc<MemRecordStore>,
        bot: DetectionBot,
    }

    fn names() -> Vec<String> {
        vec!["person".to_string(), "dog".to_string(), "cat".to_string()]
    }

    fn harness(
        labels: Option<&str>,
        fail_fetch: bool,
        fail_put: bool,
        fail_records: bool,
    ) -> Harness {
        let root = std::env::temp_dir().join(format!("lookout-bot-test-{}", uuid::Uuid::new_v4()));
        let artifact_dir = root.join("artifacts");
        std::fs::create_dir_all(&artifact_dir).expect("create artifact dir");

        let messenger = Arc::new(FakeMessenger::new(fail_fetch));
        let blob_store = Arc::new(MemBlobStore::new(fail_put));
        let detector = Arc::new(FakeDetector {
            artifact_dir: artifact_dir.clone(),
            labels: labels.map(String::from),
            calls: AtomicUsize::new(0),
        });
        let records = Arc::new(MemRecordStore {
            inserted: AtomicUsize::new(0),
            fail: fail_records,
        });
        let bot = DetectionBot::new(
            messenger.clone(),
            blob_store.clone(),
            PredictionOrchestrator::new(detector.clone(), artifact_dir, names()),
            records.clone(),
            BotSettings {
                bucket: "images".to_string(),
                staging_dir: root.join("staging"),
                loading_animation: Some(PathBuf::from("loading.gif")),
            },
        );
        Harness {
            messenger,
            blob_store,
            detector,
            records,
            bot,
        }
    }

    fn photo_message() -> InboundMessage {
        InboundMessage {
            channel_id: "telegram".to_string(),
            conversation_id: "42".to_string(),
            kind: MessageKind::Photo(PhotoAttachment {
                file_id: "f".to_string(),
            }),
        }
    }

    #[test]
    fn summary_counts_in_first_appearance_order() {
        let d = |class: &str| Detection {
            class: class.to_string(),
            cx: 0.5,
            cy: 0.5,
            width: 0.1,
            height: 0.1,
        };
        assert_eq!(
            format_summary(&[d("dog"), d("dog"), d("cat")]),
            "Detected Objects:\ndog: 2\ncat: 1\n"
        );
        assert_eq!(format_summary(&[]), "Detected Objects:\n");
    }

    #[tokio::test]
    async fn text_message_is_echoed() {
        let h = harness(None, false, false, false);
        h.bot
            .handle_message(InboundMessage {
                channel_id: "telegram".to_string(),
                conversation_id: "42".to_string(),
                kind: MessageKind::Text("hello".to_string()),
            })
            .await;
        assert_eq!(h.messenger.texts(), vec!["Your original message: hello"]);
    }

    #[tokio::test]
    async fn unknown_content_gets_unsupported_notice() {
        let h = harness(None, false, false, false);
        h.bot
            .handle_message(InboundMessage {
                channel_id: "telegram".to_string(),
                conversation_id: "42".to_string(),
                kind: MessageKind::Other,
            })
            .await;
        assert_eq!(h.messenger.texts(), vec!["Unsupported message type."]);
    }

    #[tokio::test]
    async fn photo_pipeline_end_to_end() {
        let h = harness(
            Some("1 0.1 0.1 0.1 0.1\n1 0.2 0.2 0.1 0.1\n2 0.3 0.3 0.1 0.1\n"),
            false,
            false,
            false,
        );
        h.blob_store.seed("images", "predicted/pic.jpg", ANNOTATED_BYTES);

        h.bot.handle_message(photo_message()).await;

        assert_eq!(h.messenger.texts(), vec!["Detected Objects:\ndog: 2\ncat: 1\n"]);
        assert_eq!(
            h.messenger.photos.lock().unwrap().as_slice(),
            &[ANNOTATED_BYTES.to_vec()]
        );
        assert!(h.blob_store.contains("images", "photos/pic.jpg"));
        assert_eq!(h.records.inserted.load(Ordering::SeqCst), 1);
        // Placeholder was sent once and deleted once.
        assert_eq!(h.messenger.placeholders_sent.load(Ordering::SeqCst), 1);
        assert_eq!(h.messenger.placeholders_deleted.lock().unwrap().as_slice(), &[1]);
    }

    #[tokio::test]
    async fn fetch_failure_replies_without_uploading() {
        let h = harness(None, true, false, false);
        h.bot.handle_message(photo_message()).await;
        assert_eq!(h.messenger.texts(), vec![RETRIEVE_FAILED_REPLY]);
        assert!(!h.blob_store.contains("images", "photos/pic.jpg"));
        assert_eq!(h.detector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upload_failure_skips_detector_and_clears_placeholder() {
        let h = harness(Some(""), false, true, false);
        h.bot.handle_message(photo_message()).await;

        assert_eq!(h.messenger.texts(), vec![UPLOAD_FAILED_REPLY]);
        assert_eq!(h.detector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.messenger.placeholders_deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_detector_output_gets_its_own_reply() {
        let h = harness(None, false, false, false);
        h.bot.handle_message(photo_message()).await;

        let texts = h.messenger.texts();
        assert_eq!(texts, vec![NO_RESULT_REPLY]);
        assert_ne!(texts[0], UPLOAD_FAILED_REPLY);
        assert_eq!(h.messenger.placeholders_deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn record_failure_still_delivers_summary_and_photo() {
        let h = harness(Some("2 0.3 0.3 0.1 0.1\n"), false, false, true);
        h.blob_store.seed("images", "predicted/pic.jpg", ANNOTATED_BYTES);

        h.bot.handle_message(photo_message()).await;

        assert_eq!(h.messenger.texts(), vec!["Detected Objects:\ncat: 1\n"]);
        assert_eq!(h.messenger.photos.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_annotated_image_degrades_to_text_only() {
        // No predicted/ object seeded: download fails, summary still goes out.
        let h = harness(Some("0 0.3 0.3 0.1 0.1\n"), false, false, false);
        h.bot.handle_message(photo_message()).await;

        assert_eq!(h.messenger.texts(), vec!["Detected Objects:\nperson: 1\n"]);
        assert!(h.messenger.photos.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_detections_is_a_valid_summary() {
        let h = harness(Some(""), false, false, false);
        h.blob_store.seed("images", "predicted/pic.jpg", ANNOTATED_BYTES);
        h.bot.handle_message(photo_message()).await;
        assert_eq!(h.messenger.texts(), vec!["Detected Objects:\n"]);
    }
}
