//! HTTP server (health + Telegram webhook) and inbound message dispatch.
//!
//! Inbound messages — webhook POSTs or long-poll updates — land on an mpsc
//! queue; the dispatcher spawns one task per message so pipelines for
//! distinct messages run concurrently while each run stays sequential.

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bot::{BotSettings, DetectionBot};
use crate::channels::{inbound_from_update, InboundMessage, TelegramChannel, TelegramUpdate};
use crate::config::{self, Config, StorageKind};
use crate::detector::HttpDetector;
use crate::labels;
use crate::predict::PredictionOrchestrator;
use crate::records::JsonlRecordStore;
use crate::storage::{BlobStore, FsBlobStore, HttpBlobStore};

const DEFAULT_DETECTOR_URL: &str = "http://127.0.0.1:8081";
const DEFAULT_BUCKET: &str = "images";

/// Shared state for the HTTP handlers.
#[derive(Clone)]
struct ServerState {
    config: Arc<Config>,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

fn build_blob_store(config: &Config) -> Result<Arc<dyn BlobStore>> {
    let timeout = Duration::from_secs(config.storage.timeout_secs);
    match config.storage.kind {
        StorageKind::Http => {
            let endpoint = config
                .storage
                .endpoint
                .as_deref()
                .context("storage.kind is \"http\" but storage.endpoint is not set")?;
            Ok(Arc::new(
                HttpBlobStore::new(endpoint, timeout).context("building blob store client")?,
            ))
        }
        StorageKind::Fs => Ok(Arc::new(FsBlobStore::new(config.storage.fs_root.clone()))),
    }
}

fn load_class_names(config: &Config, config_path: &std::path::Path) -> Result<Vec<String>> {
    let manifest = config::resolve_class_manifest(config, config_path);
    if manifest.exists() {
        labels::load_class_names(&manifest)
    } else {
        log::info!(
            "class manifest {} not found, using bundled COCO names",
            manifest.display()
        );
        labels::bundled_class_names()
    }
}

/// Build the bot from config: Telegram messenger, blob store, detector client,
/// record store. Returns the bot and the Telegram channel (for the poll loop
/// and webhook management).
fn build_bot(
    config: &Config,
    config_path: &std::path::Path,
) -> Result<(Arc<DetectionBot>, Arc<TelegramChannel>)> {
    let telegram = Arc::new(TelegramChannel::new(config::resolve_telegram_token(config)));

    let blob_store = build_blob_store(config)?;
    let class_names = load_class_names(config, config_path)?;

    let detector_url =
        config::resolve_detector_url(config).unwrap_or_else(|| DEFAULT_DETECTOR_URL.to_string());
    let detector = HttpDetector::new(
        &detector_url,
        Duration::from_secs(config.detector.timeout_secs),
    )
    .context("building detector client")?;
    let orchestrator = PredictionOrchestrator::new(
        Arc::new(detector),
        config.detector.artifact_dir.clone(),
        class_names,
    );

    let record_store = JsonlRecordStore::new(config::resolve_records_path(config, config_path));

    let bucket = config::resolve_bucket(config).unwrap_or_else(|| {
        log::warn!("no bucket configured (storage.bucket or BUCKET_NAME), using \"{}\"", DEFAULT_BUCKET);
        DEFAULT_BUCKET.to_string()
    });
    let settings = BotSettings {
        bucket,
        staging_dir: config::resolve_staging_dir(config, config_path),
        loading_animation: config.channels.telegram.loading_animation.clone(),
    };

    let bot = Arc::new(DetectionBot::new(
        telegram.clone(),
        blob_store,
        orchestrator,
        Arc::new(record_store),
        settings,
    ));
    Ok((bot, telegram))
}

/// Run the server; binds to config.gateway.bind:config.gateway.port.
/// Blocks until shutdown (Ctrl+C or SIGTERM).
pub async fn run_server(config: Config, config_path: PathBuf) -> Result<()> {
    let (bot, telegram) = build_bot(&config, &config_path)?;

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundMessage>(64);

    // Dispatcher: one task per message, so a slow detection run never blocks
    // the next user's photo.
    {
        let bot = bot.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound_rx.recv().await {
                let bot = bot.clone();
                tokio::spawn(async move {
                    bot.handle_message(msg).await;
                });
            }
        });
    }

    let has_token = config::resolve_telegram_token(&config).is_some();
    let webhook_url = config.channels.telegram.webhook_url.clone();
    let mut poll_task: Option<JoinHandle<()>> = None;
    let mut webhook_channel: Option<Arc<TelegramChannel>> = None;
    if has_token {
        if let Some(ref url) = webhook_url {
            let secret = config.channels.telegram.webhook_secret.as_deref();
            if let Err(e) = telegram.set_webhook(url, secret).await {
                log::warn!("telegram set_webhook failed: {}", e);
            } else {
                log::info!("telegram channel registered (webhook mode): {}", url);
            }
            webhook_channel = Some(telegram.clone());
        } else {
            // Clear any stale webhook so long polling works.
            if let Err(e) = telegram.delete_webhook().await {
                log::debug!("telegram delete_webhook before polling: {}", e);
            }
            poll_task = Some(telegram.clone().start_inbound(inbound_tx.clone()));
            log::info!("telegram channel registered and getUpdates loop started");
        }
    } else {
        log::warn!("no telegram bot token configured; serving health endpoint only");
    }

    let state = ServerState {
        config: Arc::new(config.clone()),
        inbound_tx,
    };
    let app = Router::new()
        .route("/", get(health_http))
        .route("/telegram/webhook", post(telegram_webhook))
        .with_state(state);

    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("lookout listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(telegram, poll_task, webhook_channel))
        .await
        .context("server exited")?;
    log::info!("server stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Stops the poll loop, removes the Telegram webhook if used, then awaits the
/// in-process channel task.
async fn shutdown_signal(
    telegram: Arc<TelegramChannel>,
    poll_task: Option<JoinHandle<()>>,
    webhook_channel: Option<Arc<TelegramChannel>>,
) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping channels");

    telegram.stop();

    if let Some(t) = webhook_channel {
        if let Err(e) = t.delete_webhook().await {
            log::debug!("telegram delete_webhook on shutdown: {}", e);
        }
    }

    if let Some(h) = poll_task {
        let _ = h.await;
    }
    log::info!("channel tasks finished");
}

/// POST /telegram/webhook — receives Telegram update JSON; verifies optional
/// secret, pushes an InboundMessage.
async fn telegram_webhook(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(ref expected) = state.config.channels.telegram.webhook_secret {
        let provided = headers
            .get("X-Telegram-Bot-Api-Secret-Token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected.as_str() {
            return StatusCode::FORBIDDEN;
        }
    }
    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    let Some(inbound) = inbound_from_update(&update) else {
        return StatusCode::OK;
    };
    if state.inbound_tx.send(inbound).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
    }))
}
