//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.lookout/config.json`) and environment.
//! Secrets and deployment-specific values (bot token, bucket, detector URL) can be
//! overridden via env so containers don't need a config file edit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Webhook/health server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Channel settings (Telegram).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Detection service settings.
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Object storage settings (originals and annotated images).
    #[serde(default)]
    pub storage: StorageConfig,

    /// Prediction record persistence.
    #[serde(default)]
    pub records: RecordsConfig,
}

/// Bind address and port for the HTTP server (health + Telegram webhook).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 8443).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    8443
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Per-channel config (Telegram only for now).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// When set, use webhook mode: Telegram POSTs updates to this URL. If unset, long-poll getUpdates is used.
    pub webhook_url: Option<String>,
    /// Optional secret for webhook verification (X-Telegram-Bot-Api-Secret-Token). Used only when webhook_url is set.
    pub webhook_secret: Option<String>,
    /// Path to an animation (GIF) sent as a "processing" placeholder while a photo is analyzed. Skipped when unset.
    pub loading_animation: Option<PathBuf>,
}

/// Detection service config (the yolo-style HTTP sidecar).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorConfig {
    /// Base URL of the detection service (e.g. "http://detector:8081"). Overridden by DETECTOR_URL env.
    pub base_url: Option<String>,

    /// Request timeout for a single detection call, in seconds (default 60; inference is slow on CPU).
    #[serde(default = "default_detector_timeout_secs")]
    pub timeout_secs: u64,

    /// Root directory where the detector writes artifacts, laid out as
    /// `<artifactDir>/<prediction id>/<image>` and `<artifactDir>/<prediction id>/labels/<stem>.txt`.
    /// Shared volume between bot and detector. Default "artifacts".
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Path to the class-name manifest (YAML with a `names` entry). When unset,
    /// the bundled COCO manifest in the config directory is used.
    pub class_manifest: Option<PathBuf>,
}

fn default_detector_timeout_secs() -> u64 {
    60
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_detector_timeout_secs(),
            artifact_dir: default_artifact_dir(),
            class_manifest: None,
        }
    }
}

/// Which blob store backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// S3-compatible HTTP gateway (PUT/GET `{endpoint}/{bucket}/{key}`).
    #[default]
    Http,
    /// Local directory tree (single-host deployments and tests).
    Fs,
}

/// Object storage config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,

    /// HTTP gateway endpoint (e.g. "http://minio:9000"). Required for kind = "http".
    pub endpoint: Option<String>,

    /// Bucket holding `photos/` and `predicted/` objects. Overridden by BUCKET_NAME env.
    pub bucket: Option<String>,

    /// Timeout for a single put/get, in seconds (default 30).
    #[serde(default = "default_storage_timeout_secs")]
    pub timeout_secs: u64,

    /// Root for kind = "fs" (default "blobs").
    #[serde(default = "default_fs_root")]
    pub fs_root: PathBuf,

    /// Local staging directory bridging Telegram file downloads and the blob store.
    /// Default: `staging` subdirectory of the config directory.
    pub staging_dir: Option<PathBuf>,
}

fn default_storage_timeout_secs() -> u64 {
    30
}

fn default_fs_root() -> PathBuf {
    PathBuf::from("blobs")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            endpoint: None,
            bucket: None,
            timeout_secs: default_storage_timeout_secs(),
            fs_root: default_fs_root(),
            staging_dir: None,
        }
    }
}

/// Prediction record persistence (append-only JSON lines).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsConfig {
    /// Path of the records file (default `predictions.jsonl` in the config directory).
    pub path: Option<PathBuf>,
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    env_nonempty("TELEGRAM_BOT_TOKEN").or_else(|| {
        config
            .channels
            .telegram
            .bot_token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the bucket name: env BUCKET_NAME overrides config.
pub fn resolve_bucket(config: &Config) -> Option<String> {
    env_nonempty("BUCKET_NAME").or_else(|| {
        config
            .storage
            .bucket
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the detector base URL: env DETECTOR_URL overrides config.
pub fn resolve_detector_url(config: &Config) -> Option<String> {
    env_nonempty("DETECTOR_URL").or_else(|| {
        config
            .detector
            .base_url
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("LOOKOUT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".lookout").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Parent directory of the config file (config directory).
pub fn config_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf()
}

/// Resolve the staging directory: config override or `staging` under the config directory.
pub fn resolve_staging_dir(config: &Config, config_path: &Path) -> PathBuf {
    match &config.storage.staging_dir {
        Some(d) if !d.as_os_str().is_empty() => d.clone(),
        _ => config_dir(config_path).join("staging"),
    }
}

/// Resolve the records file path: config override or `predictions.jsonl` under the config directory.
pub fn resolve_records_path(config: &Config, config_path: &Path) -> PathBuf {
    match &config.records.path {
        Some(p) if !p.as_os_str().is_empty() => p.clone(),
        _ => config_dir(config_path).join("predictions.jsonl"),
    }
}

/// Resolve the class manifest path: config override or `coco.yaml` under the config directory.
pub fn resolve_class_manifest(config: &Config, config_path: &Path) -> PathBuf {
    match &config.detector.class_manifest {
        Some(p) if !p.as_os_str().is_empty() => p.clone(),
        _ => config_dir(config_path).join("coco.yaml"),
    }
}

/// Load config from the default path (or LOOKOUT_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 8443);
        assert_eq!(g.bind, "127.0.0.1");
    }

    #[test]
    fn default_timeouts() {
        let c = Config::default();
        assert_eq!(c.detector.timeout_secs, 60);
        assert_eq!(c.storage.timeout_secs, 30);
    }

    #[test]
    fn resolve_staging_dir_default() {
        let config = Config::default();
        let path = Path::new("/home/user/.lookout/config.json");
        assert_eq!(
            resolve_staging_dir(&config, path),
            PathBuf::from("/home/user/.lookout/staging")
        );
    }

    #[test]
    fn resolve_staging_dir_override() {
        let mut config = Config::default();
        config.storage.staging_dir = Some(PathBuf::from("/tmp/stage"));
        let path = Path::new("/home/user/.lookout/config.json");
        assert_eq!(resolve_staging_dir(&config, path), PathBuf::from("/tmp/stage"));
    }

    #[test]
    fn resolve_records_path_default() {
        let config = Config::default();
        let path = Path::new("/home/user/.lookout/config.json");
        assert_eq!(
            resolve_records_path(&config, path),
            PathBuf::from("/home/user/.lookout/predictions.jsonl")
        );
    }

    #[test]
    fn parses_camel_case_config() {
        let json = r#"{
            "gateway": { "port": 9000, "bind": "0.0.0.0" },
            "channels": { "telegram": { "botToken": "t", "webhookUrl": "https://x/telegram/webhook" } },
            "detector": { "baseUrl": "http://detector:8081", "timeoutSecs": 10 },
            "storage": { "kind": "fs", "bucket": "images", "fsRoot": "/var/blobs" }
        }"#;
        let c: Config = serde_json::from_str(json).expect("parse");
        assert_eq!(c.gateway.port, 9000);
        assert_eq!(c.channels.telegram.bot_token.as_deref(), Some("t"));
        assert_eq!(c.detector.timeout_secs, 10);
        assert_eq!(c.storage.kind, StorageKind::Fs);
        assert_eq!(c.storage.fs_root, PathBuf::from("/var/blobs"));
    }
}
