//! Initialize the configuration directory: create ~/.lookout, a default
//! config, the staging directory, and the bundled class manifest.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::labels::BUNDLED_COCO_MANIFEST;

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with `{}` if missing.
/// - Creates the `staging` subdirectory.
/// - Writes the bundled COCO manifest to `coco.yaml` if missing.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, b"{}")
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let staging = config_dir.join("staging");
    if !staging.exists() {
        std::fs::create_dir_all(&staging)
            .with_context(|| format!("creating staging directory {}", staging.display()))?;
        log::info!("created staging directory at {}", staging.display());
    }

    let manifest = config_dir.join("coco.yaml");
    if !manifest.exists() {
        std::fs::write(&manifest, BUNDLED_COCO_MANIFEST)
            .with_context(|| format!("writing class manifest to {}", manifest.display()))?;
        log::info!("wrote bundled class manifest to {}", manifest.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_config_staging_and_manifest() {
        let dir = std::env::temp_dir().join(format!("lookout-init-test-{}", uuid::Uuid::new_v4()));
        let config_path = dir.join("config.json");

        let out = init_config_dir(&config_path).expect("init");
        assert_eq!(out, dir);
        assert_eq!(std::fs::read_to_string(&config_path).expect("config"), "{}");
        assert!(dir.join("staging").is_dir());
        let names = crate::labels::load_class_names(&dir.join("coco.yaml")).expect("manifest");
        assert_eq!(names.len(), 80);
    }

    #[test]
    fn init_is_idempotent_and_preserves_edits() {
        let dir = std::env::temp_dir().join(format!("lookout-init-test-{}", uuid::Uuid::new_v4()));
        let config_path = dir.join("config.json");
        init_config_dir(&config_path).expect("first init");
        std::fs::write(&config_path, r#"{"gateway":{"port":9999}}"#).expect("edit config");

        init_config_dir(&config_path).expect("second init");
        assert!(std::fs::read_to_string(&config_path)
            .expect("config")
            .contains("9999"));
    }
}
