//! Label artifact parsing and the class-name manifest.
//!
//! The detector writes one text line per recognized object:
//! `<class index> <cx> <cy> <width> <height> [confidence ...]`, all geometry
//! normalized to [0,1]. The manifest maps class indices to human-readable names.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// One recognized object with a resolved class name and a normalized box.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class: String,
    pub cx: f64,
    pub cy: f64,
    pub width: f64,
    pub height: f64,
}

/// Why a label artifact could not be parsed. Any bad line fails the whole
/// artifact; callers never see a partial detection list.
#[derive(Debug, Error)]
pub enum LabelParseError {
    #[error("line {line}: expected at least 5 fields, got {got}")]
    MissingFields { line: usize, got: usize },

    #[error("line {line}: invalid {field} value {value:?}")]
    BadNumber {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("line {line}: class index {index} out of range (manifest has {known} names)")]
    UnknownClass {
        line: usize,
        index: usize,
        known: usize,
    },
}

fn parse_fraction(
    token: &str,
    line: usize,
    field: &'static str,
) -> Result<f64, LabelParseError> {
    token.parse::<f64>().map_err(|_| LabelParseError::BadNumber {
        line,
        field,
        value: token.to_string(),
    })
}

/// Parse a raw label artifact into detections, resolving class indices
/// against `names`. Blank lines are skipped; an empty artifact is a valid
/// zero-detection result. Extra trailing tokens (e.g. confidence) are ignored.
pub fn parse_labels(raw: &str, names: &[String]) -> Result<Vec<Detection>, LabelParseError> {
    let mut out = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line_no = idx + 1;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 5 {
            return Err(LabelParseError::MissingFields {
                line: line_no,
                got: fields.len(),
            });
        }
        let class_index: usize =
            fields[0]
                .parse()
                .map_err(|_| LabelParseError::BadNumber {
                    line: line_no,
                    field: "class index",
                    value: fields[0].to_string(),
                })?;
        let class = names
            .get(class_index)
            .ok_or(LabelParseError::UnknownClass {
                line: line_no,
                index: class_index,
                known: names.len(),
            })?
            .clone();
        out.push(Detection {
            class,
            cx: parse_fraction(fields[1], line_no, "cx")?,
            cy: parse_fraction(fields[2], line_no, "cy")?,
            width: parse_fraction(fields[3], line_no, "width")?,
            height: parse_fraction(fields[4], line_no, "height")?,
        });
    }
    Ok(out)
}

/// Bundled COCO manifest, written to the config directory by `lookout init`.
pub const BUNDLED_COCO_MANIFEST: &str = include_str!("../config/coco.yaml");

/// Load the class-name manifest: YAML with a `names` entry, either a sequence
/// (`names: [person, bicycle, ...]`) or an integer-keyed map
/// (`names: {0: person, 1: bicycle, ...}`) — YOLO data files use both forms.
pub fn load_class_names(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading class manifest from {}", path.display()))?;
    parse_class_names(&raw).with_context(|| format!("parsing class manifest {}", path.display()))
}

/// Class names from the bundled COCO manifest (fallback when no manifest file
/// has been written yet).
pub fn bundled_class_names() -> Result<Vec<String>> {
    parse_class_names(BUNDLED_COCO_MANIFEST)
}

fn parse_class_names(raw: &str) -> Result<Vec<String>> {
    let doc: serde_yaml::Value = serde_yaml::from_str(raw).context("invalid YAML")?;
    let names = doc
        .get("names")
        .context("manifest has no `names` entry")?;
    match names {
        serde_yaml::Value::Sequence(seq) => seq
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_str()
                    .map(String::from)
                    .with_context(|| format!("names[{}] is not a string", i))
            })
            .collect(),
        serde_yaml::Value::Mapping(map) => {
            let mut indexed: Vec<(usize, String)> = Vec::with_capacity(map.len());
            for (k, v) in map {
                let index = k
                    .as_u64()
                    .with_context(|| format!("names key {:?} is not an integer", k))?
                    as usize;
                let name = v
                    .as_str()
                    .map(String::from)
                    .with_context(|| format!("names[{}] is not a string", index))?;
                indexed.push((index, name));
            }
            indexed.sort_by_key(|(i, _)| *i);
            // Indices must be dense starting at 0: artifact lines index into this table.
            for (pos, (i, _)) in indexed.iter().enumerate() {
                anyhow::ensure!(
                    pos == *i,
                    "names map is not dense: expected index {}, found {}",
                    pos,
                    i
                );
            }
            Ok(indexed.into_iter().map(|(_, n)| n).collect())
        }
        _ => anyhow::bail!("`names` must be a sequence or map"),
    }
}
