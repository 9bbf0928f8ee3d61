//! Config file and input file loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use scout_core::{LeadInput, ModelConfig, ModelSnapshot, import_snapshot};
use serde::Deserialize;

/// `--config`, else `SCOUT_CONFIG`, else none.
pub fn resolve_config_path(flag: Option<&Path>) -> Option<PathBuf> {
    flag.map(Path::to_path_buf)
        .or_else(|| std::env::var("SCOUT_CONFIG").ok().map(PathBuf::from))
}

/// Model configuration from a TOML file, or defaults when no file is given.
pub fn load_model_config(path: Option<&Path>) -> Result<ModelConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            toml::from_str::<ModelConfig>(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => ModelConfig::default(),
    };
    config.validate().context("invalid model config")?;
    Ok(config)
}

pub fn load_snapshot(path: &Path) -> Result<ModelSnapshot> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model {}", path.display()))?;
    let snapshot = import_snapshot(&json).with_context(|| format!("failed to load model {}", path.display()))?;
    tracing::info!(path = %path.display(), "loaded snapshot");
    Ok(snapshot)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

/// A lead file holds either one lead object or an array of them.
pub fn load_leads(path: &Path) -> Result<Vec<LeadInput>> {
    load_json_list(path)
}

/// Lead plus its observed outcome, for quantization evaluation.
#[derive(Deserialize)]
pub struct LabelledLead {
    #[serde(flatten)]
    pub lead: LeadInput,
    pub converted: bool,
}

pub fn load_labelled(path: &Path) -> Result<Vec<LabelledLead>> {
    load_json_list(path)
}

fn load_json_list<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: OneOrMany<T> =
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(match parsed {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![item],
    })
}
