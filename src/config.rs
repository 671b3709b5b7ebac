//! Adapter settings.
//!
//! Sources, later ones win: built-in defaults, the TOML config file, base64 encoded JSON
//! parameters given on the command line, and finally per-session launch keys.

use crate::session::format::{DisplayFormat, ShowDisassembly};
use crate::session::formatters::ProviderSpec;
use anyhow::{bail, Context};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdapterSettings {
    pub display_format: DisplayFormat,
    pub show_disassembly: ShowDisassembly,
    /// Languages for exception breakpoints.
    pub source_languages: Vec<String>,
    /// Port of an extension channel server to connect to.
    pub extension_port: Option<u16>,
    pub synthetic_providers: Vec<ProviderSpec>,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            display_format: DisplayFormat::default(),
            show_disassembly: ShowDisassembly::default(),
            source_languages: crate::lang::default_languages(),
            extension_port: None,
            synthetic_providers: vec![],
        }
    }
}

impl AdapterSettings {
    /// `~/.config/stalker-dap/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        home::home_dir().map(|home| {
            home.join(".config")
                .join("stalker-dap")
                .join("config.toml")
        })
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parse config file {}", path.display()))
    }

    /// Override settings with the keys of a base64 encoded JSON object.
    pub fn merge_encoded_params(&mut self, encoded: &str) -> anyhow::Result<()> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("decode adapter parameters")?;
        let params: Value = serde_json::from_slice(&raw).context("parse adapter parameters")?;
        self.merge_json(&params)
    }

    pub fn merge_json(&mut self, params: &Value) -> anyhow::Result<()> {
        let Value::Object(params) = params else {
            bail!("adapter parameters must be a JSON object");
        };
        let mut current = serde_json::to_value(&*self)?;
        if let Value::Object(current) = &mut current {
            for (key, value) in params {
                current.insert(key.clone(), value.clone());
            }
        }
        *self = serde_json::from_value(current).context("apply adapter parameters")?;
        Ok(())
    }

    /// Settings from an explicit config file (must exist) or the default one (optional),
    /// overridden by encoded parameters.
    pub fn load(config: Option<&Path>, params: Option<&str>) -> anyhow::Result<Self> {
        let mut settings = match config {
            Some(path) => Self::from_toml_file(path)?,
            None => match Self::default_config_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_toml_file(&path)?,
                None => Self::default(),
            },
        };
        if let Some(params) = params {
            settings.merge_encoded_params(params)?;
        }
        Ok(settings)
    }
}

/// Decode a base64 encoded UTF-8 string (log path passed through shells).
pub fn decode_b64_string(encoded: &str) -> anyhow::Result<String> {
    let raw = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    Ok(String::from_utf8(raw)?)
}
