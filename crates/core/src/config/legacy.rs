use log::info;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use super::{
    backup_config, default_embedding_retrieval_k, default_max_tokens, default_temperature,
    default_timeout, write_json_atomic, ConfigError, EmbeddingProfile, GlobalConfig, NovelParams,
    ProviderProfile,
};

const FALLBACK_PROFILE_NAME: &str = "default";

/// Single-profile layout from before named profiles existed: one text
/// provider and one embedding provider stored as top-level keys.
#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct FlatConfig {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    interface_format: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    embedding_api_key: Option<String>,
    #[serde(default)]
    embedding_interface_format: Option<String>,
    #[serde(default)]
    embedding_url: Option<String>,
    #[serde(default)]
    embedding_model_name: Option<String>,
    #[serde(default)]
    embedding_retrieval_k: Option<u32>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    genre: Option<String>,
    #[serde(default)]
    num_chapters: Option<u32>,
    #[serde(default)]
    word_number: Option<u32>,
    #[serde(default)]
    filepath: Option<String>,
}

fn profile_name(format: Option<&String>) -> String {
    format
        .map(|format| format.trim())
        .filter(|format| !format.is_empty())
        .unwrap_or(FALLBACK_PROFILE_NAME)
        .to_string()
}

impl FlatConfig {
    fn has_text_profile(&self) -> bool {
        self.api_key.is_some()
            || self.base_url.is_some()
            || self.interface_format.is_some()
            || self.model_name.is_some()
            || self.temperature.is_some()
            || self.max_tokens.is_some()
            || self.timeout.is_some()
    }

    fn embedding_format(&self) -> Option<&String> {
        self.embedding_interface_format
            .as_ref()
            .or(self.interface_format.as_ref())
    }

    fn has_embedding_profile(&self) -> bool {
        self.embedding_api_key.is_some()
            || self.embedding_url.is_some()
            || self.embedding_format().is_some()
            || self.embedding_model_name.is_some()
            || self.embedding_retrieval_k.is_some()
    }

    pub(super) fn into_global(self) -> GlobalConfig {
        let mut config = GlobalConfig::default();

        if self.has_text_profile() {
            let name = profile_name(self.interface_format.as_ref());
            let profile = ProviderProfile {
                api_key: self.api_key.clone().unwrap_or_default(),
                base_url: self.base_url.clone().unwrap_or_default(),
                model_name: self.model_name.clone().unwrap_or_default(),
                temperature: self.temperature.unwrap_or_else(default_temperature),
                max_tokens: self.max_tokens.unwrap_or_else(default_max_tokens),
                timeout_secs: self.timeout.unwrap_or_else(default_timeout),
                interface_format: self.interface_format.clone().unwrap_or_else(|| name.clone()),
            };
            config.last_interface_format = name.clone();
            config.upsert_llm_profile(name, profile);
        }

        if self.has_embedding_profile() {
            let name = profile_name(self.embedding_format());
            let profile = EmbeddingProfile {
                api_key: self.embedding_api_key.clone().unwrap_or_default(),
                base_url: self.embedding_url.clone().unwrap_or_default(),
                model_name: self.embedding_model_name.clone().unwrap_or_default(),
                retrieval_k: self
                    .embedding_retrieval_k
                    .unwrap_or_else(default_embedding_retrieval_k),
                interface_format: self.embedding_format().cloned().unwrap_or_else(|| name.clone()),
                ..EmbeddingProfile::default()
            };
            config.last_embedding_interface_format = name.clone();
            config.upsert_embedding_profile(name, profile);
        }

        config.default_novel_params = NovelParams {
            topic: self.topic.unwrap_or_default(),
            genre: self.genre.unwrap_or_default(),
            num_chapters: self.num_chapters.unwrap_or_default(),
            word_number: self.word_number.unwrap_or_default(),
            filepath: self.filepath.unwrap_or_default(),
            ..NovelParams::default()
        };

        config
    }
}

/// Result of [`migrate_legacy_config`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Backup taken before rewriting, `None` when nothing needed migrating.
    pub backup: Option<PathBuf>,
    /// Keys copied from `other_params` into `default_novel_params`.
    pub carried_keys: Vec<String>,
}

impl MigrationOutcome {
    pub fn migrated(&self) -> bool {
        self.backup.is_some()
    }
}

/// Folds a leftover `other_params` block into `default_novel_params`.
///
/// Only keys that name a novel parameter are carried over; `filepath` is
/// project specific and never copied into the template. Files without
/// `other_params` are left untouched, so running this twice is a no-op.
pub fn migrate_legacy_config(path: &Path) -> Result<MigrationOutcome, ConfigError> {
    if !path.exists() {
        return Ok(MigrationOutcome::default());
    }

    let data = fs::read_to_string(path).map_err(|source| ConfigError::io(path, source))?;
    let mut root: Value =
        serde_json::from_str(&data).map_err(|source| ConfigError::parse(path, source))?;

    let Some(object) = root.as_object_mut() else {
        return Ok(MigrationOutcome::default());
    };
    let Some(other_params) = object.remove("other_params") else {
        return Ok(MigrationOutcome::default());
    };

    let mut carried_keys = Vec::new();
    if let Value::Object(other_params) = other_params {
        let defaults = object
            .entry("default_novel_params")
            .or_insert_with(|| Value::Object(Map::new()));
        if !defaults.is_object() {
            *defaults = Value::Object(Map::new());
        }
        if let Value::Object(defaults) = defaults {
            for (key, value) in other_params {
                if key == "filepath" || !NovelParams::FIELD_NAMES.contains(&key.as_str()) {
                    continue;
                }
                defaults.insert(key.clone(), value);
                carried_keys.push(key);
            }
        }
    }

    // Validate before touching the file.
    let migrated =
        GlobalConfig::from_value(root).map_err(|source| ConfigError::parse(path, source))?;

    let backup = backup_config(path)?;
    write_json_atomic(path, &migrated)?;
    info!(
        "migrated other_params in {} ({} keys), backup at {}",
        path.display(),
        carried_keys.len(),
        backup.display()
    );

    Ok(MigrationOutcome {
        backup: Some(backup),
        carried_keys,
    })
}
