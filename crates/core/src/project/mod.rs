mod registry;

use chrono::{Local, NaiveDateTime, SubsecRound, TimeDelta};
use log::error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{write_json_atomic, ConfigError, NovelParams};
use crate::pipeline::GenerationState;

pub use registry::{
    validate_project_name, ActiveProject, ProjectRegistry, ProjectSummary, DEFAULT_PROJECT_NAME,
    PROJECTS_DIR_NAME,
};

pub const PROJECT_CONFIG_FILE_NAME: &str = "novel_config.json";

/// Naive local timestamps in ISO-8601 with microseconds. Empty or missing
/// values read as `None`.
mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

    pub fn serialize<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(value) => serializer.serialize_str(&value.format(FORMAT).to_string()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(raw.parse::<NaiveDateTime>().ok())
    }
}

pub(crate) fn now() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(6)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NovelInfo {
    #[serde(default)]
    pub title: String,
    #[serde(default, with = "timestamp")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, with = "timestamp")]
    pub last_modified: Option<NaiveDateTime>,
}

/// Contents of `novel_config.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    #[serde(default)]
    pub novel_info: NovelInfo,
    #[serde(default)]
    pub novel_params: NovelParams,
    #[serde(default)]
    pub generation_state: GenerationState,
}

impl ProjectConfig {
    /// Fresh project seeded from the global parameter template.
    pub fn new(title: impl Into<String>, defaults: &NovelParams, project_path: &Path) -> Self {
        let stamp = now();
        let mut novel_params = defaults.clone();
        novel_params.filepath = project_path.to_string_lossy().into_owned();
        Self {
            novel_info: NovelInfo {
                title: title.into(),
                created_at: Some(stamp),
                last_modified: Some(stamp),
            },
            novel_params,
            generation_state: GenerationState::default(),
        }
    }

    pub fn title(&self) -> &str {
        &self.novel_info.title
    }

    /// Refreshes `last_modified`, always moving it forward.
    pub fn touch(&mut self) {
        let mut stamp = now();
        if let Some(previous) = self.novel_info.last_modified {
            if stamp <= previous {
                stamp = previous + TimeDelta::microseconds(1);
            }
        }
        self.novel_info.last_modified = Some(stamp);
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::io(path, source))?;
        let mut config: Self =
            serde_json::from_str(&data).map_err(|source| ConfigError::parse(path, source))?;
        config.generation_state.normalize();
        Ok(config)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        write_json_atomic(path, self)
    }
}

pub fn project_config_path(project_path: &Path) -> PathBuf {
    project_path.join(PROJECT_CONFIG_FILE_NAME)
}

fn directory_title(project_path: &Path) -> String {
    project_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Loads a project's configuration.
///
/// A directory without `novel_config.json` gets one synthesized from
/// `defaults`, titled after the directory, and persisted. A file that exists
/// but does not parse is a [`ConfigError::Parse`].
pub fn load_project(project_path: &Path, defaults: &NovelParams) -> Result<ProjectConfig, ConfigError> {
    let path = project_config_path(project_path);
    if path.exists() {
        return ProjectConfig::from_path(&path);
    }

    let config = ProjectConfig::new(directory_title(project_path), defaults, project_path);
    config.to_path(&path)?;
    Ok(config)
}

/// Stamps `last_modified` and writes the project configuration. Failures
/// are logged and reported as `false`.
pub fn save_project(project_path: &Path, config: &mut ProjectConfig) -> bool {
    match try_save_project(project_path, config) {
        Ok(()) => true,
        Err(err) => {
            error!("保存项目配置失败: {err}");
            false
        }
    }
}

pub fn try_save_project(project_path: &Path, config: &mut ProjectConfig) -> Result<(), ConfigError> {
    config.touch();
    config.to_path(&project_config_path(project_path))
}
