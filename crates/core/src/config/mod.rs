mod backup;
mod legacy;

use log::{error, warn};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::GenerationStep;

pub use backup::{backup_config, list_backups, restore_backup, BackupEntry, BACKUP_MARKER};
pub use legacy::{migrate_legacy_config, MigrationOutcome};

pub const CONFIG_FILE_NAME: &str = "config.json";

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_timeout() -> u64 {
    600
}

fn default_embedding_retrieval_k() -> u32 {
    4
}

fn default_embedding_timeout() -> u64 {
    60
}

fn default_proxy_url() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("项目 '{0}' 已存在")]
    ProjectExists(String),
    #[error("项目 '{0}' 不存在")]
    ProjectNotFound(String),
    #[error("项目名称 '{name}' 无效：{reason}")]
    InvalidProjectName { name: String, reason: &'static str },
    #[error("备份文件不存在: {0}")]
    BackupNotFound(PathBuf),
}

impl ConfigError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn parse(path: &Path, source: serde_json::Error) -> Self {
        ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Credentials and sampling parameters for one text provider.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProviderProfile {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout", rename = "timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub interface_format: String,
}

impl Default for ProviderProfile {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            model_name: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout(),
            interface_format: String::new(),
        }
    }
}

impl ProviderProfile {
    pub fn new(
        interface_format: impl Into<String>,
        base_url: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            interface_format: interface_format.into(),
            base_url: base_url.into(),
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    /// Request timeout, never shorter than one second.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn is_meaningful(&self) -> bool {
        !(self.api_key.is_empty()
            && self.base_url.is_empty()
            && self.interface_format.is_empty()
            && self.model_name.is_empty())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbeddingProfile {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_embedding_retrieval_k")]
    pub retrieval_k: u32,
    #[serde(default = "default_embedding_timeout", rename = "timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub interface_format: String,
}

impl Default for EmbeddingProfile {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            model_name: String::new(),
            retrieval_k: default_embedding_retrieval_k(),
            timeout_secs: default_embedding_timeout(),
            interface_format: String::new(),
        }
    }
}

impl EmbeddingProfile {
    pub fn new(
        interface_format: impl Into<String>,
        base_url: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            interface_format: interface_format.into(),
            base_url: base_url.into(),
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    /// Request timeout, never shorter than one second.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn is_meaningful(&self) -> bool {
        !(self.api_key.is_empty()
            && self.base_url.is_empty()
            && self.interface_format.is_empty()
            && self.model_name.is_empty())
    }
}

/// Novel parameters. The global copy is the template new projects start from.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NovelParams {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub num_chapters: u32,
    #[serde(default)]
    pub word_number: u32,
    #[serde(default)]
    pub writing_style: String,
    #[serde(default)]
    pub user_guidance: String,
    #[serde(default)]
    pub characters_involved: String,
    #[serde(default)]
    pub key_items: String,
    #[serde(default)]
    pub scene_location: String,
    #[serde(default)]
    pub time_constraint: String,
    #[serde(default)]
    pub filepath: String,
}

impl NovelParams {
    pub const FIELD_NAMES: [&'static str; 11] = [
        "topic",
        "genre",
        "num_chapters",
        "word_number",
        "writing_style",
        "user_guidance",
        "characters_involved",
        "key_items",
        "scene_location",
        "time_constraint",
        "filepath",
    ];

    pub fn builtin() -> Self {
        Self {
            genre: "玄幻".to_string(),
            num_chapters: 100,
            word_number: 3000,
            ..Self::default()
        }
    }
}

/// Provider profile chosen for each pipeline role, by profile name.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChosenProviders {
    #[serde(default)]
    pub prompt_draft_llm: String,
    #[serde(default)]
    pub chapter_outline_llm: String,
    #[serde(default)]
    pub architecture_llm: String,
    #[serde(default)]
    pub final_chapter_llm: String,
    #[serde(default)]
    pub consistency_review_llm: String,
}

impl ChosenProviders {
    pub fn for_step(&self, step: GenerationStep) -> Option<&str> {
        let name = match step {
            GenerationStep::None => return None,
            GenerationStep::Architecture => &self.architecture_llm,
            GenerationStep::Blueprint => &self.chapter_outline_llm,
            GenerationStep::Draft => &self.prompt_draft_llm,
            GenerationStep::Final => &self.final_chapter_llm,
        };
        let trimmed = name.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    pub fn set_for_step(&mut self, step: GenerationStep, name: impl Into<String>) {
        let slot = match step {
            GenerationStep::None => return,
            GenerationStep::Architecture => &mut self.architecture_llm,
            GenerationStep::Blueprint => &mut self.chapter_outline_llm,
            GenerationStep::Draft => &mut self.prompt_draft_llm,
            GenerationStep::Final => &mut self.final_chapter_llm,
        };
        *slot = name.into();
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(port) => Ok(port),
        Value::Number(port) => Ok(port.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(de::Error::custom(format!("invalid proxy_port: {other}"))),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxySetting {
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    #[serde(default, deserialize_with = "deserialize_port")]
    pub proxy_port: String,
    #[serde(default)]
    pub enabled: bool,
}

impl Default for ProxySetting {
    fn default() -> Self {
        Self {
            proxy_url: default_proxy_url(),
            proxy_port: String::new(),
            enabled: false,
        }
    }
}

/// Network settings handed to every adapter at construction time.
///
/// Derived once per configuration load; adapters never read proxy
/// environment variables on their own.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    proxy: Option<String>,
}

impl NetworkConfig {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn with_proxy(url: impl Into<String>) -> Self {
        Self {
            proxy: Some(url.into()),
        }
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }
}

impl From<&ProxySetting> for NetworkConfig {
    fn from(setting: &ProxySetting) -> Self {
        let host = setting.proxy_url.trim().trim_end_matches('/');
        if !setting.enabled || host.is_empty() {
            return Self::direct();
        }

        let base = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        let port = setting.proxy_port.trim();
        if port.is_empty() {
            Self::with_proxy(base)
        } else {
            Self::with_proxy(format!("{base}:{port}"))
        }
    }
}

const MODERN_KEYS: [&str; 8] = [
    "llm_configs",
    "embedding_configs",
    "default_novel_params",
    "choose_configs",
    "proxy_setting",
    "last_interface_format",
    "last_embedding_interface_format",
    "other_params",
];

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    #[serde(default)]
    pub last_interface_format: String,
    #[serde(default)]
    pub last_embedding_interface_format: String,
    #[serde(default)]
    pub llm_configs: BTreeMap<String, ProviderProfile>,
    #[serde(default)]
    pub embedding_configs: BTreeMap<String, EmbeddingProfile>,
    #[serde(default)]
    pub default_novel_params: NovelParams,
    #[serde(default)]
    pub choose_configs: ChosenProviders,
    #[serde(default)]
    pub proxy_setting: ProxySetting,
    /// Keys this version does not model, kept so a save never drops them.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl GlobalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration written on first run.
    pub fn builtin() -> Self {
        let mut config = Self::default();

        let mut deepseek =
            ProviderProfile::new("OpenAI", "https://api.deepseek.com/v1", "deepseek-chat");
        deepseek.max_tokens = 8192;
        let mut gpt = ProviderProfile::new("OpenAI", "https://api.openai.com/v1", "gpt-5");
        gpt.max_tokens = 32768;
        let mut gemini = ProviderProfile::new(
            "OpenAI",
            "https://generativelanguage.googleapis.com/v1beta/openai",
            "gemini-2.5-pro",
        );
        gemini.max_tokens = 32768;

        config.upsert_llm_profile("DeepSeek V3", deepseek);
        config.upsert_llm_profile("GPT 5", gpt);
        config.upsert_llm_profile("Gemini 2.5 Pro", gemini);
        config.upsert_embedding_profile(
            "OpenAI",
            EmbeddingProfile::new("OpenAI", "https://api.openai.com/v1", "text-embedding-ada-002"),
        );

        config.last_interface_format = "DeepSeek V3".to_string();
        config.last_embedding_interface_format = "OpenAI".to_string();
        config.default_novel_params = NovelParams::builtin();
        config.choose_configs = ChosenProviders {
            prompt_draft_llm: "DeepSeek V3".to_string(),
            chapter_outline_llm: "DeepSeek V3".to_string(),
            architecture_llm: "Gemini 2.5 Pro".to_string(),
            final_chapter_llm: "GPT 5".to_string(),
            consistency_review_llm: "DeepSeek V3".to_string(),
        };
        config.proxy_setting = ProxySetting::default();
        config
    }

    /// True for the placeholder returned when a config file could not be read.
    pub fn is_empty(&self) -> bool {
        self.llm_configs.is_empty() && self.embedding_configs.is_empty()
    }

    pub fn get_llm_profile(&self, name: &str) -> Option<&ProviderProfile> {
        self.llm_configs.get(name)
    }

    pub fn upsert_llm_profile<S: Into<String>>(&mut self, name: S, profile: ProviderProfile) {
        self.llm_configs.insert(name.into(), profile);
    }

    pub fn remove_llm_profile(&mut self, name: &str) -> Option<ProviderProfile> {
        self.llm_configs.remove(name)
    }

    pub fn primary_llm_profile(&self) -> Option<(&String, &ProviderProfile)> {
        self.llm_configs.iter().next()
    }

    pub fn get_embedding_profile(&self, name: &str) -> Option<&EmbeddingProfile> {
        self.embedding_configs.get(name)
    }

    pub fn upsert_embedding_profile<S: Into<String>>(&mut self, name: S, profile: EmbeddingProfile) {
        self.embedding_configs.insert(name.into(), profile);
    }

    pub fn remove_embedding_profile(&mut self, name: &str) -> Option<EmbeddingProfile> {
        self.embedding_configs.remove(name)
    }

    pub fn primary_embedding_profile(&self) -> Option<(&String, &EmbeddingProfile)> {
        self.embedding_configs.iter().next()
    }

    /// Profile assigned to `step`, falling back to the first profile by name
    /// when the assignment is missing or dangling.
    pub fn provider_for_step(&self, step: GenerationStep) -> Option<(&str, &ProviderProfile)> {
        if let Some(name) = self.choose_configs.for_step(step) {
            if let Some((key, profile)) = self.llm_configs.get_key_value(name) {
                return Some((key.as_str(), profile));
            }
            warn!("profile `{name}` chosen for step {step} does not exist, using the first available profile");
        }
        self.primary_llm_profile()
            .map(|(name, profile)| (name.as_str(), profile))
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig::from(&self.proxy_setting)
    }

    pub fn from_json_str(input: &str) -> Result<Self, serde_json::Error> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }

        let value: Value = serde_json::from_str(input)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let modern = MODERN_KEYS.iter().any(|key| value.get(key).is_some());
        if modern || value.as_object().is_some_and(|map| map.is_empty()) {
            serde_json::from_value(value)
        } else {
            let legacy: legacy::FlatConfig = serde_json::from_value(value)?;
            Ok(legacy.into_global())
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::io(path, source))?;
        Self::from_json_str(&data).map_err(|source| ConfigError::parse(path, source))
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        write_json_atomic(path, self)
    }
}

/// Loads the global configuration.
///
/// A missing file is replaced by [`GlobalConfig::builtin`], which is also
/// written to `path`. An unreadable file yields an empty configuration and
/// is left untouched on disk.
pub fn load_global(path: &Path) -> GlobalConfig {
    if !path.exists() {
        let config = GlobalConfig::builtin();
        if !save_global(&config, path) {
            warn!(
                "default configuration could not be written to {}",
                path.display()
            );
        }
        return config;
    }

    match GlobalConfig::from_path(path) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}; continuing with an empty configuration");
            GlobalConfig::default()
        }
    }
}

pub fn save_global(config: &GlobalConfig, path: &Path) -> bool {
    match config.to_path(path) {
        Ok(()) => true,
        Err(err) => {
            error!("failed to save configuration: {err}");
            false
        }
    }
}

/// Pretty-prints `value` with four-space indentation and writes it
/// atomically to `path`.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), ConfigError> {
    let mut buffer = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value.serialize(&mut serializer)?;
    buffer.push(b'\n');
    write_atomic(path, &buffer)
}

/// Writes into a sibling temp file, then renames it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::io(parent, source))?;
        }
    }

    let mut temp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    fs::write(&temp_path, contents).map_err(|source| ConfigError::io(&temp_path, source))?;
    if let Err(source) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(ConfigError::io(path, source));
    }
    Ok(())
}

/// Owner of the global configuration file for the running process.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: GlobalConfig,
}

impl ConfigStore {
    /// Opens `path` with [`load_global`] semantics.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = load_global(&path);
        if config.is_empty() {
            warn!(
                "{} holds no provider profiles; configure one before generating",
                path.display()
            );
        }
        Self { path, config }
    }

    /// Strict load that reports missing or corrupt files.
    pub fn load(path: impl AsRef<Path>) -> Result<GlobalConfig, ConfigError> {
        GlobalConfig::from_path(path.as_ref())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut GlobalConfig {
        &mut self.config
    }

    pub fn reload(&mut self) {
        self.config = load_global(&self.path);
    }

    pub fn save(&self) -> bool {
        save_global(&self.config, &self.path)
    }

    pub fn network_config(&self) -> NetworkConfig {
        self.config.network_config()
    }

    pub fn touch_llm_interface<S: Into<String>>(&mut self, name: S) {
        self.config.last_interface_format = name.into();
    }

    pub fn touch_embedding_interface<S: Into<String>>(&mut self, name: S) {
        self.config.last_embedding_interface_format = name.into();
    }

    pub fn last_llm_interface(&self) -> Option<&str> {
        let name = self.config.last_interface_format.as_str();
        self.config.llm_configs.get(name).map(|_| name)
    }

    pub fn last_embedding_interface(&self) -> Option<&str> {
        let name = self.config.last_embedding_interface_format.as_str();
        self.config.embedding_configs.get(name).map(|_| name)
    }

    pub fn ensure_recent_defaults(&mut self) {
        if !self
            .config
            .llm_configs
            .contains_key(&self.config.last_interface_format)
        {
            if let Some(next) = self.config.llm_configs.keys().next().cloned() {
                self.config.last_interface_format = next;
            }
        }

        if !self
            .config
            .embedding_configs
            .contains_key(&self.config.last_embedding_interface_format)
        {
            if let Some(next) = self.config.embedding_configs.keys().next().cloned() {
                self.config.last_embedding_interface_format = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_current_config() {
        let json = r#"{
            "last_interface_format": "DeepSeek V3",
            "last_embedding_interface_format": "OpenAI",
            "llm_configs": {
                "DeepSeek V3": {
                    "api_key": "sk-1",
                    "base_url": "https://api.deepseek.com/v1",
                    "model_name": "deepseek-chat",
                    "temperature": 0.7,
                    "max_tokens": 8192,
                    "timeout": 600,
                    "interface_format": "OpenAI"
                }
            },
            "embedding_configs": {
                "OpenAI": {
                    "api_key": "",
                    "base_url": "https://api.openai.com/v1",
                    "model_name": "text-embedding-ada-002",
                    "retrieval_k": 4,
                    "interface_format": "OpenAI"
                }
            },
            "default_novel_params": {"genre": "玄幻", "num_chapters": 100, "word_number": 3000},
            "choose_configs": {"architecture_llm": "DeepSeek V3"},
            "proxy_setting": {"proxy_url": "127.0.0.1", "proxy_port": 7890, "enabled": true},
            "webdav_config": {"webdav_url": "https://dav.example.com"}
        }"#;

        let config = GlobalConfig::from_json_str(json).unwrap();
        assert_eq!(config.llm_configs.len(), 1);
        let embedding = config.get_embedding_profile("OpenAI").unwrap();
        assert_eq!(embedding.timeout(), Duration::from_secs(60));
        assert_eq!(config.default_novel_params.num_chapters, 100);
        assert_eq!(config.proxy_setting.proxy_port, "7890");
        assert!(config.extra.contains_key("webdav_config"));
        assert_eq!(
            config.network_config().proxy(),
            Some("http://127.0.0.1:7890")
        );
    }

    #[test]
    fn embedding_timeout_is_read_from_the_profile() {
        let profile: EmbeddingProfile =
            serde_json::from_str(r#"{"interface_format": "Ollama", "timeout": 5}"#).unwrap();
        assert_eq!(profile.timeout_secs, 5);
        assert_eq!(profile.timeout(), Duration::from_secs(5));

        let zero = EmbeddingProfile {
            timeout_secs: 0,
            ..EmbeddingProfile::default()
        };
        assert_eq!(zero.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        let json = r#"{"llm_configs": {}, "webdav_config": {"webdav_username": "me"}}"#;
        fs::write(&path, json).unwrap();

        let config = GlobalConfig::from_path(&path).unwrap();
        assert!(save_global(&config, &path));
        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["webdav_config"]["webdav_username"], "me");
    }

    #[test]
    fn absent_config_bootstraps_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);

        let config = load_global(&path);
        assert_eq!(config, GlobalConfig::builtin());
        assert!(path.exists());

        let reloaded = GlobalConfig::from_path(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn load_global_is_idempotent() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);

        let first = load_global(&path);
        let written = fs::read_to_string(&path).unwrap();
        let second = load_global(&path);
        assert_eq!(first, second);
        assert_eq!(written, fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn corrupt_config_yields_empty_and_keeps_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "{ not json").unwrap();

        let config = load_global(&path);
        assert!(config.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
        assert!(matches!(
            ConfigStore::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn save_reports_failure_instead_of_panicking() {
        let temp = tempdir().unwrap();
        let blocker = temp.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let path = blocker.join(CONFIG_FILE_NAME);
        assert!(!save_global(&GlobalConfig::builtin(), &path));
    }

    #[test]
    fn saved_file_uses_four_space_indent() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        assert!(save_global(&GlobalConfig::builtin(), &path));
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n    \"default_novel_params\""));
        assert!(text.contains("玄幻"));
        assert!(!temp.path().join("config.json.tmp").exists());
    }

    #[test]
    fn step_provider_falls_back_to_first_profile() {
        let mut config = GlobalConfig::builtin();
        let (name, _) = config.provider_for_step(GenerationStep::Architecture).unwrap();
        assert_eq!(name, "Gemini 2.5 Pro");

        config.choose_configs.architecture_llm = "Missing".to_string();
        let (name, _) = config.provider_for_step(GenerationStep::Architecture).unwrap();
        assert_eq!(name, "DeepSeek V3");

        config.llm_configs.clear();
        assert!(config.provider_for_step(GenerationStep::Architecture).is_none());
    }

    #[test]
    fn disabled_proxy_means_direct_connection() {
        let setting = ProxySetting {
            proxy_url: "10.0.0.1".into(),
            proxy_port: "8080".into(),
            enabled: false,
        };
        assert_eq!(NetworkConfig::from(&setting), NetworkConfig::direct());

        let enabled = ProxySetting {
            enabled: true,
            ..setting
        };
        assert_eq!(
            NetworkConfig::from(&enabled).proxy(),
            Some("http://10.0.0.1:8080")
        );
    }

    #[test]
    fn store_persists_touched_interfaces() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);

        let mut store = ConfigStore::open(path.clone());
        store
            .config_mut()
            .upsert_llm_profile("local", ProviderProfile::new("Ollama", "", "qwen2"));
        store.touch_llm_interface("local");
        assert!(store.save());

        let store = ConfigStore::open(path);
        assert_eq!(store.last_llm_interface(), Some("local"));
    }

    #[test]
    fn ensure_recent_defaults_repairs_dangling_names() {
        let temp = tempdir().unwrap();
        let mut store = ConfigStore::open(temp.path().join(CONFIG_FILE_NAME));
        store.touch_llm_interface("gone");
        store.touch_embedding_interface("gone");
        store.ensure_recent_defaults();
        assert_eq!(store.last_llm_interface(), Some("DeepSeek V3"));
        assert_eq!(store.last_embedding_interface(), Some("OpenAI"));
    }
}
