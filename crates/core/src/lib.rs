pub mod config;
pub mod embedding;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod project;

pub use config::{
    backup_config, list_backups, load_global, migrate_legacy_config, restore_backup, save_global,
    BackupEntry, ChosenProviders, ConfigError, ConfigStore, EmbeddingProfile, GlobalConfig,
    MigrationOutcome, NetworkConfig, NovelParams, ProviderProfile, ProxySetting,
    CONFIG_FILE_NAME,
};
pub use embedding::{EmbeddingModel, EmbeddingModelError};
pub use logging::{
    CallbackLogSink, LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, StdoutLogSink,
    VecLogSink,
};
pub use model::{LanguageModel, LanguageModelError};
pub use pipeline::{
    GenerationPipeline, GenerationState, GenerationStep, PipelineError, StepOutcome, StepRequest,
    TransitionError,
};
pub use project::{
    load_project, save_project, ActiveProject, NovelInfo, ProjectConfig, ProjectRegistry,
    ProjectSummary, DEFAULT_PROJECT_NAME, PROJECT_CONFIG_FILE_NAME,
};
