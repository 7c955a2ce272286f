mod state;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::{LanguageModel, LanguageModelError};
use crate::project::{try_save_project, ActiveProject};

pub use state::{GenerationState, GenerationStep, TransitionError, UnknownStep};

pub const ARCHITECTURE_FILE_NAME: &str = "Novel_architecture.txt";
pub const BLUEPRINT_FILE_NAME: &str = "Novel_directory.txt";
pub const GLOBAL_SUMMARY_FILE_NAME: &str = "global_summary.txt";
pub const CHAPTERS_DIR_NAME: &str = "chapters";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Precondition(#[from] TransitionError),
    #[error("language model invocation failed for step {step}: {source}")]
    Model {
        step: GenerationStep,
        #[source]
        source: LanguageModelError,
    },
    #[error("step {step} returned empty content")]
    EmptyResponse { step: GenerationStep },
    #[error("step {step} requires `{path}`, which is missing or empty")]
    MissingArtifact { step: GenerationStep, path: PathBuf },
    #[error("failed to write output file `{path}`: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to persist generation state: {0}")]
    Persist(#[source] crate::config::ConfigError),
}

/// One step invocation. The prompt is passed to the provider as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepRequest {
    pub step: GenerationStep,
    pub prompt: String,
}

impl StepRequest {
    pub fn new(step: GenerationStep, prompt: impl Into<String>) -> Self {
        Self {
            step,
            prompt: prompt.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: GenerationStep,
    /// Chapter the step worked on, for `draft` and `final`.
    pub chapter: Option<u32>,
    pub artifact: PathBuf,
    pub content: String,
    pub state: GenerationState,
}

pub fn chapter_path(project_dir: &Path, chapter: u32) -> PathBuf {
    project_dir
        .join(CHAPTERS_DIR_NAME)
        .join(format!("chapter_{chapter}.txt"))
}

/// File a step writes its result into.
pub fn artifact_path(project_dir: &Path, step: GenerationStep, chapter: u32) -> Option<PathBuf> {
    match step {
        GenerationStep::None => None,
        GenerationStep::Architecture => Some(project_dir.join(ARCHITECTURE_FILE_NAME)),
        GenerationStep::Blueprint => Some(project_dir.join(BLUEPRINT_FILE_NAME)),
        GenerationStep::Draft => Some(chapter_path(project_dir, chapter)),
        GenerationStep::Final => Some(project_dir.join(GLOBAL_SUMMARY_FILE_NAME)),
    }
}

fn clean_reply(reply: &str) -> String {
    reply.replace("```", "").trim().to_string()
}

/// Drives a project through architecture → blueprint → draft → final.
///
/// A step either completes fully (artifact written, state advanced and
/// persisted) or leaves the project's generation state and the step's
/// artifact as they were.
pub struct GenerationPipeline<'a> {
    sink: &'a dyn LogSink,
}

impl<'a> GenerationPipeline<'a> {
    pub fn new(sink: &'a dyn LogSink) -> Self {
        Self { sink }
    }

    pub fn run_step<M: LanguageModel + ?Sized>(
        &self,
        project: &mut ActiveProject,
        model: &M,
        request: &StepRequest,
    ) -> Result<StepOutcome, PipelineError> {
        let step = request.step;
        let current = project.config().generation_state.clone();
        if let Err(err) = current.check(step) {
            self.log(LogLevel::Warn, format!("{}无法执行：{err}", step.label()));
            return Err(err.into());
        }

        let chapter = current.current_chapter;
        let project_dir = project.path().to_path_buf();
        if step == GenerationStep::Final {
            self.require_draft(&project_dir, chapter)?;
        }

        let content = self.invoke(model, step, &request.prompt)?;
        let artifact = artifact_path(&project_dir, step, chapter).ok_or(TransitionError {
            requested: step,
            current: current.last_step,
        })?;
        let previous = fs::read(&artifact).ok();
        if step == GenerationStep::Final {
            append_summary(&artifact, chapter, &content)?;
        } else {
            write_file(&artifact, &content)?;
        }

        let mut next = current.clone();
        next.advance(step)?;
        project.config_mut().generation_state = next.clone();
        if let Err(err) = try_save_project(&project_dir, project.config_mut()) {
            project.config_mut().generation_state = current;
            self.log(LogLevel::Error, format!("{}状态保存失败：{err}", step.label()));
            if let Err(restore) = restore_artifact(&artifact, previous.as_deref()) {
                self.log(
                    LogLevel::Error,
                    format!("{} 恢复失败：{restore}", artifact.display()),
                );
            }
            return Err(PipelineError::Persist(err));
        }

        self.log(
            LogLevel::Info,
            format!("{}完成，已写入 {}", step.label(), artifact.display()),
        );
        Ok(StepOutcome {
            step,
            chapter: matches!(step, GenerationStep::Draft | GenerationStep::Final).then_some(chapter),
            artifact,
            content,
            state: next,
        })
    }

    fn require_draft(&self, project_dir: &Path, chapter: u32) -> Result<(), PipelineError> {
        let path = chapter_path(project_dir, chapter);
        let present = fs::read_to_string(&path)
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false);
        if present {
            return Ok(());
        }
        self.log(
            LogLevel::Warn,
            format!("第{chapter}章草稿不存在或为空，无法定稿"),
        );
        Err(PipelineError::MissingArtifact {
            step: GenerationStep::Final,
            path,
        })
    }

    fn invoke<M: LanguageModel + ?Sized>(
        &self,
        model: &M,
        step: GenerationStep,
        prompt: &str,
    ) -> Result<String, PipelineError> {
        self.log(
            LogLevel::Info,
            format!("发送到 LLM 的提示词（{}）：\n{prompt}", step.label()),
        );

        let reply = model.invoke(prompt).map_err(|source| {
            self.log(
                LogLevel::Error,
                format!("LLM 调用失败（{}）：{source}", step.label()),
            );
            PipelineError::Model { step, source }
        })?;
        self.log(
            LogLevel::Info,
            format!("LLM 返回的内容（{}）：\n{reply}", step.label()),
        );

        let cleaned = clean_reply(&reply);
        if cleaned.is_empty() {
            self.log(LogLevel::Warn, format!("LLM 返回空响应（{}）", step.label()));
            return Err(PipelineError::EmptyResponse { step });
        }
        Ok(cleaned)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message));
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), PipelineError> {
    let to_error = |source: std::io::Error| PipelineError::WriteFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(to_error)?;
    }
    fs::write(path, content).map_err(to_error)
}

/// Puts `path` back to the bytes it held before a step touched it, removing
/// it when it did not exist.
fn restore_artifact(path: &Path, previous: Option<&[u8]>) -> std::io::Result<()> {
    match previous {
        Some(bytes) => fs::write(path, bytes),
        None => match fs::remove_file(path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        },
    }
}

fn append_summary(path: &Path, chapter: u32, content: &str) -> Result<(), PipelineError> {
    let to_error = |source: std::io::Error| PipelineError::WriteFile {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(to_error)?;
    write!(file, "第{chapter}章\n{content}\n").map_err(to_error)
}
