use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStep {
    #[default]
    None,
    Architecture,
    Blueprint,
    Draft,
    Final,
}

impl GenerationStep {
    pub const RUNNABLE: [GenerationStep; 4] = [
        GenerationStep::Architecture,
        GenerationStep::Blueprint,
        GenerationStep::Draft,
        GenerationStep::Final,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStep::None => "none",
            GenerationStep::Architecture => "architecture",
            GenerationStep::Blueprint => "blueprint",
            GenerationStep::Draft => "draft",
            GenerationStep::Final => "final",
        }
    }

    /// Operator-facing name used in progress messages.
    pub fn label(&self) -> &'static str {
        match self {
            GenerationStep::None => "未开始",
            GenerationStep::Architecture => "小说架构",
            GenerationStep::Blueprint => "章节目录",
            GenerationStep::Draft => "章节草稿",
            GenerationStep::Final => "章节定稿",
        }
    }

    /// Steps whose completion allows this one to run.
    pub fn predecessors(&self) -> &'static [GenerationStep] {
        match self {
            GenerationStep::None => &[],
            GenerationStep::Architecture => &[GenerationStep::None],
            GenerationStep::Blueprint => &[GenerationStep::Architecture],
            GenerationStep::Draft => &[GenerationStep::Blueprint, GenerationStep::Final],
            GenerationStep::Final => &[GenerationStep::Draft],
        }
    }
}

impl fmt::Display for GenerationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown generation step `{0}`")]
pub struct UnknownStep(pub String);

impl FromStr for GenerationStep {
    type Err = UnknownStep;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(GenerationStep::None),
            "architecture" => Ok(GenerationStep::Architecture),
            "blueprint" => Ok(GenerationStep::Blueprint),
            "draft" => Ok(GenerationStep::Draft),
            "final" => Ok(GenerationStep::Final),
            _ => Err(UnknownStep(input.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot run step {requested} after {current}")]
pub struct TransitionError {
    pub requested: GenerationStep,
    pub current: GenerationStep,
}

fn first_chapter() -> u32 {
    1
}

/// Progress of a project through the generation sequence.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationState {
    #[serde(default = "first_chapter")]
    pub current_chapter: u32,
    #[serde(default)]
    pub architecture_generated: bool,
    #[serde(default)]
    pub blueprint_generated: bool,
    #[serde(default, rename = "last_generation_step")]
    pub last_step: GenerationStep,
}

impl Default for GenerationState {
    fn default() -> Self {
        Self {
            current_chapter: first_chapter(),
            architecture_generated: false,
            blueprint_generated: false,
            last_step: GenerationStep::None,
        }
    }
}

impl GenerationState {
    pub fn can_run(&self, step: GenerationStep) -> bool {
        step.predecessors().contains(&self.last_step)
    }

    pub fn check(&self, step: GenerationStep) -> Result<(), TransitionError> {
        if self.can_run(step) {
            Ok(())
        } else {
            Err(TransitionError {
                requested: step,
                current: self.last_step,
            })
        }
    }

    /// Records a successful `step`. Leaves `self` untouched on error.
    pub fn advance(&mut self, step: GenerationStep) -> Result<(), TransitionError> {
        self.check(step)?;
        match step {
            GenerationStep::Architecture => self.architecture_generated = true,
            GenerationStep::Blueprint => self.blueprint_generated = true,
            GenerationStep::Final => self.current_chapter += 1,
            GenerationStep::Draft | GenerationStep::None => {}
        }
        self.last_step = step;
        Ok(())
    }

    /// The step an operator would normally run next.
    pub fn next_step(&self) -> GenerationStep {
        match self.last_step {
            GenerationStep::None => GenerationStep::Architecture,
            GenerationStep::Architecture => GenerationStep::Blueprint,
            GenerationStep::Blueprint | GenerationStep::Final => GenerationStep::Draft,
            GenerationStep::Draft => GenerationStep::Final,
        }
    }

    pub fn finalized_chapters(&self) -> u32 {
        self.current_chapter.saturating_sub(1)
    }

    pub(crate) fn normalize(&mut self) {
        if self.current_chapter == 0 {
            self.current_chapter = first_chapter();
        }
    }
}
