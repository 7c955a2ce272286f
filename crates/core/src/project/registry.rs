use chrono::NaiveDateTime;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use super::{load_project, project_config_path, save_project, ProjectConfig};
use crate::config::{ConfigError, GlobalConfig, NovelParams};

pub const PROJECTS_DIR_NAME: &str = "novels";
pub const DEFAULT_PROJECT_NAME: &str = "默认小说项目";

const RESERVED_CHARACTERS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Checks that `name` can be used as a single directory name on every
/// platform and returns it trimmed.
pub fn validate_project_name(name: &str) -> Result<&str, ConfigError> {
    let trimmed = name.trim();
    let invalid = |reason| ConfigError::InvalidProjectName {
        name: name.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("名称不能为空"));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(invalid("名称不能是 . 或 .."));
    }
    if trimmed.chars().any(|c| RESERVED_CHARACTERS.contains(&c)) {
        return Err(invalid("名称包含保留字符"));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(invalid("名称包含控制字符"));
    }
    Ok(trimmed)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectSummary {
    pub name: String,
    pub path: PathBuf,
    pub title: String,
    pub created_at: Option<NaiveDateTime>,
    pub last_modified: Option<NaiveDateTime>,
}

/// Directory of projects, one subdirectory per project.
#[derive(Clone, Debug)]
pub struct ProjectRegistry {
    root: PathBuf,
}

impl ProjectRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Registry at `<installation_root>/novels`.
    pub fn under(installation_root: &Path) -> Self {
        Self::new(installation_root.join(PROJECTS_DIR_NAME))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn ensure_root(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.root).map_err(|source| ConfigError::io(&self.root, source))
    }

    /// Projects with a readable configuration, most recently modified first.
    /// A missing registry root lists as empty and is not created.
    pub fn list(&self) -> Vec<ProjectSummary> {
        if !self.root.is_dir() {
            return Vec::new();
        }
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot read {}: {err}", self.root.display());
                return Vec::new();
            }
        };

        let mut projects: Vec<ProjectSummary> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let path = entry.path();
                let config_path = project_config_path(&path);
                if !config_path.exists() {
                    return None;
                }
                let config = match ProjectConfig::from_path(&config_path) {
                    Ok(config) => config,
                    Err(err) => {
                        warn!("skipping project: {err}");
                        return None;
                    }
                };
                let name = entry.file_name().to_string_lossy().into_owned();
                let title = if config.title().is_empty() {
                    name.clone()
                } else {
                    config.title().to_string()
                };
                Some(ProjectSummary {
                    name,
                    path,
                    title,
                    created_at: config.novel_info.created_at,
                    last_modified: config.novel_info.last_modified,
                })
            })
            .collect();

        // `None < Some`, so reversing the timestamp order puts unknowns last.
        projects.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| a.name.cmp(&b.name))
        });
        projects
    }

    /// Creates `<root>/<name>` with a configuration seeded from
    /// `global.default_novel_params`.
    pub fn create(&self, name: &str, global: &GlobalConfig) -> Result<PathBuf, ConfigError> {
        let name = validate_project_name(name)?;
        let path = self.project_path(name);
        if path.exists() {
            return Err(ConfigError::ProjectExists(name.to_string()));
        }

        self.ensure_root()?;
        fs::create_dir(&path).map_err(|source| ConfigError::io(&path, source))?;
        let config = ProjectConfig::new(name, &global.default_novel_params, &path);
        if let Err(err) = config.to_path(&project_config_path(&path)) {
            let _ = fs::remove_dir_all(&path);
            return Err(err);
        }

        info!("项目 '{name}' 已创建: {}", path.display());
        Ok(path)
    }

    /// Removes the project directory recursively. Returns `false` when it
    /// does not exist or cannot be removed.
    pub fn delete(&self, name: &str) -> bool {
        let name = match validate_project_name(name) {
            Ok(name) => name,
            Err(err) => {
                warn!("{err}");
                return false;
            }
        };
        let path = self.project_path(name);
        if !path.is_dir() {
            return false;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                info!("项目 '{name}' 已删除");
                true
            }
            Err(err) => {
                warn!("删除项目 '{name}' 失败: {err}");
                false
            }
        }
    }

    /// Picks the project to activate: `preferred` when it still exists,
    /// otherwise the most recently modified project, otherwise the default
    /// project (created when missing).
    pub fn current_or_default(
        &self,
        preferred: Option<&Path>,
        global: &GlobalConfig,
    ) -> Result<ActiveProject, ConfigError> {
        let defaults = &global.default_novel_params;

        if let Some(preferred) = preferred.filter(|path| path.is_dir()) {
            return ActiveProject::load(preferred, defaults);
        }

        if let Some(latest) = self.list().into_iter().next() {
            return ActiveProject::load(&latest.path, defaults);
        }

        let path = self.project_path(DEFAULT_PROJECT_NAME);
        if path.is_dir() {
            return ActiveProject::load(&path, defaults);
        }
        let path = self.create(DEFAULT_PROJECT_NAME, global)?;
        ActiveProject::load(&path, defaults)
    }

    /// Loads an existing project by directory name.
    pub fn open(&self, name: &str, global: &GlobalConfig) -> Result<ActiveProject, ConfigError> {
        let name = validate_project_name(name)?;
        let path = self.project_path(name);
        if !path.is_dir() {
            return Err(ConfigError::ProjectNotFound(name.to_string()));
        }
        ActiveProject::load(&path, &global.default_novel_params)
    }
}

/// The project the process is currently working on.
#[derive(Clone, Debug)]
pub struct ActiveProject {
    path: PathBuf,
    config: ProjectConfig,
}

impl ActiveProject {
    pub fn load(path: &Path, defaults: &NovelParams) -> Result<Self, ConfigError> {
        let config = load_project(path, defaults)?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ProjectConfig {
        &mut self.config
    }

    pub fn save(&mut self) -> bool {
        save_project(&self.path, &mut self.config)
    }

    pub fn reload(&mut self, defaults: &NovelParams) -> Result<(), ConfigError> {
        self.config = load_project(&self.path, defaults)?;
        Ok(())
    }

    /// Persists the current project, then makes `name` active.
    pub fn switch_to(
        &mut self,
        registry: &ProjectRegistry,
        name: &str,
        global: &GlobalConfig,
    ) -> Result<(), ConfigError> {
        let name = validate_project_name(name)?;
        let target = registry.project_path(name);
        if !target.is_dir() {
            return Err(ConfigError::ProjectNotFound(name.to_string()));
        }

        if !self.save() {
            warn!("项目 '{}' 保存失败，仍然切换", self.name());
        }
        *self = Self::load(&target, &global.default_novel_params)?;
        info!("已切换到项目: {name}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::GenerationStep;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn stamp(day: u32) -> Option<NaiveDateTime> {
        at(2024, day)
    }

    fn at(year: i32, day: u32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(year, 1, day).and_then(|date| date.and_hms_opt(8, 0, 0))
    }

    fn write_project(registry: &ProjectRegistry, name: &str, modified: Option<NaiveDateTime>) {
        let path = registry.project_path(name);
        let mut config = ProjectConfig::new(name, &NovelParams::default(), &path);
        config.novel_info.last_modified = modified;
        fs::create_dir_all(&path).unwrap();
        config.to_path(&project_config_path(&path)).unwrap();
    }

    #[test]
    fn create_list_delete_scenario() {
        let temp = tempdir().unwrap();
        let registry = ProjectRegistry::under(temp.path());
        let global = GlobalConfig::builtin();

        let path = registry.create("Draft1", &global).unwrap();
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Draft1");
        assert_eq!(listed[0].title, "Draft1");
        assert_eq!(listed[0].path, path);

        assert!(registry.delete("Draft1"));
        assert!(registry.list().is_empty());
        assert!(!registry.delete("Draft1"));
    }

    #[test]
    fn listing_a_missing_root_creates_nothing() {
        let temp = tempdir().unwrap();
        let registry = ProjectRegistry::under(temp.path());

        assert!(registry.list().is_empty());
        assert!(!registry.root().exists());
    }

    #[test]
    fn duplicate_create_leaves_project_untouched() {
        let temp = tempdir().unwrap();
        let registry = ProjectRegistry::under(temp.path());
        let global = GlobalConfig::builtin();

        let path = registry.create("A", &global).unwrap();
        let before = fs::read_to_string(project_config_path(&path)).unwrap();
        assert!(matches!(
            registry.create("A", &global),
            Err(ConfigError::ProjectExists(name)) if name == "A"
        ));
        assert_eq!(fs::read_to_string(project_config_path(&path)).unwrap(), before);
    }

    #[test]
    fn unsafe_names_are_rejected() {
        let temp = tempdir().unwrap();
        let registry = ProjectRegistry::under(temp.path());
        let global = GlobalConfig::builtin();

        for name in ["", "  ", ".", "..", "a/b", "a\\b", "what?", "tab\there"] {
            assert!(
                matches!(
                    registry.create(name, &global),
                    Err(ConfigError::InvalidProjectName { .. })
                ),
                "{name:?} should be rejected"
            );
        }
        assert!(!registry.delete(".."));
        assert!(temp.path().exists());
    }

    #[test]
    fn listing_orders_by_last_modified() {
        let temp = tempdir().unwrap();
        let registry = ProjectRegistry::under(temp.path());
        write_project(&registry, "old", stamp(1));
        write_project(&registry, "new", stamp(3));
        write_project(&registry, "tie-b", stamp(2));
        write_project(&registry, "tie-a", stamp(2));
        write_project(&registry, "unknown", None);
        fs::create_dir_all(registry.project_path("no-config")).unwrap();
        fs::create_dir_all(registry.project_path("broken")).unwrap();
        fs::write(project_config_path(&registry.project_path("broken")), "{").unwrap();

        let names: Vec<String> = registry.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["new", "tie-a", "tie-b", "old", "unknown"]);
    }

    #[test]
    fn current_or_default_prefers_existing_then_latest_then_default() {
        let temp = tempdir().unwrap();
        let registry = ProjectRegistry::under(temp.path());
        let global = GlobalConfig::builtin();

        let active = registry.current_or_default(None, &global).unwrap();
        assert_eq!(active.name(), DEFAULT_PROJECT_NAME);
        assert_eq!(active.config().title(), DEFAULT_PROJECT_NAME);

        write_project(&registry, "recent", at(2999, 1));
        let active = registry.current_or_default(None, &global).unwrap();
        assert_eq!(active.name(), "recent");

        let preferred = registry.project_path(DEFAULT_PROJECT_NAME);
        let active = registry
            .current_or_default(Some(&preferred), &global)
            .unwrap();
        assert_eq!(active.name(), DEFAULT_PROJECT_NAME);

        let gone = registry.project_path("gone");
        let active = registry.current_or_default(Some(&gone), &global).unwrap();
        assert_eq!(active.name(), "recent");
    }

    #[test]
    fn switching_persists_the_outgoing_project() {
        let temp = tempdir().unwrap();
        let registry = ProjectRegistry::under(temp.path());
        let global = GlobalConfig::builtin();
        registry.create("first", &global).unwrap();
        registry.create("second", &global).unwrap();

        let mut active = registry.open("first", &global).unwrap();
        active.config_mut().generation_state.last_step = GenerationStep::Architecture;
        active.config_mut().generation_state.architecture_generated = true;

        assert!(matches!(
            active.switch_to(&registry, "missing", &global),
            Err(ConfigError::ProjectNotFound(_))
        ));
        assert_eq!(active.name(), "first");

        active.switch_to(&registry, "second", &global).unwrap();
        assert_eq!(active.name(), "second");

        let first = registry.open("first", &global).unwrap();
        assert_eq!(
            first.config().generation_state.last_step,
            GenerationStep::Architecture
        );
    }
}
