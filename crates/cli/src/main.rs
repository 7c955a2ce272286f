use clap::{Args, Parser, Subcommand};
use quill_adapters::{
    create_text_adapter, spawn_embedding_probe, spawn_text_probe, AdapterError, AdapterOptions,
    ProbeError,
};
use quill_core::{
    backup_config, list_backups, migrate_legacy_config, restore_backup, ActiveProject,
    ConfigError, ConfigStore, GenerationPipeline, GenerationStep, LogRecord, LogSink,
    PipelineError, ProjectRegistry, SharedLogSink, StdoutLogSink, StepRequest, CONFIG_FILE_NAME,
};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn main() {
    init_tracing();
    if let Err(err) = run(Cli::parse()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), CliError> {
    let ctx = Context::from_cli(&cli);
    let sink: SharedLogSink = Arc::new(StdoutLogSink::new());

    match cli.command {
        Command::Config(command) => handle_config(&ctx, command, &sink),
        Command::Project(command) => handle_project(&ctx, command),
        Command::Generate(args) => run_generate(&ctx, args, sink.as_ref()),
        Command::State(command) => handle_state(&ctx, command),
    }
}

/// Paths derived from the global flags.
struct Context {
    config_path: PathBuf,
    registry: ProjectRegistry,
}

impl Context {
    fn from_cli(cli: &Cli) -> Self {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| cli.root.join(CONFIG_FILE_NAME));
        Self {
            config_path,
            registry: ProjectRegistry::under(&cli.root),
        }
    }

    fn store(&self) -> ConfigStore {
        let mut store = ConfigStore::open(&self.config_path);
        store.ensure_recent_defaults();
        store
    }

    fn project(&self, store: &ConfigStore, name: Option<&str>) -> Result<ActiveProject, CliError> {
        let project = match name {
            Some(name) => self.registry.open(name, store.config())?,
            None => self.registry.current_or_default(None, store.config())?,
        };
        Ok(project)
    }
}

fn save_store(store: &ConfigStore) -> Result<(), CliError> {
    if store.save() {
        Ok(())
    } else {
        Err(CliError::SaveFailed(store.path().to_path_buf()))
    }
}

fn handle_config(
    ctx: &Context,
    command: ConfigCommand,
    sink: &SharedLogSink,
) -> Result<(), CliError> {
    match command {
        ConfigCommand::Show => run_config_show(ctx),
        ConfigCommand::TestLlm(args) => run_test_llm(ctx, args, sink),
        ConfigCommand::TestEmbedding(args) => run_test_embedding(ctx, args, sink),
        ConfigCommand::Backup => {
            let backup = backup_config(&ctx.config_path)?;
            sink.log(LogRecord::info(format!("配置已备份至：{}", backup.display())));
            Ok(())
        }
        ConfigCommand::Backups => {
            let backups = list_backups(&ctx.config_path);
            if backups.is_empty() {
                println!("暂无备份。");
            }
            for entry in backups {
                let taken_at = entry
                    .taken_at
                    .map(|at| at.format(TIME_FORMAT).to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{taken_at}  {:>8} B  {}", entry.size, entry.path.display());
            }
            Ok(())
        }
        ConfigCommand::Restore(args) => {
            let safety = restore_backup(&args.backup, &ctx.config_path)?;
            if let Some(safety) = safety {
                sink.log(LogRecord::info(format!(
                    "当前配置已备份至：{}",
                    safety.display()
                )));
            }
            sink.log(LogRecord::info(format!(
                "已从 {} 恢复配置。",
                args.backup.display()
            )));
            Ok(())
        }
        ConfigCommand::Migrate => {
            let outcome = migrate_legacy_config(&ctx.config_path)?;
            if !outcome.migrated() {
                sink.log(LogRecord::info("配置已是最新格式，无需迁移。"));
                return Ok(());
            }
            if let Some(backup) = &outcome.backup {
                sink.log(LogRecord::info(format!("迁移前备份：{}", backup.display())));
            }
            sink.log(LogRecord::info(format!(
                "配置迁移完成，迁移字段：{}",
                outcome.carried_keys.join(", ")
            )));
            Ok(())
        }
    }
}

fn run_config_show(ctx: &Context) -> Result<(), CliError> {
    let store = ctx.store();
    let config = store.config();
    let marker = |current: Option<&str>, name: &str| {
        if current == Some(name) {
            '*'
        } else {
            ' '
        }
    };

    println!("配置文件：{}", store.path().display());
    println!("LLM 接口：");
    for (name, profile) in &config.llm_configs {
        println!(
            "  {} {name}  [{}] {} {}",
            marker(store.last_llm_interface(), name),
            profile.interface_format,
            profile.model_name,
            profile.base_url
        );
    }
    println!("Embedding 接口：");
    for (name, profile) in &config.embedding_configs {
        println!(
            "  {} {name}  [{}] {} {}",
            marker(store.last_embedding_interface(), name),
            profile.interface_format,
            profile.model_name,
            profile.base_url
        );
    }
    println!("步骤模型：");
    for step in GenerationStep::RUNNABLE {
        let chosen = config.choose_configs.for_step(step).unwrap_or("-");
        println!("  {}: {chosen}", step.label());
    }
    match store.network_config().proxy() {
        Some(proxy) => println!("代理：{proxy}"),
        None => println!("代理：未启用"),
    }
    Ok(())
}

fn run_test_llm(ctx: &Context, args: InterfaceArgs, sink: &SharedLogSink) -> Result<(), CliError> {
    let mut store = ctx.store();
    let name = select_interface(
        normalize_preference(args.interface),
        store.last_llm_interface(),
        store.config().llm_configs.keys(),
    )
    .ok_or(CliError::MissingLlmProfile)?;
    let profile = store
        .config()
        .get_llm_profile(&name)
        .cloned()
        .ok_or_else(|| CliError::UnknownInterface(name.clone()))?;

    sink.log(LogRecord::info(format!("测试 LLM 接口：{name}")));
    let options = AdapterOptions::new(store.network_config());
    spawn_text_probe(&profile, &options, Arc::clone(sink)).wait()?;
    store.touch_llm_interface(name);
    save_store(&store)
}

fn run_test_embedding(
    ctx: &Context,
    args: InterfaceArgs,
    sink: &SharedLogSink,
) -> Result<(), CliError> {
    let mut store = ctx.store();
    let name = select_interface(
        normalize_preference(args.interface),
        store.last_embedding_interface(),
        store.config().embedding_configs.keys(),
    )
    .ok_or(CliError::MissingEmbeddingProfile)?;
    let profile = store
        .config()
        .get_embedding_profile(&name)
        .cloned()
        .ok_or_else(|| CliError::UnknownInterface(name.clone()))?;

    sink.log(LogRecord::info(format!("测试 Embedding 接口：{name}")));
    let options = AdapterOptions::new(store.network_config());
    spawn_embedding_probe(&profile, &options, Arc::clone(sink)).wait()?;
    store.touch_embedding_interface(name);
    save_store(&store)
}

fn handle_project(ctx: &Context, command: ProjectCommand) -> Result<(), CliError> {
    match command {
        ProjectCommand::List => {
            let projects = ctx.registry.list();
            if projects.is_empty() {
                println!("暂无项目。");
            }
            for project in projects {
                let modified = project
                    .last_modified
                    .map(|at| at.format(TIME_FORMAT).to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{modified}  {}  ({})", project.name, project.title);
            }
            Ok(())
        }
        ProjectCommand::Create(args) => {
            let store = ctx.store();
            let path = ctx.registry.create(&args.name, store.config())?;
            println!("已创建项目：{}", path.display());
            Ok(())
        }
        ProjectCommand::Delete(args) => {
            if ctx.registry.delete(&args.name) {
                println!("已删除项目：{}", args.name);
                Ok(())
            } else {
                Err(CliError::DeleteFailed(args.name))
            }
        }
        ProjectCommand::Show(args) => {
            let store = ctx.store();
            let project = ctx.project(&store, args.project.as_deref())?;
            let config = project.config();
            let format_time = |at: Option<chrono::NaiveDateTime>| {
                at.map(|at| at.format(TIME_FORMAT).to_string())
                    .unwrap_or_else(|| "-".to_string())
            };

            println!("项目：{}", project.name());
            println!("目录：{}", project.path().display());
            println!("标题：{}", config.title());
            println!("创建时间：{}", format_time(config.novel_info.created_at));
            println!("最后修改：{}", format_time(config.novel_info.last_modified));
            println!("小说参数：");
            println!("{}", serde_json::to_string_pretty(&config.novel_params)?);
            Ok(())
        }
    }
}

fn handle_state(ctx: &Context, command: StateCommand) -> Result<(), CliError> {
    match command {
        StateCommand::Show(args) => {
            let store = ctx.store();
            let project = ctx.project(&store, args.project.as_deref())?;
            let state = &project.config().generation_state;

            println!("项目：{}", project.name());
            println!("当前章节：第{}章", state.current_chapter);
            println!("已定稿章节数：{}", state.finalized_chapters());
            println!("架构已生成：{}", yes_no(state.architecture_generated));
            println!("目录已生成：{}", yes_no(state.blueprint_generated));
            println!("上一步：{}", state.last_step.label());
            println!("建议下一步：{}", state.next_step());
            Ok(())
        }
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "是"
    } else {
        "否"
    }
}

fn run_generate(ctx: &Context, args: GenerateArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let prompt = fs::read_to_string(&args.prompt_file).map_err(|source| CliError::Io {
        path: args.prompt_file.clone(),
        source,
    })?;

    let mut store = ctx.store();
    let mut project = ctx.project(&store, args.project.as_deref())?;
    let (name, profile) = match normalize_preference(args.llm) {
        Some(name) => {
            let profile = store
                .config()
                .get_llm_profile(&name)
                .cloned()
                .ok_or_else(|| CliError::UnknownInterface(name.clone()))?;
            (name, profile)
        }
        None => store
            .config()
            .provider_for_step(args.step)
            .map(|(name, profile)| (name.to_string(), profile.clone()))
            .ok_or(CliError::MissingLlmProfile)?,
    };

    sink.log(LogRecord::info(format!(
        "项目：{}，步骤：{}，使用 LLM 接口：{name}",
        project.name(),
        args.step.label()
    )));

    let adapter = create_text_adapter(&profile, &AdapterOptions::new(store.network_config()))?;
    let pipeline = GenerationPipeline::new(sink);
    let outcome = pipeline.run_step(
        &mut project,
        adapter.as_ref(),
        &StepRequest::new(args.step, prompt),
    )?;

    sink.log(LogRecord::info(format!(
        "结果已写入：{}",
        outcome.artifact.display()
    )));
    sink.log(LogRecord::info(format!(
        "建议下一步：{}",
        outcome.state.next_step()
    )));

    store.touch_llm_interface(name);
    save_store(&store)
}

/// Explicit choice first, then the most recently used name, then the first
/// configured one.
fn select_interface<'a, I>(
    preferred: Option<String>,
    last_used: Option<&str>,
    mut available: I,
) -> Option<String>
where
    I: Iterator<Item = &'a String>,
{
    preferred
        .or_else(|| last_used.map(str::to_string))
        .or_else(|| available.next().cloned())
}

fn normalize_preference(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_runnable_step(input: &str) -> Result<GenerationStep, String> {
    let step: GenerationStep = input.parse().map_err(|err| format!("{err}"))?;
    if GenerationStep::RUNNABLE.contains(&step) {
        Ok(step)
    } else {
        Err(format!(
            "`{input}` is not a runnable step (architecture, blueprint, draft, final)"
        ))
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("配置文件错误: {0}")]
    Config(#[from] ConfigError),
    #[error("缺少可用的 LLM 配置。")]
    MissingLlmProfile,
    #[error("缺少可用的 Embedding 配置。")]
    MissingEmbeddingProfile,
    #[error("未找到名为 `{0}` 的接口配置")]
    UnknownInterface(String),
    #[error("项目 `{0}` 不存在或删除失败")]
    DeleteFailed(String),
    #[error("保存配置文件 `{0}` 失败")]
    SaveFailed(PathBuf),
    #[error("读取文件 `{path}` 失败: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("序列化失败: {0}")]
    Json(#[from] serde_json::Error),
    #[error("适配器创建失败: {0}")]
    Adapter(#[from] AdapterError),
    #[error("{0}")]
    Probe(#[from] ProbeError),
    #[error("生成失败: {0}")]
    Pipeline(#[from] PipelineError),
}

#[derive(Parser)]
#[command(name = "quill", version, about = "多模型小说生成协调工具")]
struct Cli {
    /// 安装根目录，包含 config.json 与 novels/
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// 指定配置文件路径，默认为 <root>/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 全局配置相关操作
    #[command(subcommand)]
    Config(ConfigCommand),
    /// 小说项目管理
    #[command(subcommand)]
    Project(ProjectCommand),
    /// 执行一个生成步骤
    Generate(GenerateArgs),
    /// 生成进度
    #[command(subcommand)]
    State(StateCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// 显示接口、步骤模型与代理设置
    Show,
    /// 测试 LLM 接口配置
    TestLlm(InterfaceArgs),
    /// 测试 Embedding 接口配置
    TestEmbedding(InterfaceArgs),
    /// 备份配置文件
    Backup,
    /// 列出配置备份（最新在前）
    Backups,
    /// 从备份恢复配置文件
    Restore(RestoreArgs),
    /// 将旧版配置迁移为当前格式
    Migrate,
}

#[derive(Subcommand)]
enum ProjectCommand {
    /// 按最后修改时间列出项目
    List,
    /// 以全局默认参数创建项目
    Create(ProjectNameArgs),
    /// 删除项目目录
    Delete(ProjectNameArgs),
    /// 显示项目信息
    Show(ProjectSelectArgs),
}

#[derive(Subcommand)]
enum StateCommand {
    /// 显示项目的生成进度
    Show(ProjectSelectArgs),
}

#[derive(Args)]
struct InterfaceArgs {
    /// 指定要测试的接口名称，默认为最近使用的接口
    #[arg(long)]
    interface: Option<String>,
}

#[derive(Args)]
struct RestoreArgs {
    /// 备份文件路径
    backup: PathBuf,
}

#[derive(Args)]
struct ProjectNameArgs {
    /// 项目名称（即目录名）
    name: String,
}

#[derive(Args)]
struct ProjectSelectArgs {
    /// 项目名称，默认为当前项目
    #[arg(long)]
    project: Option<String>,
}

#[derive(Args)]
struct GenerateArgs {
    /// architecture、blueprint、draft 或 final
    #[arg(value_parser = parse_runnable_step)]
    step: GenerationStep,
    /// 发送给模型的提示词文件
    #[arg(long, value_name = "FILE")]
    prompt_file: PathBuf,
    /// 项目名称，默认为当前项目
    #[arg(long)]
    project: Option<String>,
    /// 指定 LLM 接口名称，默认为该步骤配置的接口
    #[arg(long)]
    llm: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::path::Path;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("quill").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn generate_accepts_only_runnable_steps() {
        let cli = parse(&["generate", "Draft", "--prompt-file", "p.txt"]);
        match cli.command {
            Command::Generate(args) => assert_eq!(args.step, GenerationStep::Draft),
            _ => panic!("expected generate"),
        }
        assert!(Cli::try_parse_from(["quill", "generate", "none", "--prompt-file", "p"]).is_err());
        assert!(Cli::try_parse_from(["quill", "generate", "outline", "--prompt-file", "p"]).is_err());
    }

    #[test]
    fn config_path_defaults_under_root() {
        let cli = parse(&["--root", "/srv/quill", "state", "show"]);
        let ctx = Context::from_cli(&cli);
        assert_eq!(ctx.config_path, Path::new("/srv/quill").join(CONFIG_FILE_NAME));

        let cli = parse(&["--config", "/etc/quill.json", "state", "show"]);
        assert_eq!(Context::from_cli(&cli).config_path, Path::new("/etc/quill.json"));
    }

    #[test]
    fn interface_selection_order() {
        let names = vec!["A".to_string(), "B".to_string()];
        assert_eq!(
            select_interface(Some("B".into()), Some("A"), names.iter()),
            Some("B".to_string())
        );
        assert_eq!(select_interface(None, Some("B"), names.iter()), Some("B".to_string()));
        assert_eq!(select_interface(None, None, names.iter()), Some("A".to_string()));
        assert_eq!(select_interface(None, None, [].iter()), None);
        assert_eq!(normalize_preference(Some("  ".into())), None);
    }

    #[test]
    fn project_commands_manage_directories() -> Result<(), Box<dyn std::error::Error>> {
        let temp = tempdir()?;
        let root = temp.path().to_str().ok_or("non-utf8 temp path")?;

        run(parse(&["--root", root, "project", "create", "星海"]))?;
        assert!(temp.path().join("novels").join("星海").is_dir());
        assert!(temp.path().join(CONFIG_FILE_NAME).is_file());

        run(parse(&["--root", root, "state", "show", "--project", "星海"]))?;
        assert!(matches!(
            run(parse(&["--root", root, "project", "create", "星海"])),
            Err(CliError::Config(ConfigError::ProjectExists(_)))
        ));

        run(parse(&["--root", root, "project", "delete", "星海"]))?;
        assert!(matches!(
            run(parse(&["--root", root, "project", "delete", "星海"])),
            Err(CliError::DeleteFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn generate_rejects_out_of_order_step_before_calling_a_provider(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let temp = tempdir()?;
        let root = temp.path().to_str().ok_or("non-utf8 temp path")?;
        let prompt = temp.path().join("prompt.txt");
        fs::write(&prompt, "写第一章")?;
        let prompt = prompt.to_str().ok_or("non-utf8 prompt path")?;

        let result = run(parse(&["--root", root, "generate", "draft", "--prompt-file", prompt]));
        assert!(matches!(
            result,
            Err(CliError::Pipeline(PipelineError::Precondition(_)))
        ));
        Ok(())
    }
}
