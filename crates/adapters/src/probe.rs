use std::panic::{self, AssertUnwindSafe};
use std::thread;

use log::error;
use thiserror::Error;
use tokio::sync::oneshot;

use quill_core::{
    CallbackLogSink, EmbeddingModelError, EmbeddingProfile, LanguageModelError, LogRecord,
    LogSink, ProviderProfile, SharedLogSink,
};

use crate::embedding::create_embedding_adapter;
use crate::error::AdapterError;
use crate::llm::create_text_adapter;
use crate::network::AdapterOptions;
use crate::retry::RetryConfig;

pub const TEXT_PROBE_PROMPT: &str = "Please reply 'OK'";
pub const EMBEDDING_PROBE_TEXT: &str = "测试文本";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeReport {
    Text { reply: String },
    Embedding { dimensions: usize },
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("LLM配置测试失败：{0}")]
    Text(#[source] LanguageModelError),
    #[error("LLM配置测试失败：未获取到响应")]
    EmptyReply,
    #[error("Embedding配置测试失败：{0}")]
    Embedding(#[source] EmbeddingModelError),
    #[error("Embedding配置测试失败：未获取到向量")]
    EmptyVector,
    #[error("测试任务异常终止")]
    Aborted,
}

pub type ProbeOutcome = Result<ProbeReport, ProbeError>;

/// Resolves exactly once with the outcome of a background probe.
#[derive(Debug)]
pub struct ProbeHandle {
    receiver: oneshot::Receiver<ProbeOutcome>,
}

impl ProbeHandle {
    /// Blocks the calling thread. Must not be called from inside an async
    /// runtime; use [`ProbeHandle::outcome`] there.
    pub fn wait(self) -> ProbeOutcome {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(ProbeError::Aborted))
    }

    pub async fn outcome(self) -> ProbeOutcome {
        self.receiver.await.unwrap_or(Err(ProbeError::Aborted))
    }
}

/// Probes issue a single request; their results are advisory.
fn probe_options(options: &AdapterOptions) -> AdapterOptions {
    options.clone().with_retry(RetryConfig::once())
}

fn run_guarded<F>(sink: &dyn LogSink, job: F) -> ProbeOutcome
where
    F: FnOnce() -> ProbeOutcome,
{
    panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
        sink.log(LogRecord::error(format!("❌ {}", ProbeError::Aborted)));
        Err(ProbeError::Aborted)
    })
}

fn spawn_probe<F>(name: &str, sink: SharedLogSink, job: F) -> ProbeHandle
where
    F: FnOnce(&dyn LogSink) -> ProbeOutcome + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        let outcome = run_guarded(sink.as_ref(), || job(sink.as_ref()));
        let _ = sender.send(outcome);
    });
    if let Err(err) = spawned {
        // The sender was dropped with the closure, so the handle reports
        // `Aborted`.
        error!("failed to spawn {name} thread: {err}");
    }
    ProbeHandle { receiver }
}

fn probe_text(profile: &ProviderProfile, options: &AdapterOptions, sink: &dyn LogSink) -> ProbeOutcome {
    sink.log(LogRecord::info("开始测试LLM配置..."));
    let adapter = create_text_adapter(profile, &probe_options(options)).map_err(|err| {
        sink.log(LogRecord::error(format!("❌ LLM配置测试失败：{err}")));
        ProbeError::from(err)
    })?;

    match adapter.invoke(TEXT_PROBE_PROMPT) {
        Ok(reply) if !reply.trim().is_empty() => {
            sink.log(LogRecord::info("✅ LLM配置测试成功！"));
            sink.log(LogRecord::info(format!("测试回复: {reply}")));
            Ok(ProbeReport::Text { reply })
        }
        Ok(_) => {
            sink.log(LogRecord::error("❌ LLM配置测试失败：未获取到响应"));
            Err(ProbeError::EmptyReply)
        }
        Err(err) => {
            sink.log(LogRecord::error(format!("❌ LLM配置测试失败：{err}")));
            Err(ProbeError::Text(err))
        }
    }
}

fn probe_embedding(
    profile: &EmbeddingProfile,
    options: &AdapterOptions,
    sink: &dyn LogSink,
) -> ProbeOutcome {
    sink.log(LogRecord::info("开始测试Embedding配置..."));
    let adapter = create_embedding_adapter(profile, &probe_options(options)).map_err(|err| {
        sink.log(LogRecord::error(format!("❌ Embedding配置测试失败：{err}")));
        ProbeError::from(err)
    })?;

    match adapter.try_embed_query(EMBEDDING_PROBE_TEXT) {
        Ok(vector) if !vector.is_empty() => {
            sink.log(LogRecord::info("✅ Embedding配置测试成功！"));
            sink.log(LogRecord::info(format!("生成的向量维度: {}", vector.len())));
            Ok(ProbeReport::Embedding {
                dimensions: vector.len(),
            })
        }
        Ok(_) => {
            sink.log(LogRecord::error("❌ Embedding配置测试失败：未获取到向量"));
            Err(ProbeError::EmptyVector)
        }
        Err(err) => {
            sink.log(LogRecord::error(format!("❌ Embedding配置测试失败：{err}")));
            Err(ProbeError::Embedding(err))
        }
    }
}

/// Sends [`TEXT_PROBE_PROMPT`] through a fresh adapter on a background
/// thread, reporting progress to `sink`.
pub fn spawn_text_probe(
    profile: &ProviderProfile,
    options: &AdapterOptions,
    sink: SharedLogSink,
) -> ProbeHandle {
    let profile = profile.clone();
    let options = options.clone();
    spawn_probe("llm-probe", sink, move |sink| {
        probe_text(&profile, &options, sink)
    })
}

/// Embeds [`EMBEDDING_PROBE_TEXT`] on a background thread and reports the
/// vector's dimensionality.
pub fn spawn_embedding_probe(
    profile: &EmbeddingProfile,
    options: &AdapterOptions,
    sink: SharedLogSink,
) -> ProbeHandle {
    let profile = profile.clone();
    let options = options.clone();
    spawn_probe("embedding-probe", sink, move |sink| {
        probe_embedding(&profile, &options, sink)
    })
}

fn spawn_with_callbacks<L, E, F>(name: &str, on_log: L, on_error: E, job: F)
where
    L: Fn(String) + Send + Sync + 'static,
    E: FnOnce(String) + Send + 'static,
    F: FnOnce(&dyn LogSink) -> ProbeOutcome + Send + 'static,
{
    let sink = CallbackLogSink::new(on_log);
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        if let Err(err) = run_guarded(&sink, || job(&sink)) {
            on_error(err.to_string());
        }
    });
    if let Err(err) = spawned {
        error!("failed to spawn {name} thread: {err}");
    }
}

/// Callback flavor of [`spawn_text_probe`]: returns immediately, streams
/// progress to `on_log` and reports any failure to `on_error`.
pub fn test_text<L, E>(profile: &ProviderProfile, options: &AdapterOptions, on_log: L, on_error: E)
where
    L: Fn(String) + Send + Sync + 'static,
    E: FnOnce(String) + Send + 'static,
{
    let profile = profile.clone();
    let options = options.clone();
    spawn_with_callbacks("llm-probe", on_log, on_error, move |sink| {
        probe_text(&profile, &options, sink)
    });
}

pub fn test_embedding<L, E>(
    profile: &EmbeddingProfile,
    options: &AdapterOptions,
    on_log: L,
    on_error: E,
) where
    L: Fn(String) + Send + Sync + 'static,
    E: FnOnce(String) + Send + 'static,
{
    let profile = profile.clone();
    let options = options.clone();
    spawn_with_callbacks("embedding-probe", on_log, on_error, move |sink| {
        probe_embedding(&profile, &options, sink)
    });
}
