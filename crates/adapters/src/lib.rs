mod base_url;
mod embedding;
mod error;
mod llm;
mod network;
mod probe;
mod retry;

pub use base_url::{check_base_url, ensure_openai_base_url_has_v1};
pub use embedding::{
    create_embedding_adapter, create_embedding_adapter_by_name, EmbeddingInterface,
};
pub use error::AdapterError;
pub use llm::{create_text_adapter, create_text_adapter_by_name, TextInterface};
pub use network::{build_client, AdapterOptions};
pub use probe::{
    spawn_embedding_probe, spawn_text_probe, test_embedding, test_text, ProbeError,
    ProbeHandle, ProbeOutcome, ProbeReport, EMBEDDING_PROBE_TEXT, TEXT_PROBE_PROMPT,
};
pub use retry::{call_with_retry, RetryConfig};

pub use quill_core::{EmbeddingModel, EmbeddingModelError, LanguageModel, LanguageModelError};
