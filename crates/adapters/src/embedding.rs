use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use quill_core::{EmbeddingModel, EmbeddingModelError, EmbeddingProfile, GlobalConfig};

use crate::base_url::{ensure_openai_base_url_has_v1, or_default};
use crate::error::AdapterError;
use crate::network::{AdapterOptions, LazyClient};
use crate::retry::{call_with_retry, RetryConfig};

static AZURE_EMBEDDING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?)://([^/]+)/openai/deployments/([^/]+)/embeddings\?api-version=([^/?&]+)")
        .expect("valid regex for Azure OpenAI embedding endpoint")
});

/// Embedding providers this crate can talk to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EmbeddingInterface {
    OpenAi,
    AzureOpenAi,
    Ollama,
    MlStudio,
    Gemini,
    SiliconFlow,
    DashScope,
}

impl EmbeddingInterface {
    pub const ALL: [EmbeddingInterface; 7] = [
        EmbeddingInterface::OpenAi,
        EmbeddingInterface::AzureOpenAi,
        EmbeddingInterface::Ollama,
        EmbeddingInterface::MlStudio,
        EmbeddingInterface::Gemini,
        EmbeddingInterface::SiliconFlow,
        EmbeddingInterface::DashScope,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingInterface::OpenAi => "OpenAI",
            EmbeddingInterface::AzureOpenAi => "Azure OpenAI",
            EmbeddingInterface::Ollama => "Ollama",
            EmbeddingInterface::MlStudio => "ML Studio",
            EmbeddingInterface::Gemini => "Gemini",
            EmbeddingInterface::SiliconFlow => "SiliconFlow",
            EmbeddingInterface::DashScope => "DashScope",
        }
    }

    fn aliases(&self) -> &'static [&'static str] {
        match self {
            EmbeddingInterface::SiliconFlow => &["硅基流动"],
            EmbeddingInterface::DashScope => &["阿里云百炼"],
            _ => &[],
        }
    }

    /// Providers whose API embeds one text per request.
    pub fn is_single_item(&self) -> bool {
        matches!(
            self,
            EmbeddingInterface::Ollama
                | EmbeddingInterface::Gemini
                | EmbeddingInterface::MlStudio
                | EmbeddingInterface::DashScope
        )
    }
}

impl fmt::Display for EmbeddingInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingInterface {
    type Err = AdapterError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let wanted = input.trim().to_lowercase();
        EmbeddingInterface::ALL
            .into_iter()
            .find(|interface| {
                interface.as_str().to_lowercase() == wanted
                    || interface.aliases().contains(&wanted.as_str())
            })
            .ok_or_else(|| AdapterError::unsupported("embedding", input))
    }
}

/// Builds the embedding adapter for `profile`. As with text adapters, only
/// an unknown `interface_format` fails at construction.
pub fn create_embedding_adapter(
    profile: &EmbeddingProfile,
    options: &AdapterOptions,
) -> Result<Box<dyn EmbeddingModel>, AdapterError> {
    let interface: EmbeddingInterface = profile.interface_format.parse()?;
    let client = LazyClient::new(&options.network, profile.timeout());

    let adapter: Box<dyn EmbeddingModel> = if interface.is_single_item() {
        Box::new(SingleItemEmbeddingAdapter {
            interface,
            profile: profile.clone(),
            client,
            retry: options.retry,
        })
    } else {
        Box::new(BatchEmbeddingAdapter {
            interface,
            profile: profile.clone(),
            client,
            retry: options.retry,
        })
    };
    Ok(adapter)
}

pub fn create_embedding_adapter_by_name(
    config: &GlobalConfig,
    name: &str,
    options: &AdapterOptions,
) -> Result<Box<dyn EmbeddingModel>, AdapterError> {
    let profile = config.get_embedding_profile(name).ok_or_else(|| {
        AdapterError::InvalidConfig(format!("unknown embedding profile `{name}`"))
    })?;
    create_embedding_adapter(profile, options)
}

fn require(value: &str, what: &str) -> Result<(), AdapterError> {
    if value.trim().is_empty() {
        Err(AdapterError::InvalidConfig(format!("{what} must not be empty")))
    } else {
        Ok(())
    }
}

fn bearer(request: RequestBuilder, api_key: &str) -> RequestBuilder {
    let key = api_key.trim();
    if key.is_empty() {
        request
    } else {
        request.bearer_auth(key)
    }
}

fn ensure_success(response: Response) -> Result<Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(AdapterError::HttpStatus { status, body })
}

fn to_f32(values: Vec<f64>) -> Vec<f32> {
    values.into_iter().map(|v| v as f32).collect()
}

/// OpenAI-style `/embeddings` endpoints that accept a list of inputs.
struct BatchEmbeddingAdapter {
    interface: EmbeddingInterface,
    profile: EmbeddingProfile,
    client: LazyClient,
    retry: RetryConfig,
}

impl BatchEmbeddingAdapter {
    fn request(&self, client: &Client) -> Result<RequestBuilder, AdapterError> {
        let profile = &self.profile;
        if self.interface == EmbeddingInterface::AzureOpenAi {
            require(&profile.api_key, "Azure OpenAI embedding api_key")?;
            let captures = AZURE_EMBEDDING_RE.captures(profile.base_url.trim()).ok_or_else(|| {
                AdapterError::InvalidConfig(
                    "Invalid Azure OpenAI embedding base_url. Expected https://<resource>.openai.azure.com/openai/deployments/<deployment>/embeddings?api-version=<version>"
                        .to_string(),
                )
            })?;
            let url = format!(
                "{}://{}/openai/deployments/{}/embeddings?api-version={}",
                &captures[1], &captures[2], &captures[3], &captures[4]
            );
            return Ok(client.post(url).header("api-key", profile.api_key.trim()));
        }

        require(&profile.model_name, "embedding model_name")?;
        let default = match self.interface {
            EmbeddingInterface::SiliconFlow => "https://api.siliconflow.cn/v1",
            _ => "https://api.openai.com/v1",
        };
        let base = ensure_openai_base_url_has_v1(or_default(&profile.base_url, default));
        let url = format!("{}/embeddings", base.trim_end_matches('/'));
        Ok(bearer(client.post(url), &profile.api_key))
    }

    fn embed(&self, client: &Client, texts: &[String]) -> Result<Vec<Vec<f32>>, AdapterError> {
        let mut payload = json!({ "input": texts });
        if self.interface != EmbeddingInterface::AzureOpenAi {
            payload["model"] = Value::from(self.profile.model_name.trim());
        }

        let response = self.request(client)?.json(&payload).send()?;
        let parsed: OpenAiEmbeddingResponse = ensure_success(response)?.json()?;
        let vectors = parsed.into_ordered_vectors();
        if vectors.len() != texts.len() {
            return Err(AdapterError::EmptyResponse);
        }
        Ok(vectors)
    }

    fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingModelError> {
        let client = self.client.get().map_err(EmbeddingModelError::new)?;
        call_with_retry(|| self.embed(client, texts), &self.retry).map_err(EmbeddingModelError::new)
    }
}

impl EmbeddingModel for BatchEmbeddingAdapter {
    fn try_embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingModelError> {
        self.embed_with_retry(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingModelError::new(AdapterError::EmptyResponse))
    }

    fn try_embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.embed_with_retry(texts)
    }
}

/// Providers that embed one text per request; batches are issued one item
/// at a time through the trait's default `try_embed_documents`, and a failed
/// item only empties its own slot in `embed_documents`.
struct SingleItemEmbeddingAdapter {
    interface: EmbeddingInterface,
    profile: EmbeddingProfile,
    client: LazyClient,
    retry: RetryConfig,
}

impl SingleItemEmbeddingAdapter {
    fn validate(&self) -> Result<(), AdapterError> {
        let profile = &self.profile;
        match self.interface {
            EmbeddingInterface::Ollama => require(&profile.model_name, "Ollama embedding model_name"),
            EmbeddingInterface::Gemini => {
                require(&profile.api_key, "Gemini embedding api_key")?;
                require(&profile.model_name, "Gemini embedding model_name")
            }
            EmbeddingInterface::DashScope => {
                require(&profile.api_key, "DashScope embedding api_key")?;
                require(&profile.model_name, "DashScope embedding model_name")
            }
            _ => require(&profile.model_name, "embedding model_name"),
        }
    }

    fn embed_once(&self, client: &Client, text: &str) -> Result<Vec<f32>, AdapterError> {
        let profile = &self.profile;
        let model = profile.model_name.trim();

        match self.interface {
            EmbeddingInterface::Ollama => {
                let url = normalize_ollama_url(or_default(&profile.base_url, "http://localhost:11434"));
                let payload = json!({ "model": model, "prompt": text });
                let response = client.post(url).json(&payload).send()?;
                let parsed: OllamaEmbeddingResponse = ensure_success(response)?.json()?;
                parsed
                    .embedding
                    .filter(|values| !values.is_empty())
                    .map(to_f32)
                    .ok_or(AdapterError::EmptyResponse)
            }
            EmbeddingInterface::Gemini => {
                let base = or_default(
                    &profile.base_url,
                    "https://generativelanguage.googleapis.com/v1beta",
                );
                let model_path = if model.starts_with("models/") {
                    model.to_string()
                } else {
                    format!("models/{model}")
                };
                let url = format!("{}/{model_path}:embedContent", base.trim_end_matches('/'));
                let payload = json!({
                    "model": model_path,
                    "content": { "parts": [ { "text": text } ] },
                });
                let response = client
                    .post(url)
                    .query(&[("key", profile.api_key.trim())])
                    .json(&payload)
                    .send()?;
                let parsed: GeminiEmbeddingResponse = ensure_success(response)?.json()?;
                parsed
                    .embedding
                    .map(GeminiEmbedding::into_values)
                    .filter(|values| !values.is_empty())
                    .map(to_f32)
                    .ok_or(AdapterError::EmptyResponse)
            }
            interface => {
                let url = if interface == EmbeddingInterface::DashScope {
                    let base = or_default(
                        &profile.base_url,
                        "https://dashscope.aliyuncs.com/compatible-mode/v1",
                    );
                    format!("{}/embeddings", base.trim_end_matches('/'))
                } else {
                    let base = ensure_openai_base_url_has_v1(or_default(
                        &profile.base_url,
                        "http://localhost:1234",
                    ));
                    format!("{}/embeddings", base.trim_end_matches('/'))
                };
                let payload = json!({ "model": model, "input": text });
                let response = bearer(client.post(url), &profile.api_key)
                    .json(&payload)
                    .send()?;
                let parsed: OpenAiEmbeddingResponse = ensure_success(response)?.json()?;
                parsed
                    .into_ordered_vectors()
                    .into_iter()
                    .next()
                    .filter(|vector| !vector.is_empty())
                    .ok_or(AdapterError::EmptyResponse)
            }
        }
    }
}

impl EmbeddingModel for SingleItemEmbeddingAdapter {
    fn try_embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingModelError> {
        self.validate().map_err(EmbeddingModelError::new)?;
        let client = self.client.get().map_err(EmbeddingModelError::new)?;
        call_with_retry(|| self.embed_once(client, text), &self.retry)
            .map_err(EmbeddingModelError::new)
    }

    fn embed_documents(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|text| self.embed_query(text)).collect()
    }
}

/// Accepts `http://host:11434`, `.../v1` or a full `/api/embeddings` URL.
fn normalize_ollama_url(base_url: &str) -> String {
    let mut url = base_url.trim().trim_end_matches('/').to_string();
    if url.ends_with("/api/embeddings") {
        return url;
    }
    if let Some(index) = url.find("/v1") {
        url.truncate(index);
    }
    if url.ends_with("/api") {
        url.push_str("/embeddings");
    } else {
        url.push_str("/api/embeddings");
    }
    url
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    #[serde(default)]
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f64>,
}

impl OpenAiEmbeddingResponse {
    fn into_ordered_vectors(mut self) -> Vec<Vec<f32>> {
        if self.data.iter().all(|item| item.index.is_some()) {
            self.data.sort_by_key(|item| item.index);
        }
        self.data
            .into_iter()
            .map(|item| to_f32(item.embedding))
            .collect()
    }
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    #[serde(default)]
    embedding: Option<Vec<f64>>,
}

#[derive(Deserialize)]
struct GeminiEmbeddingResponse {
    #[serde(default)]
    embedding: Option<GeminiEmbedding>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GeminiEmbedding {
    Values { values: Vec<f64> },
    Flat(Vec<f64>),
}

impl GeminiEmbedding {
    fn into_values(self) -> Vec<f64> {
        match self {
            GeminiEmbedding::Values { values } | GeminiEmbedding::Flat(values) => values,
        }
    }
}
