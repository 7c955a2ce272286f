use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use quill_core::{GlobalConfig, LanguageModel, LanguageModelError, ProviderProfile};

use crate::base_url::{check_base_url, or_default};
use crate::error::AdapterError;
use crate::network::{AdapterOptions, LazyClient};
use crate::retry::{call_with_retry, RetryConfig};

const GEMINI_DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const AZURE_AI_DEFAULT_API_VERSION: &str = "2024-05-01-preview";

static AZURE_OPENAI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(https?)://([^/]+)/openai/deployments/([^/]+)/chat/completions\?api-version=([^/?&]+)",
    )
    .expect("valid regex for Azure OpenAI endpoint")
});

static AZURE_AI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^https://([^.]+)\.services\.ai\.azure\.com(?:/models)?(?:/chat/completions)?(?:\?api-version=([^&]+))?",
    )
    .expect("valid regex for Azure AI endpoint")
});

static RETRY_DELAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"retry[_ ]?delay[^0-9]*(\d+)").expect("valid regex for retry delay")
});

/// Text providers this crate can talk to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextInterface {
    OpenAi,
    DeepSeek,
    Ollama,
    MlStudio,
    AliyunBailian,
    VolcEngine,
    SiliconFlow,
    Grok,
    AzureOpenAi,
    AzureAi,
    Gemini,
}

impl TextInterface {
    pub const ALL: [TextInterface; 11] = [
        TextInterface::OpenAi,
        TextInterface::DeepSeek,
        TextInterface::Ollama,
        TextInterface::MlStudio,
        TextInterface::AliyunBailian,
        TextInterface::VolcEngine,
        TextInterface::SiliconFlow,
        TextInterface::Grok,
        TextInterface::AzureOpenAi,
        TextInterface::AzureAi,
        TextInterface::Gemini,
    ];

    /// Name as stored in `interface_format`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TextInterface::OpenAi => "OpenAI",
            TextInterface::DeepSeek => "DeepSeek",
            TextInterface::Ollama => "Ollama",
            TextInterface::MlStudio => "ML Studio",
            TextInterface::AliyunBailian => "阿里云百炼",
            TextInterface::VolcEngine => "火山引擎",
            TextInterface::SiliconFlow => "硅基流动",
            TextInterface::Grok => "Grok",
            TextInterface::AzureOpenAi => "Azure OpenAI",
            TextInterface::AzureAi => "Azure AI",
            TextInterface::Gemini => "Gemini",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            TextInterface::OpenAi => "https://api.openai.com/v1",
            TextInterface::DeepSeek => "https://api.deepseek.com/v1",
            TextInterface::Ollama => "http://localhost:11434/v1",
            TextInterface::MlStudio => "http://localhost:1234/v1",
            TextInterface::AliyunBailian => "https://dashscope.aliyuncs.com/compatible-mode/v1",
            TextInterface::VolcEngine => "https://ark.cn-beijing.volces.com/api/v3",
            TextInterface::SiliconFlow => "https://api.siliconflow.cn/v1",
            TextInterface::Grok => "https://api.x.ai/v1",
            TextInterface::Gemini => GEMINI_DEFAULT_BASE_URL,
            TextInterface::AzureOpenAi | TextInterface::AzureAi => "",
        }
    }

    fn system_prompt(&self) -> Option<&'static str> {
        match self {
            TextInterface::VolcEngine | TextInterface::SiliconFlow => {
                Some("你是DeepSeek，是一个 AI 人工智能助手")
            }
            TextInterface::Grok => Some("You are Grok, created by xAI."),
            TextInterface::AzureOpenAi | TextInterface::AzureAi | TextInterface::Gemini => None,
            _ => Some("You are a helpful assistant."),
        }
    }
}

impl fmt::Display for TextInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TextInterface {
    type Err = AdapterError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let wanted = input.trim().to_lowercase();
        TextInterface::ALL
            .into_iter()
            .find(|interface| interface.as_str().to_lowercase() == wanted)
            .ok_or_else(|| AdapterError::unsupported("text", input))
    }
}

/// Builds the adapter for `profile`. Only an unknown `interface_format`
/// fails here; credentials and URLs are checked on the first call.
pub fn create_text_adapter(
    profile: &ProviderProfile,
    options: &AdapterOptions,
) -> Result<Box<dyn LanguageModel>, AdapterError> {
    let interface: TextInterface = profile.interface_format.parse()?;
    let client = LazyClient::new(&options.network, profile.timeout());

    let adapter: Box<dyn LanguageModel> = match interface {
        TextInterface::Gemini => Box::new(GeminiAdapter {
            profile: profile.clone(),
            client,
            retry: options.retry,
        }),
        interface => Box::new(ChatCompletionsAdapter {
            interface,
            profile: profile.clone(),
            client,
            retry: options.retry,
        }),
    };
    Ok(adapter)
}

/// Looks `name` up in `config.llm_configs` and builds its adapter.
pub fn create_text_adapter_by_name(
    config: &GlobalConfig,
    name: &str,
    options: &AdapterOptions,
) -> Result<Box<dyn LanguageModel>, AdapterError> {
    let profile = config
        .get_llm_profile(name)
        .ok_or_else(|| AdapterError::InvalidConfig(format!("unknown LLM profile `{name}`")))?;
    create_text_adapter(profile, options)
}

fn require(value: &str, what: &str) -> Result<(), AdapterError> {
    if value.trim().is_empty() {
        Err(AdapterError::InvalidConfig(format!("{what} must not be empty")))
    } else {
        Ok(())
    }
}

fn non_zero(max_tokens: u32) -> Option<u32> {
    (max_tokens != 0).then_some(max_tokens)
}

enum Auth {
    None,
    Bearer(String),
    ApiKeyHeader(String),
}

impl Auth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Auth::None => request,
            Auth::Bearer(key) => request.bearer_auth(key),
            Auth::ApiKeyHeader(key) => request.header("api-key", key.as_str()),
        }
    }
}

/// Where and how a chat-completions request is sent, resolved per call.
struct ChatEndpoint {
    url: String,
    auth: Auth,
    include_model: bool,
    include_max_output_tokens: bool,
}

/// Every provider speaking the OpenAI chat-completions dialect, Azure
/// deployments included.
struct ChatCompletionsAdapter {
    interface: TextInterface,
    profile: ProviderProfile,
    client: LazyClient,
    retry: RetryConfig,
}

impl ChatCompletionsAdapter {
    fn endpoint(&self) -> Result<ChatEndpoint, AdapterError> {
        let profile = &self.profile;
        match self.interface {
            TextInterface::AzureOpenAi => {
                require(&profile.api_key, "Azure OpenAI api_key")?;
                let captures = AZURE_OPENAI_RE.captures(profile.base_url.trim()).ok_or_else(|| {
                    AdapterError::InvalidConfig(
                        "Invalid Azure OpenAI base_url format. Expected https://<resource>.openai.azure.com/openai/deployments/<deployment>/chat/completions?api-version=<version>"
                            .to_string(),
                    )
                })?;
                Ok(ChatEndpoint {
                    url: format!(
                        "{}://{}/openai/deployments/{}/chat/completions?api-version={}",
                        &captures[1], &captures[2], &captures[3], &captures[4]
                    ),
                    auth: Auth::ApiKeyHeader(profile.api_key.clone()),
                    include_model: false,
                    include_max_output_tokens: false,
                })
            }
            TextInterface::AzureAi => {
                require(&profile.api_key, "Azure AI api_key")?;
                let captures = AZURE_AI_RE.captures(profile.base_url.trim()).ok_or_else(|| {
                    AdapterError::InvalidConfig(
                        "Invalid Azure AI base_url format. Expected https://<endpoint>.services.ai.azure.com/models/chat/completions?api-version=<version>"
                            .to_string(),
                    )
                })?;
                let api_version = captures
                    .get(2)
                    .map_or(AZURE_AI_DEFAULT_API_VERSION, |m| m.as_str());
                Ok(ChatEndpoint {
                    url: format!(
                        "https://{}.services.ai.azure.com/models/{}/chat/completions?api-version={api_version}",
                        &captures[1], profile.model_name
                    ),
                    auth: Auth::ApiKeyHeader(profile.api_key.clone()),
                    include_model: false,
                    include_max_output_tokens: true,
                })
            }
            interface => {
                let base = check_base_url(or_default(
                    &profile.base_url,
                    interface.default_base_url(),
                ));
                require(&base, "base_url")?;
                require(&profile.model_name, "model_name")?;
                let key = profile.api_key.trim();
                Ok(ChatEndpoint {
                    url: format!("{}/chat/completions", base.trim_end_matches('/')),
                    auth: if key.is_empty() {
                        Auth::None
                    } else {
                        Auth::Bearer(key.to_string())
                    },
                    include_model: true,
                    include_max_output_tokens: false,
                })
            }
        }
    }

    fn invoke_once(
        &self,
        client: &Client,
        endpoint: &ChatEndpoint,
        prompt: &str,
    ) -> Result<String, AdapterError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.interface.system_prompt() {
            messages.push(ChatMessageRequest {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessageRequest {
            role: "user",
            content: prompt,
        });

        let max_tokens = non_zero(self.profile.max_tokens);
        let body = ChatCompletionRequest {
            model: endpoint
                .include_model
                .then_some(self.profile.model_name.as_str()),
            messages,
            max_tokens,
            max_output_tokens: max_tokens.filter(|_| endpoint.include_max_output_tokens),
            temperature: Some(self.profile.temperature),
        };

        let request = endpoint.auth.apply(client.post(&endpoint.url));
        let response = request.json(&body).send()?;
        handle_chat_response(response)
    }
}

impl LanguageModel for ChatCompletionsAdapter {
    fn invoke(&self, prompt: &str) -> Result<String, LanguageModelError> {
        let endpoint = self.endpoint().map_err(LanguageModelError::new)?;
        let client = self.client.get().map_err(LanguageModelError::new)?;
        call_with_retry(|| self.invoke_once(client, &endpoint, prompt), &self.retry)
            .map_err(LanguageModelError::new)
    }
}

/// Native Gemini `generateContent` API.
struct GeminiAdapter {
    profile: ProviderProfile,
    client: LazyClient,
    retry: RetryConfig,
}

impl GeminiAdapter {
    fn url(&self) -> Result<String, AdapterError> {
        require(&self.profile.api_key, "Gemini api_key")?;
        require(&self.profile.model_name, "Gemini model_name")?;
        let base = or_default(&self.profile.base_url, GEMINI_DEFAULT_BASE_URL);
        Ok(format!(
            "{}/models/{}:generateContent",
            base.trim_end_matches('/'),
            self.profile.model_name.trim()
        ))
    }

    fn invoke_once(&self, client: &Client, url: &str, prompt: &str) -> Result<String, AdapterError> {
        let request = GeminiRequest {
            contents: vec![GeminiRequestContent {
                role: "user",
                parts: vec![GeminiRequestPart { text: prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.profile.max_tokens,
                temperature: self.profile.temperature,
            },
        };

        let response = client
            .post(url)
            .query(&[("key", self.profile.api_key.trim())])
            .json(&request)
            .send()?;
        let response = ensure_success(response)?;
        let parsed: GeminiResponse = response.json()?;
        parse_gemini_response(parsed)
    }

    /// Back-off for quota errors: the server's `retryDelay` plus
    /// `rate_limit_backoff` when present, otherwise exponential from
    /// `rate_limit_backoff`.
    fn rate_limit_delay(&self, err: &AdapterError, attempt: usize) -> Option<Duration> {
        let AdapterError::HttpStatus { status, body } = err else {
            return None;
        };
        let lower = body.to_ascii_lowercase();
        let limited = *status == StatusCode::TOO_MANY_REQUESTS
            || lower.contains("quota")
            || lower.contains("rate limit");
        if !limited {
            return None;
        }
        let base = self.retry.rate_limit_backoff;
        if let Some(secs) = parse_retry_delay(body) {
            return Some(Duration::from_secs(secs).saturating_add(base));
        }
        let multiplier = 1u32.checked_shl(attempt as u32).unwrap_or(1);
        Some(base.checked_mul(multiplier).unwrap_or(base))
    }
}

impl LanguageModel for GeminiAdapter {
    fn invoke(&self, prompt: &str) -> Result<String, LanguageModelError> {
        let url = self.url().map_err(LanguageModelError::new)?;
        let client = self.client.get().map_err(LanguageModelError::new)?;
        let attempts = self.retry.max_retries.max(1);

        for attempt in 0..attempts {
            let err = match self.invoke_once(client, &url, prompt) {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };
            let delay = if attempt + 1 < attempts {
                self.rate_limit_delay(&err, attempt)
            } else {
                None
            };
            let Some(delay) = delay else {
                return Err(LanguageModelError::new(err));
            };
            warn!(
                "Gemini rate limit encountered, retrying in {delay:?} (attempt {}/{attempts})",
                attempt + 1
            );
            thread::sleep(delay);
        }

        Err(LanguageModelError::new(AdapterError::EmptyResponse))
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

fn handle_chat_response(response: Response) -> Result<String, AdapterError> {
    let parsed: ChatCompletionResponse = ensure_success(response)?.json()?;
    extract_choice_content(parsed).ok_or(AdapterError::EmptyResponse)
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

fn extract_choice_content(response: ChatCompletionResponse) -> Option<String> {
    response.choices.into_iter().find_map(|choice| {
        choice
            .message
            .and_then(|message| message.content)
            .or(choice.text)
            .filter(|content| !content.trim().is_empty())
    })
}

#[derive(Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiRequestContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiRequestContent<'a> {
    role: &'static str,
    parts: Vec<GeminiRequestPart<'a>>,
}

#[derive(Serialize)]
struct GeminiRequestPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

fn parse_gemini_response(response: GeminiResponse) -> Result<String, AdapterError> {
    for candidate in response.candidates {
        match candidate.finish_reason.as_deref() {
            Some("MAX_TOKENS") => warn!("Gemini response truncated due to max_tokens limit"),
            Some("SAFETY") => warn!("Gemini response blocked by safety filters"),
            Some("RECITATION") => warn!("Gemini response blocked due to recitation concerns"),
            _ => {}
        }

        let text: String = candidate
            .content
            .into_iter()
            .flat_map(|content| content.parts)
            .filter_map(|part| part.text)
            .collect();
        if !text.trim().is_empty() {
            return Ok(text);
        }
    }

    Err(AdapterError::EmptyResponse)
}

fn parse_retry_delay(body: &str) -> Option<u64> {
    let from_details = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/details")
                .and_then(|details| details.as_array())
                .and_then(|details| {
                    details.iter().find_map(|detail| {
                        detail
                            .get("retryDelay")
                            .or_else(|| detail.get("retry_delay"))
                            .and_then(parse_delay_value)
                    })
                })
        });

    from_details.or_else(|| {
        RETRY_DELAY_RE
            .captures(body)
            .and_then(|caps| caps.get(1))
            .and_then(|matched| matched.as_str().parse().ok())
    })
}

fn parse_delay_value(value: &serde_json::Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_str()
            .and_then(|text| text.trim_end_matches('s').parse().ok())
    })
}
