use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unsupported {kind} interface_format `{format}`")]
    UnsupportedFormat { kind: &'static str, format: String },
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("API returned an empty response")]
    EmptyResponse,
    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<AdapterError>,
    },
}

impl AdapterError {
    pub fn retry_exhausted(attempts: usize, source: AdapterError) -> Self {
        AdapterError::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    pub(crate) fn unsupported(kind: &'static str, format: &str) -> Self {
        AdapterError::UnsupportedFormat {
            kind,
            format: format.to_string(),
        }
    }

    /// Configuration problems that no amount of retrying will fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AdapterError::UnsupportedFormat { .. } | AdapterError::InvalidConfig(_)
        )
    }
}
