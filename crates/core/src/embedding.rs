use std::error::Error as StdError;
use std::fmt;

use log::error;

#[derive(Debug)]
pub struct EmbeddingModelError {
    inner: Box<dyn StdError + Send + Sync>,
}

impl EmbeddingModelError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Box::new(error),
        }
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.inner
    }

    pub fn as_inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }
}

impl fmt::Display for EmbeddingModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl StdError for EmbeddingModelError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// Embedding capability.
///
/// The `try_*` methods surface failures; `embed_query` and `embed_documents`
/// are the consumer-facing calls used by retrieval, which log the failure
/// and fall back to empty vectors.
pub trait EmbeddingModel: Send + Sync {
    fn try_embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingModelError>;

    /// Batch embedding. The default issues one `try_embed_query` per text,
    /// so the output always lines up with the input.
    fn try_embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingModelError> {
        texts
            .iter()
            .map(|text| self.try_embed_query(text))
            .collect()
    }

    fn embed_query(&self, text: &str) -> Vec<f32> {
        match self.try_embed_query(text) {
            Ok(vector) => vector,
            Err(err) => {
                error!("embed_query failed: {err}");
                Vec::new()
            }
        }
    }

    /// Never changes the length of the batch: a failed batch yields one
    /// empty vector per input.
    fn embed_documents(&self, texts: &[String]) -> Vec<Vec<f32>> {
        match self.try_embed_documents(texts) {
            Ok(vectors) if vectors.len() == texts.len() => vectors,
            Ok(vectors) => {
                error!(
                    "embed_documents returned {} vectors for {} inputs",
                    vectors.len(),
                    texts.len()
                );
                vec![Vec::new(); texts.len()]
            }
            Err(err) => {
                error!("embed_documents failed: {err}");
                vec![Vec::new(); texts.len()]
            }
        }
    }
}
