use async_openai::types::CreateEmbeddingRequestArgs;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::debug;

use crate::error::AppError;

/// Text-to-vector provider backed by the OpenAI embeddings endpoint.
///
/// Model and dimensions are fixed at construction so every namespace in the
/// vector store carries vectors of one dimension.
#[derive(Clone)]
pub struct EmbeddingProvider {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    model: String,
    dimensions: u32,
}

impl EmbeddingProvider {
    pub fn new(
        client: async_openai::Client<async_openai::config::OpenAIConfig>,
        model: impl Into<String>,
        dimensions: u32,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> u32 {
        self.dimensions
    }

    /// Embed a single input. Retries transient failures with jittered
    /// exponential backoff before giving up.
    pub async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let inputs = [input.to_owned()];
        let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
        let embeddings = Retry::spawn(retry_strategy, || self.request(&inputs)).await?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| AppError::LLMParsing("No embedding data received".into()))
    }

    /// Embed a batch of inputs in one request, preserving order.
    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
        let embeddings = Retry::spawn(retry_strategy, || self.request(inputs)).await?;

        if embeddings.len() != inputs.len() {
            return Err(AppError::LLMParsing(format!(
                "embedding batch returned {} vectors for {} inputs",
                embeddings.len(),
                inputs.len()
            )));
        }

        Ok(embeddings)
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .dimensions(self.dimensions)
            .input(inputs.to_vec())
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        let mut data = response.data;
        // The API does not guarantee response ordering; the index field does.
        data.sort_by_key(|entry| entry.index);

        debug!(
            count = data.len(),
            model = %self.model,
            "embeddings generated"
        );

        Ok(data.into_iter().map(|entry| entry.embedding).collect())
    }
}
