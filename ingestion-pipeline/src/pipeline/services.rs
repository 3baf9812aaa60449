use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
};
use async_trait::async_trait;
use common::{error::AppError, utils::embedding::EmbeddingProvider};
use serde::Deserialize;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::warn;

use crate::{
    extraction::{ChunkContext, ExtractionResult},
    utils::llm_instructions::{
        adjudication_schema, extraction_schema, summary_schema, title_schema,
        CONTRADICTION_SYSTEM_MESSAGE, ENTITY_ADJUDICATION_SYSTEM_MESSAGE,
        EXTRACTION_SYSTEM_MESSAGE, SESSION_SUMMARY_SYSTEM_MESSAGE, TITLE_SYSTEM_MESSAGE,
    },
};

/// External collaborators of the ingestion pipeline: the triple extractor,
/// the batched adjudicator, the embedder and the post-hook generators.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    /// One structured extraction call per chunk. The context window is
    /// read-only material for reference resolution.
    async fn extract_triples(
        &self,
        chunk_text: &str,
        context: &ChunkContext,
    ) -> Result<ExtractionResult, AppError>;

    /// Batched same-concept adjudication over `(candidate, existing)` name
    /// pairs. The verdict array preserves input order.
    async fn adjudicate_entity_matches(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<bool>, AppError>;

    /// Batched contradiction adjudication over `(candidate fact, existing
    /// fact)` pairs. The verdict array preserves input order.
    async fn adjudicate_contradictions(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<bool>, AppError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;

    async fn generate_title(&self, content: &str) -> Result<String, AppError>;

    async fn summarize_session(&self, contents: &[String]) -> Result<String, AppError>;
}

pub struct DefaultPipelineServices {
    openai_client: async_openai::Client<async_openai::config::OpenAIConfig>,
    embedding_provider: EmbeddingProvider,
    chat_model: String,
}

impl DefaultPipelineServices {
    pub fn new(
        openai_client: async_openai::Client<async_openai::config::OpenAIConfig>,
        embedding_provider: EmbeddingProvider,
        chat_model: impl Into<String>,
    ) -> Self {
        Self {
            openai_client,
            embedding_provider,
            chat_model: chat_model.into(),
        }
    }

    async fn structured_call<T>(
        &self,
        system_message: &str,
        user_message: String,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<T, AppError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: schema_name.into(),
                schema: Some(schema),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.chat_model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system_message).into(),
                ChatCompletionRequestUserMessage::from(user_message).into(),
            ])
            .response_format(response_format)
            .build()?;

        let response = self.openai_client.chat().create(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or(AppError::LLMParsing(
                "No content found in LLM response".into(),
            ))?;

        serde_json::from_str::<T>(content)
            .map_err(|e| AppError::LLMParsing(format!("Failed to parse LLM response: {e}")))
    }

    /// Render adjudication pairs as a numbered list the model answers in
    /// order.
    fn render_pairs(pairs: &[(String, String)], left: &str, right: &str) -> String {
        pairs
            .iter()
            .enumerate()
            .map(|(index, (candidate, existing))| {
                format!("{index}. {left}: {candidate}\n   {right}: {existing}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn adjudicate(
        &self,
        system_message: &str,
        rendered_pairs: String,
        expected: usize,
    ) -> Result<Vec<bool>, AppError> {
        #[derive(Deserialize)]
        struct Verdicts {
            verdicts: Vec<bool>,
        }

        let result: Verdicts = self
            .structured_call(
                system_message,
                rendered_pairs,
                "adjudication",
                adjudication_schema(),
            )
            .await
            .map_err(|err| AppError::Adjudication(err.to_string()))?;

        if result.verdicts.len() != expected {
            return Err(AppError::Adjudication(format!(
                "adjudicator returned {} verdicts for {expected} pairs",
                result.verdicts.len()
            )));
        }

        Ok(result.verdicts)
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn extract_triples(
        &self,
        chunk_text: &str,
        context: &ChunkContext,
    ) -> Result<ExtractionResult, AppError> {
        let context_block = context.render();
        let user_message = if context_block.is_empty() {
            format!("Current chunk:\n{chunk_text}")
        } else {
            format!("{context_block}\n\nCurrent chunk:\n{chunk_text}")
        };

        // The extraction call is the flakiest model interaction in the
        // pipeline; retry schema-invalid payloads before surfacing
        // `Extraction` to fail the episode.
        let retry_strategy = ExponentialBackoff::from_millis(200).map(jitter).take(2);
        Retry::spawn(retry_strategy, || {
            self.structured_call::<ExtractionResult>(
                EXTRACTION_SYSTEM_MESSAGE,
                user_message.clone(),
                "triple_extraction",
                extraction_schema(),
            )
        })
        .await
        .map_err(|err| {
            warn!(error = %err, "triple extraction exhausted retries");
            AppError::Extraction(err.to_string())
        })
    }

    async fn adjudicate_entity_matches(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<bool>, AppError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let rendered = Self::render_pairs(pairs, "Candidate", "Existing");
        self.adjudicate(ENTITY_ADJUDICATION_SYSTEM_MESSAGE, rendered, pairs.len())
            .await
    }

    async fn adjudicate_contradictions(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<bool>, AppError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let rendered = Self::render_pairs(pairs, "New fact", "Existing fact");
        self.adjudicate(CONTRADICTION_SYSTEM_MESSAGE, rendered, pairs.len())
            .await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.embedding_provider.embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        self.embedding_provider.embed_batch(texts).await
    }

    async fn generate_title(&self, content: &str) -> Result<String, AppError> {
        #[derive(Deserialize)]
        struct Title {
            title: String,
        }

        let result: Title = self
            .structured_call(
                TITLE_SYSTEM_MESSAGE,
                format!("Content:\n{content}"),
                "title",
                title_schema(),
            )
            .await?;

        Ok(result.title)
    }

    async fn summarize_session(&self, contents: &[String]) -> Result<String, AppError> {
        #[derive(Deserialize)]
        struct Summary {
            summary: String,
        }

        let rendered = contents
            .iter()
            .enumerate()
            .map(|(index, content)| format!("Episode {index}:\n{content}"))
            .collect::<Vec<_>>()
            .join("\n\n");

        let result: Summary = self
            .structured_call(
                SESSION_SUMMARY_SYSTEM_MESSAGE,
                rendered,
                "session_summary",
                summary_schema(),
            )
            .await?;

        Ok(result.summary)
    }
}
