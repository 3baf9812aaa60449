use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
};
use async_trait::async_trait;
use common::{error::AppError, utils::embedding::EmbeddingProvider};
use serde::Deserialize;
use serde_json::json;

use crate::planner::SearchMode;

/// External collaborators of the retrieval engine: the query classifier, the
/// query embedder, and the query-entity extractor.
#[async_trait]
pub trait QueryServices: Send + Sync {
    async fn classify_query(&self, query: &str) -> Result<Vec<SearchMode>, AppError>;

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, AppError>;

    /// Names of entities the query mentions, used to seed graph traversal.
    async fn extract_query_entities(&self, query: &str) -> Result<Vec<String>, AppError>;
}

const CLASSIFY_SYSTEM_MESSAGE: &str = "You route a search query over a personal \
knowledge graph to one or more retrieval strategies. Pick every strategy that \
fits: lexical (exact words matter), semantic (meaning matters), entity (the \
query names specific people or things), temporal (the query is anchored in \
time), relationship (the query asks how entities relate), exploratory (the \
query is broad or open-ended). Answer with the strategy list only.";

const ENTITY_EXTRACTION_SYSTEM_MESSAGE: &str = "Extract the names of concrete \
entities (people, organizations, places, products) mentioned in the query. \
Return only names that appear in the query, without honorifics or articles.";

pub struct DefaultQueryServices {
    openai_client: async_openai::Client<async_openai::config::OpenAIConfig>,
    embedding_provider: EmbeddingProvider,
    chat_model: String,
}

impl DefaultQueryServices {
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
}

#[derive(Deserialize)]
struct ClassificationResult {
    strategies: Vec<SearchMode>,
}

#[derive(Deserialize)]
struct EntityExtractionResult {
    entities: Vec<String>,
}

#[async_trait]
impl QueryServices for DefaultQueryServices {
    async fn classify_query(&self, query: &str) -> Result<Vec<SearchMode>, AppError> {
        let schema = json!({
            "type": "object",
            "properties": {
                "strategies": {
                    "type": "array",
                    "items": {
                        "type": "string",
                        "enum": [
                            "lexical",
                            "semantic",
                            "entity",
                            "temporal",
                            "relationship",
                            "exploratory"
                        ]
                    }
                }
            },
            "required": ["strategies"],
            "additionalProperties": false
        });

        let result: ClassificationResult = self
            .structured_call(
                CLASSIFY_SYSTEM_MESSAGE,
                format!("Query:\n{query}"),
                "query_classification",
                schema,
            )
            .await?;

        Ok(result.strategies)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, AppError> {
        self.embedding_provider.embed(query).await
    }

    async fn extract_query_entities(&self, query: &str) -> Result<Vec<String>, AppError> {
        let schema = json!({
            "type": "object",
            "properties": {
                "entities": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["entities"],
            "additionalProperties": false
        });

        let result: EntityExtractionResult = self
            .structured_call(
                ENTITY_EXTRACTION_SYSTEM_MESSAGE,
                format!("Query:\n{query}"),
                "query_entities",
                schema,
            )
            .await?;

        Ok(result.entities)
    }
}
