use chrono::{DateTime, Utc};
use common::storage::types::statement::Aspect;
use serde::{Deserialize, Serialize};

/// One candidate triple produced by the extractor. Names are raw surface
/// forms; the resolver maps them onto canonical graph identities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripleCandidate {
    pub subject_name: String,
    pub predicate_name: String,
    pub object_name: String,
    pub fact: String,
    #[serde(default)]
    pub aspect: Option<Aspect>,
    #[serde(default)]
    pub attributes: Option<serde_json::Value>,
    #[serde(default)]
    pub valid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractionResult {
    pub candidates: Vec<TripleCandidate>,
}

/// Read-only context handed to the extractor alongside the current chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkContext {
    pub previous: Option<String>,
    pub next: Option<String>,
}

impl ChunkContext {
    /// Render the window for the prompt; absent neighbors are omitted.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if let Some(previous) = &self.previous {
            parts.push(format!("Previous chunk:\n{previous}"));
        }
        if let Some(next) = &self.next {
            parts.push(format!("Next chunk:\n{next}"));
        }
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_aspect_strings_degrade_to_attribute() {
        let raw = r#"{
            "subject_name": "Alice",
            "predicate_name": "works_at",
            "object_name": "Acme",
            "fact": "Alice works at Acme.",
            "aspect": "SomethingNew"
        }"#;

        let candidate: TripleCandidate = serde_json::from_str(raw).expect("parse");
        assert_eq!(candidate.aspect, Some(Aspect::Attribute));
    }

    #[test]
    fn context_render_skips_missing_neighbors() {
        let only_next = ChunkContext {
            previous: None,
            next: Some("next text".into()),
        };
        let rendered = only_next.render();
        assert!(rendered.contains("Next chunk"));
        assert!(!rendered.contains("Previous chunk"));

        assert_eq!(ChunkContext::default().render(), "");
    }
}
