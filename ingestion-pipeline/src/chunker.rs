use sha2::{Digest, Sha256};
use text_splitter::{ChunkCapacity, ChunkConfig, ChunkSizer, TextSplitter};

use common::error::AppError;

/// One ordered piece of an episode body. The hash is a stable content digest
/// used for chunk-level change detection between document versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub text: String,
    pub content_hash: String,
}

/// Sizer measuring chunks in approximate words rather than model tokens.
struct WordCount;

impl ChunkSizer for WordCount {
    fn size(&self, chunk: &str) -> usize {
        chunk.split_whitespace().count()
    }
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split an episode body into ordered chunks under a word budget. The
/// splitter packs paragraphs first and only descends to sentences when a
/// paragraph alone exceeds the budget.
pub fn chunk_body(body: &str, target_words: usize) -> Result<Vec<Chunk>, AppError> {
    if target_words == 0 {
        return Err(AppError::Validation(
            "chunk word budget must be greater than zero".into(),
        ));
    }

    let capacity = ChunkCapacity::new(target_words);
    let config = ChunkConfig::new(capacity).with_sizer(WordCount);
    let splitter = TextSplitter::new(config);

    let mut chunks: Vec<Chunk> = splitter
        .chunks(body)
        .enumerate()
        .map(|(index, text)| Chunk {
            index: index as u32,
            text: text.to_owned(),
            content_hash: content_hash(text),
        })
        .collect();

    if chunks.is_empty() {
        chunks.push(Chunk {
            index: 0,
            text: String::new(),
            content_hash: content_hash(""),
        });
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_bodies_stay_in_one_chunk() {
        let chunks = chunk_body("Alice works at Acme.", 100).expect("chunking");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "Alice works at Acme.");
    }

    #[test]
    fn paragraphs_are_not_split_mid_way_when_they_fit() {
        let body = "First paragraph about one topic.\n\nSecond paragraph about another topic.";
        let chunks = chunk_body(body, 6).expect("chunking");

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.contains("First paragraph"));
        assert!(chunks[1].text.contains("Second paragraph"));
    }

    #[test]
    fn indexes_are_contiguous_and_hashes_stable() {
        let body = (0..40)
            .map(|i| format!("Sentence number {i} fills out the body."))
            .collect::<Vec<_>>()
            .join(" ");

        let first = chunk_body(&body, 20).expect("chunking");
        let second = chunk_body(&body, 20).expect("chunking");

        assert!(first.len() > 1);
        for (position, chunk) in first.iter().enumerate() {
            assert_eq!(chunk.index as usize, position);
        }
        let first_hashes: Vec<&str> = first.iter().map(|c| c.content_hash.as_str()).collect();
        let second_hashes: Vec<&str> = second.iter().map(|c| c.content_hash.as_str()).collect();
        assert_eq!(first_hashes, second_hashes);
    }

    #[test]
    fn empty_body_yields_a_single_empty_chunk() {
        let chunks = chunk_body("", 50).expect("chunking");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "");
    }

    #[test]
    fn zero_budget_is_a_validation_error() {
        let err = chunk_body("anything", 0).expect_err("must fail");
        assert!(matches!(err, AppError::Validation(_)));
    }
}
