use std::collections::HashMap;

use crate::EpisodeCandidate;

/// Episode ranking after reciprocal-rank fusion across sub-plan lists.
#[derive(Debug, Clone)]
pub struct FusedEpisode {
    pub episode_id: String,
    pub score: f32,
    pub matched_statement_ids: Vec<String>,
}

pub const fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// Reciprocal-rank fusion: `score = sum over lists of 1 / (k + rank)`.
/// Matched statements from every contributing list are unioned per episode.
pub fn rrf_fuse(ranked_lists: &[Vec<EpisodeCandidate>], k: f32) -> Vec<FusedEpisode> {
    let mut fused: HashMap<String, FusedEpisode> = HashMap::new();

    for list in ranked_lists {
        for (rank, candidate) in list.iter().enumerate() {
            let contribution = 1.0 / (k + rank as f32 + 1.0);
            let entry = fused
                .entry(candidate.episode_id.clone())
                .or_insert_with(|| FusedEpisode {
                    episode_id: candidate.episode_id.clone(),
                    score: 0.0,
                    matched_statement_ids: Vec::new(),
                });
            entry.score += contribution;
            for statement_id in &candidate.matched_statement_ids {
                if !entry.matched_statement_ids.contains(statement_id) {
                    entry.matched_statement_ids.push(statement_id.clone());
                }
            }
        }
    }

    let mut results: Vec<FusedEpisode> = fused.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.episode_id.cmp(&b.episode_id))
    });

    results
}
