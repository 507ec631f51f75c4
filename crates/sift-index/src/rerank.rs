//! LLM relevance scoring of search candidates.
//!
//! Reranking never fails. When the model is unreachable or its reply is
//! unusable, every candidate gets the default score and the similarity order
//! is kept.

use std::fmt::Write as _;

use schemars::JsonSchema;
use serde::Deserialize;
use sift_llm::{ChatOptions, LlmProvider, Message};

use crate::fragment::Fragment;
use crate::summarizer::truncate_chars;

const RERANK_TEMPERATURE: f32 = 0.1;
const MAX_SCORE: f32 = 10.0;
/// Characters of each candidate's embedded text shown to the model.
const CANDIDATE_TEXT_CHARS: usize = 500;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RankingItem {
    /// Position of the candidate in the prompt.
    pub fragment_id: usize,
    /// Relevance from 0 to 10.
    pub score: f32,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct Rankings {
    pub rankings: Vec<RankingItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RerankOutcome {
    /// One score per candidate; candidates the model skipped hold the default.
    Scored(Vec<f32>),
    /// The model could not be used; every candidate holds the default.
    Degraded { scores: Vec<f32>, reason: String },
}

impl RerankOutcome {
    #[must_use]
    pub fn scores(&self) -> &[f32] {
        match self {
            Self::Scored(scores) | Self::Degraded { scores, .. } => scores,
        }
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    /// Candidate positions by descending score. Equal scores keep their
    /// original (similarity) order.
    #[must_use]
    pub fn order(&self) -> Vec<usize> {
        let scores = self.scores();
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
        order
    }
}

/// Prompt listing every candidate by its metadata header.
#[must_use]
pub fn build_rerank_prompt(query: &str, candidates: &[Fragment]) -> String {
    let mut prompt = format!(
        "Rate the relevance (0-10) of each fragment to the query: \"{query}\"\n\n\
         Score based on:\n\
         - How directly the function/file relates to the query topic\n\
         - Whether the metadata (function name, file path, documentation) matches the query\n\
         - Use your judgment, but do not infer what the code does beyond what's stated\n\n\
         Fragments to rank:\n\n"
    );
    for (i, fragment) in candidates.iter().enumerate() {
        if i > 0 {
            prompt.push_str("---\n");
        }
        let _ = writeln!(
            prompt,
            "[Fragment {i}] {}\n{}",
            fragment.header(),
            truncate_chars(&fragment.text, CANDIDATE_TEXT_CHARS)
        );
    }
    let max_index = candidates.len().saturating_sub(1);
    let _ = write!(
        prompt,
        "\nProvide rankings as JSON with \"fragment_id\" (integer; 0-{max_index}) and \
         \"score\" (number 0-10)."
    );
    prompt
}

/// Score `candidates` against `query`.
pub async fn rerank<P: LlmProvider>(
    provider: &P,
    query: &str,
    candidates: &[Fragment],
    default_score: f32,
) -> RerankOutcome {
    let defaults = vec![default_score; candidates.len()];
    if candidates.is_empty() {
        return RerankOutcome::Scored(defaults);
    }

    let prompt = build_rerank_prompt(query, candidates);
    let rankings = match provider
        .chat_typed::<Rankings>(
            &[Message::user(prompt)],
            ChatOptions::with_temperature(RERANK_TEMPERATURE),
        )
        .await
    {
        Ok(rankings) => rankings,
        Err(e) => {
            tracing::warn!(error = %e, "rerank failed, using default scores");
            return RerankOutcome::Degraded {
                scores: defaults,
                reason: e.to_string(),
            };
        }
    };

    let mut scores: Vec<Option<f32>> = vec![None; candidates.len()];
    for item in rankings.rankings {
        if !item.score.is_finite() {
            continue;
        }
        if let Some(slot) = scores.get_mut(item.fragment_id)
            && slot.is_none()
        {
            *slot = Some(item.score.clamp(0.0, MAX_SCORE));
        }
    }

    let scored = scores.iter().filter(|s| s.is_some()).count();
    if scored == 0 {
        tracing::warn!("rerank reply scored no candidate, using default scores");
        return RerankOutcome::Degraded {
            scores: defaults,
            reason: "no usable rankings".into(),
        };
    }
    tracing::debug!(candidates = candidates.len(), scored, "rerank finished");
    RerankOutcome::Scored(
        scores
            .into_iter()
            .map(|s| s.unwrap_or(default_score))
            .collect(),
    )
}
