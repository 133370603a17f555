//! Entity search: weighted text ranking, semantic vector ranking and their
//! reciprocal-rank fusion.

pub mod hybrid;
pub mod text;
pub mod vector;

use serde::{Deserialize, Serialize};

pub use hybrid::{HybridRanker, RRF_K, RankedEntity};
pub use text::{TextMatch, TextRankScorer};
pub use vector::{VectorMatch, VectorRankScorer};

/// Entity field that contributed to a search hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    EntityType,
    Name,
    Aliases,
    /// Matched through embedding similarity
    Semantic,
}
