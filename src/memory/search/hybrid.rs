//! Reciprocal Rank Fusion of text and vector rankings.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use super::MatchField;
use super::text::{TextMatch, TextRankScorer};
use super::vector::{VectorMatch, VectorRankScorer};
use crate::memory::embedding::Embedder;
use crate::memory::error::Result;
use crate::memory::graph::Entity;
use crate::memory::storage::Database;

/// Standard RRF damping constant.
pub const RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Serialize)]
pub struct RankedEntity {
    pub entity: Entity,
    pub score: f64,
    pub matched_fields: Vec<MatchField>,
}

pub struct HybridRanker<'a> {
    text: TextRankScorer<'a>,
    vector: VectorRankScorer<'a>,
}

impl<'a> HybridRanker<'a> {
    pub fn new(db: &'a Database, embedder: &'a dyn Embedder) -> Self {
        Self {
            text: TextRankScorer::new(db),
            vector: VectorRankScorer::new(db, embedder),
        }
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<RankedEntity>> {
        let candidates = limit.saturating_mul(2);
        let text_results = self.text.search(query, candidates)?;
        let vector_results = if self.vector.enabled() {
            self.vector.search(query, candidates)?
        } else {
            Vec::new()
        };

        if vector_results.is_empty() {
            return Ok(text_results
                .into_iter()
                .take(limit)
                .map(|m| RankedEntity {
                    entity: m.entity,
                    score: m.score as f64,
                    matched_fields: m.matched_fields,
                })
                .collect());
        }

        let fused = fuse(text_results, vector_results, limit);
        debug!(query = %query, returned = fused.len(), "Hybrid search");
        Ok(fused)
    }
}

struct Fused {
    entity: Entity,
    score: f64,
    matched_fields: Vec<MatchField>,
}

fn rrf(rank: usize) -> f64 {
    1.0 / (RRF_K + rank as f64 + 1.0)
}

/// Sum `1/(K + rank + 1)` over both lists, preferring text-side entities.
pub fn fuse(text: Vec<TextMatch>, vector: Vec<VectorMatch>, limit: usize) -> Vec<RankedEntity> {
    let mut order: Vec<i64> = Vec::new();
    let mut scores: HashMap<i64, Fused> = HashMap::new();

    for (rank, m) in text.into_iter().enumerate() {
        let id = m.entity.id;
        let slot = scores.entry(id).or_insert_with(|| {
            order.push(id);
            Fused {
                entity: m.entity,
                score: 0.0,
                matched_fields: Vec::new(),
            }
        });
        slot.score += rrf(rank);
        for field in m.matched_fields {
            if !slot.matched_fields.contains(&field) {
                slot.matched_fields.push(field);
            }
        }
    }

    for (rank, m) in vector.into_iter().enumerate() {
        let id = m.entity.id;
        let slot = scores.entry(id).or_insert_with(|| {
            order.push(id);
            Fused {
                entity: m.entity,
                score: 0.0,
                matched_fields: Vec::new(),
            }
        });
        slot.score += rrf(rank);
        if !slot.matched_fields.contains(&MatchField::Semantic) {
            slot.matched_fields.push(MatchField::Semantic);
        }
    }

    let mut fused: Vec<Fused> = order.into_iter().filter_map(|id| scores.remove(&id)).collect();
    fused.sort_by(|a, b| b.score.total_cmp(&a.score));
    fused
        .into_iter()
        .take(limit)
        .map(|f| RankedEntity {
            entity: f.entity,
            score: f.score,
            matched_fields: f.matched_fields,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::embedding::DisabledEmbedder;
    use crate::memory::embedding::test_support::FixedEmbedder;
    use crate::memory::storage::test_support::{entity, temp_db};

    #[test]
    fn test_text_only_when_vectors_disabled() {
        let (_dir, db) = temp_db();
        entity(&db, "Widget", "Gadget");
        entity(&db, "Gadget Pro", "Tool");
        entity(&db, "Gadget Mini", "Tool");
        let results = HybridRanker::new(&db, &DisabledEmbedder).search("gadget", 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].score, 22.0);
        assert_eq!(results[0].entity.name, "Widget");
    }

    #[test]
    fn test_rrf_fusion_combines_lists() {
        let (_dir, db) = temp_db();
        let both = entity(&db, "Gadget Pro", "Tool");
        let text_only = entity(&db, "Widget", "Gadget");
        let vector_only = entity(&db, "Thingamajig", "Device");
        db.set_entity_embedding(both.id, &[1.0, 0.0]).unwrap();
        db.set_entity_embedding(vector_only.id, &[0.9, 0.1]).unwrap();

        let embedder = FixedEmbedder::default().with("gadget", vec![1.0, 0.0]);
        let results = HybridRanker::new(&db, &embedder).search("gadget", 10).unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.entity.id).collect();

        // text ranks: Widget 0, Gadget Pro 1; vector ranks: Gadget Pro 0, Thingamajig 1
        assert_eq!(ids, vec![both.id, text_only.id, vector_only.id]);
        let expected = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((results[0].score - expected).abs() < 1e-12);
        assert!(results[0].matched_fields.contains(&MatchField::Semantic));
        assert!(results[0].matched_fields.contains(&MatchField::Name));
        assert_eq!(results[2].matched_fields, vec![MatchField::Semantic]);
    }

    #[test]
    fn test_fusion_respects_limit() {
        let (_dir, db) = temp_db();
        for i in 0..5 {
            let e = entity(&db, &format!("Gadget {}", i), "Tool");
            db.set_entity_embedding(e.id, &[1.0, i as f32]).unwrap();
        }
        let embedder = FixedEmbedder::default().with("gadget", vec![1.0, 0.0]);
        let results = HybridRanker::new(&db, &embedder).search("gadget", 3).unwrap();
        assert_eq!(results.len(), 3);
    }
}
