//! Nearest-neighbor semantic search over entity embeddings.

use serde::Serialize;
use tracing::{debug, warn};

use crate::memory::embedding::{Embedder, cosine_distance};
use crate::memory::error::Result;
use crate::memory::graph::Entity;
use crate::memory::storage::Database;

#[derive(Debug, Clone, Serialize)]
pub struct VectorMatch {
    pub entity: Entity,
    /// Cosine distance to the query; smaller is more similar.
    pub distance: f32,
}

pub struct VectorRankScorer<'a> {
    db: &'a Database,
    embedder: &'a dyn Embedder,
}

impl<'a> VectorRankScorer<'a> {
    pub fn new(db: &'a Database, embedder: &'a dyn Embedder) -> Self {
        Self { db, embedder }
    }

    pub fn enabled(&self) -> bool {
        self.embedder.vector_enabled()
    }

    /// Entities ordered by ascending cosine distance to `query`.
    ///
    /// Empty when embeddings are disabled or the query cannot be embedded.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<VectorMatch>> {
        if !self.enabled() || limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let Some(query_vector) = self.embedder.embed(query) else {
            warn!("Query embedding unavailable; skipping semantic search");
            return Ok(Vec::new());
        };

        let mut matches: Vec<VectorMatch> = self
            .db
            .entities_with_embeddings()?
            .into_iter()
            .filter_map(|mut entity| {
                let distance = cosine_distance(&query_vector, entity.embedding.as_deref()?)?;
                entity.embedding = None;
                Some(VectorMatch { entity, distance })
            })
            .collect();

        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        matches.truncate(limit);
        debug!(query = %query, returned = matches.len(), "Vector search");
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::embedding::DisabledEmbedder;
    use crate::memory::embedding::test_support::FixedEmbedder;
    use crate::memory::storage::test_support::{entity, temp_db};

    #[test]
    fn test_disabled_returns_empty() {
        let (_dir, db) = temp_db();
        let e = entity(&db, "Widget", "Gadget");
        db.set_entity_embedding(e.id, &[1.0, 0.0]).unwrap();
        let scorer = VectorRankScorer::new(&db, &DisabledEmbedder);
        assert!(scorer.search("widget", 5).unwrap().is_empty());
    }

    #[test]
    fn test_unembeddable_query_is_soft_failure() {
        let (_dir, db) = temp_db();
        let embedder = FixedEmbedder::default();
        let scorer = VectorRankScorer::new(&db, &embedder);
        assert!(scorer.search("unknown text", 5).unwrap().is_empty());
    }

    #[test]
    fn test_orders_by_ascending_distance() {
        let (_dir, db) = temp_db();
        let near = entity(&db, "Near", "Thing");
        let far = entity(&db, "Far", "Thing");
        let odd = entity(&db, "Odd", "Thing");
        entity(&db, "Unembedded", "Thing");
        db.set_entity_embedding(near.id, &[1.0, 0.1]).unwrap();
        db.set_entity_embedding(far.id, &[0.0, 1.0]).unwrap();
        db.set_entity_embedding(odd.id, &[1.0, 0.0, 0.0]).unwrap();

        let embedder = FixedEmbedder::default().with("query", vec![1.0, 0.0]);
        let results = VectorRankScorer::new(&db, &embedder).search("query", 5).unwrap();
        let ids: Vec<_> = results.iter().map(|m| m.entity.id).collect();
        assert_eq!(ids, vec![near.id, far.id]);
        assert!(results[0].distance < results[1].distance);

        let limited = VectorRankScorer::new(&db, &embedder).search("query", 1).unwrap();
        assert_eq!(limited.len(), 1);
    }
}
