//! Knowledge graph memory engine.
//!
//! Entities, observations and typed relations live in SQLite. On top of the
//! store sit ranked search (text, vector and their fusion), tree export and
//! import, orphan detection and node consolidation.

pub mod consolidate;
pub mod embedding;
pub mod error;
pub mod export;
pub mod graph;
pub mod import;
pub mod orphans;
pub mod search;
pub mod storage;
pub mod tree;

pub use consolidate::{MergeReport, NodeConsolidator};
pub use embedding::{DisabledEmbedder, Embedder, HttpEmbedder, HttpEmbedderConfig, reindex_embeddings};
pub use error::{GraphError, Result};
pub use export::GraphExporter;
pub use graph::{Entity, EntityUpdate, GraphStats, NewEntity, Observation, Relation};
pub use import::{Decision, ImportExecutor, ImportMatcher, ImportMode, ImportReport};
pub use orphans::{OrphanMatcher, OrphanReport, ProjectMatch};
pub use search::{HybridRanker, MatchField, RankedEntity, TextRankScorer, VectorRankScorer};
pub use storage::Database;
pub use tree::{TreeDocument, TreeNode};
