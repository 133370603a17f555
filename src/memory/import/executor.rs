//! Apply operator decisions to an import tree.
//!
//! The walk runs inside one transaction and every node inside its own
//! savepoint, so a failing node leaves nothing behind while its siblings and
//! children still run. `ImportMode` decides whether the successful part is
//! committed when some node failed.

use std::collections::HashMap;

use rusqlite::Connection;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ImportMode;
use crate::memory::error::{GraphError, Result};
use crate::memory::graph::{DEFAULT_PARENT_RELATION, Entity, NewEntity, merge_aliases};
use crate::memory::storage::{
    Database, entity_by_name, entity_by_name_and_type, insert_entity, insert_observation,
    insert_relation, observation_contents, refresh_observation_count, require_entity,
    update_aliases,
};
use crate::memory::tree::{TreeDocument, TreeNode, child_path, root_path};

/// What to do with one import node, keyed by its `node_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Create {
        #[serde(default)]
        parent_id: Option<i64>,
    },
    Merge {
        target_id: i64,
        #[serde(default)]
        parent_id: Option<i64>,
    },
    Skip {
        #[serde(default)]
        target_id: Option<i64>,
        #[serde(default)]
        parent_id: Option<i64>,
    },
    AddRelation {
        target_id: i64,
        #[serde(default)]
        parent_id: Option<i64>,
    },
}

impl Default for Decision {
    fn default() -> Self {
        Self::Create { parent_id: None }
    }
}

impl Decision {
    fn parent_override(&self) -> Option<i64> {
        match self {
            Self::Create { parent_id }
            | Self::Merge { parent_id, .. }
            | Self::Skip { parent_id, .. }
            | Self::AddRelation { parent_id, .. } => *parent_id,
        }
    }
}

/// Parse a `{node_path: decision}` object.
pub fn parse_decisions(value: serde_json::Value) -> Result<HashMap<String, Decision>> {
    if value.is_null() {
        return Ok(HashMap::new());
    }
    serde_json::from_value(value)
        .map_err(|e| GraphError::validation(format!("Invalid import decisions: {}", e)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub success: bool,
    pub entities_created: usize,
    pub entities_merged: usize,
    pub entities_skipped: usize,
    pub observations_created: usize,
    pub relations_created: usize,
    pub errors: Vec<String>,
    pub rolled_back: bool,
    /// Entities created or merged into, in walk order
    pub touched_ids: Vec<i64>,
}

#[derive(Debug, Default)]
struct NodeOutcome {
    resolved_id: Option<i64>,
    created: bool,
    merged: bool,
    skipped: bool,
    observations: usize,
    relations: usize,
}

pub struct ImportExecutor<'a> {
    db: &'a Database,
    mode: ImportMode,
}

impl<'a> ImportExecutor<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            mode: ImportMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ImportMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn execute(
        &self,
        document: &TreeDocument,
        decisions: &HashMap<String, Decision>,
    ) -> Result<ImportReport> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let mut report = ImportReport::default();

        for (i, node) in document.root_nodes.iter().enumerate() {
            walk(&tx, node, &root_path(i), None, decisions, &mut report)?;
        }
        report.success = report.errors.is_empty();

        if self.mode == ImportMode::Atomic && !report.success {
            tx.rollback()?;
            warn!(errors = report.errors.len(), "Atomic import rolled back");
            return Ok(ImportReport {
                errors: report.errors,
                rolled_back: true,
                ..ImportReport::default()
            });
        }

        tx.commit()?;
        info!(
            created = report.entities_created,
            merged = report.entities_merged,
            skipped = report.entities_skipped,
            observations = report.observations_created,
            relations = report.relations_created,
            errors = report.errors.len(),
            "Import applied"
        );
        Ok(report)
    }
}

fn walk(
    conn: &Connection,
    node: &TreeNode,
    path: &str,
    tree_parent: Option<i64>,
    decisions: &HashMap<String, Decision>,
    report: &mut ImportReport,
) -> Result<()> {
    let decision = decisions.get(path).cloned().unwrap_or_default();
    debug!(path, name = %node.name, ?decision, "Applying import node");

    conn.execute_batch("SAVEPOINT import_node")?;
    let resolved = match apply_node(conn, node, &decision, tree_parent) {
        Ok(outcome) => {
            conn.execute_batch("RELEASE import_node")?;
            report.entities_created += usize::from(outcome.created);
            report.entities_merged += usize::from(outcome.merged);
            report.entities_skipped += usize::from(outcome.skipped);
            report.observations_created += outcome.observations;
            report.relations_created += outcome.relations;
            if (outcome.created || outcome.merged)
                && let Some(id) = outcome.resolved_id
                && !report.touched_ids.contains(&id)
            {
                report.touched_ids.push(id);
            }
            outcome.resolved_id
        }
        Err(e) => {
            conn.execute_batch("ROLLBACK TO import_node; RELEASE import_node")?;
            warn!(path, name = %node.name, error = %e, "Import node failed");
            report.errors.push(format!("{} ({}): {}", node.name, path, e));
            None
        }
    };

    for (i, child) in node.children.iter().enumerate() {
        walk(conn, child, &child_path(path, i), resolved, decisions, report)?;
    }
    Ok(())
}

fn apply_node(
    conn: &Connection,
    node: &TreeNode,
    decision: &Decision,
    tree_parent: Option<i64>,
) -> Result<NodeOutcome> {
    let mut outcome = NodeOutcome::default();

    let entity_id = match decision {
        Decision::Skip { target_id, .. } => {
            outcome.skipped = true;
            outcome.resolved_id = match target_id {
                Some(id) => Some(require_entity(conn, *id)?.id),
                // children still hang off the exact (name, type) match
                None => entity_by_name_and_type(conn, node.name.trim(), node.entity_type.trim())?
                    .map(|e| e.id),
            };
            return Ok(outcome);
        }
        Decision::Create { .. } => match entity_by_name(conn, node.name.trim())? {
            Some(existing) => {
                debug!(id = existing.id, name = %existing.name, "Create falls back to merge");
                outcome.observations = merge_into(conn, &existing, node)?;
                outcome.merged = true;
                existing.id
            }
            None => {
                let (entity, observations) = create_from(conn, node)?;
                outcome.observations = observations;
                outcome.created = true;
                entity.id
            }
        },
        Decision::Merge { target_id, .. } | Decision::AddRelation { target_id, .. } => {
            let target = require_entity(conn, *target_id)?;
            outcome.observations = merge_into(conn, &target, node)?;
            outcome.merged = true;
            target.id
        }
    };
    outcome.resolved_id = Some(entity_id);

    if let Some(parent_id) = decision.parent_override().or(tree_parent) {
        let relation_type = node
            .relation_type
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_PARENT_RELATION);
        if parent_id == entity_id {
            warn!(entity_id, relation_type, "Skipping self-referencing import relation");
        } else {
            require_entity(conn, parent_id)?;
            if insert_relation(conn, entity_id, parent_id, relation_type)?.is_some() {
                outcome.relations = 1;
            }
        }
    }

    Ok(outcome)
}

fn create_from(conn: &Connection, node: &TreeNode) -> Result<(Entity, usize)> {
    let input = NewEntity {
        name: node.name.clone(),
        entity_type: node.entity_type.clone(),
        aliases: node.aliases.clone(),
        description: node.description.clone(),
        observations: Vec::new(),
    };
    let entity = insert_entity(conn, &input)?;
    for observation in &node.observations {
        insert_observation(conn, entity.id, &observation.content, observation.created_at.as_deref())?;
    }
    refresh_observation_count(conn, entity.id)?;
    Ok((entity, node.observations.len()))
}

/// Fold the node's aliases and unseen observations into `target`.
fn merge_into(conn: &Connection, target: &Entity, node: &TreeNode) -> Result<usize> {
    let aliases = merge_aliases([
        target.aliases.as_deref().unwrap_or(""),
        node.aliases.as_deref().unwrap_or(""),
    ]);
    if aliases != target.aliases {
        update_aliases(conn, target.id, aliases.as_deref())?;
    }

    let mut existing = observation_contents(conn, target.id)?;
    let mut added = 0;
    for observation in &node.observations {
        if existing.insert(observation.content.clone()) {
            insert_observation(conn, target.id, &observation.content, observation.created_at.as_deref())?;
            added += 1;
        }
    }
    refresh_observation_count(conn, target.id)?;
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::export::GraphExporter;
    use crate::memory::graph::GraphStats;
    use crate::memory::storage::test_support::{entity, link, temp_db};
    use crate::memory::tree::{TreeObservation, parse_document};
    use serde_json::json;

    fn node(name: &str, entity_type: &str) -> TreeNode {
        TreeNode::new(name, entity_type)
    }

    fn document(root_nodes: Vec<TreeNode>) -> TreeDocument {
        TreeDocument {
            version: "1.0".to_string(),
            exported_at: String::new(),
            root_nodes,
        }
    }

    #[test]
    fn test_export_then_create_import_round_trip() {
        let (_src_dir, src) = temp_db();
        let p = src
            .create_entity(&NewEntity::new("P", "Project").with_observations(["p1"]))
            .unwrap();
        let m = src
            .create_entity(&NewEntity::new("M", "Module").with_observations(["m1", "m2"]))
            .unwrap();
        let f = entity(&src, "F", "File");
        link(&src, &m, &p, "part_of");
        link(&src, &f, &m, "depends_on");
        let json = GraphExporter::new(&src).export_json(&[p.id]).unwrap();

        let (_dst_dir, dst) = temp_db();
        let doc = parse_document(&json).unwrap();
        let report = ImportExecutor::new(&dst).execute(&doc, &HashMap::new()).unwrap();

        assert!(report.success);
        assert_eq!(report.entities_created, 3);
        assert_eq!(report.observations_created, 3);
        assert_eq!(report.relations_created, 2);
        assert_eq!(dst.stats().unwrap(), src.stats().unwrap());

        let f_copy = dst.find_entity_by_name("F").unwrap().unwrap();
        let relations = dst.relations_for(f_copy.id).unwrap();
        assert_eq!(relations[0].relation_type, "depends_on");
    }

    #[test]
    fn test_create_falls_back_to_merge() {
        let (_dir, db) = temp_db();
        let svc = db
            .create_entity(
                &NewEntity::new("Svc", "Service")
                    .with_aliases("x")
                    .with_observations(["a"]),
            )
            .unwrap();

        let mut import = node("Svc", "Service");
        import.aliases = Some("y; X".to_string());
        import.observations = vec![
            TreeObservation {
                content: "a".to_string(),
                created_at: None,
            },
            TreeObservation {
                content: "b".to_string(),
                created_at: Some("2024-01-01T00:00:00Z".to_string()),
            },
        ];

        let report = ImportExecutor::new(&db)
            .execute(&document(vec![import]), &HashMap::new())
            .unwrap();
        assert_eq!(report.entities_created, 0);
        assert_eq!(report.entities_merged, 1);
        assert_eq!(report.observations_created, 1);
        assert_eq!(report.touched_ids, vec![svc.id]);

        let merged = db.get_entity(svc.id).unwrap().unwrap();
        assert_eq!(merged.aliases.as_deref(), Some("x, y"));
        assert_eq!(merged.observation_count, 2);
        let observations = db.observations_for(svc.id).unwrap();
        assert_eq!(observations[1].created_at, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_failed_node_does_not_abort_siblings() {
        let (_dir, db) = temp_db();
        let mut broken = node("Broken", "Thing");
        broken.children.push(node("Orphaned Child", "Thing"));
        let doc = document(vec![broken, node("Fine", "Thing")]);
        let decisions = HashMap::from([(
            "0".to_string(),
            Decision::Merge {
                target_id: 999,
                parent_id: None,
            },
        )]);

        let report = ImportExecutor::new(&db).execute(&doc, &decisions).unwrap();
        assert!(!report.success);
        assert!(!report.rolled_back);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("Broken (0)"));
        assert_eq!(report.entities_created, 2);
        assert_eq!(report.relations_created, 0);
        assert!(db.find_entity_by_name("Orphaned Child").unwrap().is_some());
        assert!(db.find_entity_by_name("Fine").unwrap().is_some());
    }

    #[test]
    fn test_failed_node_leaves_no_partial_writes() {
        let (_dir, db) = temp_db();
        let mut bad = node("Half", "Thing");
        bad.observations.push(TreeObservation {
            content: "x".repeat(5000),
            created_at: None,
        });

        let report = ImportExecutor::new(&db)
            .execute(&document(vec![bad]), &HashMap::new())
            .unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(db.find_entity_by_name("Half").unwrap().is_none());
    }

    #[test]
    fn test_atomic_mode_rolls_back() {
        let (_dir, db) = temp_db();
        let doc = document(vec![node("Good", "Thing"), node("Bad", "Thing")]);
        let decisions = HashMap::from([(
            "1".to_string(),
            Decision::AddRelation {
                target_id: 42,
                parent_id: None,
            },
        )]);

        let report = ImportExecutor::new(&db)
            .with_mode(ImportMode::Atomic)
            .execute(&doc, &decisions)
            .unwrap();
        assert!(!report.success);
        assert!(report.rolled_back);
        assert_eq!(report.entities_created, 0);
        assert!(report.touched_ids.is_empty());
        assert_eq!(db.stats().unwrap(), GraphStats::default());
    }

    #[test]
    fn test_skip_passes_target_to_children() {
        let (_dir, db) = temp_db();
        let existing = entity(&db, "Existing", "Project");
        let mut root = node("Existing", "Project");
        let mut child = node("Leaf", "File");
        child.relation_type = Some("depends_on".to_string());
        root.children.push(child);
        let decisions = HashMap::from([(
            "0".to_string(),
            Decision::Skip {
                target_id: Some(existing.id),
                parent_id: None,
            },
        )]);

        let report = ImportExecutor::new(&db).execute(&document(vec![root]), &decisions).unwrap();
        assert_eq!(report.entities_skipped, 1);
        assert_eq!(report.entities_created, 1);
        assert_eq!(report.relations_created, 1);

        let relations = db.relations_for(existing.id).unwrap();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].relation_type, "depends_on");
        assert_eq!(relations[0].to_entity_id, existing.id);
    }

    #[test]
    fn test_skip_without_target_uses_exact_match() {
        let (_dir, db) = temp_db();
        let existing = entity(&db, "Existing", "Project");
        let mut root = node("Existing", "Project");
        root.children.push(node("Leaf", "File"));
        let decisions = HashMap::from([(
            "0".to_string(),
            Decision::Skip {
                target_id: None,
                parent_id: None,
            },
        )]);

        let report = ImportExecutor::new(&db).execute(&document(vec![root]), &decisions).unwrap();
        assert!(report.success);
        assert_eq!(report.entities_skipped, 1);
        assert_eq!(report.entities_created, 1);
        assert_eq!(report.relations_created, 1);

        let leaf = db.find_entity_by_name("Leaf").unwrap().unwrap();
        assert_eq!(report.touched_ids, vec![leaf.id]);
        let relations = db.relations_for(existing.id).unwrap();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].from_entity_id, leaf.id);
        assert_eq!(relations[0].relation_type, "part_of");
    }

    #[test]
    fn test_skip_without_any_match_leaves_children_as_roots() {
        let (_dir, db) = temp_db();
        entity(&db, "Existing", "Module");
        let mut root = node("Existing", "Project");
        root.children.push(node("Leaf", "File"));
        let decisions = HashMap::from([(
            "0".to_string(),
            Decision::Skip {
                target_id: None,
                parent_id: None,
            },
        )]);

        let report = ImportExecutor::new(&db).execute(&document(vec![root]), &decisions).unwrap();
        assert_eq!(report.entities_created, 1);
        assert_eq!(report.relations_created, 0);
    }

    #[test]
    fn test_parent_override_and_duplicate_relation() {
        let (_dir, db) = temp_db();
        let parent = entity(&db, "Parent", "Project");
        let child = entity(&db, "Kid", "Module");
        link(&db, &child, &parent, "part_of");

        let decisions = HashMap::from([(
            "0".to_string(),
            Decision::AddRelation {
                target_id: child.id,
                parent_id: Some(parent.id),
            },
        )]);
        let report = ImportExecutor::new(&db)
            .execute(&document(vec![node("Kid", "Module")]), &decisions)
            .unwrap();
        assert!(report.success);
        assert_eq!(report.entities_merged, 1);
        assert_eq!(report.relations_created, 0);
    }

    #[test]
    fn test_self_loop_is_not_created() {
        let (_dir, db) = temp_db();
        let target = entity(&db, "Loop", "Thing");
        let decisions = HashMap::from([(
            "0".to_string(),
            Decision::Merge {
                target_id: target.id,
                parent_id: Some(target.id),
            },
        )]);
        let report = ImportExecutor::new(&db)
            .execute(&document(vec![node("Loop", "Thing")]), &decisions)
            .unwrap();
        assert!(report.success);
        assert_eq!(report.relations_created, 0);
        assert!(db.relations_for(target.id).unwrap().is_empty());
    }

    #[test]
    fn test_parse_decisions() {
        let decisions = parse_decisions(json!({
            "0": {"action": "merge", "target_id": 3},
            "0.children.1": {"action": "skip"},
            "1": {"action": "create", "parent_id": 7}
        }))
        .unwrap();
        assert_eq!(
            decisions["0"],
            Decision::Merge {
                target_id: 3,
                parent_id: None
            }
        );
        assert_eq!(
            decisions["0.children.1"],
            Decision::Skip {
                target_id: None,
                parent_id: None
            }
        );
        assert_eq!(decisions["1"].parent_override(), Some(7));

        assert!(matches!(
            parse_decisions(json!({"0": {"action": "merge"}})),
            Err(GraphError::ValidationFailed(_))
        ));
        assert!(parse_decisions(serde_json::Value::Null).unwrap().is_empty());
    }
}
