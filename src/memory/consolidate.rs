//! Graph surgery: move, merge and delete nodes.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use super::error::{GraphError, Result};
use super::graph::{DEFAULT_PARENT_RELATION, Entity, Relation, merge_aliases};
use super::storage::{
    Database, child_relations, delete_entity_row, delete_relation_row, detach_children,
    find_relation, insert_relation, parent_relations, reassign_observations,
    refresh_observation_count, relations_touching, repoint_relation, require_entity,
    require_relation, update_aliases,
};

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub source_id: i64,
    pub target_id: i64,
    pub observations_moved: usize,
    pub relations_repointed: usize,
    pub relations_dropped: usize,
    pub aliases: Option<String>,
    pub target: Entity,
}

pub struct NodeConsolidator<'a> {
    db: &'a Database,
}

impl<'a> NodeConsolidator<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Re-parent `node_id` under `parent_id` with a single `part_of` relation.
    pub fn move_node(&self, node_id: i64, parent_id: i64) -> Result<Relation> {
        if node_id == parent_id {
            return Err(GraphError::validation("Cannot move a node under itself"));
        }
        let relation = self.db.transaction(|tx| {
            require_entity(tx, node_id)?;
            require_entity(tx, parent_id)?;
            if find_relation(tx, node_id, parent_id, DEFAULT_PARENT_RELATION)?.is_some() {
                return Err(GraphError::validation(format!(
                    "Entity {} is already {} {}",
                    node_id, DEFAULT_PARENT_RELATION, parent_id
                )));
            }
            for relation in parent_relations(tx, node_id)? {
                delete_relation_row(tx, relation.id)?;
            }
            let id = insert_relation(tx, node_id, parent_id, DEFAULT_PARENT_RELATION)?.ok_or_else(
                || GraphError::Internal(format!("Relation {} -> {} vanished", node_id, parent_id)),
            )?;
            require_relation(tx, id)
        })?;
        info!(node_id, parent_id, "Moved node");
        Ok(relation)
    }

    /// Fold `source_id` into `target_id` and delete the source.
    ///
    /// Every observation moves across unchanged. Relations are re-pointed at
    /// the target; source/target loops are dropped and on a (from, to, type)
    /// collision the relation with the lower id survives.
    pub fn merge(&self, source_id: i64, target_id: i64) -> Result<MergeReport> {
        if source_id == target_id {
            return Err(GraphError::validation("Cannot merge a node into itself"));
        }
        let report = self.db.transaction(|tx| {
            let source = require_entity(tx, source_id)?;
            let target = require_entity(tx, target_id)?;

            let source_name = (source.name != target.name).then_some(source.name.as_str());
            let aliases = merge_aliases(
                [target.aliases.as_deref(), source.aliases.as_deref(), source_name]
                    .into_iter()
                    .flatten(),
            );
            update_aliases(tx, target.id, aliases.as_deref())?;

            let observations_moved = reassign_observations(tx, source.id, target.id)?;

            let mut relations_repointed = 0;
            let mut relations_dropped = 0;
            for relation in relations_touching(tx, source.id)? {
                let swap = |id: i64| if id == source.id { target.id } else { id };
                let (from, to) = (swap(relation.from_entity_id), swap(relation.to_entity_id));

                if from == to {
                    delete_relation_row(tx, relation.id)?;
                    relations_dropped += 1;
                    continue;
                }
                if let Some(existing) = find_relation(tx, from, to, &relation.relation_type)? {
                    relations_dropped += 1;
                    if existing.id < relation.id {
                        delete_relation_row(tx, relation.id)?;
                        continue;
                    }
                    delete_relation_row(tx, existing.id)?;
                }
                repoint_relation(tx, relation.id, from, to)?;
                relations_repointed += 1;
            }

            refresh_observation_count(tx, target.id)?;
            if delete_entity_row(tx, source.id)? == 0 {
                return Err(GraphError::OperationFailed(format!(
                    "Entity {} could not be deleted",
                    source.id
                )));
            }

            Ok(MergeReport {
                source_id,
                target_id,
                observations_moved,
                relations_repointed,
                relations_dropped,
                aliases,
                target: require_entity(tx, target.id)?,
            })
        })?;
        info!(
            source_id,
            target_id,
            observations = report.observations_moved,
            repointed = report.relations_repointed,
            dropped = report.relations_dropped,
            "Merged nodes"
        );
        Ok(report)
    }

    /// Delete a node, returning how many entities were removed.
    ///
    /// Without `cascade` its children are detached and left as roots.
    pub fn delete(&self, node_id: i64, cascade: bool) -> Result<usize> {
        let deleted = self.db.transaction(|tx| {
            require_entity(tx, node_id)?;

            let mut doomed = Vec::new();
            if cascade {
                let mut seen = HashSet::from([node_id]);
                let mut stack = vec![node_id];
                while let Some(id) = stack.pop() {
                    for relation in child_relations(tx, id)? {
                        if seen.insert(relation.from_entity_id) {
                            doomed.push(relation.from_entity_id);
                            stack.push(relation.from_entity_id);
                        }
                    }
                }
            } else {
                let detached = detach_children(tx, node_id)?;
                debug!(node_id, detached, "Detached children");
            }

            // descendants before the node, deepest discoveries first
            doomed.reverse();
            doomed.push(node_id);
            for id in &doomed {
                if delete_entity_row(tx, *id)? == 0 {
                    return Err(GraphError::OperationFailed(format!(
                        "Entity {} could not be deleted",
                        id
                    )));
                }
            }
            Ok(doomed.len())
        })?;
        info!(node_id, cascade, deleted, "Deleted node");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::graph::NewEntity;
    use crate::memory::storage::test_support::{entity, link, temp_db};

    #[test]
    fn test_move_replaces_parent_relations() {
        let (_dir, db) = temp_db();
        let a = entity(&db, "A", "Project");
        let b = entity(&db, "B", "Project");
        let c = entity(&db, "C", "Module");
        let d = entity(&db, "D", "Project");
        let note = entity(&db, "Note", "Note");
        link(&db, &c, &a, "part_of");
        link(&db, &c, &b, "depends_on");
        link(&db, &c, &note, "mentions");

        let relation = NodeConsolidator::new(&db).move_node(c.id, d.id).unwrap();
        assert_eq!(relation.relation_type, "part_of");
        assert_eq!(relation.to_entity_id, d.id);

        let remaining = db.relations_for(c.id).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|r| r.relation_type == "mentions"));
        assert!(remaining.iter().any(|r| r.to_entity_id == d.id));
    }

    #[test]
    fn test_move_rejections() {
        let (_dir, db) = temp_db();
        let a = entity(&db, "A", "Project");
        let c = entity(&db, "C", "Module");
        link(&db, &c, &a, "part_of");
        let consolidator = NodeConsolidator::new(&db);

        assert!(matches!(consolidator.move_node(c.id, c.id), Err(GraphError::ValidationFailed(_))));
        assert!(matches!(consolidator.move_node(c.id, a.id), Err(GraphError::ValidationFailed(_))));
        assert!(matches!(consolidator.move_node(c.id, 999), Err(GraphError::NotFound { .. })));
        assert!(matches!(consolidator.move_node(999, a.id), Err(GraphError::NotFound { .. })));
    }

    #[test]
    fn test_merge_keeps_all_observations_and_aliases() {
        let (_dir, db) = temp_db();
        let target = db
            .create_entity(
                &NewEntity::new("Target", "Service")
                    .with_aliases("t1")
                    .with_observations(["one", "two", "shared"]),
            )
            .unwrap();
        let source = db
            .create_entity(
                &NewEntity::new("Source", "Service")
                    .with_aliases("s1,s2")
                    .with_observations(["shared", "four"]),
            )
            .unwrap();

        let report = NodeConsolidator::new(&db).merge(source.id, target.id).unwrap();
        assert_eq!(report.observations_moved, 2);
        assert_eq!(report.target.observation_count, 5);
        assert_eq!(report.aliases.as_deref(), Some("t1, s1, s2, Source"));
        assert!(db.get_entity(source.id).unwrap().is_none());
        assert_eq!(db.observations_for(target.id).unwrap().len(), 5);
    }

    #[test]
    fn test_merge_repoints_and_dedupes_relations() {
        let (_dir, db) = temp_db();
        let t = entity(&db, "T", "Thing");
        let s = entity(&db, "S", "Thing");
        let x = entity(&db, "X", "Thing");
        let y = entity(&db, "Y", "Thing");
        let z = entity(&db, "Z", "Thing");

        let t_x = link(&db, &t, &x, "relates_to");
        link(&db, &s, &x, "relates_to");
        link(&db, &s, &t, "part_of");
        let y_s = link(&db, &y, &s, "part_of");
        let s_z = link(&db, &s, &z, "uses");
        link(&db, &t, &z, "uses");

        let report = NodeConsolidator::new(&db).merge(s.id, t.id).unwrap();
        assert_eq!(report.relations_repointed, 2);
        assert_eq!(report.relations_dropped, 3);

        let mut ids: Vec<_> = db.relations_for(t.id).unwrap().into_iter().map(|r| r.id).collect();
        ids.sort();
        assert_eq!(ids, vec![t_x.id, y_s.id, s_z.id]);
        assert_eq!(db.stats().unwrap().relations, 3);

        let y_rel = &db.relations_for(y.id).unwrap()[0];
        assert_eq!(y_rel.to_entity_id, t.id);
        let z_rel = &db.relations_for(z.id).unwrap()[0];
        assert_eq!((z_rel.id, z_rel.from_entity_id), (s_z.id, t.id));
    }

    #[test]
    fn test_merge_rejections() {
        let (_dir, db) = temp_db();
        let t = entity(&db, "T", "Thing");
        let consolidator = NodeConsolidator::new(&db);
        assert!(matches!(consolidator.merge(t.id, t.id), Err(GraphError::ValidationFailed(_))));
        assert!(matches!(consolidator.merge(999, t.id), Err(GraphError::NotFound { .. })));
        assert!(db.get_entity(t.id).unwrap().is_some());
    }

    #[test]
    fn test_delete_detaches_children() {
        let (_dir, db) = temp_db();
        let p = entity(&db, "P", "Project");
        let a = entity(&db, "A", "Module");
        let b = entity(&db, "B", "Module");
        let a1 = entity(&db, "A1", "File");
        link(&db, &a, &p, "part_of");
        link(&db, &b, &p, "depends_on");
        link(&db, &a1, &a, "part_of");

        assert_eq!(NodeConsolidator::new(&db).delete(p.id, false).unwrap(), 1);
        assert!(db.get_entity(a.id).unwrap().is_some());
        assert!(db.get_entity(b.id).unwrap().is_some());
        assert_eq!(db.stats().unwrap().relations, 1);
        assert_eq!(db.relations_for(a1.id).unwrap()[0].to_entity_id, a.id);
    }

    #[test]
    fn test_cascade_delete_removes_descendants() {
        let (_dir, db) = temp_db();
        let p = entity(&db, "P", "Project");
        let a = entity(&db, "A", "Module");
        let b = entity(&db, "B", "Module");
        let a1 = entity(&db, "A1", "File");
        let other = entity(&db, "Other", "Note");
        link(&db, &a, &p, "part_of");
        link(&db, &b, &p, "depends_on");
        link(&db, &a1, &a, "part_of");
        link(&db, &p, &a1, "part_of");
        link(&db, &other, &a, "mentions");

        let deleted = NodeConsolidator::new(&db).delete(p.id, true).unwrap();
        assert_eq!(deleted, 4);
        let stats = db.stats().unwrap();
        assert_eq!(stats.entities, 1);
        assert_eq!(stats.relations, 0);
        assert!(db.get_entity(other.id).unwrap().is_some());
    }

    #[test]
    fn test_delete_unknown() {
        let (_dir, db) = temp_db();
        assert!(matches!(
            NodeConsolidator::new(&db).delete(42, true),
            Err(GraphError::NotFound { .. })
        ));
    }
}
