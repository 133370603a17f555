//! Recursive export of subgraphs to portable trees.
//!
//! Every branch carries its own copy of the visited set, so an entity may
//! show up under several siblings but never below itself. Children come from
//! two sources appended in order: entities whose parent-child relation points
//! at the node, then entities the node points to through lateral
//! (non-parent-child) relations. An entity linked both ways is listed twice.

use std::collections::HashSet;

use rusqlite::Connection;
use tracing::{debug, warn};

use super::error::Result;
use super::graph::{Entity, now_rfc3339};
use super::storage::{
    Database, child_relations, fetch_entity, lateral_relations, list_observations, root_entities,
};
use super::tree::{FORMAT_VERSION, TreeDocument, TreeNode, TreeObservation};

pub struct GraphExporter<'a> {
    db: &'a Database,
}

impl<'a> GraphExporter<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Entities without a parent: Projects first, then the rest, each by name.
    pub fn root_nodes(&self) -> Result<Vec<Entity>> {
        let conn = self.db.conn()?;
        let (mut projects, others): (Vec<Entity>, Vec<Entity>) = root_entities(&conn)?
            .into_iter()
            .partition(Entity::is_project);
        projects.extend(others);
        Ok(projects)
    }

    pub fn export(&self, entity_ids: &[i64]) -> Result<TreeDocument> {
        let conn = self.db.conn()?;
        let mut root_nodes = Vec::with_capacity(entity_ids.len());
        for &id in entity_ids {
            let Some(entity) = fetch_entity(&conn, id)? else {
                warn!(id, "Skipping unknown entity in export");
                continue;
            };
            let visited = HashSet::from([entity.id]);
            root_nodes.push(build_node(&conn, &entity, None, &visited)?);
        }

        let document = TreeDocument {
            version: FORMAT_VERSION.to_string(),
            exported_at: now_rfc3339(),
            root_nodes,
        };
        debug!(
            roots = document.root_nodes.len(),
            nodes = document.node_count(),
            "Exported subgraph"
        );
        Ok(document)
    }

    pub fn export_json(&self, entity_ids: &[i64]) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export(entity_ids)?)?)
    }
}

fn build_node(
    conn: &Connection,
    entity: &Entity,
    relation_type: Option<&str>,
    visited: &HashSet<i64>,
) -> Result<TreeNode> {
    let observations = list_observations(conn, entity.id)?
        .into_iter()
        .map(|o| TreeObservation {
            content: o.content,
            created_at: Some(o.created_at),
        })
        .collect();

    let links = child_relations(conn, entity.id)?
        .into_iter()
        .map(|r| (r.from_entity_id, r.relation_type))
        .chain(
            lateral_relations(conn, entity.id)?
                .into_iter()
                .map(|r| (r.to_entity_id, r.relation_type)),
        );

    let mut children = Vec::new();
    for (child_id, child_relation) in links {
        if visited.contains(&child_id) {
            continue;
        }
        let Some(child) = fetch_entity(conn, child_id)? else {
            continue;
        };
        let mut branch = visited.clone();
        branch.insert(child_id);
        children.push(build_node(conn, &child, Some(&child_relation), &branch)?);
    }

    Ok(TreeNode {
        name: entity.name.clone(),
        entity_type: entity.entity_type.clone(),
        aliases: entity.aliases.clone(),
        description: entity.description.clone(),
        observations,
        relation_type: relation_type.map(str::to_string),
        children,
    })
}
