//! Classify each node of an import tree against the existing graph.
//!
//! Roots are ranked by text relevance and graded `high` / `low` / `new`.
//! Children are looked up by exact (name, entity_type) and given an action:
//! `skip` when already linked under the import parent, `add_relation` when
//! present elsewhere, `create` when missing.

use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use crate::memory::error::Result;
use crate::memory::graph::Entity;
use crate::memory::search::MatchField;
use crate::memory::search::text::rank_text;
use crate::memory::storage::{
    Database, entity_by_name_and_type, fetch_entity, observation_contents, parent_relations,
};
use crate::memory::tree::{TreeDocument, TreeNode, child_path, parse_document, root_path};

const ROOT_CANDIDATES: usize = 10;
const HIGH_SCORE: i64 = 20;
const LOW_SCORE: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    High,
    Low,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildAction {
    Create,
    AddRelation,
    Skip,
}

#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub id: i64,
    pub name: String,
    pub entity_type: String,
    pub score: i64,
    pub matched_fields: Vec<MatchField>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExactMatch {
    pub id: i64,
    pub name: String,
    pub entity_type: String,
    pub observation_count: i64,
}

impl From<&Entity> for ExactMatch {
    fn from(entity: &Entity) -> Self {
        Self {
            id: entity.id,
            name: entity.name.clone(),
            entity_type: entity.entity_type.clone(),
            observation_count: entity.observation_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub node_path: String,
    pub name: String,
    pub entity_type: String,
    pub is_child: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    pub status: MatchStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exact_match: Option<ExactMatch>,
    pub selected_match_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_action: Option<ChildAction>,
    pub will_add_observations: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchSummary {
    pub total: usize,
    pub high: usize,
    pub low: usize,
    pub new: usize,
    pub create: usize,
    pub add_relation: usize,
    pub skip: usize,
}

impl MatchSummary {
    fn record(&mut self, result: &MatchResult) {
        self.total += 1;
        match result.status {
            MatchStatus::High => self.high += 1,
            MatchStatus::Low => self.low += 1,
            MatchStatus::New => self.new += 1,
        }
        match result.child_action {
            Some(ChildAction::Create) => self.create += 1,
            Some(ChildAction::AddRelation) => self.add_relation += 1,
            Some(ChildAction::Skip) => self.skip += 1,
            None => {}
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchPreview {
    pub results: Vec<MatchResult>,
    pub summary: MatchSummary,
}

pub struct ImportMatcher<'a> {
    db: &'a Database,
}

impl<'a> ImportMatcher<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn preview_json(&self, json: &str) -> Result<MatchPreview> {
        self.preview(&parse_document(json)?)
    }

    pub fn preview(&self, document: &TreeDocument) -> Result<MatchPreview> {
        let conn = self.db.conn()?;
        let mut results = Vec::with_capacity(document.node_count());
        for (i, node) in document.root_nodes.iter().enumerate() {
            walk(&conn, node, &root_path(i), None, &mut results)?;
        }

        let mut summary = MatchSummary::default();
        for result in &results {
            summary.record(result);
        }
        debug!(?summary, "Import preview");
        Ok(MatchPreview { results, summary })
    }
}

fn walk(
    conn: &Connection,
    node: &TreeNode,
    path: &str,
    parent_name: Option<&str>,
    out: &mut Vec<MatchResult>,
) -> Result<()> {
    let result = match parent_name {
        None => match_root(conn, node, path)?,
        Some(parent) => match_child(conn, node, path, parent)?,
    };
    out.push(result);
    for (i, child) in node.children.iter().enumerate() {
        walk(conn, child, &child_path(path, i), Some(node.name.as_str()), out)?;
    }
    Ok(())
}

fn match_root(conn: &Connection, node: &TreeNode, path: &str) -> Result<MatchResult> {
    let query = format!("{} {}", node.name, node.entity_type);
    let ranked = rank_text(conn, &query, ROOT_CANDIDATES)?;

    let mut best: Option<usize> = None;
    for (i, m) in ranked.iter().enumerate() {
        if best.is_none_or(|b| m.score > ranked[b].score) {
            best = Some(i);
        }
    }

    let status = match best.map(|i| &ranked[i]) {
        Some(m) if is_high(m.score, &m.matched_fields, &m.entity.entity_type, &node.entity_type) => {
            MatchStatus::High
        }
        Some(m) if m.score >= LOW_SCORE && m.matched_fields.contains(&MatchField::EntityType) => {
            MatchStatus::Low
        }
        _ => MatchStatus::New,
    };
    let selected = match (status, best) {
        (MatchStatus::High, Some(i)) => Some(&ranked[i].entity),
        _ => None,
    };
    let will_add_observations = match selected {
        Some(entity) => has_new_observations(conn, entity.id, node)?,
        None => !node.observations.is_empty(),
    };
    let selected_match_id = selected.map(|e| e.id);

    debug!(path, name = %node.name, ?status, "Matched import root");
    Ok(MatchResult {
        node_path: path.to_string(),
        name: node.name.clone(),
        entity_type: node.entity_type.clone(),
        is_child: false,
        parent_name: None,
        status,
        matches: ranked
            .into_iter()
            .map(|m| Candidate {
                id: m.entity.id,
                name: m.entity.name,
                entity_type: m.entity.entity_type,
                score: m.score,
                matched_fields: m.matched_fields,
            })
            .collect(),
        exact_match: None,
        selected_match_id,
        child_action: None,
        will_add_observations,
    })
}

fn is_high(score: i64, fields: &[MatchField], found_type: &str, wanted_type: &str) -> bool {
    score >= HIGH_SCORE
        && (fields.contains(&MatchField::Name) || fields.contains(&MatchField::Aliases))
        && fields.contains(&MatchField::EntityType)
        && found_type.to_lowercase() == wanted_type.to_lowercase()
}

fn match_child(
    conn: &Connection,
    node: &TreeNode,
    path: &str,
    parent_name: &str,
) -> Result<MatchResult> {
    let existing = entity_by_name_and_type(conn, node.name.trim(), node.entity_type.trim())?;

    let (status, action, will_add_observations) = match &existing {
        Some(entity) => {
            let action = if linked_under(conn, entity.id, parent_name)? {
                ChildAction::Skip
            } else {
                ChildAction::AddRelation
            };
            (MatchStatus::High, action, has_new_observations(conn, entity.id, node)?)
        }
        None => (MatchStatus::New, ChildAction::Create, !node.observations.is_empty()),
    };

    debug!(path, name = %node.name, ?action, "Matched import child");
    Ok(MatchResult {
        node_path: path.to_string(),
        name: node.name.clone(),
        entity_type: node.entity_type.clone(),
        is_child: true,
        parent_name: Some(parent_name.to_string()),
        status,
        matches: Vec::new(),
        exact_match: existing.as_ref().map(ExactMatch::from),
        selected_match_id: existing.as_ref().map(|e| e.id),
        child_action: Some(action),
        will_add_observations,
    })
}

/// Whether `entity_id` already has a parent-child relation to an entity named `parent_name`.
fn linked_under(conn: &Connection, entity_id: i64, parent_name: &str) -> Result<bool> {
    let wanted = parent_name.trim().to_lowercase();
    for relation in parent_relations(conn, entity_id)? {
        if let Some(parent) = fetch_entity(conn, relation.to_entity_id)?
            && parent.name.to_lowercase() == wanted
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn has_new_observations(conn: &Connection, entity_id: i64, node: &TreeNode) -> Result<bool> {
    if node.observations.is_empty() {
        return Ok(false);
    }
    let existing = observation_contents(conn, entity_id)?;
    Ok(node.observations.iter().any(|o| !existing.contains(&o.content)))
}
