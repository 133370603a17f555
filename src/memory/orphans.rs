//! Orphan detection and parent suggestions.
//!
//! An orphan is a non-Project entity with no parent-child relation. Orphans
//! are scored against every Project by token overlap between the orphan's
//! name and the project's name and aliases.

use std::collections::HashSet;

use rusqlite::Connection;
use serde::Serialize;

use super::error::Result;
use super::graph::{Entity, PROJECT_TYPE, split_aliases};
use super::storage::{Database, child_relations, entities_of_type, root_entities};

const EXACT_NAME_TOKEN: u32 = 10;
const NAME_SUBSTRING: u32 = 5;
const EXACT_ALIAS_TOKEN: u32 = 8;
const ALIAS_SUBSTRING: u32 = 3;
const MIN_TOKEN_CHARS: usize = 2;
pub const SUGGESTION_LIMIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectMatch {
    pub project_id: i64,
    pub project_name: String,
    pub score: u32,
    pub matched_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrphanReport {
    pub id: i64,
    pub name: String,
    pub entity_type: String,
    pub observation_count: i64,
    pub child_count: usize,
    pub suggested_parents: Vec<ProjectMatch>,
}

/// Split on whitespace, `_`, `-` and `.`, lowercase, drop 1-char tokens, dedupe.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| c.is_whitespace() || matches!(c, '_' | '-' | '.'))
        .map(str::to_lowercase)
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS)
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn alias_tokens(aliases: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for alias in split_aliases(aliases) {
        for token in tokenize(&alias) {
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }
    }
    tokens
}

/// Score `node` against one project; `None` when nothing overlaps.
pub fn score_against_project(node: &Entity, project: &Entity) -> Option<ProjectMatch> {
    let name_lower = project.name.to_lowercase();
    let name_tokens = tokenize(&project.name);
    let aliases_lower = project.aliases.as_deref().unwrap_or("").to_lowercase();
    let project_alias_tokens = alias_tokens(&aliases_lower);

    let mut score = 0;
    let mut matched_tokens = Vec::new();
    for token in tokenize(&node.name) {
        let points = if name_tokens.contains(&token) {
            EXACT_NAME_TOKEN
        } else if name_lower.contains(&token) {
            NAME_SUBSTRING
        } else if project_alias_tokens.contains(&token) {
            EXACT_ALIAS_TOKEN
        } else if !aliases_lower.is_empty() && aliases_lower.contains(&token) {
            ALIAS_SUBSTRING
        } else {
            0
        };
        if points > 0 {
            score += points;
            matched_tokens.push(token);
        }
    }

    (score > 0).then(|| ProjectMatch {
        project_id: project.id,
        project_name: project.name.clone(),
        score,
        matched_tokens,
    })
}

pub struct OrphanMatcher<'a> {
    db: &'a Database,
}

impl<'a> OrphanMatcher<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn orphan_nodes(&self) -> Result<Vec<Entity>> {
        let conn = self.db.conn()?;
        orphans(&conn)
    }

    /// Projects overlapping `node`, best first.
    pub fn match_to_projects(&self, node: &Entity) -> Result<Vec<ProjectMatch>> {
        let conn = self.db.conn()?;
        let projects = entities_of_type(&conn, PROJECT_TYPE)?;
        Ok(rank_projects(node, &projects))
    }

    pub fn orphans_with_matches(&self) -> Result<Vec<OrphanReport>> {
        let conn = self.db.conn()?;
        let projects = entities_of_type(&conn, PROJECT_TYPE)?;
        let mut reports = Vec::new();
        for orphan in orphans(&conn)? {
            let child_count = child_relations(&conn, orphan.id)?.len();
            let mut suggested_parents = rank_projects(&orphan, &projects);
            suggested_parents.truncate(SUGGESTION_LIMIT);
            reports.push(OrphanReport {
                id: orphan.id,
                name: orphan.name,
                entity_type: orphan.entity_type,
                observation_count: orphan.observation_count,
                child_count,
                suggested_parents,
            });
        }
        Ok(reports)
    }
}

fn orphans(conn: &Connection) -> Result<Vec<Entity>> {
    Ok(root_entities(conn)?
        .into_iter()
        .filter(|e| e.entity_type != PROJECT_TYPE)
        .collect())
}

fn rank_projects(node: &Entity, projects: &[Entity]) -> Vec<ProjectMatch> {
    let mut matches: Vec<ProjectMatch> = projects
        .iter()
        .filter(|p| p.id != node.id)
        .filter_map(|p| score_against_project(node, p))
        .collect();
    matches.sort_by(|a, b| b.score.cmp(&a.score));
    matches
}
