//! Token-weighted relevance scoring over entity name, type and aliases.

use std::collections::HashSet;

use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use super::MatchField;
use crate::memory::error::Result;
use crate::memory::graph::Entity;
use crate::memory::storage::{Database, entities_matching_any};

pub const ENTITY_TYPE_WEIGHT: f64 = 15.0;
pub const NAME_WEIGHT: f64 = 10.0;
pub const ALIASES_WEIGHT: f64 = 5.0;
/// Extra fraction of the field weight when the token is a whole word of the field.
pub const WHOLE_WORD_BONUS: f64 = 0.5;
/// Bonus per additional distinct token that matched.
pub const MULTI_TOKEN_BONUS: f64 = 2.0;
pub const MIN_SCORE: i64 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct TextMatch {
    pub entity: Entity,
    pub score: i64,
    pub matched_fields: Vec<MatchField>,
}

pub struct TextRankScorer<'a> {
    db: &'a Database,
}

impl<'a> TextRankScorer<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<TextMatch>> {
        let conn = self.db.conn()?;
        rank_text(&conn, query, limit)
    }
}

/// Lowercase, split on whitespace, dedupe keeping first occurrence.
pub fn tokenize_query(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn field_words(value: &str) -> Vec<String> {
    value
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '|' | ';'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Score one entity against already-tokenized query terms.
///
/// Returns the truncated score and matched fields, or `None` below `MIN_SCORE`.
pub fn score_entity(entity: &Entity, tokens: &[String]) -> Option<(i64, Vec<MatchField>)> {
    let fields = [
        (MatchField::EntityType, entity.entity_type.as_str(), ENTITY_TYPE_WEIGHT),
        (MatchField::Name, entity.name.as_str(), NAME_WEIGHT),
        (MatchField::Aliases, entity.aliases.as_deref().unwrap_or(""), ALIASES_WEIGHT),
    ];
    let prepared: Vec<_> = fields
        .iter()
        .map(|(field, value, weight)| (*field, value.to_lowercase(), field_words(value), *weight))
        .collect();

    let mut score = 0.0;
    let mut matched_fields = Vec::new();
    let mut matched_tokens = 0usize;

    for token in tokens {
        let mut token_matched = false;
        for (field, value, words, weight) in &prepared {
            if value.is_empty() || !value.contains(token.as_str()) {
                continue;
            }
            score += weight;
            if words.iter().any(|w| w == token) {
                score += weight * WHOLE_WORD_BONUS;
            }
            if !matched_fields.contains(field) {
                matched_fields.push(*field);
            }
            token_matched = true;
        }
        if token_matched {
            matched_tokens += 1;
        }
    }

    if matched_tokens > 1 {
        score += (matched_tokens - 1) as f64 * MULTI_TOKEN_BONUS;
    }

    let score = score.trunc() as i64;
    if score < MIN_SCORE {
        return None;
    }
    matched_fields.sort();
    Some((score, matched_fields))
}

/// Rank entities for `query`: entity_type ascending, then score descending.
pub(crate) fn rank_text(conn: &Connection, query: &str, limit: usize) -> Result<Vec<TextMatch>> {
    let tokens = tokenize_query(query);
    if tokens.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let candidates = entities_matching_any(conn, &tokens)?;
    let candidate_count = candidates.len();
    let mut matches: Vec<TextMatch> = candidates
        .into_iter()
        .filter_map(|entity| {
            score_entity(&entity, &tokens).map(|(score, matched_fields)| TextMatch {
                entity,
                score,
                matched_fields,
            })
        })
        .collect();

    matches.sort_by(|a, b| {
        a.entity
            .entity_type
            .cmp(&b.entity.entity_type)
            .then_with(|| b.score.cmp(&a.score))
    });
    matches.truncate(limit);

    debug!(
        query = %query,
        candidates = candidate_count,
        returned = matches.len(),
        "Text search"
    );
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::graph::NewEntity;
    use crate::memory::storage::test_support::{entity, temp_db};

    fn bare(name: &str, entity_type: &str, aliases: Option<&str>) -> Entity {
        Entity {
            id: 1,
            name: name.into(),
            entity_type: entity_type.into(),
            aliases: aliases.map(Into::into),
            description: None,
            observation_count: 0,
            embedding: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_tokenize_query_dedupes() {
        assert_eq!(tokenize_query("  Foo bar FOO\tbaz "), vec!["foo", "bar", "baz"]);
        assert!(tokenize_query("   ").is_empty());
    }

    #[test]
    fn test_score_weights() {
        let x = bare("Widget", "Gadget", None);
        assert_eq!(
            score_entity(&x, &tokenize_query("gadget")),
            Some((22, vec![MatchField::EntityType]))
        );

        let y = bare("Gadget Pro", "Tool", Some("gadget-related"));
        assert_eq!(
            score_entity(&y, &tokenize_query("gadget")),
            Some((20, vec![MatchField::Name, MatchField::Aliases]))
        );
    }

    #[test]
    fn test_multi_token_bonus() {
        let e = bare("Project Alpha", "Project", None);
        // type: 15 + 7.5, name: (10 + 5) * 2, bonus: 2
        let (score, fields) = score_entity(&e, &tokenize_query("Project Alpha Project")).unwrap();
        assert_eq!(score, 54);
        assert_eq!(fields, vec![MatchField::EntityType, MatchField::Name]);
    }

    #[test]
    fn test_second_token_never_decreases_score() {
        let e = bare("Payment Service", "Service", Some("billing, invoices"));
        let queries = [
            ("payment", "payment service"),
            ("billing", "billing invoices"),
            ("service", "service zzz"),
            ("pay", "pay ment"),
        ];
        for (single, double) in queries {
            let one = score_entity(&e, &tokenize_query(single)).map(|s| s.0).unwrap_or(0);
            let two = score_entity(&e, &tokenize_query(double)).map(|s| s.0).unwrap_or(0);
            assert!(two >= one, "{} -> {} vs {} -> {}", single, one, double, two);
        }
    }

    #[test]
    fn test_no_match_is_dropped() {
        let e = bare("Widget", "Gadget", None);
        assert_eq!(score_entity(&e, &tokenize_query("zzz")), None);
    }

    #[test]
    fn test_search_orders_by_type_then_score() {
        let (_dir, db) = temp_db();
        let x = entity(&db, "Widget", "Gadget");
        let y = db
            .create_entity(&NewEntity::new("Gadget Pro", "Tool").with_aliases("gadget-related"))
            .unwrap();
        entity(&db, "Unrelated", "Note");

        let results = TextRankScorer::new(&db).search("gadget", 10).unwrap();
        let ids: Vec<_> = results.iter().map(|m| m.entity.id).collect();
        assert_eq!(ids, vec![x.id, y.id]);
        assert_eq!(results[0].score, 22);
        assert_eq!(results[1].score, 20);
    }

    #[test]
    fn test_search_blank_query_and_limit() {
        let (_dir, db) = temp_db();
        entity(&db, "Alpha One", "Thing");
        entity(&db, "Alpha Two", "Thing");
        let scorer = TextRankScorer::new(&db);
        assert!(scorer.search("   ", 10).unwrap().is_empty());
        assert_eq!(scorer.search("alpha", 1).unwrap().len(), 1);
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let (_dir, db) = temp_db();
        let e = entity(&db, "Kafka Cluster", "Infrastructure");
        let results = TextRankScorer::new(&db).search("KAFKA", 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entity.id, e.id);
        assert_eq!(results[0].matched_fields, vec![MatchField::Name]);
    }

    #[test]
    fn test_search_finds_non_ascii_names() {
        let (_dir, db) = temp_db();
        let e = entity(&db, "Überblick", "Projekt");
        for query in ["Überblick", "überblick", "ÜBERBLICK"] {
            let results = TextRankScorer::new(&db).search(query, 10).unwrap();
            assert_eq!(results.len(), 1, "query {}", query);
            assert_eq!(results[0].entity.id, e.id);
            assert_eq!(results[0].score, 15);
            assert_eq!(results[0].matched_fields, vec![MatchField::Name]);
        }
    }
}
