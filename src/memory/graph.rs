//! Knowledge graph data types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Relation types that define the parent-child tree (from = child, to = parent).
pub const PARENT_CHILD_TYPES: [&str; 2] = ["part_of", "depends_on"];

/// Relation type used when a tree edge has no explicit type.
pub const DEFAULT_PARENT_RELATION: &str = "part_of";

/// Entity type that anchors top-level trees.
pub const PROJECT_TYPE: &str = "Project";

const ALIAS_DELIMITERS: [char; 3] = [',', '|', ';'];

pub fn is_parent_child(relation_type: &str) -> bool {
    PARENT_CHILD_TYPES.contains(&relation_type)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Cached number of observations owned by this entity.
    pub observation_count: i64,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: String,
    pub updated_at: String,
}

impl Entity {
    pub fn alias_list(&self) -> Vec<String> {
        self.aliases.as_deref().map(split_aliases).unwrap_or_default()
    }

    pub fn is_project(&self) -> bool {
        self.entity_type == PROJECT_TYPE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub entity_id: i64,
    pub content: String,
    pub created_at: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: i64,
    pub from_entity_id: i64,
    pub to_entity_id: i64,
    pub relation_type: String,
    pub created_at: String,
}

impl Relation {
    pub fn is_parent_child(&self) -> bool {
        is_parent_child(&self.relation_type)
    }
}

/// Input for creating an entity together with its initial observations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NewEntity {
    pub name: String,
    pub entity_type: String,
    /// Alias list separated by `,`, `|` or `;`
    #[serde(default)]
    pub aliases: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub observations: Vec<String>,
}

impl NewEntity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            ..Default::default()
        }
    }

    pub fn with_aliases(mut self, aliases: impl Into<String>) -> Self {
        self.aliases = Some(aliases.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_observations<I, S>(mut self, observations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.observations = observations.into_iter().map(Into::into).collect();
        self
    }
}

/// Partial update of an entity; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EntityUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub aliases: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub entities: i64,
    pub observations: i64,
    pub relations: i64,
}

/// Split an alias string on `,`, `|` and `;`, trimming and dropping empties.
pub fn split_aliases(aliases: &str) -> Vec<String> {
    aliases
        .split(ALIAS_DELIMITERS)
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

/// Union alias lists, keeping the first spelling of case-insensitive duplicates.
///
/// Returns `None` when the union is empty.
pub fn merge_aliases<'a, I>(sources: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for source in sources {
        for alias in split_aliases(source) {
            if seen.insert(alias.to_lowercase()) {
                merged.push(alias);
            }
        }
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged.join(", "))
    }
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
