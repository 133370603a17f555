//! SQLite storage backend for the knowledge graph.
//!
//! `Database` owns the connection pool and exposes the tool-level CRUD
//! operations. The free functions take a plain `&Connection` so the engine
//! components can compose them inside a single transaction or savepoint.

use super::embedding::{blob_to_embedding, embedding_to_blob};
use super::error::{GraphError, Result};
use super::graph::{
    Entity, EntityUpdate, GraphStats, NewEntity, Observation, Relation, now_rfc3339,
};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

// Validation constants
const MAX_NAME_LENGTH: usize = 256;
const MAX_TYPE_LENGTH: usize = 128;
const MAX_OBSERVATION_LENGTH: usize = 4096;

/// SQL list matching `PARENT_CHILD_TYPES`.
pub(crate) const PARENT_CHILD_SQL: &str = "('part_of', 'depends_on')";

const ENTITY_COLUMNS: &str =
    "id, name, entity_type, aliases, description, observations_count, created_at, updated_at";

/// Connection customizer to set PRAGMAs on every new connection
#[derive(Debug)]
struct SqliteCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for SqliteCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        Ok(())
    }
}

fn validate_name(name: &str, field: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(GraphError::validation(format!("{} cannot be blank", field)));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(GraphError::validation(format!(
            "{} too long (max {} chars)",
            field, MAX_NAME_LENGTH
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(GraphError::validation(format!(
            "{} contains invalid characters",
            field
        )));
    }
    Ok(())
}

fn validate_type(type_str: &str, field: &str) -> Result<()> {
    if type_str.trim().is_empty() {
        return Err(GraphError::validation(format!("{} cannot be blank", field)));
    }
    if type_str.chars().count() > MAX_TYPE_LENGTH {
        return Err(GraphError::validation(format!(
            "{} too long (max {} chars)",
            field, MAX_TYPE_LENGTH
        )));
    }
    if type_str.chars().any(|c| c.is_control()) {
        return Err(GraphError::validation(format!(
            "{} contains invalid characters",
            field
        )));
    }
    Ok(())
}

fn validate_observation(obs: &str) -> Result<()> {
    if obs.trim().is_empty() {
        return Err(GraphError::validation("Observation cannot be blank"));
    }
    if obs.chars().count() > MAX_OBSERVATION_LENGTH {
        return Err(GraphError::validation(format!(
            "Observation too long (max {} chars)",
            MAX_OBSERVATION_LENGTH
        )));
    }
    if obs.contains('\0') {
        return Err(GraphError::validation("Observation contains null bytes"));
    }
    Ok(())
}

fn validate_db_path(path: &Path) -> Result<()> {
    match path.extension() {
        Some(ext) if ext == "db" => Ok(()),
        Some(_) => Err(GraphError::validation(
            "Invalid database file extension (must be .db)",
        )),
        None => Err(GraphError::validation(
            "Database path must have .db extension",
        )),
    }
}

fn blank_to_none(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    aliases TEXT,
    description TEXT,
    observations_count INTEGER NOT NULL DEFAULT 0,
    embedding BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB,
    created_at TEXT NOT NULL,
    FOREIGN KEY(entity_id) REFERENCES entities(id) ON DELETE CASCADE
) STRICT;

CREATE TABLE IF NOT EXISTS relations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_entity_id INTEGER NOT NULL,
    to_entity_id INTEGER NOT NULL,
    relation_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(from_entity_id, to_entity_id, relation_type),
    FOREIGN KEY(from_entity_id) REFERENCES entities(id) ON DELETE CASCADE,
    FOREIGN KEY(to_entity_id) REFERENCES entities(id) ON DELETE CASCADE
) STRICT;

CREATE INDEX IF NOT EXISTS idx_entity_name ON entities(name);
CREATE INDEX IF NOT EXISTS idx_entity_type ON entities(entity_type);
CREATE INDEX IF NOT EXISTS idx_observation_entity ON observations(entity_id);
CREATE INDEX IF NOT EXISTS idx_from ON relations(from_entity_id);
CREATE INDEX IF NOT EXISTS idx_to ON relations(to_entity_id);
CREATE INDEX IF NOT EXISTS idx_relations_from_type ON relations(from_entity_id, relation_type);
CREATE INDEX IF NOT EXISTS idx_relations_to_type ON relations(to_entity_id, relation_type);
"#;

#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        validate_db_path(path)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GraphError::Internal(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(15)
            .connection_customizer(Box::new(SqliteCustomizer))
            .build(manager)?;

        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.execute_batch(SCHEMA)?;
        }

        info!(path = %path.display(), "Opened knowledge graph database");
        Ok(Self { pool })
    }

    pub fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside one transaction, committing only when it succeeds.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn create_entity(&self, input: &NewEntity) -> Result<Entity> {
        let entity = self.transaction(|tx| {
            if entity_by_name(tx, input.name.trim())?.is_some() {
                return Err(GraphError::validation(format!(
                    "Entity '{}' already exists",
                    input.name.trim()
                )));
            }
            let entity = insert_entity(tx, input)?;
            for content in &input.observations {
                insert_observation(tx, entity.id, content, None)?;
            }
            refresh_observation_count(tx, entity.id)?;
            require_entity(tx, entity.id)
        })?;
        debug!(id = entity.id, name = %entity.name, "Created entity");
        Ok(entity)
    }

    pub fn update_entity(&self, id: i64, update: &EntityUpdate) -> Result<Entity> {
        self.transaction(|tx| {
            let current = require_entity(tx, id)?;
            let name = match &update.name {
                Some(name) => {
                    validate_name(name, "Entity name")?;
                    let name = name.trim().to_string();
                    if name != current.name
                        && let Some(other) = entity_by_name(tx, &name)?
                        && other.id != id
                    {
                        return Err(GraphError::validation(format!(
                            "Entity '{}' already exists",
                            name
                        )));
                    }
                    name
                }
                None => current.name.clone(),
            };
            let entity_type = match &update.entity_type {
                Some(t) => {
                    validate_type(t, "Entity type")?;
                    t.trim().to_string()
                }
                None => current.entity_type.clone(),
            };
            let aliases = match &update.aliases {
                Some(a) => blank_to_none(Some(a)),
                None => current.aliases.clone(),
            };
            let description = match &update.description {
                Some(d) => blank_to_none(Some(d)),
                None => current.description.clone(),
            };
            tx.execute(
                "UPDATE entities SET name = ?1, entity_type = ?2, aliases = ?3, description = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![name, entity_type, aliases, description, now_rfc3339(), id],
            )?;
            require_entity(tx, id)
        })
    }

    pub fn get_entity(&self, id: i64) -> Result<Option<Entity>> {
        let conn = self.conn()?;
        fetch_entity(&conn, id)
    }

    pub fn find_entity_by_name(&self, name: &str) -> Result<Option<Entity>> {
        let conn = self.conn()?;
        entity_by_name(&conn, name)
    }

    pub fn list_entities(&self) -> Result<Vec<Entity>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM entities ORDER BY name COLLATE NOCASE, id", ENTITY_COLUMNS);
        query_entities(&conn, &sql, [])
    }

    /// Add observations, skipping contents the entity already has.
    pub fn add_observations(&self, entity_id: i64, contents: &[String]) -> Result<Vec<Observation>> {
        self.transaction(|tx| {
            require_entity(tx, entity_id)?;
            let mut existing = observation_contents(tx, entity_id)?;
            let mut added = Vec::new();
            for content in contents {
                if !existing.insert(content.clone()) {
                    continue;
                }
                let id = insert_observation(tx, entity_id, content, None)?;
                added.push(id);
            }
            refresh_observation_count(tx, entity_id)?;
            let all = list_observations(tx, entity_id)?;
            Ok(all.into_iter().filter(|o| added.contains(&o.id)).collect())
        })
    }

    pub fn observations_for(&self, entity_id: i64) -> Result<Vec<Observation>> {
        let conn = self.conn()?;
        list_observations(&conn, entity_id)
    }

    pub fn delete_observation(&self, id: i64) -> Result<()> {
        self.transaction(|tx| {
            let entity_id: Option<i64> = tx
                .query_row(
                    "SELECT entity_id FROM observations WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let entity_id = entity_id.ok_or_else(|| GraphError::NotFound {
                kind: "Observation",
                id: id.to_string(),
            })?;
            tx.execute("DELETE FROM observations WHERE id = ?1", params![id])?;
            refresh_observation_count(tx, entity_id)?;
            Ok(())
        })
    }

    /// Create a relation; `Ok(None)` when the identical relation already exists.
    pub fn create_relation(&self, from: i64, to: i64, relation_type: &str) -> Result<Option<Relation>> {
        self.transaction(|tx| {
            require_entity(tx, from)?;
            require_entity(tx, to)?;
            match insert_relation(tx, from, to, relation_type)? {
                Some(id) => Ok(Some(require_relation(tx, id)?)),
                None => Ok(None),
            }
        })
    }

    pub fn delete_relation(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let count = conn.execute("DELETE FROM relations WHERE id = ?1", params![id])?;
        if count == 0 {
            return Err(GraphError::NotFound {
                kind: "Relation",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn relations_for(&self, entity_id: i64) -> Result<Vec<Relation>> {
        let conn = self.conn()?;
        relations_touching(&conn, entity_id)
    }

    pub fn set_entity_embedding(&self, id: i64, embedding: &[f32]) -> Result<()> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE entities SET embedding = ?1 WHERE id = ?2",
            params![embedding_to_blob(embedding), id],
        )?;
        if count == 0 {
            return Err(GraphError::entity_not_found(id));
        }
        Ok(())
    }

    pub fn entities_missing_embeddings(&self, limit: usize) -> Result<Vec<Entity>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM entities WHERE embedding IS NULL ORDER BY id LIMIT ?1",
            ENTITY_COLUMNS
        );
        query_entities(&conn, &sql, params![limit as i64])
    }

    /// Entities holding an embedding, with the vector loaded.
    pub fn entities_with_embeddings(&self) -> Result<Vec<Entity>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {}, embedding FROM entities WHERE embedding IS NOT NULL ORDER BY id",
            ENTITY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let mut entity = row_to_entity(row)?;
            let blob: Vec<u8> = row.get(8)?;
            entity.embedding = Some(blob_to_embedding(&blob));
            Ok(entity)
        })?;
        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }

    pub fn stats(&self) -> Result<GraphStats> {
        let conn = self.conn()?;
        graph_stats(&conn)
    }
}

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        name: row.get(1)?,
        entity_type: row.get(2)?,
        aliases: row.get(3)?,
        description: row.get(4)?,
        observation_count: row.get(5)?,
        embedding: None,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_relation(row: &Row<'_>) -> rusqlite::Result<Relation> {
    Ok(Relation {
        id: row.get(0)?,
        from_entity_id: row.get(1)?,
        to_entity_id: row.get(2)?,
        relation_type: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn query_entities<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Entity>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_entity)?;
    let mut entities = Vec::new();
    for row in rows {
        entities.push(row?);
    }
    Ok(entities)
}

fn query_relations<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Relation>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_relation)?;
    let mut relations = Vec::new();
    for row in rows {
        relations.push(row?);
    }
    Ok(relations)
}

pub(crate) fn fetch_entity(conn: &Connection, id: i64) -> Result<Option<Entity>> {
    let sql = format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS);
    Ok(conn.query_row(&sql, params![id], row_to_entity).optional()?)
}

pub(crate) fn require_entity(conn: &Connection, id: i64) -> Result<Entity> {
    fetch_entity(conn, id)?.ok_or_else(|| GraphError::entity_not_found(id))
}

pub(crate) fn entity_by_name(conn: &Connection, name: &str) -> Result<Option<Entity>> {
    let sql = format!(
        "SELECT {} FROM entities WHERE name = ?1 ORDER BY id LIMIT 1",
        ENTITY_COLUMNS
    );
    Ok(conn.query_row(&sql, params![name], row_to_entity).optional()?)
}

pub(crate) fn entity_by_name_and_type(
    conn: &Connection,
    name: &str,
    entity_type: &str,
) -> Result<Option<Entity>> {
    let sql = format!(
        "SELECT {} FROM entities WHERE name = ?1 AND entity_type = ?2 ORDER BY id LIMIT 1",
        ENTITY_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![name, entity_type], row_to_entity)
        .optional()?)
}

/// Entities whose name, type or aliases contain any of the lowercase tokens.
///
/// SQLite `lower()` and `LIKE` fold ASCII only, so the substring test runs
/// here with Unicode lowercasing, matching the scorer.
pub(crate) fn entities_matching_any(conn: &Connection, tokens: &[String]) -> Result<Vec<Entity>> {
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!("SELECT {} FROM entities ORDER BY id", ENTITY_COLUMNS);
    let entities = query_entities(conn, &sql, [])?;
    Ok(entities
        .into_iter()
        .filter(|e| {
            let fields = [
                e.name.to_lowercase(),
                e.entity_type.to_lowercase(),
                e.aliases.as_deref().unwrap_or("").to_lowercase(),
            ];
            tokens
                .iter()
                .any(|t| fields.iter().any(|f| f.contains(t.as_str())))
        })
        .collect())
}

/// Entities with no outgoing parent-child relation, i.e. tree roots.
pub(crate) fn root_entities(conn: &Connection) -> Result<Vec<Entity>> {
    let sql = format!(
        "SELECT {} FROM entities e WHERE NOT EXISTS (
             SELECT 1 FROM relations r
             WHERE r.from_entity_id = e.id AND r.relation_type IN {}
         ) ORDER BY e.name COLLATE NOCASE, e.id",
        ENTITY_COLUMNS, PARENT_CHILD_SQL
    );
    query_entities(conn, &sql, [])
}

pub(crate) fn entities_of_type(conn: &Connection, entity_type: &str) -> Result<Vec<Entity>> {
    let sql = format!(
        "SELECT {} FROM entities WHERE entity_type = ?1 ORDER BY name COLLATE NOCASE, id",
        ENTITY_COLUMNS
    );
    query_entities(conn, &sql, params![entity_type])
}

pub(crate) fn insert_entity(conn: &Connection, input: &NewEntity) -> Result<Entity> {
    validate_name(&input.name, "Entity name")?;
    validate_type(&input.entity_type, "Entity type")?;
    for obs in &input.observations {
        validate_observation(obs)?;
    }
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO entities (name, entity_type, aliases, description, observations_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
        params![
            input.name.trim(),
            input.entity_type.trim(),
            blank_to_none(input.aliases.as_deref()),
            blank_to_none(input.description.as_deref()),
            now
        ],
    )?;
    require_entity(conn, conn.last_insert_rowid())
}

pub(crate) fn update_aliases(conn: &Connection, id: i64, aliases: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE entities SET aliases = ?1, updated_at = ?2 WHERE id = ?3",
        params![aliases, now_rfc3339(), id],
    )?;
    Ok(())
}

pub(crate) fn delete_entity_row(conn: &Connection, id: i64) -> Result<usize> {
    Ok(conn.execute("DELETE FROM entities WHERE id = ?1", params![id])?)
}

pub(crate) fn insert_observation(
    conn: &Connection,
    entity_id: i64,
    content: &str,
    created_at: Option<&str>,
) -> Result<i64> {
    validate_observation(content)?;
    let created_at = created_at
        .filter(|c| !c.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(now_rfc3339);
    conn.execute(
        "INSERT INTO observations (entity_id, content, created_at) VALUES (?1, ?2, ?3)",
        params![entity_id, content, created_at],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn list_observations(conn: &Connection, entity_id: i64) -> Result<Vec<Observation>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, entity_id, content, created_at FROM observations WHERE entity_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![entity_id], |row| {
        Ok(Observation {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            content: row.get(2)?,
            created_at: row.get(3)?,
            embedding: None,
        })
    })?;
    let mut observations = Vec::new();
    for row in rows {
        observations.push(row?);
    }
    Ok(observations)
}

pub(crate) fn observation_contents(conn: &Connection, entity_id: i64) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare_cached("SELECT content FROM observations WHERE entity_id = ?1")?;
    let rows = stmt.query_map(params![entity_id], |row| row.get::<_, String>(0))?;
    let mut contents = HashSet::new();
    for row in rows {
        contents.insert(row?);
    }
    Ok(contents)
}

/// Recompute the cached observation count from the observations table.
pub(crate) fn refresh_observation_count(conn: &Connection, entity_id: i64) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM observations WHERE entity_id = ?1",
        params![entity_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE entities SET observations_count = ?1, updated_at = ?2 WHERE id = ?3",
        params![count, now_rfc3339(), entity_id],
    )?;
    Ok(count)
}

/// Insert a relation, returning `None` when the (from, to, type) triple exists.
pub(crate) fn insert_relation(
    conn: &Connection,
    from: i64,
    to: i64,
    relation_type: &str,
) -> Result<Option<i64>> {
    validate_type(relation_type, "Relation type")?;
    if from == to {
        return Err(GraphError::validation(format!(
            "Relation '{}' cannot point entity {} at itself",
            relation_type, from
        )));
    }
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO relations (from_entity_id, to_entity_id, relation_type, created_at)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    match stmt.execute(params![from, to, relation_type.trim(), now_rfc3339()]) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(conn.last_insert_rowid())),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(GraphError::validation(format!(
                "Cannot create relation {} -> {}: one or both entities do not exist",
                from, to
            )))
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn require_relation(conn: &Connection, id: i64) -> Result<Relation> {
    conn.query_row(
        "SELECT id, from_entity_id, to_entity_id, relation_type, created_at FROM relations WHERE id = ?1",
        params![id],
        row_to_relation,
    )
    .optional()?
    .ok_or_else(|| GraphError::NotFound {
        kind: "Relation",
        id: id.to_string(),
    })
}

pub(crate) fn find_relation(
    conn: &Connection,
    from: i64,
    to: i64,
    relation_type: &str,
) -> Result<Option<Relation>> {
    Ok(conn
        .query_row(
            "SELECT id, from_entity_id, to_entity_id, relation_type, created_at FROM relations
             WHERE from_entity_id = ?1 AND to_entity_id = ?2 AND relation_type = ?3",
            params![from, to, relation_type],
            row_to_relation,
        )
        .optional()?)
}

/// Parent-child relations where `child_id` is the child (`from`).
pub(crate) fn parent_relations(conn: &Connection, child_id: i64) -> Result<Vec<Relation>> {
    let sql = format!(
        "SELECT id, from_entity_id, to_entity_id, relation_type, created_at FROM relations
         WHERE from_entity_id = ?1 AND relation_type IN {} ORDER BY id",
        PARENT_CHILD_SQL
    );
    query_relations(conn, &sql, params![child_id])
}

/// Parent-child relations where `parent_id` is the parent (`to`).
pub(crate) fn child_relations(conn: &Connection, parent_id: i64) -> Result<Vec<Relation>> {
    let sql = format!(
        "SELECT id, from_entity_id, to_entity_id, relation_type, created_at FROM relations
         WHERE to_entity_id = ?1 AND relation_type IN {} ORDER BY id",
        PARENT_CHILD_SQL
    );
    query_relations(conn, &sql, params![parent_id])
}

/// Non-parent-child relations leaving `entity_id`.
pub(crate) fn lateral_relations(conn: &Connection, entity_id: i64) -> Result<Vec<Relation>> {
    let sql = format!(
        "SELECT id, from_entity_id, to_entity_id, relation_type, created_at FROM relations
         WHERE from_entity_id = ?1 AND relation_type NOT IN {} ORDER BY id",
        PARENT_CHILD_SQL
    );
    query_relations(conn, &sql, params![entity_id])
}

pub(crate) fn relations_touching(conn: &Connection, entity_id: i64) -> Result<Vec<Relation>> {
    query_relations(
        conn,
        "SELECT id, from_entity_id, to_entity_id, relation_type, created_at FROM relations
         WHERE from_entity_id = ?1 OR to_entity_id = ?1 ORDER BY id",
        params![entity_id],
    )
}

/// Move every observation of `from_entity` to `to_entity`; returns the count moved.
pub(crate) fn reassign_observations(conn: &Connection, from_entity: i64, to_entity: i64) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE observations SET entity_id = ?1 WHERE entity_id = ?2",
        params![to_entity, from_entity],
    )?)
}

pub(crate) fn repoint_relation(conn: &Connection, id: i64, from: i64, to: i64) -> Result<()> {
    conn.execute(
        "UPDATE relations SET from_entity_id = ?1, to_entity_id = ?2 WHERE id = ?3",
        params![from, to, id],
    )?;
    Ok(())
}

pub(crate) fn delete_relation_row(conn: &Connection, id: i64) -> Result<usize> {
    Ok(conn.execute("DELETE FROM relations WHERE id = ?1", params![id])?)
}

/// Drop the parent-child relations of every direct child of `parent_id`.
pub(crate) fn detach_children(conn: &Connection, parent_id: i64) -> Result<usize> {
    let sql = format!(
        "DELETE FROM relations WHERE to_entity_id = ?1 AND relation_type IN {}",
        PARENT_CHILD_SQL
    );
    Ok(conn.execute(&sql, params![parent_id])?)
}

pub(crate) fn graph_stats(conn: &Connection) -> Result<GraphStats> {
    let count = |table: &str| -> Result<i64> {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?)
    };
    Ok(GraphStats {
        entities: count("entities")?,
        observations: count("observations")?,
        relations: count("relations")?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub fn temp_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("graph.db")).unwrap();
        (dir, db)
    }

    pub fn entity(db: &Database, name: &str, entity_type: &str) -> Entity {
        db.create_entity(&NewEntity::new(name, entity_type)).unwrap()
    }

    pub fn link(db: &Database, from: &Entity, to: &Entity, relation_type: &str) -> Relation {
        db.create_relation(from.id, to.id, relation_type).unwrap().unwrap()
    }
}
