//! SQLite-backed graph store.
//!
//! Entities live in `entities` with their identity-key values mirrored into
//! the `entities_fts` FTS5 table; identity-key search ranks by BM25.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};

use super::{
    matching_values, pair_matches, property_value_count, search_tokens, EdgeFilter, GraphStore,
    KeySearchHit, MatchingProperties, MatchingValuePair, PropertyFilter, PropertyValueCount,
};
use crate::db::Db;
use crate::entity::Entity;
use crate::error::{Result, ReldiscoError};
use crate::matching::idkey::{identity_projections, identity_signature};

/// Build an FTS5 MATCH expression from a property value.
///
/// Every alphanumeric token is quoted so identifiers like `worker-1` never
/// hit FTS5 operator syntax; tokens are OR-ed for recall and the value
/// matcher filters the hits afterwards.
pub fn build_fts5_query(value: &str) -> Option<String> {
    let tokens = search_tokens(value);
    if tokens.is_empty() {
        return None;
    }
    let quoted: Vec<String> = tokens
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    Some(quoted.join(" OR "))
}

/// Map a raw FTS5 `bm25()` score (negative, lower is better) into (0, 1).
pub fn normalize_bm25_score(raw_score: f64) -> f64 {
    if raw_score.is_nan() || raw_score.is_infinite() {
        return 0.0;
    }
    1.0 / (1.0 + raw_score.exp())
}

fn entity_id(signature: &str) -> String {
    format!("{:x}", Sha256::digest(signature.as_bytes()))
}

fn edge_id(source_id: &str, relation_name: &str, target_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(b"|");
    hasher.update(relation_name.as_bytes());
    hasher.update(b"|");
    hasher.update(target_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn identity_text(entity: &Entity) -> String {
    identity_projections(entity)
        .into_iter()
        .flat_map(|(_, values)| values.into_values())
        .flat_map(|v| v.search_terms())
        .collect::<Vec<_>>()
        .join(" ")
}

fn row_to_entity(
    entity_type: String,
    primary_key_json: &str,
    additional_keys_json: &str,
    properties_json: &str,
) -> Result<Entity> {
    Ok(Entity {
        entity_type,
        primary_key_properties: serde_json::from_str(primary_key_json)?,
        additional_key_properties: serde_json::from_str(additional_keys_json)?,
        all_properties: serde_json::from_str(properties_json)?,
    })
}

fn load_entities_of_type(conn: &Connection, entity_type: &str) -> Result<Vec<Entity>> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, primary_key_json, additional_keys_json, properties_json \
         FROM entities WHERE entity_type = ?1 ORDER BY entity_id",
    )?;
    let mut rows = stmt.query(params![entity_type])?;
    let mut entities = Vec::new();
    while let Some(row) = rows.next()? {
        let primary: String = row.get(1)?;
        let additional: String = row.get(2)?;
        let properties: String = row.get(3)?;
        entities.push(row_to_entity(row.get(0)?, &primary, &additional, &properties)?);
    }
    Ok(entities)
}

/// Graph store on the crate's SQLite schema.
#[derive(Debug, Clone)]
pub struct SqliteGraphStore {
    db: Db,
}

impl SqliteGraphStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert or replace an entity, keyed by its identity signature.
    pub async fn upsert_entity(&self, entity: &Entity) -> Result<String> {
        let signature = identity_signature(entity).ok_or_else(|| {
            ReldiscoError::InvalidEntity(format!("{} entity has no populated identity key", entity.entity_type))
        })?;
        let id = entity_id(&signature);
        let entity_type = entity.entity_type.clone();
        let primary_json = serde_json::to_string(&entity.primary_key_properties)?;
        let additional_json = serde_json::to_string(&entity.additional_key_properties)?;
        let properties_json = serde_json::to_string(&entity.all_properties)?;
        let text = identity_text(entity);
        let now = Utc::now().to_rfc3339();
        let id_clone = id.clone();

        self.db
            .with_connection(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO entities (
                        entity_id, entity_type, primary_key_json, additional_keys_json,
                        properties_json, identity_text, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(entity_id) DO UPDATE SET
                        primary_key_json = excluded.primary_key_json,
                        additional_keys_json = excluded.additional_keys_json,
                        properties_json = excluded.properties_json,
                        identity_text = excluded.identity_text,
                        updated_at = excluded.updated_at
                    "#,
                    params![id_clone, entity_type, primary_json, additional_json, properties_json, text, now],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Delete an entity and, through the foreign keys, its edges.
    pub async fn delete_entity(&self, entity: &Entity) -> Result<bool> {
        let Some(signature) = identity_signature(entity) else {
            return Ok(false);
        };
        let id = entity_id(&signature);
        self.db
            .with_connection(move |conn| {
                let deleted = conn.execute("DELETE FROM entities WHERE entity_id = ?1", params![id])?;
                Ok(deleted > 0)
            })
            .await
    }

    /// Number of edges labelled `relation_name`.
    pub async fn edge_count(&self, relation_name: &str) -> Result<usize> {
        let name = relation_name.to_string();
        self.db
            .with_connection(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM entity_relations WHERE relation_type = ?1",
                    params![name],
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            })
            .await
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn get_all_entity_types(&self) -> Result<Vec<String>> {
        self.db
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT DISTINCT entity_type FROM entities ORDER BY entity_type")?;
                let types = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                Ok(types)
            })
            .await
    }

    async fn find_entity(&self, entity_type: &str, filter: &PropertyFilter) -> Result<Vec<Entity>> {
        let entity_type = entity_type.to_string();
        let filter = filter.clone();
        self.db
            .with_connection(move |conn| {
                let entities = load_entities_of_type(conn, &entity_type)?;
                Ok(entities
                    .into_iter()
                    .filter(|e| super::filter_matches(e, &filter))
                    .collect())
            })
            .await
    }

    async fn search_identity_keys(
        &self,
        value: &str,
        exclude_type: &str,
        max_results: usize,
    ) -> Result<Vec<KeySearchHit>> {
        let Some(query) = build_fts5_query(value) else {
            return Ok(Vec::new());
        };
        let exclude_type = exclude_type.to_string();

        let mut hits = self
            .db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT
                        e.entity_type,
                        e.primary_key_json,
                        e.additional_keys_json,
                        e.properties_json,
                        bm25(entities_fts) AS raw_score
                    FROM entities_fts
                    JOIN entities e ON entities_fts.entity_id = e.entity_id
                    WHERE entities_fts MATCH ?1
                        AND e.entity_type != ?2
                    ORDER BY raw_score
                    LIMIT ?3
                    "#,
                )?;
                let mut rows = stmt.query(params![query, exclude_type, max_results as i64])?;

                let mut hits = Vec::new();
                while let Some(row) = rows.next()? {
                    let primary: String = row.get(1)?;
                    let additional: String = row.get(2)?;
                    let properties: String = row.get(3)?;
                    let raw_score: f64 = row.get(4)?;
                    hits.push(KeySearchHit {
                        entity: row_to_entity(row.get(0)?, &primary, &additional, &properties)?,
                        score: normalize_bm25_score(raw_score),
                    });
                }
                Ok(hits)
            })
            .await?;

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(hits)
    }

    async fn get_property_value_count(&self, entity_type: &str, property: &str) -> Result<PropertyValueCount> {
        let entity_type = entity_type.to_string();
        let property = property.to_string();
        self.db
            .with_connection(move |conn| {
                let entities = load_entities_of_type(conn, &entity_type)?;
                Ok(property_value_count(entities.iter(), &property))
            })
            .await
    }

    async fn get_values_of_matching_property(
        &self,
        entity_a_type: &str,
        entity_a_property: &str,
        entity_b_type: &str,
        matching: &MatchingProperties,
        max_results: usize,
    ) -> Result<Vec<MatchingValuePair>> {
        let (type_a, prop_a, type_b) = (
            entity_a_type.to_string(),
            entity_a_property.to_string(),
            entity_b_type.to_string(),
        );
        let matching = matching.clone();
        self.db
            .with_connection(move |conn| {
                let sources = load_entities_of_type(conn, &type_a)?;
                let targets = load_entities_of_type(conn, &type_b)?;
                let mut pairs = Vec::new();
                for a in sources.iter().filter(|a| a.non_empty_property(&prop_a).is_some()) {
                    for b in &targets {
                        if pairs.len() >= max_results {
                            return Ok(pairs);
                        }
                        if pair_matches(a, b, &matching) {
                            pairs.push(matching_values(a, b, &matching));
                        }
                    }
                }
                Ok(pairs)
            })
            .await
    }

    async fn relate_entities_by_property(
        &self,
        actor: &str,
        owner: &str,
        entity_a_type: &str,
        entity_b_type: &str,
        relation_name: &str,
        matching: &MatchingProperties,
    ) -> Result<usize> {
        let (actor, owner, type_a, type_b, name) = (
            actor.to_string(),
            owner.to_string(),
            entity_a_type.to_string(),
            entity_b_type.to_string(),
            relation_name.to_string(),
        );
        let matching = matching.clone();

        let created = self
            .db
            .with_connection(move |conn| {
                let sources = load_entities_of_type(conn, &type_a)?;
                let targets = load_entities_of_type(conn, &type_b)?;
                let now = Utc::now().to_rfc3339();

                let tx = conn.transaction()?;
                let mut created = 0;
                for a in &sources {
                    let Some(source_id) = identity_signature(a).map(|s| entity_id(&s)) else {
                        continue;
                    };
                    for b in targets.iter().filter(|b| pair_matches(a, b, &matching)) {
                        let Some(target_id) = identity_signature(b).map(|s| entity_id(&s)) else {
                            continue;
                        };
                        let id = edge_id(&source_id, &name, &target_id);
                        tx.execute(
                            r#"
                            INSERT OR IGNORE INTO entity_relations (
                                relation_id, source_entity, relation_type, target_entity,
                                source_type, target_type, created_by, created_at
                            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                            "#,
                            params![
                                id,
                                source_id,
                                name,
                                target_id,
                                type_a,
                                type_b,
                                actor,
                                now
                            ],
                        )?;
                        created += tx.execute(
                            "INSERT OR IGNORE INTO relation_edge_owners (edge_id, candidate_id, created_at) \
                             VALUES (?1, ?2, ?3)",
                            params![id, owner, now],
                        )?;
                    }
                }
                tx.commit()?;
                Ok(created)
            })
            .await?;

        log::debug!(
            "Related {} -[{}]-> {}: {} new edges",
            entity_a_type,
            relation_name,
            entity_b_type,
            created
        );
        Ok(created)
    }

    async fn remove_relation(&self, relation_name: &str, filter: &EdgeFilter) -> Result<usize> {
        let name = relation_name.to_string();
        let owner = filter.owner.clone();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let held: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT o.edge_id FROM relation_edge_owners o \
                         JOIN entity_relations r ON r.relation_id = o.edge_id \
                         WHERE o.candidate_id = ?1 AND r.relation_type = ?2",
                    )?;
                    let ids = stmt
                        .query_map(params![owner, name], |row| row.get::<_, String>(0))?
                        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                    ids
                };

                let mut removed = 0;
                for id in &held {
                    tx.execute(
                        "DELETE FROM relation_edge_owners WHERE edge_id = ?1 AND candidate_id = ?2",
                        params![id, owner],
                    )?;
                    removed += tx.execute(
                        "DELETE FROM entity_relations WHERE relation_id = ?1 \
                         AND NOT EXISTS (SELECT 1 FROM relation_edge_owners WHERE edge_id = ?1)",
                        params![id],
                    )?;
                }
                tx.commit()?;
                Ok(removed)
            })
            .await
    }
}
