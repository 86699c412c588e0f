//! Candidate operation audit logging.

use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;

/// Control operations recorded in `candidate_operations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Accept,
    Reject,
    Unreject,
    Evaluate,
    Sync,
    Prune,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Accept => "accept",
            OperationType::Reject => "reject",
            OperationType::Unreject => "unreject",
            OperationType::Evaluate => "evaluate",
            OperationType::Sync => "sync",
            OperationType::Prune => "prune",
        }
    }
}

/// One row of the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub operation_id: String,
    pub timestamp: String,
    pub operation_type: String,
    pub relation_id: String,
    pub actor: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub metadata_json: Option<String>,
}

/// Log a candidate operation to the audit table.
///
/// Returns the generated operation_id (UUID).
pub async fn log_operation(
    db: &Db,
    operation_type: OperationType,
    relation_id: &str,
    actor: &str,
    success: bool,
    error_message: Option<&str>,
    metadata: Option<serde_json::Value>,
) -> Result<String> {
    let operation_id = Uuid::new_v4().to_string();
    let timestamp = Utc::now().to_rfc3339();

    let op_type = operation_type.as_str();
    let id = relation_id.to_string();
    let actor = actor.to_string();
    let err = error_message.map(String::from);
    let meta = metadata.map(|m| m.to_string());
    let op_id = operation_id.clone();

    db.with_connection(move |conn| {
        conn.execute(
            r#"
            INSERT INTO candidate_operations (
                operation_id, timestamp, operation_type, relation_id,
                actor, success, error_message, metadata_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![op_id, timestamp, op_type, id, actor, success, err, meta],
        )?;
        Ok(())
    })
    .await?;

    Ok(operation_id)
}

/// Most recent operations for one candidate, newest first.
pub async fn recent_operations(db: &Db, relation_id: &str, limit: usize) -> Result<Vec<OperationRecord>> {
    let id = relation_id.to_string();
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT operation_id, timestamp, operation_type, relation_id,
                   actor, success, error_message, metadata_json
            FROM candidate_operations
            WHERE relation_id = ?1
            ORDER BY timestamp DESC, rowid DESC
            LIMIT ?2
            "#,
        )?;
        let records = stmt
            .query_map(params![id, limit as i64], |row| {
                Ok(OperationRecord {
                    operation_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    operation_type: row.get(2)?,
                    relation_id: row.get(3)?,
                    actor: row.get(4)?,
                    success: row.get(5)?,
                    error_message: row.get(6)?,
                    metadata_json: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(records)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_db;

    #[tokio::test]
    async fn test_log_and_read_back() {
        let (db, _temp) = temp_db().await;

        let id = log_operation(
            &db,
            OperationType::Accept,
            "r1",
            "operator",
            true,
            None,
            Some(serde_json::json!({"manual": true})),
        )
        .await
        .unwrap();
        assert_eq!(id.len(), 36);

        log_operation(&db, OperationType::Sync, "r1", "operator", false, Some("store down"), None)
            .await
            .unwrap();
        log_operation(&db, OperationType::Reject, "r2", "operator", true, None, None)
            .await
            .unwrap();

        let records = recent_operations(&db, "r1", 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operation_type, "sync");
        assert!(!records[0].success);
        assert_eq!(records[0].error_message.as_deref(), Some("store down"));
        assert_eq!(records[1].operation_type, "accept");
        assert!(records[1].metadata_json.as_deref().unwrap().contains("manual"));
    }

    #[tokio::test]
    async fn test_limit() {
        let (db, _temp) = temp_db().await;
        for _ in 0..5 {
            log_operation(&db, OperationType::Evaluate, "r1", "evaluation", true, None, None)
                .await
                .unwrap();
        }
        assert_eq!(recent_operations(&db, "r1", 3).await.unwrap().len(), 3);
    }
}
