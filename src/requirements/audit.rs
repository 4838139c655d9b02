//! Append-only change ledger for compliance review.
//!
//! Every mutation to payer requirements, org policies, or the endpoint
//! directory writes exactly one row here, inside the same transaction as the
//! mutation itself. The contract "no mutation without audit" is made explicit
//! by `record` taking the open transaction's connection; there is no other
//! write path into this table. The ledger is never replayed to reconstruct
//! state.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::FieldreqError;
use crate::core::store::Store;
use crate::core::time;
use clap::{Parser, Subcommand};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, FieldreqError> {
        match s {
            "insert" => Ok(ChangeType::Insert),
            "update" => Ok(ChangeType::Update),
            "delete" => Ok(ChangeType::Delete),
            other => Err(FieldreqError::ValidationError(format!(
                "unknown change_type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: String,
    pub source_entity: String,
    pub source_id: String,
    pub change_type: ChangeType,
    pub previous_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub changed_by: String,
    pub changed_at: String,
}

/// Append one ledger row on the caller's open transaction. If this insert
/// fails the caller's transaction never commits, so a mutation can never
/// become visible without its audit entry.
pub fn record(
    conn: &Connection,
    source_entity: &str,
    source_id: &str,
    change_type: ChangeType,
    previous_value: Option<&serde_json::Value>,
    new_value: Option<&serde_json::Value>,
    changed_by: &str,
) -> Result<String, FieldreqError> {
    let audit_id = Ulid::new().to_string();
    conn.execute(
        "INSERT INTO change_audit(audit_id, source_entity, source_id, change_type,
            previous_value, new_value, changed_by, changed_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            audit_id,
            source_entity,
            source_id,
            change_type.as_str(),
            previous_value.map(|v| v.to_string()),
            new_value.map(|v| v.to_string()),
            changed_by,
            time::now_epoch_z(),
        ],
    )?;
    Ok(audit_id)
}

/// Full change history for one entity, oldest first. ULID audit ids are
/// time-ordered, so they break ties within a one-second timestamp bucket.
pub fn history(
    store: &Store,
    source_entity: &str,
    source_id: &str,
) -> Result<Vec<AuditEntry>, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, "fieldreq", None, "audit.history", |conn| {
        let mut stmt = conn.prepare(
            "SELECT audit_id, source_entity, source_id, change_type,
                    previous_value, new_value, changed_by, changed_at
             FROM change_audit
             WHERE source_entity = ?1 AND source_id = ?2
             ORDER BY changed_at ASC, audit_id ASC",
        )?;
        let rows = stmt.query_map(params![source_entity, source_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let (audit_id, entity, id, change_type, prev, new, changed_by, changed_at) = r?;
            out.push(AuditEntry {
                audit_id,
                source_entity: entity,
                source_id: id,
                change_type: ChangeType::parse(&change_type)?,
                previous_value: prev.map(|s| serde_json::from_str(&s)).transpose()?,
                new_value: new.map(|s| serde_json::from_str(&s)).transpose()?,
                changed_by,
                changed_at,
            });
        }
        Ok(out)
    })
}

#[derive(Parser, Debug)]
#[clap(name = "audit", about = "Inspect the requirements change ledger")]
pub struct AuditCli {
    #[clap(subcommand)]
    pub command: AuditCommand,
}

#[derive(Subcommand, Debug)]
pub enum AuditCommand {
    /// Show the change history for one entity, oldest first.
    History {
        /// Source entity: payer_requirements, org_policies, or endpoints.
        #[clap(long)]
        entity: String,
        #[clap(long)]
        id: String,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
}

pub fn run_audit_cli(store: &Store, cli: AuditCli) -> Result<(), FieldreqError> {
    match cli.command {
        AuditCommand::History { entity, id, format } => {
            let entries = history(store, &entity, &id)?;
            if format == "json" {
                let envelope = time::command_envelope(
                    "audit.history",
                    "ok",
                    serde_json::json!({
                        "entity": entity,
                        "id": id,
                        "count": entries.len(),
                        "entries": entries,
                    }),
                );
                println!("{}", serde_json::to_string_pretty(&envelope).unwrap());
            } else {
                println!("History for {} {} ({} entries)", entity, id, entries.len());
                for e in &entries {
                    println!(
                        "{}  {:<7}  by {}  [{}]",
                        e.changed_at,
                        e.change_type.as_str(),
                        e.changed_by,
                        e.audit_id
                    );
                }
            }
            Ok(())
        }
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "audit",
        "version": "0.1.0",
        "description": "Append-only change ledger, written in the same transaction as each mutation",
        "commands": [
            { "name": "history", "parameters": ["entity", "id", "format"] }
        ],
        "storage": ["requirements.db#change_audit"]
    })
}
