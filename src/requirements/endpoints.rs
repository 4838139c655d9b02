//! Minimal endpoint directory.
//!
//! The wider system owns endpoint/organization CRUD; the cache only needs to
//! know which (endpoint, org, payer) associations exist so it can enumerate
//! triples. Registration is still a write path, so it is audited and it
//! invalidates the persisted snapshot like any other store change.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::{self, FieldreqError};
use crate::core::store::Store;
use crate::core::time;
use crate::requirements::audit::{self, ChangeType};
use crate::requirements::cache;
use clap::{Parser, Subcommand};
use rusqlite::{TransactionBehavior, params};
use serde::{Deserialize, Serialize};

pub const SOURCE_ENTITY: &str = "endpoints";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub endpoint_id: String,
    pub org_id: String,
    pub payer_id: String,
    pub created_at: String,
}

pub fn register(
    store: &Store,
    actor: &str,
    endpoint_id: &str,
    org_id: &str,
    payer_id: &str,
) -> Result<Endpoint, FieldreqError> {
    if endpoint_id.is_empty() || org_id.is_empty() || payer_id.is_empty() {
        return Err(FieldreqError::ValidationError(
            "endpoint_id, org_id, and payer_id are required".to_string(),
        ));
    }
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, actor, None, "endpoints.register", |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = Endpoint {
            endpoint_id: endpoint_id.to_string(),
            org_id: org_id.to_string(),
            payer_id: payer_id.to_string(),
            created_at: time::now_epoch_z(),
        };

        tx.execute(
            "INSERT INTO endpoints(endpoint_id, org_id, payer_id, created_at)
             VALUES(?1, ?2, ?3, ?4)",
            params![row.endpoint_id, row.org_id, row.payer_id, row.created_at],
        )
        .map_err(|e| {
            if error::is_unique_violation(&e) {
                FieldreqError::ConflictError(format!(
                    "endpoint {} is already registered",
                    endpoint_id
                ))
            } else {
                FieldreqError::RusqliteError(e)
            }
        })?;

        let snapshot = serde_json::to_value(&row)?;
        audit::record(
            &tx,
            SOURCE_ENTITY,
            &row.endpoint_id,
            ChangeType::Insert,
            None,
            Some(&snapshot),
            actor,
        )?;
        cache::invalidate_in_tx(&tx)?;

        tx.commit()?;
        Ok(row)
    })
}

pub fn list(store: &Store) -> Result<Vec<Endpoint>, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, "fieldreq", None, "endpoints.list", |conn| {
        let mut stmt = conn.prepare(
            "SELECT endpoint_id, org_id, payer_id, created_at
             FROM endpoints
             ORDER BY endpoint_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Endpoint {
                endpoint_id: row.get(0)?,
                org_id: row.get(1)?,
                payer_id: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    })
}

#[derive(Parser, Debug)]
#[clap(name = "endpoint", about = "Manage the endpoint directory slice")]
pub struct EndpointCli {
    #[clap(subcommand)]
    pub command: EndpointCommand,
}

#[derive(Subcommand, Debug)]
pub enum EndpointCommand {
    /// Register an (endpoint, org, payer) association.
    Register {
        #[clap(long)]
        endpoint_id: String,
        #[clap(long)]
        org_id: String,
        #[clap(long)]
        payer_id: String,
    },
    /// List registered endpoints.
    List,
}

pub fn run_endpoint_cli(store: &Store, actor: &str, cli: EndpointCli) -> Result<(), FieldreqError> {
    db::initialize_requirements_db(&store.root)?;
    match cli.command {
        EndpointCommand::Register {
            endpoint_id,
            org_id,
            payer_id,
        } => {
            let row = register(store, actor, &endpoint_id, &org_id, &payer_id)?;
            println!(
                "Registered endpoint {} (org {}, payer {})",
                row.endpoint_id, row.org_id, row.payer_id
            );
        }
        EndpointCommand::List => {
            for row in list(store)? {
                println!("{}  org {}  payer {}", row.endpoint_id, row.org_id, row.payer_id);
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "endpoint",
        "version": "0.1.0",
        "description": "Endpoint directory slice consumed by the cache rebuild",
        "commands": [
            { "name": "register", "parameters": ["endpoint_id", "org_id", "payer_id"] },
            { "name": "list", "parameters": [] }
        ],
        "storage": ["requirements.db#endpoints"]
    })
}
