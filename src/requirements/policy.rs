//! Organization-specific override policies.
//!
//! A policy modifies a payer's base requirement set for one org and task
//! type, either payer-scoped or org-wide (`payer_id = NULL`). Policies are
//! versioned per scope and retired only by deactivation; approval is advisory
//! metadata and never gates whether a policy applies.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::FieldreqError;
use crate::core::store::Store;
use crate::core::time;
use crate::requirements::audit::{self, ChangeType};
use crate::requirements::cache;
use crate::requirements::fields::FieldChanges;
use clap::{Parser, Subcommand};
use rusqlite::{Connection, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const SOURCE_ENTITY: &str = "org_policies";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    Add,
    Remove,
    Override,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Add => "add",
            PolicyType::Remove => "remove",
            PolicyType::Override => "override",
        }
    }

    pub fn parse(s: &str) -> Result<Self, FieldreqError> {
        match s {
            "add" => Ok(PolicyType::Add),
            "remove" => Ok(PolicyType::Remove),
            "override" => Ok(PolicyType::Override),
            other => Err(FieldreqError::ValidationError(format!(
                "unknown policy_type '{}' (expected add, remove, or override)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrgPolicy {
    pub policy_id: String,
    pub org_id: String,
    pub task_type_id: String,
    pub payer_id: Option<String>,
    pub policy_type: PolicyType,
    pub field_changes: FieldChanges,
    pub reason: String,
    pub version: i64,
    pub active: bool,
    pub created_at: String,
    pub created_by: String,
    pub approved_by: Option<String>,
    pub approved_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOrgPolicy {
    pub org_id: String,
    pub task_type_id: String,
    pub payer_id: Option<String>,
    pub policy_type: PolicyType,
    pub field_changes: FieldChanges,
    pub reason: String,
}

impl NewOrgPolicy {
    fn check(&self) -> Result<(), FieldreqError> {
        if self.org_id.is_empty() || self.task_type_id.is_empty() {
            return Err(FieldreqError::ValidationError(
                "org_id and task_type_id are required".to_string(),
            ));
        }
        if self.reason.is_empty() {
            return Err(FieldreqError::ValidationError(
                "a policy must state its reason".to_string(),
            ));
        }
        self.field_changes.check()
    }
}

/// Create a policy, active and unapproved, versioned within its exact scope
/// (org, task type, payer-or-org-wide). One audit row, same transaction.
pub fn create_policy(
    store: &Store,
    actor: &str,
    new: NewOrgPolicy,
) -> Result<OrgPolicy, FieldreqError> {
    new.check()?;
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, actor, None, "policy.create", |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM org_policies
             WHERE org_id = ?1 AND task_type_id = ?2
               AND ((?3 IS NULL AND payer_id IS NULL) OR payer_id = ?3)",
            params![new.org_id, new.task_type_id, new.payer_id],
            |row| row.get(0),
        )?;

        let row = OrgPolicy {
            policy_id: Ulid::new().to_string(),
            org_id: new.org_id.clone(),
            task_type_id: new.task_type_id.clone(),
            payer_id: new.payer_id.clone(),
            policy_type: new.policy_type,
            field_changes: new.field_changes.clone(),
            reason: new.reason.clone(),
            version,
            active: true,
            created_at: time::now_epoch_z(),
            created_by: actor.to_string(),
            approved_by: None,
            approved_at: None,
        };

        tx.execute(
            "INSERT INTO org_policies(policy_id, org_id, task_type_id, payer_id, policy_type,
                field_changes, reason, version, active, created_at, created_by,
                approved_by, approved_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10, NULL, NULL)",
            params![
                row.policy_id,
                row.org_id,
                row.task_type_id,
                row.payer_id,
                row.policy_type.as_str(),
                serde_json::to_string(&row.field_changes)?,
                row.reason,
                row.version,
                row.created_at,
                row.created_by,
            ],
        )?;

        let snapshot = serde_json::to_value(&row)?;
        audit::record(
            &tx,
            SOURCE_ENTITY,
            &row.policy_id,
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

/// Record approval metadata. Advisory only: an unapproved active policy still
/// applies. Approving twice is a validation error.
pub fn approve(store: &Store, policy_id: &str, approver: &str) -> Result<OrgPolicy, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, approver, None, "policy.approve", |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = get_in_tx(&tx, policy_id)?;
        if previous.approved_by.is_some() {
            return Err(FieldreqError::ValidationError(format!(
                "policy {} is already approved",
                policy_id
            )));
        }

        let mut updated = previous.clone();
        updated.approved_by = Some(approver.to_string());
        updated.approved_at = Some(time::now_epoch_z());

        tx.execute(
            "UPDATE org_policies SET approved_by = ?1, approved_at = ?2 WHERE policy_id = ?3",
            params![updated.approved_by, updated.approved_at, policy_id],
        )?;

        let prev_snapshot = serde_json::to_value(&previous)?;
        let new_snapshot = serde_json::to_value(&updated)?;
        audit::record(
            &tx,
            SOURCE_ENTITY,
            policy_id,
            ChangeType::Update,
            Some(&prev_snapshot),
            Some(&new_snapshot),
            approver,
        )?;
        cache::invalidate_in_tx(&tx)?;

        tx.commit()?;
        Ok(updated)
    })
}

/// Retire a policy. The only deactivation path; rows are never deleted.
pub fn deactivate(store: &Store, policy_id: &str, actor: &str) -> Result<OrgPolicy, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, actor, None, "policy.deactivate", |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = get_in_tx(&tx, policy_id)?;
        if !previous.active {
            return Err(FieldreqError::ValidationError(format!(
                "policy {} is already inactive",
                policy_id
            )));
        }

        let mut updated = previous.clone();
        updated.active = false;

        tx.execute(
            "UPDATE org_policies SET active = 0 WHERE policy_id = ?1",
            params![policy_id],
        )?;

        let prev_snapshot = serde_json::to_value(&previous)?;
        let new_snapshot = serde_json::to_value(&updated)?;
        audit::record(
            &tx,
            SOURCE_ENTITY,
            policy_id,
            ChangeType::Update,
            Some(&prev_snapshot),
            Some(&new_snapshot),
            actor,
        )?;
        cache::invalidate_in_tx(&tx)?;

        tx.commit()?;
        Ok(updated)
    })
}

pub fn get(store: &Store, policy_id: &str) -> Result<OrgPolicy, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);
    broker.with_conn(&db_path, "fieldreq", None, "policy.get", |conn| {
        get_in_tx(conn, policy_id)
    })
}

/// Active policies whose scope matches: exact payer scope or org-wide.
pub fn find_applicable(
    store: &Store,
    org_id: &str,
    task_type_id: &str,
    payer_id: &str,
) -> Result<Vec<OrgPolicy>, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, "fieldreq", None, "policy.find_applicable", |conn| {
        let mut stmt = conn.prepare(
            "SELECT policy_id, org_id, task_type_id, payer_id, policy_type, field_changes,
                    reason, version, active, created_at, created_by, approved_by, approved_at
             FROM org_policies
             WHERE org_id = ?1 AND task_type_id = ?2 AND active = 1
               AND (payer_id IS NULL OR payer_id = ?3)
             ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![org_id, task_type_id, payer_id], map_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(decode_row(r?)?);
        }
        Ok(out)
    })
}

pub fn list_for_org(store: &Store, org_id: &str) -> Result<Vec<OrgPolicy>, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, "fieldreq", None, "policy.list", |conn| {
        let mut stmt = conn.prepare(
            "SELECT policy_id, org_id, task_type_id, payer_id, policy_type, field_changes,
                    reason, version, active, created_at, created_by, approved_by, approved_at
             FROM org_policies
             WHERE org_id = ?1
             ORDER BY created_at ASC, policy_id ASC",
        )?;
        let rows = stmt.query_map(params![org_id], map_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(decode_row(r?)?);
        }
        Ok(out)
    })
}

/// Every active policy in the store, for the cache rebuild.
pub(crate) fn load_active(store: &Store) -> Result<Vec<OrgPolicy>, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, "fieldreq", None, "policy.load_active", |conn| {
        let mut stmt = conn.prepare(
            "SELECT policy_id, org_id, task_type_id, payer_id, policy_type, field_changes,
                    reason, version, active, created_at, created_by, approved_by, approved_at
             FROM org_policies
             WHERE active = 1",
        )?;
        let rows = stmt.query_map([], map_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(decode_row(r?)?);
        }
        Ok(out)
    })
}

fn get_in_tx(conn: &Connection, policy_id: &str) -> Result<OrgPolicy, FieldreqError> {
    let mut stmt = conn.prepare(
        "SELECT policy_id, org_id, task_type_id, payer_id, policy_type, field_changes,
                reason, version, active, created_at, created_by, approved_by, approved_at
         FROM org_policies
         WHERE policy_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![policy_id], map_row)?;
    match rows.next() {
        Some(raw) => decode_row(raw?),
        None => Err(FieldreqError::NotFound(format!(
            "no policy with id {}",
            policy_id
        ))),
    }
}

type RawRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    i64,
    bool,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn decode_row(raw: RawRow) -> Result<OrgPolicy, FieldreqError> {
    let (
        policy_id,
        org_id,
        task_type_id,
        payer_id,
        policy_type,
        field_changes,
        reason,
        version,
        active,
        created_at,
        created_by,
        approved_by,
        approved_at,
    ) = raw;
    Ok(OrgPolicy {
        policy_id,
        org_id,
        task_type_id,
        payer_id,
        policy_type: PolicyType::parse(&policy_type)?,
        field_changes: serde_json::from_str(&field_changes)?,
        reason,
        version,
        active,
        created_at,
        created_by,
        approved_by,
        approved_at,
    })
}

#[derive(Parser, Debug)]
#[clap(name = "policy", about = "Manage organization requirement policies")]
pub struct PolicyCli {
    #[clap(subcommand)]
    pub command: PolicyCommand,
}

#[derive(Subcommand, Debug)]
pub enum PolicyCommand {
    /// Create an active, unapproved policy.
    Create {
        #[clap(long)]
        org_id: String,
        #[clap(long)]
        task_type_id: String,
        /// Payer scope; omit for an org-wide policy.
        #[clap(long)]
        payer_id: Option<String>,
        /// Policy type: add, remove, or override.
        #[clap(long)]
        policy_type: String,
        /// Field changes as JSON: {"required_fields": ["ssn"]}.
        #[clap(long)]
        changes: String,
        #[clap(long)]
        reason: String,
    },
    /// Record approval metadata on a policy.
    Approve {
        #[clap(long)]
        id: String,
    },
    /// Deactivate a policy (the only retirement path).
    Deactivate {
        #[clap(long)]
        id: String,
    },
    /// List all policies for an organization.
    List {
        #[clap(long)]
        org_id: String,
    },
}

pub fn run_policy_cli(store: &Store, actor: &str, cli: PolicyCli) -> Result<(), FieldreqError> {
    db::initialize_requirements_db(&store.root)?;
    match cli.command {
        PolicyCommand::Create {
            org_id,
            task_type_id,
            payer_id,
            policy_type,
            changes,
            reason,
        } => {
            let field_changes: FieldChanges =
                serde_json::from_str(&changes).map_err(FieldreqError::JsonError)?;
            let row = create_policy(
                store,
                actor,
                NewOrgPolicy {
                    org_id,
                    task_type_id,
                    payer_id,
                    policy_type: PolicyType::parse(&policy_type)?,
                    field_changes,
                    reason,
                },
            )?;
            println!(
                "Created policy {} ({} v{}, scope {})",
                row.policy_id,
                row.policy_type.as_str(),
                row.version,
                row.payer_id.as_deref().unwrap_or("org-wide"),
            );
        }
        PolicyCommand::Approve { id } => {
            let row = approve(store, &id, actor)?;
            println!(
                "Policy {} approved by {} at {}",
                row.policy_id,
                row.approved_by.as_deref().unwrap_or("-"),
                row.approved_at.as_deref().unwrap_or("-"),
            );
        }
        PolicyCommand::Deactivate { id } => {
            let row = deactivate(store, &id, actor)?;
            println!("Policy {} deactivated", row.policy_id);
        }
        PolicyCommand::List { org_id } => {
            for row in list_for_org(store, &org_id)? {
                println!(
                    "{}  {:<8} v{}  task {}  scope {}  active={}  approved={}",
                    row.policy_id,
                    row.policy_type.as_str(),
                    row.version,
                    row.task_type_id,
                    row.payer_id.as_deref().unwrap_or("org-wide"),
                    row.active,
                    row.approved_by.is_some(),
                );
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "policy",
        "version": "0.1.0",
        "description": "Organization override policies (add/remove/override) with advisory approval",
        "commands": [
            { "name": "create", "parameters": ["org_id", "task_type_id", "payer_id", "policy_type", "changes", "reason"] },
            { "name": "approve", "parameters": ["id"] },
            { "name": "deactivate", "parameters": ["id"] },
            { "name": "list", "parameters": ["org_id"] }
        ],
        "storage": ["requirements.db#org_policies"]
    })
}
