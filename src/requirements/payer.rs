//! Versioned, effective-dated base requirement definitions per (payer, task type).
//!
//! Rows are immutable: a change to a payer's standard is a new version, never
//! an edit. The active version as of a date is the highest version whose
//! effective date is not in the future. Version numbers are allocated inside
//! the write transaction; a concurrent writer racing to the same version
//! trips the unique constraint and surfaces `ConflictError`.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::{self, FieldreqError};
use crate::core::store::Store;
use crate::core::time;
use crate::requirements::audit::{self, ChangeType};
use crate::requirements::cache;
use crate::requirements::fields::{self, FieldSet, RuleMap};
use clap::{Parser, Subcommand};
use rusqlite::{TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const SOURCE_ENTITY: &str = "payer_requirements";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayerRequirement {
    pub requirement_id: String,
    pub payer_id: String,
    pub task_type_id: String,
    pub version: i64,
    pub required_fields: FieldSet,
    pub optional_fields: FieldSet,
    pub field_rules: RuleMap,
    pub compliance_ref: Option<String>,
    pub effective_date: String,
    pub created_at: String,
    pub created_by: String,
}

/// Input for a new version. The version number itself is store-allocated.
#[derive(Debug, Clone, Default)]
pub struct NewPayerRequirement {
    pub payer_id: String,
    pub task_type_id: String,
    pub required_fields: FieldSet,
    pub optional_fields: FieldSet,
    pub field_rules: RuleMap,
    pub compliance_ref: Option<String>,
    pub effective_date: String,
}

impl NewPayerRequirement {
    fn check(&self) -> Result<(), FieldreqError> {
        if self.payer_id.is_empty() || self.task_type_id.is_empty() {
            return Err(FieldreqError::ValidationError(
                "payer_id and task_type_id are required".to_string(),
            ));
        }
        if !time::is_iso_date(&self.effective_date) {
            return Err(FieldreqError::ValidationError(format!(
                "effective_date '{}' is not YYYY-MM-DD",
                self.effective_date
            )));
        }
        fields::check_rules(&self.field_rules)
    }
}

/// Create the next version for (payer, task type). Appends one audit row and
/// drops the persisted cache snapshot in the same transaction.
pub fn create_version(
    store: &Store,
    actor: &str,
    new: NewPayerRequirement,
) -> Result<PayerRequirement, FieldreqError> {
    new.check()?;
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, actor, None, "payer.create_version", |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM payer_requirements
             WHERE payer_id = ?1 AND task_type_id = ?2",
            params![new.payer_id, new.task_type_id],
            |row| row.get(0),
        )?;

        let row = PayerRequirement {
            requirement_id: Ulid::new().to_string(),
            payer_id: new.payer_id.clone(),
            task_type_id: new.task_type_id.clone(),
            version,
            required_fields: new.required_fields.clone(),
            optional_fields: new.optional_fields.clone(),
            field_rules: new.field_rules.clone(),
            compliance_ref: new.compliance_ref.clone(),
            effective_date: new.effective_date.clone(),
            created_at: time::now_epoch_z(),
            created_by: actor.to_string(),
        };

        tx.execute(
            "INSERT INTO payer_requirements(requirement_id, payer_id, task_type_id, version,
                required_fields, optional_fields, field_rules, compliance_ref,
                effective_date, created_at, created_by)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.requirement_id,
                row.payer_id,
                row.task_type_id,
                row.version,
                fields::encode_set(&row.required_fields),
                fields::encode_set(&row.optional_fields),
                fields::encode_rules(&row.field_rules),
                row.compliance_ref,
                row.effective_date,
                row.created_at,
                row.created_by,
            ],
        )
        .map_err(|e| {
            if error::is_unique_violation(&e) {
                FieldreqError::ConflictError(format!(
                    "payer requirement {}/{} version {} already exists",
                    row.payer_id, row.task_type_id, row.version
                ))
            } else {
                FieldreqError::RusqliteError(e)
            }
        })?;

        let snapshot = serde_json::to_value(&row)?;
        audit::record(
            &tx,
            SOURCE_ENTITY,
            &row.requirement_id,
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

/// Active version for (payer, task type) as of a date: highest version with
/// `effective_date <= as_of`. Future-dated versions are invisible.
pub fn get_active(
    store: &Store,
    payer_id: &str,
    task_type_id: &str,
    as_of: &str,
) -> Result<PayerRequirement, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, "fieldreq", None, "payer.get_active", |conn| {
        let mut stmt = conn.prepare(
            "SELECT requirement_id, payer_id, task_type_id, version, required_fields,
                    optional_fields, field_rules, compliance_ref, effective_date,
                    created_at, created_by
             FROM payer_requirements
             WHERE payer_id = ?1 AND task_type_id = ?2 AND effective_date <= ?3
             ORDER BY version DESC
             LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![payer_id, task_type_id, as_of], map_row)?;
        match rows.next() {
            Some(raw) => decode_row(raw?),
            None => Err(FieldreqError::NotFound(format!(
                "no active payer requirement for {}/{} as of {}",
                payer_id, task_type_id, as_of
            ))),
        }
    })
}

/// All versions for (payer, task type), ascending.
pub fn list_versions(
    store: &Store,
    payer_id: &str,
    task_type_id: &str,
) -> Result<Vec<PayerRequirement>, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, "fieldreq", None, "payer.list_versions", |conn| {
        let mut stmt = conn.prepare(
            "SELECT requirement_id, payer_id, task_type_id, version, required_fields,
                    optional_fields, field_rules, compliance_ref, effective_date,
                    created_at, created_by
             FROM payer_requirements
             WHERE payer_id = ?1 AND task_type_id = ?2
             ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![payer_id, task_type_id], map_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(decode_row(r?)?);
        }
        Ok(out)
    })
}

/// Every payer requirement row in the store. The cache rebuild loads these
/// once and selects active versions in memory.
pub(crate) fn load_all(store: &Store) -> Result<Vec<PayerRequirement>, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, "fieldreq", None, "payer.load_all", |conn| {
        let mut stmt = conn.prepare(
            "SELECT requirement_id, payer_id, task_type_id, version, required_fields,
                    optional_fields, field_rules, compliance_ref, effective_date,
                    created_at, created_by
             FROM payer_requirements",
        )?;
        let rows = stmt.query_map([], map_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(decode_row(r?)?);
        }
        Ok(out)
    })
}

type RawRow = (
    String,
    String,
    String,
    i64,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
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
    ))
}

fn decode_row(raw: RawRow) -> Result<PayerRequirement, FieldreqError> {
    let (
        requirement_id,
        payer_id,
        task_type_id,
        version,
        required,
        optional,
        rules,
        compliance_ref,
        effective_date,
        created_at,
        created_by,
    ) = raw;
    Ok(PayerRequirement {
        requirement_id,
        payer_id,
        task_type_id,
        version,
        required_fields: fields::decode_set(&required)?,
        optional_fields: fields::decode_set(&optional)?,
        field_rules: fields::decode_rules(&rules)?,
        compliance_ref,
        effective_date,
        created_at,
        created_by,
    })
}

#[derive(Parser, Debug)]
#[clap(name = "payer", about = "Manage payer-level base requirements")]
pub struct PayerCli {
    #[clap(subcommand)]
    pub command: PayerCommand,
}

#[derive(Subcommand, Debug)]
pub enum PayerCommand {
    /// Create the next requirement version for a (payer, task type) pair.
    Create {
        #[clap(long)]
        payer_id: String,
        #[clap(long)]
        task_type_id: String,
        /// Required field names (comma separated).
        #[clap(long, value_delimiter = ',', num_args = 0..)]
        required: Vec<String>,
        /// Optional field names (comma separated).
        #[clap(long, value_delimiter = ',', num_args = 0..)]
        optional: Vec<String>,
        /// Field rules as a JSON object: {"field": {"pattern": "..."}}.
        #[clap(long, default_value = "{}")]
        rules: String,
        #[clap(long)]
        compliance_ref: Option<String>,
        /// Effective date (YYYY-MM-DD); defaults to today.
        #[clap(long)]
        effective_date: Option<String>,
    },
    /// Show the active version as of a date.
    Get {
        #[clap(long)]
        payer_id: String,
        #[clap(long)]
        task_type_id: String,
        #[clap(long)]
        as_of: Option<String>,
    },
    /// List all versions for a (payer, task type) pair.
    Versions {
        #[clap(long)]
        payer_id: String,
        #[clap(long)]
        task_type_id: String,
    },
}

pub fn run_payer_cli(store: &Store, actor: &str, cli: PayerCli) -> Result<(), FieldreqError> {
    db::initialize_requirements_db(&store.root)?;
    match cli.command {
        PayerCommand::Create {
            payer_id,
            task_type_id,
            required,
            optional,
            rules,
            compliance_ref,
            effective_date,
        } => {
            let field_rules: RuleMap =
                serde_json::from_str(&rules).map_err(FieldreqError::JsonError)?;
            let row = create_version(
                store,
                actor,
                NewPayerRequirement {
                    payer_id,
                    task_type_id,
                    required_fields: required.into_iter().collect(),
                    optional_fields: optional.into_iter().collect(),
                    field_rules,
                    compliance_ref,
                    effective_date: effective_date.unwrap_or_else(time::today_utc),
                },
            )?;
            println!(
                "Created {}/{} version {} (id {})",
                row.payer_id, row.task_type_id, row.version, row.requirement_id
            );
        }
        PayerCommand::Get {
            payer_id,
            task_type_id,
            as_of,
        } => {
            let as_of = as_of.unwrap_or_else(time::today_utc);
            let row = get_active(store, &payer_id, &task_type_id, &as_of)?;
            println!("{}", serde_json::to_string_pretty(&row).unwrap());
        }
        PayerCommand::Versions {
            payer_id,
            task_type_id,
        } => {
            for row in list_versions(store, &payer_id, &task_type_id)? {
                println!(
                    "v{}  effective {}  created {} by {}",
                    row.version, row.effective_date, row.created_at, row.created_by
                );
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "payer",
        "version": "0.1.0",
        "description": "Versioned, effective-dated payer base requirements",
        "commands": [
            { "name": "create", "parameters": ["payer_id", "task_type_id", "required", "optional", "rules", "compliance_ref", "effective_date"] },
            { "name": "get", "parameters": ["payer_id", "task_type_id", "as_of"] },
            { "name": "versions", "parameters": ["payer_id", "task_type_id"] }
        ],
        "storage": ["requirements.db#payer_requirements"]
    })
}
