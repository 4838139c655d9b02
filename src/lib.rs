//! Fieldreq: hierarchical field requirements, resolved locally.
//!
//! **Fieldreq answers one question: which data fields must this operation
//! supply?** An eligibility check against a payer portal, a status inquiry,
//! a claim submission: each has a payer-level standard, optionally modified
//! by one organization policy, and the answer must be auditable.
//!
//! # Core Principles
//!
//! - **Local-first**: all state is one SQLite database plus append-only
//!   event logs under a store root
//! - **Versioned forward**: requirement versions and policies are never
//!   edited or deleted; new versions and deactivation are the only changes
//! - **Audited**: every mutation commits with exactly one ledger row in the
//!   same transaction, or not at all
//! - **Derived caches stay derived**: the effective-requirements snapshot
//!   can be dropped and rebuilt at any time with no data loss
//!
//! # Architecture
//!
//! ## The override hierarchy
//!
//! A payer publishes base requirements per task type, versioned and
//! effective-dated. An organization layers at most one policy on top:
//! `add`, `remove`, or `override`, applied independently per attribute.
//! [`requirements::resolver`] is the merge; everything else feeds it or
//! consumes it.
//!
//! ## The broker
//!
//! All database access routes through [`core::broker::DbBroker`] for
//! serialization and operational event logging (`broker.events.jsonl`).
//! The compliance ledger (`change_audit`) is separate and transactional.
//!
//! ## Subsystems
//!
//! - `payer`: versioned, effective-dated payer base requirements
//! - `policy`: org override policies with advisory approval
//! - `audit`: append-only change ledger
//! - `endpoints`: the directory slice the cache enumerates
//! - `resolver`: the pure merge with single-policy precedence
//! - `cache`: rebuildable snapshot with atomic publish
//! - `validator`: payload checks against a resolved requirement set
//!
//! # Examples
//!
//! ```bash
//! # Record a payer standard
//! fieldreq payer create --payer-id bcbs-tx --task-type-id eligibility \
//!     --required member_id,dob --optional group_number
//!
//! # Layer an org policy on top
//! fieldreq policy create --org-id acme --task-type-id eligibility \
//!     --policy-type add --changes '{"required_fields":["ssn"]}' \
//!     --reason "state audit finding 2025-14"
//!
//! # Resolve and validate
//! fieldreq resolve --org-id acme --payer-id bcbs-tx --task-type-id eligibility
//! fieldreq validate --org-id acme --payer-id bcbs-tx --task-type-id eligibility \
//!     --payload '{"member_id":"A123","dob":"1980-01-01","ssn":"123456789"}'
//! ```

pub mod core;
pub mod requirements;

use crate::core::{config, db, error::FieldreqError, store::Store, time};
use requirements::{audit, cache, endpoints, payer, policy, resolver, validator};

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "fieldreq",
    version = env!("CARGO_PKG_VERSION"),
    about = "Resolve which data fields an operation must supply: payer standards, org policy overrides, audit ledger, snapshot cache."
)]
pub struct Cli {
    /// Store root directory.
    #[clap(long, global = true, default_value = ".fieldreq/data")]
    pub root: PathBuf,
    /// Actor recorded on mutations (falls back to fieldreq.toml, then "operator").
    #[clap(long, global = true)]
    pub actor: Option<String>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize the requirements database under the store root.
    Init,
    /// Payer-level base requirements.
    Payer(payer::PayerCli),
    /// Organization override policies.
    Policy(policy::PolicyCli),
    /// Endpoint directory slice.
    Endpoint(endpoints::EndpointCli),
    /// Change ledger.
    Audit(audit::AuditCli),
    /// Effective-requirements snapshot.
    Cache(cache::CacheCli),
    /// Resolve the effective requirement set for one context.
    Resolve {
        #[clap(long)]
        org_id: String,
        #[clap(long)]
        payer_id: String,
        #[clap(long)]
        task_type_id: String,
        /// Resolve as of a date (YYYY-MM-DD); bypasses the cache.
        #[clap(long)]
        as_of: Option<String>,
        /// Skip the snapshot and compute live.
        #[clap(long)]
        no_cache: bool,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "json")]
        format: String,
    },
    /// Resolve the requirement sets for every payer an org's endpoints reach.
    ResolveOrg {
        #[clap(long)]
        org_id: String,
        /// Resolve as of a date (YYYY-MM-DD).
        #[clap(long)]
        as_of: Option<String>,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "json")]
        format: String,
    },
    /// Validate a payload against the resolved requirements.
    Validate {
        #[clap(long)]
        org_id: String,
        #[clap(long)]
        payer_id: String,
        #[clap(long)]
        task_type_id: String,
        /// Submitted data as a JSON object.
        #[clap(long)]
        payload: String,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
    /// Print machine-readable subsystem descriptors.
    Schema,
}

pub fn run(cli: Cli) -> Result<(), FieldreqError> {
    let store = Store::open(&cli.root)?;
    let cfg = config::load_config(&store.root)?;
    let actor = cli
        .actor
        .or(cfg.default_actor.clone())
        .unwrap_or_else(|| "operator".to_string());

    match cli.command {
        Command::Init => {
            db::initialize_requirements_db(&store.root)?;
            println!(
                "Requirements database initialized at {}",
                db::requirements_db_path(&store.root).display()
            );
            Ok(())
        }
        Command::Payer(sub) => {
            payer::run_payer_cli(&store, &actor, sub)?;
            rebuild_if_configured(&store, &cfg)
        }
        Command::Policy(sub) => {
            policy::run_policy_cli(&store, &actor, sub)?;
            rebuild_if_configured(&store, &cfg)
        }
        Command::Endpoint(sub) => {
            endpoints::run_endpoint_cli(&store, &actor, sub)?;
            rebuild_if_configured(&store, &cfg)
        }
        Command::Audit(sub) => audit::run_audit_cli(&store, sub),
        Command::Cache(sub) => cache::run_cache_cli(&store, sub),
        Command::Resolve {
            org_id,
            payer_id,
            task_type_id,
            as_of,
            no_cache,
            format,
        } => {
            db::initialize_requirements_db(&store.root)?;
            let requirement = if no_cache {
                resolver::resolve(&store, &org_id, &payer_id, &task_type_id, as_of.as_deref())?
            } else {
                cache::resolve_cached(&store, &org_id, &payer_id, &task_type_id, as_of.as_deref())?
            };
            if format == "json" {
                let envelope = time::command_envelope(
                    "resolve",
                    "ok",
                    serde_json::json!({ "requirement": requirement }),
                );
                println!("{}", serde_json::to_string_pretty(&envelope).unwrap());
            } else {
                println!(
                    "Source: {:?}  Fingerprint: {}",
                    requirement.source,
                    requirement.fingerprint()
                );
                println!(
                    "Required: {}",
                    requirement
                        .required_fields
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                println!(
                    "Optional: {}",
                    requirement
                        .optional_fields
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            Ok(())
        }
        Command::ResolveOrg {
            org_id,
            as_of,
            format,
        } => {
            db::initialize_requirements_db(&store.root)?;
            let requirements = resolver::resolve_for_org(&store, &org_id, as_of.as_deref())?;
            if format == "json" {
                let envelope = time::command_envelope(
                    "resolve-org",
                    "ok",
                    serde_json::json!({ "org_id": org_id, "requirements": requirements }),
                );
                println!("{}", serde_json::to_string_pretty(&envelope).unwrap());
            } else if requirements.is_empty() {
                println!("No endpoints registered for org {}", org_id);
            } else {
                for req in &requirements {
                    println!(
                        "{} / {}: required [{}] optional [{}]",
                        req.payer_id,
                        req.task_type_id,
                        req.required_fields
                            .iter()
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(", "),
                        req.optional_fields
                            .iter()
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
            }
            Ok(())
        }
        Command::Validate {
            org_id,
            payer_id,
            task_type_id,
            payload,
            format,
        } => {
            db::initialize_requirements_db(&store.root)?;
            let submitted: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&payload).map_err(FieldreqError::JsonError)?;
            let result =
                validator::validate_submission(&store, &org_id, &payer_id, &task_type_id, &submitted)?;
            if format == "json" {
                let envelope = time::command_envelope(
                    "validate",
                    if result.is_valid { "ok" } else { "invalid" },
                    serde_json::json!({ "result": result }),
                );
                println!("{}", serde_json::to_string_pretty(&envelope).unwrap());
            } else {
                if result.is_valid {
                    println!("{}", "VALID".green().bold());
                } else {
                    println!("{}", "INVALID".red().bold());
                }
                for field in &result.missing_required {
                    println!("  missing required: {}", field.red());
                }
                for v in &result.rule_violations {
                    println!("  {}: {}", v.field.red(), v.reason);
                }
                for field in &result.extra_fields {
                    println!("  extra field (not in requirements): {}", field.yellow());
                }
            }
            Ok(())
        }
        Command::Schema => {
            let all = serde_json::json!({
                "name": "fieldreq",
                "version": env!("CARGO_PKG_VERSION"),
                "subsystems": [
                    payer::schema(),
                    policy::schema(),
                    endpoints::schema(),
                    audit::schema(),
                    cache::schema(),
                    resolver::schema(),
                    validator::schema(),
                    crate::core::broker::schema(),
                ],
            });
            println!("{}", serde_json::to_string_pretty(&all).unwrap());
            Ok(())
        }
    }
}

fn rebuild_if_configured(
    store: &Store,
    cfg: &config::FieldreqConfig,
) -> Result<(), FieldreqError> {
    if cfg.cache.rebuild_on_write {
        let snapshot_cache = cache::EffectiveRequirementsCache::new();
        // Rebuild trouble leaves the invalidated table empty; resolve falls
        // back to live computation until the next successful rebuild.
        if let Err(e) = snapshot_cache.rebuild(store) {
            eprintln!("cache rebuild failed (will retry on next trigger): {}", e);
        }
    }
    Ok(())
}
