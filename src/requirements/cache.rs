//! Effective-requirements snapshot cache.
//!
//! The system of record refreshed a database materialized view from triggers.
//! Here the cache is an explicit snapshot with visible mechanics: one rebuild
//! at a time (mutex), full recompute over every (endpoint, org, task type)
//! triple, and an atomic publish. In-process readers see an `Arc` swap; the
//! persisted `effective_requirements` table is replaced inside a single
//! transaction so out-of-process readers see the old rows or the new rows,
//! never a mix. Write paths clear the persisted rows and bump the one-row
//! `cache_meta` generation counter in their own mutation transaction. The
//! in-memory snapshot records the generation it was computed against and
//! `resolve` only serves a hit while the two still match, which is what keeps
//! the cache consistent with the stores: a committed write and a snapshot of
//! stale data cannot coexist on any read path.
//!
//! Rebuild failures leave the previous snapshot untouched and are recorded in
//! `cache.events.jsonl`; resolve callers fall back to live computation and
//! never observe them.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::FieldreqError;
use crate::core::store::Store;
use crate::core::time;
use crate::requirements::fields;
use crate::requirements::payer;
use crate::requirements::policy;
use crate::requirements::resolver::{self, EffectiveRequirement, Source};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use rusqlite::{Connection, TransactionBehavior, params};
use rustc_hash::FxHashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

/// (org_id, payer_id, task_type_id)
pub type TripleKey = (String, String, String);

#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Endpoints sharing this (org, payer) association.
    pub endpoint_ids: Vec<String>,
    pub requirement: EffectiveRequirement,
}

#[derive(Debug, Default)]
struct Snapshot {
    entries: FxHashMap<TripleKey, CacheEntry>,
    computed_at: String,
    fingerprint: String,
    /// `cache_meta` generation this snapshot was computed against.
    generation: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildSummary {
    pub triples: usize,
    pub endpoints: usize,
    pub task_types: usize,
    pub fingerprint: String,
    pub computed_at: String,
}

/// In-process snapshot holder. A fresh instance starts empty and serves
/// nothing until the first `rebuild`; lookups then fall through to the
/// persisted table or a live computation.
pub struct EffectiveRequirementsCache {
    snapshot: RwLock<Arc<Snapshot>>,
    rebuild_lock: Mutex<()>,
}

impl Default for EffectiveRequirementsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectiveRequirementsCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Full recompute and atomic publish. Serialized: a second caller blocks
    /// until the first finishes, then recomputes again. Readers are never
    /// blocked; they keep the previous snapshot until the swap.
    pub fn rebuild(&self, store: &Store) -> Result<RebuildSummary, FieldreqError> {
        let _guard = self.rebuild_lock.lock().unwrap();

        let result = compute_snapshot(store);
        match result {
            Ok((snapshot, summary)) => {
                persist_snapshot(store, &snapshot)?;
                *self.snapshot.write().unwrap() = Arc::new(snapshot);
                log_cache_event(&store.root, "rebuild", "success", Some(&summary));
                Ok(summary)
            }
            Err(e) => {
                log_cache_event(&store.root, "rebuild", "error", None);
                Err(e)
            }
        }
    }

    /// Raw snapshot lookup. `None` on miss; never an error. No staleness
    /// check: `resolve` is the generation-checked read path.
    pub fn lookup(
        &self,
        org_id: &str,
        payer_id: &str,
        task_type_id: &str,
    ) -> Option<EffectiveRequirement> {
        let snapshot = self.snapshot.read().unwrap().clone();
        let key = (
            org_id.to_string(),
            payer_id.to_string(),
            task_type_id.to_string(),
        );
        snapshot.entries.get(&key).map(|entry| {
            let mut req = entry.requirement.clone();
            req.source = Source::Cache;
            req
        })
    }

    /// Read path: in-memory snapshot, then the persisted table, then a live
    /// computation. An explicit historical `as_of` bypasses the cache, which
    /// is always computed as of today.
    pub fn resolve(
        &self,
        store: &Store,
        org_id: &str,
        payer_id: &str,
        task_type_id: &str,
        as_of: Option<&str>,
    ) -> Result<EffectiveRequirement, FieldreqError> {
        if let Some(date) = as_of {
            if date != time::today_utc() {
                return resolver::resolve(store, org_id, payer_id, task_type_id, as_of);
            }
        }
        let snapshot = self.snapshot.read().unwrap().clone();
        let key = (
            org_id.to_string(),
            payer_id.to_string(),
            task_type_id.to_string(),
        );
        if let Some(entry) = snapshot.entries.get(&key) {
            // Any store write since this snapshot was computed bumped the
            // generation; a stale entry is skipped and the read degrades.
            if generation(store)? == snapshot.generation {
                let mut req = entry.requirement.clone();
                req.source = Source::Cache;
                return Ok(req);
            }
        }
        resolve_cached(store, org_id, payer_id, task_type_id, as_of)
    }

    pub fn fingerprint(&self) -> Option<String> {
        let snapshot = self.snapshot.read().unwrap();
        if snapshot.fingerprint.is_empty() {
            None
        } else {
            Some(snapshot.fingerprint.clone())
        }
    }
}

/// Persisted-table fast path with live fallback. Cache trouble of any kind
/// degrades to a computed resolution instead of an error.
pub fn resolve_cached(
    store: &Store,
    org_id: &str,
    payer_id: &str,
    task_type_id: &str,
    as_of: Option<&str>,
) -> Result<EffectiveRequirement, FieldreqError> {
    let bypass = match as_of {
        Some(date) => date != time::today_utc(),
        None => false,
    };
    if !bypass {
        if let Ok(Some(hit)) = lookup_persisted(store, org_id, payer_id, task_type_id) {
            return Ok(hit);
        }
    }
    resolver::resolve(store, org_id, payer_id, task_type_id, as_of)
}

/// One row from the persisted snapshot, if present.
pub fn lookup_persisted(
    store: &Store,
    org_id: &str,
    payer_id: &str,
    task_type_id: &str,
) -> Result<Option<EffectiveRequirement>, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, "fieldreq", None, "cache.lookup", |conn| {
        let mut stmt = conn.prepare(
            "SELECT required_fields, optional_fields, field_rules, compliance_ref, computed_at
             FROM effective_requirements
             WHERE org_id = ?1 AND payer_id = ?2 AND task_type_id = ?3
             LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![org_id, payer_id, task_type_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        match rows.next() {
            Some(raw) => {
                let (required, optional, rules, compliance_ref, computed_at) = raw?;
                Ok(Some(EffectiveRequirement {
                    org_id: org_id.to_string(),
                    payer_id: payer_id.to_string(),
                    task_type_id: task_type_id.to_string(),
                    required_fields: fields::decode_set(&required)?,
                    optional_fields: fields::decode_set(&optional)?,
                    field_rules: fields::decode_rules(&rules)?,
                    compliance_ref,
                    source: Source::Cache,
                    computed_at,
                }))
            }
            None => Ok(None),
        }
    })
}

/// Drop the persisted snapshot and bump the write generation, both on the
/// caller's open mutation transaction. Called by every store write path so a
/// committed mutation can never leave stale cache rows behind, and so held
/// in-memory snapshots can detect that they predate the write.
pub(crate) fn invalidate_in_tx(conn: &Connection) -> Result<(), FieldreqError> {
    conn.execute("DELETE FROM effective_requirements", [])?;
    conn.execute(
        "UPDATE cache_meta SET generation = generation + 1 WHERE id = 1",
        [],
    )?;
    Ok(())
}

/// Current write generation. Bumped by every mutation transaction.
pub fn generation(store: &Store) -> Result<i64, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);
    broker.with_conn(&db_path, "fieldreq", None, "cache.generation", |conn| {
        generation_in_conn(conn)
    })
}

fn generation_in_conn(conn: &Connection) -> Result<i64, FieldreqError> {
    match conn.query_row("SELECT generation FROM cache_meta WHERE id = 1", [], |row| {
        row.get(0)
    }) {
        Ok(g) => Ok(g),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(FieldreqError::RusqliteError(e)),
    }
}

fn compute_snapshot(store: &Store) -> Result<(Snapshot, RebuildSummary), FieldreqError> {
    // Generation is read before the stores: a write that lands mid-rebuild
    // bumps past it and the published snapshot is treated as stale.
    let generation = generation(store)?;
    let endpoints = crate::requirements::endpoints::list(store)?;
    let requirements = payer::load_all(store)?;
    let policies = policy::load_active(store)?;
    let as_of = time::today_utc();

    // Task types are whatever the stores know about; the catalog itself is
    // an external collaborator.
    let mut task_types: BTreeSet<&str> = BTreeSet::new();
    for req in &requirements {
        task_types.insert(&req.task_type_id);
    }
    for pol in &policies {
        task_types.insert(&pol.task_type_id);
    }

    // Endpoints sharing an (org, payer) association resolve identically, so
    // group them per triple before resolving.
    let mut triples: BTreeMap<TripleKey, Vec<String>> = BTreeMap::new();
    for ep in &endpoints {
        for task in &task_types {
            let key = (
                ep.org_id.clone(),
                ep.payer_id.clone(),
                (*task).to_string(),
            );
            triples
                .entry(key)
                .or_default()
                .push(ep.endpoint_id.clone());
        }
    }

    let work: Vec<(TripleKey, Vec<String>)> = triples.into_iter().collect();
    let resolved: Vec<(TripleKey, CacheEntry)> = work
        .into_par_iter()
        .map(|((org_id, payer_id, task_type_id), endpoint_ids)| {
            let versions: Vec<&payer::PayerRequirement> = requirements
                .iter()
                .filter(|r| r.payer_id == payer_id && r.task_type_id == task_type_id)
                .collect();
            let base = resolver::select_active(versions, &as_of);
            let candidates: Vec<policy::OrgPolicy> = policies
                .iter()
                .filter(|p| {
                    p.org_id == org_id
                        && p.task_type_id == task_type_id
                        && (p.payer_id.is_none() || p.payer_id.as_deref() == Some(payer_id.as_str()))
                })
                .cloned()
                .collect();
            let requirement =
                resolver::resolve_from(base, &candidates, &org_id, &payer_id, &task_type_id);
            (
                (org_id, payer_id, task_type_id),
                CacheEntry {
                    endpoint_ids,
                    requirement,
                },
            )
        })
        .collect();

    // Snapshot fingerprint: per-entry content fingerprints in key order.
    let mut hasher = Sha256::new();
    let mut sorted: Vec<&(TripleKey, CacheEntry)> = resolved.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (key, entry) in &sorted {
        hasher.update(format!("{}/{}/{}:", key.0, key.1, key.2));
        hasher.update(entry.requirement.fingerprint());
    }
    let fingerprint = format!("{:x}", hasher.finalize());

    let computed_at = time::now_epoch_z();
    let summary = RebuildSummary {
        triples: resolved.len(),
        endpoints: endpoints.len(),
        task_types: task_types.len(),
        fingerprint: fingerprint.clone(),
        computed_at: computed_at.clone(),
    };

    let mut entries = FxHashMap::default();
    for (key, entry) in resolved {
        entries.insert(key, entry);
    }

    Ok((
        Snapshot {
            entries,
            computed_at,
            fingerprint,
            generation,
        },
        summary,
    ))
}

/// Replace the persisted rows in one transaction: out-of-process readers see
/// the previous snapshot until the commit, never a partial one.
fn persist_snapshot(store: &Store, snapshot: &Snapshot) -> Result<(), FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, "fieldreq", None, "cache.publish", |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM effective_requirements", [])?;
        for ((org_id, payer_id, task_type_id), entry) in &snapshot.entries {
            for endpoint_id in &entry.endpoint_ids {
                tx.execute(
                    "INSERT INTO effective_requirements(endpoint_id, org_id, payer_id,
                        task_type_id, required_fields, optional_fields, field_rules,
                        compliance_ref, computed_at)
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        endpoint_id,
                        org_id,
                        payer_id,
                        task_type_id,
                        fields::encode_set(&entry.requirement.required_fields),
                        fields::encode_set(&entry.requirement.optional_fields),
                        fields::encode_rules(&entry.requirement.field_rules),
                        entry.requirement.compliance_ref,
                        snapshot.computed_at,
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    })
}

/// Persisted snapshot status for the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub rows: usize,
    pub computed_at: Option<String>,
    pub stale: bool,
}

pub fn status(store: &Store) -> Result<CacheStatus, FieldreqError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::requirements_db_path(&store.root);

    broker.with_conn(&db_path, "fieldreq", None, "cache.status", |conn| {
        let rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM effective_requirements", [], |row| {
                row.get(0)
            })?;
        let computed_at: Option<String> = conn
            .query_row(
                "SELECT computed_at FROM effective_requirements LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();
        Ok(CacheStatus {
            rows: rows as usize,
            computed_at,
            stale: rows == 0,
        })
    })
}

fn log_cache_event(root: &Path, op: &str, status: &str, summary: Option<&RebuildSummary>) {
    use std::fs::OpenOptions;
    use std::io::Write;

    let ev = serde_json::json!({
        "ts": time::now_epoch_z(),
        "event_id": time::new_event_id(),
        "op": op,
        "status": status,
        "summary": summary,
    });
    // Telemetry only. A failed append must not fail the rebuild.
    if let Ok(mut f) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(root.join("cache.events.jsonl"))
    {
        let _ = writeln!(f, "{}", ev);
    }
}

#[derive(Parser, Debug)]
#[clap(name = "cache", about = "Manage the effective-requirements snapshot")]
pub struct CacheCli {
    #[clap(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Full recompute and atomic publish of the snapshot.
    Rebuild,
    /// Show persisted snapshot status.
    Status {
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
}

pub fn run_cache_cli(store: &Store, cli: CacheCli) -> Result<(), FieldreqError> {
    db::initialize_requirements_db(&store.root)?;
    match cli.command {
        CacheCommand::Rebuild => {
            let cache = EffectiveRequirementsCache::new();
            let summary = cache.rebuild(store)?;
            println!(
                "Snapshot published: {} triples across {} endpoints and {} task types",
                summary.triples, summary.endpoints, summary.task_types
            );
            println!("Fingerprint: {}", summary.fingerprint);
        }
        CacheCommand::Status { format } => {
            let s = status(store)?;
            if format == "json" {
                let envelope = time::command_envelope(
                    "cache.status",
                    "ok",
                    serde_json::to_value(&s).unwrap_or_default(),
                );
                println!("{}", serde_json::to_string_pretty(&envelope).unwrap());
            } else if s.stale {
                println!("Snapshot empty or invalidated (resolve falls back to live computation)");
            } else {
                println!(
                    "Snapshot: {} rows, computed at {}",
                    s.rows,
                    s.computed_at.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "cache",
        "version": "0.1.0",
        "description": "Rebuildable effective-requirements snapshot with atomic publish",
        "commands": [
            { "name": "rebuild", "parameters": [] },
            { "name": "status", "parameters": ["format"] }
        ],
        "storage": ["requirements.db#effective_requirements", "cache.events.jsonl"]
    })
}
