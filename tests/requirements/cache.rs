use fieldreq::core::db;
use fieldreq::core::store::Store;
use fieldreq::requirements::cache::{self, EffectiveRequirementsCache};
use fieldreq::requirements::endpoints;
use fieldreq::requirements::fields::{FieldChanges, FieldSet, RuleMap};
use fieldreq::requirements::payer::{self, NewPayerRequirement};
use fieldreq::requirements::policy::{self, NewOrgPolicy, PolicyType};
use fieldreq::requirements::resolver::{self, Source};
use std::sync::Arc;
use tempfile::tempdir;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    db::initialize_requirements_db(&store.root).unwrap();
    (tmp, store)
}

fn set(fields: &[&str]) -> FieldSet {
    fields.iter().map(|s| s.to_string()).collect()
}

fn seed(store: &Store) {
    endpoints::register(store, "admin", "ep-1", "acme", "bcbs-tx").unwrap();
    payer::create_version(
        store,
        "compliance",
        NewPayerRequirement {
            payer_id: "bcbs-tx".to_string(),
            task_type_id: "eligibility".to_string(),
            required_fields: set(&["member_id", "dob"]),
            optional_fields: set(&["group_number"]),
            field_rules: RuleMap::new(),
            compliance_ref: Some("CMS-270/271".to_string()),
            effective_date: "2024-01-01".to_string(),
        },
    )
    .unwrap();
    policy::create_policy(
        store,
        "admin",
        NewOrgPolicy {
            org_id: "acme".to_string(),
            task_type_id: "eligibility".to_string(),
            payer_id: None,
            policy_type: PolicyType::Add,
            field_changes: FieldChanges {
                required_fields: Some(set(&["ssn"])),
                ..FieldChanges::default()
            },
            reason: "audit".to_string(),
        },
    )
    .unwrap();
}

#[test]
fn test_rebuild_publishes_snapshot() {
    let (_tmp, store) = test_store();
    seed(&store);

    let snapshot_cache = EffectiveRequirementsCache::new();
    let summary = snapshot_cache.rebuild(&store).unwrap();
    assert_eq!(summary.endpoints, 1);
    assert_eq!(summary.task_types, 1);
    assert_eq!(summary.triples, 1);

    let status = cache::status(&store).unwrap();
    assert!(!status.stale);
    assert_eq!(status.rows, 1);
}

#[test]
fn test_snapshot_lookup_matches_live_resolution() {
    let (_tmp, store) = test_store();
    seed(&store);

    let snapshot_cache = EffectiveRequirementsCache::new();
    snapshot_cache.rebuild(&store).unwrap();

    let cached = snapshot_cache.lookup("acme", "bcbs-tx", "eligibility").unwrap();
    assert_eq!(cached.source, Source::Cache);

    let live = resolver::resolve(&store, "acme", "bcbs-tx", "eligibility", None).unwrap();
    assert_eq!(cached.required_fields, live.required_fields);
    assert_eq!(cached.optional_fields, live.optional_fields);
    assert_eq!(cached.field_rules, live.field_rules);
    assert_eq!(cached.fingerprint(), live.fingerprint());
}

#[test]
fn test_persisted_fast_path_and_fallback() {
    let (_tmp, store) = test_store();
    seed(&store);

    // Before any rebuild the persisted table is empty: computed live.
    let miss = cache::resolve_cached(&store, "acme", "bcbs-tx", "eligibility", None).unwrap();
    assert_eq!(miss.source, Source::Computed);

    EffectiveRequirementsCache::new().rebuild(&store).unwrap();
    let hit = cache::resolve_cached(&store, "acme", "bcbs-tx", "eligibility", None).unwrap();
    assert_eq!(hit.source, Source::Cache);
    assert_eq!(hit.required_fields, miss.required_fields);
}

#[test]
fn test_unknown_triple_falls_back_to_computed() {
    let (_tmp, store) = test_store();
    seed(&store);
    EffectiveRequirementsCache::new().rebuild(&store).unwrap();

    // No endpoint covers this org, so the snapshot has no row for it.
    let out = cache::resolve_cached(&store, "some-other-org", "bcbs-tx", "eligibility", None).unwrap();
    assert_eq!(out.source, Source::Computed);
}

#[test]
fn test_writes_invalidate_persisted_snapshot() {
    let (_tmp, store) = test_store();
    seed(&store);
    EffectiveRequirementsCache::new().rebuild(&store).unwrap();
    assert!(!cache::status(&store).unwrap().stale);

    // Any store write clears the persisted rows in its own transaction.
    policy::create_policy(
        &store,
        "admin",
        NewOrgPolicy {
            org_id: "acme".to_string(),
            task_type_id: "eligibility".to_string(),
            payer_id: Some("bcbs-tx".to_string()),
            policy_type: PolicyType::Remove,
            field_changes: FieldChanges {
                optional_fields: Some(set(&["group_number"])),
                ..FieldChanges::default()
            },
            reason: "portal dropped the field".to_string(),
        },
    )
    .unwrap();

    let status = cache::status(&store).unwrap();
    assert!(status.stale);

    // Stale cache never serves old data; the read degrades to live.
    let out = cache::resolve_cached(&store, "acme", "bcbs-tx", "eligibility", None).unwrap();
    assert_eq!(out.source, Source::Computed);
    assert!(!out.optional_fields.contains("group_number"));
}

// A long-lived cache instance must notice writes it was never told about.
#[test]
fn test_held_snapshot_not_served_after_write() {
    let (_tmp, store) = test_store();
    seed(&store);

    let snapshot_cache = EffectiveRequirementsCache::new();
    snapshot_cache.rebuild(&store).unwrap();
    let before = snapshot_cache
        .resolve(&store, "acme", "bcbs-tx", "eligibility", None)
        .unwrap();
    assert_eq!(before.source, Source::Cache);
    assert!(!before.required_fields.contains("npi"));

    // Write lands elsewhere; this instance never rebuilds.
    policy::create_policy(
        &store,
        "admin",
        NewOrgPolicy {
            org_id: "acme".to_string(),
            task_type_id: "eligibility".to_string(),
            payer_id: Some("bcbs-tx".to_string()),
            policy_type: PolicyType::Add,
            field_changes: FieldChanges {
                required_fields: Some(set(&["npi"])),
                ..FieldChanges::default()
            },
            reason: "portal now wants the provider NPI".to_string(),
        },
    )
    .unwrap();

    let after = snapshot_cache
        .resolve(&store, "acme", "bcbs-tx", "eligibility", None)
        .unwrap();
    assert_eq!(after.source, Source::Computed);
    assert!(after.required_fields.contains("npi"));

    // The next rebuild republishes and in-memory hits resume.
    snapshot_cache.rebuild(&store).unwrap();
    let rebuilt = snapshot_cache
        .resolve(&store, "acme", "bcbs-tx", "eligibility", None)
        .unwrap();
    assert_eq!(rebuilt.source, Source::Cache);
    assert!(rebuilt.required_fields.contains("npi"));
}

#[test]
fn test_generation_bumped_by_every_write_path() {
    let (_tmp, store) = test_store();
    let start = cache::generation(&store).unwrap();

    seed(&store);
    let after_seed = cache::generation(&store).unwrap();
    // Endpoint register, payer create, policy create: one bump each.
    assert_eq!(after_seed, start + 3);

    // Rebuilds publish without bumping; the snapshot stays fresh.
    EffectiveRequirementsCache::new().rebuild(&store).unwrap();
    assert_eq!(cache::generation(&store).unwrap(), after_seed);
}

#[test]
fn test_rebuild_after_write_reflects_change() {
    let (_tmp, store) = test_store();
    seed(&store);

    let snapshot_cache = EffectiveRequirementsCache::new();
    let before = snapshot_cache.rebuild(&store).unwrap();

    payer::create_version(
        &store,
        "compliance",
        NewPayerRequirement {
            payer_id: "bcbs-tx".to_string(),
            task_type_id: "eligibility".to_string(),
            required_fields: set(&["member_id", "dob", "npi"]),
            optional_fields: FieldSet::new(),
            field_rules: RuleMap::new(),
            compliance_ref: None,
            effective_date: "2024-06-01".to_string(),
        },
    )
    .unwrap();

    let after = snapshot_cache.rebuild(&store).unwrap();
    assert_ne!(before.fingerprint, after.fingerprint);

    let cached = snapshot_cache.lookup("acme", "bcbs-tx", "eligibility").unwrap();
    assert!(cached.required_fields.contains("npi"));
}

#[test]
fn test_fingerprint_stable_without_writes() {
    let (_tmp, store) = test_store();
    seed(&store);

    let snapshot_cache = EffectiveRequirementsCache::new();
    let first = snapshot_cache.rebuild(&store).unwrap();
    let second = snapshot_cache.rebuild(&store).unwrap();
    assert_eq!(first.fingerprint, second.fingerprint);
}

#[test]
fn test_historical_as_of_bypasses_cache() {
    let (_tmp, store) = test_store();
    seed(&store);
    let snapshot_cache = EffectiveRequirementsCache::new();
    snapshot_cache.rebuild(&store).unwrap();

    let out = snapshot_cache
        .resolve(&store, "acme", "bcbs-tx", "eligibility", Some("2024-02-01"))
        .unwrap();
    assert_eq!(out.source, Source::Computed);
}

#[test]
fn test_concurrent_rebuilds_are_serialized() {
    let (_tmp, store) = test_store();
    seed(&store);

    let snapshot_cache = Arc::new(EffectiveRequirementsCache::new());
    let mut handles = Vec::new();
    for _ in 0..4 {
        let c = Arc::clone(&snapshot_cache);
        let s = store.clone();
        handles.push(std::thread::spawn(move || c.rebuild(&s).unwrap()));
    }
    let summaries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    // Same inputs, same published content, no torn snapshots.
    for s in &summaries {
        assert_eq!(s.fingerprint, summaries[0].fingerprint);
        assert_eq!(s.triples, 1);
    }
    assert!(snapshot_cache.lookup("acme", "bcbs-tx", "eligibility").is_some());
}

#[test]
fn test_multiple_endpoints_share_triple() {
    let (_tmp, store) = test_store();
    seed(&store);
    endpoints::register(&store, "admin", "ep-2", "acme", "bcbs-tx").unwrap();

    let summary = EffectiveRequirementsCache::new().rebuild(&store).unwrap();
    assert_eq!(summary.endpoints, 2);
    // One resolution serves both endpoints.
    assert_eq!(summary.triples, 1);
    assert_eq!(cache::status(&store).unwrap().rows, 2);
}
