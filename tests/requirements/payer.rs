use fieldreq::core::db;
use fieldreq::core::error::FieldreqError;
use fieldreq::core::store::Store;
use fieldreq::requirements::fields::{FieldRule, RuleMap};
use fieldreq::requirements::payer::{self, NewPayerRequirement};
use tempfile::tempdir;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    db::initialize_requirements_db(&store.root).unwrap();
    (tmp, store)
}

fn base_requirement(effective_date: &str) -> NewPayerRequirement {
    NewPayerRequirement {
        payer_id: "bcbs-tx".to_string(),
        task_type_id: "eligibility".to_string(),
        required_fields: ["member_id", "dob"].iter().map(|s| s.to_string()).collect(),
        optional_fields: ["group_number"].iter().map(|s| s.to_string()).collect(),
        field_rules: RuleMap::new(),
        compliance_ref: Some("CMS-270/271".to_string()),
        effective_date: effective_date.to_string(),
    }
}

#[test]
fn test_versions_allocate_forward() {
    let (_tmp, store) = test_store();

    let v1 = payer::create_version(&store, "compliance", base_requirement("2024-01-01")).unwrap();
    let v2 = payer::create_version(&store, "compliance", base_requirement("2024-06-01")).unwrap();

    assert_eq!(v1.version, 1);
    assert_eq!(v2.version, 2);
    assert_ne!(v1.requirement_id, v2.requirement_id);

    let versions = payer::list_versions(&store, "bcbs-tx", "eligibility").unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].version, 1);
    assert_eq!(versions[1].version, 2);
}

#[test]
fn test_get_active_picks_highest_effective_version() {
    let (_tmp, store) = test_store();

    payer::create_version(&store, "compliance", base_requirement("2024-01-01")).unwrap();
    payer::create_version(&store, "compliance", base_requirement("2024-06-01")).unwrap();

    let active = payer::get_active(&store, "bcbs-tx", "eligibility", "2024-12-31").unwrap();
    assert_eq!(active.version, 2);

    // Between the effective dates, only v1 is live.
    let active = payer::get_active(&store, "bcbs-tx", "eligibility", "2024-03-01").unwrap();
    assert_eq!(active.version, 1);
}

#[test]
fn test_future_dated_version_is_not_active() {
    let (_tmp, store) = test_store();

    payer::create_version(&store, "compliance", base_requirement("2024-01-01")).unwrap();
    payer::create_version(&store, "compliance", base_requirement("2099-01-01")).unwrap();

    let active = payer::get_active(&store, "bcbs-tx", "eligibility", "2025-01-01").unwrap();
    assert_eq!(active.version, 1);
}

#[test]
fn test_get_active_not_found() {
    let (_tmp, store) = test_store();

    let err = payer::get_active(&store, "bcbs-tx", "eligibility", "2025-01-01").unwrap_err();
    assert!(matches!(err, FieldreqError::NotFound(_)));

    // A version exists but only in the future.
    payer::create_version(&store, "compliance", base_requirement("2099-01-01")).unwrap();
    let err = payer::get_active(&store, "bcbs-tx", "eligibility", "2025-01-01").unwrap_err();
    assert!(matches!(err, FieldreqError::NotFound(_)));
}

#[test]
fn test_keys_are_independent() {
    let (_tmp, store) = test_store();

    payer::create_version(&store, "compliance", base_requirement("2024-01-01")).unwrap();

    let mut other = base_requirement("2024-01-01");
    other.task_type_id = "claim_status".to_string();
    let row = payer::create_version(&store, "compliance", other).unwrap();
    // Fresh key starts back at version 1.
    assert_eq!(row.version, 1);
}

#[test]
fn test_rejects_bad_effective_date() {
    let (_tmp, store) = test_store();
    let err =
        payer::create_version(&store, "compliance", base_requirement("Jan 1 2024")).unwrap_err();
    assert!(matches!(err, FieldreqError::ValidationError(_)));
}

#[test]
fn test_rejects_uncompilable_rule_at_write_time() {
    let (_tmp, store) = test_store();
    let mut new = base_requirement("2024-01-01");
    new.field_rules.insert(
        "member_id".to_string(),
        FieldRule {
            pattern: Some("[A-Z".to_string()),
            ..FieldRule::default()
        },
    );
    let err = payer::create_version(&store, "compliance", new).unwrap_err();
    assert!(matches!(err, FieldreqError::ValidationError(_)));
}

#[test]
fn test_rejects_empty_key() {
    let (_tmp, store) = test_store();
    let mut new = base_requirement("2024-01-01");
    new.payer_id = String::new();
    assert!(payer::create_version(&store, "compliance", new).is_err());
}

#[test]
fn test_created_rows_are_immutable_snapshots() {
    let (_tmp, store) = test_store();

    let created = payer::create_version(&store, "compliance", base_requirement("2024-01-01")).unwrap();
    let fetched = payer::get_active(&store, "bcbs-tx", "eligibility", "2025-01-01").unwrap();
    assert_eq!(created, fetched);
    assert_eq!(fetched.created_by, "compliance");
    assert_eq!(fetched.compliance_ref.as_deref(), Some("CMS-270/271"));
}
