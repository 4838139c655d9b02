use fieldreq::core::db;
use fieldreq::core::error::FieldreqError;
use fieldreq::core::store::Store;
use fieldreq::requirements::fields::FieldChanges;
use fieldreq::requirements::policy::{self, NewOrgPolicy, PolicyType};
use tempfile::tempdir;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    db::initialize_requirements_db(&store.root).unwrap();
    (tmp, store)
}

fn add_ssn_policy(payer_id: Option<&str>) -> NewOrgPolicy {
    NewOrgPolicy {
        org_id: "acme".to_string(),
        task_type_id: "eligibility".to_string(),
        payer_id: payer_id.map(String::from),
        policy_type: PolicyType::Add,
        field_changes: FieldChanges {
            required_fields: Some(["ssn".to_string()].into_iter().collect()),
            ..FieldChanges::default()
        },
        reason: "state audit finding".to_string(),
    }
}

#[test]
fn test_policy_lifecycle() {
    let (_tmp, store) = test_store();

    let created = policy::create_policy(&store, "admin", add_ssn_policy(None)).unwrap();
    assert!(created.active);
    assert!(created.approved_by.is_none());
    assert_eq!(created.version, 1);

    let approved = policy::approve(&store, &created.policy_id, "medical-director").unwrap();
    assert_eq!(approved.approved_by.as_deref(), Some("medical-director"));
    assert!(approved.approved_at.is_some());
    assert!(approved.active);

    let retired = policy::deactivate(&store, &created.policy_id, "admin").unwrap();
    assert!(!retired.active);
    // Approval metadata survives deactivation.
    assert_eq!(retired.approved_by.as_deref(), Some("medical-director"));
}

#[test]
fn test_double_approval_rejected() {
    let (_tmp, store) = test_store();
    let created = policy::create_policy(&store, "admin", add_ssn_policy(None)).unwrap();
    policy::approve(&store, &created.policy_id, "approver-1").unwrap();
    let err = policy::approve(&store, &created.policy_id, "approver-2").unwrap_err();
    assert!(matches!(err, FieldreqError::ValidationError(_)));
}

#[test]
fn test_double_deactivation_rejected() {
    let (_tmp, store) = test_store();
    let created = policy::create_policy(&store, "admin", add_ssn_policy(None)).unwrap();
    policy::deactivate(&store, &created.policy_id, "admin").unwrap();
    let err = policy::deactivate(&store, &created.policy_id, "admin").unwrap_err();
    assert!(matches!(err, FieldreqError::ValidationError(_)));
}

#[test]
fn test_unknown_policy_id_not_found() {
    let (_tmp, store) = test_store();
    let err = policy::approve(&store, "no-such-policy", "approver").unwrap_err();
    assert!(matches!(err, FieldreqError::NotFound(_)));
}

#[test]
fn test_versions_count_per_scope() {
    let (_tmp, store) = test_store();

    let org_wide_1 = policy::create_policy(&store, "admin", add_ssn_policy(None)).unwrap();
    let org_wide_2 = policy::create_policy(&store, "admin", add_ssn_policy(None)).unwrap();
    let scoped = policy::create_policy(&store, "admin", add_ssn_policy(Some("bcbs-tx"))).unwrap();

    assert_eq!(org_wide_1.version, 1);
    assert_eq!(org_wide_2.version, 2);
    // Different scope, independent version sequence.
    assert_eq!(scoped.version, 1);
}

#[test]
fn test_find_applicable_scope_matching() {
    let (_tmp, store) = test_store();

    let org_wide = policy::create_policy(&store, "admin", add_ssn_policy(None)).unwrap();
    let matching = policy::create_policy(&store, "admin", add_ssn_policy(Some("bcbs-tx"))).unwrap();
    let other_payer = policy::create_policy(&store, "admin", add_ssn_policy(Some("aetna"))).unwrap();

    let mut other_org = add_ssn_policy(None);
    other_org.org_id = "rival-health".to_string();
    policy::create_policy(&store, "admin", other_org).unwrap();

    let mut other_task = add_ssn_policy(None);
    other_task.task_type_id = "claim_status".to_string();
    policy::create_policy(&store, "admin", other_task).unwrap();

    let found = policy::find_applicable(&store, "acme", "eligibility", "bcbs-tx").unwrap();
    let ids: Vec<&str> = found.iter().map(|p| p.policy_id.as_str()).collect();
    assert_eq!(found.len(), 2);
    assert!(ids.contains(&org_wide.policy_id.as_str()));
    assert!(ids.contains(&matching.policy_id.as_str()));
    assert!(!ids.contains(&other_payer.policy_id.as_str()));
}

#[test]
fn test_find_applicable_excludes_inactive() {
    let (_tmp, store) = test_store();

    let created = policy::create_policy(&store, "admin", add_ssn_policy(None)).unwrap();
    assert_eq!(
        policy::find_applicable(&store, "acme", "eligibility", "bcbs-tx")
            .unwrap()
            .len(),
        1
    );

    policy::deactivate(&store, &created.policy_id, "admin").unwrap();
    assert!(
        policy::find_applicable(&store, "acme", "eligibility", "bcbs-tx")
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_unapproved_policy_still_applicable() {
    let (_tmp, store) = test_store();
    policy::create_policy(&store, "admin", add_ssn_policy(None)).unwrap();
    // Approval is advisory metadata only.
    let found = policy::find_applicable(&store, "acme", "eligibility", "bcbs-tx").unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].approved_by.is_none());
}

#[test]
fn test_create_rejects_empty_changes() {
    let (_tmp, store) = test_store();
    let mut new = add_ssn_policy(None);
    new.field_changes = FieldChanges::default();
    let err = policy::create_policy(&store, "admin", new).unwrap_err();
    assert!(matches!(err, FieldreqError::ValidationError(_)));
}

#[test]
fn test_create_rejects_missing_reason() {
    let (_tmp, store) = test_store();
    let mut new = add_ssn_policy(None);
    new.reason = String::new();
    assert!(policy::create_policy(&store, "admin", new).is_err());
}
