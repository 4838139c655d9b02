use fieldreq::core::db;
use fieldreq::core::store::Store;
use fieldreq::requirements::fields::{FieldChanges, FieldRule, FieldSet, RuleMap};
use fieldreq::requirements::payer::{self, NewPayerRequirement};
use fieldreq::requirements::policy::{self, NewOrgPolicy, PolicyType};
use fieldreq::requirements::validator;
use serde_json::{Map, Value, json};
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

fn payload(value: Value) -> Map<String, Value> {
    value.as_object().unwrap().clone()
}

fn seed(store: &Store) {
    let mut rules = RuleMap::new();
    rules.insert(
        "ssn".to_string(),
        FieldRule {
            pattern: Some(r"\d{9}".to_string()),
            ..FieldRule::default()
        },
    );
    rules.insert(
        "plan_type".to_string(),
        FieldRule {
            enum_values: Some(vec!["HMO".to_string(), "PPO".to_string()]),
            ..FieldRule::default()
        },
    );
    payer::create_version(
        store,
        "compliance",
        NewPayerRequirement {
            payer_id: "bcbs-tx".to_string(),
            task_type_id: "eligibility".to_string(),
            required_fields: set(&["member_id", "dob"]),
            optional_fields: set(&["plan_type"]),
            field_rules: rules,
            compliance_ref: None,
            effective_date: "2024-01-01".to_string(),
        },
    )
    .unwrap();
}

// Submitted data missing a required field comes back reportable, not as an error.
#[test]
fn test_missing_required_field_end_to_end() {
    let (_tmp, store) = test_store();
    seed(&store);

    let result = validator::validate_submission(
        &store,
        "acme",
        "bcbs-tx",
        "eligibility",
        &payload(json!({"member_id": "A123"})),
    )
    .unwrap();

    assert!(!result.is_valid);
    assert_eq!(result.missing_required, vec!["dob"]);
    assert!(result.rule_violations.is_empty());
}

#[test]
fn test_valid_submission_end_to_end() {
    let (_tmp, store) = test_store();
    seed(&store);

    let result = validator::validate_submission(
        &store,
        "acme",
        "bcbs-tx",
        "eligibility",
        &payload(json!({"member_id": "A123", "dob": "1980-01-01", "plan_type": "PPO"})),
    )
    .unwrap();

    assert!(result.is_valid);
    assert!(result.missing_required.is_empty());
    assert!(result.extra_fields.is_empty());
}

#[test]
fn test_policy_added_field_is_enforced() {
    let (_tmp, store) = test_store();
    seed(&store);
    policy::create_policy(
        &store,
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

    let missing = validator::validate_submission(
        &store,
        "acme",
        "bcbs-tx",
        "eligibility",
        &payload(json!({"member_id": "A123", "dob": "1980-01-01"})),
    )
    .unwrap();
    assert!(!missing.is_valid);
    assert_eq!(missing.missing_required, vec!["ssn"]);

    // Rule attached to the added field is evaluated when it is present.
    let bad_format = validator::validate_submission(
        &store,
        "acme",
        "bcbs-tx",
        "eligibility",
        &payload(json!({"member_id": "A123", "dob": "1980-01-01", "ssn": "12-34"})),
    )
    .unwrap();
    assert!(!bad_format.is_valid);
    assert_eq!(bad_format.rule_violations[0].field, "ssn");
}

#[test]
fn test_rule_violation_reported_with_field() {
    let (_tmp, store) = test_store();
    seed(&store);

    let result = validator::validate_submission(
        &store,
        "acme",
        "bcbs-tx",
        "eligibility",
        &payload(json!({"member_id": "A123", "dob": "1980-01-01", "plan_type": "EPO"})),
    )
    .unwrap();

    assert!(!result.is_valid);
    assert_eq!(result.rule_violations.len(), 1);
    assert_eq!(result.rule_violations[0].field, "plan_type");
    assert!(result.rule_violations[0].reason.contains("HMO"));
}

#[test]
fn test_extra_fields_reported_but_valid() {
    let (_tmp, store) = test_store();
    seed(&store);

    let result = validator::validate_submission(
        &store,
        "acme",
        "bcbs-tx",
        "eligibility",
        &payload(json!({"member_id": "A123", "dob": "1980-01-01", "fax": "555-0100"})),
    )
    .unwrap();

    assert!(result.is_valid);
    assert_eq!(result.extra_fields, vec!["fax"]);
}

#[test]
fn test_empty_requirements_accept_anything() {
    let (_tmp, store) = test_store();
    // No base, no policy: nothing required, everything extra but valid.
    let result = validator::validate_submission(
        &store,
        "acme",
        "unknown-payer",
        "eligibility",
        &payload(json!({"whatever": 1})),
    )
    .unwrap();
    assert!(result.is_valid);
    assert_eq!(result.extra_fields, vec!["whatever"]);
}
