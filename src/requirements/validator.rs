//! Payload validation against a resolved requirement set.
//!
//! Invalid submitted data is an expected, reportable outcome: `validate`
//! always returns a result object for it. The only error path is a malformed
//! requirement (a rule pattern that does not compile), which is a programmer
//! error in the stored data, not a property of the payload.

use crate::core::error::FieldreqError;
use crate::core::store::Store;
use crate::requirements::cache;
use crate::requirements::fields::FieldRule;
use crate::requirements::resolver::EffectiveRequirement;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleViolation {
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub missing_required: Vec<String>,
    pub rule_violations: Vec<RuleViolation>,
    /// Fields present in the payload but in neither required nor optional.
    /// Advisory: extra fields never fail validation.
    pub extra_fields: Vec<String>,
}

/// Check a submitted payload against a resolved requirement set.
///
/// A required field that is absent or JSON null is missing. Any present field
/// with a rule entry is checked against each constraint in the rule, nulls
/// included: a null fails enum membership but skips the string-shape
/// constraints. A field with no rule entry is accepted as-is.
pub fn validate(
    requirement: &EffectiveRequirement,
    submitted: &Map<String, Value>,
) -> Result<ValidationResult, FieldreqError> {
    let mut missing_required = Vec::new();
    let mut rule_violations = Vec::new();
    let mut extra_fields = Vec::new();

    for field in &requirement.required_fields {
        match submitted.get(field) {
            None | Some(Value::Null) => missing_required.push(field.clone()),
            Some(_) => {}
        }
    }

    for field in submitted.keys() {
        if !requirement.required_fields.contains(field)
            && !requirement.optional_fields.contains(field)
        {
            extra_fields.push(field.clone());
        }
    }

    for (field, rule) in &requirement.field_rules {
        if let Some(value) = submitted.get(field) {
            check_rule(field, value, rule, &mut rule_violations)?;
        }
    }

    Ok(ValidationResult {
        is_valid: missing_required.is_empty() && rule_violations.is_empty(),
        missing_required,
        rule_violations,
        extra_fields,
    })
}

/// Resolve then validate in one call, using the snapshot fast path.
pub fn validate_submission(
    store: &Store,
    org_id: &str,
    payer_id: &str,
    task_type_id: &str,
    submitted: &Map<String, Value>,
) -> Result<ValidationResult, FieldreqError> {
    let requirement = cache::resolve_cached(store, org_id, payer_id, task_type_id, None)?;
    validate(&requirement, submitted)
}

/// Null values fail enum membership but are exempt from the string-shape
/// constraints (pattern, min/max length); for a required field the null is
/// already reported as missing.
fn check_rule(
    field: &str,
    value: &Value,
    rule: &FieldRule,
    violations: &mut Vec<RuleViolation>,
) -> Result<(), FieldreqError> {
    let text = value.as_str();
    let is_null = value.is_null();

    if let Some(pattern) = &rule.pattern {
        if !is_null {
            // Rules are checked at write time, so a non-compiling pattern
            // here means corrupted stored data.
            let re = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                FieldreqError::ValidationError(format!(
                    "field '{}': stored pattern does not compile: {}",
                    field, e
                ))
            })?;
            match text {
                Some(s) if re.is_match(s) => {}
                _ => violations.push(RuleViolation {
                    field: field.to_string(),
                    reason: format!("does not match required pattern {}", pattern),
                }),
            }
        }
    }

    if let Some(allowed) = &rule.enum_values {
        let ok = matches!(text, Some(s) if allowed.iter().any(|a| a == s));
        if !ok {
            violations.push(RuleViolation {
                field: field.to_string(),
                reason: format!("must be one of {:?}", allowed),
            });
        }
    }

    if let Some(min) = rule.min_length {
        match text {
            Some(s) if s.chars().count() >= min => {}
            _ if is_null => {}
            _ => violations.push(RuleViolation {
                field: field.to_string(),
                reason: format!("must be at least {} characters", min),
            }),
        }
    }

    if let Some(max) = rule.max_length {
        if let Some(s) = text {
            if s.chars().count() > max {
                violations.push(RuleViolation {
                    field: field.to_string(),
                    reason: format!("must be at most {} characters", max),
                });
            }
        }
    }

    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "validate",
        "version": "0.1.0",
        "description": "Check a submitted payload against resolved field requirements",
        "commands": [
            { "name": "validate", "parameters": ["org_id", "payer_id", "task_type_id", "payload", "format"] }
        ],
        "storage": []
    })
}
