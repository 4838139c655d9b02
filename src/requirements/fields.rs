//! Typed field sets, rules, and policy change payloads.
//!
//! The source of record stores field lists as JSON arrays and rules as a JSON
//! object, but everything crosses into Rust as ordered sets and maps so merge
//! results are deterministic and unknown rule keys are rejected at write time
//! instead of surfacing as silent no-ops during validation.

use crate::core::error::FieldreqError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Unordered field list. BTreeSet keeps serialization deterministic.
pub type FieldSet = BTreeSet<String>;

/// Per-field validation rules, keyed by field name.
pub type RuleMap = BTreeMap<String, FieldRule>;

/// Validation rule attached to a single field.
///
/// All constraints are optional; an empty rule accepts any value.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FieldRule {
    /// Regex the whole value must match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Closed set of allowed values.
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl FieldRule {
    /// Reject rules that could never be satisfied or never compile.
    /// Called on every write path so bad rules cannot reach the resolver.
    pub fn check(&self, field: &str) -> Result<(), FieldreqError> {
        if let Some(pattern) = &self.pattern {
            regex::Regex::new(pattern).map_err(|e| {
                FieldreqError::ValidationError(format!(
                    "field '{}': invalid pattern: {}",
                    field, e
                ))
            })?;
        }
        if let Some(values) = &self.enum_values {
            if values.is_empty() {
                return Err(FieldreqError::ValidationError(format!(
                    "field '{}': enum rule with no allowed values",
                    field
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_length, self.max_length) {
            if min > max {
                return Err(FieldreqError::ValidationError(format!(
                    "field '{}': min_length {} exceeds max_length {}",
                    field, min, max
                )));
            }
        }
        Ok(())
    }
}

/// The attribute deltas carried by an org policy. Each attribute is
/// independent: a policy that names only `required_fields` leaves the other
/// attributes untouched regardless of policy type.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FieldChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_fields: Option<FieldSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optional_fields: Option<FieldSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_rules: Option<RuleMap>,
}

impl FieldChanges {
    pub fn is_empty(&self) -> bool {
        self.required_fields.is_none()
            && self.optional_fields.is_none()
            && self.field_rules.is_none()
    }

    pub fn check(&self) -> Result<(), FieldreqError> {
        if self.is_empty() {
            return Err(FieldreqError::ValidationError(
                "policy field_changes names no attributes".to_string(),
            ));
        }
        if let Some(rules) = &self.field_rules {
            for (field, rule) in rules {
                rule.check(field)?;
            }
        }
        Ok(())
    }
}

pub fn check_rules(rules: &RuleMap) -> Result<(), FieldreqError> {
    for (field, rule) in rules {
        rule.check(field)?;
    }
    Ok(())
}

pub fn encode_set(fields: &FieldSet) -> String {
    serde_json::to_string(fields).unwrap_or_else(|_| "[]".to_string())
}

pub fn decode_set(raw: &str) -> Result<FieldSet, FieldreqError> {
    serde_json::from_str(raw).map_err(FieldreqError::JsonError)
}

pub fn encode_rules(rules: &RuleMap) -> String {
    serde_json::to_string(rules).unwrap_or_else(|_| "{}".to_string())
}

pub fn decode_rules(raw: &str) -> Result<RuleMap, FieldreqError> {
    serde_json::from_str(raw).map_err(FieldreqError::JsonError)
}
