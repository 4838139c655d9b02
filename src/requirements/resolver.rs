//! Effective requirement resolution: payer base merged with one org policy.
//!
//! The merge itself is pure. `resolve` fetches the active base and the
//! applicable policies, picks at most one policy by precedence, and applies
//! it independently per attribute. Precedence is deliberate and narrow:
//! a payer-scoped policy beats an org-wide one, and within the same scope the
//! highest version wins. Multiple active policies never compose; a second
//! policy that was meant to stack with the first is silently shadowed. This
//! mirrors the behavior of the system of record and is covered by tests, but
//! it is a known limitation rather than an obviously desirable rule.

use crate::core::error::FieldreqError;
use crate::core::store::Store;
use crate::core::time;
use crate::requirements::endpoints;
use crate::requirements::fields::{FieldSet, RuleMap};
use crate::requirements::payer::{self, PayerRequirement};
use crate::requirements::policy::{self, OrgPolicy, PolicyType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Where a resolved requirement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Served from the effective-requirements snapshot.
    Cache,
    /// Computed live from the base tables.
    Computed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EffectiveRequirement {
    pub org_id: String,
    pub payer_id: String,
    pub task_type_id: String,
    pub required_fields: FieldSet,
    pub optional_fields: FieldSet,
    pub field_rules: RuleMap,
    pub compliance_ref: Option<String>,
    pub source: Source,
    pub computed_at: String,
}

impl EffectiveRequirement {
    /// Content fingerprint over everything except `source`/`computed_at`,
    /// so two resolutions of the same inputs compare equal.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "org_id": self.org_id,
            "payer_id": self.payer_id,
            "task_type_id": self.task_type_id,
            "required_fields": self.required_fields,
            "optional_fields": self.optional_fields,
            "field_rules": self.field_rules,
            "compliance_ref": self.compliance_ref,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string());
        format!("{:x}", hasher.finalize())
    }
}

/// The three attributes a policy can touch, carried through the merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementAttrs {
    pub required_fields: FieldSet,
    pub optional_fields: FieldSet,
    pub field_rules: RuleMap,
}

/// Resolve live from the stores. A missing payer base is not an error: the
/// result is the org policy applied to an empty base (or empty outright).
pub fn resolve(
    store: &Store,
    org_id: &str,
    payer_id: &str,
    task_type_id: &str,
    as_of: Option<&str>,
) -> Result<EffectiveRequirement, FieldreqError> {
    let as_of = as_of.map(String::from).unwrap_or_else(time::today_utc);

    let base = match payer::get_active(store, payer_id, task_type_id, &as_of) {
        Ok(req) => Some(req),
        Err(FieldreqError::NotFound(_)) => None,
        Err(e) => return Err(e),
    };
    let candidates = policy::find_applicable(store, org_id, task_type_id, payer_id)?;

    Ok(resolve_from(
        base.as_ref(),
        &candidates,
        org_id,
        payer_id,
        task_type_id,
    ))
}

/// Resolve every (payer, task type) pair reachable through an org's
/// registered endpoints, ordered by payer then task type. Task types come
/// from the payer's requirement versions and from the org's applicable
/// policies, so a policy-only pair still yields a (possibly empty-base)
/// entry. An org with no endpoints resolves to an empty list.
pub fn resolve_for_org(
    store: &Store,
    org_id: &str,
    as_of: Option<&str>,
) -> Result<Vec<EffectiveRequirement>, FieldreqError> {
    let as_of = as_of.map(String::from).unwrap_or_else(time::today_utc);

    let endpoints = endpoints::list(store)?;
    let requirements = payer::load_all(store)?;
    let policies = policy::load_active(store)?;

    let payers: BTreeSet<&str> = endpoints
        .iter()
        .filter(|ep| ep.org_id == org_id)
        .map(|ep| ep.payer_id.as_str())
        .collect();

    let mut pairs: BTreeSet<(&str, &str)> = BTreeSet::new();
    for &payer_id in &payers {
        for req in &requirements {
            if req.payer_id == payer_id {
                pairs.insert((payer_id, req.task_type_id.as_str()));
            }
        }
        for pol in &policies {
            if pol.org_id == org_id
                && (pol.payer_id.is_none() || pol.payer_id.as_deref() == Some(payer_id))
            {
                pairs.insert((payer_id, pol.task_type_id.as_str()));
            }
        }
    }

    let mut out = Vec::with_capacity(pairs.len());
    for (payer_id, task_type_id) in pairs {
        let versions = requirements
            .iter()
            .filter(|r| r.payer_id == payer_id && r.task_type_id == task_type_id);
        let base = select_active(versions, &as_of);
        let candidates: Vec<OrgPolicy> = policies
            .iter()
            .filter(|p| {
                p.org_id == org_id
                    && p.task_type_id == task_type_id
                    && (p.payer_id.is_none() || p.payer_id.as_deref() == Some(payer_id))
            })
            .cloned()
            .collect();
        out.push(resolve_from(
            base,
            &candidates,
            org_id,
            payer_id,
            task_type_id,
        ));
    }
    Ok(out)
}

/// Pure core of `resolve`, shared with the cache rebuild (which loads the
/// stores once and resolves every triple in memory).
pub(crate) fn resolve_from(
    base: Option<&PayerRequirement>,
    candidates: &[OrgPolicy],
    org_id: &str,
    payer_id: &str,
    task_type_id: &str,
) -> EffectiveRequirement {
    let (attrs, compliance_ref) = match base {
        Some(req) => (
            RequirementAttrs {
                required_fields: req.required_fields.clone(),
                optional_fields: req.optional_fields.clone(),
                field_rules: req.field_rules.clone(),
            },
            req.compliance_ref.clone(),
        ),
        None => (RequirementAttrs::default(), None),
    };

    let merged = match select_policy(candidates) {
        Some(selected) => apply_policy(attrs, selected),
        None => attrs,
    };

    EffectiveRequirement {
        org_id: org_id.to_string(),
        payer_id: payer_id.to_string(),
        task_type_id: task_type_id.to_string(),
        required_fields: merged.required_fields,
        optional_fields: merged.optional_fields,
        field_rules: merged.field_rules,
        compliance_ref,
        source: Source::Computed,
        computed_at: time::now_epoch_z(),
    }
}

/// Highest-versioned requirement whose effective date has arrived.
pub(crate) fn select_active<'a>(
    versions: impl IntoIterator<Item = &'a PayerRequirement>,
    as_of: &str,
) -> Option<&'a PayerRequirement> {
    versions
        .into_iter()
        .filter(|req| req.effective_date.as_str() <= as_of)
        .max_by_key(|req| req.version)
}

/// Single-policy precedence: payer-scoped beats org-wide, then highest
/// version. At most one policy is ever applied.
pub(crate) fn select_policy(candidates: &[OrgPolicy]) -> Option<&OrgPolicy> {
    candidates
        .iter()
        .max_by_key(|p| (p.payer_id.is_some(), p.version))
}

/// Apply one policy's changes, independently per attribute. An attribute the
/// policy does not name is retained from the base unchanged, for every policy
/// type including `override`.
pub(crate) fn apply_policy(base: RequirementAttrs, policy: &OrgPolicy) -> RequirementAttrs {
    let changes = &policy.field_changes;
    let mut out = base;

    match policy.policy_type {
        PolicyType::Add => {
            if let Some(added) = &changes.required_fields {
                out.required_fields.extend(added.iter().cloned());
            }
            if let Some(added) = &changes.optional_fields {
                out.optional_fields.extend(added.iter().cloned());
            }
            if let Some(added) = &changes.field_rules {
                // Shallow key-merge; policy rules win on conflict.
                for (field, rule) in added {
                    out.field_rules.insert(field.clone(), rule.clone());
                }
            }
        }
        PolicyType::Remove => {
            if let Some(removed) = &changes.required_fields {
                out.required_fields.retain(|f| !removed.contains(f));
            }
            if let Some(removed) = &changes.optional_fields {
                out.optional_fields.retain(|f| !removed.contains(f));
            }
            if let Some(removed) = &changes.field_rules {
                for field in removed.keys() {
                    out.field_rules.remove(field);
                }
            }
        }
        PolicyType::Override => {
            if let Some(replaced) = &changes.required_fields {
                out.required_fields = replaced.clone();
            }
            if let Some(replaced) = &changes.optional_fields {
                out.optional_fields = replaced.clone();
            }
            if let Some(replaced) = &changes.field_rules {
                out.field_rules = replaced.clone();
            }
        }
    }

    out
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "resolve",
        "version": "0.1.0",
        "description": "Merge payer base requirements with the single highest-precedence org policy",
        "commands": [
            { "name": "resolve", "parameters": ["org_id", "payer_id", "task_type_id", "as_of", "no_cache", "format"] },
            { "name": "resolve-org", "parameters": ["org_id", "as_of", "format"] }
        ],
        "storage": []
    })
}
