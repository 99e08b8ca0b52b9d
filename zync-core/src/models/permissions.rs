//! Row and cell level permission policies.
//!
//! Policies are arrays of *allow* rules: a row passes an operation iff at
//! least one rule's condition evaluates true against the bound auth data.
//! An empty rule set denies unconditionally, a single constant-true rule
//! allows unconditionally. Policies are plain data and are persisted as a
//! single content-addressed JSONB row so replicas can detect changes by
//! hash.

use crate::json::canonical_string;
use crate::models::query::Condition;
use crate::models::schema::TableSpec;
use crate::models::{content_hash, ColumnName, TableName};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum PermissionsError {
    #[error("permission rules reference unknown table `{0}`")]
    UnknownTable(TableName),
    #[error("cell policy on `{0}` references unknown column `{1}`")]
    UnknownCellColumn(TableName, ColumnName),
    #[error("failed to parse permissions: {0}")]
    Malformed(String),
}

/// A single allow rule, serialized as `["allow", condition]`.
#[derive(Clone, Debug, PartialEq)]
pub struct AllowRule(pub Condition);

impl Serialize for AllowRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ("allow", &self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AllowRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, condition): (String, Condition) = Deserialize::deserialize(deserializer)?;
        if tag != "allow" {
            return Err(D::Error::custom(format!("unknown rule action `{tag}`")));
        }
        Ok(AllowRule(condition))
    }
}

pub type PolicySet = Vec<AllowRule>;

/// Unconditional allow.
pub fn anyone_can() -> PolicySet {
    vec![AllowRule(Condition::Literal { value: true })]
}

/// Unconditional deny.
pub fn nobody_can() -> PolicySet {
    Vec::new()
}

/// The disjunction of a policy's rule conditions. An empty policy
/// collapses to constant-false; the transformed query still executes and
/// returns no rows.
pub fn policy_condition(policy: &PolicySet) -> Condition {
    Condition::or(policy.iter().map(|rule| rule.0.clone()).collect())
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicies {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_mutation: Option<PolicySet>,
    /// Fires on insert and update. Extension to delete is unsettled and
    /// not enforced here; the rule position parses so stored configs
    /// round-trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_mutation: Option<PolicySet>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPolicies {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<PolicySet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert: Option<PolicySet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdatePolicies>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<PolicySet>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TablePolicies {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<AssetPolicies>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cell: BTreeMap<ColumnName, AssetPolicies>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsConfig {
    #[serde(default)]
    pub tables: BTreeMap<TableName, TablePolicies>,
}

impl PermissionsConfig {
    /// Validates the config against the replicated tables. Rules naming a
    /// missing table or cell column are a configuration error, raised at
    /// policy compile time rather than query time.
    pub fn validate(
        &self,
        replicated: &BTreeMap<TableName, TableSpec>,
    ) -> Result<(), PermissionsError> {
        for (table, policies) in &self.tables {
            let spec = replicated
                .get(table)
                .ok_or_else(|| PermissionsError::UnknownTable(table.clone()))?;
            for column in policies.cell.keys() {
                if !spec.columns.contains_key(column) {
                    return Err(PermissionsError::UnknownCellColumn(
                        table.clone(),
                        column.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Content-addressed 128-bit hash of the canonical config.
    pub fn hash(&self) -> String {
        let value = serde_json::to_value(self).expect("policies are plain data");
        let canonical = match &value {
            serde_json::Value::Object(map) => {
                canonical_string(map).expect("policy objects are finite")
            }
            _ => value.to_string(),
        };
        content_hash(canonical.as_bytes())
    }
}
