use std::collections::BTreeMap;

use crate::principal::Principal;
use crate::Result;

/// What an ABAC policy applies to matching tables
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    RowFilter,
    ColumnMask,
}

/// One tag predicate on a policy
///
/// A condition without a value only requires the tag key to be
/// present; with a value it must match exactly.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MatchCondition {
    pub tag_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_value: Option<String>,
}

impl MatchCondition {
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        match tags.get(&self.tag_key) {
            None => false,
            Some(v) => match &self.tag_value {
                Some(want) => v == want,
                None => true,
            },
        }
    }

    /// Render as the policy DDL predicate
    pub fn as_sql(&self) -> String {
        match &self.tag_value {
            Some(v) => format!("hasTagValue('{}', '{}')", self.tag_key, v),
            None => format!("hasTag('{}')", self.tag_key),
        }
    }
}

/// A tag-driven row filter or column mask policy on a container
///
/// Attached to a catalog or schema; every table inside whose effective
/// tags satisfy all match conditions gets the referenced filter or
/// mask function applied.
///
/// ```yaml
/// name: hide_pii_rows
/// policy_type: row_filter
/// function_ref: pii_row_filter
/// match_conditions:
/// - tag_key: pii
///   tag_value: "true"
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AbacPolicy {
    pub name: String,

    pub policy_type: PolicyType,

    /// Name of the filter / mask function, resolvable in the same schema
    /// unless fully qualified
    pub function_ref: String,

    /// Principals the policy applies to (empty = everyone)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_principals: Vec<Principal>,

    /// Principals exempted from the policy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except_principals: Vec<Principal>,

    /// Up to three tag predicates, all of which must match
    pub match_conditions: Vec<MatchCondition>,

    /// Masked column, required for column masks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,
}

impl AbacPolicy {
    pub fn verify(&self) -> Result<()> {
        ensure!(!self.name.is_empty(), "ABAC policy needs a name");
        ensure!(
            !self.function_ref.is_empty(),
            "ABAC policy {} needs a function reference",
            self.name
        );
        ensure!(
            !self.match_conditions.is_empty(),
            "ABAC policy {} needs at least one match condition",
            self.name
        );
        if self.match_conditions.len() > 3 {
            bail!(
                "ABAC policy {} has {} match conditions (maximum is 3)",
                self.name,
                self.match_conditions.len()
            );
        }
        match self.policy_type {
            PolicyType::ColumnMask => {
                ensure!(
                    self.target_column.is_some(),
                    "Column mask policy {} needs a target_column",
                    self.name
                );
            }
            PolicyType::RowFilter => {
                ensure!(
                    self.target_column.is_none(),
                    "Row filter policy {} cannot have a target_column",
                    self.name
                );
            }
        }
        Ok(())
    }

    /// Whether a table with these effective tags is in scope
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.match_conditions.iter().all(|c| c.matches(tags))
    }
}
