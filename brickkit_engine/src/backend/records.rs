use std::collections::BTreeMap;

use serde_json::Value;

use brickkit_definitions::access::{MatchCondition, PolicyType, Privilege};
use brickkit_definitions::resources::{IsolationMode, ResourceType};

/// A single result row from the sql warehouse
pub type Row = BTreeMap<String, String>;

/// An observed grant, already resolved to concrete names
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GrantRecord {
    pub principal: String,
    pub privileges: Vec<Privilege>,
}

impl GrantRecord {
    pub fn new(principal: &str, privileges: &[Privilege]) -> GrantRecord {
        GrantRecord {
            principal: principal.into(),
            privileges: privileges.to_vec(),
        }
    }

    pub fn pairs(&self) -> Vec<(String, Privilege)> {
        self.privileges
            .iter()
            .map(|p| (self.principal.clone(), *p))
            .collect()
    }
}

/// An observed ABAC policy on a container
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PolicyRecord {
    pub name: String,
    pub policy_type: PolicyType,
    pub function_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<MatchCondition>,
}

/// Extended table state only the warehouse exposes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableDetails {
    /// Row filter function, when one is set
    pub row_filter: Option<String>,
    /// Column name to mask function
    pub column_masks: BTreeMap<String, String>,
    pub properties: BTreeMap<String, String>,
}

/// Function state from DESCRIBE FUNCTION EXTENDED
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionDetails {
    pub language: String,
    pub return_type: String,
    /// `(name, data_type)` pairs
    pub parameters: Vec<(String, String)>,
    pub body: String,
}

/// Normalized observed state of one resource
///
/// The unit of comparison for the differ. `partial` marks records
/// where a sub-read was denied, so missing fields must not be read as
/// "absent".
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StateRecord {
    pub resource_type: ResourceType,
    pub fqn: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grants: Vec<GrantRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_mode: Option<IsolationMode>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspace_bindings: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_filter: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub column_masks: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyRecord>,

    /// Backend specific extras (column lists, option payloads)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,

    /// Set when a sub-read was permission denied
    #[serde(default)]
    pub partial: bool,
}

impl StateRecord {
    pub fn bare(resource_type: ResourceType, fqn: &str, name: &str) -> StateRecord {
        StateRecord {
            resource_type,
            fqn: fqn.into(),
            name: name.into(),
            owner: None,
            comment: None,
            tags: BTreeMap::new(),
            grants: Vec::new(),
            isolation_mode: None,
            workspace_bindings: Vec::new(),
            storage_location: None,
            row_filter: None,
            column_masks: BTreeMap::new(),
            policies: Vec::new(),
            properties: BTreeMap::new(),
            partial: false,
        }
    }
}
