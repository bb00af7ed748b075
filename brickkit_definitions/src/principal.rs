use std::collections::BTreeMap;

use crate::environment::Environment;

/// The kind of identity a grant or ownership refers to
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    /// A human user (email style name)
    User,
    /// An account level group
    Group,
    /// A machine identity
    ServicePrincipal,
}

/// A user, group or service principal
///
/// Principals resolve to environment specific names so that one
/// declaration covers dev, acc and prd:
///
/// ```yaml
/// type: group
/// name: data_owners
/// ```
///
/// resolves to `data_owners_dev` in dev. Users never get suffixes.
/// An `environment_mapping` pins explicit names per environment and
/// always wins over suffixing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(deny_unknown_fields)]
pub struct Principal {
    /// Base identifier before environment resolution
    pub name: String,

    /// What this principal is
    #[serde(rename = "type")]
    pub principal_type: PrincipalType,

    /// Append `_dev` / `_acc` / `_prd` to the name
    ///
    /// Defaults to true for groups and service principals.
    /// Ignored for users.
    #[serde(default = "default_suffix")]
    pub add_environment_suffix: bool,

    /// Explicit names per environment
    ///
    /// ```yaml
    /// environment_mapping:
    ///   prd: sp-analytics-production
    /// ```
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_mapping: BTreeMap<Environment, String>,
}

fn default_suffix() -> bool {
    true
}

impl Principal {
    pub fn user(name: &str) -> Principal {
        Principal {
            name: name.into(),
            principal_type: PrincipalType::User,
            add_environment_suffix: false,
            environment_mapping: BTreeMap::new(),
        }
    }

    pub fn group(name: &str) -> Principal {
        Principal {
            name: name.into(),
            principal_type: PrincipalType::Group,
            add_environment_suffix: true,
            environment_mapping: BTreeMap::new(),
        }
    }

    pub fn service_principal(name: &str) -> Principal {
        Principal {
            name: name.into(),
            principal_type: PrincipalType::ServicePrincipal,
            add_environment_suffix: true,
            environment_mapping: BTreeMap::new(),
        }
    }

    pub fn with_mapping(mut self, env: Environment, resolved: &str) -> Principal {
        self.environment_mapping.insert(env, resolved.into());
        self
    }

    pub fn without_suffix(mut self) -> Principal {
        self.add_environment_suffix = false;
        self
    }

    /// Resolve the concrete name for an environment
    ///
    /// Mapping wins, then suffixing (never for users), then the raw name.
    /// Pure function of the principal and the environment.
    pub fn resolved_name(&self, env: Environment) -> String {
        if let Some(mapped) = self.environment_mapping.get(&env) {
            return mapped.clone();
        }
        if self.add_environment_suffix && self.principal_type != PrincipalType::User {
            return format!("{}_{}", self.name, env.suffix());
        }
        self.name.clone()
    }

    /// Resolve against the process environment
    pub fn resolved(&self) -> String {
        self.resolved_name(Environment::current())
    }
}

#[cfg(test)]
mod tests {
    use super::{Principal, PrincipalType};
    use crate::environment::Environment;

    #[test]
    fn group_names_get_suffixed() {
        let p = Principal::group("data_owners");
        assert_eq!(p.resolved_name(Environment::Dev), "data_owners_dev");
        assert_eq!(p.resolved_name(Environment::Prd), "data_owners_prd");
    }

    #[test]
    fn users_never_get_suffixed() {
        let mut p = Principal::user("alice@example.com");
        assert_eq!(p.resolved_name(Environment::Prd), "alice@example.com");
        // even when the flag is flipped on explicitly
        p.add_environment_suffix = true;
        assert_eq!(p.principal_type, PrincipalType::User);
        assert_eq!(p.resolved_name(Environment::Prd), "alice@example.com");
    }

    #[test]
    fn mapping_wins_over_suffix() {
        let p = Principal::service_principal("sp-analytics")
            .with_mapping(Environment::Prd, "sp-analytics-production");
        assert_eq!(p.resolved_name(Environment::Prd), "sp-analytics-production");
        assert_eq!(p.resolved_name(Environment::Dev), "sp-analytics_dev");
    }

    #[test]
    fn suffix_opt_out() {
        let p = Principal::group("everyone").without_suffix();
        assert_eq!(p.resolved_name(Environment::Acc), "everyone");
    }
}
