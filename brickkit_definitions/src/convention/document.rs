use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::{AbacTemplate, Convention, DefaultTag, NamingRule, RequiredTag, RuleSpec, BUILTIN_RULES};
use crate::environment::Environment;
use crate::principal::{Principal, PrincipalType};
use crate::resources::ResourceType;
use crate::states::Mode;
use crate::Result;

/// The `naming` section of a convention document
///
/// Everything besides `pattern` and `applies_to` is a placeholder
/// value, e.g. `team: quant` feeds `{team}`.
#[derive(Deserialize, Debug)]
pub struct NamingDoc {
    pub pattern: String,

    #[serde(default)]
    pub applies_to: Vec<ResourceType>,

    #[serde(flatten)]
    pub params: BTreeMap<String, String>,
}

/// One `ownership.<resource_type>` entry
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct OwnerDoc {
    #[serde(rename = "type")]
    pub principal_type: PrincipalType,
    pub name: String,
    #[serde(default)]
    pub add_environment_suffix: Option<bool>,
}

/// One entry of the `rules` list
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct RuleDoc {
    pub rule: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The structured convention document
///
/// The recognized keys are closed: anything else fails the load.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ConventionDoc {
    pub version: u32,

    pub convention: String,

    #[serde(default)]
    pub naming: Option<NamingDoc>,

    /// Keyed by resource type name; `default` supplies the fallback
    #[serde(default)]
    pub ownership: BTreeMap<String, OwnerDoc>,

    #[serde(default)]
    pub rules: Vec<RuleDoc>,

    /// Flat default tags applied to all resource types
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default)]
    pub tag_overrides: BTreeMap<Environment, BTreeMap<String, String>>,

    #[serde(default)]
    pub required_tags: Vec<RequiredTag>,

    #[serde(default)]
    pub security_tags: Vec<String>,

    #[serde(default)]
    pub abac_policies: Vec<AbacTemplate>,

    #[serde(default)]
    pub allow_user_grants: bool,
}

const SUPPORTED_VERSION: u32 = 1;

impl Convention {
    /// Load a convention from a YAML document string
    pub fn from_document(raw: &str) -> Result<Convention> {
        let doc: ConventionDoc = serde_yaml::from_str(raw)?;
        Convention::from_doc(doc)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Convention> {
        let raw = fs::read_to_string(path.as_ref())?;
        Convention::from_document(&raw)
    }

    fn from_doc(doc: ConventionDoc) -> Result<Convention> {
        if doc.version != SUPPORTED_VERSION {
            bail!(
                "Convention document version {} not supported (expected {})",
                doc.version,
                SUPPORTED_VERSION
            );
        }
        ensure!(!doc.convention.is_empty(), "Convention needs a name");
        let mut conv = Convention::new(&doc.convention);

        if let Some(naming) = doc.naming {
            let rule = NamingRule::new(&naming.pattern, &naming.applies_to);
            rule.verify()?;
            conv.naming.push(rule);
            conv.naming_context = naming.params;
        }

        for (key, owner) in doc.ownership {
            if key != "default" {
                // the key must name a known resource type
                let parsed: std::result::Result<ResourceType, _> = serde_yaml::from_str(&key);
                if parsed.is_err() {
                    bail!("ownership key '{}' is not a resource type", key);
                }
            }
            let mut principal = match owner.principal_type {
                PrincipalType::User => Principal::user(&owner.name),
                PrincipalType::Group => Principal::group(&owner.name),
                PrincipalType::ServicePrincipal => Principal::service_principal(&owner.name),
            };
            if let Some(suffix) = owner.add_environment_suffix {
                principal.add_environment_suffix = suffix;
            }
            conv.ownership.insert(key, principal);
        }

        for rule in doc.rules {
            if !BUILTIN_RULES.contains(&rule.rule.as_str()) {
                bail!(
                    "Unknown rule '{}' in convention document (built-ins: {})",
                    rule.rule,
                    BUILTIN_RULES.join(", ")
                );
            }
            if rule.rule == "require_tags" && rule.tags.is_empty() {
                bail!("Rule require_tags needs a non-empty tags list");
            }
            conv.rules.push(RuleSpec {
                rule: rule.rule,
                mode: rule.mode,
                tags: rule.tags,
            });
        }

        for (key, value) in doc.tags {
            conv.default_tags.push(DefaultTag {
                key,
                value,
                applies_to: Vec::new(),
            });
        }
        conv.tag_overrides = doc.tag_overrides;

        for req in &doc.required_tags {
            ensure!(!req.key.is_empty(), "Required tag with empty key");
        }
        conv.required_tags = doc.required_tags;
        conv.security_tags = doc.security_tags;

        for template in &doc.abac_policies {
            template.policy().verify()?;
        }
        conv.abac_policies = doc.abac_policies;
        conv.allow_user_grants = doc.allow_user_grants;

        info!(
            "Loaded convention {} ({} rules, {} default tags, {} policies)",
            conv.name,
            conv.rules.len(),
            conv.default_tags.len(),
            conv.abac_policies.len()
        );
        Ok(conv)
    }
}

#[cfg(test)]
mod tests {
    use crate::convention::Convention;
    use crate::environment::Environment;
    use crate::principal::PrincipalType;
    use crate::resources::ResourceType;
    use crate::states::Mode;

    const DOC: &str = r#"
version: 1
convention: quant-standard
naming:
  pattern: "{team}_{name}_{env}"
  team: quant
  applies_to: [catalog]
ownership:
  default:
    type: group
    name: data-platform
  catalog:
    type: service_principal
    name: sp-catalog-owner
rules:
- rule: catalog_must_have_sp_owner
  mode: enforced
- rule: require_tags
  mode: advisory
  tags: [data_owner]
tags:
  managed_by: brickkit
tag_overrides:
  prd:
    confidentiality: high
required_tags:
- key: data_owner
  applies_to: [table]
security_tags: [pii]
abac_policies:
- name: hide_pii_rows
  policy_type: row_filter
  function_ref: pii_row_filter
  applies_to: [schema]
  match_conditions:
  - tag_key: pii
    tag_value: "true"
"#;

    #[test]
    fn full_document_parses() {
        let conv = Convention::from_document(DOC).unwrap();
        assert_eq!(conv.name, "quant-standard");
        assert_eq!(conv.naming.len(), 1);
        assert_eq!(conv.naming_context.get("team").map(String::as_str), Some("quant"));
        assert_eq!(
            conv.ownership["catalog"].principal_type,
            PrincipalType::ServicePrincipal
        );
        assert_eq!(conv.rules.len(), 2);
        assert_eq!(conv.rules[1].mode, Mode::Advisory);
        assert_eq!(conv.abac_policies.len(), 1);
        assert!(conv.is_security_tag("pii"));
    }

    #[test]
    fn prd_overrides_merge_into_defaults() {
        let conv = Convention::from_document(DOC).unwrap();
        let tags = conv.default_tags_for_in(ResourceType::Table, Environment::Prd);
        assert_eq!(tags.get("confidentiality").map(String::as_str), Some("high"));
        let tags = conv.default_tags_for_in(ResourceType::Table, Environment::Dev);
        assert!(tags.get("confidentiality").is_none());
    }

    #[test]
    fn unknown_keys_fail_the_load() {
        let doc = "version: 1\nconvention: x\nsurprise: true\n";
        assert!(Convention::from_document(doc).is_err());
    }

    #[test]
    fn unknown_rules_fail_the_load() {
        let doc = "version: 1\nconvention: x\nrules:\n- rule: made_up\n";
        assert!(Convention::from_document(doc).is_err());
    }

    #[test]
    fn unsupported_version_fails() {
        let doc = "version: 2\nconvention: x\n";
        assert!(Convention::from_document(doc).is_err());
    }

    #[test]
    fn ownership_keys_are_checked() {
        let doc = "version: 1\nconvention: x\nownership:\n  not_a_type:\n    type: group\n    name: g\n";
        assert!(Convention::from_document(doc).is_err());
    }
}
