use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::access::{AbacPolicy, MatchCondition, PolicyType};
use crate::environment::Environment;
use crate::principal::{Principal, PrincipalType};
use crate::resources::{Resource, ResourceType};
use crate::states::{Mode, ValidationError};
use crate::Result;

/// Name templates and placeholder handling
pub mod naming;
pub use self::naming::NamingRule;

/// Structured convention documents (YAML)
pub mod document;

/// A default tag, applied when absent
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DefaultTag {
    pub key: String,
    pub value: String,
    /// Resource types the default applies to; empty = all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applies_to: Vec<ResourceType>,
}

/// A tag that must be present after the merge
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RequiredTag {
    pub key: String,
    /// When set, the tag value must be one of these
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applies_to: Vec<ResourceType>,
}

/// An ABAC policy template carried by a convention
///
/// `target` pins the template to one container fqn; without it the
/// template applies to every container of the listed types.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AbacTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applies_to: Vec<ResourceType>,

    pub name: String,

    pub policy_type: PolicyType,

    pub function_ref: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_principals: Vec<Principal>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except_principals: Vec<Principal>,

    pub match_conditions: Vec<MatchCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,
}

impl AbacTemplate {
    /// The concrete policy the template stamps onto a container
    pub fn policy(&self) -> AbacPolicy {
        AbacPolicy {
            name: self.name.clone(),
            policy_type: self.policy_type,
            function_ref: self.function_ref.clone(),
            target_principals: self.target_principals.clone(),
            except_principals: self.except_principals.clone(),
            match_conditions: self.match_conditions.clone(),
            target_column: self.target_column.clone(),
        }
    }

    pub fn applies(&self, resource: &Resource) -> bool {
        let rt = resource.resource_type();
        if !rt.is_container() || rt == ResourceType::Metastore {
            return false;
        }
        if let Some(ref target) = self.target {
            return *target == resource.fqn();
        }
        self.applies_to.is_empty() || self.applies_to.contains(&rt)
    }
}

/// One entry of the convention's rule list
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RuleSpec {
    pub rule: String,
    #[serde(default)]
    pub mode: Mode,
    /// Tag keys for `require_tags`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

pub const BUILTIN_RULES: &[&str] = &[
    "catalog_must_have_sp_owner",
    "owner_must_be_sp_or_group",
    "require_tags",
    "naming_pattern",
];

/// A caller-registered validation rule
#[derive(Clone)]
pub struct CustomRule {
    pub name: String,
    pub mode: Mode,
    /// Returns a violation detail when the resource fails the rule
    pub check: Arc<dyn Fn(&Resource) -> Option<String> + Send + Sync>,
}

impl fmt::Debug for CustomRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CustomRule({}, {:?})", self.name, self.mode)
    }
}

/// A reusable governance convention
///
/// Conventions are first class values attached to a root resource;
/// propagation copies the `Arc` reference, not the contents. Default
/// application and validation are pure functions of the convention,
/// the subtree and the environment.
#[derive(Clone, Debug, Default)]
pub struct Convention {
    pub name: String,
    pub default_tags: Vec<DefaultTag>,
    pub required_tags: Vec<RequiredTag>,
    pub naming: Vec<NamingRule>,
    pub naming_context: BTreeMap<String, String>,
    /// Owner defaults: keyed by resource type name, `default` as fallback
    pub ownership: BTreeMap<String, Principal>,
    pub rules: Vec<RuleSpec>,
    pub abac_policies: Vec<AbacTemplate>,
    /// Tags whose drift is security relevant (critical severity)
    pub security_tags: Vec<String>,
    /// Merged over default tags when the environment matches
    pub tag_overrides: BTreeMap<Environment, BTreeMap<String, String>>,
    /// Silence the individual-user-grant advisory
    pub allow_user_grants: bool,
    custom_rules: Vec<CustomRule>,
}

impl Convention {
    pub fn new(name: &str) -> Convention {
        Convention {
            name: name.into(),
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // builders
    // ------------------------------------------------------------------

    pub fn with_default_tag(mut self, key: &str, value: &str, applies_to: &[ResourceType]) -> Self {
        self.default_tags.push(DefaultTag {
            key: key.into(),
            value: value.into(),
            applies_to: applies_to.to_vec(),
        });
        self
    }

    pub fn with_required_tag(
        mut self,
        key: &str,
        allowed_values: Option<Vec<String>>,
        applies_to: &[ResourceType],
    ) -> Self {
        self.required_tags.push(RequiredTag {
            key: key.into(),
            allowed_values,
            applies_to: applies_to.to_vec(),
        });
        self
    }

    pub fn with_naming(mut self, rule: NamingRule) -> Self {
        self.naming.push(rule);
        self
    }

    pub fn with_rule(mut self, rule: &str, mode: Mode) -> Self {
        self.rules.push(RuleSpec {
            rule: rule.into(),
            mode,
            tags: Vec::new(),
        });
        self
    }

    pub fn with_owner_default(mut self, key: &str, owner: Principal) -> Self {
        self.ownership.insert(key.into(), owner);
        self
    }

    pub fn with_abac_policy(mut self, template: AbacTemplate) -> Self {
        self.abac_policies.push(template);
        self
    }

    pub fn with_security_tag(mut self, key: &str) -> Self {
        self.security_tags.push(key.into());
        self
    }

    /// Register a caller-defined validation rule
    pub fn register_rule<F>(&mut self, name: &str, mode: Mode, check: F)
    where
        F: Fn(&Resource) -> Option<String> + Send + Sync + 'static,
    {
        self.custom_rules.push(CustomRule {
            name: name.into(),
            mode,
            check: Arc::new(check),
        });
    }

    // ------------------------------------------------------------------
    // lookups used by the resource model and the differ
    // ------------------------------------------------------------------

    /// Default tags for a resource type, with environment overrides
    pub fn default_tags_for(&self, rt: ResourceType) -> BTreeMap<String, String> {
        self.default_tags_for_in(rt, Environment::current())
    }

    /// Explicit-environment variant for pure evaluation
    pub fn default_tags_for_in(
        &self,
        rt: ResourceType,
        env: Environment,
    ) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for dt in &self.default_tags {
            if dt.applies_to.is_empty() || dt.applies_to.contains(&rt) {
                out.insert(dt.key.clone(), dt.value.clone());
            }
        }
        if let Some(overrides) = self.tag_overrides.get(&env) {
            for (k, v) in overrides {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }

    pub fn required_tags_for(&self, rt: ResourceType) -> Vec<&RequiredTag> {
        self.required_tags
            .iter()
            .filter(|t| t.applies_to.is_empty() || t.applies_to.contains(&rt))
            .collect()
    }

    /// ABAC templates in scope for a container resource
    pub fn templates_for(&self, resource: &Resource) -> Vec<&AbacTemplate> {
        self.abac_policies
            .iter()
            .filter(|t| t.applies(resource))
            .collect()
    }

    pub fn is_security_tag(&self, key: &str) -> bool {
        self.security_tags.iter().any(|t| t == key)
    }

    // ------------------------------------------------------------------
    // application
    // ------------------------------------------------------------------

    /// Attach the convention to a subtree and fill defaults
    ///
    /// Idempotent: defaults only fill gaps, never overwrite. Children
    /// attached later pick the convention up automatically.
    pub fn apply_to(this: &Arc<Convention>, resource: &mut Resource) {
        resource.convention = Some(this.clone());
        this.fill_defaults(resource);
        let mut children = std::mem::replace(&mut resource.children, Vec::new());
        for child in &mut children {
            resource.cascade_into(child);
        }
        resource.children = children;
    }

    /// Fill owner defaults where nothing else would resolve
    pub(crate) fn fill_defaults(&self, resource: &mut Resource) {
        if resource.owner.is_none() && resource.inherited.owner.is_none() {
            let key = resource.resource_type().to_string();
            if let Some(p) = self.ownership.get(&key).or_else(|| self.ownership.get("default")) {
                debug!(
                    "Convention {} defaults owner of {} to {}",
                    self.name,
                    resource.fqn(),
                    p.name
                );
                resource.owner = Some(p.clone());
            }
        }
    }

    /// Substitute placeholders in the matching pattern for a type
    pub fn generate_name(
        &self,
        rt: ResourceType,
        context: &BTreeMap<String, String>,
    ) -> Result<String> {
        let rule = self
            .naming
            .iter()
            .find(|r| r.applies(rt))
            .ok_or_else(|| format_err!("Convention {} has no naming pattern for {}", self.name, rt))?;
        let mut ctx = self.naming_context.clone();
        for (k, v) in context {
            ctx.insert(k.clone(), v.clone());
        }
        rule.render(&ctx)
    }

    // ------------------------------------------------------------------
    // validation
    // ------------------------------------------------------------------

    /// Validate a subtree against the convention
    ///
    /// Pure and stable: the same state yields the same error list in
    /// the same order. Enforced violations block reconciliation.
    pub fn validate(&self, root: &Resource) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for resource in root.walk() {
            self.validate_one(resource, &mut errors);
        }
        errors
    }

    fn validate_one(&self, resource: &Resource, errors: &mut Vec<ValidationError>) {
        let rt = resource.resource_type();
        let fqn = resource.fqn();
        let tags = resource.effective_tags();

        // required tags after the merge
        for req in self.required_tags_for(rt) {
            match tags.get(&req.key) {
                None => errors.push(ValidationError::enforced(
                    "require_tags",
                    &fqn,
                    format!("Required tag '{}' is missing", req.key),
                )),
                Some(v) => {
                    if let Some(ref allowed) = req.allowed_values {
                        if !allowed.contains(v) {
                            errors.push(ValidationError::enforced(
                                "require_tags",
                                &fqn,
                                format!(
                                    "Tag '{}' value '{}' not in allowed set {:?}",
                                    req.key, v, allowed
                                ),
                            ));
                        }
                    }
                }
            }
        }

        // naming patterns (mode via the naming_pattern rule, default enforced)
        let naming_mode = self
            .rules
            .iter()
            .find(|r| r.rule == "naming_pattern")
            .map(|r| r.mode)
            .unwrap_or(Mode::Enforced);
        for rule in self.naming.iter().filter(|r| r.applies(rt)) {
            let name = resource.resolved_name();
            if !rule.matches(&name, &self.naming_context) {
                errors.push(ValidationError {
                    rule: "naming_pattern".into(),
                    resource: fqn.clone(),
                    detail: format!("Name '{}' does not match pattern '{}'", name, rule.pattern),
                    severity: naming_mode,
                });
            }
        }

        // declared rule list
        for spec in &self.rules {
            match spec.rule.as_str() {
                "catalog_must_have_sp_owner" => {
                    if rt == ResourceType::Catalog {
                        let ok = resource
                            .effective_owner()
                            .map(|p| p.principal_type == PrincipalType::ServicePrincipal)
                            .unwrap_or(false);
                        if !ok {
                            errors.push(ValidationError {
                                rule: spec.rule.clone(),
                                resource: fqn.clone(),
                                detail: "Catalog owner must be a service principal".into(),
                                severity: spec.mode,
                            });
                        }
                    }
                }
                "owner_must_be_sp_or_group" => {
                    if let Some(owner) = resource.effective_owner() {
                        if owner.principal_type == PrincipalType::User {
                            errors.push(ValidationError {
                                rule: spec.rule.clone(),
                                resource: fqn.clone(),
                                detail: format!("Owner '{}' is an individual user", owner.name),
                                severity: spec.mode,
                            });
                        }
                    }
                }
                "require_tags" => {
                    for key in &spec.tags {
                        if !tags.contains_key(key) {
                            errors.push(ValidationError {
                                rule: spec.rule.clone(),
                                resource: fqn.clone(),
                                detail: format!("Required tag '{}' is missing", key),
                                severity: spec.mode,
                            });
                        }
                    }
                }
                // handled above, evaluated against the naming list
                "naming_pattern" => {}
                other => {
                    // unknown names reaching validation were registered late
                    if !self.custom_rules.iter().any(|c| c.name == other) {
                        warn!("Convention {} lists unknown rule '{}'", self.name, other);
                    }
                }
            }
        }

        // advisory on individual user grants
        if !self.allow_user_grants {
            for g in &resource.grants {
                if g.principal.principal_type == PrincipalType::User {
                    errors.push(ValidationError::advisory(
                        "individual_user_grant",
                        &fqn,
                        format!(
                            "Grant to individual user '{}'; prefer groups",
                            g.principal.name
                        ),
                    ));
                }
            }
        }

        // caller registered rules
        for custom in &self.custom_rules {
            if let Some(detail) = (custom.check)(resource) {
                errors.push(ValidationError {
                    rule: custom.name.clone(),
                    resource: fqn.clone(),
                    detail,
                    severity: custom.mode,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Convention, NamingRule};
    use crate::environment::Environment;
    use crate::principal::Principal;
    use crate::resources::{Resource, ResourceType};
    use crate::states::Mode;
    use std::sync::Arc;

    fn base_convention() -> Convention {
        Convention::new("standard")
            .with_default_tag("managed_by", "brickkit", &[])
            .with_required_tag("data_owner", None, &[ResourceType::Table])
            .with_rule("catalog_must_have_sp_owner", Mode::Enforced)
    }

    #[test]
    fn defaults_show_up_in_effective_tags() {
        Environment::force(Environment::Dev);
        let conv = Arc::new(base_convention());
        let mut cat = Resource::catalog("analytics").with_owner(Principal::service_principal("sp_owner"));
        Convention::apply_to(&conv, &mut cat);
        assert_eq!(
            cat.effective_tags().get("managed_by"),
            Some(&"brickkit".to_string())
        );
    }

    #[test]
    fn apply_is_idempotent() {
        Environment::force(Environment::Dev);
        let conv = Arc::new(
            base_convention().with_owner_default("default", Principal::group("platform")),
        );
        let mut cat = Resource::catalog("analytics");
        Convention::apply_to(&conv, &mut cat);
        let owner_once = cat.owner.clone();
        let tags_once = cat.effective_tags();
        Convention::apply_to(&conv, &mut cat);
        assert_eq!(cat.owner, owner_once);
        assert_eq!(cat.effective_tags(), tags_once);
    }

    #[test]
    fn catalog_owner_rule_fires_for_users() {
        Environment::force(Environment::Dev);
        let conv = Arc::new(base_convention());
        let mut cat =
            Resource::catalog("analytics").with_owner(Principal::user("alice@example.com"));
        Convention::apply_to(&conv, &mut cat);
        let errors = conv.validate(&cat);
        let hit = errors
            .iter()
            .find(|e| e.rule == "catalog_must_have_sp_owner")
            .expect("rule should fire");
        assert!(hit.is_enforced());
    }

    #[test]
    fn validation_is_stable() {
        Environment::force(Environment::Dev);
        let conv = Arc::new(base_convention());
        let mut cat = Resource::catalog("analytics");
        Convention::apply_to(&conv, &mut cat);
        let first = conv.validate(&cat);
        let second = conv.validate(&cat);
        assert_eq!(first, second);
    }

    #[test]
    fn convention_propagates_on_attach() {
        Environment::force(Environment::Dev);
        let conv = Arc::new(base_convention());
        let mut cat = Resource::catalog("analytics").with_owner(Principal::service_principal("sp"));
        Convention::apply_to(&conv, &mut cat);
        cat.attach_child(Resource::schema("sales")).unwrap();
        let sch = &cat.children[0];
        assert!(sch.convention.is_some());
        assert_eq!(
            sch.effective_tags().get("managed_by"),
            Some(&"brickkit".to_string())
        );
    }

    #[test]
    fn generate_name_substitutes_context() {
        Environment::force(Environment::Dev);
        let mut conv = Convention::new("standard")
            .with_naming(NamingRule::new("{team}_{name}_{env}", &[ResourceType::Catalog]));
        conv.naming_context
            .insert("team".to_string(), "quant".to_string());
        let mut ctx = std::collections::BTreeMap::new();
        ctx.insert("name".to_string(), "analytics".to_string());
        assert_eq!(
            conv.generate_name(ResourceType::Catalog, &ctx).unwrap(),
            "quant_analytics_dev"
        );
    }

    #[test]
    fn custom_rules_run() {
        Environment::force(Environment::Dev);
        let mut conv = base_convention();
        conv.register_rule("no_comment_free_catalogs", Mode::Advisory, |r| {
            if r.comment.is_none() {
                Some("Catalog has no comment".into())
            } else {
                None
            }
        });
        let conv = Arc::new(conv);
        let mut cat = Resource::catalog("analytics").with_owner(Principal::service_principal("sp"));
        Convention::apply_to(&conv, &mut cat);
        let errors = conv.validate(&cat);
        assert!(errors.iter().any(|e| e.rule == "no_comment_free_catalogs"));
    }
}
