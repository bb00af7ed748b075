use std::collections::BTreeMap;

use regex::Regex;

use crate::environment::Environment;
use crate::resources::ResourceType;
use crate::Result;

/// A name template with `{placeholder}` substitution
///
/// Recognized placeholders are `{env}`, `{team}`, `{product}`,
/// `{acronym}` and `{name}`, all drawn from the naming context
/// (`{env}` resolves from the process environment when not given).
///
/// ```yaml
/// pattern: "{team}_{name}_{env}"
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NamingRule {
    pub pattern: String,

    /// Resource types the pattern validates; empty = all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applies_to: Vec<ResourceType>,
}

const KNOWN_PLACEHOLDERS: &[&str] = &["env", "team", "product", "acronym", "name"];

fn placeholder_re() -> Regex {
    Regex::new(r"\{([a-z_]+)\}").unwrap()
}

impl NamingRule {
    pub fn new(pattern: &str, applies_to: &[ResourceType]) -> NamingRule {
        NamingRule {
            pattern: pattern.into(),
            applies_to: applies_to.to_vec(),
        }
    }

    pub fn applies(&self, rt: ResourceType) -> bool {
        self.applies_to.is_empty() || self.applies_to.contains(&rt)
    }

    /// Reject unknown placeholders at load time
    pub fn verify(&self) -> Result<()> {
        for cap in placeholder_re().captures_iter(&self.pattern) {
            let key = &cap[1];
            if !KNOWN_PLACEHOLDERS.contains(&key) {
                bail!(
                    "Naming pattern '{}' uses unknown placeholder '{{{}}}'",
                    self.pattern,
                    key
                );
            }
        }
        Ok(())
    }

    /// Substitute every placeholder; all of them must resolve
    pub fn render(&self, ctx: &BTreeMap<String, String>) -> Result<String> {
        let re = placeholder_re();
        let mut out = String::new();
        let mut last = 0;
        for cap in re.captures_iter(&self.pattern) {
            let m = cap.get(0).unwrap();
            out.push_str(&self.pattern[last..m.start()]);
            let key = &cap[1];
            let value = if key == "env" {
                ctx.get("env")
                    .cloned()
                    .unwrap_or_else(|| Environment::current().suffix().to_string())
            } else {
                match ctx.get(key) {
                    Some(v) => v.clone(),
                    None => bail!(
                        "Naming pattern '{}' placeholder '{{{}}}' has no value in context",
                        self.pattern,
                        key
                    ),
                }
            };
            out.push_str(&value);
            last = m.end();
        }
        out.push_str(&self.pattern[last..]);
        Ok(out)
    }

    /// Compile to an anchored validation regex
    ///
    /// Placeholders with known context values match exactly; the rest
    /// match any name fragment. Used for validation-only mode.
    pub fn to_regex(&self, ctx: &BTreeMap<String, String>) -> Result<Regex> {
        let re = placeholder_re();
        let mut out = String::from("^");
        let mut last = 0;
        for cap in re.captures_iter(&self.pattern) {
            let m = cap.get(0).unwrap();
            out.push_str(&regex::escape(&self.pattern[last..m.start()]));
            let key = &cap[1];
            let value = if key == "env" {
                Some(
                    ctx.get("env")
                        .cloned()
                        .unwrap_or_else(|| Environment::current().suffix().to_string()),
                )
            } else {
                ctx.get(key).cloned()
            };
            match value {
                Some(v) => out.push_str(&regex::escape(&v)),
                None => out.push_str("[0-9a-z_]+"),
            }
            last = m.end();
        }
        out.push_str(&regex::escape(&self.pattern[last..]));
        out.push('$');
        Ok(Regex::new(&out)?)
    }

    /// Whether a resolved name satisfies the pattern
    pub fn matches(&self, name: &str, ctx: &BTreeMap<String, String>) -> bool {
        match self.to_regex(ctx) {
            Ok(re) => re.is_match(name),
            Err(e) => {
                warn!("Naming pattern '{}' failed to compile: {}", self.pattern, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::NamingRule;
    use crate::environment::Environment;
    use std::collections::BTreeMap;

    fn ctx(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_substitutes_all_placeholders() {
        Environment::force(Environment::Dev);
        let rule = NamingRule::new("{team}_{name}_{env}", &[]);
        let rendered = rule
            .render(&ctx(&[("team", "quant"), ("name", "analytics")]))
            .unwrap();
        assert_eq!(rendered, "quant_analytics_dev");
    }

    #[test]
    fn render_fails_on_missing_context() {
        let rule = NamingRule::new("{team}_{name}", &[]);
        assert!(rule.render(&ctx(&[("team", "quant")])).is_err());
    }

    #[test]
    fn unknown_placeholders_rejected() {
        let rule = NamingRule::new("{country}_{name}", &[]);
        assert!(rule.verify().is_err());
        let ok = NamingRule::new("{acronym}_{name}", &[]);
        assert!(ok.verify().is_ok());
    }

    #[test]
    fn validation_regex_wildcards_unknowns() {
        Environment::force(Environment::Dev);
        let rule = NamingRule::new("{team}_{name}_{env}", &[]);
        let c = ctx(&[("team", "quant")]);
        assert!(rule.matches("quant_analytics_dev", &c));
        assert!(!rule.matches("sales_analytics_dev", &c));
        assert!(!rule.matches("quant_analytics_prd", &c));
    }
}
