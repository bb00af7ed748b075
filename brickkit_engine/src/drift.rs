//! Drift classification
//!
//! Turns raw diffs into a severity-bucketed report: what drifted and
//! how badly, what is missing, what exists unmanaged, what complies.

use chrono::{DateTime, Utc};

use brickkit_definitions::resources::{ResourceKind, ResourceType};
use brickkit_definitions::{Compliance, Environment, Resource, Severity};

use crate::differ::Diff;

/// Severity of one change on one resource
///
/// Security impactful fields are critical: access (grants), policy
/// surface (filters, masks, ABAC), isolation, and ownership of tier-1
/// resources. Convention gaps warn; cosmetics inform.
pub fn classify_change(field: &str, resource: &Resource) -> Severity {
    if field == "grants"
        || field == "row_filter"
        || field.starts_with("column_masks.")
        || field.starts_with("policies.")
        || field == "isolation_mode"
        || field == "workspace_bindings"
    {
        return Severity::Critical;
    }
    if field == "owner" {
        return if is_tier_one(resource) {
            Severity::Critical
        } else {
            Severity::Warning
        };
    }
    if let Some(key) = field.strip_prefix("tags.") {
        if let Some(ref conv) = resource.convention {
            if conv.is_security_tag(key) {
                return Severity::Critical;
            }
            if conv
                .required_tags_for(resource.resource_type())
                .iter()
                .any(|t| t.key == key)
            {
                return Severity::Warning;
            }
        }
        return Severity::Info;
    }
    match field {
        "comment" => Severity::Info,
        "storage_location" => Severity::Warning,
        "resource" | "function" => Severity::Warning,
        _ => Severity::Info,
    }
}

fn is_tier_one(resource: &Resource) -> bool {
    if let ResourceKind::Model(ref spec) = resource.kind {
        if spec.tier == Some(1) {
            return true;
        }
    }
    resource
        .effective_tags()
        .get("tier")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// One drifted resource with its classified changes
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DriftEntry {
    pub resource_type: ResourceType,
    pub fqn: String,
    /// Worst severity across the changes
    pub severity: Severity,
    pub diff: Diff,
}

/// The full state of a detection run
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DriftReport {
    pub timestamp: DateTime<Utc>,
    pub environment: Environment,
    pub drifted: Vec<DriftEntry>,
    /// Declared, observed absent
    pub missing: Vec<String>,
    /// Observed, declared absent; reported, never mutated
    pub unmanaged: Vec<String>,
    pub compliant: Vec<String>,
    /// Resources not reached before cancellation
    pub not_attempted: Vec<String>,
}

impl DriftReport {
    pub fn new() -> DriftReport {
        DriftReport {
            timestamp: Utc::now(),
            environment: Environment::current(),
            drifted: Vec::new(),
            missing: Vec::new(),
            unmanaged: Vec::new(),
            compliant: Vec::new(),
            not_attempted: Vec::new(),
        }
    }

    /// Record a diff under the right bucket
    pub fn record(&mut self, resource: &Resource, diff: Diff) {
        if diff.is_compliant() {
            self.compliant.push(diff.resource_name);
            return;
        }
        if diff.needs_create() {
            self.missing.push(diff.resource_name);
            return;
        }
        let severity = diff
            .changes
            .iter()
            .map(|c| classify_change(&c.field, resource))
            .max()
            .unwrap_or(Severity::Info);
        self.drifted.push(DriftEntry {
            resource_type: diff.resource_type,
            fqn: diff.resource_name.clone(),
            severity,
            diff,
        });
    }

    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty() || !self.missing.is_empty()
    }

    /// Where a resource landed in this report
    pub fn compliance_of(&self, fqn: &str) -> Option<Compliance> {
        if self.compliant.iter().any(|f| f == fqn) {
            return Some(Compliance::Compliant);
        }
        if self.missing.iter().any(|f| f == fqn) {
            return Some(Compliance::Missing);
        }
        if self.unmanaged.iter().any(|f| f == fqn) {
            return Some(Compliance::Unmanaged);
        }
        if self.drifted.iter().any(|d| d.fqn == fqn) {
            return Some(Compliance::Drifted);
        }
        None
    }

    pub fn worst_severity(&self) -> Option<Severity> {
        self.drifted.iter().map(|d| d.severity).max()
    }

    /// Exit code contract: 0 clean, 1 drift detected
    pub fn exit_status(&self) -> i32 {
        if self.has_drift() {
            1
        } else {
            0
        }
    }

    pub fn print(&self) -> crate::Result<()> {
        println!("{}", serde_yaml::to_string(self)?);
        Ok(())
    }
}

impl Default for DriftReport {
    fn default() -> Self {
        DriftReport::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_change, DriftReport};
    use crate::differ::diff_resource;
    use brickkit_definitions::resources::ModelSpec;
    use brickkit_definitions::{Convention, Environment, Resource, Severity};
    use chrono::Utc;
    use std::sync::Arc;

    #[test]
    fn grants_and_filters_are_critical() {
        let t = Resource::catalog("analytics");
        assert_eq!(classify_change("grants", &t), Severity::Critical);
        assert_eq!(classify_change("row_filter", &t), Severity::Critical);
        assert_eq!(classify_change("column_masks.email", &t), Severity::Critical);
        assert_eq!(classify_change("policies.hide_pii", &t), Severity::Critical);
        assert_eq!(classify_change("isolation_mode", &t), Severity::Critical);
    }

    #[test]
    fn owner_severity_depends_on_tier() {
        let plain = Resource::catalog("analytics");
        assert_eq!(classify_change("owner", &plain), Severity::Warning);

        let tiered = Resource::catalog("analytics").with_tag("tier", "1");
        assert_eq!(classify_change("owner", &tiered), Severity::Critical);

        let mut spec = ModelSpec::default();
        spec.tier = Some(1);
        let model = Resource::ml_model("churn", spec);
        assert_eq!(classify_change("owner", &model), Severity::Critical);
    }

    #[test]
    fn security_tags_follow_the_convention() {
        Environment::force(Environment::Dev);
        let conv = Arc::new(Convention::new("std").with_security_tag("pii"));
        let mut t = Resource::catalog("analytics");
        Convention::apply_to(&conv, &mut t);
        assert_eq!(classify_change("tags.pii", &t), Severity::Critical);
        assert_eq!(classify_change("tags.costcenter", &t), Severity::Info);
        // without a convention, tags are informational
        let bare = Resource::catalog("analytics");
        assert_eq!(classify_change("tags.pii", &bare), Severity::Info);
    }

    #[test]
    fn report_buckets_and_exit_status() {
        use brickkit_definitions::Compliance;
        Environment::force(Environment::Dev);
        let mut report = DriftReport::new();
        let cat = Resource::catalog("analytics");
        report.record(&cat, diff_resource(&cat, None, Utc::now()));
        assert_eq!(report.missing.len(), 1);
        assert!(report.has_drift());
        assert_eq!(report.exit_status(), 1);
        assert_eq!(report.compliance_of("analytics_dev"), Some(Compliance::Missing));
        assert_eq!(report.compliance_of("nobody"), None);

        let clean = DriftReport::new();
        assert_eq!(clean.exit_status(), 0);
    }
}
