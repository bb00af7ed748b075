/// The backend operation an executor performed (or planned) for a resource
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Nothing to do; declared and observed agree
    Skip,
    /// Planned but not executed
    DryRun,
    /// Run cancelled or aborted before this resource was reached
    NotAttempted,
    Error,
}

impl Default for Operation {
    fn default() -> Self {
        Operation::Skip
    }
}

/// Drift severity buckets
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    /// Security impactful: grants, filters, masks, isolation, tier-1 ownership
    Critical,
}

/// Where a resource sits relative to declared state
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Compliance {
    Compliant,
    Drifted,
    /// Declared but absent in the backend
    Missing,
    /// Present in the backend but not declared; reported, never mutated
    Unmanaged,
}

/// Whether a convention rule blocks a deploy or only warns
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Enforced,
    Advisory,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Enforced
    }
}

/// A single convention or model violation
///
/// Enforced violations block reconciliation before any backend call;
/// advisory ones are surfaced as warnings in the run report.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// Rule identifier, e.g. `catalog_must_have_sp_owner`
    pub rule: String,
    /// Fully qualified name of the offending resource
    pub resource: String,
    pub detail: String,
    pub severity: Mode,
}

impl ValidationError {
    pub fn enforced(rule: &str, resource: &str, detail: String) -> ValidationError {
        ValidationError {
            rule: rule.into(),
            resource: resource.into(),
            detail,
            severity: Mode::Enforced,
        }
    }

    pub fn advisory(rule: &str, resource: &str, detail: String) -> ValidationError {
        ValidationError {
            rule: rule.into(),
            resource: resource.into(),
            detail,
            severity: Mode::Advisory,
        }
    }

    pub fn is_enforced(&self) -> bool {
        self.severity == Mode::Enforced
    }
}
