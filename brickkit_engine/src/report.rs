//! Execution results and the aggregated run report

use chrono::{DateTime, Utc};

use brickkit_definitions::resources::ResourceType;
use brickkit_definitions::{Environment, Operation, ValidationError};

use crate::drift::DriftReport;

/// The outcome of one backend-facing operation on one resource
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ExecutionResult {
    pub success: bool,
    pub operation: Operation,
    pub resource_type: ResourceType,
    pub resource_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes_applied: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ExecutionResult {
    pub fn ok(operation: Operation, rt: ResourceType, name: &str, message: &str) -> ExecutionResult {
        ExecutionResult {
            success: true,
            operation,
            resource_type: rt,
            resource_name: name.into(),
            message: message.into(),
            changes_applied: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn failure(rt: ResourceType, name: &str, errors: Vec<String>) -> ExecutionResult {
        ExecutionResult {
            success: false,
            operation: Operation::Error,
            resource_type: rt,
            resource_name: name.into(),
            message: format!("{} error(s)", errors.len()),
            changes_applied: Vec::new(),
            errors,
        }
    }
}

/// Per-resource reconciliation outcome (the executor contract)
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ReconcileResult {
    pub resource_name: String,
    pub operation: Operation,
    pub changes_applied: Vec<String>,
    pub changes_skipped: Vec<String>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl ReconcileResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Everything one reconciliation run produced
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub environment: Environment,
    pub results: Vec<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReport>,
}

impl RunReport {
    pub fn new() -> RunReport {
        RunReport {
            started_at: Utc::now(),
            environment: Environment::current(),
            results: Vec::new(),
            validation: Vec::new(),
            drift: None,
        }
    }

    pub fn record(&mut self, result: ExecutionResult) {
        self.results.push(result);
    }

    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| !r.success)
            || self.validation.iter().any(|v| v.is_enforced())
    }

    /// Exit code contract: 0 reconciled clean, 1 drift in detect-only
    /// mode, 2 any resource failed
    pub fn exit_status(&self) -> i32 {
        if self.has_errors() {
            return 2;
        }
        if let Some(ref drift) = self.drift {
            if drift.has_drift() {
                return 1;
            }
        }
        0
    }

    pub fn print(&self) -> crate::Result<()> {
        println!("{}", serde_yaml::to_string(self)?);
        Ok(())
    }
}

impl Default for RunReport {
    fn default() -> Self {
        RunReport::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutionResult, RunReport};
    use brickkit_definitions::resources::ResourceType;
    use brickkit_definitions::{Operation, ValidationError};

    #[test]
    fn exit_status_contract() {
        let mut report = RunReport::new();
        assert_eq!(report.exit_status(), 0);

        report.record(ExecutionResult::ok(
            Operation::Create,
            ResourceType::Catalog,
            "analytics_dev",
            "created",
        ));
        assert_eq!(report.exit_status(), 0);

        report.record(ExecutionResult::failure(
            ResourceType::Schema,
            "analytics_dev.sales",
            vec!["boom".into()],
        ));
        assert_eq!(report.exit_status(), 2);
    }

    #[test]
    fn enforced_validation_errors_fail_the_run() {
        let mut report = RunReport::new();
        report.validation.push(ValidationError::advisory(
            "individual_user_grant",
            "x",
            "advisory only".into(),
        ));
        assert_eq!(report.exit_status(), 0);
        report.validation.push(ValidationError::enforced(
            "catalog_must_have_sp_owner",
            "x",
            "nope".into(),
        ));
        assert_eq!(report.exit_status(), 2);
    }

    #[test]
    fn detect_only_drift_exits_one() {
        let mut report = RunReport::new();
        let mut drift = crate::drift::DriftReport::new();
        drift.missing.push("analytics_dev".into());
        report.drift = Some(drift);
        assert_eq!(report.exit_status(), 1);
    }
}
