//! Typed per-resource executors
//!
//! One struct, one switch on the resource kind at the backend
//! boundary. Tables and functions go through the warehouse (full
//! DDL); containers, infra and assistive resources go through the
//! control plane. Grants always apply additions before removals.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use brickkit_definitions::access::Privilege;
use brickkit_definitions::resources::{IsolationMode, ResourceKind, ResourceType};
use brickkit_definitions::{Operation, Resource};

use crate::backend::{CatalogClient, GrantRecord, PolicyRecord, SqlExecutor};
use crate::differ::{diff_resource, Change, ChangeAction, Diff};
use crate::reader::StateReader;
use crate::reconcile::retry::{self, RetryPolicy};
use crate::reconcile::CancelToken;
use crate::report::ReconcileResult;
use crate::sqlgen;
use crate::Result;

pub struct Executor {
    client: Arc<dyn CatalogClient>,
    sql: Arc<dyn SqlExecutor>,
    retry: RetryPolicy,
    dry_run: bool,
}

impl Executor {
    pub fn new(
        client: Arc<dyn CatalogClient>,
        sql: Arc<dyn SqlExecutor>,
        retry: RetryPolicy,
        dry_run: bool,
    ) -> Executor {
        Executor {
            client,
            sql,
            retry,
            dry_run,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn call<T, F>(&self, cancel: Option<&CancelToken>, what: &str, f: F) -> Result<T>
    where
        F: FnMut() -> crate::backend::BackendResult<T>,
    {
        Ok(retry::call(&self.retry, cancel, what, f)?)
    }

    // ------------------------------------------------------------------
    // primitive operations
    // ------------------------------------------------------------------

    pub fn exists(&self, resource: &Resource) -> Result<bool> {
        let rt = resource.resource_type();
        let fqn = resource.fqn();
        let found = self.call(None, &format!("get {}", fqn), || {
            self.client.get_resource(rt, &fqn)
        })?;
        Ok(found.is_some())
    }

    pub fn read_state(
        &self,
        reader: &StateReader,
        resource: &Resource,
    ) -> Result<Option<crate::backend::StateRecord>> {
        reader.read(resource)
    }

    /// Compose reader and differ for one resource
    pub fn diff(&self, reader: &StateReader, resource: &Resource) -> Result<Diff> {
        let observed = reader.read(resource)?;
        Ok(diff_resource(resource, observed.as_ref(), Utc::now()))
    }

    /// Create the resource; refuses references
    pub fn create(&self, resource: &Resource, cancel: Option<&CancelToken>) -> Result<()> {
        let fqn = resource.fqn();
        match &resource.kind {
            ResourceKind::Table(spec) => {
                let ddl = sqlgen::create_table(resource, spec)?;
                self.call(cancel, &format!("create table {}", fqn), || {
                    self.sql.execute(&ddl)
                })?;
                if let Some(owner) = resource.effective_owner().map(|p| p.resolved()) {
                    self.call(cancel, &format!("set owner of {}", fqn), || {
                        self.client.set_owner(ResourceType::Table, &fqn, &owner)
                    })?;
                }
            }
            ResourceKind::Function(spec) => {
                let ddl = sqlgen::create_function(resource, spec);
                self.call(cancel, &format!("create function {}", fqn), || {
                    self.sql.execute(&ddl)
                })?;
                if let Some(owner) = resource.effective_owner().map(|p| p.resolved()) {
                    self.call(cancel, &format!("set owner of {}", fqn), || {
                        self.client.set_owner(ResourceType::Function, &fqn, &owner)
                    })?;
                }
                // the DDL cannot carry the comment
                if resource.comment.is_some() {
                    let params = resource.to_update_params(&["comment".to_string()])?;
                    self.call(cancel, &format!("comment on {}", fqn), || {
                        self.client.update_resource(&params).map(|_| ())
                    })?;
                }
            }
            _ => {
                let params = resource.to_create_params()?;
                self.call(cancel, &format!("create {}", fqn), || {
                    self.client.create_resource(&params).map(|_| ())
                })?;
            }
        }
        info!("created {} {}", resource.resource_type(), fqn);
        Ok(())
    }

    pub fn delete(&self, resource: &Resource, cancel: Option<&CancelToken>) -> Result<()> {
        if resource.reference {
            bail!(
                "{} {} is a reference and cannot be deleted",
                resource.resource_type(),
                resource.fqn()
            );
        }
        let rt = resource.resource_type();
        let fqn = resource.fqn();
        match rt {
            ResourceType::Table => {
                let ddl = sqlgen::drop_table(&fqn);
                self.call(cancel, &format!("drop table {}", fqn), || {
                    self.sql.execute(&ddl)
                })?;
            }
            ResourceType::Function => {
                let ddl = sqlgen::drop_function(&fqn);
                self.call(cancel, &format!("drop function {}", fqn), || {
                    self.sql.execute(&ddl)
                })?;
            }
            _ => {
                self.call(cancel, &format!("delete {}", fqn), || {
                    self.client.delete_resource(rt, &fqn)
                })?;
            }
        }
        info!("deleted {} {}", rt, fqn);
        Ok(())
    }

    // ------------------------------------------------------------------
    // phased application
    // ------------------------------------------------------------------

    /// Existence, ownership, comments, bindings and isolation
    ///
    /// Bindings are applied before switching to ISOLATED; switching
    /// back to OPEN happens before bindings are removed, so the
    /// backend never sees an isolated container without bindings.
    pub fn apply_core(
        &self,
        resource: &Resource,
        diff: &Diff,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<String>> {
        let mut applied = Vec::new();
        let rt = resource.resource_type();
        let fqn = resource.fqn();

        if diff.needs_create() {
            self.create(resource, cancel)?;
            applied.push("resource".to_string());
            // everything else was part of the create
            return Ok(applied);
        }
        if resource.reference
            && diff
                .changes
                .iter()
                .any(|c| c.field == "resource" && c.action == ChangeAction::Modify)
        {
            bail!(
                "Referenced {} {} does not exist in the backend; references are never created",
                rt,
                fqn
            );
        }

        for change in &diff.changes {
            match change.field.as_str() {
                "owner" => {
                    let owner = change
                        .declared
                        .as_ref()
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    self.call(cancel, &format!("set owner of {}", fqn), || {
                        self.client.set_owner(rt, &fqn, &owner)
                    })?;
                    applied.push("owner".into());
                }
                "comment" | "storage_location" => {
                    let params = resource.to_update_params(&[change.field.clone()])?;
                    self.call(cancel, &format!("update {}", fqn), || {
                        self.client.update_resource(&params).map(|_| ())
                    })?;
                    applied.push(change.field.clone());
                }
                "function" => {
                    if let ResourceKind::Function(ref spec) = resource.kind {
                        let ddl = sqlgen::create_function(resource, spec);
                        self.call(cancel, &format!("replace function {}", fqn), || {
                            self.sql.execute(&ddl)
                        })?;
                        applied.push("function".into());
                    }
                }
                _ => {}
            }
        }

        self.apply_isolation(resource, diff, cancel, &mut applied)?;
        Ok(applied)
    }

    fn apply_isolation(
        &self,
        resource: &Resource,
        diff: &Diff,
        cancel: Option<&CancelToken>,
        applied: &mut Vec<String>,
    ) -> Result<()> {
        let rt = resource.resource_type();
        let fqn = resource.fqn();
        let bindings_changed = diff.changes.iter().any(|c| c.field == "workspace_bindings");
        let isolation_change = diff.changes.iter().find(|c| c.field == "isolation_mode");

        let to_isolated = resource.isolation_mode == Some(IsolationMode::Isolated);
        if bindings_changed && to_isolated {
            // bindings first, then isolate
            self.call(cancel, &format!("bind {}", fqn), || {
                self.client
                    .update_bindings(rt, &fqn, &resource.workspace_bindings)
            })?;
            applied.push("workspace_bindings".into());
        }
        if isolation_change.is_some() {
            let mode = resource.isolation_mode.unwrap_or(IsolationMode::Open);
            self.call(cancel, &format!("set isolation of {}", fqn), || {
                self.client.set_isolation(rt, &fqn, mode)
            })?;
            applied.push("isolation_mode".into());
        }
        if bindings_changed && !to_isolated {
            // back to open happened above; bindings may now shrink
            self.call(cancel, &format!("bind {}", fqn), || {
                self.client
                    .update_bindings(rt, &fqn, &resource.workspace_bindings)
            })?;
            applied.push("workspace_bindings".into());
        }
        Ok(())
    }

    /// Tag additions, value fixes and removals
    pub fn apply_tags(
        &self,
        resource: &Resource,
        diff: &Diff,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<String>> {
        let rt = resource.resource_type();
        let fqn = resource.fqn();
        let mut to_set: BTreeMap<String, String> = BTreeMap::new();
        let mut to_remove: Vec<String> = Vec::new();
        let mut applied = Vec::new();

        for change in &diff.changes {
            if let Some(key) = change.field.strip_prefix("tags.") {
                match change.action {
                    ChangeAction::Add | ChangeAction::Modify => {
                        if let Some(v) = change.declared.as_ref().and_then(|v| v.as_str()) {
                            to_set.insert(key.to_string(), v.to_string());
                        }
                    }
                    ChangeAction::Remove => to_remove.push(key.to_string()),
                }
                applied.push(change.field.clone());
            }
        }
        if !to_set.is_empty() {
            self.call(cancel, &format!("set tags on {}", fqn), || {
                self.client.set_tags(rt, &fqn, &to_set)
            })?;
        }
        if !to_remove.is_empty() {
            self.call(cancel, &format!("remove tags on {}", fqn), || {
                self.client.remove_tags(rt, &fqn, &to_remove)
            })?;
        }
        Ok(applied)
    }

    /// Grant delta, additive before subtractive
    ///
    /// A principal that stops existing fails only its own grant; the
    /// rest of the delta still applies.
    pub fn apply_grants(
        &self,
        resource: &Resource,
        diff: &Diff,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<String>> {
        let rt = resource.resource_type();
        let fqn = resource.fqn();
        let mut adds: BTreeMap<String, Vec<Privilege>> = BTreeMap::new();
        let mut removes: BTreeMap<String, Vec<Privilege>> = BTreeMap::new();

        for change in &diff.changes {
            if change.field != "grants" {
                continue;
            }
            let payload = match change.action {
                ChangeAction::Remove => change.observed.as_ref(),
                _ => change.declared.as_ref(),
            };
            let (principal, privilege) = match payload.and_then(parse_grant_change) {
                Some(pair) => pair,
                None => bail!("Malformed grant change on {}: {:?}", fqn, change),
            };
            match change.action {
                ChangeAction::Remove => removes.entry(principal).or_insert_with(Vec::new).push(privilege),
                _ => adds.entry(principal).or_insert_with(Vec::new).push(privilege),
            }
        }
        if adds.is_empty() && removes.is_empty() {
            return Ok(Vec::new());
        }

        let mut applied = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        // additive first so access is never transiently revoked
        for (principal, privileges) in &adds {
            let add = vec![GrantRecord::new(principal, privileges)];
            let outcome = self.call(cancel, &format!("grant on {}", fqn), || {
                self.client.update_grants(rt, &fqn, &add, &[])
            });
            match outcome {
                Ok(()) => applied.push(format!("grant {} -> {:?}", principal, privileges)),
                Err(e) => errors.push(format!("grant to {} failed: {}", principal, e)),
            }
        }
        for (principal, privileges) in &removes {
            let remove = vec![GrantRecord::new(principal, privileges)];
            let outcome = self.call(cancel, &format!("revoke on {}", fqn), || {
                self.client.update_grants(rt, &fqn, &[], &remove)
            });
            match outcome {
                Ok(()) => applied.push(format!("revoke {} -> {:?}", principal, privileges)),
                Err(e) => errors.push(format!("revoke from {} failed: {}", principal, e)),
            }
        }
        if !errors.is_empty() {
            bail!("{}", errors.join("; "));
        }
        Ok(applied)
    }

    /// Row filters, column masks and ABAC policies
    pub fn apply_policies(
        &self,
        resource: &Resource,
        diff: &Diff,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<String>> {
        let fqn = resource.fqn();
        let mut applied = Vec::new();

        for change in &diff.changes {
            let field = change.field.clone();
            if field == "row_filter" {
                match change.action {
                    ChangeAction::Remove => {
                        let ddl = sqlgen::drop_row_filter(&fqn);
                        self.call(cancel, &format!("drop row filter on {}", fqn), || {
                            self.sql.execute(&ddl)
                        })?;
                    }
                    ChangeAction::Add | ChangeAction::Modify => {
                        let (func, cols) = match &resource.kind {
                            ResourceKind::Table(spec) => match &spec.row_filter {
                                Some(rf) => (
                                    change
                                        .declared
                                        .as_ref()
                                        .and_then(|v| v.as_str())
                                        .unwrap_or(&rf.function_ref)
                                        .to_string(),
                                    rf.on_columns.clone(),
                                ),
                                None => bail!("Row filter change without a declared filter on {}", fqn),
                            },
                            _ => bail!("Row filter change on non-table {}", fqn),
                        };
                        let ddl = sqlgen::set_row_filter(&fqn, &func, &cols);
                        self.call(cancel, &format!("set row filter on {}", fqn), || {
                            self.sql.execute(&ddl)
                        })?;
                    }
                }
                applied.push(field);
                continue;
            }

            if let Some(column) = field.strip_prefix("column_masks.") {
                match change.action {
                    ChangeAction::Remove => {
                        let ddl = sqlgen::drop_column_mask(&fqn, column);
                        self.call(cancel, &format!("drop mask on {}.{}", fqn, column), || {
                            self.sql.execute(&ddl)
                        })?;
                    }
                    ChangeAction::Add | ChangeAction::Modify => {
                        let func = change
                            .declared
                            .as_ref()
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let using = mask_using_columns(resource, column);
                        let ddl = sqlgen::set_column_mask(&fqn, column, &func, &using);
                        self.call(cancel, &format!("set mask on {}.{}", fqn, column), || {
                            self.sql.execute(&ddl)
                        })?;
                    }
                }
                applied.push(field);
                continue;
            }

            if let Some(name) = field.strip_prefix("policies.") {
                match change.action {
                    ChangeAction::Remove => {
                        self.call(cancel, &format!("drop policy {} on {}", name, fqn), || {
                            self.client.delete_policy(&fqn, name)
                        })?;
                    }
                    ChangeAction::Add => {
                        let policy = parse_policy(change, &fqn)?;
                        self.call(cancel, &format!("create policy {} on {}", name, fqn), || {
                            self.client.create_policy(&fqn, &policy)
                        })?;
                    }
                    ChangeAction::Modify => {
                        let policy = parse_policy(change, &fqn)?;
                        self.call(cancel, &format!("update policy {} on {}", name, fqn), || {
                            self.client.update_policy(&fqn, &policy)
                        })?;
                    }
                }
                applied.push(field);
            }
        }
        Ok(applied)
    }

    // ------------------------------------------------------------------
    // the per-resource contract
    // ------------------------------------------------------------------

    /// Apply exactly the diff for one resource, idempotently
    pub fn reconcile(
        &self,
        reader: &StateReader,
        resource: &Resource,
        cancel: Option<&CancelToken>,
    ) -> ReconcileResult {
        let start = Instant::now();
        let fqn = resource.fqn();
        let mut result = ReconcileResult {
            resource_name: fqn.clone(),
            operation: Operation::Skip,
            changes_applied: Vec::new(),
            changes_skipped: Vec::new(),
            errors: Vec::new(),
            duration_ms: 0,
        };

        let diff = match self.diff(reader, resource) {
            Ok(d) => d,
            Err(e) => {
                result.operation = Operation::Error;
                result.errors.push(e.to_string());
                result.duration_ms = start.elapsed().as_millis() as u64;
                return result;
            }
        };

        if diff.is_compliant() {
            debug!("{} is compliant", fqn);
            result.duration_ms = start.elapsed().as_millis() as u64;
            return result;
        }

        if self.dry_run {
            info!("dry-run: would change {} ({:?})", fqn, diff.fields());
            result.operation = Operation::DryRun;
            result.changes_skipped = diff.fields();
            result.duration_ms = start.elapsed().as_millis() as u64;
            return result;
        }

        result.operation = if diff.needs_create() {
            Operation::Create
        } else {
            Operation::Update
        };

        let phases: [(&str, fn(&Executor, &Resource, &Diff, Option<&CancelToken>) -> Result<Vec<String>>); 4] = [
            ("core", Executor::apply_core),
            ("tags", Executor::apply_tags),
            ("grants", Executor::apply_grants),
            ("policies", Executor::apply_policies),
        ];
        for (phase, apply) in &phases {
            match apply(self, resource, &diff, cancel) {
                Ok(mut applied) => result.changes_applied.append(&mut applied),
                Err(e) => {
                    error!("{} phase {} failed: {}", fqn, phase, e);
                    result.errors.push(format!("{}: {}", phase, e));
                    break;
                }
            }
        }
        if !result.errors.is_empty() {
            result.operation = Operation::Error;
        }
        reader.invalidate(&fqn);
        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }
}

fn parse_grant_change(value: &serde_json::Value) -> Option<(String, Privilege)> {
    let principal = value.get("principal")?.as_str()?.to_string();
    let privilege: Privilege = value.get("privilege")?.as_str()?.parse().ok()?;
    Some((principal, privilege))
}

fn parse_policy(change: &Change, fqn: &str) -> Result<PolicyRecord> {
    let value = change
        .declared
        .clone()
        .ok_or_else(|| format_err!("Policy change without declared value on {}", fqn))?;
    Ok(serde_json::from_value(value)?)
}

fn mask_using_columns(resource: &Resource, column: &str) -> Vec<String> {
    if let ResourceKind::Table(ref spec) = resource.kind {
        for (c, m) in spec.masked_columns() {
            if c.name == column {
                return m.using_columns.clone();
            }
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::Executor;
    use crate::backend::MemoryBackend;
    use crate::reader::StateReader;
    use crate::reconcile::retry::RetryPolicy;
    use brickkit_definitions::access::{Grant, Privilege};
    use brickkit_definitions::{Environment, Operation, Principal, Resource};
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryBackend>, Executor, StateReader) {
        Environment::force(Environment::Dev);
        let backend = Arc::new(MemoryBackend::new());
        let executor = Executor::new(
            backend.clone(),
            backend.clone(),
            RetryPolicy::immediate(0),
            false,
        );
        let reader = StateReader::with_retry(
            backend.clone(),
            backend.clone(),
            RetryPolicy::immediate(0),
        );
        (backend, executor, reader)
    }

    #[test]
    fn reconcile_creates_then_noops() {
        let (backend, executor, reader) = setup();
        let cat = Resource::catalog("analytics")
            .with_owner(Principal::group("data_owners"))
            .with_tag("domain", "analytics")
            .with_grant(Grant::new(Principal::group("analysts"), &[Privilege::UseCatalog]));

        let first = executor.reconcile(&reader, &cat, None);
        assert!(first.errors.is_empty(), "{:?}", first.errors);
        assert_eq!(first.operation, Operation::Create);

        let record = backend
            .get(brickkit_definitions::resources::ResourceType::Catalog, "analytics_dev")
            .unwrap();
        assert_eq!(record.owner.as_deref(), Some("data_owners_dev"));
        assert_eq!(record.tags["domain"], "analytics");
        assert_eq!(record.grants.len(), 1);

        // idempotence: a second run sees an empty diff
        let second = executor.reconcile(&reader, &cat, None);
        assert_eq!(second.operation, Operation::Skip);
        assert!(second.changes_applied.is_empty());
    }

    #[test]
    fn dry_run_never_mutates() {
        let (backend, _executor, reader) = setup();
        let dry = Executor::new(
            backend.clone(),
            backend.clone(),
            RetryPolicy::immediate(0),
            true,
        );
        let cat = Resource::catalog("analytics");
        let result = dry.reconcile(&reader, &cat, None);
        assert_eq!(result.operation, Operation::DryRun);
        assert!(!result.changes_skipped.is_empty());
        assert!(backend
            .get(brickkit_definitions::resources::ResourceType::Catalog, "analytics_dev")
            .is_none());
    }

    #[test]
    fn references_are_never_created() {
        let (_backend, executor, reader) = setup();
        let reference = Resource::reference(
            "legacy",
            brickkit_definitions::resources::ResourceType::Catalog,
        );
        let result = executor.reconcile(&reader, &reference, None);
        assert_eq!(result.operation, Operation::Error);
        assert!(result.errors[0].contains("reference"));
    }
}
