//! Ordered, retried, cancellable reconciliation
//!
//! One deploy walks a declared subtree in fixed phases: containers
//! before the things inside them, policy functions before the
//! policies that reference them, tags and grants after the resources
//! they decorate, destructive steps last and only on request.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use chrono::Utc;
use threadpool::ThreadPool;

use brickkit_definitions::access::AccessRequest;
use brickkit_definitions::resources::{ResourceKind, ResourceType};
use brickkit_definitions::{Operation, Resource, ValidationError};

use crate::backend::{CatalogClient, SqlExecutor};
use crate::differ::{ChangeAction, Diff};
use crate::drift::DriftReport;
use crate::executor::Executor;
use crate::reader::StateReader;
use crate::report::{ExecutionResult, RunReport};
use crate::Result;

/// Retry policy and backoff
pub mod retry;
pub use self::retry::RetryPolicy;

/// Cooperative cancellation flag shared with workers
///
/// Checked before each backend call and each new resource; in-flight
/// calls always run to completion so backend state stays well defined.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

/// Knobs for a reconciliation run
#[derive(Clone, Debug)]
pub struct ReconcileOptions {
    /// Plan and log only, mutate nothing
    pub dry_run: bool,
    /// Record per-resource errors and keep going with siblings
    pub continue_on_error: bool,
    /// Authorize deletions of unmanaged resources (leaf to root)
    pub allow_delete: bool,
    /// Deterministic single threaded deploys
    pub sequential: bool,
    /// Worker pool size for independent roots
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        ReconcileOptions {
            dry_run: false,
            continue_on_error: true,
            allow_delete: false,
            sequential: false,
            workers: 4,
            retry: RetryPolicy::default(),
        }
    }
}

impl ReconcileOptions {
    /// Defaults with `BRICKKIT_DRY_RUN` / `BRICKKIT_MAX_RETRIES` honored
    pub fn from_env() -> ReconcileOptions {
        let mut options = ReconcileOptions::default();
        options.retry = RetryPolicy::from_env();
        if let Ok(val) = env::var("BRICKKIT_DRY_RUN") {
            options.dry_run = matches!(val.as_str(), "1" | "true" | "yes");
        }
        options
    }
}

// deterministic phase order within a subtree
fn phase_rank(rt: ResourceType) -> u8 {
    match rt {
        ResourceType::StorageCredential => 0,
        ResourceType::ExternalLocation => 1,
        ResourceType::Connection => 1,
        ResourceType::Metastore => 2,
        ResourceType::Catalog => 3,
        ResourceType::Schema => 4,
        ResourceType::Function => 5,
        ResourceType::Table | ResourceType::Volume => 6,
        ResourceType::VectorEndpoint | ResourceType::Model => 7,
        ResourceType::VectorIndex => 8,
        ResourceType::Space => 9,
    }
}

// per-resource accumulator while phases run
struct Outcome {
    resource_type: ResourceType,
    operation: Operation,
    applied: Vec<String>,
    errors: Vec<String>,
}

/// The reconciler: validates, plans and applies a declared tree
#[derive(Clone)]
pub struct Reconciler {
    client: Arc<dyn CatalogClient>,
    sql: Arc<dyn SqlExecutor>,
    options: ReconcileOptions,
    cancel: CancelToken,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn CatalogClient>,
        sql: Arc<dyn SqlExecutor>,
        options: ReconcileOptions,
    ) -> Reconciler {
        Reconciler {
            client,
            sql,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Token callers can use to stop the run cooperatively
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn reader(&self) -> StateReader {
        StateReader::with_retry(self.client.clone(), self.sql.clone(), self.options.retry.clone())
    }

    fn executor(&self) -> Executor {
        Executor::new(
            self.client.clone(),
            self.sql.clone(),
            self.options.retry.clone(),
            self.options.dry_run,
        )
    }

    // ------------------------------------------------------------------
    // validation
    // ------------------------------------------------------------------

    /// Model invariants plus convention rules, before any backend call
    pub fn validate(&self, root: &Resource) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if let Err(e) = root.verify() {
            errors.push(ValidationError::enforced("model", &root.fqn(), e.to_string()));
        }
        if let Some(ref conv) = root.convention {
            errors.extend(conv.validate(root));
        }
        errors
    }

    // ------------------------------------------------------------------
    // deploy
    // ------------------------------------------------------------------

    /// Reconcile one declared subtree in phase order
    pub fn deploy(&self, root: &Resource) -> RunReport {
        let mut report = RunReport::new();
        report.validation = self.validate(root);
        if report.validation.iter().any(|v| v.is_enforced()) {
            warn!(
                "{} enforced violation(s) on {}, skipping deploy",
                report.validation.iter().filter(|v| v.is_enforced()).count(),
                root.fqn()
            );
            return report;
        }

        let reader = self.reader();
        let executor = self.executor();
        let resources = ordered_resources(root);
        let declared_functions = declared_function_fqns(root);

        // the function DAG catches cycles up front
        if let Err(e) = policy_function_order(root) {
            report.record(ExecutionResult::failure(
                root.resource_type(),
                &root.fqn(),
                vec![e.to_string()],
            ));
            return report;
        }

        if self.options.dry_run {
            for r in &resources {
                let result = match executor.diff(&reader, r) {
                    Ok(diff) => {
                        if diff.is_compliant() {
                            ExecutionResult::ok(Operation::Skip, r.resource_type(), &r.fqn(), "compliant")
                        } else {
                            info!("dry-run: {} would change {:?}", r.fqn(), diff.fields());
                            let mut res = ExecutionResult::ok(
                                Operation::DryRun,
                                r.resource_type(),
                                &r.fqn(),
                                "planned changes",
                            );
                            res.changes_applied = diff.fields();
                            res
                        }
                    }
                    Err(e) => ExecutionResult::failure(r.resource_type(), &r.fqn(), vec![e.to_string()]),
                };
                report.record(result);
            }
            return report;
        }

        let mut diffs: BTreeMap<String, Diff> = BTreeMap::new();
        let mut outcomes: BTreeMap<String, Outcome> = BTreeMap::new();
        let mut aborted = false;

        // core phase: existence, ownership, bindings, function bodies
        for r in &resources {
            if self.cancel.is_cancelled() || aborted {
                break;
            }
            let fqn = r.fqn();
            let mut outcome = Outcome {
                resource_type: r.resource_type(),
                operation: Operation::Skip,
                applied: Vec::new(),
                errors: Vec::new(),
            };
            match executor.diff(&reader, r) {
                Ok(diff) => {
                    if diff.needs_create() {
                        outcome.operation = Operation::Create;
                    }
                    match executor.apply_core(r, &diff, Some(&self.cancel)) {
                        Ok(mut applied) => outcome.applied.append(&mut applied),
                        Err(e) => outcome.errors.push(format!("core: {}", e)),
                    }
                    diffs.insert(fqn.clone(), diff);
                }
                Err(e) => outcome.errors.push(format!("read: {}", e)),
            }
            let failed = !outcome.errors.is_empty();
            outcomes.insert(fqn, outcome);
            if failed && !self.options.continue_on_error {
                aborted = true;
            }
        }

        // decoration phases over the same pre-run diffs
        type Phase = (&'static str, fn(&Executor, &Resource, &Diff, Option<&CancelToken>) -> Result<Vec<String>>);
        let phases: [Phase; 3] = [
            ("tags", Executor::apply_tags),
            ("grants", Executor::apply_grants),
            ("policies", Executor::apply_policies),
        ];
        for (phase, apply) in &phases {
            if aborted {
                break;
            }
            for r in &resources {
                if self.cancel.is_cancelled() || aborted {
                    break;
                }
                let fqn = r.fqn();
                let diff = match diffs.get(&fqn) {
                    Some(d) => d.clone(),
                    None => continue,
                };
                let outcome = match outcomes.get_mut(&fqn) {
                    Some(o) if o.errors.is_empty() => o,
                    _ => continue,
                };
                if *phase == "policies" {
                    if let Err(e) = self.ensure_referenced_functions(&diff, &declared_functions) {
                        outcome.errors.push(format!("policies: {}", e));
                        if !self.options.continue_on_error {
                            aborted = true;
                        }
                        continue;
                    }
                }
                match apply(&executor, r, &diff, Some(&self.cancel)) {
                    Ok(mut applied) => outcome.applied.append(&mut applied),
                    Err(e) => {
                        outcome.errors.push(format!("{}: {}", phase, e));
                        if !self.options.continue_on_error {
                            aborted = true;
                        }
                    }
                }
                reader.invalidate(&fqn);
            }
        }

        // destructive phase, leaf to root, only when authorized
        if self.options.allow_delete && !aborted && !self.cancel.is_cancelled() {
            match self.delete_unmanaged(&executor, &reader, root) {
                Ok(deleted) => {
                    for result in deleted {
                        report.record(result);
                    }
                }
                Err(e) => report.record(ExecutionResult::failure(
                    root.resource_type(),
                    &root.fqn(),
                    vec![format!("delete: {}", e)],
                )),
            }
        }

        // fold outcomes into the report, flagging unreached work
        for r in &resources {
            let fqn = r.fqn();
            match outcomes.remove(&fqn) {
                Some(outcome) => {
                    let operation = if !outcome.errors.is_empty() {
                        Operation::Error
                    } else if outcome.operation == Operation::Create {
                        Operation::Create
                    } else if !outcome.applied.is_empty() {
                        Operation::Update
                    } else {
                        Operation::Skip
                    };
                    let success = outcome.errors.is_empty();
                    report.record(ExecutionResult {
                        success,
                        operation,
                        resource_type: outcome.resource_type,
                        resource_name: fqn,
                        message: if success {
                            format!("{} change(s) applied", outcome.applied.len())
                        } else {
                            "failed".into()
                        },
                        changes_applied: outcome.applied,
                        errors: outcome.errors,
                    });
                }
                None => {
                    report.record(ExecutionResult::ok(
                        Operation::NotAttempted,
                        r.resource_type(),
                        &fqn,
                        "not attempted",
                    ));
                }
            }
        }
        report
    }

    /// Deploy several independent roots, infrastructure first
    ///
    /// Infra roots run sequentially (containers may depend on them);
    /// the rest fan out on a bounded worker pool unless sequential
    /// mode is requested.
    pub fn deploy_all(&self, roots: Vec<Resource>) -> RunReport {
        let mut combined = RunReport::new();
        let (infra, others): (Vec<Resource>, Vec<Resource>) = roots
            .into_iter()
            .partition(|r| r.resource_type().is_infrastructure());

        for root in &infra {
            merge_reports(&mut combined, self.deploy(root));
        }

        if self.options.sequential || self.options.workers <= 1 || others.len() <= 1 {
            for root in &others {
                merge_reports(&mut combined, self.deploy(root));
            }
            return combined;
        }

        let pool = ThreadPool::new(self.options.workers);
        let (tx, rx) = mpsc::channel();
        for root in others {
            let tx = tx.clone();
            let worker = self.clone();
            pool.execute(move || {
                let report = worker.deploy(&root);
                // receiver hung up means the caller stopped caring
                let _ = tx.send(report);
            });
        }
        drop(tx);
        for report in rx {
            merge_reports(&mut combined, report);
        }
        combined
    }

    // ------------------------------------------------------------------
    // drift detection
    // ------------------------------------------------------------------

    /// Read, diff and classify without mutating anything
    pub fn detect(&self, root: &Resource) -> Result<DriftReport> {
        let reader = self.reader();
        let mut drift = DriftReport::new();
        let resources = ordered_resources(root);

        for r in &resources {
            if self.cancel.is_cancelled() {
                drift.not_attempted.push(r.fqn());
                continue;
            }
            let observed = match reader.read_with_cancel(r, Some(&self.cancel)) {
                Ok(o) => o,
                // a cancellation mid-read still yields a partial report
                Err(_) if self.cancel.is_cancelled() => {
                    drift.not_attempted.push(r.fqn());
                    continue;
                }
                Err(e) => return Err(e),
            };
            let diff = crate::differ::diff_resource(r, observed.as_ref(), Utc::now());
            drift.record(r, diff);
        }

        // unmanaged discovery: observed children nobody declared
        for r in &resources {
            let rt = r.resource_type();
            if !rt.is_container() || rt == ResourceType::Metastore {
                continue;
            }
            let child_types: &[ResourceType] = if rt == ResourceType::Catalog {
                &[ResourceType::Schema]
            } else {
                &[
                    ResourceType::Table,
                    ResourceType::Volume,
                    ResourceType::Function,
                    ResourceType::Model,
                ]
            };
            let declared: BTreeSet<String> = r.children.iter().map(|c| c.fqn()).collect();
            for ct in child_types {
                for observed in reader.read_children(r, *ct)? {
                    if !declared.contains(&observed.fqn) {
                        drift.unmanaged.push(observed.fqn);
                    }
                }
            }
        }
        drift.unmanaged.sort();
        drift.unmanaged.dedup();
        Ok(drift)
    }

    /// Expire overdue approved requests; the next deploy revokes the
    /// matching grants
    pub fn revoke_expired_requests(requests: &mut [AccessRequest]) -> Vec<String> {
        AccessRequest::revoke_expired(requests, Utc::now())
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    // every function referenced by a filter, mask or policy change
    // must be declared in the tree or already exist in the backend
    fn ensure_referenced_functions(
        &self,
        diff: &Diff,
        declared: &BTreeSet<String>,
    ) -> Result<()> {
        for change in &diff.changes {
            if change.action == ChangeAction::Remove {
                continue;
            }
            let func = if change.field == "row_filter" || change.field.starts_with("column_masks.") {
                change
                    .declared
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .map(String::from)
            } else if change.field.starts_with("policies.") {
                change
                    .declared
                    .as_ref()
                    .and_then(|v| v.get("function_ref"))
                    .and_then(|v| v.as_str())
                    .map(String::from)
            } else {
                None
            };
            if let Some(func) = func {
                if declared.contains(&func) {
                    continue;
                }
                let found = retry::call(
                    &self.options.retry,
                    Some(&self.cancel),
                    &format!("get function {}", func),
                    || self.client.get_resource(ResourceType::Function, &func),
                )?;
                if found.is_none() {
                    bail!(
                        "Function {} referenced by {} is neither declared nor present",
                        func,
                        change.field
                    );
                }
            }
        }
        Ok(())
    }

    // drop observed-but-undeclared children, leaves before containers
    fn delete_unmanaged(
        &self,
        executor: &Executor,
        reader: &StateReader,
        root: &Resource,
    ) -> Result<Vec<ExecutionResult>> {
        let mut victims: Vec<(ResourceType, String)> = Vec::new();
        for r in root.walk() {
            let rt = r.resource_type();
            if !rt.is_container() || rt == ResourceType::Metastore {
                continue;
            }
            let child_types: &[ResourceType] = if rt == ResourceType::Catalog {
                &[ResourceType::Schema]
            } else {
                &[ResourceType::Table, ResourceType::Volume, ResourceType::Function]
            };
            let declared: BTreeSet<String> = r.children.iter().map(|c| c.fqn()).collect();
            for ct in child_types {
                for observed in reader.read_children(r, *ct)? {
                    if !declared.contains(&observed.fqn) {
                        victims.push((*ct, observed.fqn));
                    }
                }
            }
        }
        // leaves first
        victims.sort_by_key(|(rt, fqn)| (std::cmp::Reverse(phase_rank(*rt)), fqn.clone()));
        let mut results = Vec::new();
        for (rt, fqn) in victims {
            if self.cancel.is_cancelled() {
                break;
            }
            warn!("deleting unmanaged {} {}", rt, fqn);
            let stub = resource_stub(rt, &fqn);
            executor.delete(&stub, Some(&self.cancel))?;
            results.push(ExecutionResult::ok(
                Operation::Delete,
                rt,
                &fqn,
                "deleted unmanaged resource",
            ));
        }
        Ok(results)
    }
}

// a minimal resource shell for delete dispatch on observed-only state
fn resource_stub(rt: ResourceType, fqn: &str) -> Resource {
    let parts: Vec<&str> = fqn.split('.').collect();
    let name = parts.last().cloned().unwrap_or(fqn);
    let mut stub = Resource::reference(name, rt);
    stub.reference = false;
    stub.add_environment_suffix = Some(false);
    if parts.len() == 3 {
        stub.catalog_name = Some(parts[0].into());
        stub.schema_name = Some(parts[1].into());
    } else if parts.len() == 2 {
        stub.catalog_name = Some(parts[0].into());
    }
    stub
}

fn ordered_resources(root: &Resource) -> Vec<&Resource> {
    let mut resources = root.walk();
    // stable: preorder within a rank keeps parents before children
    resources.sort_by_key(|r| phase_rank(r.resource_type()));
    reorder_functions(root, &mut resources);
    resources
}

fn declared_function_fqns(root: &Resource) -> BTreeSet<String> {
    root.walk()
        .into_iter()
        .filter(|r| r.resource_type() == ResourceType::Function)
        .map(|r| r.fqn())
        .collect()
}

// functions referenced by filters / masks / policies come before
// unreferenced ones, in the DAG's topological order
fn reorder_functions(root: &Resource, resources: &mut Vec<&Resource>) {
    if let Ok(order) = policy_function_order(root) {
        let rank: BTreeMap<String, usize> =
            order.into_iter().enumerate().map(|(i, f)| (f, i)).collect();
        resources.sort_by_key(|r| {
            if r.resource_type() == ResourceType::Function {
                (
                    phase_rank(ResourceType::Function),
                    *rank.get(&r.fqn()).unwrap_or(&usize::max_value()),
                )
            } else {
                (phase_rank(r.resource_type()), 0)
            }
        });
    }
}

/// Topological order of declared policy functions
///
/// Nodes are functions plus their consumers (filtered tables, mask
/// columns, ABAC policies); an edge runs from a function to each
/// consumer. A cycle is an internal bug surfaced as an error.
pub fn policy_function_order(root: &Resource) -> Result<Vec<String>> {
    use petgraph::algo::toposort;
    use petgraph::graph::{DiGraph, NodeIndex};

    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: BTreeMap<String, NodeIndex> = BTreeMap::new();

    let mut node = |graph: &mut DiGraph<String, ()>,
                    nodes: &mut BTreeMap<String, NodeIndex>,
                    key: String| {
        *nodes
            .entry(key.clone())
            .or_insert_with(|| graph.add_node(key))
    };

    let all = root.walk();
    for r in &all {
        if r.resource_type() == ResourceType::Function {
            node(&mut graph, &mut nodes, r.fqn());
        }
    }
    for r in &all {
        let container = match (&r.catalog_name, &r.schema_name) {
            (Some(c), Some(s)) => format!("{}.{}", c, s),
            _ => r.fqn(),
        };
        let qualify = |f: &str| {
            if f.contains('.') {
                f.to_string()
            } else {
                format!("{}.{}", container, f)
            }
        };
        if let ResourceKind::Table(ref spec) = r.kind {
            if let Some(ref rf) = spec.row_filter {
                let func = qualify(&rf.function_ref);
                if nodes.contains_key(&func) {
                    let f = node(&mut graph, &mut nodes, func);
                    let t = node(&mut graph, &mut nodes, format!("table:{}", r.fqn()));
                    graph.add_edge(f, t, ());
                }
            }
            for (c, m) in spec.masked_columns() {
                let func = qualify(&m.function_ref);
                if nodes.contains_key(&func) {
                    let f = node(&mut graph, &mut nodes, func);
                    let t = node(&mut graph, &mut nodes, format!("mask:{}.{}", r.fqn(), c.name));
                    graph.add_edge(f, t, ());
                }
            }
        }
        for p in r.effective_abac_policies() {
            let func = qualify(&p.function_ref);
            if nodes.contains_key(&func) {
                let f = node(&mut graph, &mut nodes, func);
                let t = node(&mut graph, &mut nodes, format!("policy:{}@{}", p.name, r.fqn()));
                graph.add_edge(f, t, ());
            }
        }
    }

    let sorted = toposort(&graph, None)
        .map_err(|cycle| format_err!("Policy function graph has a cycle at {:?}", graph[cycle.node_id()]))?;
    Ok(sorted
        .into_iter()
        .map(|ix| graph[ix].clone())
        .filter(|name| !name.contains(':'))
        .collect())
}

fn merge_reports(combined: &mut RunReport, part: RunReport) {
    combined.results.extend(part.results);
    combined.validation.extend(part.validation);
}

#[cfg(test)]
mod tests {
    use super::{policy_function_order, CancelToken, ReconcileOptions};

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn env_toggles_apply() {
        std::env::set_var("BRICKKIT_DRY_RUN", "true");
        std::env::set_var("BRICKKIT_MAX_RETRIES", "7");
        let options = ReconcileOptions::from_env();
        assert!(options.dry_run);
        assert_eq!(options.retry.max_retries, 7);
        std::env::remove_var("BRICKKIT_DRY_RUN");
        std::env::remove_var("BRICKKIT_MAX_RETRIES");
    }

    #[test]
    fn function_order_puts_referenced_functions_first() {
        use brickkit_definitions::resources::{
            Column, FunctionParam, FunctionSpec, RowFilter, TableSpec,
        };
        use brickkit_definitions::{Environment, Resource};
        Environment::force(Environment::Dev);

        let mut filter = FunctionSpec::default();
        filter.return_type = "BOOLEAN".into();
        filter.definition = "region = current_region()".into();
        filter.is_row_filter = true;
        filter.parameters = vec![FunctionParam {
            name: "region".into(),
            data_type: "STRING".into(),
        }];

        let mut spec = TableSpec::default();
        spec.columns = vec![Column {
            name: "region".into(),
            data_type: "STRING".into(),
            nullable: true,
            comment: None,
            mask: None,
        }];
        spec.row_filter = Some(RowFilter {
            function_ref: "region_filter".into(),
            on_columns: vec!["region".into()],
        });

        let mut cat = Resource::catalog("analytics");
        let mut sch = Resource::schema("sales");
        sch.attach_child(Resource::table("orders", spec)).unwrap();
        sch.attach_child(Resource::function("region_filter", filter))
            .unwrap();
        cat.attach_child(sch).unwrap();

        let order = policy_function_order(&cat).unwrap();
        assert_eq!(order, vec!["analytics_dev.sales.region_filter".to_string()]);
    }
}
