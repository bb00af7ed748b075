//! End to end reconciliation against the in-memory backend

use std::sync::Arc;

use chrono::{Duration, Utc};

use brickkit_definitions::access::{
    AbacPolicy, AccessRequest, Grant, MatchCondition, PolicyType, Privilege, RequestStatus,
};
use brickkit_definitions::resources::{Column, FunctionSpec, ResourceType, TableSpec};
use brickkit_definitions::{Convention, Environment, Operation, Principal, Resource};

use brickkit_engine::backend::MemoryBackend;
use brickkit_engine::backend::StateRecord;
use brickkit_engine::reconcile::retry::RetryPolicy;
use brickkit_engine::{ReconcileOptions, Reconciler};

fn options() -> ReconcileOptions {
    let mut options = ReconcileOptions::default();
    options.retry = RetryPolicy::immediate(2);
    options.sequential = true;
    options
}

fn reconciler(backend: &Arc<MemoryBackend>) -> Reconciler {
    Reconciler::new(backend.clone(), backend.clone(), options())
}

fn table_spec(cols: &[&str]) -> TableSpec {
    let mut spec = TableSpec::default();
    spec.columns = cols
        .iter()
        .map(|n| Column {
            name: n.to_string(),
            data_type: "STRING".into(),
            nullable: true,
            comment: None,
            mask: None,
        })
        .collect();
    spec
}

#[test]
fn create_catalog_with_suffix_and_defaults() {
    // S1: fresh catalog picks up the environment suffix, the resolved
    // owner and the convention's default tag; the second run is a no-op
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());

    let conv = Arc::new(
        Convention::new("standard")
            .with_default_tag("managed_by", "brickkit", &[])
            .with_required_tag("data_owner", None, &[ResourceType::Table]),
    );
    let mut cat = Resource::catalog("analytics").with_owner(Principal::group("data_owners"));
    Convention::apply_to(&conv, &mut cat);

    let engine = reconciler(&backend);
    let report = engine.deploy(&cat);
    assert_eq!(report.exit_status(), 0, "{:?}", report.results);

    let record = backend
        .get(ResourceType::Catalog, "analytics_dev")
        .expect("catalog should be created under its resolved name");
    assert_eq!(record.owner.as_deref(), Some("data_owners_dev"));
    assert_eq!(record.tags.get("managed_by").map(String::as_str), Some("brickkit"));

    // diff after: empty
    let drift = engine.detect(&cat).unwrap();
    assert!(!drift.has_drift(), "{:?}", drift);
    assert_eq!(drift.compliant.len(), 1);
}

#[test]
fn convention_violation_blocks_all_backend_calls() {
    // S2: a catalog owned by an individual user fails the enforced
    // ownership rule before anything reaches the backend
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());

    let conv = Arc::new(
        Convention::new("standard").with_rule(
            "catalog_must_have_sp_owner",
            brickkit_definitions::Mode::Enforced,
        ),
    );
    let mut cat = Resource::catalog("analytics").with_owner(Principal::user("alice@example.com"));
    Convention::apply_to(&conv, &mut cat);

    let engine = reconciler(&backend);
    let report = engine.deploy(&cat);

    let violation = report
        .validation
        .iter()
        .find(|v| v.rule == "catalog_must_have_sp_owner")
        .expect("rule must fire");
    assert!(violation.is_enforced());
    assert_eq!(report.exit_status(), 2);
    assert!(report.results.is_empty(), "no resource may be touched");
    assert!(backend.get(ResourceType::Catalog, "analytics_dev").is_none());
}

#[test]
fn grant_reconciliation_adds_without_revoking() {
    // S3: adding privileges for alice and bob never revokes what is
    // already there
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());
    let mut seed = StateRecord::bare(ResourceType::Schema, "sales", "sales");
    seed.grants = vec![brickkit_engine::backend::GrantRecord::new(
        "alice",
        &[Privilege::Select],
    )];
    backend.seed(seed);

    let sch = Resource::schema("sales")
        .with_grant(Grant::new(
            Principal::user("alice"),
            &[Privilege::Select, Privilege::Modify],
        ))
        .with_grant(Grant::new(Principal::user("bob"), &[Privilege::Select]));

    let engine = reconciler(&backend);
    let report = engine.deploy(&sch);
    assert_eq!(report.exit_status(), 0, "{:?}", report.results);

    let record = backend.get(ResourceType::Schema, "sales").unwrap();
    let alice = record.grants.iter().find(|g| g.principal == "alice").unwrap();
    assert!(alice.privileges.contains(&Privilege::Select));
    assert!(alice.privileges.contains(&Privilege::Modify));
    let bob = record.grants.iter().find(|g| g.principal == "bob").unwrap();
    assert_eq!(bob.privileges, vec![Privilege::Select]);

    let drift = engine.detect(&sch).unwrap();
    assert!(!drift.has_drift());
}

#[test]
fn tag_drift_is_detected_classified_and_fixed() {
    // S4: pii drifting from false to true is security critical when
    // the convention says so; apply fixes it; re-detect is compliant
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());

    let conv = Arc::new(
        Convention::new("standard")
            .with_security_tag("pii")
            .with_default_tag("managed_by", "brickkit", &[]),
    );
    let mut cat = Resource::catalog("analytics");
    let mut sch = Resource::schema("sales");
    sch.attach_child(Resource::table("orders", table_spec(&["id"])).with_tag("pii", "false"))
        .unwrap();
    cat.attach_child(sch).unwrap();
    Convention::apply_to(&conv, &mut cat);

    // observed: the whole chain exists and the table's pii tag flipped
    for (rt, fqn) in &[
        (ResourceType::Catalog, "analytics_dev"),
        (ResourceType::Schema, "analytics_dev.sales"),
        (ResourceType::Table, "analytics_dev.sales.orders"),
    ] {
        let name = fqn.rsplit('.').next().unwrap();
        let mut rec = StateRecord::bare(*rt, fqn, name);
        rec.tags.insert("managed_by".into(), "brickkit".into());
        if *rt == ResourceType::Table {
            rec.tags.insert("pii".into(), "true".into());
        }
        backend.seed(rec);
    }

    let engine = reconciler(&backend);
    let drift = engine.detect(&cat).unwrap();
    let entry = drift
        .drifted
        .iter()
        .find(|d| d.fqn == "analytics_dev.sales.orders")
        .expect("table must be reported as drifted");
    assert_eq!(entry.severity, brickkit_definitions::Severity::Critical);

    let report = engine.deploy(&cat);
    assert_eq!(report.exit_status(), 0, "{:?}", report.results);
    let record = backend
        .get(ResourceType::Table, "analytics_dev.sales.orders")
        .unwrap();
    assert_eq!(record.tags.get("pii").map(String::as_str), Some("false"));

    let drift = engine.detect(&cat).unwrap();
    assert!(!drift.has_drift(), "{:?}", drift);
}

#[test]
fn abac_policy_materializes_after_its_function() {
    // S5: the row filter function is ensured first, then the policy;
    // the second reconcile is a no-op
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());

    let mut filter = FunctionSpec::default();
    filter.return_type = "BOOLEAN".into();
    filter.definition = "is_member('pii_readers')".into();
    filter.is_row_filter = true;

    let policy = AbacPolicy {
        name: "hide_pii_rows".into(),
        policy_type: PolicyType::RowFilter,
        function_ref: "pii_row_filter".into(),
        target_principals: vec![],
        except_principals: vec![],
        match_conditions: vec![MatchCondition {
            tag_key: "pii".into(),
            tag_value: Some("true".into()),
        }],
        target_column: None,
    };

    let mut cat = Resource::catalog("prod").without_suffix();
    let mut sch = Resource::schema("customers").with_abac_policy(policy);
    sch.attach_child(Resource::function("pii_row_filter", filter))
        .unwrap();
    cat.attach_child(sch).unwrap();

    let engine = reconciler(&backend);
    let report = engine.deploy(&cat);
    assert_eq!(report.exit_status(), 0, "{:?}", report.results);

    // function exists and the policy references it fully qualified
    assert!(backend
        .get(ResourceType::Function, "prod.customers.pii_row_filter")
        .is_some());
    let policies = {
        use brickkit_engine::backend::CatalogClient;
        backend.list_policies("prod.customers").unwrap()
    };
    assert_eq!(policies.len(), 1);
    assert_eq!(policies[0].function_ref, "prod.customers.pii_row_filter");

    // second run: nothing to do
    let second = engine.deploy(&cat);
    assert_eq!(second.exit_status(), 0);
    assert!(second
        .results
        .iter()
        .all(|r| r.operation == Operation::Skip), "{:?}", second.results);
}

#[test]
fn expired_time_bound_grants_are_revoked() {
    // S6: once the deadline passes the reconciler revokes the grant
    // and the access request transitions to expired
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());
    let mut seed = StateRecord::bare(ResourceType::Schema, "sales", "sales");
    seed.grants = vec![brickkit_engine::backend::GrantRecord::new(
        "bob",
        &[Privilege::Select],
    )];
    backend.seed(seed);

    let sch = Resource::schema("sales").with_grant(Grant::time_bound(
        Principal::user("bob"),
        &[Privilege::Select],
        Utc::now() - Duration::hours(1),
    ));

    let engine = reconciler(&backend);
    let report = engine.deploy(&sch);
    assert_eq!(report.exit_status(), 0, "{:?}", report.results);
    let record = backend.get(ResourceType::Schema, "sales").unwrap();
    assert!(record.grants.is_empty(), "expired grant must be revoked");

    // the paper trail follows
    let mut request = AccessRequest::submit(
        Principal::user("bob"),
        "sales",
        &[Privilege::Select],
        "quarter end",
        Some(Duration::hours(1)),
    );
    request.approve(Principal::user("carol")).unwrap();
    request.expires_at = Some(Utc::now() - Duration::minutes(1));
    let touched = Reconciler::revoke_expired_requests(std::slice::from_mut(&mut request));
    assert_eq!(touched, vec!["sales".to_string()]);
    assert_eq!(request.status, RequestStatus::Expired);
}

#[test]
fn dry_run_plans_everything_and_mutates_nothing() {
    // S7
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());

    let mut cat = Resource::catalog("analytics")
        .with_owner(Principal::group("data_owners"))
        .with_tag("domain", "analytics");
    let mut sch = Resource::schema("sales");
    sch.attach_child(Resource::table("orders", table_spec(&["id"])))
        .unwrap();
    cat.attach_child(sch).unwrap();

    let mut opts = options();
    opts.dry_run = true;
    let engine = Reconciler::new(backend.clone(), backend.clone(), opts);
    let report = engine.deploy(&cat);

    assert!(report
        .results
        .iter()
        .all(|r| r.operation == Operation::DryRun), "{:?}", report.results);
    assert!(backend.get(ResourceType::Catalog, "analytics_dev").is_none());
    assert!(backend
        .get(ResourceType::Table, "analytics_dev.sales.orders")
        .is_none());
    assert!(backend.sql_statements().is_empty());
}

#[test]
fn direct_row_filters_and_masks_go_through_sql() {
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());

    let mut filter = FunctionSpec::default();
    filter.return_type = "BOOLEAN".into();
    filter.definition = "region = current_region()".into();
    filter.is_row_filter = true;

    let mut spec = table_spec(&["id", "region", "email"]);
    spec.row_filter = Some(brickkit_definitions::resources::RowFilter {
        function_ref: "region_filter".into(),
        on_columns: vec!["region".into()],
    });
    spec.columns[2].mask = Some(brickkit_definitions::resources::ColumnMask {
        function_ref: "mask_email".into(),
        using_columns: vec![],
    });

    let mut mask_fn = FunctionSpec::default();
    mask_fn.return_type = "STRING".into();
    mask_fn.definition = "'***'".into();
    mask_fn.is_column_mask = true;

    let mut cat = Resource::catalog("analytics");
    let mut sch = Resource::schema("sales");
    sch.attach_child(Resource::function("region_filter", filter)).unwrap();
    sch.attach_child(Resource::function("mask_email", mask_fn)).unwrap();
    sch.attach_child(Resource::table("orders", spec)).unwrap();
    cat.attach_child(sch).unwrap();

    let engine = reconciler(&backend);
    let report = engine.deploy(&cat);
    assert_eq!(report.exit_status(), 0, "{:?}", report.results);

    let details = {
        use brickkit_engine::backend::SqlExecutor;
        backend
            .describe_table_extended("analytics_dev.sales.orders")
            .unwrap()
    };
    assert_eq!(
        details.row_filter.as_deref(),
        Some("analytics_dev.sales.region_filter")
    );
    assert_eq!(
        details.column_masks.get("email").map(String::as_str),
        Some("analytics_dev.sales.mask_email")
    );

    // functions were created before the filter referenced them
    let statements = backend.sql_statements();
    let fn_pos = statements
        .iter()
        .position(|s| s.contains("CREATE OR REPLACE FUNCTION") && s.contains("region_filter"))
        .expect("filter function DDL missing");
    let rf_pos = statements
        .iter()
        .position(|s| s.contains("SET ROW FILTER"))
        .expect("row filter DDL missing");
    assert!(fn_pos < rf_pos, "function must be created before the filter: {:?}", statements);

    let drift = engine.detect(&cat).unwrap();
    assert!(!drift.has_drift(), "{:?}", drift);
}

#[test]
fn transient_failures_retry_and_recover() {
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());
    backend.inject_fault(
        "create_resource:analytics_dev",
        brickkit_engine::backend::BackendErrorKind::Transient("rate limited".into()),
        2,
    );

    let cat = Resource::catalog("analytics");
    let engine = reconciler(&backend);
    let report = engine.deploy(&cat);
    assert_eq!(report.exit_status(), 0, "{:?}", report.results);
    assert!(backend.get(ResourceType::Catalog, "analytics_dev").is_some());
}

#[test]
fn permission_denied_is_terminal_per_resource() {
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());
    backend.inject_fault(
        "create_resource:analytics_dev",
        brickkit_engine::backend::BackendErrorKind::PermissionDenied("analytics_dev".into()),
        10,
    );

    let mut cat = Resource::catalog("analytics");
    cat.attach_child(Resource::schema("sales")).unwrap();
    let engine = reconciler(&backend);
    let report = engine.deploy(&cat);

    assert_eq!(report.exit_status(), 2);
    let failed = report
        .results
        .iter()
        .find(|r| r.resource_name == "analytics_dev")
        .unwrap();
    assert!(!failed.success);
    assert_eq!(failed.operation, Operation::Error);
}

#[test]
fn unmanaged_resources_are_reported_not_mutated() {
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(StateRecord::bare(ResourceType::Catalog, "analytics_dev", "analytics_dev"));
    backend.seed(StateRecord::bare(
        ResourceType::Schema,
        "analytics_dev.sales",
        "sales",
    ));
    // present in the backend, absent from the declaration
    backend.seed(StateRecord::bare(
        ResourceType::Schema,
        "analytics_dev.scratch",
        "scratch",
    ));

    let mut cat = Resource::catalog("analytics");
    cat.attach_child(Resource::schema("sales")).unwrap();

    let engine = reconciler(&backend);
    let drift = engine.detect(&cat).unwrap();
    assert_eq!(drift.unmanaged, vec!["analytics_dev.scratch".to_string()]);

    // deploy leaves the unmanaged schema alone without allow_delete
    engine.deploy(&cat);
    assert!(backend.get(ResourceType::Schema, "analytics_dev.scratch").is_some());
}

#[test]
fn allow_delete_drops_unmanaged_children() {
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(StateRecord::bare(ResourceType::Catalog, "analytics_dev", "analytics_dev"));
    backend.seed(StateRecord::bare(
        ResourceType::Schema,
        "analytics_dev.scratch",
        "scratch",
    ));

    let cat = Resource::catalog("analytics");
    let mut opts = options();
    opts.allow_delete = true;
    let engine = Reconciler::new(backend.clone(), backend.clone(), opts);
    let report = engine.deploy(&cat);
    assert_eq!(report.exit_status(), 0, "{:?}", report.results);

    let deleted = report
        .results
        .iter()
        .find(|r| r.operation == Operation::Delete)
        .expect("a delete must be recorded");
    assert_eq!(deleted.resource_name, "analytics_dev.scratch");
    assert!(backend.get(ResourceType::Schema, "analytics_dev.scratch").is_none());
}

#[test]
fn cancellation_marks_unreached_resources() {
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());
    let mut cat = Resource::catalog("analytics");
    cat.attach_child(Resource::schema("sales")).unwrap();

    let engine = reconciler(&backend);
    engine.cancel_token().cancel();
    let report = engine.deploy(&cat);
    assert!(report
        .results
        .iter()
        .all(|r| r.operation == Operation::NotAttempted), "{:?}", report.results);
}

#[test]
fn batch_deploys_cover_independent_roots() {
    Environment::force(Environment::Dev);
    let backend = Arc::new(MemoryBackend::new());

    let mut opts = options();
    opts.sequential = false;
    opts.workers = 2;
    let engine = Reconciler::new(backend.clone(), backend.clone(), opts);

    let roots = vec![
        Resource::catalog("analytics"),
        Resource::catalog("finance"),
    ];
    let report = engine.deploy_all(roots);
    assert_eq!(report.exit_status(), 0, "{:?}", report.results);
    assert!(backend.get(ResourceType::Catalog, "analytics_dev").is_some());
    assert!(backend.get(ResourceType::Catalog, "finance_dev").is_some());
}
