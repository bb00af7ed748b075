//! Field level comparison of declared vs observed state
//!
//! Output is the minimal set of changes that, applied in executor
//! order, brings observed state to declared state. Backend-only
//! fields (ids, timestamps) never enter the comparison.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use brickkit_definitions::resources::{ResourceKind, ResourceType};
use brickkit_definitions::Resource;

use crate::backend::{PolicyRecord, StateRecord};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Add,
    Remove,
    Modify,
}

/// One field level difference
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Change {
    /// Dotted field path, e.g. `tags.pii` or `column_masks.email`
    pub field: String,
    pub declared: Option<Value>,
    pub observed: Option<Value>,
    pub action: ChangeAction,
}

impl Change {
    fn add(field: &str, declared: Value) -> Change {
        Change {
            field: field.into(),
            declared: Some(declared),
            observed: None,
            action: ChangeAction::Add,
        }
    }

    fn remove(field: &str, observed: Value) -> Change {
        Change {
            field: field.into(),
            declared: None,
            observed: Some(observed),
            action: ChangeAction::Remove,
        }
    }

    fn modify(field: &str, declared: Value, observed: Value) -> Change {
        Change {
            field: field.into(),
            declared: Some(declared),
            observed: Some(observed),
            action: ChangeAction::Modify,
        }
    }
}

/// All changes for one resource; empty means compliant
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Diff {
    pub resource_type: ResourceType,
    pub resource_name: String,
    pub changes: Vec<Change>,
}

impl Diff {
    pub fn is_compliant(&self) -> bool {
        self.changes.is_empty()
    }

    /// Whether the resource is absent and must be created
    pub fn needs_create(&self) -> bool {
        self.changes
            .iter()
            .any(|c| c.field == "resource" && c.action == ChangeAction::Add)
    }

    pub fn fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.changes.iter().map(|c| c.field.clone()).collect();
        fields.dedup();
        fields
    }
}

/// Qualify a bare function reference with the resource's container
fn qualify_function(resource: &Resource, func: &str) -> String {
    if func.contains('.') {
        return func.to_string();
    }
    match (&resource.catalog_name, &resource.schema_name) {
        (Some(c), Some(s)) => format!("{}.{}.{}", c, s, func),
        _ => func.to_string(),
    }
}

/// Compare a declared resource against its observed record
///
/// `now` decides which time-bounded grants still count as declared;
/// passing it in keeps the comparison a pure function.
pub fn diff_resource(resource: &Resource, observed: Option<&StateRecord>, now: DateTime<Utc>) -> Diff {
    let rt = resource.resource_type();
    let fqn = resource.fqn();
    let mut changes = Vec::new();

    // an absent resource diffs against an empty record, so the same
    // pass yields the create plus every governed field to apply after
    let empty;
    let observed = match observed {
        Some(o) => o,
        None => {
            if resource.reference {
                // a reference that is absent is a hard problem for the
                // executor, not a create
                changes.push(Change {
                    field: "resource".into(),
                    declared: Some(Value::String(fqn.clone())),
                    observed: None,
                    action: ChangeAction::Modify,
                });
                return Diff {
                    resource_type: rt,
                    resource_name: fqn,
                    changes,
                };
            }
            changes.push(Change::add("resource", Value::String(fqn.clone())));
            empty = StateRecord::bare(rt, &fqn, &resource.resolved_name());
            &empty
        }
    };

    // owner: one modify, only when the declaration resolves one
    if let Some(declared_owner) = resource.effective_owner().map(|p| p.resolved()) {
        if observed.owner.as_deref() != Some(declared_owner.as_str()) {
            changes.push(Change::modify(
                "owner",
                Value::String(declared_owner),
                observed
                    .owner
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            ));
        }
    }

    if let Some(ref comment) = resource.comment {
        if observed.comment.as_deref() != Some(comment.as_str()) {
            changes.push(Change::modify(
                "comment",
                Value::String(comment.clone()),
                observed
                    .comment
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            ));
        }
    }

    diff_tags(resource, observed, &mut changes);
    diff_grants(resource, observed, now, &mut changes);

    if rt.is_container() {
        diff_isolation(resource, observed, &mut changes);
        diff_policies(resource, observed, &mut changes);
    }

    if let ResourceKind::Table(ref spec) = resource.kind {
        // row filter: replacement is an explicit remove + add
        let declared_filter = spec
            .row_filter
            .as_ref()
            .map(|rf| qualify_function(resource, &rf.function_ref));
        match (&declared_filter, &observed.row_filter) {
            (Some(d), None) => changes.push(Change::add("row_filter", Value::String(d.clone()))),
            (None, Some(o)) => changes.push(Change::remove("row_filter", Value::String(o.clone()))),
            (Some(d), Some(o)) if d != o => {
                changes.push(Change::remove("row_filter", Value::String(o.clone())));
                changes.push(Change::add("row_filter", Value::String(d.clone())));
            }
            _ => {}
        }

        // column masks keyed per column
        let declared_masks: BTreeMap<String, String> = spec
            .masked_columns()
            .into_iter()
            .map(|(c, m)| (c.name.clone(), qualify_function(resource, &m.function_ref)))
            .collect();
        for (col, func) in &declared_masks {
            let field = format!("column_masks.{}", col);
            match observed.column_masks.get(col) {
                None => changes.push(Change::add(&field, Value::String(func.clone()))),
                Some(o) if o != func => changes.push(Change::modify(
                    &field,
                    Value::String(func.clone()),
                    Value::String(o.clone()),
                )),
                _ => {}
            }
        }
        if !observed.partial {
            for (col, func) in &observed.column_masks {
                if !declared_masks.contains_key(col) {
                    changes.push(Change::remove(
                        &format!("column_masks.{}", col),
                        Value::String(func.clone()),
                    ));
                }
            }
        }
    }

    if let ResourceKind::Function(ref spec) = resource.kind {
        if let Some(observed_body) = observed
            .properties
            .get("function_body")
            .and_then(|v| v.as_str())
        {
            if observed_body.trim() != spec.definition.trim() {
                changes.push(Change::modify(
                    "function",
                    Value::String(spec.definition.clone()),
                    Value::String(observed_body.to_string()),
                ));
            }
        }
    }

    // external storage only; managed locations belong to the backend
    if let Some(declared_loc) = declared_external_location(resource) {
        if observed.storage_location.as_deref() != Some(declared_loc.as_str()) {
            changes.push(Change::modify(
                "storage_location",
                Value::String(declared_loc),
                observed
                    .storage_location
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            ));
        }
    }

    Diff {
        resource_type: rt,
        resource_name: fqn,
        changes,
    }
}

fn declared_external_location(resource: &Resource) -> Option<String> {
    use brickkit_definitions::resources::{TableType, VolumeType};
    match &resource.kind {
        ResourceKind::Volume(spec) if spec.volume_type == VolumeType::External => {
            resource.effective_location()
        }
        ResourceKind::Table(spec) if spec.table_type == TableType::External => {
            resource.effective_location()
        }
        ResourceKind::ExternalLocation(spec) => Some(spec.url.clone()),
        _ => None,
    }
}

fn diff_tags(resource: &Resource, observed: &StateRecord, changes: &mut Vec<Change>) {
    // effective tags already fold in convention defaults, so a
    // required tag the user never wrote still counts as declared
    let declared = resource.effective_tags();
    for (k, v) in &declared {
        let field = format!("tags.{}", k);
        match observed.tags.get(k) {
            None => changes.push(Change::add(&field, Value::String(v.clone()))),
            Some(o) if o != v => changes.push(Change::modify(
                &field,
                Value::String(v.clone()),
                Value::String(o.clone()),
            )),
            _ => {}
        }
    }
    if !observed.partial {
        for (k, v) in &observed.tags {
            if !declared.contains_key(k) {
                changes.push(Change::remove(&format!("tags.{}", k), Value::String(v.clone())));
            }
        }
    }
}

fn diff_grants(
    resource: &Resource,
    observed: &StateRecord,
    now: DateTime<Utc>,
    changes: &mut Vec<Change>,
) {
    // declared pairs: effective grants minus expired time-bounded ones
    let mut declared: Vec<(String, String)> = Vec::new();
    for g in resource.effective_grants() {
        if g.expired(now) {
            continue;
        }
        for (who, p) in g.pairs() {
            declared.push((who, p.api_name()));
        }
    }
    declared.sort();
    declared.dedup();

    let mut observed_pairs: Vec<(String, String)> = Vec::new();
    for g in &observed.grants {
        for (who, p) in g.pairs() {
            observed_pairs.push((who, p.api_name()));
        }
    }
    observed_pairs.sort();
    observed_pairs.dedup();

    for pair in &declared {
        if !observed_pairs.contains(pair) {
            changes.push(Change::add(
                "grants",
                json!({ "principal": pair.0, "privilege": pair.1 }),
            ));
        }
    }
    if !observed.partial {
        for pair in &observed_pairs {
            if !declared.contains(pair) {
                changes.push(Change::remove(
                    "grants",
                    json!({ "principal": pair.0, "privilege": pair.1 }),
                ));
            }
        }
    }
}

fn diff_isolation(resource: &Resource, observed: &StateRecord, changes: &mut Vec<Change>) {
    if let Some(declared_mode) = resource.isolation_mode {
        if observed.isolation_mode != Some(declared_mode) {
            changes.push(Change::modify(
                "isolation_mode",
                serde_json::to_value(declared_mode).unwrap_or(Value::Null),
                serde_json::to_value(observed.isolation_mode).unwrap_or(Value::Null),
            ));
        }
    }
    if !resource.workspace_bindings.is_empty() || resource.isolation_mode.is_some() {
        let mut declared = resource.workspace_bindings.clone();
        declared.sort();
        let mut observed_b = observed.workspace_bindings.clone();
        observed_b.sort();
        if declared != observed_b {
            changes.push(Change::modify(
                "workspace_bindings",
                json!(declared),
                json!(observed_b),
            ));
        }
    }
}

fn policy_value(p: &PolicyRecord) -> Value {
    serde_json::to_value(p).unwrap_or(Value::Null)
}

fn diff_policies(resource: &Resource, observed: &StateRecord, changes: &mut Vec<Change>) {
    let declared: Vec<PolicyRecord> = resource
        .effective_abac_policies()
        .into_iter()
        // only policies this container owns, not inherited ones
        .filter(|p| {
            resource.abac_policies.iter().any(|own| own.name == p.name)
                || resource
                    .convention
                    .as_ref()
                    .map(|c| c.templates_for(resource).iter().any(|t| t.name == p.name))
                    .unwrap_or(false)
        })
        .map(|p| PolicyRecord {
            name: p.name.clone(),
            policy_type: p.policy_type,
            function_ref: qualify_function_in_container(resource, &p.function_ref),
            target_column: p.target_column.clone(),
            match_conditions: p.match_conditions.clone(),
        })
        .collect();

    for d in &declared {
        let field = format!("policies.{}", d.name);
        match observed.policies.iter().find(|o| o.name == d.name) {
            None => changes.push(Change::add(&field, policy_value(d))),
            Some(o) => {
                let observed_normalized = PolicyRecord {
                    name: o.name.clone(),
                    policy_type: o.policy_type,
                    function_ref: o.function_ref.clone(),
                    target_column: o.target_column.clone(),
                    match_conditions: o.match_conditions.clone(),
                };
                if observed_normalized != *d {
                    changes.push(Change::modify(&field, policy_value(d), policy_value(o)));
                }
            }
        }
    }
    if !observed.partial {
        for o in &observed.policies {
            if !declared.iter().any(|d| d.name == o.name) {
                changes.push(Change::remove(&format!("policies.{}", o.name), policy_value(o)));
            }
        }
    }
}

// policies live on containers: bare function refs resolve inside the
// container itself (schema) or stay as given
fn qualify_function_in_container(container: &Resource, func: &str) -> String {
    if func.contains('.') {
        return func.to_string();
    }
    match container.resource_type() {
        ResourceType::Schema => format!("{}.{}", container.fqn(), func),
        _ => func.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{diff_resource, ChangeAction};
    use crate::backend::{GrantRecord, StateRecord};
    use brickkit_definitions::access::{Grant, Privilege};
    use brickkit_definitions::resources::{Column, ResourceType, TableSpec};
    use brickkit_definitions::{Environment, Principal, Resource};
    use chrono::{Duration, Utc};

    fn table(cols: &[&str]) -> Resource {
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
        Resource::table("orders", spec)
    }

    #[test]
    fn absent_resource_needs_create() {
        Environment::force(Environment::Dev);
        let cat = Resource::catalog("analytics");
        let diff = diff_resource(&cat, None, Utc::now());
        assert!(diff.needs_create());
        assert!(!diff.is_compliant());
    }

    #[test]
    fn matching_state_is_compliant() {
        Environment::force(Environment::Dev);
        let cat = Resource::catalog("analytics");
        let observed = StateRecord::bare(ResourceType::Catalog, "analytics_dev", "analytics_dev");
        let diff = diff_resource(&cat, Some(&observed), Utc::now());
        assert!(diff.is_compliant(), "unexpected changes: {:?}", diff.changes);
    }

    #[test]
    fn tag_value_drift_is_a_modify() {
        Environment::force(Environment::Dev);
        let t = table(&["id"]).with_tag("pii", "false");
        let mut observed = StateRecord::bare(ResourceType::Table, "orders", "orders");
        observed.tags.insert("pii".into(), "true".into());
        let diff = diff_resource(&t, Some(&observed), Utc::now());
        assert_eq!(diff.changes.len(), 1);
        assert_eq!(diff.changes[0].field, "tags.pii");
        assert_eq!(diff.changes[0].action, ChangeAction::Modify);
    }

    #[test]
    fn grant_adds_and_removes() {
        Environment::force(Environment::Dev);
        // declared: alice SELECT+MODIFY, bob SELECT. observed: alice SELECT only.
        let sch = Resource::schema("sales")
            .with_grant(Grant::new(
                Principal::user("alice"),
                &[Privilege::Select, Privilege::Modify],
            ))
            .with_grant(Grant::new(Principal::user("bob"), &[Privilege::Select]));
        let mut observed = StateRecord::bare(ResourceType::Schema, "sales", "sales");
        observed.grants = vec![GrantRecord::new("alice", &[Privilege::Select])];
        let diff = diff_resource(&sch, Some(&observed), Utc::now());
        let adds: Vec<_> = diff
            .changes
            .iter()
            .filter(|c| c.field == "grants" && c.action == ChangeAction::Add)
            .collect();
        let removes: Vec<_> = diff
            .changes
            .iter()
            .filter(|c| c.field == "grants" && c.action == ChangeAction::Remove)
            .collect();
        assert_eq!(adds.len(), 2); // (alice, MODIFY), (bob, SELECT)
        assert!(removes.is_empty());
    }

    #[test]
    fn expired_grants_fall_out_of_declared() {
        Environment::force(Environment::Dev);
        let sch = Resource::schema("sales").with_grant(Grant::time_bound(
            Principal::user("bob"),
            &[Privilege::Select],
            Utc::now() - Duration::hours(1),
        ));
        let mut observed = StateRecord::bare(ResourceType::Schema, "sales", "sales");
        observed.grants = vec![GrantRecord::new("bob", &[Privilege::Select])];
        let diff = diff_resource(&sch, Some(&observed), Utc::now());
        assert_eq!(diff.changes.len(), 1);
        assert_eq!(diff.changes[0].action, ChangeAction::Remove);
    }

    #[test]
    fn row_filter_replacement_is_remove_then_add() {
        Environment::force(Environment::Dev);
        let mut spec = TableSpec::default();
        spec.columns = vec![Column {
            name: "region".into(),
            data_type: "STRING".into(),
            nullable: true,
            comment: None,
            mask: None,
        }];
        spec.row_filter = Some(brickkit_definitions::resources::RowFilter {
            function_ref: "new_filter".into(),
            on_columns: vec!["region".into()],
        });
        let mut t = Resource::table("orders", spec);
        t.catalog_name = Some("c".into());
        t.schema_name = Some("s".into());
        let mut observed = StateRecord::bare(ResourceType::Table, "c.s.orders", "orders");
        observed.row_filter = Some("c.s.old_filter".into());
        let diff = diff_resource(&t, Some(&observed), Utc::now());
        let actions: Vec<ChangeAction> = diff
            .changes
            .iter()
            .filter(|c| c.field == "row_filter")
            .map(|c| c.action)
            .collect();
        assert_eq!(actions, vec![ChangeAction::Remove, ChangeAction::Add]);
    }

    #[test]
    fn partial_records_suppress_removals() {
        Environment::force(Environment::Dev);
        let sch = Resource::schema("sales");
        let mut observed = StateRecord::bare(ResourceType::Schema, "sales", "sales");
        observed.partial = true;
        observed.grants = vec![GrantRecord::new("ghost", &[Privilege::Select])];
        observed.tags.insert("stray".into(), "x".into());
        let diff = diff_resource(&sch, Some(&observed), Utc::now());
        assert!(
            diff.changes.iter().all(|c| c.action != ChangeAction::Remove),
            "partial reads must not produce removals: {:?}",
            diff.changes
        );
    }
}
