//! In-memory implementation of both backends
//!
//! Serves tests and offline plan preview: no network, deterministic
//! state, and the same SQL dialect the engine generates. Fault
//! scripts let tests exercise the retry and permission paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use regex::Regex;

use brickkit_definitions::access::{MatchCondition, PolicyType};
use brickkit_definitions::resources::{CreateParams, IsolationMode, ResourceType, UpdateParams};

use super::error::{BackendError, BackendErrorKind, BackendResult};
use super::records::{FunctionDetails, GrantRecord, PolicyRecord, Row, StateRecord, TableDetails};
use super::{CatalogClient, SqlExecutor};

/// A scripted failure: the next `remaining` calls whose
/// `op:target` key contains `needle` fail with `kind`
#[derive(Debug, Clone)]
struct Fault {
    needle: String,
    kind: BackendErrorKind,
    remaining: usize,
}

#[derive(Default)]
struct MemoryState {
    resources: BTreeMap<(ResourceType, String), StateRecord>,
    policies: BTreeMap<String, Vec<PolicyRecord>>,
    functions: BTreeMap<String, FunctionDetails>,
    /// When set, grants to principals outside the set fail
    known_principals: Option<BTreeSet<String>>,
}

/// An in-memory catalog service and sql warehouse
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    faults: Mutex<Vec<Fault>>,
    /// Every sql statement executed, for assertions on ordering
    sql_log: Mutex<Vec<String>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend::new()
    }
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend {
            state: Mutex::new(MemoryState::default()),
            faults: Mutex::new(Vec::new()),
            sql_log: Mutex::new(Vec::new()),
        }
    }

    /// Pre-populate observed state (drift scenarios)
    pub fn seed(&self, record: StateRecord) {
        let mut state = self.state.lock().unwrap();
        state
            .resources
            .insert((record.resource_type, record.fqn.clone()), record);
    }

    pub fn seed_policy(&self, container_fqn: &str, policy: PolicyRecord) {
        let mut state = self.state.lock().unwrap();
        state
            .policies
            .entry(container_fqn.to_string())
            .or_insert_with(Vec::new)
            .push(policy);
    }

    /// Restrict grantable principals; grants outside the set fail
    pub fn set_known_principals(&self, principals: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.known_principals = Some(principals.iter().map(|s| s.to_string()).collect());
    }

    /// Fail the next `times` calls matching `needle` with `kind`
    ///
    /// The needle is matched against `op:target`, e.g.
    /// `create_resource:analytics_dev` or just `execute`.
    pub fn inject_fault(&self, needle: &str, kind: BackendErrorKind, times: usize) {
        self.faults.lock().unwrap().push(Fault {
            needle: needle.into(),
            kind,
            remaining: times,
        });
    }

    /// Test inspection: current record for a resource
    pub fn get(&self, rt: ResourceType, fqn: &str) -> Option<StateRecord> {
        self.state
            .lock()
            .unwrap()
            .resources
            .get(&(rt, fqn.to_string()))
            .cloned()
    }

    /// Test inspection: the full ordered sql statement log
    pub fn sql_statements(&self) -> Vec<String> {
        self.sql_log.lock().unwrap().clone()
    }

    fn check_fault(&self, op: &str, target: &str) -> BackendResult<()> {
        let key = format!("{}:{}", op, target);
        let mut faults = self.faults.lock().unwrap();
        for fault in faults.iter_mut() {
            if fault.remaining > 0 && key.contains(&fault.needle) {
                fault.remaining -= 1;
                debug!("memory backend: injected fault on {}", key);
                return Err(fault.kind.clone().into());
            }
        }
        faults.retain(|f| f.remaining > 0);
        Ok(())
    }
}

fn unquote(part: &str) -> String {
    part.trim_matches('`').replace("``", "`")
}

fn unquote_fqn(quoted: &str) -> String {
    quoted
        .split("`.`")
        .map(unquote)
        .collect::<Vec<_>>()
        .join(".")
}

impl CatalogClient for MemoryBackend {
    fn get_resource(&self, rt: ResourceType, fqn: &str) -> BackendResult<Option<StateRecord>> {
        self.check_fault("get_resource", fqn)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .resources
            .get(&(rt, fqn.to_string()))
            .cloned())
    }

    fn create_resource(&self, params: &CreateParams) -> BackendResult<StateRecord> {
        self.check_fault("create_resource", &params.fqn)?;
        let mut state = self.state.lock().unwrap();
        let key = (params.resource_type, params.fqn.clone());
        if state.resources.contains_key(&key) {
            return Err(BackendErrorKind::Conflict(
                params.fqn.clone(),
                "already exists".into(),
            )
            .into());
        }
        let mut rec = StateRecord::bare(params.resource_type, &params.fqn, &params.name);
        rec.owner = params.owner.clone();
        rec.comment = params.comment.clone();
        rec.storage_location = params.storage_location.clone();
        rec.properties = params.options.clone();
        state.resources.insert(key, rec.clone());
        Ok(rec)
    }

    fn update_resource(&self, params: &UpdateParams) -> BackendResult<StateRecord> {
        self.check_fault("update_resource", &params.fqn)?;
        let mut state = self.state.lock().unwrap();
        let key = (params.resource_type, params.fqn.clone());
        let rec = state
            .resources
            .get_mut(&key)
            .ok_or_else(|| BackendError::not_found(&params.fqn))?;
        for (field, value) in &params.changes {
            match field.as_str() {
                "owner" => rec.owner = value.as_str().map(String::from),
                "comment" => rec.comment = value.as_str().map(String::from),
                "storage_location" => rec.storage_location = value.as_str().map(String::from),
                "workspace_bindings" => {
                    rec.workspace_bindings = serde_json::from_value(value.clone())
                        .map_err(|e| BackendErrorKind::Validation(e.to_string()))?;
                }
                "isolation_mode" => {
                    rec.isolation_mode = serde_json::from_value(value.clone())
                        .map_err(|e| BackendErrorKind::Validation(e.to_string()))?;
                }
                other => {
                    rec.properties.insert(other.to_string(), value.clone());
                }
            }
        }
        Ok(rec.clone())
    }

    fn delete_resource(&self, rt: ResourceType, fqn: &str) -> BackendResult<()> {
        self.check_fault("delete_resource", fqn)?;
        let mut state = self.state.lock().unwrap();
        state
            .resources
            .remove(&(rt, fqn.to_string()))
            .ok_or_else(|| BackendError::not_found(fqn))?;
        Ok(())
    }

    fn list_children(&self, rt: ResourceType, parent_fqn: &str) -> BackendResult<Vec<StateRecord>> {
        self.check_fault("list_children", parent_fqn)?;
        let prefix = format!("{}.", parent_fqn);
        let state = self.state.lock().unwrap();
        Ok(state
            .resources
            .iter()
            .filter(|((t, fqn), _)| {
                *t == rt && fqn.starts_with(&prefix) && !fqn[prefix.len()..].contains('.')
            })
            .map(|(_, rec)| rec.clone())
            .collect())
    }

    fn set_owner(&self, rt: ResourceType, fqn: &str, owner: &str) -> BackendResult<()> {
        self.check_fault("set_owner", fqn)?;
        let mut state = self.state.lock().unwrap();
        let rec = state
            .resources
            .get_mut(&(rt, fqn.to_string()))
            .ok_or_else(|| BackendError::not_found(fqn))?;
        rec.owner = Some(owner.into());
        Ok(())
    }

    fn get_grants(&self, rt: ResourceType, fqn: &str) -> BackendResult<Vec<GrantRecord>> {
        self.check_fault("get_grants", fqn)?;
        let state = self.state.lock().unwrap();
        let rec = state
            .resources
            .get(&(rt, fqn.to_string()))
            .ok_or_else(|| BackendError::not_found(fqn))?;
        Ok(rec.grants.clone())
    }

    fn update_grants(
        &self,
        rt: ResourceType,
        fqn: &str,
        add: &[GrantRecord],
        remove: &[GrantRecord],
    ) -> BackendResult<()> {
        self.check_fault("update_grants", fqn)?;
        let mut state = self.state.lock().unwrap();
        if let Some(ref known) = state.known_principals {
            for g in add {
                if !known.contains(&g.principal) {
                    return Err(BackendErrorKind::Validation(format!(
                        "principal '{}' does not exist",
                        g.principal
                    ))
                    .into());
                }
            }
        }
        let rec = state
            .resources
            .get_mut(&(rt, fqn.to_string()))
            .ok_or_else(|| BackendError::not_found(fqn))?;
        for g in add {
            let entry = rec.grants.iter_mut().find(|e| e.principal == g.principal);
            match entry {
                Some(e) => {
                    for p in &g.privileges {
                        // double grants are a no-op
                        if !e.privileges.contains(p) {
                            e.privileges.push(*p);
                        }
                    }
                    e.privileges.sort();
                }
                None => {
                    let mut rec_new = g.clone();
                    rec_new.privileges.sort();
                    rec.grants.push(rec_new);
                }
            }
        }
        for g in remove {
            if let Some(e) = rec.grants.iter_mut().find(|e| e.principal == g.principal) {
                e.privileges.retain(|p| !g.privileges.contains(p));
            }
        }
        rec.grants.retain(|e| !e.privileges.is_empty());
        Ok(())
    }

    fn get_tags(&self, rt: ResourceType, fqn: &str) -> BackendResult<BTreeMap<String, String>> {
        self.check_fault("get_tags", fqn)?;
        let state = self.state.lock().unwrap();
        let rec = state
            .resources
            .get(&(rt, fqn.to_string()))
            .ok_or_else(|| BackendError::not_found(fqn))?;
        Ok(rec.tags.clone())
    }

    fn set_tags(
        &self,
        rt: ResourceType,
        fqn: &str,
        tags: &BTreeMap<String, String>,
    ) -> BackendResult<()> {
        self.check_fault("set_tags", fqn)?;
        let mut state = self.state.lock().unwrap();
        let rec = state
            .resources
            .get_mut(&(rt, fqn.to_string()))
            .ok_or_else(|| BackendError::not_found(fqn))?;
        for (k, v) in tags {
            rec.tags.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn remove_tags(&self, rt: ResourceType, fqn: &str, keys: &[String]) -> BackendResult<()> {
        self.check_fault("remove_tags", fqn)?;
        let mut state = self.state.lock().unwrap();
        let rec = state
            .resources
            .get_mut(&(rt, fqn.to_string()))
            .ok_or_else(|| BackendError::not_found(fqn))?;
        for k in keys {
            rec.tags.remove(k);
        }
        Ok(())
    }

    fn set_isolation(&self, rt: ResourceType, fqn: &str, mode: IsolationMode) -> BackendResult<()> {
        self.check_fault("set_isolation", fqn)?;
        let mut state = self.state.lock().unwrap();
        let rec = state
            .resources
            .get_mut(&(rt, fqn.to_string()))
            .ok_or_else(|| BackendError::not_found(fqn))?;
        if mode == IsolationMode::Isolated && rec.workspace_bindings.is_empty() {
            return Err(BackendErrorKind::Validation(
                "cannot isolate a container without workspace bindings".into(),
            )
            .into());
        }
        rec.isolation_mode = Some(mode);
        Ok(())
    }

    fn get_bindings(&self, rt: ResourceType, fqn: &str) -> BackendResult<Vec<String>> {
        self.check_fault("get_bindings", fqn)?;
        let state = self.state.lock().unwrap();
        let rec = state
            .resources
            .get(&(rt, fqn.to_string()))
            .ok_or_else(|| BackendError::not_found(fqn))?;
        Ok(rec.workspace_bindings.clone())
    }

    fn update_bindings(&self, rt: ResourceType, fqn: &str, bindings: &[String]) -> BackendResult<()> {
        self.check_fault("update_bindings", fqn)?;
        let mut state = self.state.lock().unwrap();
        let rec = state
            .resources
            .get_mut(&(rt, fqn.to_string()))
            .ok_or_else(|| BackendError::not_found(fqn))?;
        if rec.isolation_mode == Some(IsolationMode::Isolated)
            && bindings.is_empty()
        {
            return Err(BackendErrorKind::Validation(
                "cannot drop all bindings while isolated".into(),
            )
            .into());
        }
        rec.workspace_bindings = bindings.to_vec();
        Ok(())
    }

    fn list_policies(&self, container_fqn: &str) -> BackendResult<Vec<PolicyRecord>> {
        self.check_fault("list_policies", container_fqn)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .policies
            .get(container_fqn)
            .cloned()
            .unwrap_or_default())
    }

    fn create_policy(&self, container_fqn: &str, policy: &PolicyRecord) -> BackendResult<()> {
        self.check_fault("create_policy", container_fqn)?;
        let mut state = self.state.lock().unwrap();
        let list = state
            .policies
            .entry(container_fqn.to_string())
            .or_insert_with(Vec::new);
        if list.iter().any(|p| p.name == policy.name) {
            return Err(
                BackendErrorKind::Conflict(policy.name.clone(), "policy exists".into()).into(),
            );
        }
        if list.len() >= 10 {
            return Err(BackendErrorKind::Conflict(
                container_fqn.into(),
                "more than 10 policies per container".into(),
            )
            .into());
        }
        list.push(policy.clone());
        Ok(())
    }

    fn update_policy(&self, container_fqn: &str, policy: &PolicyRecord) -> BackendResult<()> {
        self.check_fault("update_policy", container_fqn)?;
        let mut state = self.state.lock().unwrap();
        let list = state
            .policies
            .entry(container_fqn.to_string())
            .or_insert_with(Vec::new);
        match list.iter_mut().find(|p| p.name == policy.name) {
            Some(p) => {
                *p = policy.clone();
                Ok(())
            }
            None => Err(BackendError::not_found(&policy.name)),
        }
    }

    fn delete_policy(&self, container_fqn: &str, name: &str) -> BackendResult<()> {
        self.check_fault("delete_policy", container_fqn)?;
        let mut state = self.state.lock().unwrap();
        if let Some(list) = state.policies.get_mut(container_fqn) {
            let before = list.len();
            list.retain(|p| p.name != name);
            if list.len() != before {
                return Ok(());
            }
        }
        Err(BackendError::not_found(name))
    }
}

impl SqlExecutor for MemoryBackend {
    fn execute(&self, sql: &str) -> BackendResult<Vec<Row>> {
        self.check_fault("execute", sql)?;
        self.sql_log.lock().unwrap().push(sql.to_string());
        let trimmed = sql.trim();

        if let Some(caps) = re_create_table().captures(trimmed) {
            let fqn = unquote_fqn(&caps["fqn"]);
            let name = fqn.rsplit('.').next().unwrap_or(&fqn).to_string();
            let columns = parse_columns(&caps["cols"]);
            // table-level clauses live after the column list
            let tail = trimmed
                .split(") USING DELTA")
                .nth(1)
                .unwrap_or_default()
                .to_string();
            let location = Regex::new(r"LOCATION '([^']*)'")
                .unwrap()
                .captures(&tail)
                .map(|c| c[1].replace("''", "'"));
            let comment = Regex::new(r"COMMENT '([^']*)'")
                .unwrap()
                .captures(&tail)
                .map(|c| c[1].replace("''", "'"));
            let mut state = self.state.lock().unwrap();
            let key = (ResourceType::Table, fqn.clone());
            let rec = state
                .resources
                .entry(key)
                .or_insert_with(|| StateRecord::bare(ResourceType::Table, &fqn, &name));
            rec.properties
                .insert("columns".into(), serde_json::json!(columns));
            rec.properties
                .insert("ddl".into(), serde_json::Value::String(trimmed.into()));
            if location.is_some() {
                rec.storage_location = location;
            }
            if comment.is_some() {
                rec.comment = comment;
            }
            return Ok(vec![]);
        }

        if let Some(caps) = re_create_view().captures(trimmed) {
            let fqn = unquote_fqn(&caps["fqn"]);
            let name = fqn.rsplit('.').next().unwrap_or(&fqn).to_string();
            let mut state = self.state.lock().unwrap();
            let mut rec = StateRecord::bare(ResourceType::Table, &fqn, &name);
            rec.properties.insert(
                "view_definition".into(),
                serde_json::Value::String(caps["body"].to_string()),
            );
            state.resources.insert((ResourceType::Table, fqn), rec);
            return Ok(vec![]);
        }

        if let Some(caps) = re_create_function().captures(trimmed) {
            let fqn = unquote_fqn(&caps["fqn"]);
            let name = fqn.rsplit('.').next().unwrap_or(&fqn).to_string();
            let body = caps
                .name("body")
                .or_else(|| caps.name("pybody"))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            let details = FunctionDetails {
                language: if trimmed.contains("LANGUAGE PYTHON") {
                    "PYTHON".into()
                } else {
                    "SQL".into()
                },
                return_type: caps["returns"].trim().to_string(),
                parameters: parse_params(&caps["params"]),
                body,
            };
            let mut state = self.state.lock().unwrap();
            state.functions.insert(fqn.clone(), details);
            state.resources.insert(
                (ResourceType::Function, fqn.clone()),
                StateRecord::bare(ResourceType::Function, &fqn, &name),
            );
            return Ok(vec![]);
        }

        if let Some(caps) = re_set_row_filter().captures(trimmed) {
            let fqn = unquote_fqn(&caps["fqn"]);
            let filter = unquote_fqn(&caps["func"]);
            return self.with_table(&fqn, |rec| rec.row_filter = Some(filter.clone()));
        }

        if let Some(caps) = re_drop_row_filter().captures(trimmed) {
            let fqn = unquote_fqn(&caps["fqn"]);
            return self.with_table(&fqn, |rec| rec.row_filter = None);
        }

        if let Some(caps) = re_set_mask().captures(trimmed) {
            let fqn = unquote_fqn(&caps["fqn"]);
            let column = unquote(&caps["col"]);
            let func = unquote_fqn(&caps["func"]);
            return self.with_table(&fqn, |rec| {
                rec.column_masks.insert(column.clone(), func.clone());
            });
        }

        if let Some(caps) = re_drop_mask().captures(trimmed) {
            let fqn = unquote_fqn(&caps["fqn"]);
            let column = unquote(&caps["col"]);
            return self.with_table(&fqn, |rec| {
                rec.column_masks.remove(&column);
            });
        }

        if let Some(caps) = re_create_policy().captures(trimmed) {
            let container = unquote_fqn(&caps["fqn"]);
            let function_ref = caps
                .name("func_rf")
                .or_else(|| caps.name("func_cm"))
                .map(|m| unquote_fqn(m.as_str()))
                .unwrap_or_default();
            let policy = PolicyRecord {
                name: unquote(&caps["name"]),
                policy_type: if caps.name("col").is_some() {
                    PolicyType::ColumnMask
                } else {
                    PolicyType::RowFilter
                },
                function_ref,
                target_column: caps.name("col").map(|c| unquote(c.as_str())),
                match_conditions: parse_conditions(&caps["conds"]),
            };
            let mut state = self.state.lock().unwrap();
            let list = state
                .policies
                .entry(container)
                .or_insert_with(Vec::new);
            list.retain(|p| p.name != policy.name);
            list.push(policy);
            return Ok(vec![]);
        }

        if let Some(caps) = re_drop_policy().captures(trimmed) {
            let container = unquote_fqn(&caps["fqn"]);
            let name = unquote(&caps["name"]);
            let mut state = self.state.lock().unwrap();
            if let Some(list) = state.policies.get_mut(&container) {
                list.retain(|p| p.name != name);
            }
            return Ok(vec![]);
        }

        if let Some(caps) = re_drop_table().captures(trimmed) {
            let fqn = unquote_fqn(&caps["fqn"]);
            let mut state = self.state.lock().unwrap();
            state.resources.remove(&(ResourceType::Table, fqn));
            return Ok(vec![]);
        }

        if let Some(caps) = re_drop_function().captures(trimmed) {
            let fqn = unquote_fqn(&caps["fqn"]);
            let mut state = self.state.lock().unwrap();
            state.resources.remove(&(ResourceType::Function, fqn.clone()));
            state.functions.remove(&fqn);
            return Ok(vec![]);
        }

        Err(BackendErrorKind::Sql("42601".into(), format!("unsupported statement: {}", trimmed)).into())
    }

    fn describe_table_extended(&self, fqn: &str) -> BackendResult<TableDetails> {
        self.check_fault("describe_table_extended", fqn)?;
        let state = self.state.lock().unwrap();
        let rec = state
            .resources
            .get(&(ResourceType::Table, fqn.to_string()))
            .ok_or_else(|| BackendError::not_found(fqn))?;
        Ok(TableDetails {
            row_filter: rec.row_filter.clone(),
            column_masks: rec.column_masks.clone(),
            properties: BTreeMap::new(),
        })
    }

    fn describe_function(&self, fqn: &str) -> BackendResult<FunctionDetails> {
        self.check_fault("describe_function", fqn)?;
        let state = self.state.lock().unwrap();
        state
            .functions
            .get(fqn)
            .cloned()
            .ok_or_else(|| BackendError::not_found(fqn))
    }
}

impl MemoryBackend {
    fn with_table<F: FnMut(&mut StateRecord)>(&self, fqn: &str, mut f: F) -> BackendResult<Vec<Row>> {
        let mut state = self.state.lock().unwrap();
        let rec = state
            .resources
            .get_mut(&(ResourceType::Table, fqn.to_string()))
            .ok_or_else(|| BackendError::not_found(fqn))?;
        f(rec);
        Ok(vec![])
    }
}

// statement recognizers for the engine's own dialect

fn re_create_table() -> Regex {
    Regex::new(r"^CREATE TABLE IF NOT EXISTS (?P<fqn>[^\s(]+) \((?P<cols>.+)\) USING DELTA").unwrap()
}

fn re_create_view() -> Regex {
    Regex::new(r"^CREATE OR REPLACE VIEW (?P<fqn>\S+) AS (?P<body>.+)$").unwrap()
}

fn re_create_function() -> Regex {
    Regex::new(
        r"(?s)^CREATE OR REPLACE FUNCTION (?P<fqn>\S+) \((?P<params>[^)]*)\) RETURNS (?P<returns>.+?) (?:RETURN (?P<body>.+)|LANGUAGE PYTHON AS \$\$(?P<pybody>.+)\$\$)$",
    )
    .unwrap()
}

fn re_set_row_filter() -> Regex {
    Regex::new(r"^ALTER TABLE (?P<fqn>\S+) SET ROW FILTER (?P<func>\S+) ON \((?P<cols>[^)]*)\)$")
        .unwrap()
}

fn re_drop_row_filter() -> Regex {
    Regex::new(r"^ALTER TABLE (?P<fqn>\S+) DROP ROW FILTER$").unwrap()
}

fn re_set_mask() -> Regex {
    Regex::new(r"^ALTER TABLE (?P<fqn>\S+) ALTER COLUMN (?P<col>\S+) SET MASK (?P<func>\S+)")
        .unwrap()
}

fn re_drop_mask() -> Regex {
    Regex::new(r"^ALTER TABLE (?P<fqn>\S+) ALTER COLUMN (?P<col>\S+) DROP MASK$").unwrap()
}

fn re_create_policy() -> Regex {
    Regex::new(
        r"^CREATE OR REPLACE POLICY (?P<name>\S+) ON (?:SCHEMA|CATALOG) (?P<fqn>\S+) (?:ROW FILTER (?P<func_rf>\S+)|COLUMN MASK (?P<func_cm>\S+) ON COLUMN (?P<col>\S+)) FOR TABLES WHEN (?P<conds>.+)$",
    )
    .unwrap()
}

fn re_drop_policy() -> Regex {
    Regex::new(r"^DROP POLICY IF EXISTS (?P<name>\S+) ON (?:SCHEMA|CATALOG) (?P<fqn>\S+)$").unwrap()
}

fn re_drop_table() -> Regex {
    Regex::new(r"^DROP TABLE IF EXISTS (?P<fqn>\S+)$").unwrap()
}

fn re_drop_function() -> Regex {
    Regex::new(r"^DROP FUNCTION IF EXISTS (?P<fqn>\S+)$").unwrap()
}

fn parse_columns(cols: &str) -> Vec<serde_json::Value> {
    let re = Regex::new(r"`((?:[^`]|``)+)`\s+([A-Za-z0-9_()<>, ]+?)(?: NOT NULL)?(?: COMMENT '[^']*')?(?:, `|$)").unwrap();
    let mut out = Vec::new();
    // walk comma separated column definitions
    for part in split_top_level(cols) {
        if let Some(caps) = re.captures(&part) {
            out.push(serde_json::json!({
                "name": caps[1].replace("``", "`"),
                "data_type": caps[2].trim(),
                "nullable": !part.contains("NOT NULL"),
            }));
        }
    }
    out
}

// split on commas that are not inside quotes or parens
fn split_top_level(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0;
    let mut in_str = false;
    let mut current = String::new();
    for ch in s.chars() {
        match ch {
            '\'' => {
                in_str = !in_str;
                current.push(ch);
            }
            '(' if !in_str => {
                depth += 1;
                current.push(ch);
            }
            ')' if !in_str => {
                depth -= 1;
                current.push(ch);
            }
            ',' if !in_str && depth == 0 => {
                out.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn parse_params(params: &str) -> Vec<(String, String)> {
    split_top_level(params)
        .into_iter()
        .filter_map(|p| {
            let mut it = p.splitn(2, ' ');
            match (it.next(), it.next()) {
                (Some(name), Some(ty)) => Some((unquote(name), ty.trim().to_string())),
                _ => None,
            }
        })
        .collect()
}

fn parse_conditions(conds: &str) -> Vec<MatchCondition> {
    let with_value = Regex::new(r"hasTagValue\('([^']+)', '([^']+)'\)").unwrap();
    let bare = Regex::new(r"hasTag\('([^']+)'\)").unwrap();
    let mut out = Vec::new();
    for part in conds.split(" AND ") {
        if let Some(caps) = with_value.captures(part) {
            out.push(MatchCondition {
                tag_key: caps[1].into(),
                tag_value: Some(caps[2].into()),
            });
        } else if let Some(caps) = bare.captures(part) {
            out.push(MatchCondition {
                tag_key: caps[1].into(),
                tag_value: None,
            });
        }
    }
    out
}
