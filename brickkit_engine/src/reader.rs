//! Observed state retrieval
//!
//! Normalizes whatever the control plane and the warehouse expose
//! into `StateRecord`s the differ can compare. Absence is not an
//! error; denied sub-reads mark the record partial.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use brickkit_definitions::resources::{ResourceKind, ResourceType};
use brickkit_definitions::Resource;

use crate::backend::{BackendResult, CatalogClient, SqlExecutor, StateRecord};
use crate::reconcile::retry::{self, RetryPolicy};
use crate::reconcile::CancelToken;
use crate::Result;

// One cell per fqn; fetching holds the cell lock so at most one
// worker reads a given resource from the backend at a time.
type CacheCell = Arc<Mutex<Option<Option<StateRecord>>>>;

/// Cached, singleflight-guarded reader over both backends
pub struct StateReader {
    client: Arc<dyn CatalogClient>,
    sql: Arc<dyn SqlExecutor>,
    retry: RetryPolicy,
    cache: Mutex<BTreeMap<String, CacheCell>>,
}

impl StateReader {
    pub fn new(client: Arc<dyn CatalogClient>, sql: Arc<dyn SqlExecutor>) -> StateReader {
        StateReader::with_retry(client, sql, RetryPolicy::from_env())
    }

    pub fn with_retry(
        client: Arc<dyn CatalogClient>,
        sql: Arc<dyn SqlExecutor>,
        retry: RetryPolicy,
    ) -> StateReader {
        StateReader {
            client,
            sql,
            retry,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Observed state for a declared resource; `None` when absent
    pub fn read(&self, resource: &Resource) -> Result<Option<StateRecord>> {
        self.read_with_cancel(resource, None)
    }

    pub fn read_with_cancel(
        &self,
        resource: &Resource,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<StateRecord>> {
        let fqn = resource.fqn();
        let cell = {
            let mut cache = self.cache.lock().unwrap();
            cache
                .entry(fqn.clone())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };
        let mut slot = cell.lock().unwrap();
        if let Some(ref cached) = *slot {
            trace!("reader cache hit for {}", fqn);
            return Ok(cached.clone());
        }
        let fetched = self.fetch(resource, cancel)?;
        *slot = Some(fetched.clone());
        Ok(fetched)
    }

    /// Drop a cached record after an executor mutates the resource
    pub fn invalidate(&self, fqn: &str) {
        self.cache.lock().unwrap().remove(fqn);
    }

    /// Bulk shallow listing of a container's children of one type
    ///
    /// Serves drift detection: anything observed here but not
    /// declared is unmanaged.
    pub fn read_children(
        &self,
        container: &Resource,
        child_type: ResourceType,
    ) -> Result<Vec<StateRecord>> {
        let fqn = container.fqn();
        let records = retry::call(&self.retry, None, &format!("list {} in {}", child_type, fqn), || {
            self.client.list_children(child_type, &fqn)
        })?;
        Ok(records)
    }

    fn fetch(&self, resource: &Resource, cancel: Option<&CancelToken>) -> Result<Option<StateRecord>> {
        let rt = resource.resource_type();
        let fqn = resource.fqn();
        debug!("reading observed state of {} {}", rt, fqn);

        let base = retry::call(&self.retry, cancel, &format!("get {}", fqn), || {
            self.client.get_resource(rt, &fqn)
        })?;
        let mut record = match base {
            Some(r) => r,
            None => return Ok(None),
        };

        // grants and tags come from their own endpoints; a denied
        // sub-read degrades to a partial record instead of failing
        match self.sub_read(cancel, &format!("grants of {}", fqn), || {
            self.client.get_grants(rt, &fqn)
        })? {
            Some(grants) => record.grants = grants,
            None => record.partial = true,
        }
        match self.sub_read(cancel, &format!("tags of {}", fqn), || {
            self.client.get_tags(rt, &fqn)
        })? {
            Some(tags) => record.tags = tags,
            None => record.partial = true,
        }

        if rt.is_container() && rt != ResourceType::Metastore {
            match self.sub_read(cancel, &format!("policies of {}", fqn), || {
                self.client.list_policies(&fqn)
            })? {
                Some(policies) => record.policies = policies,
                None => record.partial = true,
            }
            match self.sub_read(cancel, &format!("bindings of {}", fqn), || {
                self.client.get_bindings(rt, &fqn)
            })? {
                Some(bindings) => record.workspace_bindings = bindings,
                None => record.partial = true,
            }
        }

        // fields only the warehouse exposes
        match resource.kind {
            ResourceKind::Table(_) => {
                match self.sub_read(cancel, &format!("describe {}", fqn), || {
                    self.sql.describe_table_extended(&fqn)
                })? {
                    Some(details) => {
                        record.row_filter = details.row_filter;
                        record.column_masks = details.column_masks;
                        for (k, v) in details.properties {
                            record
                                .properties
                                .insert(k, serde_json::Value::String(v));
                        }
                    }
                    None => record.partial = true,
                }
            }
            ResourceKind::Function(_) => {
                match self.sub_read(cancel, &format!("describe function {}", fqn), || {
                    self.sql.describe_function(&fqn)
                })? {
                    Some(details) => {
                        record.properties.insert(
                            "function_body".into(),
                            serde_json::Value::String(details.body),
                        );
                        record.properties.insert(
                            "function_return_type".into(),
                            serde_json::Value::String(details.return_type),
                        );
                    }
                    None => record.partial = true,
                }
            }
            _ => {}
        }

        Ok(Some(record))
    }

    // A sub-read that tolerates not-found (Ok(Some(default)) would be
    // wrong: absence of the detail endpoint keeps the base record) and
    // degrades permission-denied to `None` = partial.
    fn sub_read<T, F>(
        &self,
        cancel: Option<&CancelToken>,
        what: &str,
        f: F,
    ) -> Result<Option<T>>
    where
        T: Default,
        F: Fn() -> BackendResult<T>,
    {
        match retry::call(&self.retry, cancel, what, || f()) {
            Ok(v) => Ok(Some(v)),
            Err(ref e) if e.is_not_found() => Ok(Some(T::default())),
            Err(ref e) if e.is_permission_denied() => {
                warn!("{}: {} (marking record partial)", what, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
