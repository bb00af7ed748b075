use std::collections::BTreeMap;

use brickkit_definitions::resources::{CreateParams, IsolationMode, ResourceType, UpdateParams};

/// Error taxonomy shared by both backends
pub mod error;
pub use self::error::{classify_sql, BackendError, BackendErrorKind, BackendResult};

/// Normalized state records
pub mod records;
pub use self::records::{FunctionDetails, GrantRecord, PolicyRecord, Row, StateRecord, TableDetails};

/// In-memory implementation of both backends
pub mod memory;
pub use self::memory::MemoryBackend;

/// The catalog control plane the engine reconciles against
///
/// One abstract interface decoupled from any concrete SDK; operations
/// dispatch on `ResourceType` where the control plane is typed.
/// Implementations must be safe for concurrent use by the worker
/// pool, and must honor their configured per-call timeout (timeouts
/// surface as `BackendErrorKind::Timeout` and re-enter the retry
/// path).
pub trait CatalogClient: Send + Sync {
    /// `Ok(None)` when the backend reports not-found; absence is not
    /// an error at this level
    fn get_resource(&self, rt: ResourceType, fqn: &str) -> BackendResult<Option<StateRecord>>;

    fn create_resource(&self, params: &CreateParams) -> BackendResult<StateRecord>;

    fn update_resource(&self, params: &UpdateParams) -> BackendResult<StateRecord>;

    fn delete_resource(&self, rt: ResourceType, fqn: &str) -> BackendResult<()>;

    fn list_children(&self, rt: ResourceType, parent_fqn: &str) -> BackendResult<Vec<StateRecord>>;

    fn set_owner(&self, rt: ResourceType, fqn: &str, owner: &str) -> BackendResult<()>;

    fn get_grants(&self, rt: ResourceType, fqn: &str) -> BackendResult<Vec<GrantRecord>>;

    /// Apply a grant delta; `add` must be applied before `remove`
    fn update_grants(
        &self,
        rt: ResourceType,
        fqn: &str,
        add: &[GrantRecord],
        remove: &[GrantRecord],
    ) -> BackendResult<()>;

    fn get_tags(&self, rt: ResourceType, fqn: &str) -> BackendResult<BTreeMap<String, String>>;

    fn set_tags(
        &self,
        rt: ResourceType,
        fqn: &str,
        tags: &BTreeMap<String, String>,
    ) -> BackendResult<()>;

    fn remove_tags(&self, rt: ResourceType, fqn: &str, keys: &[String]) -> BackendResult<()>;

    fn set_isolation(&self, rt: ResourceType, fqn: &str, mode: IsolationMode) -> BackendResult<()>;

    fn get_bindings(&self, rt: ResourceType, fqn: &str) -> BackendResult<Vec<String>>;

    fn update_bindings(&self, rt: ResourceType, fqn: &str, bindings: &[String]) -> BackendResult<()>;

    fn list_policies(&self, container_fqn: &str) -> BackendResult<Vec<PolicyRecord>>;

    fn create_policy(&self, container_fqn: &str, policy: &PolicyRecord) -> BackendResult<()>;

    fn update_policy(&self, container_fqn: &str, policy: &PolicyRecord) -> BackendResult<()>;

    fn delete_policy(&self, container_fqn: &str, name: &str) -> BackendResult<()>;
}

/// The sql warehouse side
///
/// Used for everything the control plane cannot express: full table
/// DDL, functions, policies, row filters, column masks, and the
/// extended describes that expose them.
pub trait SqlExecutor: Send + Sync {
    fn execute(&self, sql: &str) -> BackendResult<Vec<Row>>;

    fn describe_table_extended(&self, fqn: &str) -> BackendResult<TableDetails>;

    fn describe_function(&self, fqn: &str) -> BackendResult<FunctionDetails>;
}
