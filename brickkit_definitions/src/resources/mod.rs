use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use crate::access::{AbacPolicy, AccessPolicy, Grant, PolicyType, Privilege};
use crate::convention::Convention;
use crate::environment::Environment;
use crate::principal::Principal;
use crate::Result;

/// Table payloads
pub mod table;
pub use self::table::{Column, ColumnMask, RowFilter, TableSpec, TableType};

/// Volume payloads
pub mod volume;
pub use self::volume::{VolumeSpec, VolumeType};

/// Function payloads
pub mod function;
pub use self::function::{FunctionLanguage, FunctionParam, FunctionSpec};

/// Spaces and vector search payloads
pub mod assistive;
pub use self::assistive::{EndpointType, IndexType, SpaceSpec, VectorEndpointSpec, VectorIndexSpec};

/// Registered model payloads
pub mod model;
pub use self::model::{ModelSpec, ModelStage};

/// Storage credentials, external locations, connections
pub mod infra;
pub use self::infra::{ConnectionSpec, ConnectionType, CredentialSpec, LocationSpec};

/// The closed set of governed resource types
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Metastore,
    Catalog,
    Schema,
    Table,
    Volume,
    Function,
    Space,
    VectorEndpoint,
    VectorIndex,
    Model,
    StorageCredential,
    ExternalLocation,
    Connection,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ResourceType::Metastore => "metastore",
            ResourceType::Catalog => "catalog",
            ResourceType::Schema => "schema",
            ResourceType::Table => "table",
            ResourceType::Volume => "volume",
            ResourceType::Function => "function",
            ResourceType::Space => "space",
            ResourceType::VectorEndpoint => "vector_endpoint",
            ResourceType::VectorIndex => "vector_index",
            ResourceType::Model => "model",
            ResourceType::StorageCredential => "storage_credential",
            ResourceType::ExternalLocation => "external_location",
            ResourceType::Connection => "connection",
        };
        write!(f, "{}", s)
    }
}

impl ResourceType {
    /// Containers hold children and accept isolation / bindings
    pub fn is_container(self) -> bool {
        matches!(
            self,
            ResourceType::Metastore | ResourceType::Catalog | ResourceType::Schema
        )
    }

    /// Top level infrastructure deployed before containers
    pub fn is_infrastructure(self) -> bool {
        matches!(
            self,
            ResourceType::StorageCredential | ResourceType::ExternalLocation | ResourceType::Connection
        )
    }

    /// Whether names of this type get environment suffixes by default
    ///
    /// Top level names (catalogs, infra) carry the suffix so that one
    /// declaration serves dev, acc and prd side by side; nested names
    /// live inside an already-suffixed namespace.
    pub fn default_suffix(self) -> bool {
        matches!(
            self,
            ResourceType::Catalog
                | ResourceType::StorageCredential
                | ResourceType::ExternalLocation
                | ResourceType::Connection
        )
    }

    /// Valid parent types for this type
    pub fn valid_parent(self, parent: ResourceType) -> bool {
        match self {
            ResourceType::Catalog => parent == ResourceType::Metastore,
            ResourceType::Schema => parent == ResourceType::Catalog,
            ResourceType::Table
            | ResourceType::Volume
            | ResourceType::Function
            | ResourceType::Space
            | ResourceType::VectorEndpoint
            | ResourceType::VectorIndex
            | ResourceType::Model => parent == ResourceType::Schema,
            // top level types have no parents
            ResourceType::Metastore
            | ResourceType::StorageCredential
            | ResourceType::ExternalLocation
            | ResourceType::Connection => false,
        }
    }
}

/// Type specific payload of a resource
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Metastore,
    Catalog,
    Schema,
    Table(TableSpec),
    Volume(VolumeSpec),
    Function(FunctionSpec),
    Space(SpaceSpec),
    VectorEndpoint(VectorEndpointSpec),
    VectorIndex(VectorIndexSpec),
    Model(ModelSpec),
    StorageCredential(CredentialSpec),
    ExternalLocation(LocationSpec),
    Connection(ConnectionSpec),
}

impl ResourceKind {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ResourceKind::Metastore => ResourceType::Metastore,
            ResourceKind::Catalog => ResourceType::Catalog,
            ResourceKind::Schema => ResourceType::Schema,
            ResourceKind::Table(_) => ResourceType::Table,
            ResourceKind::Volume(_) => ResourceType::Volume,
            ResourceKind::Function(_) => ResourceType::Function,
            ResourceKind::Space(_) => ResourceType::Space,
            ResourceKind::VectorEndpoint(_) => ResourceType::VectorEndpoint,
            ResourceKind::VectorIndex(_) => ResourceType::VectorIndex,
            ResourceKind::Model(_) => ResourceType::Model,
            ResourceKind::StorageCredential(_) => ResourceType::StorageCredential,
            ResourceKind::ExternalLocation(_) => ResourceType::ExternalLocation,
            ResourceKind::Connection(_) => ResourceType::Connection,
        }
    }
}

/// A governance tag
///
/// ```yaml
/// key: pii
/// value: "true"
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: &str, value: &str) -> Tag {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Cross-workspace visibility of a container
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    Open,
    Isolated,
}

/// Effective values cascaded from ancestors at attach time
///
/// Raw declarations stay immutable; this snapshot is the memo the
/// `effective_*` accessors merge against.
#[derive(Clone, Debug, Default)]
pub struct Inherited {
    pub owner: Option<Principal>,
    pub location: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub grants: Vec<Grant>,
    pub abac_policies: Vec<AbacPolicy>,
}

/// A declared resource in the governance tree
///
/// The unit everything else operates on: conventions fill its
/// defaults, the differ compares it against observed state, executors
/// create / update / govern it. Reference resources (`reference:
/// true`) are governed but never created or dropped.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Resource {
    /// Base name before environment resolution
    pub name: String,

    pub kind: ResourceKind,

    /// Owning principal; inherited from the nearest ancestor if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Principal>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grants: Vec<Grant>,

    /// ABAC policies declared on this container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub abac_policies: Vec<AbacPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_mode: Option<IsolationMode>,

    /// Workspace ids this container is bound to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspace_bindings: Vec<String>,

    /// Storage root; inherited by children that omit theirs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,

    /// Per-type default when unset, see `ResourceType::default_suffix`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_environment_suffix: Option<bool>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_mapping: BTreeMap<Environment, String>,

    /// Externally managed: governed, never created or dropped
    #[serde(default)]
    pub reference: bool,

    /// Resolved catalog name, set by `attach_child`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_name: Option<String>,

    /// Resolved schema name, set by `attach_child`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Resource>,

    #[serde(skip)]
    pub inherited: Inherited,

    #[serde(skip)]
    pub convention: Option<Arc<Convention>>,
}

impl Resource {
    fn new(name: &str, kind: ResourceKind) -> Resource {
        Resource {
            name: name.into(),
            kind,
            owner: None,
            comment: None,
            tags: Vec::new(),
            grants: Vec::new(),
            abac_policies: Vec::new(),
            isolation_mode: None,
            workspace_bindings: Vec::new(),
            storage_location: None,
            add_environment_suffix: None,
            environment_mapping: BTreeMap::new(),
            reference: false,
            catalog_name: None,
            schema_name: None,
            children: Vec::new(),
            inherited: Inherited::default(),
            convention: None,
        }
    }

    pub fn metastore(name: &str) -> Resource {
        Resource::new(name, ResourceKind::Metastore)
    }

    pub fn catalog(name: &str) -> Resource {
        Resource::new(name, ResourceKind::Catalog)
    }

    pub fn schema(name: &str) -> Resource {
        Resource::new(name, ResourceKind::Schema)
    }

    pub fn table(name: &str, spec: TableSpec) -> Resource {
        Resource::new(name, ResourceKind::Table(spec))
    }

    pub fn volume(name: &str, spec: VolumeSpec) -> Resource {
        Resource::new(name, ResourceKind::Volume(spec))
    }

    pub fn function(name: &str, spec: FunctionSpec) -> Resource {
        Resource::new(name, ResourceKind::Function(spec))
    }

    pub fn space(name: &str, spec: SpaceSpec) -> Resource {
        Resource::new(name, ResourceKind::Space(spec))
    }

    pub fn vector_endpoint(name: &str, spec: VectorEndpointSpec) -> Resource {
        Resource::new(name, ResourceKind::VectorEndpoint(spec))
    }

    pub fn vector_index(name: &str, spec: VectorIndexSpec) -> Resource {
        Resource::new(name, ResourceKind::VectorIndex(spec))
    }

    pub fn ml_model(name: &str, spec: ModelSpec) -> Resource {
        Resource::new(name, ResourceKind::Model(spec))
    }

    pub fn storage_credential(name: &str, spec: CredentialSpec) -> Resource {
        Resource::new(name, ResourceKind::StorageCredential(spec))
    }

    pub fn external_location(name: &str, spec: LocationSpec) -> Resource {
        Resource::new(name, ResourceKind::ExternalLocation(spec))
    }

    pub fn connection(name: &str, spec: ConnectionSpec) -> Resource {
        Resource::new(name, ResourceKind::Connection(spec))
    }

    /// A reference to an externally managed resource of the given type
    ///
    /// References carry name, linkage, tags and grants; `create` and
    /// `delete` are refused on them.
    pub fn reference(name: &str, rt: ResourceType) -> Resource {
        let kind = match rt {
            ResourceType::Metastore => ResourceKind::Metastore,
            ResourceType::Catalog => ResourceKind::Catalog,
            ResourceType::Schema => ResourceKind::Schema,
            ResourceType::Table => ResourceKind::Table(TableSpec::default()),
            ResourceType::Volume => ResourceKind::Volume(VolumeSpec::default()),
            ResourceType::Function => ResourceKind::Function(FunctionSpec::default()),
            ResourceType::Space => ResourceKind::Space(SpaceSpec::default()),
            ResourceType::VectorEndpoint => {
                ResourceKind::VectorEndpoint(VectorEndpointSpec::default())
            }
            ResourceType::VectorIndex => ResourceKind::VectorIndex(VectorIndexSpec::default()),
            ResourceType::Model => ResourceKind::Model(ModelSpec::default()),
            ResourceType::StorageCredential => {
                ResourceKind::StorageCredential(CredentialSpec::default())
            }
            ResourceType::ExternalLocation => {
                ResourceKind::ExternalLocation(LocationSpec::default())
            }
            ResourceType::Connection => ResourceKind::Connection(ConnectionSpec {
                connection_type: ConnectionType::Http,
                options: BTreeMap::new(),
            }),
        };
        let mut r = Resource::new(name, kind);
        r.reference = true;
        r
    }

    // ------------------------------------------------------------------
    // builder conveniences
    // ------------------------------------------------------------------

    pub fn with_owner(mut self, owner: Principal) -> Resource {
        self.owner = Some(owner);
        self
    }

    pub fn with_comment(mut self, comment: &str) -> Resource {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Resource {
        self.tags.push(Tag::new(key, value));
        self
    }

    pub fn with_grant(mut self, grant: Grant) -> Resource {
        self.grants.push(grant);
        self
    }

    pub fn with_abac_policy(mut self, policy: AbacPolicy) -> Resource {
        self.abac_policies.push(policy);
        self
    }

    pub fn with_location(mut self, location: &str) -> Resource {
        self.storage_location = Some(location.into());
        self
    }

    pub fn with_isolation(mut self, mode: IsolationMode, bindings: &[&str]) -> Resource {
        self.isolation_mode = Some(mode);
        self.workspace_bindings = bindings.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn without_suffix(mut self) -> Resource {
        self.add_environment_suffix = Some(false);
        self
    }

    pub fn with_mapping(mut self, env: Environment, resolved: &str) -> Resource {
        self.environment_mapping.insert(env, resolved.into());
        self
    }

    // ------------------------------------------------------------------
    // names
    // ------------------------------------------------------------------

    pub fn resource_type(&self) -> ResourceType {
        self.kind.resource_type()
    }

    fn suffix_enabled(&self) -> bool {
        self.add_environment_suffix
            .unwrap_or_else(|| self.resource_type().default_suffix())
    }

    /// Resolve the concrete name for an environment
    ///
    /// Pure function of the declaration and the environment: mapping
    /// wins, then suffixing, then the raw name.
    pub fn resolved_name_in(&self, env: Environment) -> String {
        if let Some(mapped) = self.environment_mapping.get(&env) {
            return mapped.clone();
        }
        if self.suffix_enabled() {
            return format!("{}_{}", self.name, env.suffix());
        }
        self.name.clone()
    }

    pub fn resolved_name(&self) -> String {
        self.resolved_name_in(Environment::current())
    }

    /// Fully qualified, ancestor-resolved dotted name
    ///
    /// The metastore is an attachment point, not a name component:
    /// qualification starts at the catalog, matching the three level
    /// namespace of the catalog service.
    pub fn fqn(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ref c) = self.catalog_name {
            parts.push(c.clone());
        }
        if let Some(ref s) = self.schema_name {
            parts.push(s.clone());
        }
        parts.push(self.resolved_name());
        parts.join(".")
    }

    // ------------------------------------------------------------------
    // tree assembly
    // ------------------------------------------------------------------

    /// Attach a child, fixing up linkage and cascading effective state
    ///
    /// Fails when the child's type is not a valid child of this type.
    /// The child (and its whole subtree) immediately sees merged
    /// owner, location, tags, grants, policies and the convention.
    pub fn attach_child(&mut self, mut child: Resource) -> Result<()> {
        let pt = self.resource_type();
        let ct = child.resource_type();
        if !ct.valid_parent(pt) {
            bail!("A {} cannot be attached under a {}", ct, pt);
        }
        match pt {
            ResourceType::Catalog => {
                child.catalog_name = Some(self.resolved_name());
            }
            ResourceType::Schema => {
                child.catalog_name = self.catalog_name.clone();
                child.schema_name = Some(self.resolved_name());
            }
            _ => {}
        }
        self.cascade_into(&mut child);
        self.children.push(child);
        Ok(())
    }

    /// Set the inherited snapshot on a child subtree from this resource
    pub(crate) fn cascade_into(&self, child: &mut Resource) {
        child.inherited.owner = self.effective_owner();
        child.inherited.location = self.effective_location();
        child.inherited.tags = self.effective_tags();
        child.inherited.grants = self.merged_grants();
        child.inherited.abac_policies = self.effective_abac_policies();
        if let Some(ref conv) = self.convention {
            child.convention = Some(conv.clone());
            conv.fill_defaults(child);
        }
        // grandchildren re-derive from the refreshed child
        let mut grandchildren = std::mem::replace(&mut child.children, Vec::new());
        for gc in &mut grandchildren {
            // linkage may be stale if the subtree was assembled bottom up
            match child.resource_type() {
                ResourceType::Catalog => gc.catalog_name = Some(child.resolved_name()),
                ResourceType::Schema => {
                    gc.catalog_name = child.catalog_name.clone();
                    gc.schema_name = Some(child.resolved_name());
                }
                _ => {}
            }
            child.cascade_into(gc);
        }
        child.children = grandchildren;
    }

    // ------------------------------------------------------------------
    // effective (inherited) state
    // ------------------------------------------------------------------

    /// Declared owner, else the nearest ancestor's
    pub fn effective_owner(&self) -> Option<Principal> {
        self.owner.clone().or_else(|| self.inherited.owner.clone())
    }

    /// Declared location, else the nearest ancestor's
    pub fn effective_location(&self) -> Option<String> {
        self.storage_location
            .clone()
            .or_else(|| self.inherited.location.clone())
    }

    /// Merged tag view: convention defaults, then ancestors, then own
    pub fn effective_tags(&self) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        if let Some(ref conv) = self.convention {
            for (k, v) in conv.default_tags_for(self.resource_type()) {
                merged.insert(k, v);
            }
        }
        for (k, v) in &self.inherited.tags {
            merged.insert(k.clone(), v.clone());
        }
        for t in &self.tags {
            merged.insert(t.key.clone(), t.value.clone());
        }
        merged
    }

    /// Ancestor and own grants merged per principal (no type filter)
    ///
    /// A principal declared on this resource overrides the ancestor
    /// entry for the same principal; everything else unions.
    fn merged_grants(&self) -> Vec<Grant> {
        let mut by_principal: BTreeMap<String, Grant> = BTreeMap::new();
        for g in &self.inherited.grants {
            by_principal.insert(g.principal.resolved(), g.clone());
        }
        for g in &self.grants {
            by_principal.insert(g.principal.resolved(), g.clone());
        }
        by_principal.into_iter().map(|(_, g)| g).collect()
    }

    /// Concrete grants for this resource
    ///
    /// The merged per-principal view, restricted to privileges valid
    /// on this resource type; principals left without any valid
    /// privilege are dropped.
    pub fn effective_grants(&self) -> Vec<Grant> {
        let rt = self.resource_type();
        self.merged_grants()
            .into_iter()
            .filter_map(|mut g| {
                g.privileges = g
                    .privileges
                    .into_iter()
                    .filter(|p| p.valid_on(rt))
                    .collect();
                if g.privileges.is_empty() {
                    None
                } else {
                    Some(g)
                }
            })
            .collect()
    }

    /// Container policies in scope: inherited, own, plus convention templates
    pub fn effective_abac_policies(&self) -> Vec<AbacPolicy> {
        let mut policies = self.inherited.abac_policies.clone();
        policies.extend(self.abac_policies.iter().cloned());
        if let Some(ref conv) = self.convention {
            for template in conv.templates_for(self) {
                if !policies.iter().any(|p| p.name == template.name) {
                    policies.push(template.policy());
                }
            }
        }
        policies
    }

    // ------------------------------------------------------------------
    // access operations
    // ------------------------------------------------------------------

    /// Attach privileges for a principal, deduplicating pairs
    ///
    /// Granting an identical `(principal, privilege)` twice is a no-op.
    pub fn grant(&mut self, principal: Principal, privileges: &[Privilege]) -> Result<()> {
        let rt = self.resource_type();
        for p in privileges {
            if !p.valid_on(rt) {
                bail!("Privilege {} is not valid on a {}", p, rt);
            }
        }
        let who = principal.resolved();
        match self
            .grants
            .iter_mut()
            .find(|g| g.principal.resolved() == who)
        {
            Some(existing) => {
                existing.privileges.extend(privileges.iter().cloned());
            }
            None => self.grants.push(Grant::new(principal, privileges)),
        }
        Ok(())
    }

    /// Grant an access policy, expanded to this resource type
    pub fn grant_policy(&mut self, principal: Principal, policy: &AccessPolicy) -> Result<()> {
        let expanded: Vec<Privilege> = policy.expand(self.resource_type()).into_iter().collect();
        if expanded.is_empty() {
            bail!(
                "Access policy expands to nothing on a {}",
                self.resource_type()
            );
        }
        self.grant(principal, &expanded)
    }

    /// Remove privileges (all of them when none are named)
    pub fn revoke(&mut self, principal: &Principal, privileges: Option<&[Privilege]>) {
        let who = principal.resolved();
        for g in self
            .grants
            .iter_mut()
            .filter(|g| g.principal.resolved() == who)
        {
            match privileges {
                Some(ps) => {
                    for p in ps {
                        g.privileges.remove(p);
                    }
                }
                None => g.privileges.clear(),
            }
        }
        self.grants.retain(|g| !g.privileges.is_empty());
    }

    /// Materialize ancestor grants as concrete grants on descendants
    ///
    /// Reconciliation can then apply or revoke them explicitly instead
    /// of relying on implied cascade. A descendant that declares a
    /// principal keeps its own set for that principal.
    pub fn propagate_grants(&mut self) {
        let merged = self.merged_grants();
        for child in &mut self.children {
            child.inherited.grants = merged.clone();
            child.propagate_grants();
            child.grants = child.effective_grants();
        }
    }

    // ------------------------------------------------------------------
    // iteration
    // ------------------------------------------------------------------

    /// Pre-order walk of this resource and all descendants
    pub fn walk(&self) -> Vec<&Resource> {
        let mut out = Vec::new();
        fn rec<'a>(r: &'a Resource, out: &mut Vec<&'a Resource>) {
            out.push(r);
            for c in &r.children {
                rec(c, out);
            }
        }
        rec(self, &mut out);
        out
    }

    pub fn find(&self, fqn: &str) -> Option<&Resource> {
        self.walk().into_iter().find(|r| r.fqn() == fqn)
    }

    // ------------------------------------------------------------------
    // backend parameter mapping
    // ------------------------------------------------------------------

    /// Minimal record to create this resource at the backend
    ///
    /// Row filters and column masks are deliberately absent: the
    /// backend rejects them at create time and they are applied via
    /// the policy path afterwards. References refuse creation.
    pub fn to_create_params(&self) -> Result<CreateParams> {
        if self.reference {
            bail!(
                "{} {} is a reference to an externally managed resource and cannot be created",
                self.resource_type(),
                self.fqn()
            );
        }
        let mut options = BTreeMap::new();
        match &self.kind {
            ResourceKind::Metastore | ResourceKind::Catalog | ResourceKind::Schema => {}
            ResourceKind::Table(spec) => {
                // strip masks from the column list
                let bare: Vec<Value> = spec
                    .columns
                    .iter()
                    .map(|c| {
                        Ok(serde_json::json!({
                            "name": c.name,
                            "data_type": c.data_type,
                            "nullable": c.nullable,
                            "comment": c.comment,
                        }))
                    })
                    .collect::<Result<_>>()?;
                options.insert("columns".into(), Value::Array(bare));
                options.insert("table_type".into(), serde_json::to_value(spec.table_type)?);
                options.insert("partition_by".into(), serde_json::to_value(&spec.partition_by)?);
                options.insert("properties".into(), serde_json::to_value(&spec.properties)?);
                if let Some(ref v) = spec.view_definition {
                    options.insert("view_definition".into(), Value::String(v.clone()));
                }
            }
            ResourceKind::Volume(spec) => {
                options.insert("volume_type".into(), serde_json::to_value(spec.volume_type)?);
            }
            ResourceKind::Function(spec) => {
                options.insert("function".into(), serde_json::to_value(spec)?);
            }
            ResourceKind::Space(spec) => {
                options.insert("space".into(), serde_json::to_value(spec)?);
            }
            ResourceKind::VectorEndpoint(spec) => {
                options.insert("endpoint_type".into(), serde_json::to_value(spec.endpoint_type)?);
            }
            ResourceKind::VectorIndex(spec) => {
                options.insert("index".into(), serde_json::to_value(spec)?);
            }
            ResourceKind::Model(spec) => {
                options.insert("model".into(), serde_json::to_value(spec)?);
            }
            ResourceKind::StorageCredential(spec) => {
                options.insert("credential".into(), serde_json::to_value(spec)?);
            }
            ResourceKind::ExternalLocation(spec) => {
                options.insert("location".into(), serde_json::to_value(spec)?);
            }
            ResourceKind::Connection(spec) => {
                options.insert("connection".into(), serde_json::to_value(spec)?);
            }
        }
        Ok(CreateParams {
            resource_type: self.resource_type(),
            name: self.resolved_name(),
            fqn: self.fqn(),
            catalog_name: self.catalog_name.clone(),
            schema_name: self.schema_name.clone(),
            owner: self.effective_owner().map(|p| p.resolved()),
            comment: self.comment.clone(),
            storage_location: self.effective_location_for_create(),
            options,
        })
    }

    // Managed tables/volumes inside managed containers take the backend
    // default location; only external ones ship an explicit location.
    fn effective_location_for_create(&self) -> Option<String> {
        match &self.kind {
            ResourceKind::Volume(spec) if spec.volume_type == VolumeType::Managed => None,
            ResourceKind::Table(spec) if spec.table_type == TableType::Managed => None,
            // an external location IS its url
            ResourceKind::ExternalLocation(spec) => Some(spec.url.clone()),
            _ => self.effective_location(),
        }
    }

    /// Minimal record describing only the given changed fields
    pub fn to_update_params(&self, fields: &[String]) -> Result<UpdateParams> {
        let mut changes = BTreeMap::new();
        for field in fields {
            let value: Value = match field.as_str() {
                "owner" => serde_json::to_value(self.effective_owner().map(|p| p.resolved()))?,
                "comment" => serde_json::to_value(&self.comment)?,
                "isolation_mode" => serde_json::to_value(&self.isolation_mode)?,
                "workspace_bindings" => serde_json::to_value(&self.workspace_bindings)?,
                "storage_location" => match &self.kind {
                    ResourceKind::ExternalLocation(spec) => serde_json::to_value(&spec.url)?,
                    _ => serde_json::to_value(self.effective_location())?,
                },
                other => {
                    // type specific properties fall back to the create mapping
                    let params = self.to_create_params()?;
                    match params.options.get(other) {
                        Some(v) => v.clone(),
                        None => bail!(
                            "Field '{}' of {} {} is not updatable",
                            other,
                            self.resource_type(),
                            self.fqn()
                        ),
                    }
                }
            };
            changes.insert(field.clone(), value);
        }
        Ok(UpdateParams {
            resource_type: self.resource_type(),
            fqn: self.fqn(),
            changes,
        })
    }

    // ------------------------------------------------------------------
    // verification
    // ------------------------------------------------------------------

    /// Verify assumptions about the subtree before any backend call
    pub fn verify(&self) -> Result<()> {
        let re = Regex::new(r"^[0-9a-z_]{1,255}$").unwrap();
        if !re.is_match(&self.name) {
            bail!(
                "Please use short lower case names with underscores ('{}' is not)",
                self.name
            );
        }
        if self.name.starts_with('_') || self.name.ends_with('_') {
            bail!("Use underscores to separate words only ('{}')", self.name);
        }
        let rt = self.resource_type();
        for g in &self.grants {
            g.verify(rt)?;
        }
        for p in &self.abac_policies {
            if !rt.is_container() {
                bail!(
                    "ABAC policy {} declared on {} {}; policies attach to catalogs or schemas",
                    p.name,
                    rt,
                    self.fqn()
                );
            }
            p.verify()?;
        }
        if self.isolation_mode == Some(IsolationMode::Isolated) && self.workspace_bindings.is_empty()
        {
            bail!(
                "{} {} is ISOLATED but has no workspace bindings",
                rt,
                self.fqn()
            );
        }
        // payload checks are skipped for references; only governed fields matter
        if !self.reference {
            match &self.kind {
                ResourceKind::Table(spec) => {
                    spec.verify(&self.name)?;
                    self.verify_single_row_filter(spec)?;
                }
                ResourceKind::Volume(spec) => {
                    spec.verify(&self.name, self.effective_location().as_deref())?
                }
                ResourceKind::Function(spec) => spec.verify(&self.name)?,
                ResourceKind::Space(spec) => spec.verify(&self.name)?,
                ResourceKind::VectorIndex(spec) => spec.verify(&self.name)?,
                ResourceKind::Model(spec) => spec.verify(&self.name)?,
                ResourceKind::StorageCredential(spec) => spec.verify(&self.name)?,
                ResourceKind::ExternalLocation(spec) => spec.verify(&self.name)?,
                ResourceKind::Connection(spec) => spec.verify(&self.name)?,
                _ => {}
            }
        }
        // children: linkage, uniqueness, recursion
        let mut seen = Vec::new();
        for c in &self.children {
            if !c.resource_type().valid_parent(rt) {
                bail!("{} {} holds an invalid {} child", rt, self.fqn(), c.resource_type());
            }
            let key = (c.resource_type(), c.resolved_name());
            if seen.contains(&key) {
                bail!("Duplicate {} '{}' under {}", key.0, key.1, self.fqn());
            }
            seen.push(key);
            c.verify()?;
        }
        Ok(())
    }

    /// At most one row filter resolves per table per user: a direct
    /// filter plus a matching container policy is a conflict.
    fn verify_single_row_filter(&self, spec: &TableSpec) -> Result<()> {
        if spec.row_filter.is_none() {
            return Ok(());
        }
        let tags = self.effective_tags();
        for p in self.effective_abac_policies() {
            if p.policy_type == PolicyType::RowFilter && p.matches(&tags) {
                bail!(
                    "Table {} declares a direct row filter and matches ABAC policy {}; only one row filter may resolve",
                    self.fqn(),
                    p.name
                );
            }
        }
        Ok(())
    }
}

/// Minimal backend record for resource creation
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateParams {
    pub resource_type: ResourceType,
    /// Resolved (environment suffixed) name
    pub name: String,
    pub fqn: String,
    pub catalog_name: Option<String>,
    pub schema_name: Option<String>,
    /// Resolved owner principal
    pub owner: Option<String>,
    pub comment: Option<String>,
    pub storage_location: Option<String>,
    /// Type specific payload
    pub options: BTreeMap<String, Value>,
}

/// Minimal backend record for a partial update
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UpdateParams {
    pub resource_type: ResourceType,
    pub fqn: String,
    pub changes: BTreeMap<String, Value>,
}
