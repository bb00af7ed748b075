use std::collections::{BTreeMap, BTreeSet};

use super::Privilege;
use crate::resources::ResourceType;

/// A named, reusable privilege bundle
///
/// Policies expand to concrete privilege sets per resource type, so a
/// single `READER` grant on a catalog yields `USE_CATALOG` there and
/// `SELECT` on the tables it cascades to.
///
/// ```yaml
/// policy: reader
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessPolicy {
    /// Read-only access: usage, browse, select, read, execute
    Reader,
    /// Reader plus modify / write / create
    Writer,
    /// Full administrative control
    OwnerAdmin,
    /// A hand-tuned bundle
    Custom(BTreeMap<ResourceType, BTreeSet<Privilege>>),
}

impl AccessPolicy {
    /// Expand to the concrete privileges for one resource type
    ///
    /// The result is filtered through `Privilege::valid_on`, so a
    /// policy can never produce an invalid grant.
    pub fn expand(&self, rt: ResourceType) -> BTreeSet<Privilege> {
        use crate::access::Privilege::*;
        let wanted: Vec<Privilege> = match self {
            AccessPolicy::Reader => match rt {
                ResourceType::Catalog => vec![UseCatalog, UseSchema, Browse, Select],
                ResourceType::Schema => vec![UseSchema, Browse, Select],
                ResourceType::Table => vec![Select, Browse],
                ResourceType::Volume => vec![ReadVolume, Browse],
                ResourceType::Function => vec![Execute],
                ResourceType::Model => vec![Execute, Browse],
                ResourceType::Space => vec![CanRead, CanView],
                ResourceType::VectorEndpoint => vec![CanUse],
                ResourceType::VectorIndex => vec![CanRead],
                ResourceType::ExternalLocation => vec![ReadFiles],
                ResourceType::Connection => vec![CanUse],
                _ => vec![],
            },
            AccessPolicy::Writer => {
                let mut v: Vec<Privilege> = AccessPolicy::Reader.expand(rt).into_iter().collect();
                v.extend(match rt {
                    ResourceType::Catalog => vec![Modify, CreateSchema, CreateTable, ApplyTag],
                    ResourceType::Schema => {
                        vec![Modify, CreateTable, CreateVolume, CreateFunction, ApplyTag]
                    }
                    ResourceType::Table => vec![Modify, ApplyTag],
                    ResourceType::Volume => vec![WriteVolume],
                    ResourceType::Space => vec![CanRun, CanEdit],
                    ResourceType::Model => vec![CanManage],
                    _ => vec![],
                });
                v
            }
            AccessPolicy::OwnerAdmin => {
                let mut v = vec![Manage];
                if AllPrivileges.valid_on(rt) {
                    v.push(AllPrivileges);
                }
                if CanManage.valid_on(rt) {
                    v.push(CanManage);
                }
                v
            }
            AccessPolicy::Custom(map) => map
                .get(&rt)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default(),
        };
        wanted.into_iter().filter(|p| p.valid_on(rt)).collect()
    }
}
