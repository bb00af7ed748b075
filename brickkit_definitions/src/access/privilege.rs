use std::fmt;
use std::str::FromStr;

use crate::resources::ResourceType;
use crate::Error;

/// A single grantable privilege
///
/// Every privilege is only valid on a constrained set of resource
/// types; `valid_on` encodes the matrix and grant validation rejects
/// anything outside it before a backend call is made.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Privilege {
    // data access
    Select,
    Modify,
    Browse,
    ReadVolume,
    WriteVolume,
    ReadFiles,
    Execute,

    // container usage
    UseCatalog,
    UseSchema,

    // creation
    CreateCatalog,
    CreateSchema,
    CreateTable,
    CreateVolume,
    CreateFunction,
    CreateModel,
    CreateExternalTable,

    // governance
    ApplyTag,
    Manage,
    AllPrivileges,
    IsOwner,

    // object level ACLs on compute-adjacent assets
    CanRead,
    CanRun,
    CanManage,
    CanView,
    CanRestart,
    CanEdit,
    CanUse,
    CanBind,
    CanAttachTo,
    CanCreate,
}

impl Privilege {
    /// Whether this privilege may be granted on a resource type
    ///
    /// Container grants for data privileges are allowed since they
    /// cascade down the hierarchy.
    pub fn valid_on(self, rt: ResourceType) -> bool {
        use self::Privilege::*;
        use crate::resources::ResourceType::*;
        match self {
            Select | Modify | ApplyTag => matches!(rt, Catalog | Schema | Table),
            Browse => matches!(rt, Catalog | Schema | Table | Volume | Model),
            ReadVolume | WriteVolume => matches!(rt, Catalog | Schema | Volume),
            ReadFiles => matches!(rt, ExternalLocation | Volume),
            Execute => matches!(rt, Catalog | Schema | Function | Model),
            UseCatalog => matches!(rt, Catalog),
            UseSchema => matches!(rt, Catalog | Schema),
            CreateCatalog => matches!(rt, Metastore),
            CreateSchema => matches!(rt, Catalog),
            CreateTable | CreateVolume | CreateFunction | CreateModel => {
                matches!(rt, Catalog | Schema)
            }
            CreateExternalTable => matches!(rt, ExternalLocation | StorageCredential),
            Manage | IsOwner => true,
            AllPrivileges => matches!(
                rt,
                Catalog | Schema | Table | Volume | Function | ExternalLocation
                    | StorageCredential | Connection
            ),
            CanRead => matches!(rt, Space | VectorIndex),
            CanRun | CanView | CanEdit => matches!(rt, Space),
            CanManage => matches!(rt, Space | VectorEndpoint | VectorIndex | Model),
            CanRestart => matches!(rt, VectorEndpoint),
            CanUse => matches!(rt, Connection | VectorEndpoint),
            CanBind => matches!(rt, StorageCredential | Connection),
            CanAttachTo => matches!(rt, VectorEndpoint),
            CanCreate => matches!(rt, Metastore),
        }
    }

    /// Render for GRANT / REVOKE statements
    pub fn as_sql(self) -> &'static str {
        use self::Privilege::*;
        match self {
            Select => "SELECT",
            Modify => "MODIFY",
            Browse => "BROWSE",
            ReadVolume => "READ VOLUME",
            WriteVolume => "WRITE VOLUME",
            ReadFiles => "READ FILES",
            Execute => "EXECUTE",
            UseCatalog => "USE CATALOG",
            UseSchema => "USE SCHEMA",
            CreateCatalog => "CREATE CATALOG",
            CreateSchema => "CREATE SCHEMA",
            CreateTable => "CREATE TABLE",
            CreateVolume => "CREATE VOLUME",
            CreateFunction => "CREATE FUNCTION",
            CreateModel => "CREATE MODEL",
            CreateExternalTable => "CREATE EXTERNAL TABLE",
            ApplyTag => "APPLY TAG",
            Manage => "MANAGE",
            AllPrivileges => "ALL PRIVILEGES",
            IsOwner => "IS OWNER",
            CanRead => "CAN_READ",
            CanRun => "CAN_RUN",
            CanManage => "CAN_MANAGE",
            CanView => "CAN_VIEW",
            CanRestart => "CAN_RESTART",
            CanEdit => "CAN_EDIT",
            CanUse => "CAN_USE",
            CanBind => "CAN_BIND",
            CanAttachTo => "CAN_ATTACH_TO",
            CanCreate => "CAN_CREATE",
        }
    }

    /// The canonical API spelling, e.g. `USE_CATALOG`
    pub fn api_name(self) -> String {
        self.as_sql().replace(' ', "_")
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.api_name())
    }
}

impl FromStr for Privilege {
    type Err = Error;

    fn from_str(s: &str) -> Result<Privilege, Error> {
        use self::Privilege::*;
        let norm = s.trim().to_uppercase().replace(' ', "_");
        let p = match norm.as_str() {
            "SELECT" => Select,
            "MODIFY" => Modify,
            "BROWSE" => Browse,
            "READ_VOLUME" => ReadVolume,
            "WRITE_VOLUME" => WriteVolume,
            "READ_FILES" => ReadFiles,
            "EXECUTE" => Execute,
            "USE_CATALOG" => UseCatalog,
            "USE_SCHEMA" => UseSchema,
            "CREATE_CATALOG" => CreateCatalog,
            "CREATE_SCHEMA" => CreateSchema,
            "CREATE_TABLE" => CreateTable,
            "CREATE_VOLUME" => CreateVolume,
            "CREATE_FUNCTION" => CreateFunction,
            "CREATE_MODEL" => CreateModel,
            "CREATE_EXTERNAL_TABLE" => CreateExternalTable,
            "APPLY_TAG" => ApplyTag,
            "MANAGE" => Manage,
            "ALL_PRIVILEGES" => AllPrivileges,
            "IS_OWNER" => IsOwner,
            "CAN_READ" => CanRead,
            "CAN_RUN" => CanRun,
            "CAN_MANAGE" => CanManage,
            "CAN_VIEW" => CanView,
            "CAN_RESTART" => CanRestart,
            "CAN_EDIT" => CanEdit,
            "CAN_USE" => CanUse,
            "CAN_BIND" => CanBind,
            "CAN_ATTACH_TO" => CanAttachTo,
            "CAN_CREATE" => CanCreate,
            _ => bail!("Unknown privilege '{}'", s),
        };
        Ok(p)
    }
}
