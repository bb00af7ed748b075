/// Privilege enum and per-resource-type validity
pub mod privilege;
pub use self::privilege::Privilege;

/// Grants and time-bounded grants
pub mod grant;
pub use self::grant::Grant;

/// Reusable privilege bundles (READER / WRITER / OWNER_ADMIN)
pub mod policy;
pub use self::policy::AccessPolicy;

/// Access request lifecycle
pub mod request;
pub use self::request::{AccessRequest, RequestStatus};

/// Tag driven row filter / column mask policies
pub mod abac;
pub use self::abac::{AbacPolicy, MatchCondition, PolicyType};
