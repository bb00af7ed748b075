#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;

#[macro_use]
extern crate log;

extern crate chrono;
extern crate regex;
extern crate uuid;

#[macro_use]
extern crate failure;

pub use failure::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Process wide environment tag (dev / acc / prd)
pub mod environment;
pub use environment::Environment;

/// Users, groups and service principals with environment resolution
pub mod principal;
pub use principal::{Principal, PrincipalType};

/// Privileges, grants, access policies, access requests and ABAC
pub mod access;
pub use access::{AbacPolicy, AccessPolicy, AccessRequest, Grant, Privilege};

/// The governed resource tree
pub mod resources;
pub use resources::{Resource, ResourceKind, ResourceType, Tag};

/// Conventions: defaults, required tags, naming and ownership rules
pub mod convention;
pub use convention::Convention;

/// Shared operation / severity / compliance enums
pub mod states;
pub use states::{Compliance, Mode, Operation, Severity, ValidationError};
