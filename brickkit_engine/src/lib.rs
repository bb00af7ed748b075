#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;

extern crate chrono;
extern crate regex;

// graphing policy / function dependencies
extern crate petgraph;

#[macro_use]
extern crate log;

// parallel deploys
extern crate threadpool;

#[macro_use]
extern crate failure;

pub use failure::Error;
pub type Result<T> = std::result::Result<T, Error>;

extern crate brickkit_definitions;
pub use brickkit_definitions::{Convention, Environment, Principal, Resource};
pub use brickkit_definitions::{Compliance, Operation, Severity, ValidationError};
pub use brickkit_definitions::access;
pub use brickkit_definitions::resources;

/// Backend traits, records, errors and the in-memory double
pub mod backend;
pub use backend::{BackendError, CatalogClient, SqlExecutor};

/// Observed state retrieval with caching
pub mod reader;
pub use reader::StateReader;

/// Field level comparison of declared vs observed state
pub mod differ;
pub use differ::{Change, ChangeAction, Diff};

/// Drift classification and reporting
pub mod drift;
pub use drift::DriftReport;

/// SQL statement builders for the warehouse path
pub mod sqlgen;

/// Typed per-resource executors
pub mod executor;
pub use executor::Executor;

/// Ordered, retried, cancellable reconciliation
pub mod reconcile;
pub use reconcile::{CancelToken, ReconcileOptions, Reconciler};

/// Execution results and aggregated run reports
pub mod report;
pub use report::{ExecutionResult, ReconcileResult, RunReport};
