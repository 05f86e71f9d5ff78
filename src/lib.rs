//! minijob: a client-side bulk job-submission front end for a distributed
//! resource manager.
//!
//! The crate turns command templates and input sets into many concrete job
//! specifications, submits them asynchronously, and tracks each job's
//! lifecycle to completion:
//!
//! - [`env`] resolves ordered environment rules into a job environment
//! - [`bulk`] expands input groups and instantiates per-job commands
//! - [`jobspec`] builds the serializable job specification
//! - [`client`] is the manager boundary (remote implementation + trait)
//! - [`submit`] drives submission and per-job event watching
//! - [`progress`] renders live counters while jobs run
//! - [`jobs`] lists jobs, recursing into nested instances

pub mod bulk;
pub mod cli;
pub mod client;
pub mod commands;
pub mod env;
pub mod error;
pub mod idset;
pub mod jobs;
pub mod jobspec;
pub mod progress;
pub mod submit;
pub mod testing;

pub use error::{Error, Result};
