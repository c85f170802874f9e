//! Library surface for `mediawatchd`, split out from the binary so
//! integration tests can drive the core components directly against
//! real temporary directory trees instead of through the CLI.

pub mod config;
pub mod daemonize;
pub mod dircache;
pub mod error;
pub mod eventloop;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod scheduler;
