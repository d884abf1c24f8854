//! Rule and endpoint definitions: document model, compilation, and the
//! active snapshot
//!
//! Documents (`model`) are what operators author; `compile` turns them into
//! immutable definitions with ahead-of-time compiled programs; `loader`
//! discovers documents across the configured sources; `snapshot` assembles
//! the active endpoint set with quarantine semantics and powers hot reload.

pub mod compile;
pub mod loader;
pub mod model;
pub mod snapshot;

pub use compile::{EndpointDefinition, RuleDefinition};
pub use snapshot::{EndpointSnapshot, SkippedDefinition};
