//! Mutation application and conflict resolution for a change-data-capture sink.
//!
//! Source mutations are routed to destination tables, mapped into rows, filtered by deadlines,
//! and reconciled against the current target rows before the [`apply::Engine`] decides whether
//! each one is applied, dead-lettered, or dropped.

pub mod apply;
pub mod concurrency;
pub mod conversions;
pub mod deadline;
pub mod error;
mod macros;
pub mod mapping;
pub mod merge;
pub mod metrics;
pub mod routing;
pub mod script;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
