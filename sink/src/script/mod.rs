//! The surface exposed to user scripts.
//!
//! A script registers sources and tables through [`ScriptBuilder`], may override runtime
//! options, and supplies callbacks through the [`DispatchFunction`], [`MapFunction`], and
//! [`MergeFunction`] capabilities. Callbacks always run through a [`FunctionInvoker`].

mod api;
mod function;
mod invoke;
mod registry;

pub use api::{ScriptBuilder, SourceProps, TableProps, random_uuid, standard_merge};
pub use function::{DispatchFunction, MapFunction, MergeFunction};
pub use invoke::{FunctionInvoker, FunctionKind};
pub use registry::{Registry, SourceConfig, SourceDestination, TableConfig};
