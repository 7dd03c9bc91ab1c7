//! The mutation-application engine.
//!
//! [`Engine`] drives a batch through routing, column mapping, deadlines and the CAS merge
//! engine, and decides the disposition of every mutation. Failures confined to a single
//! mutation are disposed of according to [`policy::build_disposition_policy`].

mod engine;
mod outcome;
pub mod policy;

pub use engine::Engine;
pub use outcome::{Disposition, DropReason, MutationOutcome};
