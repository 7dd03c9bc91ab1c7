//! The storage collaborator receiving the outcome of every mutation.

mod base;
pub mod memory;

pub use base::{
    DlqEntry, ExpectedVersion, RowVersion, RowWrite, StoredRow, TargetStore, WriteOutcome,
};
