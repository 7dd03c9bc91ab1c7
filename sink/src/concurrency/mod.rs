//! Concurrency primitives of the apply stage.

pub mod row_lock;
