//! Resolution of the destination tables of source mutations.

mod dispatcher;

pub use dispatcher::{RoutedMutation, Router};
