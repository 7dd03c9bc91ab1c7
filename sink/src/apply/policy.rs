use crate::error::{ErrorKind, SinkError};

/// What to do with a mutation whose processing failed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FailureAction {
    /// Park the mutation in the default dead-letter queue.
    Dlq,
    /// Discard the mutation. Used when it cannot be represented in a queue or a table.
    Drop,
    /// Fail the whole batch and surface the error to the caller.
    Fatal,
}

/// Policy describing how a [`SinkError`] raised for a single mutation is handled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DispositionPolicy {
    action: FailureAction,
    solution: Option<&'static str>,
}

impl DispositionPolicy {
    const fn new(action: FailureAction, solution: Option<&'static str>) -> Self {
        Self { action, solution }
    }

    pub fn action(&self) -> FailureAction {
        self.action
    }

    /// Returns an optional operator-facing solution message.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }
}

/// Builds a [`DispositionPolicy`] from a [`SinkError`] to decide in a unified way what happens
/// to a failed mutation.
pub fn build_disposition_policy(error: &SinkError) -> DispositionPolicy {
    match error.kind() {
        // User code misbehaved. The mutation itself may be fine, so keep it for replay.
        ErrorKind::UserFunctionFailed
        | ErrorKind::UserFunctionTimeout
        | ErrorKind::UserFunctionPanic
        | ErrorKind::MalformedMergeResult => DispositionPolicy::new(
            FailureAction::Dlq,
            Some("Fix the user function and replay the dead-letter queue."),
        ),
        ErrorKind::StaleWrite => DispositionPolicy::new(
            FailureAction::Dlq,
            Some("Another writer keeps modifying the row. Replay the dead-letter queue once it settles."),
        ),

        // Structural errors cannot be represented downstream.
        ErrorKind::InvalidDocument
        | ErrorKind::InvalidData
        | ErrorKind::MissingPrimaryKey
        | ErrorKind::RecursionLimitExceeded
        | ErrorKind::DeserializationError => DispositionPolicy::new(FailureAction::Drop, None),

        // Configuration errors affect every mutation alike.
        ErrorKind::ConfigError
        | ErrorKind::InvalidDuration
        | ErrorKind::InvalidIdentifier
        | ErrorKind::DuplicateRegistration
        | ErrorKind::UnknownColumn
        | ErrorKind::MissingTableSchema
        | ErrorKind::MissingDeleteTarget => DispositionPolicy::new(
            FailureAction::Fatal,
            Some("Update the user script so that it matches the destination schema."),
        ),

        ErrorKind::StoreError => DispositionPolicy::new(
            FailureAction::Fatal,
            Some("Verify the target store is reachable and retry the batch."),
        ),

        _ => DispositionPolicy::new(FailureAction::Fatal, None),
    }
}
