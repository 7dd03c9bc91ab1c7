use thiserror::Error;

/// Errors raised while validating runtime options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The option name is not one of the recognized flags.
    #[error("unknown option `{0}`")]
    UnknownOption(String),
    /// The option value could not be parsed into the option's type.
    #[error("invalid value `{value}` for option `{key}`: {reason}")]
    InvalidOptionValue {
        key: String,
        value: String,
        reason: String,
    },
    /// A parsed value violates a constraint.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
