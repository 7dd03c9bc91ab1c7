//! Error types and result definitions for the sink.
//!
//! [`SinkError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail, an optional source error, and the location where it was raised. Several
//! errors can be aggregated into one, which is how registration reports every problem in a
//! user script at once.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Result type used throughout the sink.
pub type SinkResult<T> = Result<T, SinkError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the sink.
#[derive(Debug, Clone)]
pub struct SinkError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    Many {
        errors: Vec<SinkError>,
        location: &'static Location<'static>,
    },
}

/// Classification of sink errors.
///
/// Kinds are grouped by the layer that raises them. The grouping drives how the engine
/// disposes of the affected mutation, see [`crate::apply::policy`].
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration errors, raised at registration.
    ConfigError,
    InvalidDuration,
    InvalidIdentifier,
    DuplicateRegistration,
    UnknownColumn,
    MissingTableSchema,
    MissingDeleteTarget,

    // Structural errors in documents produced by user functions.
    InvalidDocument,

    // User function failures.
    UserFunctionFailed,
    UserFunctionTimeout,
    UserFunctionPanic,
    MalformedMergeResult,

    // Data errors.
    InvalidData,
    MissingPrimaryKey,
    RecursionLimitExceeded,

    // Concurrency errors.
    StaleWrite,

    // Storage collaborator errors.
    StoreError,

    // Serialization errors.
    SerializationError,
    DeserializationError,

    InvalidState,
    Unknown,
}

impl SinkError {
    /// Returns the [`ErrorKind`] of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the static description, or that of the first aggregated error.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.description.as_ref(),
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.description())
                .unwrap_or("multiple errors"),
        }
    }

    /// Returns the dynamic detail if one was recorded.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the aggregated errors, or a single-element slice for a single error.
    pub fn errors(&self) -> &[SinkError] {
        match self.repr {
            ErrorRepr::Single(_) => std::slice::from_ref(self),
            ErrorRepr::Many { ref errors, .. } => errors,
        }
    }

    /// Returns the captured backtrace for a single error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the callsite where this error was raised.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error, exposed through [`error::Error::source`].
    ///
    /// Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
    ) -> Self {
        SinkError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source: None,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for SinkError {
    fn eq(&self, other: &SinkError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                write!(f, "[{:?}] {}", payload.kind, payload.description)?;
                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, ": {detail}")?;
                }

                let location = payload.location;
                write!(
                    f,
                    " @ {}:{}:{}",
                    location.file(),
                    location.line(),
                    location.column()
                )
            }
            ErrorRepr::Many { errors, .. } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {count} error{} aggregated",
                    if count == 1 { "" } else { "s" }
                )?;
                for (index, error) in errors.iter().enumerate() {
                    write!(f, "\n  {}. {error}", index + 1)?;
                }

                Ok(())
            }
        }
    }
}

impl error::Error for SinkError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Creates a [`SinkError`] from a kind and static description.
impl From<(ErrorKind, &'static str)> for SinkError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> SinkError {
        SinkError::from_components(kind, Cow::Borrowed(desc), None)
    }
}

/// Creates a [`SinkError`] from a kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for SinkError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> SinkError {
        SinkError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()))
    }
}

/// Aggregates several errors. A single error is returned unwrapped.
impl<E> From<Vec<E>> for SinkError
where
    E: Into<SinkError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> SinkError {
        let location = Location::caller();
        let mut errors: Vec<SinkError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        SinkError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<serde_json::Error> for SinkError {
    #[track_caller]
    fn from(err: serde_json::Error) -> SinkError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => {
                (ErrorKind::SerializationError, "JSON I/O operation failed")
            }
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => {
                (ErrorKind::DeserializationError, "JSON deserialization failed")
            }
        };

        let detail = err.to_string();
        SinkError::from_components(kind, Cow::Borrowed(description), Some(Cow::Owned(detail)))
            .with_source(err)
    }
}

impl From<humantime::DurationError> for SinkError {
    #[track_caller]
    fn from(err: humantime::DurationError) -> SinkError {
        let detail = err.to_string();
        SinkError::from_components(
            ErrorKind::InvalidDuration,
            Cow::Borrowed("Duration parsing failed"),
            Some(Cow::Owned(detail)),
        )
        .with_source(err)
    }
}

impl From<config::shared::ValidationError> for SinkError {
    #[track_caller]
    fn from(err: config::shared::ValidationError) -> SinkError {
        let detail = err.to_string();
        SinkError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Invalid runtime option"),
            Some(Cow::Owned(detail)),
        )
        .with_source(err)
    }
}

impl From<tokio::task::JoinError> for SinkError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> SinkError {
        let (kind, description) = if err.is_panic() {
            (ErrorKind::UserFunctionPanic, "User function panicked")
        } else {
            (ErrorKind::InvalidState, "User function task was cancelled")
        };

        let detail = err.to_string();
        SinkError::from_components(kind, Cow::Borrowed(description), Some(Cow::Owned(detail)))
    }
}
