//! Unified error types for the engine.
//!
//! Four kinds, matching the failure taxonomy of the store: a [`UserError`]
//! names a coordinate/dimension/measure the caller referenced that does not
//! exist and is always recoverable (the enclosing `load`/`dice` call aborts,
//! the session continues); a [`SchemaError`] is raised while a [`Space`] is
//! being registered and is fatal for that session; [`Error::Backend`] wraps
//! a storage-layer failure; [`Error::Invariant`] marks an internal
//! consistency violation (a closure-table inconsistency) that should never
//! happen in correct code.
//!
//! [`Space`]: crate::model::space::Space

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A coordinate/dimension/measure referenced by the caller does not exist.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UserError {
    #[error("coordinate {0:?} on dimension '{1}' is unknown")]
    UnknownCoordinate(Vec<String>, String),

    #[error("dimension '{0}' is unknown in space '{1}'")]
    UnknownDimension(String, String),

    #[error("space '{0}' is unknown in this session")]
    UnknownSpace(String),

    #[error("measure '{0}' is unknown in space '{1}'")]
    UnknownMeasure(String, String),

    #[error("level '{0}' is unknown on dimension '{1}'")]
    UnknownLevel(String, String),

    #[error("value {0} has the wrong type for dimension '{1}'")]
    TypeMismatch(String, String),

    #[error("coordinate depth {0} exceeds dimension '{1}' depth {2}")]
    DepthExceeded(usize, String, usize),
}

/// A metaclass-time / schema-construction-time violation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("space '{0}' declares more than one Version dimension")]
    MultipleVersionDimensions(String),

    #[error("unsupported scalar type for dimension/measure '{0}'")]
    UnsupportedScalarType(String),

    #[error("select item of unknown kind: {0}")]
    UnknownSelectItemKind(String),

    #[error("computed measure '{0}' references unknown argument '{1}'")]
    UnknownComputedArgument(String, String),

    #[error("computed measure dependency cycle: {0}")]
    CyclicComputedMeasures(String),

    #[error("dimension '{0}' already declared in space '{1}'")]
    DuplicateDimension(String, String),

    #[error("measure '{0}' already declared in space '{1}'")]
    DuplicateMeasure(String, String),
}

/// The crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    User(#[from] UserError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("backend error: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("session is closed")]
    SessionClosed,
}
