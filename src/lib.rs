//! # Menger
//!
//! An embedded multi-dimensional analytics engine: a compact OLAP ("cube")
//! store that accepts streams of fact records, maintains hierarchical
//! dimension trees, and answers slice/dice/drill queries with aggregated
//! measures.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Space (schema)                       │
//! │      ordered Dimensions + ordered Measures                │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [load / dice / delete / snapshot]
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Backend trait                       │
//! │   dimension tables, closure tables, fact tables,          │
//! │   profile tables                                          │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  SqliteBackend (rusqlite)                │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`Context`] binds a single session to a backend and owns the
//! per-dimension caches; [`model::profile::ProfileTable`] sits in front of
//! [`model::space::Space::dice`] as an adaptive materialized-view cache.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod model;

pub use context::Context;
pub use error::{Error, Result, SchemaError, UserError};

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::backend::{sqlite::SqliteBackend, Backend, LoadType};
    pub use crate::context::Context;
    pub use crate::error::{Error, Result, SchemaError, UserError};
    pub use crate::model::dimension::{Atom, Clause, Coord, DimensionDef, DimensionKind, Filter};
    pub use crate::model::measure::{Computed, Measure, MeasureKind};
    pub use crate::model::space::{Cell, DimFmt, LevelSpec, LoadPoint, MsrFmt, SampleField, SelectItem, Space};
    pub use crate::model::types::ScalarType;
}
