//! Core scalar types shared by dimensions and measures.

use serde::{Deserialize, Serialize};

/// The scalar type of a dimension node's name, or of a stored measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    String,
    Int,
    Float,
}

impl ScalarType {
    /// The SQLite storage class used for this scalar type's column.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ScalarType::String => "TEXT",
            ScalarType::Int => "INTEGER",
            ScalarType::Float => "REAL",
        }
    }
}

/// How `Backend::load` reconciles an incoming row with an existing one (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    /// Overwrite differing values; skip an all-zero insert; delete on an
    /// all-zero update.
    Default,
    /// Add incoming values to the existing row element-wise; insert if
    /// absent. Delete if the result is all-zero.
    Increment,
    /// Skip the row entirely if it already exists.
    CreateOnly,
}
