//! The domain model: scalar types, dimensions, measures, spaces, and
//! profiles (§3, §4.2, §4.3, §4.4, §4.5).

pub mod dimension;
pub mod measure;
pub mod profile;
pub mod space;
pub mod types;
