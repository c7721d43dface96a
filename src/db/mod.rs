//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed row structs and view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `omd_sync::db`; the repository API and
//! commonly used models are re-exported for convenience.

pub mod model;
pub mod repo;

pub use model::{DerivedFields, FlaggedRow, ProductRecord};
pub use repo::*;
