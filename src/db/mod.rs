//! Database module: view models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by repository listing queries.
//! - `repo`: SQL-only functions mapping rows into the domain types of
//!   `crate::model` (drafts, staging entries, published entries).
//!
//! The synchronizer is the only writer of staging rows while it runs; callers
//! outside of it should limit themselves to drafts and `commit_draft`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::StagingSummary;
