//! Two-stage supplier→marketplace inventory synchronization.
//!
//! Stage 1 ([`reconcile`]) sweeps every tracked product of a source against
//! the supplier's live API and flags rows whose derived listing fields
//! changed. Stage 2 ([`submit`]) packages flagged rows into batched feed
//! documents, drives them through the marketplace's asynchronous listing API
//! and resets the flags of every batch that completes.
//!
//! The update flag on the product row is the only coupling between the two
//! stages, so a crash anywhere leaves a consistent store: flagged rows are
//! simply picked up by the next submission run.

pub mod config;
pub mod db;
pub mod feed;
pub mod limiter;
pub mod model;
pub mod reconcile;
pub mod skiplist;
pub mod submit;
pub mod supplier;

pub use model::{RunHooks, SubmissionSummary, SweepSummary};
pub use reconcile::ReconcileEngine;
pub use submit::SubmissionEngine;
