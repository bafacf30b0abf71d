//! `marketplace-recon`: sales-to-payments reconciliation engine.
//!
//! Pure engine crate: receives already-fetched sale and payment rows, returns
//! a ranked discrepancy report. No database, network or CLI dependencies.

pub mod config;
pub mod engine;
pub mod error;
pub mod evaluate;
pub mod ingest;
pub mod matcher;
pub mod model;
pub mod normalize;
pub mod report;

pub use config::ReconConfig;
pub use engine::{reconcile, reconcile_with_cancel, CancelToken};
pub use error::ReconError;
pub use model::{Alert, Discrepancy, RawRow, ReconciliationReport};
