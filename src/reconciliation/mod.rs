//! Reconciliation ledger and the statement import pipeline

pub mod ledger;
pub mod pipeline;

pub use ledger::*;
pub use pipeline::*;
