//! # Reconciliation Core
//!
//! A bank-statement reconciliation engine: statement import, multi-factor
//! matching against installments, payables and ledger entries, automation
//! rules and advisory anomaly detection.
//!
//! ## Features
//!
//! - **Statement import**: OFX and CSV parsing with skip-and-count for malformed rows
//! - **Matching**: value/date/text scoring and greedy one-to-one assignment
//! - **Automation rules**: first-match substring rules that ignore or book entries
//! - **Anomaly detection**: duplicate, partial, grouped and overpayment flags
//! - **Reconciliation ledger**: status state machine with undo and aggregate drift correction
//! - **Storage abstraction**: database-agnostic design with trait-based storage
//!
//! ## Quick Start
//!
//! ```rust
//! use reconciliation_core::{utils::MemoryStorage, ReconConfig, ReconciliationPipeline};
//!
//! # async fn run() -> reconciliation_core::ReconResult<()> {
//! let mut pipeline = ReconciliationPipeline::new(MemoryStorage::new(), ReconConfig::default());
//! pipeline.seed_default_rules("acme").await?;
//!
//! let csv = "10/06/2024;PIX MARIA SOUZA;500,00\n11/06/2024;TARIFA;-9,90\n";
//! let report = pipeline.import(csv.as_bytes(), "june.csv", "acme").await?;
//! assert_eq!(report.preview.accepted, 2);
//! # Ok(())
//! # }
//! ```

pub mod anomaly;
pub mod config;
pub mod matching;
pub mod reconciliation;
pub mod rules;
pub mod statement;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use anomaly::AnomalyDetector;
pub use config::*;
pub use matching::*;
pub use reconciliation::*;
pub use rules::*;
pub use statement::{parse_statement, ImportPreview, ParsedStatement, StatementFormat, StatementMetadata};
pub use traits::*;
pub use types::*;
