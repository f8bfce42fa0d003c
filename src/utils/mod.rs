//! Utility modules

pub mod memory_storage;
pub mod timeout;
pub mod validation;

pub use memory_storage::*;
pub use timeout::*;
pub use validation::*;
