//! Transaction-to-candidate matching

pub mod auto_matcher;
pub mod scorer;

pub use auto_matcher::*;
pub use scorer::*;
