pub mod consolidator;
pub mod error;

pub use consolidator::{Consolidator, ConsolidationReport};
pub use error::{ConsolidatorError, Result};
