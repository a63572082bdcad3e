pub mod approval;
pub mod error;
pub mod extractor;

pub use approval::{run_sweeper, ApprovalStore, PendingAction, TransportHandle, DEFAULT_TTL};
pub use error::{PostprocessError, Result};
pub use extractor::{extract, Confirmation, DoneIntent, ExtractionResult, FindingIntent, GoalIntent, MemoryIntent};
