pub mod engine;
pub mod error;
pub mod types;

pub use engine::{run_nudge_checker, DeliveryEngine};
pub use error::{DeliveryError, Result};
pub use types::{DeliveryOptions, DeliveryResult, DeliveryStatus, PendingResponse};
