pub mod dispatcher;
pub mod error;
pub mod types;

pub use dispatcher::{Dispatcher, DispatcherSettings, TurnFuture, TurnHandler};
pub use error::{DispatchError, Result};
pub use types::{CurrentSnapshot, QueueStatus, QueuedItem, QueuedSnapshot};
