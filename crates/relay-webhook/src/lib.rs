//! Answers synchronous webhooks within a deadline by racing the Response
//! Pipeline against a timer (§4.K).

pub mod race;

pub use race::{race, RaceOutcome, WebhookCoordinator, WebhookReply};
