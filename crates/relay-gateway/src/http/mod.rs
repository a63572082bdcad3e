pub mod consolidate;
pub mod conversation;
pub mod health;
pub mod queue_status;
pub mod webhooks;
