use std::time::Instant;

use relay_channels::InboundMessage;
use serde::Serialize;

/// A unit of work waiting its turn on the shared worker. Items enqueue in
/// the order they arrive and never jump the global queue — a channel's own
/// messages keep relative order as a side effect of that single ordering.
pub struct QueuedItem {
    pub channel: String,
    pub message: InboundMessage,
    pub preview: String,
    pub enqueued_at: Instant,
}

pub(crate) struct CurrentItem {
    pub channel: String,
    pub preview: String,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentSnapshot {
    pub channel: String,
    pub preview: String,
    pub running_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedSnapshot {
    pub position: usize,
    pub channel: String,
    pub preview: String,
    pub waiting_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub busy: bool,
    pub queue_length: usize,
    pub current: Option<CurrentSnapshot>,
    pub queued: Vec<QueuedSnapshot>,
}

/// Clip a message preview to a fixed character budget for status display.
pub fn preview_of(content: &str) -> String {
    const MAX: usize = 80;
    if content.chars().count() <= MAX {
        content.to_string()
    } else {
        let clipped: String = content.chars().take(MAX).collect();
        format!("{clipped}…")
    }
}
