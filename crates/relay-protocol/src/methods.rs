//! Well-known WS method names for the browser chat connection.

pub const CONNECT: &str = "connect";
pub const CHAT_SEND: &str = "chat.send";
pub const CHAT_ABORT: &str = "chat.abort";
pub const QUEUE_STATUS: &str = "queue.status";
