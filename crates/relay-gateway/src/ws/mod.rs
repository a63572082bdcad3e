pub mod channel;
pub mod connection;
pub mod handshake;
pub mod telephony;
