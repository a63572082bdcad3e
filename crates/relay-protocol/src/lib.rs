pub mod frames;
pub mod handshake;
pub mod methods;
pub mod telephony;

pub use frames::{ErrorShape, EventFrame, InboundFrame, ReqFrame, ResFrame, StateVersion};
