//! Channel collaboration spaces: durable channel records, their message
//! logs, external platform bridges, and the inbound bridge handler that ties
//! them together (spec.md §4.7).

pub mod bridge;
pub mod inbound;
pub mod messages;
pub mod store;

pub use bridge::{Bridge, BridgeStore};
pub use inbound::InboundBridge;
pub use messages::{ChannelMessage, ChannelMessageStore};
pub use store::{Channel, ChannelStore};
