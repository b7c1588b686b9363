//! Channel adapters and the relay loop for allochory
//!
//! This crate provides the pub/sub seam ([`PubSubChannel`]), an in-process
//! channel for local runs and tests, an Ably adapter (REST plus a realtime
//! presence link), the presence roster, and the relay that drives the
//! dispatcher from channel traffic.

pub mod ably;
pub mod channel;
pub mod local;
pub mod presence;
pub mod realtime;
pub mod relay;

pub use ably::AblyChannel;
pub use channel::{PubSubChannel, publish_payload};
pub use local::{LocalChannel, LocalHub};
pub use presence::Roster;
pub use relay::{Relay, RelayEvent, RelayOptions};
