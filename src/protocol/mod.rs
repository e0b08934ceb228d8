//! Message types exchanged with HTTP clients and published to the broker

pub mod messages;

pub use messages::*;
