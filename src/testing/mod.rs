//! Testing utilities and mock implementations
//!
//! Lets the publisher and the HTTP layer be exercised without a RabbitMQ broker.

pub mod mocks;

pub use mocks::*;
