//! Client side of the relay connection.
//!
//! - `protocol`: the JSON frames both ends exchange.
//! - `client`: the sans-IO reconnecting state machine.
//! - `driver`: runs the state machine over `tokio-tungstenite`.

pub mod client;
pub mod driver;
pub mod protocol;
