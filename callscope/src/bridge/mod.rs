//! Delivery of statistics to a frontend
//!
//! - [`protocol`]: versioned wire messages
//! - [`frontend`]: the [`Frontend`] sink trait and a JSON-lines implementation
//! - [`statistics_bridge`]: the analyze + update loop

pub mod frontend;
pub mod protocol;
pub mod statistics_bridge;

pub use frontend::{Frontend, JsonLinesFrontend};
pub use protocol::Message;
pub use statistics_bridge::StatisticsBridge;
