//! fleetlink library
//!
//! A device registry and command dispatcher for remote agents, partitioned
//! by six-digit connection code. Operators and agents hold one WebSocket
//! channel each; commands fan out to online devices and per-device install
//! status is tracked for a fixed window.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod fleet;
pub mod logging;
pub mod protocol;
pub mod server;
