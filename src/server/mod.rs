//! Server module
//!
//! HTTP endpoints and the WebSocket session transport.

pub mod connect_info;
pub mod http;
pub mod metrics;
pub mod ws;
