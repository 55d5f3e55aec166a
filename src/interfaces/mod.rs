//! Delivery mechanisms. The WebSocket endpoint is the only one.

pub mod ws;
