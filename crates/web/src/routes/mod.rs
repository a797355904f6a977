//! HTTP handlers, grouped by concern

pub mod devices;
pub mod session;
pub mod signaling;
