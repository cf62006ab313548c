//! Transport layer implementations
//!
//! This module contains transport-level implementations for various protocols.

pub mod websocket;

// Re-exports
pub use websocket::*;
