//! Phonly You signaling relay library.
//!
//! Exposes the relay server for use in tests and embedding.
//! The relay accepts WebSocket connections, tracks which channel each
//! connection has joined, and fans signaling messages out to the other
//! members of that channel.

pub mod config;
pub mod registry;
pub mod relay;
