//! Shared protocol definitions for the Phonly You signaling wire format.

pub mod signal;
