//! Agentdeck Protocol
//!
//! Shared types for communication between the agentdeck gateway and its
//! browser clients. These types are serialized as JSON over WebSocket and
//! over the sibling HTTP surface.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::{ClientFrame, CommandOptions};
pub use server::ServerFrame;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
