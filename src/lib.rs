//! Realtime channel client for document-processing updates.
//!
//! The crate is organized by layer:
//! - `socket`: websocket transport, channel registry, channels, and callbacks.
//! - `documents`: document-level handle shared across the application.
//! - `retry`: reconnect schedule and timeout utilities.

/// Document-level socket handle and topic helpers.
pub mod documents;
/// Reconnect schedule and timeout helpers.
pub mod retry;
/// Realtime socket, channels, and protocol frames.
pub mod socket;

