//! Realtime channel modules.
//!
//! - `client`: websocket transport, connection state, and reconnect handling.
//! - `registry`: topic to channel map shared with the dispatch loop.
//! - `channel`: per-topic join lifecycle and push/reply correlation.
//! - `callbacks`: optional handler slots supplied per subscription.
//! - `proto`: wire frames shared with the channel server.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Subscriber-facing callback slots.
pub mod callbacks;
/// Topic subscription handle.
pub mod channel;
/// Websocket connection, options, and errors.
pub mod client;
/// Channel wire frames.
pub mod proto;
/// Topic to channel registry.
pub mod registry;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
