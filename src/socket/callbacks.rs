//! Per-subscription callback slots.
//!
//! Every slot is optional. An event whose slot is empty is dropped without
//! error, so subscribers only register what they care about:
//!
//! ```rust
//! use doclive_sdk::socket::callbacks::ChannelCallbacks;
//!
//! let callbacks = ChannelCallbacks::new()
//!     .on_join(|response| println!("joined: {response}"))
//!     .on_status_update(|status| println!("status: {status}"));
//! ```

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Callback receiving a server payload verbatim.
pub type PayloadCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback fired once when a channel closes.
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Handlers invoked on channel lifecycle and data events.
///
/// Handlers run on the connection's dispatch task, in frame arrival order.
/// They should return quickly; spawn a task for heavy work.
#[derive(Clone, Default)]
pub struct ChannelCallbacks {
    pub(crate) on_join: Option<PayloadCallback>,
    pub(crate) on_error: Option<PayloadCallback>,
    pub(crate) on_close: Option<CloseCallback>,
    pub(crate) on_document_update: Option<PayloadCallback>,
    pub(crate) on_status_update: Option<PayloadCallback>,
}

impl fmt::Debug for ChannelCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCallbacks")
            .field("on_join", &self.on_join.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_document_update", &self.on_document_update.is_some())
            .field("on_status_update", &self.on_status_update.is_some())
            .finish()
    }
}

impl ChannelCallbacks {
    /// Creates an empty callback set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the server's join response once the channel is joined.
    pub fn on_join(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_join = Some(Arc::new(f));
        self
    }

    /// Called with the rejection payload when the join is declined, or with
    /// the error payload when the channel or its transport fails.
    pub fn on_error(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called once when the channel closes, for any reason.
    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    /// Called for each `document_updated` push.
    pub fn on_document_update(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_document_update = Some(Arc::new(f));
        self
    }

    /// Called for each `status_updated` push.
    pub fn on_status_update(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_status_update = Some(Arc::new(f));
        self
    }

    pub(crate) fn emit_join(&self, response: Value) {
        if let Some(cb) = &self.on_join {
            cb(response);
        }
    }

    pub(crate) fn emit_error(&self, payload: Value) {
        if let Some(cb) = &self.on_error {
            cb(payload);
        }
    }

    pub(crate) fn emit_close(&self) {
        if let Some(cb) = &self.on_close {
            cb();
        }
    }

    pub(crate) fn emit_document_update(&self, payload: Value) {
        if let Some(cb) = &self.on_document_update {
            cb(payload);
        }
    }

    pub(crate) fn emit_status_update(&self, payload: Value) {
        if let Some(cb) = &self.on_status_update {
            cb(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::ChannelCallbacks;

    #[test]
    fn empty_slots_drop_events() {
        let callbacks = ChannelCallbacks::new();
        callbacks.emit_join(json!({}));
        callbacks.emit_error(json!({"reason": "x"}));
        callbacks.emit_close();
        callbacks.emit_document_update(json!({}));
        callbacks.emit_status_update(json!({}));
    }

    #[test]
    fn registered_slots_receive_payloads() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callbacks = ChannelCallbacks::new()
            .on_status_update({
                let seen = Arc::clone(&seen);
                move |payload| seen.lock().expect("lock").push(("status", payload))
            })
            .on_document_update({
                let seen = Arc::clone(&seen);
                move |payload| seen.lock().expect("lock").push(("document", payload))
            });

        callbacks.emit_status_update(json!({"progress": 50}));
        callbacks.emit_document_update(json!({"id": 42}));

        let seen = seen.lock().expect("lock");
        assert_eq!(
            *seen,
            vec![
                ("status", json!({"progress": 50})),
                ("document", json!({"id": 42})),
            ]
        );
    }

    #[test]
    fn debug_reports_registered_slots() {
        let callbacks = ChannelCallbacks::new().on_close(|| {});
        let rendered = format!("{callbacks:?}");
        assert!(rendered.contains("on_close: true"));
        assert!(rendered.contains("on_join: false"));
    }
}
