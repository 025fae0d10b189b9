//! A single topic subscription multiplexed over the shared socket.
//!
//! Lifecycle: `Joining -> Joined | Errored`, then `Closed`. A channel never
//! rejoins in place; recovering from `Errored` or `Closed` means subscribing
//! again, which creates a new channel with a new join ref.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::retry::with_timeout;
use crate::socket::callbacks::ChannelCallbacks;
use crate::socket::client::{FrameSender, SocketError};
use crate::socket::lock;
use crate::socket::proto::{
    Frame, RefCounter, EVENT_CLOSE, EVENT_DOCUMENT_UPDATED, EVENT_ERROR, EVENT_REPLY,
    EVENT_STATUS_UPDATED,
};

/// Join state of a channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Joining,
    Joined,
    Errored,
    Closed,
}

type ReplySender = oneshot::Sender<Result<Value, SocketError>>;

/// Cloneable handle to a topic subscription.
///
/// Clones share state; two handles are the same channel when
/// [`Channel::same_channel`] is true.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    topic: String,
    join_ref: String,
    callbacks: ChannelCallbacks,
    outbound: FrameSender,
    refs: RefCounter,
    push_timeout: Option<Duration>,
    dispatch: DispatchGate,
    core: Mutex<ChannelCore>,
}

struct ChannelCore {
    state: ChannelState,
    pending: HashMap<String, ReplySender>,
    // pushes issued before the join was acknowledged
    buffered: Vec<Frame>,
    join_rejection: Option<Value>,
}

/// Serializes callback delivery for one channel.
///
/// Held from the state check through the callback, so `close` on another
/// thread cannot slip `on_close` in ahead of an event that was already
/// accepted. Re-entrant for the delivering thread, so a callback may close
/// its own channel.
#[derive(Default)]
struct DispatchGate {
    held: Mutex<()>,
    owner: Mutex<Option<ThreadId>>,
}

struct DispatchGuard<'a> {
    gate: &'a DispatchGate,
    _held: MutexGuard<'a, ()>,
}

impl DispatchGate {
    /// Returns `None` when the current thread is already delivering.
    fn enter(&self) -> Option<DispatchGuard<'_>> {
        let current = thread::current().id();
        if *lock(&self.owner) == Some(current) {
            return None;
        }
        let held = lock(&self.held);
        *lock(&self.owner) = Some(current);
        Some(DispatchGuard { gate: self, _held: held })
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.gate.owner) = None;
    }
}

/// What the dispatcher must do after a frame was applied under the lock.
enum Dispatch {
    Nothing,
    Joined(Value),
    JoinRejected(Value),
    DocumentUpdate(Value),
    StatusUpdate(Value),
    Close(Option<Value>),
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.inner.topic)
            .field("join_ref", &self.inner.join_ref)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        topic: String,
        callbacks: ChannelCallbacks,
        outbound: FrameSender,
        refs: RefCounter,
        push_timeout: Option<Duration>,
    ) -> Self {
        let join_ref = refs.next();
        Self {
            inner: Arc::new(ChannelInner {
                topic,
                join_ref,
                callbacks,
                outbound,
                refs,
                push_timeout,
                dispatch: DispatchGate::default(),
                core: Mutex::new(ChannelCore {
                    state: ChannelState::Joining,
                    pending: HashMap::new(),
                    buffered: Vec::new(),
                    join_rejection: None,
                }),
            }),
        }
    }

    /// Topic this channel is subscribed to.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Ref of this channel's join request.
    pub fn join_ref(&self) -> &str {
        &self.inner.join_ref
    }

    /// Current join state.
    pub fn state(&self) -> ChannelState {
        lock(&self.inner.core).state
    }

    /// Returns true when both handles refer to the same channel instance.
    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of pushes still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.core).pending.len()
    }

    /// Sends the join request for this channel.
    pub(crate) fn join(&self, payload: Value) {
        debug!(event = "channel_join_sent", topic = %self.inner.topic, join_ref = %self.inner.join_ref);
        let frame = Frame::join(&self.inner.topic, &self.inner.join_ref, payload);
        if self.inner.outbound.send(frame).is_err() {
            debug!(event = "channel_join_dropped", topic = %self.inner.topic);
        }
    }

    /// Pushes `event` with `payload` and waits for the correlated reply.
    ///
    /// Resolves with the reply payload on `ok`, fails with
    /// [`SocketError::RequestRejected`] on `error`, and with
    /// [`SocketError::ChannelClosed`] when the channel closes first. Pushes
    /// made while the join is in flight are sent once it is acknowledged.
    pub async fn push(&self, event: &str, payload: Value) -> Result<Value, SocketError> {
        let (msg_ref, reply_rx) = self.enqueue_push(event, payload)?;

        let settled = match self.inner.push_timeout {
            Some(limit) => match with_timeout(limit, reply_rx).await {
                Ok(settled) => settled,
                Err(_) => {
                    self.abandon(&msg_ref);
                    warn!(
                        event = "channel_push_timed_out",
                        topic = %self.inner.topic,
                        msg_ref = %msg_ref,
                        timeout_ms = limit.as_millis() as u64
                    );
                    return Err(SocketError::RequestTimeout(limit));
                }
            },
            None => reply_rx.await,
        };

        settled.unwrap_or(Err(SocketError::ChannelClosed))
    }

    fn enqueue_push(
        &self,
        event: &str,
        payload: Value,
    ) -> Result<(String, oneshot::Receiver<Result<Value, SocketError>>), SocketError> {
        let mut core = lock(&self.inner.core);
        match core.state {
            ChannelState::Closed => return Err(SocketError::ChannelClosed),
            ChannelState::Errored => {
                let rejection = core.join_rejection.clone().unwrap_or(Value::Null);
                return Err(SocketError::JoinRejected(rejection));
            }
            ChannelState::Joining | ChannelState::Joined => {}
        }

        let msg_ref = self.inner.refs.next();
        let frame = Frame::push(
            &self.inner.topic,
            &self.inner.join_ref,
            msg_ref.clone(),
            event,
            payload,
        );
        let (reply_tx, reply_rx) = oneshot::channel();
        core.pending.insert(msg_ref.clone(), reply_tx);

        if core.state == ChannelState::Joining {
            trace!(event = "channel_push_buffered", topic = %self.inner.topic, msg_ref = %msg_ref);
            core.buffered.push(frame);
        } else if self.inner.outbound.send(frame).is_err() {
            core.pending.remove(&msg_ref);
            return Err(SocketError::NotConnected);
        }

        Ok((msg_ref, reply_rx))
    }

    fn abandon(&self, msg_ref: &str) {
        let mut core = lock(&self.inner.core);
        core.pending.remove(msg_ref);
        core.buffered
            .retain(|frame| frame.msg_ref.as_deref() != Some(msg_ref));
    }

    /// Applies an inbound frame addressed to this channel's topic.
    ///
    /// Returns true when the frame closed the channel.
    pub(crate) fn handle_frame(&self, frame: Frame) -> bool {
        let _dispatch = self.inner.dispatch.enter();
        match self.apply_frame(frame) {
            Dispatch::Nothing => false,
            Dispatch::Joined(response) => {
                info!(event = "channel_joined", topic = %self.inner.topic);
                self.inner.callbacks.emit_join(response);
                false
            }
            Dispatch::JoinRejected(response) => {
                warn!(event = "channel_join_rejected", topic = %self.inner.topic, response = %response);
                self.inner.callbacks.emit_error(response);
                false
            }
            Dispatch::DocumentUpdate(payload) => {
                debug!(event = "document_updated", topic = %self.inner.topic);
                self.inner.callbacks.emit_document_update(payload);
                false
            }
            Dispatch::StatusUpdate(payload) => {
                debug!(event = "status_updated", topic = %self.inner.topic);
                self.inner.callbacks.emit_status_update(payload);
                false
            }
            Dispatch::Close(error) => self.close(error),
        }
    }

    fn apply_frame(&self, frame: Frame) -> Dispatch {
        let mut core = lock(&self.inner.core);

        if core.state == ChannelState::Closed {
            trace!(event = "channel_frame_dropped", topic = %self.inner.topic, reason = "closed");
            return Dispatch::Nothing;
        }
        if let Some(join_ref) = frame.join_ref.as_deref() {
            if join_ref != self.inner.join_ref {
                trace!(event = "channel_frame_dropped", topic = %self.inner.topic, reason = "stale_join_ref");
                return Dispatch::Nothing;
            }
        }

        match frame.event.as_str() {
            EVENT_REPLY => {
                let Some(msg_ref) = frame.msg_ref.as_deref() else {
                    return Dispatch::Nothing;
                };
                let Some(reply) = frame.as_reply() else {
                    warn!(event = "channel_reply_malformed", topic = %self.inner.topic, msg_ref);
                    return Dispatch::Nothing;
                };

                if msg_ref == self.inner.join_ref {
                    if core.state != ChannelState::Joining {
                        return Dispatch::Nothing;
                    }
                    return match reply.into_result() {
                        Ok(response) => {
                            core.state = ChannelState::Joined;
                            for buffered in core.buffered.drain(..) {
                                if self.inner.outbound.send(buffered).is_err() {
                                    debug!(event = "channel_push_dropped", topic = %self.inner.topic);
                                }
                            }
                            Dispatch::Joined(response)
                        }
                        Err(response) => {
                            core.state = ChannelState::Errored;
                            core.join_rejection = Some(response.clone());
                            for (_, reply_tx) in core.pending.drain() {
                                let _ = reply_tx.send(Err(SocketError::JoinRejected(response.clone())));
                            }
                            core.buffered.clear();
                            Dispatch::JoinRejected(response)
                        }
                    };
                }

                match core.pending.remove(msg_ref) {
                    Some(reply_tx) => {
                        let _ = reply_tx.send(reply.into_result().map_err(SocketError::RequestRejected));
                    }
                    None => {
                        trace!(event = "channel_reply_unmatched", topic = %self.inner.topic, msg_ref);
                    }
                }
                Dispatch::Nothing
            }
            EVENT_DOCUMENT_UPDATED => Dispatch::DocumentUpdate(frame.payload),
            EVENT_STATUS_UPDATED => Dispatch::StatusUpdate(frame.payload),
            EVENT_ERROR => Dispatch::Close(Some(frame.payload)),
            EVENT_CLOSE => Dispatch::Close(None),
            other => {
                trace!(event = "channel_event_ignored", topic = %self.inner.topic, name = other);
                Dispatch::Nothing
            }
        }
    }

    /// Sends a leave request (when the server still considers us a member)
    /// and closes the channel locally without waiting for the reply.
    pub(crate) fn leave(&self) -> bool {
        let state = self.state();
        if matches!(state, ChannelState::Joining | ChannelState::Joined) {
            let frame = Frame::leave(&self.inner.topic, &self.inner.join_ref, self.inner.refs.next());
            if self.inner.outbound.send(frame).is_err() {
                debug!(event = "channel_leave_dropped", topic = %self.inner.topic);
            }
        }
        self.close(None)
    }

    /// Transitions to `Closed`, abandoning every pending push.
    ///
    /// `error` is reported through `on_error` before `on_close` fires.
    /// Returns false when the channel was already closed.
    pub(crate) fn close(&self, error: Option<Value>) -> bool {
        let _dispatch = self.inner.dispatch.enter();
        let abandoned = {
            let mut core = lock(&self.inner.core);
            if core.state == ChannelState::Closed {
                return false;
            }
            core.state = ChannelState::Closed;
            core.buffered.clear();
            core.pending.drain().map(|(_, reply_tx)| reply_tx).collect::<Vec<_>>()
        };

        for reply_tx in abandoned {
            let _ = reply_tx.send(Err(SocketError::ChannelClosed));
        }

        info!(event = "channel_closed", topic = %self.inner.topic, errored = error.is_some());
        if let Some(error) = error {
            self.inner.callbacks.emit_error(error);
        }
        self.inner.callbacks.emit_close();
        true
    }

    /// Closes the channel because the underlying transport went away.
    pub(crate) fn close_for_transport(&self, reason: Option<&str>) -> bool {
        self.close(reason.map(|reason| json!({ "reason": reason })))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::{Channel, ChannelState};
    use crate::socket::callbacks::ChannelCallbacks;
    use crate::socket::client::{Command, FrameSender, SocketError};
    use crate::socket::proto::{Frame, RefCounter, ReplyStatus, EVENT_JOIN, EVENT_LEAVE};

    #[derive(Default)]
    struct Seen {
        joins: Vec<Value>,
        errors: Vec<Value>,
        closes: usize,
        statuses: Vec<Value>,
        documents: Vec<Value>,
    }

    fn recording_callbacks(seen: &Arc<Mutex<Seen>>) -> ChannelCallbacks {
        let join = Arc::clone(seen);
        let error = Arc::clone(seen);
        let close = Arc::clone(seen);
        let status = Arc::clone(seen);
        let document = Arc::clone(seen);
        ChannelCallbacks::new()
            .on_join(move |p| join.lock().unwrap().joins.push(p))
            .on_error(move |p| error.lock().unwrap().errors.push(p))
            .on_close(move || close.lock().unwrap().closes += 1)
            .on_status_update(move |p| status.lock().unwrap().statuses.push(p))
            .on_document_update(move |p| document.lock().unwrap().documents.push(p))
    }

    fn channel_with_outbox(
        topic: &str,
        callbacks: ChannelCallbacks,
    ) -> (Channel, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Channel::new(
            topic.to_string(),
            callbacks,
            FrameSender::new(tx),
            RefCounter::default(),
            None,
        );
        (channel, rx)
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Command>) -> Frame {
        match rx.try_recv().expect("queued command") {
            Command::Push(frame) => frame,
            _ => panic!("expected a frame"),
        }
    }

    fn join_ok(channel: &Channel, rx: &mut mpsc::UnboundedReceiver<Command>) {
        channel.join(json!({}));
        let join = next_frame(rx);
        assert_eq!(join.event, EVENT_JOIN);
        channel.handle_frame(Frame::reply_to(&join, ReplyStatus::Ok, json!({"joined": true})));
    }

    #[test]
    fn join_ok_transitions_and_fires_on_join() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (channel, mut rx) = channel_with_outbox("document:1", recording_callbacks(&seen));
        assert_eq!(channel.state(), ChannelState::Joining);

        join_ok(&channel, &mut rx);

        assert_eq!(channel.state(), ChannelState::Joined);
        assert_eq!(seen.lock().unwrap().joins, vec![json!({"joined": true})]);
    }

    #[test]
    fn join_error_leaves_channel_errored() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (channel, mut rx) = channel_with_outbox("document:1", recording_callbacks(&seen));
        channel.join(json!({}));
        let join = next_frame(&mut rx);

        let closed = channel.handle_frame(Frame::reply_to(
            &join,
            ReplyStatus::Error,
            json!({"reason": "unauthorized"}),
        ));

        assert!(!closed);
        assert_eq!(channel.state(), ChannelState::Errored);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.errors, vec![json!({"reason": "unauthorized"})]);
        assert_eq!(seen.closes, 0);
    }

    #[test]
    fn status_update_is_delivered_verbatim_once() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (channel, mut rx) = channel_with_outbox("document:42", recording_callbacks(&seen));
        join_ok(&channel, &mut rx);

        channel.handle_frame(Frame::broadcast(
            "document:42",
            "status_updated",
            json!({"progress": 50}),
        ));

        assert_eq!(seen.lock().unwrap().statuses, vec![json!({"progress": 50})]);
        assert!(seen.lock().unwrap().documents.is_empty());
    }

    #[test]
    fn events_dispatch_in_arrival_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let callbacks = ChannelCallbacks::new()
            .on_status_update({
                let order = Arc::clone(&order);
                move |p| order.lock().unwrap().push(p)
            })
            .on_document_update({
                let order = Arc::clone(&order);
                move |p| order.lock().unwrap().push(p)
            });
        let (channel, mut rx) = channel_with_outbox("document:5", callbacks);
        join_ok(&channel, &mut rx);

        for step in 0..5 {
            let event = if step % 2 == 0 { "status_updated" } else { "document_updated" };
            channel.handle_frame(Frame::broadcast("document:5", event, json!({ "step": step })));
        }

        let steps: Vec<i64> = order
            .lock()
            .unwrap()
            .iter()
            .map(|p| p["step"].as_i64().unwrap())
            .collect();
        assert_eq!(steps, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn replies_in_reverse_order_settle_their_own_pushes() {
        let (channel, mut rx) = channel_with_outbox("document:42", ChannelCallbacks::new());
        join_ok(&channel, &mut rx);

        let first = tokio::spawn({
            let channel = channel.clone();
            async move { channel.push("echo", json!({"n": 1})).await }
        });
        let second = tokio::spawn({
            let channel = channel.clone();
            async move { channel.push("echo", json!({"n": 2})).await }
        });

        let mut frames = Vec::new();
        while frames.len() < 2 {
            match rx.recv().await.expect("push frame") {
                Command::Push(frame) => frames.push(frame),
                _ => panic!("expected a frame"),
            }
        }

        for frame in frames.iter().rev() {
            let echoed = frame.payload.clone();
            channel.handle_frame(Frame::reply_to(frame, ReplyStatus::Ok, echoed));
        }

        assert_eq!(first.await.unwrap().unwrap(), json!({"n": 1}));
        assert_eq!(second.await.unwrap().unwrap(), json!({"n": 2}));
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn error_reply_rejects_only_that_push() {
        let (channel, mut rx) = channel_with_outbox("document:42", ChannelCallbacks::new());
        join_ok(&channel, &mut rx);

        let push = tokio::spawn({
            let channel = channel.clone();
            async move { channel.push("get_status", json!({})).await }
        });
        let Command::Push(frame) = rx.recv().await.expect("push frame") else {
            panic!("expected a frame");
        };
        channel.handle_frame(Frame::reply_to(&frame, ReplyStatus::Error, json!({"reason": "missing"})));

        match push.await.unwrap() {
            Err(SocketError::RequestRejected(payload)) => {
                assert_eq!(payload, json!({"reason": "missing"}))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(channel.state(), ChannelState::Joined);
    }

    #[tokio::test]
    async fn close_abandons_pending_pushes_and_drops_late_events() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (channel, mut rx) = channel_with_outbox("document:42", recording_callbacks(&seen));
        join_ok(&channel, &mut rx);

        let pushes: Vec<_> = (0..2)
            .map(|n| {
                let channel = channel.clone();
                tokio::spawn(async move { channel.push("slow", json!({ "n": n })).await })
            })
            .collect();
        while channel.pending_requests() < 2 {
            tokio::task::yield_now().await;
        }

        assert!(channel.close(None));
        assert!(!channel.close(None));

        for push in pushes {
            assert!(matches!(push.await.unwrap(), Err(SocketError::ChannelClosed)));
        }

        channel.handle_frame(Frame::broadcast("document:42", "status_updated", json!({"late": true})));
        let seen = seen.lock().unwrap();
        assert!(seen.statuses.is_empty());
        assert_eq!(seen.closes, 1);
    }

    #[tokio::test]
    async fn pushes_during_join_are_flushed_after_ack() {
        let (channel, mut rx) = channel_with_outbox("document:9", ChannelCallbacks::new());
        channel.join(json!({}));
        let join = next_frame(&mut rx);

        let push = tokio::spawn({
            let channel = channel.clone();
            async move { channel.push("ping", json!({})).await }
        });
        while channel.pending_requests() < 1 {
            tokio::task::yield_now().await;
        }
        assert!(rx.try_recv().is_err(), "push must wait for the join ack");

        channel.handle_frame(Frame::reply_to(&join, ReplyStatus::Ok, json!({})));
        let ping = next_frame(&mut rx);
        assert_eq!(ping.event, "ping");
        channel.handle_frame(Frame::reply_to(&ping, ReplyStatus::Ok, json!({"pong": true})));

        assert_eq!(push.await.unwrap().unwrap(), json!({"pong": true}));
    }

    #[tokio::test]
    async fn push_on_closed_or_errored_channel_fails_fast() {
        let (channel, mut rx) = channel_with_outbox("document:3", ChannelCallbacks::new());
        channel.join(json!({}));
        let join = next_frame(&mut rx);
        channel.handle_frame(Frame::reply_to(&join, ReplyStatus::Error, json!({"reason": "no"})));

        assert!(matches!(
            channel.push("ping", json!({})).await,
            Err(SocketError::JoinRejected(_))
        ));

        channel.close(None);
        assert!(matches!(
            channel.push("ping", json!({})).await,
            Err(SocketError::ChannelClosed)
        ));
    }

    #[test]
    fn frames_with_stale_join_ref_are_ignored() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (channel, mut rx) = channel_with_outbox("document:8", recording_callbacks(&seen));
        join_ok(&channel, &mut rx);

        let mut stale = Frame::broadcast("document:8", "phx_close", json!({}));
        stale.join_ref = Some("not-ours".to_string());
        assert!(!channel.handle_frame(stale));
        assert_eq!(channel.state(), ChannelState::Joined);
    }

    #[test]
    fn server_error_fires_on_error_then_on_close() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (channel, mut rx) = channel_with_outbox("document:8", recording_callbacks(&seen));
        join_ok(&channel, &mut rx);

        let closed = channel.handle_frame(Frame::broadcast("document:8", "phx_error", json!({"crash": 1})));

        assert!(closed);
        assert_eq!(channel.state(), ChannelState::Closed);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.errors, vec![json!({"crash": 1})]);
        assert_eq!(seen.closes, 1);
    }

    #[test]
    fn leave_sends_phx_leave_and_closes() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (channel, mut rx) = channel_with_outbox("document:8", recording_callbacks(&seen));
        join_ok(&channel, &mut rx);

        assert!(channel.leave());
        let leave = next_frame(&mut rx);
        assert_eq!(leave.event, EVENT_LEAVE);
        assert_eq!(leave.join_ref.as_deref(), Some(channel.join_ref()));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(seen.lock().unwrap().closes, 1);
    }

    #[test]
    fn close_waits_for_event_already_being_delivered() {
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        let callbacks = ChannelCallbacks::new()
            .on_status_update({
                let order = Arc::clone(&order);
                move |_| {
                    let _ = entered_tx.lock().unwrap().send(());
                    release_rx.lock().unwrap().recv().expect("release");
                    order.lock().unwrap().push("status");
                }
            })
            .on_close({
                let order = Arc::clone(&order);
                move || order.lock().unwrap().push("close")
            });
        let (channel, mut rx) = channel_with_outbox("document:42", callbacks);
        join_ok(&channel, &mut rx);

        let delivering = thread::spawn({
            let channel = channel.clone();
            move || {
                channel.handle_frame(Frame::broadcast(
                    "document:42",
                    "status_updated",
                    json!({"progress": 10}),
                ))
            }
        });
        entered_rx.recv().expect("status callback entered");

        let closing = thread::spawn({
            let channel = channel.clone();
            move || channel.close(None)
        });
        thread::sleep(Duration::from_millis(50));
        assert!(order.lock().unwrap().is_empty());
        release_tx.send(()).expect("release");

        assert!(!delivering.join().expect("delivering thread"));
        assert!(closing.join().expect("closing thread"));
        assert_eq!(*order.lock().unwrap(), vec!["status", "close"]);
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn callback_can_leave_its_own_channel() {
        let slot: Arc<Mutex<Option<Channel>>> = Arc::new(Mutex::new(None));
        let seen = Arc::new(Mutex::new(Seen::default()));
        let callbacks = recording_callbacks(&seen).on_document_update({
            let slot = Arc::clone(&slot);
            move |_| {
                let channel = slot.lock().unwrap().clone().expect("channel installed");
                channel.leave();
            }
        });
        let (channel, mut rx) = channel_with_outbox("document:9", callbacks);
        *slot.lock().unwrap() = Some(channel.clone());
        join_ok(&channel, &mut rx);

        channel.handle_frame(Frame::broadcast("document:9", "document_updated", json!({"v": 1})));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(seen.lock().unwrap().closes, 1);

        channel.handle_frame(Frame::broadcast(
            "document:9",
            "status_updated",
            json!({"progress": 99}),
        ));
        assert!(seen.lock().unwrap().statuses.is_empty());
    }
}
