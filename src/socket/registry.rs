//! Topic to channel registry.
//!
//! The registry is shared between the public client handle and the
//! connection's dispatch loop. It holds at most one channel per topic.
//! Callbacks never run while the registry lock is held.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, trace};

use crate::socket::channel::Channel;
use crate::socket::client::SocketError;
use crate::socket::lock;
use crate::socket::proto::Frame;

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live channel for `topic`, if any.
    pub fn get(&self, topic: &str) -> Option<Channel> {
        lock(&self.channels).get(topic).cloned()
    }

    pub fn contains(&self, topic: &str) -> bool {
        lock(&self.channels).contains_key(topic)
    }

    pub fn len(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.channels).is_empty()
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.channels).keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Returns the existing channel for `topic`, or registers a new one and
    /// sends its join.
    ///
    /// `guard` runs under the registry lock before anything else and aborts
    /// the call without side effects when it fails. `open` only runs when no
    /// channel exists; the new channel is registered before the join is sent
    /// so that a join failure can still be looked up and cleaned up.
    pub(crate) fn subscribe_with<G, F>(
        &self,
        topic: &str,
        join_payload: Value,
        guard: G,
        open: F,
    ) -> Result<Channel, SocketError>
    where
        G: FnOnce() -> Result<(), SocketError>,
        F: FnOnce() -> Result<Channel, SocketError>,
    {
        let channel = {
            let mut channels = lock(&self.channels);
            guard()?;
            if let Some(existing) = channels.get(topic) {
                trace!(event = "channel_subscribe_reused", topic);
                return Ok(existing.clone());
            }
            let channel = open()?;
            channels.insert(topic.to_string(), channel.clone());
            channel
        };

        channel.join(join_payload);
        Ok(channel)
    }

    /// Removes the entry for `topic` and leaves the channel.
    ///
    /// Returns false when nothing was subscribed.
    pub(crate) fn unsubscribe(&self, topic: &str) -> bool {
        let removed = lock(&self.channels).remove(topic);
        match removed {
            Some(channel) => {
                channel.leave();
                debug!(event = "channel_unsubscribed", topic);
                true
            }
            None => false,
        }
    }

    /// Routes an inbound frame to its topic's channel.
    ///
    /// Frames for unknown topics are dropped. When the frame closes the
    /// channel, its entry is retired.
    pub(crate) fn route(&self, frame: Frame) {
        let Some(channel) = self.get(&frame.topic) else {
            trace!(event = "frame_unrouted", topic = %frame.topic, name = %frame.event);
            return;
        };
        if channel.handle_frame(frame) {
            self.retire(&channel);
        }
    }

    /// Removes `channel` only if it is still the registered instance for its
    /// topic, so a newer subscription to the same topic survives.
    fn retire(&self, channel: &Channel) {
        let mut channels = lock(&self.channels);
        let is_current = channels
            .get(channel.topic())
            .is_some_and(|current| current.same_channel(channel));
        if is_current {
            channels.remove(channel.topic());
        }
    }

    /// Empties the registry and closes every channel.
    ///
    /// `reason` is reported through `on_error` when the transport failed;
    /// an explicit disconnect passes `None`.
    pub(crate) fn close_all(&self, reason: Option<&str>) -> usize {
        let drained: Vec<Channel> = lock(&self.channels).drain().map(|(_, ch)| ch).collect();
        let count = drained.len();
        for channel in drained {
            channel.close_for_transport(reason);
        }
        if count > 0 {
            debug!(event = "channels_retired", count, reason = reason.unwrap_or("disconnect"));
        }
        count
    }
}
