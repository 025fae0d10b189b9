//! Document-level facade over the shared socket.
//!
//! `DocumentSocket` is the handle application code passes around: it is
//! cheap to clone, and every clone shares one [`SocketClient`], so all
//! consumers multiplex over a single connection. Topics are derived from
//! document ids as `document:<id>`.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::socket::callbacks::ChannelCallbacks;
use crate::socket::channel::Channel;
use crate::socket::client::{ConnectionState, SocketClient, SocketError, SocketOptions};

/// Prefix shared by every document topic.
pub const DOCUMENT_TOPIC_PREFIX: &str = "document:";

/// Opaque identifier of a processed document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel topic for this document.
    pub fn topic(&self) -> String {
        format!("{DOCUMENT_TOPIC_PREFIX}{}", self.0)
    }

    /// Parses a `document:<id>` topic back into its id.
    pub fn from_topic(topic: &str) -> Option<Self> {
        topic
            .strip_prefix(DOCUMENT_TOPIC_PREFIX)
            .filter(|id| !id.is_empty())
            .map(Self::new)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for DocumentId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Returns the channel topic for a document id.
pub fn document_topic(document_id: impl Into<DocumentId>) -> String {
    document_id.into().topic()
}

/// Shared handle to the document update socket.
#[derive(Clone, Debug)]
pub struct DocumentSocket {
    client: Arc<SocketClient>,
}

impl DocumentSocket {
    /// Creates the process-wide socket handle. Nothing connects until
    /// [`DocumentSocket::connect`] is called.
    pub fn new(options: SocketOptions) -> Self {
        Self::from_client(Arc::new(SocketClient::new(options)))
    }

    /// Wraps an already shared client.
    pub fn from_client(client: Arc<SocketClient>) -> Self {
        Self { client }
    }

    /// Underlying transport client.
    pub fn client(&self) -> &Arc<SocketClient> {
        &self.client
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub async fn connect(&self) -> Result<(), SocketError> {
        self.client.connect().await
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await
    }

    /// Subscribes to a document's update stream.
    ///
    /// Returns the existing channel if the document is already subscribed;
    /// in that case `callbacks` are not installed.
    pub fn subscribe_to_document(
        &self,
        document_id: impl Into<DocumentId>,
        callbacks: ChannelCallbacks,
    ) -> Result<Channel, SocketError> {
        self.client.subscribe(document_id.into().topic(), callbacks)
    }

    /// Leaves a document's channel. A no-op when not subscribed.
    pub fn unsubscribe_from_document(&self, document_id: impl Into<DocumentId>) {
        let document_id = document_id.into();
        if self.client.unsubscribe(&document_id.topic()) {
            info!(event = "document_unsubscribed", document_id = %document_id);
        }
    }

    /// Returns true while a channel exists for the document.
    pub fn is_subscribed(&self, document_id: impl Into<DocumentId>) -> bool {
        self.client.registry().contains(&document_id.into().topic())
    }

    /// Sends `event` to a document channel and waits for the reply.
    pub async fn send_message(
        &self,
        document_id: impl Into<DocumentId>,
        event: &str,
        payload: Value,
    ) -> Result<Value, SocketError> {
        let topic = document_id.into().topic();
        self.client.send_message(&topic, event, payload).await
    }

    /// Requests the document's current processing status.
    pub async fn get_document_status(
        &self,
        document_id: impl Into<DocumentId>,
    ) -> Result<Value, SocketError> {
        let topic = document_id.into().topic();
        self.client.get_document_status(&topic).await
    }

    /// Pings a document channel.
    pub async fn ping(&self, document_id: impl Into<DocumentId>) -> Result<Value, SocketError> {
        let topic = document_id.into().topic();
        self.client.ping(&topic).await
    }
}
