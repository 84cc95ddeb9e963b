use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

pub type Transport = Arc<dyn TransportType>;

/// The one capability the broker needs from a push channel: fan a message
/// out to every connected listener.
#[async_trait]
pub trait TransportType: Send + Sync + Debug {
    /// Fire-and-forget push of `payload` on `topic`.
    async fn broadcast(&self, topic: &str, payload: Value) -> Result<(), TransportError>;

    fn name(&self) -> String;
}

#[derive(Error, Debug)]
pub enum TransportError {
    /// The channel behind the handle is gone (server stopped, task died).
    #[error("transport '{0}' is closed")]
    Closed(String),

    #[error("could not serialize payload: {0}")]
    Serialize(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> TransportError {
        TransportError::Serialize(err.to_string())
    }
}

/// In-process transport. Every subscriber sees every `(topic, payload)` pair.
#[derive(Clone, Debug)]
pub struct LocalTransport {
    tx: broadcast::Sender<(String, Value)>,
}

impl LocalTransport {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, Value)> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl TransportType for LocalTransport {
    async fn broadcast(&self, topic: &str, payload: Value) -> Result<(), TransportError> {
        // nobody listening is not a failure
        if self.tx.send((topic.to_string(), payload)).is_err() {
            trace!(topic, "local broadcast without subscribers");
        }
        Ok(())
    }

    fn name(&self) -> String {
        "local".into()
    }
}
