//! The live session's speech outlet.
//!
//! The speech pipeline itself (TTS, transport) lives outside this process
//! boundary. Here it is modeled as a broadcast channel of utterance texts
//! that active session transports subscribe to. Delivering with no live
//! subscriber is a sink error, which leaves the announcement queued until
//! a session is listening.

use async_trait::async_trait;
use tokio::sync::broadcast;
use valet_announce::{AnnouncementSink, SinkError};

/// Default capacity for the utterance broadcast channel.
const DEFAULT_UTTERANCE_CAPACITY: usize = 64;

/// Fans announcement texts out to whatever session transports are live.
#[derive(Debug, Clone)]
pub struct SessionSink {
    utterance_tx: broadcast::Sender<String>,
}

impl SessionSink {
    pub fn new() -> Self {
        let (utterance_tx, _) = broadcast::channel(DEFAULT_UTTERANCE_CAPACITY);
        Self { utterance_tx }
    }

    /// Subscribes a session transport to spoken output.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.utterance_tx.subscribe()
    }
}

impl Default for SessionSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnnouncementSink for SessionSink {
    async fn deliver(&self, text: &str) -> Result<(), SinkError> {
        self.utterance_tx
            .send(text.to_string())
            .map(|_receiver_count| ())
            .map_err(|_| SinkError::new("no live session is subscribed to speech output"))
    }
}
