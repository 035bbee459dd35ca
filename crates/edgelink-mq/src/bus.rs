//! The bus transport contract and the in-process implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::error::{MqError, Result};

const SUBJECT_BUFFER: usize = 16;

/// A message delivered to a subject consumer.
pub struct BusMessage {
    /// Subject the message arrived on.
    pub subject: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    reply: Option<oneshot::Sender<Vec<u8>>>,
}

impl BusMessage {
    /// Send a reply to the requester, if one is waiting.
    pub fn respond(&mut self, payload: Vec<u8>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(payload);
        }
    }
}

/// The message-bus transport.
///
/// One consumer per subject; requests await the consumer's reply.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Register the consumer of a subject.
    ///
    /// # Errors
    ///
    /// Returns an error if the subject already has a consumer.
    fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>>;

    /// Remove the consumer of a subject.
    ///
    /// # Errors
    ///
    /// Returns an error if the subject has no consumer.
    fn unsubscribe(&self, subject: &str) -> Result<()>;

    /// Send a request and await the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing consumes the subject, the reply channel
    /// is dropped, or the deadline passes.
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration)
        -> Result<Vec<u8>>;
}

/// In-process bus shared by the agent's co-located processes.
#[derive(Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, mpsc::Sender<BusMessage>>>,
}

impl LocalBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>> {
        let mut topics = self.topics.write();
        if topics.contains_key(subject) {
            return Err(MqError::AlreadySubscribed(subject.to_string()));
        }

        let (tx, rx) = mpsc::channel(SUBJECT_BUFFER);
        topics.insert(subject.to_string(), tx);
        Ok(rx)
    }

    fn unsubscribe(&self, subject: &str) -> Result<()> {
        self.topics
            .write()
            .remove(subject)
            .map(|_| ())
            .ok_or_else(|| MqError::NoResponder(subject.to_string()))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let sender = self
            .topics
            .read()
            .get(subject)
            .cloned()
            .ok_or_else(|| MqError::NoResponder(subject.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
            reply: Some(reply_tx),
        };

        sender
            .send(message)
            .await
            .map_err(|_| MqError::NoResponder(subject.to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MqError::NoReply(subject.to_string())),
            Err(_) => Err(MqError::Timeout(subject.to_string())),
        }
    }
}
