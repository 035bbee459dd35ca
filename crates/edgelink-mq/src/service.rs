//! Subject-gated dispatch over the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::bus::{BusMessage, MessageBus};
use crate::error::{MqError, Result};
use crate::response::MqResponse;

/// A subject handler producing a response envelope.
#[async_trait]
pub trait MqHandler: Send + Sync {
    /// Handle one inbound message.
    async fn handle(&self, payload: &[u8]) -> MqResponse;
}

/// The agent-side bus adapter.
///
/// Handlers are registered once at boot; each becomes live only between
/// `activate_handler` and `deactivate_handler`.
pub struct MqService {
    bus: Arc<dyn MessageBus>,
    handlers: Mutex<HashMap<String, Arc<dyn MqHandler>>>,
    active: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MqService {
    /// Create the adapter over a bus transport.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            handlers: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Register the full handler map. Called once at boot.
    pub fn register_handlers(&self, handlers: HashMap<String, Arc<dyn MqHandler>>) {
        *self.handlers.lock() = handlers;
    }

    /// Start delivering a subject to its registered handler.
    ///
    /// # Errors
    ///
    /// Returns an error when no handler is registered for the subject or it
    /// is already active.
    pub fn activate_handler(&self, subject: &str) -> Result<()> {
        let handler = self
            .handlers
            .lock()
            .get(subject)
            .cloned()
            .ok_or_else(|| MqError::HandlerNotRegistered(subject.to_string()))?;

        let mut active = self.active.lock();
        if active.contains_key(subject) {
            return Err(MqError::AlreadyActive(subject.to_string()));
        }

        let mut rx = self.bus.subscribe(subject)?;
        let subject_owned = subject.to_string();
        // deactivation aborts only this dispatch loop; in-flight handlers
        // run in their own tasks and still deliver their replies
        let task = tokio::spawn(async move {
            while let Some(mut message) = rx.recv().await {
                let handler = Arc::clone(&handler);
                let subject = subject_owned.clone();
                tokio::spawn(async move {
                    let response = handler.handle(&message.payload).await;
                    match serde_json::to_vec(&response) {
                        Ok(bytes) => message.respond(bytes),
                        Err(e) => {
                            tracing::error!(subject = %subject, error = %e, "encode response failed");
                        }
                    }
                });
            }
        });

        active.insert(subject.to_string(), task);
        tracing::debug!(subject, "mq handler activated");
        Ok(())
    }

    /// Stop delivering a subject.
    ///
    /// # Errors
    ///
    /// Returns an error when the subject is not active.
    pub fn deactivate_handler(&self, subject: &str) -> Result<()> {
        let task = self
            .active
            .lock()
            .remove(subject)
            .ok_or_else(|| MqError::NotActive(subject.to_string()))?;

        task.abort();
        self.bus.unsubscribe(subject)?;
        tracing::debug!(subject, "mq handler deactivated");
        Ok(())
    }

    /// True while the subject is being delivered.
    #[must_use]
    pub fn is_active(&self, subject: &str) -> bool {
        self.active.lock().contains_key(subject)
    }

    /// Send a request and decode the reply envelope.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, timeout, or an undecodable
    /// reply.
    pub async fn request<B: Serialize, R: DeserializeOwned>(
        &self,
        subject: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R> {
        let payload = serde_json::to_vec(body)?;
        let reply = self.bus.request(subject, payload, timeout).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Subscribe a raw subject stream, bypassing the handler registry.
    ///
    /// Used for one-shot waits such as the install-finished notification.
    ///
    /// # Errors
    ///
    /// Returns an error when the subject already has a consumer.
    pub fn chan_subscribe(&self, subject: &str) -> Result<tokio::sync::mpsc::Receiver<BusMessage>> {
        self.bus.subscribe(subject)
    }

    /// Drop a raw subscription taken with [`Self::chan_subscribe`].
    ///
    /// # Errors
    ///
    /// Returns an error when the subject has no consumer.
    pub fn chan_unsubscribe(&self, subject: &str) -> Result<()> {
        self.bus.unsubscribe(subject)
    }

    /// Deactivate every live subject. Part of graceful shutdown.
    pub fn close(&self) {
        let mut active = self.active.lock();
        for (subject, task) in active.drain() {
            task.abort();
            let _ = self.bus.unsubscribe(&subject);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::response::MqStatus;

    struct EchoHandler;

    #[async_trait]
    impl MqHandler for EchoHandler {
        async fn handle(&self, payload: &[u8]) -> MqResponse {
            MqResponse::ok().with_field(
                "echo",
                serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()),
            )
        }
    }

    fn service_with_echo() -> Arc<MqService> {
        let bus = LocalBus::new();
        let service = Arc::new(MqService::new(bus));
        let mut handlers: HashMap<String, Arc<dyn MqHandler>> = HashMap::new();
        handlers.insert("agent.echo".to_string(), Arc::new(EchoHandler));
        service.register_handlers(handlers);
        service
    }

    #[tokio::test]
    async fn inactive_handler_gets_no_messages() {
        let service = service_with_echo();

        let err = service
            .request::<_, MqResponse>("agent.echo", &"hi", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::NoResponder(_)));
    }

    #[tokio::test]
    async fn activated_handler_round_trips() {
        let service = service_with_echo();
        service.activate_handler("agent.echo").unwrap();

        let response: MqResponse = service
            .request("agent.echo", &"hi", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.status, MqStatus::Ok);
        assert_eq!(response.extra["echo"], "\"hi\"");
    }

    #[tokio::test]
    async fn deactivation_stops_delivery() {
        let service = service_with_echo();
        service.activate_handler("agent.echo").unwrap();
        service.deactivate_handler("agent.echo").unwrap();

        let err = service
            .request::<_, MqResponse>("agent.echo", &"hi", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::NoResponder(_)));
        assert!(!service.is_active("agent.echo"));
    }

    #[tokio::test]
    async fn double_activation_is_rejected() {
        let service = service_with_echo();
        service.activate_handler("agent.echo").unwrap();
        assert!(matches!(
            service.activate_handler("agent.echo"),
            Err(MqError::AlreadyActive(_))
        ));
    }

    #[tokio::test]
    async fn unregistered_subject_cannot_activate() {
        let service = service_with_echo();
        assert!(matches!(
            service.activate_handler("agent.unknown"),
            Err(MqError::HandlerNotRegistered(_))
        ));
    }

    struct SlowHandler;

    #[async_trait]
    impl MqHandler for SlowHandler {
        async fn handle(&self, _payload: &[u8]) -> MqResponse {
            tokio::time::sleep(Duration::from_millis(100)).await;
            MqResponse::ok()
        }
    }

    #[tokio::test]
    async fn in_flight_handler_survives_deactivation() {
        let bus = LocalBus::new();
        let service = Arc::new(MqService::new(Arc::clone(&bus) as Arc<dyn crate::MessageBus>));
        let mut handlers: HashMap<String, Arc<dyn MqHandler>> = HashMap::new();
        handlers.insert("agent.slow".to_string(), Arc::new(SlowHandler));
        service.register_handlers(handlers);
        service.activate_handler("agent.slow").unwrap();

        let requester = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                bus.request("agent.slow", Vec::new(), Duration::from_secs(1))
                    .await
            })
        };

        // the handler toggles the subject off while serving this request
        tokio::time::sleep(Duration::from_millis(30)).await;
        service.deactivate_handler("agent.slow").unwrap();

        let reply = requester.await.unwrap().unwrap();
        let response: MqResponse = serde_json::from_slice(&reply).unwrap();
        assert_eq!(response.status, MqStatus::Ok);
    }

    #[tokio::test]
    async fn deactivating_inactive_subject_errors() {
        let service = service_with_echo();
        assert!(matches!(
            service.deactivate_handler("agent.echo"),
            Err(MqError::NotActive(_))
        ));
    }
}
