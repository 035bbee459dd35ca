//! The websocket publisher.
//!
//! The publisher owns the connection to the primary orchestrator. `start`
//! spawns a supervisor task that dials, serves the session, and re-dials
//! after a disconnect for as long as the publisher stays started. `stop`
//! cancels the supervisor; `reconnect` cancels only the live session so the
//! supervisor dials again — the discovery monitor uses it to chase a moved
//! primary.
//!
//! Outbound requests carry a correlation id and await the matching response
//! frame; inbound requests are dispatched to the route table, one task per
//! message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use edgelink_config::ConfigService;
use edgelink_core::consts::ws;
use edgelink_store::{AppSection, DeviceConfig};

use crate::discovery::DiscoveryService;
use crate::envelope::{ConnectionState, WsEnvelope};
use crate::error::{ConnError, Result};

const REDIAL_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_BUFFER: usize = 32;
const AGENTS_WS_PATH: &str = "/api/v1/ws/agents";

/// Per-request options for `publish_request`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Reply deadline; 10 s when unset.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Options with an explicit reply deadline.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Handler of one server-initiated websocket method.
#[async_trait]
pub trait WsRouteHandler: Send + Sync {
    /// Handle the request, returning the response body or `(status, error)`.
    async fn handle(&self, request: WsEnvelope) -> std::result::Result<Value, (u16, String)>;
}

struct Session {
    out_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    serial: String,
}

/// The supervised websocket client.
pub struct Publisher {
    config: Arc<ConfigService>,
    discovery: Arc<DiscoveryService>,
    routes: RwLock<HashMap<String, Arc<dyn WsRouteHandler>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<WsEnvelope>>>,
    session: Mutex<Option<Session>>,
    supervisor: Mutex<Option<CancellationToken>>,
    started: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
}

impl Publisher {
    /// Create the publisher. It stays closed until `start`.
    #[must_use]
    pub fn new(config: Arc<ConfigService>, discovery: Arc<DiscoveryService>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Arc::new(Self {
            config,
            discovery,
            routes: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            session: Mutex::new(None),
            supervisor: Mutex::new(None),
            started: AtomicBool::new(false),
            state_tx,
        })
    }

    /// Install the route table. Called once at startup.
    pub fn set_routes(&self, routes: HashMap<String, Arc<dyn WsRouteHandler>>) {
        *self.routes.write() = routes;
    }

    /// Subscribe to connection-state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// True between `start` and `stop`.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// True while the websocket is connected.
    #[must_use]
    pub fn is_active(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Active
    }

    /// Start the supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error when the publisher is already started.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConnError::AlreadyStarted);
        }

        let token = CancellationToken::new();
        *self.supervisor.lock() = Some(token.clone());

        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            publisher.run(token).await;
        });

        Ok(())
    }

    /// Stop the supervisor and drop the connection.
    ///
    /// # Errors
    ///
    /// Returns an error when the publisher is already stopped.
    pub fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(ConnError::AlreadyStopped);
        }

        if let Some(token) = self.supervisor.lock().take() {
            token.cancel();
        }
        self.drop_session();
        self.set_state(ConnectionState::Closed);
        Ok(())
    }

    /// Tear down the live session; the supervisor re-dials on its own.
    pub fn reconnect(&self) {
        let session = self.session.lock();
        if let Some(session) = session.as_ref() {
            tracing::info!("reconnect requested, closing websocket");
            session.cancel.cancel();
        }
    }

    /// Send a request and await the correlated response.
    ///
    /// # Errors
    ///
    /// Returns an error when the websocket is down, the frame cannot be
    /// sent, or the deadline passes.
    pub async fn publish_request(
        &self,
        method: &str,
        to: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<WsEnvelope> {
        let (out_tx, serial) = {
            let session = self.session.lock();
            let session = session.as_ref().ok_or(ConnError::NotActive)?;
            (session.out_tx.clone(), session.serial.clone())
        };
        if !self.is_active() {
            return Err(ConnError::NotActive);
        }

        let envelope = WsEnvelope::request(method, &serial, to, body);
        let request_id = envelope.response_params.request_id.clone();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), reply_tx);

        let frame = Message::Text(serde_json::to_string(&envelope)?);
        if out_tx.send(frame).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(ConnError::Closed);
        }

        let timeout = options.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ConnError::Closed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(ConnError::Timeout(method.to_string()))
            }
        }
    }

    /// Send the success response to an inbound request.
    ///
    /// # Errors
    ///
    /// Returns an error when the websocket is down.
    pub async fn publish_response(&self, source: &WsEnvelope, body: Value) -> Result<()> {
        self.send_envelope(&WsEnvelope::response_to(source, body))
            .await
    }

    /// Send an error response to an inbound request.
    ///
    /// # Errors
    ///
    /// Returns an error when the websocket is down.
    pub async fn publish_error_response(
        &self,
        source: &WsEnvelope,
        status_code: u16,
        message: &str,
    ) -> Result<()> {
        self.send_envelope(&WsEnvelope::error_response_to(source, status_code, message))
            .await
    }

    async fn send_envelope(&self, envelope: &WsEnvelope) -> Result<()> {
        let out_tx = {
            let session = self.session.lock();
            session
                .as_ref()
                .map(|s| s.out_tx.clone())
                .ok_or(ConnError::NotActive)?
        };

        let frame = Message::Text(serde_json::to_string(envelope)?);
        out_tx.send(frame).await.map_err(|_| ConnError::Closed)
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            match self.dial().await {
                Ok((stream, serial)) => {
                    let session_token = token.child_token();
                    self.set_state(ConnectionState::Active);
                    self.serve(stream, serial, session_token).await;
                    self.drop_session();
                    self.set_state(ConnectionState::Closed);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "websocket dial failed");
                    self.set_state(ConnectionState::Closed);
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(REDIAL_BACKOFF) => {}
                    }
                }
            }
        }

        self.set_state(ConnectionState::Closed);
    }

    /// Choose the primary orchestrator, dial it, and record the bound host.
    async fn dial(&self) -> Result<(WebSocketStream<MaybeTlsStream<TcpStream>>, String)> {
        let config = self.config.get_config()?;
        let app = config.app.ok_or(ConnError::NotConfigured("app section"))?;
        if app.serial_number.is_empty() {
            return Err(ConnError::NotConfigured("serial number"));
        }
        if app.orchestrator_addrs.is_empty() {
            return Err(ConnError::NotConfigured("orchestrator addresses"));
        }

        let primary = self.discovery.fetch_primary(&app.orchestrator_addrs).await?;

        let scheme = if primary.starts_with("https") { "wss" } else { "ws" };
        let host = primary
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let url = format!(
            "{scheme}://{host}{AGENTS_WS_PATH}/{}",
            app.serial_number
        );

        // self-signed certificates expected on orchestrators
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ConnError::Websocket(e.to_string()))?;

        let (stream, _response) = tokio_tungstenite::connect_async_tls_with_config(
            &url,
            None,
            false,
            Some(tokio_tungstenite::Connector::NativeTls(tls)),
        )
        .await
        .map_err(|e| ConnError::Websocket(e.to_string()))?;

        tracing::info!(orchestrator = %primary, "websocket connected");

        // an observation, not a commanded change: record the bound host
        // outside any transaction
        let partial = DeviceConfig {
            app: Some(AppSection {
                active_orchestrator_addr: primary,
                ..app
            }),
            ..DeviceConfig::default()
        };
        self.config.update_config(&partial).await?;

        Ok((stream, app_serial(&partial)))
    }

    /// Serve one connection until it drops, the pong deadline passes, or the
    /// session is cancelled.
    async fn serve(
        self: &Arc<Self>,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        serial: String,
        token: CancellationToken,
    ) {
        let (mut sink, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_BUFFER);

        *self.session.lock() = Some(Session {
            out_tx,
            cancel: token.clone(),
            serial,
        });

        let mut ping = interval(ws::PING_PERIOD);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }

                outbound = out_rx.recv() => {
                    let Some(frame) = outbound else { break };
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }

                _ = ping.tick() => {
                    if last_heard.elapsed() > ws::PING_PERIOD + ws::PONG_WAIT {
                        tracing::warn!("pong deadline missed, closing websocket");
                        break;
                    }
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            last_heard = Instant::now();
                            self.handle_text(&text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_heard = Instant::now();
                            if sink.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_heard = Instant::now();
                        }
                        Some(Ok(Message::Binary(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    }
                }
            }
        }

        self.fail_pending();
    }

    /// Correlate a response or dispatch an inbound request.
    async fn handle_text(self: &Arc<Self>, text: &str) {
        let envelope: WsEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "undecodable websocket frame");
                return;
            }
        };

        if envelope.is_response() {
            let waiter = self
                .pending
                .lock()
                .remove(&envelope.response_params.request_id);
            match waiter {
                Some(reply) => {
                    let _ = reply.send(envelope);
                }
                None => {
                    tracing::debug!(
                        request_id = %envelope.response_params.request_id,
                        "response without a waiter"
                    );
                }
            }
            return;
        }

        let handler = self.routes.read().get(&envelope.method).cloned();
        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            match handler {
                Some(handler) => {
                    let source = envelope.clone();
                    let result = handler.handle(envelope).await;
                    let outcome = match result {
                        Ok(body) => publisher.publish_response(&source, body).await,
                        Err((status, message)) => {
                            publisher
                                .publish_error_response(&source, status, &message)
                                .await
                        }
                    };
                    if let Err(e) = outcome {
                        tracing::error!(method = %source.method, error = %e, "response send failed");
                    }
                }
                None => {
                    if let Err(e) = publisher
                        .publish_error_response(&envelope, 405, "method not allowed")
                        .await
                    {
                        tracing::error!(method = %envelope.method, error = %e, "response send failed");
                    }
                }
            }
        });
    }

    fn drop_session(&self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel.cancel();
        }
        self.fail_pending();
    }

    fn fail_pending(&self) {
        // dropping the senders wakes every waiter with ConnError::Closed
        self.pending.lock().clear();
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    #[cfg(test)]
    fn install_test_session(&self, serial: &str) -> mpsc::Receiver<Message> {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        *self.session.lock() = Some(Session {
            out_tx,
            cancel: CancellationToken::new(),
            serial: serial.to_string(),
        });
        self.set_state(ConnectionState::Active);
        out_rx
    }
}

fn app_serial(partial: &DeviceConfig) -> String {
    partial
        .app
        .as_ref()
        .map(|app| app.serial_number.clone())
        .unwrap_or_default()
}
