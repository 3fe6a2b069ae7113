use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_types::events::{ClientEvent, ServerEvent};

use crate::backoff::Backoff;
use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Error,
}

/// One live duplex text link. The link is closed when `inbound` yields `None`.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

pub trait Transport: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, anyhow::Result<Link>>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

impl Transport for WsTransport {
    fn connect(&self, url: String) -> BoxFuture<'static, anyhow::Result<Link>> {
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            let (mut ws_tx, mut ws_rx) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_tx.close().await;
            });

            // Pings are answered by tungstenite while we keep reading.
            tokio::spawn(async move {
                while let Some(frame) = ws_rx.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            if in_tx.send(text.as_str().to_owned()).is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!("gateway socket error: {}", e);
                            break;
                        }
                    }
                }
            });

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Owns the gateway connection: connect, reconnect with backoff, and fan
/// inbound events out to registered handlers.
///
/// Reconnects happen only after an unexpected close. [`disconnect`](Self::disconnect)
/// cancels the run loop for good; a later [`connect`](Self::connect) starts a fresh one.
#[derive(Clone)]
pub struct SocketManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    handlers: Mutex<BTreeMap<u64, Handler>>,
    next_handler_id: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SocketManager {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                state,
                handlers: Mutex::new(BTreeMap::new()),
                next_handler_id: AtomicU64::new(1),
                outbound: Mutex::new(None),
                cancel: Mutex::new(None),
            }),
        }
    }

    pub fn websocket(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(WsTransport))
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Start the connection loop. No-op while one is already running.
    pub fn connect(&self) {
        let token = {
            let mut cancel = lock(&self.inner.cancel);
            if cancel.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return;
            }
            let token = CancellationToken::new();
            *cancel = Some(token.clone());
            token
        };
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(token).await });
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        if let Some(token) = lock(&self.inner.cancel).take() {
            token.cancel();
        }
        lock(&self.inner.outbound).take();
        self.inner.state.send_replace(ConnectionState::Closed);
    }

    /// Queue a frame. Returns `false` when the socket is not open; nothing is buffered.
    pub fn send(&self, event: &ClientEvent) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to encode {}: {}", event.kind(), e);
                return false;
            }
        };
        lock(&self.inner.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(text).is_ok())
    }

    /// Register an event handler. It stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.handlers).insert(id, Arc::new(handler));
        Subscription {
            id,
            manager: Arc::downgrade(&self.inner),
        }
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.inner.handlers).len()
    }
}

impl Inner {
    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff);
        let url = self.config.gateway_url();

        while !token.is_cancelled() {
            self.set_state(&token, ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = token.cancelled() => break,
                result = self.transport.connect(url.clone()) => result,
            };

            match connected {
                Ok(link) => {
                    backoff.reset();
                    info!("gateway connected");
                    let closed_by_us = self.pump(link, &token).await;
                    lock(&self.outbound).take();
                    if closed_by_us {
                        break;
                    }
                    info!("gateway connection lost");
                    self.set_state(&token, ConnectionState::Closed);
                }
                Err(e) => {
                    warn!("gateway connect failed: {}", e);
                    self.set_state(&token, ConnectionState::Error);
                }
            }

            let delay = backoff.next_delay();
            debug!("reconnecting in {:?} (attempt {})", delay, backoff.attempt());
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Deliver inbound frames until the link drops or we are cancelled.
    /// Returns whether the close was ours.
    async fn pump(&self, link: Link, token: &CancellationToken) -> bool {
        let Link { outbound, mut inbound } = link;
        *lock(&self.outbound) = Some(outbound);
        self.set_state(token, ConnectionState::Open);

        loop {
            tokio::select! {
                _ = token.cancelled() => return true,
                frame = inbound.recv() => match frame {
                    Some(text) => self.dispatch(&text),
                    None => return false,
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("undecodable gateway frame: {}", e);
                return;
            }
        };
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<Handler> = lock(&self.handlers).values().cloned().collect();
        for handler in handlers {
            handler(&event);
        }
    }

    /// State changes from a cancelled loop are ignored so they cannot clobber `disconnect`.
    fn set_state(&self, token: &CancellationToken, state: ConnectionState) {
        if !token.is_cancelled() {
            self.state.send_replace(state);
        }
    }
}

/// Handler registration. Dropping it unregisters the handler.
pub struct Subscription {
    id: u64,
    manager: Weak<Inner>,
}

impl Subscription {
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            lock(&inner.handlers).remove(&self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
