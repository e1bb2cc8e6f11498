//! One publisher socket shared by every subscription on that publisher.
//!
//! A connection routes incoming frames to the listeners registered for each
//! publication, sends *Subscribe* once per publication, and closes itself a
//! grace period after its last listener detached. Emptiness is re-checked
//! when the grace timer fires, so a listener attaching in the meantime keeps
//! the socket alive.
//!
//! Lock order: `publications` before anything a listener takes. Listeners
//! are always invoked after the publications lock is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use fusion_core::constants::NORMAL_CLOSE_CODE;
use fusion_core::{FrameCodec, FusionError, IncomingFrame, PublicationId, PublicationRef, PublisherId, Result};

use crate::registry::RegistryShared;
use crate::transport::{ABNORMAL_CLOSE_CODE, OutgoingFrame, SocketChannels, SocketEvent, Transport};

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Frames flow both ways.
    Open,
    /// Close requested, waiting for the socket to finish.
    Closing,
    /// Gone. Never reopened.
    Closed,
}

/// Receives the frames of one publication.
pub trait PublicationListener: Send + Sync {
    /// Stable identity used to detach.
    fn listener_id(&self) -> u64;

    /// A frame for this listener's publication arrived.
    fn on_frame(&self, frame: &IncomingFrame);

    /// The socket closed underneath the listener. The listener is already
    /// detached when this runs.
    fn on_connection_lost(&self, code: u16, reason: &str);

    /// Another listener on the same publication is about to request an
    /// update; drop any pending request of your own.
    fn cancel_refetch(&self);
}

enum CloseCause {
    OpenFailed(String),
    Closed { code: u16, reason: String },
}

type Listeners = Vec<Arc<dyn PublicationListener>>;

/// A multiplexed publisher socket.
pub struct Connection {
    publisher_id: PublisherId,
    codec: FrameCodec,
    close_grace: Duration,
    runtime: Handle,
    registry: Weak<RegistryShared>,
    state: watch::Sender<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<OutgoingFrame>>>,
    publications: Mutex<HashMap<PublicationId, Listeners>>,
    close_cause: Mutex<Option<CloseCause>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("publisher_id", &self.publisher_id)
            .field("state", &self.state())
            .field("publications", &self.publication_count())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        publisher_id: PublisherId,
        codec: FrameCodec,
        close_grace: Duration,
        runtime: Handle,
        registry: Weak<RegistryShared>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Arc::new(Self {
            publisher_id,
            codec,
            close_grace,
            runtime,
            registry,
            state,
            outgoing: Mutex::new(None),
            publications: Mutex::new(HashMap::new()),
            close_cause: Mutex::new(None),
        })
    }

    /// The publisher this connection serves.
    pub fn publisher_id(&self) -> &PublisherId {
        &self.publisher_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Number of publications with at least one listener.
    pub fn publication_count(&self) -> usize {
        self.publications.lock().len()
    }

    /// Number of listeners on `publication_id`.
    pub fn listener_count(&self, publication_id: &PublicationId) -> usize {
        self.publications.lock().get(publication_id).map_or(0, Vec::len)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub(crate) fn start(self: &Arc<Self>, transport: Arc<dyn Transport>, url: String) {
        let connection = Arc::clone(self);
        drop(self.runtime.spawn(async move { connection.run(transport, url).await }));
    }

    async fn run(self: Arc<Self>, transport: Arc<dyn Transport>, url: String) {
        let SocketChannels { outgoing, mut incoming } = match transport.open(&url).await {
            Ok(channels) => channels,
            Err(err) => {
                warn!(publisher_id = %self.publisher_id, error = %err, "connection failed to open");
                *self.close_cause.lock() = Some(CloseCause::OpenFailed(err.to_string()));
                let _ = self.state.send_replace(ConnectionState::Closed);
                self.unregister();
                return;
            }
        };

        let close_early = {
            let _publications = self.publications.lock();
            *self.outgoing.lock() = Some(outgoing);
            if self.state() == ConnectionState::Connecting {
                let _ = self.state.send_replace(ConnectionState::Open);
                false
            } else {
                true
            }
        };
        if close_early {
            debug!(publisher_id = %self.publisher_id, "closed before open completed");
            self.send_frame(OutgoingFrame::Close { code: NORMAL_CLOSE_CODE });
        } else {
            info!(publisher_id = %self.publisher_id, "connection open");
            // Closes the socket if no one attaches within the grace period.
            self.schedule_idle_close();
        }

        while let Some(event) = incoming.recv().await {
            match event {
                SocketEvent::Text(text) => self.dispatch(&text),
                SocketEvent::Closed { code, reason } => {
                    self.finish(code, reason);
                    return;
                }
            }
        }
        self.finish(ABNORMAL_CLOSE_CODE, "socket ended".into());
    }

    /// Wait until the connection is open, failed, or `timeout` elapsed.
    pub async fn wait_open(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.subscribe();
        let opened = async {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Open => return Ok(()),
                    ConnectionState::Closing | ConnectionState::Closed => return Err(self.failure()),
                    ConnectionState::Connecting => {}
                }
                if state.changed().await.is_err() {
                    return Err(self.failure());
                }
            }
        };
        tokio::time::timeout(timeout, opened)
            .await
            .map_err(|_| FusionError::OpenTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })?
    }

    /// Start the closing handshake regardless of listeners.
    ///
    /// Listeners still attached are told the connection was lost once the
    /// socket finishes closing.
    pub fn close(&self) -> bool {
        {
            let _publications = self.publications.lock();
            if !matches!(self.state(), ConnectionState::Connecting | ConnectionState::Open) {
                return false;
            }
            let _ = self.state.send_replace(ConnectionState::Closing);
        }
        self.unregister();
        self.send_frame(OutgoingFrame::Close { code: NORMAL_CLOSE_CODE });
        true
    }

    fn close_if_idle(&self) -> bool {
        {
            let publications = self.publications.lock();
            if !publications.is_empty() {
                debug!(publisher_id = %self.publisher_id, "connection reused during grace period");
                return false;
            }
            if self.state() != ConnectionState::Open {
                return false;
            }
            let _ = self.state.send_replace(ConnectionState::Closing);
        }
        info!(publisher_id = %self.publisher_id, "closing idle connection");
        self.unregister();
        self.send_frame(OutgoingFrame::Close { code: NORMAL_CLOSE_CODE });
        true
    }

    fn finish(&self, code: u16, reason: String) {
        let (previous, drained) = {
            let mut publications = self.publications.lock();
            *self.close_cause.lock() = Some(CloseCause::Closed {
                code,
                reason: reason.clone(),
            });
            let previous = self.state.send_replace(ConnectionState::Closed);
            (previous, std::mem::take(&mut *publications))
        };
        *self.outgoing.lock() = None;
        self.unregister();

        let listeners: Vec<_> = drained.into_values().flatten().collect();
        if previous == ConnectionState::Closing && listeners.is_empty() {
            info!(publisher_id = %self.publisher_id, code, "connection closed");
        } else {
            warn!(
                publisher_id = %self.publisher_id,
                code,
                %reason,
                subscriptions = listeners.len(),
                "connection lost"
            );
        }
        for listener in listeners {
            listener.on_connection_lost(code, &reason);
        }
    }

    fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self);
        }
    }

    fn failure(&self) -> FusionError {
        match &*self.close_cause.lock() {
            Some(CloseCause::OpenFailed(message)) => FusionError::ConnectionFailed(message.clone()),
            Some(CloseCause::Closed { code, reason }) => FusionError::ConnectionClosed {
                code: *code,
                reason: reason.clone(),
            },
            None if self.state() == ConnectionState::Closing => FusionError::ConnectionClosed {
                code: NORMAL_CLOSE_CODE,
                reason: "connection is closing".into(),
            },
            None => FusionError::ConnectionFailed("connection is not open".into()),
        }
    }

    // ── Listeners ───────────────────────────────────────────────────────

    /// Attach `listener` to `publication_id`. The first listener of a
    /// publication triggers a *Subscribe* frame.
    pub fn attach(&self, publication_id: &PublicationId, listener: Arc<dyn PublicationListener>) -> Result<()> {
        let first = {
            let mut publications = self.publications.lock();
            if self.state() != ConnectionState::Open {
                return Err(self.failure());
            }
            let listeners = publications.entry(publication_id.clone()).or_default();
            listeners.push(listener);
            listeners.len() == 1
        };
        if first {
            let publication = self.publication_ref(publication_id);
            let sent = self.send_text(self.codec.encode_subscribe(&publication));
            debug!(%publication, sent, "subscribe sent");
        }
        Ok(())
    }

    /// Detach listener `listener_id` from `publication_id`.
    ///
    /// When the last listener of the connection leaves, a close is scheduled
    /// after the grace period.
    pub fn detach(self: &Arc<Self>, publication_id: &PublicationId, listener_id: u64) -> bool {
        let (removed, idle) = {
            let mut publications = self.publications.lock();
            let mut removed = false;
            if let Some(listeners) = publications.get_mut(publication_id) {
                let before = listeners.len();
                listeners.retain(|l| l.listener_id() != listener_id);
                removed = listeners.len() != before;
                if listeners.is_empty() {
                    let _ = publications.remove(publication_id);
                }
            }
            (removed, publications.is_empty())
        };
        if removed && idle && self.state() == ConnectionState::Open {
            self.schedule_idle_close();
        }
        removed
    }

    fn schedule_idle_close(self: &Arc<Self>) {
        debug!(publisher_id = %self.publisher_id, grace_ms = self.close_grace.as_millis(), "connection idle");
        let connection = Arc::clone(self);
        let grace = self.close_grace;
        drop(self.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = connection.close_if_idle();
        }));
    }

    fn listeners(&self, publication_id: &PublicationId) -> Listeners {
        self.publications
            .lock()
            .get(publication_id)
            .cloned()
            .unwrap_or_default()
    }

    fn publication_ref(&self, publication_id: &PublicationId) -> PublicationRef {
        PublicationRef {
            publisher_id: self.publisher_id.clone(),
            publication_id: publication_id.clone(),
        }
    }

    // ── Frames ──────────────────────────────────────────────────────────

    fn dispatch(&self, text: &str) {
        let Some(frame) = FrameCodec::decode(text) else {
            debug!(publisher_id = %self.publisher_id, "dropping undecodable frame");
            return;
        };
        if frame.publisher_id != self.publisher_id {
            debug!(publisher_id = %self.publisher_id, frame_publisher = %frame.publisher_id, "dropping frame for another publisher");
            return;
        }
        let listeners = self.listeners(&frame.publication_id);
        if listeners.is_empty() {
            debug!(publication = %frame.publication_ref(), "dropping frame for unknown publication");
            return;
        }
        for listener in &listeners {
            listener.on_frame(&frame);
        }
    }

    /// Cancel pending refetches of every listener on `publication`, then
    /// send one *RequestUpdate*.
    pub fn request_update(&self, publication: &PublicationRef) -> bool {
        for listener in self.listeners(&publication.publication_id) {
            listener.cancel_refetch();
        }
        let sent = self.send_text(self.codec.encode_request_update(publication));
        debug!(%publication, sent, "update requested");
        sent
    }

    fn send_text(&self, text: String) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }
        self.send_frame(OutgoingFrame::Text(text))
    }

    fn send_frame(&self, frame: OutgoingFrame) -> bool {
        self.outgoing
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }
}
