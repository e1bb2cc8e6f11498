//! In-memory transport and scripted fetcher for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use fusion_core::{FusionError, PublicationRef, Result};

use crate::fetcher::{FetchParams, FetchResponse, Fetcher};
use crate::transport::{OutgoingFrame, SocketChannels, SocketEvent, Transport};

/// Let every ready task run; with paused time this also settles timers
/// that are already due.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ── Transport ───────────────────────────────────────────────────────────────

/// Server side of one in-memory socket.
pub struct MockSocket {
    pub url: String,
    to_client: mpsc::UnboundedSender<SocketEvent>,
    log: Mutex<Vec<OutgoingFrame>>,
}

impl MockSocket {
    /// Push a text frame to the client.
    pub fn push(&self, text: &str) {
        let _ = self.to_client.send(SocketEvent::Text(text.to_owned()));
    }

    /// Close the socket from the server side.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(SocketEvent::Closed {
            code,
            reason: reason.to_owned(),
        });
    }

    /// Every frame the client sent so far.
    pub fn sent(&self) -> Vec<OutgoingFrame> {
        self.log.lock().clone()
    }

    /// Text frames the client sent so far.
    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|f| match f {
                OutgoingFrame::Text(t) => Some(t),
                OutgoingFrame::Close { .. } => None,
            })
            .collect()
    }

    /// Text frames containing `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.sent_texts().iter().filter(|t| t.contains(needle)).count()
    }

    /// Whether the client asked to close.
    pub fn close_requested(&self) -> Option<u16> {
        self.sent().into_iter().find_map(|f| match f {
            OutgoingFrame::Close { code } => Some(code),
            OutgoingFrame::Text(_) => None,
        })
    }
}

/// Transport whose sockets live in memory.
#[derive(Default)]
pub struct MockTransport {
    sockets: Mutex<Vec<Arc<MockSocket>>>,
    failures: Mutex<VecDeque<FusionError>>,
    hang: AtomicBool,
    delay: Mutex<Option<Duration>>,
    attempts: AtomicUsize,
    /// When set, client close requests are not answered with a close event.
    no_close_echo: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next open with `error`.
    pub fn fail_next_open(&self, error: FusionError) {
        self.failures.lock().push_back(error);
    }

    /// Make opens never complete.
    pub fn hang_opens(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Make each open take `delay` before the socket exists.
    pub fn delay_opens(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Opens started, including failed and hung ones.
    pub fn open_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Sockets actually created.
    pub fn open_count(&self) -> usize {
        self.sockets.lock().len()
    }

    pub fn socket(&self, index: usize) -> Arc<MockSocket> {
        Arc::clone(&self.sockets.lock()[index])
    }

    pub fn last_socket(&self) -> Arc<MockSocket> {
        let sockets = self.sockets.lock();
        Arc::clone(sockets.last().expect("no socket opened"))
    }

    /// Leave client close requests unanswered.
    pub fn disable_close_echo(&self) {
        self.no_close_echo.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &str) -> Result<SocketChannels> {
        let _ = self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutgoingFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let socket = Arc::new(MockSocket {
            url: url.to_owned(),
            to_client: in_tx,
            log: Mutex::new(Vec::new()),
        });
        let echo_close = !self.no_close_echo.load(Ordering::SeqCst);
        let server = Arc::clone(&socket);
        drop(tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                server.log.lock().push(frame.clone());
                if let OutgoingFrame::Close { code } = frame {
                    if echo_close {
                        server.close(code, "");
                    }
                }
            }
        }));
        self.sockets.lock().push(socket);
        Ok(SocketChannels {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

// ── Fetcher ─────────────────────────────────────────────────────────────────

/// Fetcher that replays queued results, then a fallback response.
#[derive(Default)]
pub struct ScriptedFetcher {
    queue: Mutex<VecDeque<Result<FetchResponse>>>,
    fallback: Mutex<Option<FetchResponse>>,
    calls: Mutex<Vec<(String, FetchParams, Instant)>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Always answer with `data` published as `publication`.
    pub fn publishing(data: Value, publication: PublicationRef) -> Arc<Self> {
        let fetcher = Self::new();
        fetcher.set_fallback(FetchResponse::published(data, publication));
        fetcher
    }

    pub fn set_fallback(&self, response: FetchResponse) {
        *self.fallback.lock() = Some(response);
    }

    pub fn push(&self, result: Result<FetchResponse>) {
        self.queue.lock().push_back(result);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn call_instants(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(_, _, at)| *at).collect()
    }

    pub fn last_call(&self) -> Option<(String, FetchParams)> {
        self.calls.lock().last().map(|(u, p, _)| (u.clone(), p.clone()))
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, params: &FetchParams) -> Result<FetchResponse> {
        self.calls
            .lock()
            .push((url.to_owned(), params.clone(), Instant::now()));
        if let Some(result) = self.queue.lock().pop_front() {
            return result;
        }
        self.fallback
            .lock()
            .clone()
            .ok_or_else(|| FusionError::Network("no scripted response".into()))
    }
}
