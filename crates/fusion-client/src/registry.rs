//! At most one live [`Connection`] per publisher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::info;

use fusion_core::constants::{CONNECTION_CLOSE_GRACE, SOCKET_OPEN_TIMEOUT};
use fusion_core::{ClientId, FrameCodec, FusionError, PublisherId, Result};

use crate::connection::Connection;
use crate::transport::{Transport, socket_url};

/// Connection timing knobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionTimings {
    /// How long `acquire` waits for a socket to open.
    pub open_timeout: Duration,
    /// How long an idle connection lingers before closing.
    pub close_grace: Duration,
}

impl Default for ConnectionTimings {
    fn default() -> Self {
        Self {
            open_timeout: SOCKET_OPEN_TIMEOUT,
            close_grace: CONNECTION_CLOSE_GRACE,
        }
    }
}

/// Map half of the registry, shared weakly with every connection so a
/// closing connection can remove itself.
#[derive(Default)]
pub(crate) struct RegistryShared {
    connections: Mutex<HashMap<PublisherId, Arc<Connection>>>,
}

impl RegistryShared {
    /// Remove `connection` if it is still the registered one for its publisher.
    pub(crate) fn unregister(&self, connection: &Connection) {
        let mut connections = self.connections.lock();
        let current = connections
            .get(connection.publisher_id())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), connection));
        if current {
            let _ = connections.remove(connection.publisher_id());
        }
    }
}

/// Publisher-keyed connection pool.
pub struct ConnectionRegistry {
    shared: Arc<RegistryShared>,
    transport: Arc<dyn Transport>,
    client_id: ClientId,
    codec: FrameCodec,
    timings: ConnectionTimings,
    runtime: Handle,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new(
        transport: Arc<dyn Transport>,
        client_id: ClientId,
        codec: FrameCodec,
        timings: ConnectionTimings,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(RegistryShared::default()),
            transport,
            client_id,
            codec,
            timings,
            runtime,
        }
    }

    /// The open connection for `publisher_id`, opening one against `uri` if
    /// none is registered.
    ///
    /// The new connection is registered before the socket opens, so
    /// concurrent callers share it. Fails with `OpenTimeout` if the socket
    /// is not open within the configured timeout, in which case the attempt
    /// is abandoned and unregistered, or with the open error.
    pub async fn acquire(&self, publisher_id: &PublisherId, uri: &str) -> Result<Arc<Connection>> {
        let connection = {
            let mut connections = self.shared.connections.lock();
            if let Some(existing) = connections.get(publisher_id) {
                Arc::clone(existing)
            } else {
                let url = socket_url(uri, publisher_id, &self.client_id)?;
                let connection = Connection::new(
                    publisher_id.clone(),
                    self.codec.clone(),
                    self.timings.close_grace,
                    self.runtime.clone(),
                    Arc::downgrade(&self.shared),
                );
                let _ = connections.insert(publisher_id.clone(), Arc::clone(&connection));
                info!(%publisher_id, %url, "opening connection");
                connection.start(Arc::clone(&self.transport), url);
                connection
            }
        };
        if let Err(err) = connection.wait_open(self.timings.open_timeout).await {
            if matches!(err, FusionError::OpenTimeout { .. }) {
                // A late open is answered with Close by the connection itself.
                let _ = connection.close();
            }
            return Err(err);
        }
        Ok(connection)
    }

    /// The registered connection for `publisher_id`, in any state.
    pub fn get(&self, publisher_id: &PublisherId) -> Option<Arc<Connection>> {
        self.shared.connections.lock().get(publisher_id).cloned()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered connection. Returns how many were closing.
    pub fn close_all(&self) -> usize {
        let connections: Vec<_> = self.shared.connections.lock().values().cloned().collect();
        connections.iter().filter(|c| c.close()).count()
    }

    /// The client identity sent on every handshake.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, PublicationListener};
    use crate::testutil::{MockTransport, settle};
    use fusion_core::{IncomingFrame, PublicationId};

    struct Quiet(u64);

    impl PublicationListener for Quiet {
        fn listener_id(&self) -> u64 {
            self.0
        }
        fn on_frame(&self, _: &IncomingFrame) {}
        fn on_connection_lost(&self, _: u16, _: &str) {}
        fn cancel_refetch(&self) {}
    }

    fn registry(transport: &Arc<MockTransport>) -> ConnectionRegistry {
        ConnectionRegistry::new(
            Arc::clone(transport) as Arc<dyn Transport>,
            ClientId::from("client-1"),
            FrameCodec::default(),
            ConnectionTimings::default(),
            Handle::current(),
        )
    }

    const URI: &str = "ws://127.0.0.1:5005/fusion/ws";

    #[tokio::test(start_paused = true)]
    async fn one_connection_per_publisher() {
        let transport = MockTransport::new();
        let registry = registry(&transport);
        let p1 = PublisherId::from("P1");

        let (a, b) = tokio::join!(registry.acquire(&p1, URI), registry.acquire(&p1, URI));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        let _c = registry.acquire(&PublisherId::from("P2"), URI).await.unwrap();

        assert_eq!(transport.open_count(), 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(
            transport.socket(0).url,
            "ws://127.0.0.1:5005/fusion/ws?publisherId=P1&clientId=client-1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_is_removed() {
        let transport = MockTransport::new();
        transport.fail_next_open(FusionError::ConnectionFailed("refused".into()));
        let registry = registry(&transport);
        let p1 = PublisherId::from("P1");

        assert!(registry.acquire(&p1, URI).await.is_err());
        assert!(registry.is_empty());
        let connection = registry.acquire(&p1, URI).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_open_is_abandoned() {
        let transport = MockTransport::new();
        transport.hang_opens(true);
        let registry = registry(&transport);
        let p1 = PublisherId::from("P1");

        let err = registry.acquire(&p1, URI).await.unwrap_err();
        assert!(matches!(err, FusionError::OpenTimeout { timeout_ms: 30_000 }));
        assert!(registry.is_empty());

        transport.hang_opens(false);
        let connection = registry.acquire(&p1, URI).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(transport.open_attempts(), 2);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unused_connection_closes_after_grace() {
        let transport = MockTransport::new();
        let registry = registry(&transport);
        let p1 = PublisherId::from("P1");

        let connection = registry.acquire(&p1, URI).await.unwrap();
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(registry.len(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.is_empty());
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(transport.socket(0).close_requested(), Some(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_leaves_registry() {
        let transport = MockTransport::new();
        let registry = registry(&transport);
        let p1 = PublisherId::from("P1");
        let u1 = PublicationId::from("U1");

        let connection = registry.acquire(&p1, URI).await.unwrap();
        connection.attach(&u1, Arc::new(Quiet(1))).unwrap();
        let _ = connection.detach(&u1, 1);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(registry.get(&p1).is_none());
        let fresh = registry.acquire(&p1, URI).await.unwrap();
        assert!(!Arc::ptr_eq(&fresh, &connection));
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_uri_is_rejected_before_registering() {
        let transport = MockTransport::new();
        let registry = registry(&transport);
        let err = registry.acquire(&PublisherId::from("P1"), "::nope").await.unwrap_err();
        assert!(matches!(err, FusionError::InvalidEndpoint(_)));
        assert!(registry.is_empty());
        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_all_closes_and_unregisters() {
        let transport = MockTransport::new();
        let registry = registry(&transport);
        let connection = registry.acquire(&PublisherId::from("P1"), URI).await.unwrap();
        assert_eq!(registry.close_all(), 1);
        assert!(registry.is_empty());
        settle().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
