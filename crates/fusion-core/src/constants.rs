//! Protocol constants shared by the client runtime.

use std::time::Duration;

/// Type marker written as the frame header and as the payload's `$type`.
pub const MESSAGE_HEADER: &str = "Stl.Fusion.Bridge.Messages.SubscribeMessage, Stl.Fusion";

/// How long an `acquire` waits for a socket to finish its handshake.
pub const SOCKET_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before an unreferenced connection is closed.
pub const CONNECTION_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Base delay of the bootstrap backoff (`base * 2^attempt`).
pub const RETRY_BASE_DELAY_MS: u64 = 1000;

/// Default throttle window for refetch requests.
pub const DEFAULT_WAIT_MS: u64 = 300;

/// WebSocket close code used when the client closes an idle connection.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Request header asking the server to publish the fetched value.
pub const PUBLISH_REQUEST_HEADER: &str = "x-fusion-publish";

/// Response header carrying the JSON `PublicationRef` envelope.
pub const PUBLICATION_RESPONSE_HEADER: &str = "x-fusion-publication";
