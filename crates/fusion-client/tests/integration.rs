//! End-to-end tests against a real `WebSocket` publisher and HTTP endpoint.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fusion_client::{
    FusionContext, FusionSettings, HttpFetcher, SubscriptionPhase, SubscriptionRequest, SubscriptionResult,
};
use fusion_settings::OptionsSettings;

const TIMEOUT: Duration = Duration::from_secs(5);

/// What the publisher saw.
#[derive(Debug)]
enum Seen {
    Connected(String),
    Text(String),
    Closed,
}

/// Boot a single-connection publisher. Returns its ws URL, the events it
/// saw and a sender for frames to push to the client. Dropping the sender
/// closes the socket from the server side.
async fn boot_publisher() -> (String, mpsc::UnboundedReceiver<Seen>, mpsc::UnboundedSender<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();

    let _server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let uri_tx = seen_tx.clone();
        let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
            let _ = uri_tx.send(Seen::Connected(req.uri().to_string()));
            Ok::<_, ErrorResponse>(resp)
        })
        .await
        .unwrap();
        let (mut sink, mut source) = ws.split();
        loop {
            tokio::select! {
                pushed = push_rx.recv() => match pushed {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = seen_tx.send(Seen::Text(text.to_string()));
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        let _ = seen_tx.send(Seen::Closed);
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    });

    (format!("ws://{addr}/fusion/ws"), seen_rx, push_tx)
}

async fn mount_counter(server: &MockServer, body: Value) {
    Mock::given(method("GET"))
        .and(path("/api/counter"))
        .and(header("x-fusion-publish", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "x-fusion-publication",
                    r#"{"PublicationRef":{"PublisherId":"P1","PublicationId":"U1"}}"#,
                )
                .set_body_json(body),
        )
        .mount(server)
        .await;
}

fn context(ws_url: String, http: &MockServer) -> FusionContext {
    FusionContext::builder()
        .settings(FusionSettings {
            uri: ws_url,
            options: OptionsSettings { wait_ms: 50 },
        })
        .fetcher(Arc::new(HttpFetcher::new().with_base_url(&http.uri()).unwrap()))
        .build()
}

async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap()
}

async fn next_result<T>(sub: &mut fusion_client::Subscription<T>) -> SubscriptionResult<T>
where
    T: serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
{
    timeout(TIMEOUT, sub.next_update()).await.unwrap().unwrap()
}

#[tokio::test]
async fn subscribe_invalidate_and_update() {
    let (ws_url, mut seen, push) = boot_publisher().await;
    let http = MockServer::start().await;
    mount_counter(&http, json!({"count": 1})).await;

    let ctx = context(ws_url, &http);
    let mut sub = ctx.subscribe(json!(null), SubscriptionRequest::new("/api/counter"));

    let first = next_result(&mut sub).await;
    assert!(first.loading);
    let fetched = next_result(&mut sub).await;
    assert_eq!(fetched.data, json!({"count": 1}));
    assert!(!fetched.loading);

    let Seen::Connected(uri) = next_seen(&mut seen).await else {
        panic!("expected handshake first");
    };
    assert!(uri.contains("publisherId=P1"));
    assert!(uri.contains(&format!("clientId={}", ctx.client_id())));

    let Seen::Text(subscribe) = next_seen(&mut seen).await else {
        panic!("expected subscribe frame");
    };
    assert!(subscribe.contains(r#""PublicationId":"U1""#));
    assert!(subscribe.contains(r#""IsConsistent":true"#));

    push.send(r#"{"PublisherId":"P1","PublicationId":"U1","IsConsistent":false}"#.into())
        .unwrap();
    let Seen::Text(request_update) = next_seen(&mut seen).await else {
        panic!("expected request update frame");
    };
    assert!(request_update.contains(r#""IsUpdateRequested":true"#));

    push.send(
        r#"{"PublisherId":"P1","PublicationId":"U1","IsConsistent":true,"Output":{"UnsafeValue":{"count":2}}}"#
            .into(),
    )
    .unwrap();
    let updated = next_result(&mut sub).await;
    assert_eq!(updated.data, json!({"count": 2}));
    assert_eq!(sub.phase(), SubscriptionPhase::Subscribed);

    assert!(sub.unsubscribe());
    assert!(matches!(next_seen(&mut seen).await, Seen::Closed));
    assert_eq!(ctx.connection_count(), 0);
}

#[tokio::test]
async fn server_close_reports_error_and_keeps_data() {
    let (ws_url, mut seen, push) = boot_publisher().await;
    let http = MockServer::start().await;
    mount_counter(&http, json!(5)).await;

    let ctx = context(ws_url, &http);
    let mut sub = ctx.subscribe(0_i64, SubscriptionRequest::new("/api/counter"));
    let _ = next_result(&mut sub).await;
    assert_eq!(next_result(&mut sub).await.data, 5);
    let _ = next_seen(&mut seen).await;
    let _ = next_seen(&mut seen).await;

    drop(push);

    let errored = next_result(&mut sub).await;
    assert!(errored.error.is_some());
    assert_eq!(errored.data, 5);
}
