//! Shared harness for integration tests: an in-memory upstream.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use futures::StreamExt;
use futures::channel::mpsc as fmpsc;
use serde_json::Value;
use tokio::sync::mpsc;

use market_data_gateway::{
    ConnectionManager, ConnectionState, FrameSink, FrameStream, MarketDataObserver,
    StreamConnector, TransportError,
};

/// How long a test waits for anything before failing.
pub const WAIT: Duration = Duration::from_secs(2);

/// The upstream's end of one session.
pub struct ServerSide {
    outbound: fmpsc::UnboundedReceiver<String>,
    inbound: Option<fmpsc::UnboundedSender<Result<String, TransportError>>>,
}

impl ServerSide {
    /// Next frame the gateway wrote, parsed.
    pub async fn next_request(&mut self) -> Value {
        let text = tokio::time::timeout(WAIT, self.outbound.next())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the session");
        serde_json::from_str(&text).unwrap()
    }

    /// Next frame that is not a keep-alive ping.
    pub async fn next_non_ping(&mut self) -> Value {
        loop {
            let request = self.next_request().await;
            if request["action"] != "ping" {
                return request;
            }
        }
    }

    /// Assert no non-ping frame arrives within `window`.
    pub async fn assert_quiet(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.outbound.next()).await {
                Err(_) | Ok(None) => return,
                Ok(Some(text)) => {
                    let request: Value = serde_json::from_str(&text).unwrap();
                    assert_eq!(request["action"], "ping", "unexpected frame: {text}");
                }
            }
        }
    }

    /// Push a raw text frame to the gateway.
    pub fn send(&self, text: &str) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.unbounded_send(Ok(text.to_string()));
        }
    }

    /// Expect the auth frame and accept it.
    pub async fn accept_auth(&mut self) {
        let auth = self.next_request().await;
        assert_eq!(auth["action"], "auth");
        self.send(r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#);
    }

    /// Expect the auth frame and reject it.
    pub async fn reject_auth(&mut self) {
        let auth = self.next_request().await;
        assert_eq!(auth["action"], "auth");
        self.send(r#"[{"ev":"status","status":"auth_failed","message":"authentication failed"}]"#);
    }

    /// Drop the connection from the server side.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Fail the connection with a transport error.
    pub fn fail(&self, error: TransportError) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.unbounded_send(Err(error));
        }
    }
}

/// Connector handing out in-memory sessions.
pub struct MockConnector {
    refuse: AtomicBool,
    attempts: AtomicUsize,
    sessions: mpsc::UnboundedSender<ServerSide>,
}

impl MockConnector {
    /// Create a connector and the receiver of its sessions.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                refuse: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
                sessions: tx,
            }),
            rx,
        )
    }

    /// Make every subsequent connect fail.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connect calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (out_tx, out_rx) = fmpsc::unbounded::<String>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<String, TransportError>>();

        let sink = out_tx.sink_map_err(|_| TransportError::Closed("server gone".to_string()));
        let _ = self.sessions.send(ServerSide {
            outbound: out_rx,
            inbound: Some(in_tx),
        });

        Ok((Box::pin(sink), Box::pin(in_rx)))
    }
}

/// Next session opened by the gateway.
pub async fn next_session(sessions: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    tokio::time::timeout(WAIT, sessions.recv())
        .await
        .expect("timed out waiting for a connect")
        .expect("connector dropped")
}

/// Poll until the connection reaches `state`.
pub async fn wait_for_state(connection: &ConnectionManager, state: ConnectionState) {
    let reached = tokio::time::timeout(WAIT, async {
        while connection.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "expected {state}, still {}",
        connection.state()
    );
}

/// Channel entries of a subscribe/unsubscribe frame.
pub fn entries(request: &Value) -> BTreeSet<String> {
    request["params"]
        .as_str()
        .unwrap_or_default()
        .split(',')
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Observer that ignores everything.
pub struct Noop;

impl MarketDataObserver for Noop {}

/// Convenience: owned symbols.
pub fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

/// Convenience: an entry set for comparison with [`entries`].
pub fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(ToString::to_string).collect()
}
