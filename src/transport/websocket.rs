//! WebSocket transport.
//!
//! Connects to the Malcolm service's WebSocket endpoint and pumps JSON text
//! frames between the socket and the [`Link`] channels.
//!
//! # Pump Task
//!
//! Each connection spawns one tokio task that handles:
//!
//! - Incoming text messages → `Link::inbound`
//! - Outgoing envelopes from `Link::outbound` → socket
//! - Socket close / error → drops the inbound sender (transport loss)

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace};
use url::Url;

use crate::error::{Error, Result};

use super::{Link, Transport};

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Transport speaking JSON over a WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
}

impl WebSocketTransport {
    /// Creates a transport for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL is malformed or its scheme is not
    /// `ws`/`wss`.
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::config(format!("Invalid URL '{url}': {e}")))?;

        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            scheme => Err(Error::config(format!(
                "Unsupported URL scheme '{scheme}', expected ws or wss"
            ))),
        }
    }

    /// Target URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Moves frames between the socket and the link channels until either
    /// side goes away.
    async fn run_pump(
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        inbound_tx: mpsc::UnboundedSender<String>,
    ) {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(text.as_str().to_owned()).is_err() {
                                debug!("Inbound receiver dropped");
                                let _ = ws_write.close().await;
                                break;
                            }
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!("WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            break;
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            break;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(text) => {
                            if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                                error!(error = %e, "WebSocket send failed");
                                break;
                            }
                            trace!("Frame written");
                        }

                        None => {
                            debug!("Outbound channel closed");
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }
            }
        }

        debug!("Pump task terminated");
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Link> {
        let (ws_stream, _response) = connect_async(self.url.as_str()).await?;

        info!(url = %self.url, "WebSocket connection established");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run_pump(ws_stream, outbound_rx, inbound_tx));

        Ok(Link::new(outbound_tx, inbound_rx))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{sleep, timeout};

    use crate::transport::{ConnectionManager, ReconnectPolicy};

    const WAIT: Duration = Duration::from_secs(2);

    async fn local_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        (listener, url)
    }

    async fn accept_one(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.expect("accept");
        tokio_tungstenite::accept_async(stream).await.expect("handshake")
    }

    async fn next_text(server: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            let message = timeout(WAIT, server.next())
                .await
                .expect("frame")
                .expect("open")
                .expect("message");
            if let Message::Text(text) = message {
                return text.as_str().to_owned();
            }
        }
    }

    #[test]
    fn test_accepts_ws_urls() {
        assert!(WebSocketTransport::new("ws://localhost:8008").is_ok());
        assert!(WebSocketTransport::new("wss://malcolm.example:443/ws").is_ok());
    }

    #[test]
    fn test_rejects_other_schemes() {
        let err = WebSocketTransport::new("http://localhost:8008").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_rejects_malformed_url() {
        assert!(WebSocketTransport::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let transport = WebSocketTransport::new(&format!("ws://127.0.0.1:{port}")).expect("url");
        assert!(transport.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_pump_round_trip_and_remote_close() {
        let (listener, url) = local_server().await;
        let transport = WebSocketTransport::new(&url).expect("url");

        let (link, mut server) = tokio::join!(transport.connect(), accept_one(&listener));
        let mut link = link.expect("link");

        let request = r#"{"id":0,"type":"Get","endpoint":"state"}"#;
        link.outbound.send(request.to_owned()).expect("queue");
        assert_eq!(next_text(&mut server).await, request);

        let reply = r#"{"id":0,"type":"Return","value":"Ready"}"#;
        server.send(Message::Text(reply.into())).await.expect("reply");
        let received = timeout(WAIT, link.inbound.recv()).await.expect("reply");
        assert_eq!(received.as_deref(), Some(reply));

        server.send(Message::Close(None)).await.expect("close");
        let closed = timeout(WAIT, link.inbound.recv()).await.expect("closed");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_dropping_outbound_closes_socket() {
        let (listener, url) = local_server().await;
        let transport = WebSocketTransport::new(&url).expect("url");

        let (link, mut server) = tokio::join!(transport.connect(), accept_one(&listener));
        drop(link.expect("link"));

        let message = timeout(WAIT, server.next()).await.expect("close frame");
        assert!(matches!(message, Some(Ok(Message::Close(_))) | None));
    }

    #[tokio::test]
    async fn test_manager_over_websocket_reports_remote_close() {
        let (listener, url) = local_server().await;
        let transport = WebSocketTransport::new(&url).expect("url");
        let policy = ReconnectPolicy::new(Duration::from_secs(5), Duration::from_secs(5));
        let manager = ConnectionManager::start(transport, policy).expect("start");

        let mut server = accept_one(&listener).await;
        drop(listener);
        manager.wait_connected(WAIT).await.expect("connected");

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        manager.subscribe_connection_state("test", Arc::new(move |up: bool| sink.lock().push(up)));

        let caller = manager.clone();
        let envelope = manager.envelopes().new_get("state");
        let call = tokio::spawn(async move { caller.send_and_wait("test", &envelope, WAIT).await });

        let request: Value = serde_json::from_str(&next_text(&mut server).await).expect("json");
        assert_eq!(request["endpoint"], "state");
        let reply = json!({ "id": request["id"], "type": "Return", "value": "Ready" });
        server
            .send(Message::Text(reply.to_string().into()))
            .await
            .expect("reply");

        let frame = call.await.expect("join").expect("frame");
        assert_eq!(frame.value(), Some(&json!("Ready")));

        server.send(Message::Close(None)).await.expect("close");
        timeout(WAIT, async {
            while events.lock().is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("loss reported");

        sleep(Duration::from_millis(50)).await;
        assert_eq!(*events.lock(), vec![false]);
        assert!(!manager.is_connected());

        manager.disconnect();
    }
}
