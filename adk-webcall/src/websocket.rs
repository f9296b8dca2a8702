//! WebSocket signaling transport.
//!
//! Each link runs two tasks: a writer draining an outbound queue into the
//! socket sink, and a reader forwarding text frames as [`LinkEvent`]s.
//! Binary frames are decoded lossily; malformed content is left to the
//! message classifier rather than ending the link.

use crate::error::{Result, WebCallError};
use crate::signaling::{BoxedLink, LinkEvent, LinkEvents, SignalingConnector, SignalingLink};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

/// Opens [`WebSocketLink`]s with `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    _private: (),
}

impl WebSocketConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<(BoxedLink, LinkEvents)> {
        let request = url.into_client_request().map_err(|e| {
            WebCallError::signaling(format!("Failed to create client request: {}", e))
        })?;
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| WebCallError::signaling(format!("WebSocket connect error: {}", e)))?;
        debug!(url, "Signaling WebSocket connected");

        let (mut sink, mut source) = stream.split();
        let closed = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "Signaling send failed");
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        let reader_closed = closed.clone();
        let reader = tokio::spawn(async move {
            let event = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events_tx.send(LinkEvent::Message(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if events_tx.send(LinkEvent::Message(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break LinkEvent::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break LinkEvent::Error(format!("Receive error: {}", e)),
                }
            };
            if !reader_closed.swap(true, Ordering::SeqCst) {
                let _ = events_tx.send(event);
            }
        });

        let link = WebSocketLink { closed, outbound: outbound_tx, writer, reader };
        Ok((Arc::new(link), events_rx))
    }
}

/// An open WebSocket signaling link.
pub struct WebSocketLink {
    closed: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Message>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl WebSocketLink {
    /// Whether the link is closed, locally or by the peer.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingLink for WebSocketLink {
    fn send_text(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(WebCallError::signaling("Signaling link is closed"));
        }
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| WebCallError::signaling("Signaling writer stopped"))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.reader.abort();
        // The writer exits after flushing the close frame.
        let _ = self.outbound.send(Message::Close(None));
        debug!("Signaling WebSocket closed");
        Ok(())
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for WebSocketLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketLink").field("closed", &self.is_closed()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(_) => ws.send(message).await.unwrap(),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });
        format!("ws://{addr}/webrtc-call")
    }

    #[tokio::test]
    async fn test_round_trip_and_close() {
        let url = echo_server().await;
        let (link, mut events) = WebSocketConnector::new().connect(&url).await.unwrap();

        link.send_text(r#"{"type":"ping"}"#.to_string()).unwrap();
        assert_eq!(events.recv().await, Some(LinkEvent::Message(r#"{"type":"ping"}"#.to_string())));

        link.close().await.unwrap();
        link.close().await.unwrap();
        assert!(link.send_text("late".to_string()).is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_is_signaling_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = WebSocketConnector::new().connect(&format!("ws://{addr}")).await.err().unwrap();
        assert!(matches!(err, WebCallError::SignalingTransportError(_)));
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let (_link, mut events) =
            WebSocketConnector::new().connect(&format!("ws://{addr}")).await.unwrap();
        assert_eq!(events.recv().await, Some(LinkEvent::Closed));
    }

    #[tokio::test]
    async fn test_invalid_binary_frame_keeps_link_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Binary(vec![0xffu8, 0xfe].into())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"chunk","payload":1}"#.into())).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        });

        let (link, mut events) =
            WebSocketConnector::new().connect(&format!("ws://{addr}")).await.unwrap();
        match events.recv().await {
            Some(LinkEvent::Message(text)) => assert!(text.contains('\u{fffd}')),
            other => panic!("Expected a lossy message, got {other:?}"),
        }
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Message(r#"{"type":"chunk","payload":1}"#.to_string()))
        );
        assert!(link.send_text(r#"{"type":"ping"}"#.to_string()).is_ok());
        link.close().await.unwrap();
    }
}
