/// Tokio-based WebSocket transport for the ranchat control channel.
///
/// This crate provides a concrete implementation of the Transport trait
/// using tokio-tungstenite. Frames are JSON text; binary frames are ignored.
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use ranchat_core::net::{Transport, TransportEvent, TransportFactory};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// Tokio WebSocket transport
pub struct TokioWebSocketTransport {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Arc::new(Mutex::new(Some(sink))),
        }
    }
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send_text(&self, text: &str) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        debug!("--> Sending frame: {} bytes", text.len());
        sink.send(Message::text(text))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!("WebSocket close error: {e}");
            }
        }
    }
}

/// Factory for creating Tokio WebSocket transports
#[derive(Debug, Default, Clone)]
pub struct TokioWebSocketTransportFactory;

impl TokioWebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!("Dialing {url}");
        let (client, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();
        let (event_tx, event_rx) = mpsc::channel(100);
        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        // Connected goes first so the reader never sees a frame before it.
        let _ = event_tx.send(TransportEvent::Connected).await;
        tokio::task::spawn(read_pump(stream, event_tx));

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!("<-- Received frame: {} bytes", text.len());
                if event_tx
                    .send(TransportEvent::TextReceived(text.as_str().to_string()))
                    .await
                    .is_err()
                {
                    warn!("Event receiver dropped, closing read pump");
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                trace!("Received close frame: {frame:?}");
                break;
            }
            Some(Ok(other)) => {
                trace!("Ignoring non-text frame: {other:?}");
            }
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!("Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn text_frames_round_trip_through_a_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    ws.send(Message::text(format!("echo:{}", text.as_str())))
                        .await
                        .unwrap();
                    break;
                }
            }
            ws.close(None).await.ok();
        });

        let factory = TokioWebSocketTransportFactory::new();
        let (transport, mut events) = factory
            .create_transport(&format!("ws://{addr}"))
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        transport.send_text(r#"{"type":"hello"}"#).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::TextReceived(r#"echo:{"type":"hello"}"#.into()))
        );
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnected));

        transport.disconnect().await;
        assert!(transport.send_text("late").await.is_err());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_failure_is_reported() {
        let factory = TokioWebSocketTransportFactory::new();
        assert!(factory.create_transport("ws://127.0.0.1:1").await.is_err());
    }
}
