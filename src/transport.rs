pub use ranchat_core::net::{Transport, TransportEvent, TransportFactory};
pub use ranchat_tokio_transport::TokioWebSocketTransportFactory;

/// In-memory signaling server for tests. Records every frame the client
/// writes and lets the test push server frames or drop the link.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use tokio::sync::mpsc;

    struct Connection {
        events: Option<mpsc::Sender<TransportEvent>>,
        sent: Vec<Value>,
    }

    impl Connection {
        fn deliver(&self, event: TransportEvent) {
            if let Some(events) = &self.events {
                let _ = events.try_send(event);
            }
        }
    }

    struct State {
        connections: Vec<Connection>,
        dials: usize,
        dialed: Vec<String>,
        fail_next: usize,
        auto_register: bool,
        auto_enqueue: bool,
    }

    /// A scripted control channel endpoint.
    ///
    /// By default `register` is answered with `registered` and `enqueue`
    /// with `enqueued`.
    #[derive(Clone)]
    pub struct MockTransportFactory {
        state: Arc<Mutex<State>>,
    }

    impl Default for MockTransportFactory {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockTransportFactory {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(State {
                    connections: Vec::new(),
                    dials: 0,
                    dialed: Vec::new(),
                    fail_next: 0,
                    auto_register: true,
                    auto_enqueue: true,
                })),
            }
        }

        /// Leaves `register` unanswered.
        pub fn without_auto_register(self) -> Self {
            self.lock().auto_register = false;
            self
        }

        pub fn without_auto_enqueue(self) -> Self {
            self.lock().auto_enqueue = false;
            self
        }

        /// Makes the next `n` dials fail.
        pub fn fail_next_dials(&self, n: usize) {
            self.lock().fail_next = n;
        }

        /// Pushes a server frame on the newest open connection.
        pub fn push(&self, frame: Value) {
            let state = self.lock();
            if let Some(conn) = state.connections.iter().rev().find(|c| c.events.is_some()) {
                conn.deliver(TransportEvent::TextReceived(frame.to_string()));
            }
        }

        /// Pushes raw text, e.g. a malformed frame.
        pub fn push_text(&self, text: &str) {
            let state = self.lock();
            if let Some(conn) = state.connections.iter().rev().find(|c| c.events.is_some()) {
                conn.deliver(TransportEvent::TextReceived(text.to_string()));
            }
        }

        /// Simulates the server dropping the newest open connection.
        pub fn drop_connection(&self) {
            let mut state = self.lock();
            if let Some(conn) = state
                .connections
                .iter_mut()
                .rev()
                .find(|c| c.events.is_some())
            {
                conn.deliver(TransportEvent::Disconnected);
                conn.events = None;
            }
        }

        pub fn dial_count(&self) -> usize {
            self.lock().dials
        }

        /// Endpoints in dial order, failed dials included.
        pub fn dialed_urls(&self) -> Vec<String> {
            self.lock().dialed.clone()
        }

        pub fn open_connections(&self) -> usize {
            self.lock()
                .connections
                .iter()
                .filter(|c| c.events.is_some())
                .count()
        }

        /// Every frame written by the client, across all connections.
        pub fn sent(&self) -> Vec<Value> {
            self.lock()
                .connections
                .iter()
                .flat_map(|c| c.sent.iter().cloned())
                .collect()
        }

        /// The `type` of every frame written, with relays shown as `signal:<kind>`.
        pub fn sent_types(&self) -> Vec<String> {
            self.sent().iter().map(describe).collect()
        }

        fn lock(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    fn describe(frame: &Value) -> String {
        let kind = frame["type"].as_str().unwrap_or("?");
        match frame["data"]["type"].as_str() {
            Some(inner) if kind == "signal" => format!("signal:{inner}"),
            _ => kind.to_string(),
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
            url: &str,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            let mut state = self.lock();
            state.dials += 1;
            state.dialed.push(url.to_string());
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(anyhow::anyhow!("connection refused"));
            }

            let (tx, rx) = mpsc::channel(256);
            let _ = tx.try_send(TransportEvent::Connected);
            state.connections.push(Connection {
                events: Some(tx),
                sent: Vec::new(),
            });
            let transport = MockTransport {
                index: state.connections.len() - 1,
                state: self.state.clone(),
            };
            Ok((Arc::new(transport), rx))
        }
    }

    struct MockTransport {
        index: usize,
        state: Arc<Mutex<State>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_text(&self, text: &str) -> Result<(), anyhow::Error> {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let (auto_register, auto_enqueue) = (state.auto_register, state.auto_enqueue);
            let conn = &mut state.connections[self.index];
            if conn.events.is_none() {
                return Err(anyhow::anyhow!("Socket is closed"));
            }

            let frame: Value = serde_json::from_str(text)?;
            let reply = match frame["type"].as_str() {
                Some("register") if auto_register => Some(json!({"type": "registered"})),
                Some("enqueue") if auto_enqueue => Some(json!({"type": "enqueued"})),
                _ => None,
            };
            conn.sent.push(frame);
            if let Some(reply) = reply {
                conn.deliver(TransportEvent::TextReceived(reply.to_string()));
            }
            Ok(())
        }

        async fn disconnect(&self) {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.connections[self.index].events = None;
        }
    }
}
