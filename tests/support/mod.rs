#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;

use voicegate::backend::{BrokerMessage, MemoryBroker, MemoryDialer, MemorySubscriber};
use voicegate::errors::AdmissionError;
use voicegate::gateway::GatewayMetrics;
use voicegate::{ConnectionPool, Gateway, SessionEnd, SessionSettings, SlotManager};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const TARGET: &str = "memory://backend";
pub const WAIT: Duration = Duration::from_secs(5);

const DUPLEX_BUFFER: usize = 64 * 1024;

// -----------------------------------------------------------------------------
// ----- Harness ---------------------------------------------------------------

/// A gateway wired to an in-process broker, without any network listener.
pub struct Harness {
    pub broker: MemoryBroker,
    pub gateway: Arc<Gateway<MemoryDialer>>,
    pub shutdown: CancellationToken,
}

pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        inactivity_timeout: Duration::from_secs(3),
        reply_timeout: Duration::from_secs(2),
        ..SessionSettings::default()
    }
}

pub async fn harness(slots: usize, pool_size: usize, settings: SessionSettings) -> Harness {
    let broker = MemoryBroker::new();
    let (pool, fill_error) = ConnectionPool::new(TARGET, pool_size, broker.dialer()).await;
    assert!(fill_error.is_none(), "pool fill failed: {fill_error:?}");

    let shutdown = CancellationToken::new();
    let gateway = Arc::new(Gateway::new(
        Arc::new(pool),
        Arc::new(SlotManager::new("voice", slots)),
        settings,
        GatewayMetrics::new().expect("fresh registry"),
        shutdown.clone(),
    ));

    Harness {
        broker,
        gateway,
        shutdown,
    }
}

impl Harness {
    /// Admits a session and runs it against one end of an in-memory socket.
    pub async fn connect(&self) -> Result<Client, AdmissionError> {
        let admission = self.gateway.admit().await?;
        let slot = admission.slot().to_string();
        let connection_id = admission.connection_id();

        let (server_io, client_io) = tokio::io::duplex(DUPLEX_BUFFER);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let gateway = Arc::clone(&self.gateway);
        let session = tokio::spawn(async move { gateway.run_session(admission, server).await });

        Ok(Client {
            ws,
            slot,
            connection_id,
            session,
        })
    }

    /// Backend side of a slot: receives what the gateway publishes there.
    pub fn backend(&self, slot: &str) -> MemorySubscriber {
        self.broker.subscribe(slot)
    }

    pub fn reply(&self, to: &BrokerMessage, payload: &str) {
        let reply_to = to.reply_to.as_deref().expect("chunk carries a reply subject");
        let delivered = self
            .broker
            .publish(reply_to, None, payload.as_bytes().to_vec().into());
        assert_eq!(delivered, 1, "reply subject should have one subscriber");
    }

    pub fn assert_idle(&self) {
        let slots = self.gateway.slots();
        assert_eq!(slots.available(), slots.capacity(), "every slot returned");
        assert_eq!(
            self.gateway.pool().available(),
            self.gateway.pool().capacity(),
            "every connection returned"
        );
    }
}

// -----------------------------------------------------------------------------
// ----- Client ----------------------------------------------------------------

pub struct Client {
    pub ws: WebSocketStream<DuplexStream>,
    pub slot: String,
    pub connection_id: u64,
    pub session: JoinHandle<SessionEnd>,
}

impl Client {
    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("send text frame");
    }

    pub async fn send_audio(&mut self, chunk: &[u8]) {
        self.ws
            .send(Message::Binary(chunk.to_vec()))
            .await
            .expect("send audio frame");
    }

    pub async fn start(&mut self) {
        self.send_text(r#"{"action":"start"}"#).await;
    }

    pub async fn stop(&mut self) {
        self.send_text(r#"{"action":"stop"}"#).await;
    }

    /// Next text frame from the gateway, skipping control frames.
    pub async fn next_text(&mut self) -> String {
        loop {
            let message = timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket ended")
                .expect("socket error");

            match message {
                Message::Text(text) => return text,
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    /// Reads until the gateway closes the socket.
    pub async fn expect_closed(&mut self) {
        loop {
            match timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for close")
            {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }

    pub async fn finish(self) -> SessionEnd {
        timeout(WAIT, self.session)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }
}

pub async fn recv_chunk(backend: &mut MemorySubscriber) -> BrokerMessage {
    timeout(WAIT, backend.recv())
        .await
        .expect("timed out waiting for a published chunk")
        .expect("broker dropped the subscription")
}
