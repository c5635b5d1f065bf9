// Backend messaging seam: request/reply over a pub/sub broker.
pub mod memory;
pub mod nats;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::BackendError;

pub use memory::{BrokerMessage, MemoryBroker, MemoryConnection, MemoryDialer, MemorySubscriber};
pub use nats::{NatsConnection, NatsDialer, NatsMailbox};

// -----------------------------------------------------------------------------
// ----- Dialer ----------------------------------------------------------------

/// Opens new backend connections for the pool.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: BackendConnection;

    async fn dial(&self, target: &str) -> Result<Self::Connection, BackendError>;
}

// -----------------------------------------------------------------------------
// ----- BackendConnection -----------------------------------------------------

#[async_trait]
pub trait BackendConnection: Send + Sync + 'static {
    type Mailbox: Mailbox;

    /// Fresh, unguessable reply address. Never reused across sessions.
    fn new_inbox(&self) -> String;

    async fn subscribe(&self, subject: &str) -> Result<Self::Mailbox, BackendError>;

    async fn publish_request(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Bytes,
    ) -> Result<(), BackendError>;

    /// Closing a connection that is already broken is harmless.
    fn close(self)
    where
        Self: Sized;
}

// -----------------------------------------------------------------------------
// ----- Mailbox ---------------------------------------------------------------

/// Synchronous subscription on a reply address.
#[async_trait]
pub trait Mailbox: Send + 'static {
    /// Cancel-safe: dropping the future loses no reply.
    async fn next_reply(&mut self, timeout: Duration) -> Result<Bytes, BackendError>;

    async fn unsubscribe(&mut self);
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
