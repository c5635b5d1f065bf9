//! In-process broker implementing the backend seam.
//!
//! Subjects fan out to every live subscriber in publish order. The broker
//! also counts dials and closes and can be told to refuse dials or fail
//! publishes, which is what the pool and session tests lean on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;

use super::{BackendConnection, Dialer, Mailbox};
use crate::errors::BackendError;

// -----------------------------------------------------------------------------
// ----- MemoryBroker ----------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug, Default)]
struct BrokerInner {
    subjects: Mutex<HashMap<String, Vec<Route>>>,
    next_sid: AtomicU64,
    dials: AtomicUsize,
    closes: AtomicUsize,
    dial_limit: Mutex<Option<usize>>,
    fail_publishes: AtomicBool,
}

#[derive(Debug)]
struct Route {
    sid: u64,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

// -----------------------------------------------------------------------------
// ----- MemoryBroker: Public --------------------------------------------------

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialer(&self) -> MemoryDialer {
        MemoryDialer {
            broker: self.clone(),
        }
    }

    pub fn subscribe(&self, subject: &str) -> MemorySubscriber {
        let (tx, rx) = mpsc::unbounded_channel();
        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);

        self.inner
            .subjects
            .lock()
            .entry(subject.to_string())
            .or_default()
            .push(Route { sid, tx });

        MemorySubscriber {
            broker: self.clone(),
            subject: subject.to_string(),
            sid,
            rx,
            active: true,
        }
    }

    /// Returns how many subscribers received the message.
    pub fn publish(&self, subject: &str, reply_to: Option<&str>, payload: Bytes) -> usize {
        let message = BrokerMessage {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            payload,
        };

        let mut subjects = self.inner.subjects.lock();
        let Some(routes) = subjects.get_mut(subject) else {
            return 0;
        };

        routes.retain(|route| !route.tx.is_closed());
        routes
            .iter()
            .filter(|route| route.tx.send(message.clone()).is_ok())
            .count()
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .subjects
            .lock()
            .get(subject)
            .map_or(0, |routes| routes.len())
    }

    /// Dials beyond `limit` are refused; `None` lifts the limit.
    pub fn set_dial_limit(&self, limit: Option<usize>) {
        *self.inner.dial_limit.lock() = limit;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }
}

// -----------------------------------------------------------------------------
// ----- MemoryBroker: Private -------------------------------------------------

impl MemoryBroker {
    fn remove_route(&self, subject: &str, sid: u64) {
        let mut subjects = self.inner.subjects.lock();
        if let Some(routes) = subjects.get_mut(subject) {
            routes.retain(|route| route.sid != sid);
            if routes.is_empty() {
                subjects.remove(subject);
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- MemoryDialer ----------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MemoryDialer {
    broker: MemoryBroker,
}

#[async_trait]
impl Dialer for MemoryDialer {
    type Connection = MemoryConnection;

    async fn dial(&self, target: &str) -> Result<MemoryConnection, BackendError> {
        let inner = &self.broker.inner;
        let limit = *inner.dial_limit.lock();
        if let Some(limit) = limit {
            if inner.dials.load(Ordering::SeqCst) >= limit {
                return Err(BackendError::Connect {
                    target: target.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
        }

        inner.dials.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            broker: self.broker.clone(),
        })
    }
}

// -----------------------------------------------------------------------------
// ----- MemoryConnection ------------------------------------------------------

#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    type Mailbox = MemorySubscriber;

    fn new_inbox(&self) -> String {
        let mut rng = rand::rng();
        format!(
            "_INBOX.{:016x}{:016x}",
            rng.random::<u64>(),
            rng.random::<u64>()
        )
    }

    async fn subscribe(&self, subject: &str) -> Result<MemorySubscriber, BackendError> {
        Ok(self.broker.subscribe(subject))
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Bytes,
    ) -> Result<(), BackendError> {
        if self.broker.inner.fail_publishes.load(Ordering::SeqCst) {
            return Err(BackendError::Publish {
                subject: subject.to_string(),
                reason: "connection reset".to_string(),
            });
        }

        self.broker.publish(subject, Some(reply_to), payload);
        Ok(())
    }

    fn close(self) {
        self.broker.inner.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// -----------------------------------------------------------------------------
// ----- MemorySubscriber ------------------------------------------------------

#[derive(Debug)]
pub struct MemorySubscriber {
    broker: MemoryBroker,
    subject: String,
    sid: u64,
    rx: mpsc::UnboundedReceiver<BrokerMessage>,
    active: bool,
}

impl MemorySubscriber {
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BrokerMessage> {
        self.rx.try_recv().ok()
    }

    fn detach(&mut self) {
        if std::mem::replace(&mut self.active, false) {
            self.broker.remove_route(&self.subject, self.sid);
            self.rx.close();
        }
    }
}

#[async_trait]
impl Mailbox for MemorySubscriber {
    async fn next_reply(&mut self, timeout: Duration) -> Result<Bytes, BackendError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => Ok(message.payload),
            Ok(None) => Err(BackendError::MailboxClosed),
            Err(_) => Err(BackendError::ReplyTimeout(timeout)),
        }
    }

    async fn unsubscribe(&mut self) {
        self.detach();
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        self.detach();
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber_in_order() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("voice-0");
        let mut b = broker.subscribe("voice-0");

        assert_eq!(broker.publish("voice-0", Some("_INBOX.x"), Bytes::from_static(b"1")), 2);
        assert_eq!(broker.publish("voice-0", None, Bytes::from_static(b"2")), 2);

        for sub in [&mut a, &mut b] {
            let first = sub.recv().await.unwrap();
            assert_eq!(first.payload, Bytes::from_static(b"1"));
            assert_eq!(first.reply_to.as_deref(), Some("_INBOX.x"));
            assert_eq!(sub.recv().await.unwrap().payload, Bytes::from_static(b"2"));
        }
    }

    #[tokio::test]
    async fn unsubscribe_detaches_route() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("_INBOX.a");
        assert_eq!(broker.subscriber_count("_INBOX.a"), 1);

        sub.unsubscribe().await;
        sub.unsubscribe().await;
        assert_eq!(broker.subscriber_count("_INBOX.a"), 0);
        assert_eq!(broker.publish("_INBOX.a", None, Bytes::new()), 0);
    }

    #[tokio::test]
    async fn next_reply_times_out() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("_INBOX.b");
        let err = sub.next_reply(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, BackendError::ReplyTimeout(_)));
    }

    #[tokio::test]
    async fn dial_limit_refuses_extra_connections() {
        let broker = MemoryBroker::new();
        broker.set_dial_limit(Some(1));
        let dialer = broker.dialer();

        let conn = dialer.dial("memory").await.unwrap();
        assert!(dialer.dial("memory").await.is_err());
        conn.close();

        assert_eq!(broker.dials(), 1);
        assert_eq!(broker.closes(), 1);
    }

    #[tokio::test]
    async fn inboxes_are_unique() {
        let broker = MemoryBroker::new();
        let conn = broker.dialer().dial("memory").await.unwrap();
        assert_ne!(conn.new_inbox(), conn.new_inbox());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
