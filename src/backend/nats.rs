//! NATS implementation of the backend seam.
//!
//! One `async_nats::Client` per pooled connection. Replies arrive on a plain
//! subscription to a `new_inbox()` subject, so each session owns exactly one
//! inbox for its whole lifetime.

use std::path::PathBuf;
use std::time::Duration;

use async_nats::{Client, ConnectOptions, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use super::{BackendConnection, Dialer, Mailbox};
use crate::errors::BackendError;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// -----------------------------------------------------------------------------
// ----- NatsDialer ------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NatsDialer {
    name: String,
    credentials_file: Option<PathBuf>,
    token: Option<SecretString>,
}

impl NatsDialer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credentials_file: None,
            token: None,
        }
    }

    pub fn with_credentials_file(mut self, path: Option<PathBuf>) -> Self {
        self.credentials_file = path;
        self
    }

    pub fn with_token(mut self, token: Option<SecretString>) -> Self {
        self.token = token;
        self
    }
}

#[async_trait]
impl Dialer for NatsDialer {
    type Connection = NatsConnection;

    async fn dial(&self, target: &str) -> Result<NatsConnection, BackendError> {
        let connect_error = |reason: String| BackendError::Connect {
            target: target.to_string(),
            reason,
        };

        let mut options = ConnectOptions::new()
            .name(&self.name)
            .connection_timeout(CONNECT_TIMEOUT);

        if let Some(path) = &self.credentials_file {
            options = options.credentials_file(path).await.map_err(|e| {
                connect_error(format!("credentials {}: {e}", path.display()))
            })?;
        }

        if let Some(token) = &self.token {
            options = options.token(token.expose_secret().to_string());
        }

        let client = options
            .connect(target)
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        info!("connected to NATS at {target}");
        Ok(NatsConnection { client })
    }
}

// -----------------------------------------------------------------------------
// ----- NatsConnection --------------------------------------------------------

#[derive(Debug)]
pub struct NatsConnection {
    client: Client,
}

#[async_trait]
impl BackendConnection for NatsConnection {
    type Mailbox = NatsMailbox;

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    async fn subscribe(&self, subject: &str) -> Result<NatsMailbox, BackendError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BackendError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;

        Ok(NatsMailbox { subscriber })
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Bytes,
    ) -> Result<(), BackendError> {
        self.client
            .publish_with_reply(subject.to_string(), reply_to.to_string(), payload)
            .await
            .map_err(|e| BackendError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    fn close(self) {
        // The connection task exits once every client handle is gone.
        debug!("closing NATS connection");
        drop(self.client);
    }
}

// -----------------------------------------------------------------------------
// ----- NatsMailbox -----------------------------------------------------------

#[derive(Debug)]
pub struct NatsMailbox {
    subscriber: Subscriber,
}

#[async_trait]
impl Mailbox for NatsMailbox {
    async fn next_reply(&mut self, timeout: Duration) -> Result<Bytes, BackendError> {
        match tokio::time::timeout(timeout, self.subscriber.next()).await {
            Ok(Some(message)) => Ok(message.payload),
            Ok(None) => Err(BackendError::MailboxClosed),
            Err(_) => Err(BackendError::ReplyTimeout(timeout)),
        }
    }

    async fn unsubscribe(&mut self) {
        if let Err(err) = self.subscriber.unsubscribe().await {
            debug!("unsubscribe failed: {err}");
        }
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
