use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::control;
use super::stages::{self, StageErrors};
use crate::backend::{BackendConnection, Dialer, Mailbox};
use crate::errors::{SessionEnd, SessionError};
use crate::gateway::{ConnectionLease, SlotGuard};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const CLOSE_GRACE: Duration = Duration::from_secs(1);

// -----------------------------------------------------------------------------
// ----- SessionSettings -------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Audio chunks buffered between the reader and the relay.
    pub inbound_capacity: usize,
    /// Frames buffered between the listener and the client socket.
    pub outbound_capacity: usize,
    /// Session ends after this long without anything sent to the client.
    pub inactivity_timeout: Duration,
    /// Per-read wait on the reply subscription.
    pub reply_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            inbound_capacity: 30,
            outbound_capacity: 30,
            inactivity_timeout: Duration::from_secs(60),
            reply_timeout: Duration::from_secs(30),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Session ---------------------------------------------------------------

/// One client connection bridged to one slot over one borrowed connection.
pub struct Session<D: Dialer> {
    id: Uuid,
    slot: SlotGuard,
    connection: ConnectionLease<D>,
    settings: SessionSettings,
}

// -----------------------------------------------------------------------------
// ----- Session: Static -------------------------------------------------------

impl<D: Dialer> Session<D> {
    pub fn new(slot: SlotGuard, connection: ConnectionLease<D>, settings: SessionSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            slot,
            connection,
            settings,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Session: Public -------------------------------------------------------

impl<D: Dialer> Session<D> {
    /// Runs the session to completion. The slot and the connection are back
    /// with their owners when this returns, whatever the cause.
    pub async fn run<T>(self, ws: WebSocketStream<T>, shutdown: CancellationToken) -> SessionEnd
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let span = info_span!(
            "session",
            id = %self.id,
            slot = %self.slot.slot(),
            connection = self.connection.id()
        );

        async move {
            let end = self.relay(ws, shutdown).await;
            match &end {
                SessionEnd::Failed(err) => error!("session failed: {err}"),
                end => info!("session ended: {end}"),
            }
            end
        }
        .instrument(span)
        .await
    }
}

// -----------------------------------------------------------------------------
// ----- Session: Private ------------------------------------------------------

impl<D: Dialer> Session<D> {
    async fn relay<T>(self, mut ws: WebSocketStream<T>, shutdown: CancellationToken) -> SessionEnd
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Session {
            slot,
            connection,
            settings,
            ..
        } = self;

        // The reply subscription must exist before anything is published.
        let reply_to = connection.connection().new_inbox();
        let mailbox = match connection.connection().subscribe(&reply_to).await {
            Ok(mailbox) => mailbox,
            Err(err) => {
                close_client(&mut ws).await;
                connection.release();
                slot.release();
                return SessionEnd::Failed(SessionError::BackendSubscribe(err));
            }
        };
        debug!(%reply_to, "reply subscription ready");

        let notice = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(SessionEnd::Shutdown),
            _ = tokio::time::sleep(settings.inactivity_timeout) => Err(SessionEnd::from(
                SessionError::InactivityTimeout(settings.inactivity_timeout),
            )),
            sent = ws.send(control::listening_notice()) => {
                sent.map_err(|err| SessionEnd::from(SessionError::Transport(err)))
            }
        };
        if let Err(end) = notice {
            let mut mailbox = mailbox;
            close_client(&mut ws).await;
            connection.release();
            slot.release();
            mailbox.unsubscribe().await;
            return end;
        }

        let cancel = shutdown.child_token();
        let (mut sink, stream) = ws.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_capacity);
        let (errors, error_rx) = StageErrors::channel();

        let reader = tokio::spawn(
            stages::read_client(
                stream,
                inbound_tx,
                outbound_tx.clone(),
                errors.clone(),
                cancel.clone(),
            )
            .in_current_span(),
        );
        let relay = tokio::spawn(
            stages::relay_to_backend(
                connection,
                slot.slot().clone(),
                reply_to,
                inbound_rx,
                errors.clone(),
                cancel.clone(),
            )
            .in_current_span(),
        );
        let listener = tokio::spawn(
            stages::listen_for_replies(
                mailbox,
                settings.reply_timeout,
                outbound_tx,
                errors,
                cancel.clone(),
            )
            .in_current_span(),
        );

        let end = supervise(
            &mut sink,
            outbound_rx,
            error_rx,
            &shutdown,
            settings.inactivity_timeout,
        )
        .await;

        // Teardown, in order: stages, client, connection, slot, subscription.
        cancel.cancel();

        if tokio::time::timeout(CLOSE_GRACE, sink.close()).await.is_err() {
            debug!("client close timed out");
        }

        match relay.await {
            Ok(connection) => connection.release(),
            Err(err) => warn!("relay stage aborted; its lease was dropped in place: {err}"),
        }

        slot.release();

        match listener.await {
            Ok(mut mailbox) => mailbox.unsubscribe().await,
            Err(err) => warn!("listener stage aborted; subscription dropped in place: {err}"),
        }

        if let Err(err) = reader.await {
            warn!("reader stage aborted: {err}");
        }

        end
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Supervisor --------------------------------------------------

/// Single writer on the client socket. Returns on the first terminal cause.
/// A write never outlives the inactivity deadline or shutdown, so a client
/// that stops reading cannot pin the session.
async fn supervise<S>(
    sink: &mut S,
    mut outbound: mpsc::Receiver<Message>,
    mut errors: mpsc::Receiver<SessionError>,
    shutdown: &CancellationToken,
    inactivity: Duration,
) -> SessionEnd
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let idle = tokio::time::sleep(inactivity);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => return SessionEnd::Shutdown,

            // Frames queued before an error still go out first.
            Some(message) = outbound.recv() => {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                    _ = &mut idle => {
                        return SessionEnd::from(SessionError::InactivityTimeout(inactivity));
                    }
                    sent = sink.send(message) => {
                        if let Err(err) = sent {
                            return SessionEnd::from(SessionError::Transport(err));
                        }
                    }
                }
                idle.as_mut().reset(Instant::now() + inactivity);
            }

            Some(err) = errors.recv() => {
                if matches!(err, SessionError::ClientClosed) {
                    flush_pending(sink, &mut outbound).await;
                }
                return SessionEnd::from(err);
            }

            _ = &mut idle => {
                return SessionEnd::from(SessionError::InactivityTimeout(inactivity));
            }
        }
    }
}

/// Best effort: frames the reader queued right before the client closed,
/// such as the closing frame for a trailing `stop`.
async fn flush_pending<S>(sink: &mut S, outbound: &mut mpsc::Receiver<Message>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Ok(message) = outbound.try_recv() {
        match tokio::time::timeout(CLOSE_GRACE, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!("pending frame dropped: {err}");
                return;
            }
            Err(_) => {
                debug!("pending frame write timed out");
                return;
            }
        }
    }
}

async fn close_client<T>(ws: &mut WebSocketStream<T>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if let Ok(Err(err)) = tokio::time::timeout(CLOSE_GRACE, ws.close(None)).await {
        debug!("client close failed: {err}");
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future;
    use futures_util::sink;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Written = Arc<Mutex<Vec<Message>>>;

    fn recording_sink(
        written: &Written,
    ) -> impl Sink<Message, Error = tungstenite::Error> + Unpin {
        let written = Arc::clone(written);
        Box::pin(sink::unfold((), move |(), message: Message| {
            let written = Arc::clone(&written);
            async move {
                written.lock().push(message);
                Ok::<_, tungstenite::Error>(())
            }
        }))
    }

    /// A client that never reads: every write stays pending.
    fn stalled_sink() -> impl Sink<Message, Error = tungstenite::Error> + Unpin {
        Box::pin(sink::unfold((), |(), _message: Message| {
            future::pending::<Result<(), tungstenite::Error>>()
        }))
    }

    #[tokio::test]
    async fn closing_frame_goes_out_before_client_close() {
        let written = Written::default();
        let mut sink = recording_sink(&written);
        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        let (errors, error_rx) = StageErrors::channel();

        outbound_tx
            .send(Message::Text(control::CLOSING_FRAME.to_string()))
            .await
            .unwrap();
        errors.report(stages::Stage::Reader, SessionError::ClientClosed);

        let end = supervise(
            &mut sink,
            outbound_rx,
            error_rx,
            &CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(end, SessionEnd::ClientClosed));
        assert_eq!(
            *written.lock(),
            vec![Message::Text(control::CLOSING_FRAME.to_string())]
        );
    }

    #[tokio::test]
    async fn stalled_write_ends_at_the_inactivity_deadline() {
        let mut sink = stalled_sink();
        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        let (_errors, error_rx) = StageErrors::channel();
        outbound_tx.send(Message::Text("reply".into())).await.unwrap();

        let end = tokio::time::timeout(
            Duration::from_secs(5),
            supervise(
                &mut sink,
                outbound_rx,
                error_rx,
                &CancellationToken::new(),
                Duration::from_millis(100),
            ),
        )
        .await
        .expect("supervisor stuck on a stalled write");

        assert!(matches!(
            end,
            SessionEnd::TimedOut(SessionError::InactivityTimeout(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_stalled_write() {
        let mut sink = stalled_sink();
        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        let (_errors, error_rx) = StageErrors::channel();
        outbound_tx.send(Message::Text("reply".into())).await.unwrap();

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let end = tokio::time::timeout(
            Duration::from_secs(5),
            supervise(
                &mut sink,
                outbound_rx,
                error_rx,
                &shutdown,
                Duration::from_secs(60),
            ),
        )
        .await
        .expect("supervisor ignored shutdown");

        assert!(matches!(end, SessionEnd::Shutdown));
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
