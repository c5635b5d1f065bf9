// The three concurrent stages of a session. Each stage watches the shared
// cancellation token at every await point and reports at most one terminal
// error. Stages that own a shared resource hand it back when they exit.
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::control::{self, Inbound};
use super::state::SessionState;
use crate::backend::{BackendConnection, Dialer, Mailbox};
use crate::errors::{BackendError, SessionError};
use crate::gateway::ConnectionLease;
use crate::gateway::slots::Slot;

// -----------------------------------------------------------------------------
// ----- Stage -----------------------------------------------------------------

pub(crate) const STAGE_COUNT: usize = 3;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Stage {
    Reader,
    Relay,
    Listener,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Reader => "reader",
            Stage::Relay => "relay",
            Stage::Listener => "listener",
        }
    }
}

// -----------------------------------------------------------------------------
// ----- StageErrors -----------------------------------------------------------

/// Sending half of the session's error channel. Capacity is one per stage,
/// and a report is skipped while another error is still pending, so a
/// stage never waits here.
#[derive(Debug, Clone)]
pub(crate) struct StageErrors {
    tx: mpsc::Sender<SessionError>,
}

impl StageErrors {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<SessionError>) {
        let (tx, rx) = mpsc::channel(STAGE_COUNT);
        (Self { tx }, rx)
    }

    pub(crate) fn report(&self, stage: Stage, err: SessionError) {
        if self.tx.capacity() < self.tx.max_capacity() {
            debug!(stage = stage.as_str(), "error already pending; dropping: {err}");
            return;
        }

        debug!(stage = stage.as_str(), "stage stopped: {err}");
        match self.tx.try_send(err) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(err)) => {
                debug!(stage = stage.as_str(), "error channel full; dropping: {err}");
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Inbound reader --------------------------------------------------------

/// Reads client frames, drives the state machine, and forwards audio while
/// listening. The closing frame for `stop` goes through the outbound channel
/// so the supervisor stays the only writer on the socket.
pub(crate) async fn read_client<S>(
    mut stream: S,
    inbound: mpsc::Sender<Bytes>,
    outbound: mpsc::Sender<Message>,
    errors: StageErrors,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut state = SessionState::Idle;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                errors.report(Stage::Reader, SessionError::Transport(err));
                break;
            }
            None => {
                errors.report(Stage::Reader, SessionError::ClientClosed);
                break;
            }
        };

        match control::classify(message) {
            Inbound::Control(event) => {
                let Some(transition) = state.apply(event) else {
                    debug!(?event, state = state.as_str(), "control frame ignored");
                    continue;
                };

                if let Some(frame) = transition.closing_frame() {
                    if !send_or_cancel(&outbound, Message::Text(frame.to_string()), &cancel).await {
                        break;
                    }
                }

                info!(
                    from = transition.from.as_str(),
                    to = transition.to.as_str(),
                    "session state changed"
                );
                state = transition.to;
            }
            Inbound::Audio(chunk) if state.forwards_audio() => {
                if !send_or_cancel(&inbound, chunk, &cancel).await {
                    break;
                }
            }
            Inbound::Audio(chunk) => {
                trace!(len = chunk.len(), "dropping audio while idle");
            }
            Inbound::Close => {
                errors.report(Stage::Reader, SessionError::ClientClosed);
                break;
            }
            Inbound::Ignored => {}
        }
    }

    debug!("reader stage exited");
}

// -----------------------------------------------------------------------------
// ----- Relay publisher -------------------------------------------------------

/// Publishes each audio chunk to the session's slot with its reply address.
/// Owns the borrowed connection while running and returns it on exit.
pub(crate) async fn relay_to_backend<D: Dialer>(
    connection: ConnectionLease<D>,
    slot: Slot,
    reply_to: String,
    mut inbound: mpsc::Receiver<Bytes>,
    errors: StageErrors,
    cancel: CancellationToken,
) -> ConnectionLease<D> {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = inbound.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let len = chunk.len();
        let published = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = connection.connection().publish_request(slot.as_str(), &reply_to, chunk) => res,
        };

        if let Err(err) = published {
            errors.report(Stage::Relay, SessionError::BackendPublish(err));
            break;
        }
        trace!(len, "audio chunk published");
    }

    debug!("relay stage exited");
    connection
}

// -----------------------------------------------------------------------------
// ----- Reply listener --------------------------------------------------------

/// Waits on the reply subscription with a per-read timeout and forwards each
/// payload to the supervisor. Returns the mailbox so teardown can unsubscribe.
pub(crate) async fn listen_for_replies<M: Mailbox>(
    mut mailbox: M,
    reply_timeout: Duration,
    outbound: mpsc::Sender<Message>,
    errors: StageErrors,
    cancel: CancellationToken,
) -> M {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = mailbox.next_reply(reply_timeout) => next,
        };

        match next {
            Ok(payload) => {
                trace!(len = payload.len(), "backend reply received");
                if !send_or_cancel(&outbound, control::reply_message(payload), &cancel).await {
                    break;
                }
            }
            Err(BackendError::ReplyTimeout(waited)) => {
                errors.report(Stage::Listener, SessionError::ReplyTimeout(waited));
                break;
            }
            Err(err) => {
                errors.report(Stage::Listener, SessionError::BackendSubscribe(err));
                break;
            }
        }
    }

    debug!("listener stage exited");
    mailbox
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

/// `false` when the session is cancelled or the receiver is gone.
async fn send_or_cancel<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBroker;
    use futures_util::stream;

    fn text(s: &str) -> Result<Message, tungstenite::Error> {
        Ok(Message::Text(s.to_string()))
    }

    fn audio(b: &[u8]) -> Result<Message, tungstenite::Error> {
        Ok(Message::Binary(b.to_vec()))
    }

    #[tokio::test]
    async fn reader_gates_audio_on_state() {
        let frames = vec![
            audio(b"dropped"),
            text(r#"{"action":"stop"}"#),
            text(r#"{"action":"start"}"#),
            audio(b"one"),
            text(r#"{"action":"start"}"#),
            audio(b"two"),
            text(r#"{"action":"stop"}"#),
            audio(b"late"),
        ];
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
        let (errors, mut error_rx) = StageErrors::channel();

        read_client(
            stream::iter(frames),
            inbound_tx,
            outbound_tx,
            errors,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(inbound_rx.recv().await, Some(Bytes::from_static(b"one")));
        assert_eq!(inbound_rx.recv().await, Some(Bytes::from_static(b"two")));
        assert_eq!(inbound_rx.recv().await, None);

        assert_eq!(outbound_rx.recv().await, Some(Message::Text("bye".into())));
        assert_eq!(outbound_rx.recv().await, None);

        assert!(matches!(error_rx.recv().await, Some(SessionError::ClientClosed)));
    }

    #[tokio::test]
    async fn reader_stops_when_cancelled() {
        let (inbound_tx, _inbound_rx) = mpsc::channel(1);
        let (outbound_tx, _outbound_rx) = mpsc::channel(1);
        let (errors, mut error_rx) = StageErrors::channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        read_client(stream::pending(), inbound_tx, outbound_tx, errors, cancel).await;
        assert!(error_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn only_first_pending_error_is_kept() {
        let (errors, mut rx) = StageErrors::channel();
        errors.report(Stage::Reader, SessionError::ClientClosed);
        errors.report(Stage::Listener, SessionError::ReplyTimeout(Duration::from_secs(1)));

        assert!(matches!(rx.recv().await, Some(SessionError::ClientClosed)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn listener_forwards_replies_then_times_out() {
        let broker = MemoryBroker::new();
        let mailbox = broker.subscribe("_INBOX.test");
        broker.publish("_INBOX.test", None, Bytes::from_static(b"first"));
        broker.publish("_INBOX.test", None, Bytes::from_static(b"second"));

        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
        let (errors, mut error_rx) = StageErrors::channel();

        let mut mailbox = listen_for_replies(
            mailbox,
            Duration::from_millis(50),
            outbound_tx,
            errors,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outbound_rx.recv().await, Some(Message::Text("first".into())));
        assert_eq!(outbound_rx.recv().await, Some(Message::Text("second".into())));
        assert!(matches!(error_rx.recv().await, Some(SessionError::ReplyTimeout(_))));

        mailbox.unsubscribe().await;
        assert_eq!(broker.subscriber_count("_INBOX.test"), 0);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
