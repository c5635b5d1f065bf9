// Composition root: admission control, resource leases and session startup.
// Keep relay logic in session/ and broker specifics in backend/.
pub mod http;
pub mod lease;
pub mod metrics;
pub mod pool;
pub mod slots;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::backend::Dialer;
use crate::errors::{AdmissionError, SessionEnd};
use crate::session::{Session, SessionSettings};

pub use lease::{ConnectionLease, SlotGuard};
pub use metrics::GatewayMetrics;
pub use pool::{ConnectionId, ConnectionPool, PoolStats, PooledConnection};
pub use slots::{Slot, SlotManager};

// -----------------------------------------------------------------------------
// ----- Gateway ---------------------------------------------------------------

pub struct Gateway<D: Dialer> {
    pool: Arc<ConnectionPool<D>>,
    slots: Arc<SlotManager>,
    settings: SessionSettings,
    metrics: GatewayMetrics,
    shutdown: CancellationToken,
}

/// Resources reserved for one session before the client is upgraded.
/// Dropping it unused gives both back.
pub struct Admission<D: Dialer> {
    slot: SlotGuard,
    connection: ConnectionLease<D>,
}

impl<D: Dialer> Admission<D> {
    pub fn slot(&self) -> &Slot {
        self.slot.slot()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }
}

// -----------------------------------------------------------------------------
// ----- Gateway: Static -------------------------------------------------------

impl<D: Dialer> Gateway<D> {
    pub fn new(
        pool: Arc<ConnectionPool<D>>,
        slots: Arc<SlotManager>,
        settings: SessionSettings,
        metrics: GatewayMetrics,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            slots,
            settings,
            metrics,
            shutdown,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Gateway: Public -------------------------------------------------------

impl<D: Dialer> Gateway<D> {
    /// Reserves a slot and a connection. Refusals are counted by cause.
    pub async fn admit(&self) -> Result<Admission<D>, AdmissionError> {
        self.reserve().await.inspect_err(|err| {
            self.metrics.record_rejection(err.as_label());
        })
    }

    pub async fn run_session<T>(&self, admission: Admission<D>, ws: WebSocketStream<T>) -> SessionEnd
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Admission { slot, connection } = admission;
        let session = Session::new(slot, connection, self.settings.clone());

        self.metrics.record_session_start();
        let end = session.run(ws, self.shutdown.clone()).await;
        self.metrics.record_session_end(end.as_label());
        end
    }

    /// Text exposition of every gateway metric, with fresh pool and slot gauges.
    pub fn render_metrics(&self) -> Result<String, prometheus::Error> {
        self.metrics
            .render(&self.pool.stats(), self.slots.available())
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<D>> {
        &self.pool
    }

    pub fn slots(&self) -> &Arc<SlotManager> {
        &self.slots
    }

    /// Cancels every live session. The accept loop stops on its own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

// -----------------------------------------------------------------------------
// ----- Gateway: Private ------------------------------------------------------

impl<D: Dialer> Gateway<D> {
    // Slot first, so a busy gateway rejects without touching the pool.
    async fn reserve(&self) -> Result<Admission<D>, AdmissionError> {
        let slot = SlotGuard::checkout(&self.slots)?;
        let connection = ConnectionLease::borrow(&self.pool).await?;

        Ok(Admission { slot, connection })
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
