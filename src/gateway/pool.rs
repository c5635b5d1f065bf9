// Backend connection pool: bounded idle cache, dial-on-demand, close-on-overflow.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{BackendConnection, Dialer};
use crate::errors::PoolError;

// -----------------------------------------------------------------------------
// ----- ConnectionPool --------------------------------------------------------

/// Never blocks a borrower: `get` dials when the idle cache is empty and
/// `put` closes the connection when the cache is full. The pool does not
/// check liveness; a broken connection fails the session that borrows it.
pub struct ConnectionPool<D: Dialer> {
    target: String,
    dialer: D,
    idle: Mutex<VecDeque<PooledConnection<D::Connection>>>,
    capacity: usize,
    next_id: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub target: String,
    pub capacity: usize,
    pub idle: usize,
    pub dialed: u64,
}

pub type ConnectionId = u64;

// -----------------------------------------------------------------------------
// ----- ConnectionPool: Static ------------------------------------------------

impl<D: Dialer> ConnectionPool<D> {
    /// Dials `size` connections up front. If any dial fails, the ones already
    /// opened are closed and the error comes back next to an empty pool that
    /// still dials on demand.
    pub async fn new(
        target: impl Into<String>,
        size: usize,
        dialer: D,
    ) -> (Self, Option<PoolError>) {
        let pool = Self {
            target: target.into(),
            dialer,
            idle: Mutex::new(VecDeque::with_capacity(size)),
            capacity: size,
            next_id: AtomicU64::new(0),
        };

        let mut opened = Vec::with_capacity(size);
        for _ in 0..size {
            match pool.dial().await {
                Ok(conn) => opened.push(conn),
                Err(err) => {
                    warn!(
                        "initial fill of pool for {} failed after {} connections: {err}",
                        pool.target,
                        opened.len()
                    );
                    for conn in opened {
                        conn.close();
                    }
                    return (pool, Some(err));
                }
            }
        }

        pool.idle.lock().extend(opened);
        info!("pool for {} ready with {size} connections", pool.target);

        (pool, None)
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionPool: Public ------------------------------------------------

impl<D: Dialer> ConnectionPool<D> {
    pub async fn get(&self) -> Result<PooledConnection<D::Connection>, PoolError> {
        let idle = self.idle.lock().pop_front();
        if let Some(conn) = idle {
            debug!(connection = conn.id, "reusing idle backend connection");
            return Ok(conn);
        }

        self.dial().await
    }

    pub fn put(&self, conn: PooledConnection<D::Connection>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            debug!(connection = conn.id, "backend connection returned to pool");
            idle.push_back(conn);
            return;
        }
        drop(idle);

        debug!(connection = conn.id, "pool full; closing backend connection");
        conn.close();
    }

    /// Closes every idle connection. Borrowed connections are untouched.
    pub fn drain(&self) {
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        if !drained.is_empty() {
            info!("draining {} idle connections to {}", drained.len(), self.target);
        }
        for conn in drained {
            conn.close();
        }
    }

    /// Advisory only; races with concurrent `get`/`put`.
    pub fn available(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            target: self.target.clone(),
            capacity: self.capacity,
            idle: self.available(),
            dialed: self.next_id.load(Ordering::Relaxed),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionPool: Private -----------------------------------------------

impl<D: Dialer> ConnectionPool<D> {
    async fn dial(&self) -> Result<PooledConnection<D::Connection>, PoolError> {
        let conn = self.dialer.dial(&self.target).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, "dialed backend connection to {}", self.target);

        Ok(PooledConnection { id, conn })
    }
}

// -----------------------------------------------------------------------------
// ----- PooledConnection ------------------------------------------------------

/// A backend connection tagged with the id it was given at dial time.
#[derive(Debug)]
pub struct PooledConnection<C> {
    id: ConnectionId,
    conn: C,
}

impl<C: BackendConnection> PooledConnection<C> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn close(self) {
        self.conn.close();
    }
}

impl<C> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
