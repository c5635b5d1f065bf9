// RAII leases over the two shared resources. Each returns its resource
// exactly once, on explicit release or on drop.
use std::sync::Arc;

use tracing::warn;

use super::pool::{ConnectionId, ConnectionPool, PooledConnection};
use super::slots::{Slot, SlotManager};
use crate::backend::Dialer;
use crate::errors::{AdmissionDenied, PoolError};

// -----------------------------------------------------------------------------
// ----- SlotGuard -------------------------------------------------------------

#[derive(Debug)]
pub struct SlotGuard {
    manager: Arc<SlotManager>,
    slot: Slot,
    returned: bool,
}

impl SlotGuard {
    pub fn checkout(manager: &Arc<SlotManager>) -> Result<Self, AdmissionDenied> {
        let slot = manager.checkout()?;
        Ok(Self {
            manager: manager.clone(),
            slot,
            returned: false,
        })
    }

    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    pub fn release(mut self) {
        self.checkin();
    }

    fn checkin(&mut self) {
        if std::mem::replace(&mut self.returned, true) {
            return;
        }
        if !self.manager.checkin(self.slot.clone()) {
            warn!(slot = %self.slot, "slot lease released into a full free set");
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.checkin();
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionLease -------------------------------------------------------

pub struct ConnectionLease<D: Dialer> {
    pool: Arc<ConnectionPool<D>>,
    conn: Option<PooledConnection<D::Connection>>,
}

impl<D: Dialer> ConnectionLease<D> {
    pub async fn borrow(pool: &Arc<ConnectionPool<D>>) -> Result<Self, PoolError> {
        let conn = pool.get().await?;
        Ok(Self {
            pool: pool.clone(),
            conn: Some(conn),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.pooled().id()
    }

    pub fn connection(&self) -> &D::Connection {
        self.pooled()
    }

    pub fn release(mut self) {
        self.give_back();
    }

    fn pooled(&self) -> &PooledConnection<D::Connection> {
        self.conn
            .as_ref()
            .expect("connection lease used after release")
    }

    fn give_back(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn);
        }
    }
}

impl<D: Dialer> Drop for ConnectionLease<D> {
    fn drop(&mut self) {
        self.give_back();
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBroker;

    #[test]
    fn slot_guard_checks_in_once() {
        let manager = Arc::new(SlotManager::new("voice", 1));

        let guard = SlotGuard::checkout(&manager).unwrap();
        assert_eq!(guard.slot().as_str(), "voice-0");
        assert!(SlotGuard::checkout(&manager).is_err());

        guard.release();
        assert_eq!(manager.available(), 1);

        {
            let _guard = SlotGuard::checkout(&manager).unwrap();
            assert_eq!(manager.available(), 0);
        }
        assert_eq!(manager.available(), 1);
    }

    #[tokio::test]
    async fn connection_lease_returns_on_drop() {
        let broker = MemoryBroker::new();
        let (pool, _) = ConnectionPool::new("memory", 1, broker.dialer()).await;
        let pool = Arc::new(pool);

        let lease = ConnectionLease::borrow(&pool).await.unwrap();
        let id = lease.id();
        assert_eq!(pool.available(), 0);
        drop(lease);
        assert_eq!(pool.available(), 1);

        let lease = ConnectionLease::borrow(&pool).await.unwrap();
        assert_eq!(lease.id(), id);
        lease.release();
        assert_eq!(pool.available(), 1);
        assert_eq!(broker.closes(), 0);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
