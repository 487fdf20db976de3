//! Fixed-size session pool with exclusive leasing.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info};

use crate::error::{PgError, PgResult};
use crate::failover::FailoverCallbackHolder;
use crate::session::{Session, SessionState};

/// The freshly opened sessions of a pool, in slot order.
///
/// Produced by [`PgConnectionInit::init_pool`](crate::PgConnectionInit::init_pool);
/// always holds at least one session.
#[derive(Debug)]
pub struct ConnectionPool {
    sessions: Vec<Session>,
}

impl ConnectionPool {
    pub(crate) fn new(sessions: Vec<Session>) -> Self {
        debug_assert!(!sessions.is_empty());
        Self { sessions }
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Always false; a pool has at least one session.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The primary session (slot 0).
    pub fn primary(&self) -> &Session {
        &self.sessions[0]
    }

    /// Session in `slot`.
    pub fn get(&self, slot: usize) -> Option<&Session> {
        self.sessions.get(slot)
    }

    pub(crate) fn sessions_mut(&mut self) -> &mut [Session] {
        &mut self.sessions
    }

    /// Close every session.
    pub async fn close(self) {
        for session in self.sessions {
            session.close().await;
        }
    }
}

struct Shared {
    idle: Mutex<VecDeque<Session>>,
    permits: Arc<Semaphore>,
    size: usize,
    closed: AtomicBool,
}

/// The handle returned by pool construction: the leased session pool, its
/// failover callbacks and the two-phase-commit capability flag.
pub struct PoolWrapper {
    shared: Arc<Shared>,
    failover: FailoverCallbackHolder,
    prepared_transactions_enabled: bool,
}

impl PoolWrapper {
    pub(crate) fn new(
        pool: ConnectionPool,
        failover: FailoverCallbackHolder,
        prepared_transactions_enabled: bool,
    ) -> Self {
        let size = pool.len();
        info!(
            size,
            prepared_transactions = prepared_transactions_enabled,
            "PostgreSQL session pool ready"
        );
        Self {
            shared: Arc::new(Shared {
                idle: Mutex::new(pool.sessions.into()),
                permits: Arc::new(Semaphore::new(size)),
                size,
                closed: AtomicBool::new(false),
            }),
            failover,
            prepared_transactions_enabled,
        }
    }

    /// Whether the server supports prepared transactions.
    pub fn prepared_transactions_enabled(&self) -> bool {
        self.prepared_transactions_enabled
    }

    /// Failover callbacks, one per session.
    pub fn failover(&self) -> &FailoverCallbackHolder {
        &self.failover
    }

    /// Number of sessions in the pool.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Lease a session, waiting until one is returned if all are in use.
    pub async fn acquire(&self) -> PgResult<PooledSession> {
        if self.is_closed() {
            return Err(PgError::PoolClosed);
        }
        let permit = self
            .shared
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PgError::PoolClosed)?;
        self.checkout(permit)
    }

    /// Lease a session if one is idle right now.
    pub fn try_acquire(&self) -> PgResult<Option<PooledSession>> {
        if self.is_closed() {
            return Err(PgError::PoolClosed);
        }
        match self.shared.permits.clone().try_acquire_owned() {
            Ok(permit) => self.checkout(permit).map(Some),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(PgError::PoolClosed),
        }
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> PgResult<PooledSession> {
        let session = self
            .shared
            .idle
            .lock()
            .pop_front()
            .ok_or(PgError::PoolClosed)?;
        debug!(slot = session.slot(), "Session leased");
        Ok(PooledSession {
            session: Some(session),
            shared: self.shared.clone(),
            _permit: permit,
        })
    }

    /// States of the idle sessions, in slot order.
    pub fn session_states(&self) -> Vec<(usize, SessionState)> {
        let mut states: Vec<_> = self
            .shared
            .idle
            .lock()
            .iter()
            .map(|s| (s.slot(), s.state()))
            .collect();
        states.sort_unstable_by_key(|(slot, _)| *slot);
        states
    }

    /// Current pool status.
    pub fn status(&self) -> PoolStatus {
        let idle = self.shared.idle.lock();
        let failed = idle
            .iter()
            .filter(|s| s.state() == SessionState::PermanentlyFailed)
            .count();
        PoolStatus {
            size: self.shared.size,
            available: idle.len(),
            in_use: self.shared.size - idle.len(),
            failed,
        }
    }

    /// Check if the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Close the pool. Idle sessions are closed now, leased ones when they
    /// are returned.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.permits.close();
        let idle: Vec<_> = self.shared.idle.lock().drain(..).collect();
        for session in idle {
            session.close().await;
        }
        info!("PostgreSQL session pool closed");
    }
}

impl std::fmt::Debug for PoolWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolWrapper")
            .field("size", &self.shared.size)
            .field("prepared_transactions_enabled", &self.prepared_transactions_enabled)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A leased session. Derefs to [`Session`] and goes back to the pool on drop.
pub struct PooledSession {
    session: Option<Session>,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session is present until drop")
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session is present until drop")
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledSession").field(&self.session).finish()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if self.shared.closed.load(Ordering::Acquire) {
            // Dropping the client closes the connection.
            return;
        }
        debug!(slot = session.slot(), "Session returned");
        // Pushed before the permit field is released.
        self.shared.idle.lock().push_back(session);
    }
}

/// Pool status information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of sessions in the pool.
    pub size: usize,
    /// Sessions waiting to be leased.
    pub available: usize,
    /// Sessions currently leased.
    pub in_use: usize,
    /// Idle sessions that are permanently failed.
    pub failed: usize,
}
