//! Bounded connection pool shared across worker threads.
//!
//! All bookkeeping lives behind one mutex. Waiters queue in arrival order and
//! block on a condition variable, with a deadline when a timeout is given, so
//! neither form of acquisition polls. Connections are opened through an
//! [`r2d2::ManageConnection`] so the pool itself is provider-agnostic.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use r2d2::ManageConnection;
use thiserror::Error;

/// How long a waiter sleeps before retrying a failed reopen of a vacant slot.
const REOPEN_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Errors returned by [`ConnectionPool`].
#[derive(Debug, Error)]
pub enum PoolError<E: std::error::Error + 'static> {
    /// A pool must hold at least one connection.
    #[error("connection pool capacity must be at least 1")]
    InvalidCapacity,

    /// The first connection could not be opened.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] E),

    /// The pool has been closed.
    #[error("connection pool is closed")]
    Closed,
}

/// A point-in-time view of pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub capacity: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Threads currently blocked in `acquire`.
    pub waiting: usize,
}

struct PoolInner<C> {
    idle: VecDeque<C>,
    in_use: usize,
    /// Slots whose connection was discarded and not yet reopened.
    vacant: usize,
    closed: bool,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

impl<C> PoolInner<C> {
    fn leave_queue(&mut self, ticket: u64) {
        self.waiters.retain(|t| *t != ticket);
    }
}

struct Shared<M: ManageConnection> {
    manager: M,
    capacity: usize,
    inner: Mutex<PoolInner<M::Connection>>,
    cond: Condvar,
}

/// A fixed-capacity pool of connections opened by `M`.
///
/// Cloning is cheap and yields a handle to the same pool.
pub struct ConnectionPool<M: ManageConnection> {
    shared: Arc<Shared<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("state", &self.state())
            .finish()
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Builds a pool and opens its connections eagerly.
    ///
    /// The first connection must succeed so that a bad configuration is
    /// reported at startup. Later failures leave the slot vacant; it is
    /// reopened on demand.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidCapacity` for a zero capacity and
    /// `PoolError::Connect` if the first connection cannot be opened.
    pub fn new(capacity: usize, manager: M) -> Result<Self, PoolError<M::Error>> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }

        let first = manager.connect().map_err(PoolError::Connect)?;
        let mut idle = VecDeque::with_capacity(capacity);
        idle.push_back(first);

        let mut vacant = 0;
        for _ in 1..capacity {
            match manager.connect() {
                Ok(conn) => idle.push_back(conn),
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "failed to open pooled connection, slot will be reopened on demand"
                    );
                    vacant += 1;
                }
            }
        }

        tracing::info!(capacity, idle = idle.len(), "database connection pool ready");

        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                capacity,
                inner: Mutex::new(PoolInner {
                    idle,
                    in_use: 0,
                    vacant,
                    closed: false,
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                }),
                cond: Condvar::new(),
            }),
        })
    }

    /// Maximum number of connections this pool holds.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// The manager used to open connections.
    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Blocks until a connection is available.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` if the pool is or becomes closed.
    pub fn acquire(&self) -> Result<PooledConnection<M>, PoolError<M::Error>> {
        match self.acquire_until(None)? {
            Some(conn) => Ok(conn),
            // Without a deadline the wait only ends with a connection or an error.
            None => Err(PoolError::Closed),
        }
    }

    /// Blocks for at most `timeout`. `Ok(None)` means no connection became
    /// available in time, which is an expected outcome under load.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` if the pool is or becomes closed.
    pub fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<PooledConnection<M>>, PoolError<M::Error>> {
        self.acquire_until(Some(Instant::now() + timeout))
    }

    /// Returns a connection to the pool. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection<M>) {
        drop(conn);
    }

    /// Snapshot of the pool's bookkeeping.
    pub fn state(&self) -> PoolState {
        let inner = self.lock();
        PoolState {
            capacity: self.shared.capacity,
            idle: inner.idle.len(),
            in_use: inner.in_use,
            waiting: inner.waiters.len(),
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closes the pool.
    ///
    /// Blocked and future acquirers fail with `PoolError::Closed`. The call
    /// then waits for every checked-out connection to come back and drops all
    /// connections. The calling thread must not hold a connection itself.
    pub fn close(&self) {
        let mut inner = self.lock();
        if !inner.closed {
            inner.closed = true;
            tracing::info!(in_use = inner.in_use, "closing database connection pool");
        }
        self.shared.cond.notify_all();

        while inner.in_use > 0 {
            inner = self
                .shared
                .cond
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }

        let drained: Vec<M::Connection> = inner.idle.drain(..).collect();
        drop(inner);
        drop(drained);
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner<M::Connection>> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire_until(
        &self,
        deadline: Option<Instant>,
    ) -> Result<Option<PooledConnection<M>>, PoolError<M::Error>> {
        let mut inner = self.lock();
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.waiters.push_back(ticket);

        let mut retry_at: Option<Instant> = None;

        loop {
            if inner.closed {
                inner.leave_queue(ticket);
                drop(inner);
                self.shared.cond.notify_all();
                return Err(PoolError::Closed);
            }

            if inner.waiters.front() == Some(&ticket) {
                if let Some(conn) = inner.idle.pop_front() {
                    inner.waiters.pop_front();
                    inner.in_use += 1;
                    let more = !inner.idle.is_empty() || inner.vacant > 0;
                    drop(inner);
                    if more {
                        self.shared.cond.notify_all();
                    }
                    return Ok(Some(PooledConnection::new(self.clone(), conn)));
                }

                let may_reopen = retry_at.map_or(true, |at| Instant::now() >= at);
                if inner.vacant > 0 && may_reopen {
                    inner.vacant -= 1;
                    inner.in_use += 1;
                    inner.waiters.pop_front();
                    drop(inner);

                    match self.shared.manager.connect() {
                        Ok(conn) => {
                            tracing::debug!("reopened vacant pool slot");
                            return Ok(Some(PooledConnection::new(self.clone(), conn)));
                        }
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                "failed to reopen pooled connection, pool is running under capacity"
                            );
                            inner = self.lock();
                            inner.in_use -= 1;
                            inner.vacant += 1;
                            inner.waiters.push_front(ticket);
                            retry_at = Some(Instant::now() + REOPEN_RETRY_INTERVAL);
                            // `close` may be waiting for `in_use` to reach zero.
                            self.shared.cond.notify_all();
                            // Someone may have released while the lock was dropped.
                            continue;
                        }
                    }
                }
            }

            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    inner.leave_queue(ticket);
                    drop(inner);
                    // The next waiter may now be at the front.
                    self.shared.cond.notify_all();
                    return Ok(None);
                }
            }

            let mut wake_at = deadline;
            if inner.vacant > 0 {
                if let Some(at) = retry_at {
                    wake_at = Some(wake_at.map_or(at, |d| d.min(at)));
                }
            }

            inner = match wake_at {
                None => self
                    .shared
                    .cond
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(at) => {
                    self.shared
                        .cond
                        .wait_timeout(inner, at.saturating_duration_since(now))
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    fn put_back(&self, mut conn: M::Connection, marked_broken: bool) {
        let broken = marked_broken || self.shared.manager.has_broken(&mut conn);

        let mut inner = self.lock();
        inner.in_use -= 1;
        let discarded = if broken {
            inner.vacant += 1;
            Some(conn)
        } else {
            inner.idle.push_back(conn);
            None
        };
        drop(inner);
        self.shared.cond.notify_all();

        if discarded.is_some() {
            tracing::warn!("discarded broken database connection, it will be replaced on demand");
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dereferences to the underlying connection and returns it to the pool on drop.
pub struct PooledConnection<M: ManageConnection> {
    pool: ConnectionPool<M>,
    // Always `Some` until drop.
    conn: Option<M::Connection>,
    broken: bool,
}

impl<M: ManageConnection> PooledConnection<M> {
    fn new(pool: ConnectionPool<M>, conn: M::Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
            broken: false,
        }
    }

    /// Flags the connection as unusable. It is discarded on release and its
    /// slot reopened on the next demand.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether [`mark_broken`](Self::mark_broken) has been called.
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        self.conn.as_ref().expect("pooled connection used after release")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut M::Connection {
        self.conn.as_mut().expect("pooled connection used after release")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn, self.broken);
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}
