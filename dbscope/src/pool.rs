//! Bounded connection pool

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::connection::{DbConnection, NativeHandle};
use crate::datasource::Datasource;
use crate::error::{Error, Result};

/// Lifecycle phase of a [`ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    /// No connection was requested yet; settings may still change.
    Uninitialized,
    /// Leasing connections.
    Initialized,
    /// Cleaned up while connections were still leased; they close on release.
    Draining,
    /// Terminal. Every connection is closed.
    Cleaned,
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub phase: PoolPhase,
    pub capacity: usize,
    pub idle: usize,
    pub leased: usize,
}

struct PoolState {
    phase: PoolPhase,
    capacity: usize,
    acquire_timeout: Option<Duration>,
    idle: VecDeque<NativeHandle>,
    leased: usize,
}

impl PoolState {
    fn is_closed(&self) -> bool {
        matches!(self.phase, PoolPhase::Draining | PoolPhase::Cleaned)
    }

    fn finish_draining(&mut self) {
        if self.phase == PoolPhase::Draining && self.leased == 0 {
            self.phase = PoolPhase::Cleaned;
            debug!("Connection pool drained");
        }
    }
}

/// The connections of one [`Datasource`].
///
/// With a capacity of 0 nothing is pooled: every lease opens a fresh
/// connection that closes when it's released. Otherwise at most `capacity`
/// connections are live at once, and a lease on a saturated pool blocks
/// until another connection is released (or the acquire timeout passes).
pub struct ConnectionPool {
    state: Mutex<PoolState>,
    available: Condvar,
}

impl ConnectionPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                phase: PoolPhase::Uninitialized,
                capacity,
                acquire_timeout: None,
                idle: VecDeque::new(),
                leased: 0,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.lock().acquire_timeout
    }

    /// Whether a connection was ever requested from this pool.
    pub fn is_initialized(&self) -> bool {
        self.lock().phase != PoolPhase::Uninitialized
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock();
        PoolStatus {
            phase: state.phase,
            capacity: state.capacity,
            idle: state.idle.len(),
            leased: state.leased,
        }
    }

    pub(crate) fn set_capacity(&self, capacity: usize) -> Result<()> {
        let mut state = self.lock();
        if state.phase != PoolPhase::Uninitialized {
            return Err(Error::Immutable("pool size"));
        }
        state.capacity = capacity;
        Ok(())
    }

    pub(crate) fn set_acquire_timeout(&self, timeout: Option<Duration>) {
        self.lock().acquire_timeout = timeout;
    }

    fn initialize(state: &mut PoolState) -> Result<()> {
        match state.phase {
            PoolPhase::Uninitialized => {
                state.phase = PoolPhase::Initialized;
                debug!(capacity = state.capacity, "Connection pool initialized");
                Ok(())
            }
            PoolPhase::Initialized => Ok(()),
            PoolPhase::Draining | PoolPhase::Cleaned => Err(Error::PoolClosed),
        }
    }

    /// Hand out a connection for `datasource`.
    pub(crate) fn lease(&self, datasource: &Datasource) -> Result<DbConnection> {
        let mut state = self.lock();
        Self::initialize(&mut state)?;

        if state.capacity == 0 {
            drop(state);
            let handle = datasource.open_native()?;
            debug!(connection = handle.id, driver = %handle.identity, "Opened unpooled connection");
            return Ok(datasource.wrap(handle, false));
        }

        let started = Instant::now();
        let deadline = state
            .acquire_timeout
            .and_then(|timeout| started.checked_add(timeout));

        loop {
            if state.is_closed() {
                return Err(Error::PoolClosed);
            }

            if let Some(idle) = state.idle.pop_front() {
                state.leased += 1;
                debug!(
                    connection = idle.id,
                    leased = state.leased,
                    idle = state.idle.len(),
                    "Leased pooled connection"
                );
                return Ok(datasource.wrap(idle, true));
            }

            if state.leased < state.capacity {
                // reserve the slot before connecting outside the lock
                state.leased += 1;
                drop(state);
                return match datasource.open_native() {
                    Ok(handle) => {
                        debug!(connection = handle.id, driver = %handle.identity, "Opened pooled connection");
                        Ok(datasource.wrap(handle, true))
                    }
                    Err(err) => {
                        let mut state = self.lock();
                        state.leased -= 1;
                        state.finish_draining();
                        drop(state);
                        self.available.notify_one();
                        Err(err)
                    }
                };
            }

            state = match deadline {
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::PoolTimeout {
                            capacity: state.capacity,
                            waited: now.duration_since(started),
                        });
                    }
                    self.available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Take back a leased connection.
    ///
    /// A connection that failed and no longer validates is closed, as is
    /// every connection released after cleanup.
    pub(crate) fn release(&self, mut handle: NativeHandle, broken: bool) {
        let healthy = !broken || handle.native.is_valid();

        let mut state = self.lock();
        state.leased = state.leased.saturating_sub(1);
        if healthy && !state.is_closed() {
            debug!(
                connection = handle.id,
                leased = state.leased,
                idle = state.idle.len() + 1,
                "Released pooled connection"
            );
            state.idle.push_back(handle);
            drop(state);
            self.available.notify_one();
            return;
        }
        state.finish_draining();
        drop(state);
        self.available.notify_one();

        if !healthy {
            warn!(connection = handle.id, driver = %handle.identity, "Discarding connection that failed validation");
        }
        handle.close();
    }

    /// Open connections until the pool holds `capacity` of them.
    pub(crate) fn prepare(&self, datasource: &Datasource) -> Result<()> {
        loop {
            let mut state = self.lock();
            Self::initialize(&mut state)?;
            if state.leased + state.idle.len() >= state.capacity {
                return Ok(());
            }
            state.leased += 1;
            drop(state);

            let opened = datasource.open_native();
            let mut state = self.lock();
            state.leased -= 1;
            match opened {
                Ok(handle) if !state.is_closed() => {
                    state.idle.push_back(handle);
                    drop(state);
                    self.available.notify_one();
                }
                Ok(handle) => {
                    state.finish_draining();
                    drop(state);
                    handle.close();
                    return Err(Error::PoolClosed);
                }
                Err(err) => {
                    state.finish_draining();
                    return Err(err);
                }
            }
        }
    }

    /// Stop leasing and close every idle connection.
    ///
    /// Connections still leased are closed as they come back; the pool is
    /// [`PoolPhase::Cleaned`] once the last one is released. Calling this
    /// again has no effect.
    pub(crate) fn cleanup(&self) {
        let idle = {
            let mut state = self.lock();
            if state.is_closed() {
                return;
            }
            state.phase = PoolPhase::Draining;
            state.finish_draining();
            debug!(
                idle = state.idle.len(),
                leased = state.leased,
                "Cleaning up connection pool"
            );
            std::mem::take(&mut state.idle)
        };
        self.available.notify_all();
        for handle in idle {
            handle.close();
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("status", &self.status())
            .finish()
    }
}
