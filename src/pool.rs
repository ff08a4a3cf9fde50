//! Connection pooling
//!
//! A bounded pool over a server set. Borrowers check connections out and
//! hand them back; a failing release-time health check marks the connection
//! defunct and spawns a replacement up to the initial size. A background
//! sweeper revalidates idle connections. No caller holds a pool lock while
//! doing I/O: connects and health probes run outside the state mutex.

use crate::connection::LdapConnection;
use crate::error::Error;
use crate::health::HealthCheck;
use crate::server_set::ServerSet;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Pool sizing and maintenance knobs
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Connections created up front and restored after defunct releases
    pub initial_size: usize,
    /// Hard cap on live connections
    pub max_size: usize,
    /// How long a borrower waits for a connection when the pool is at max
    pub checkout_timeout: Duration,
    /// Interval between idle-connection sweeps
    pub health_check_interval: Duration,
    /// Age after which an idle connection is closed and replaced
    pub max_connection_age: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            initial_size: 1,
            max_size: 10,
            checkout_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(60),
            max_connection_age: None,
        }
    }
}

/// Counter snapshot; see [`ConnectionPool::statistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    pub connections_created: u64,
    pub failed_creates: u64,
    pub successful_checkouts: u64,
    pub failed_checkouts: u64,
    pub released_valid: u64,
    pub released_defunct: u64,
    pub closed_defunct: u64,
    pub closed_expired: u64,
    pub closed_unneeded: u64,
}

#[derive(Default)]
struct PoolCounters {
    connections_created: AtomicU64,
    failed_creates: AtomicU64,
    successful_checkouts: AtomicU64,
    failed_checkouts: AtomicU64,
    released_valid: AtomicU64,
    released_defunct: AtomicU64,
    closed_defunct: AtomicU64,
    closed_expired: AtomicU64,
    closed_unneeded: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self) -> PoolStatistics {
        PoolStatistics {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            failed_creates: self.failed_creates.load(Ordering::Relaxed),
            successful_checkouts: self.successful_checkouts.load(Ordering::Relaxed),
            failed_checkouts: self.failed_checkouts.load(Ordering::Relaxed),
            released_valid: self.released_valid.load(Ordering::Relaxed),
            released_defunct: self.released_defunct.load(Ordering::Relaxed),
            closed_defunct: self.closed_defunct.load(Ordering::Relaxed),
            closed_expired: self.closed_expired.load(Ordering::Relaxed),
            closed_unneeded: self.closed_unneeded.load(Ordering::Relaxed),
        }
    }
}

struct PoolState {
    available: VecDeque<LdapConnection>,
    /// connection id -> creation time, for age-based expiry
    created_at: HashMap<u64, Instant>,
    /// live connections: available + checked out + creates in progress
    open_count: usize,
    closed: bool,
}

struct PoolInner {
    server_set: Arc<dyn ServerSet>,
    health_check: Option<Arc<dyn HealthCheck>>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// wakes borrowers waiting for a free slot or an available connection
    cond: Condvar,
    /// wakes the sweeper, only for shutdown
    sweeper_cond: Condvar,
    counters: PoolCounters,
}

/// A bounded pool of connections produced by a server set
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("ConnectionPool")
            .field("available", &state.available.len())
            .field("open", &state.open_count)
            .field("closed", &state.closed)
            .finish()
    }
}

impl ConnectionPool {
    /// Build the pool, creating `initial_size` connections up front
    pub fn new(
        server_set: Arc<dyn ServerSet>,
        health_check: Option<Arc<dyn HealthCheck>>,
        config: PoolConfig,
    ) -> Result<Self, Error> {
        if config.initial_size > config.max_size || config.max_size == 0 {
            return Err(Error::local(format!(
                "invalid pool sizing: initial {} / max {}",
                config.initial_size, config.max_size
            )));
        }
        let inner = Arc::new(PoolInner {
            server_set,
            health_check,
            config,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                created_at: HashMap::new(),
                open_count: 0,
                closed: false,
            }),
            cond: Condvar::new(),
            sweeper_cond: Condvar::new(),
            counters: PoolCounters::default(),
        });
        for _ in 0..config.initial_size {
            let conn = inner.create_connection()?;
            let mut state = inner.state.lock().unwrap();
            state.open_count += 1;
            state.created_at.insert(conn.connection_id(), Instant::now());
            state.available.push_back(conn);
        }
        let sweeper_inner = Arc::clone(&inner);
        let sweeper = thread::Builder::new()
            .name("ldap-pool-sweeper".to_string())
            .spawn(move || sweeper_loop(sweeper_inner))
            .map_err(Error::Io)?;
        Ok(ConnectionPool {
            inner,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Borrow a connection. Prefers an idle one; opens a new one below the
    /// max; otherwise waits up to the checkout timeout for a release.
    pub fn check_out(&self) -> Result<LdapConnection, Error> {
        let deadline = Instant::now() + self.inner.config.checkout_timeout;
        loop {
            enum Plan {
                Reuse(LdapConnection),
                Create,
            }
            let plan = {
                let mut state = self.inner.state.lock().unwrap();
                loop {
                    if state.closed {
                        self.inner.counters.failed_checkouts.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::local("connection pool is closed"));
                    }
                    if let Some(conn) = state.available.pop_front() {
                        break Plan::Reuse(conn);
                    }
                    if state.open_count < self.inner.config.max_size {
                        // reserve the slot before the (unlocked) connect
                        state.open_count += 1;
                        break Plan::Create;
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.inner.counters.failed_checkouts.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::local(
                            "timed out waiting for a pooled connection",
                        ));
                    }
                    let (next, _) = self.inner.cond.wait_timeout(state, remaining).unwrap();
                    state = next;
                }
            };
            match plan {
                Plan::Reuse(conn) => {
                    if self.inner.expired(&conn) {
                        self.inner.discard(conn, &self.inner.counters.closed_expired);
                        continue;
                    }
                    if let Some(health_check) = &self.inner.health_check {
                        if let Err(e) = health_check.ensure_connection_valid_for_checkout(&conn) {
                            debug!("pooled connection failed checkout health check: {}", e);
                            self.inner.discard(conn, &self.inner.counters.closed_defunct);
                            continue;
                        }
                    }
                    self.inner
                        .counters
                        .successful_checkouts
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(conn);
                }
                Plan::Create => match self.inner.create_connection() {
                    Ok(conn) => {
                        {
                            let mut state = self.inner.state.lock().unwrap();
                            state
                                .created_at
                                .insert(conn.connection_id(), Instant::now());
                        }
                        self.inner
                            .counters
                            .successful_checkouts
                            .fetch_add(1, Ordering::Relaxed);
                        return Ok(conn);
                    }
                    Err(e) => {
                        {
                            let mut state = self.inner.state.lock().unwrap();
                            state.open_count -= 1;
                        }
                        self.inner.cond.notify_one();
                        self.inner.counters.failed_checkouts.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Return a borrowed connection. The release-time health check decides
    /// whether it goes back to the pool or is destroyed and replaced.
    pub fn release(&self, conn: LdapConnection) {
        if !conn.is_open() {
            self.release_defunct(conn);
            return;
        }
        if let Some(health_check) = &self.inner.health_check {
            if let Err(e) = health_check.ensure_connection_valid_for_release(&conn) {
                debug!("connection failed release health check: {}", e);
                self.release_defunct(conn);
                return;
            }
        }
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            state.open_count = state.open_count.saturating_sub(1);
            state.created_at.remove(&conn.connection_id());
            drop(state);
            conn.unbind();
            self.inner
                .counters
                .closed_unneeded
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        state.available.push_back(conn);
        drop(state);
        self.inner.counters.released_valid.fetch_add(1, Ordering::Relaxed);
        self.inner.cond.notify_one();
    }

    /// Return a connection known to be bad: it is destroyed and, below the
    /// initial size, replaced
    pub fn release_defunct(&self, conn: LdapConnection) {
        self.inner
            .counters
            .released_defunct
            .fetch_add(1, Ordering::Relaxed);
        self.inner.discard(conn, &self.inner.counters.closed_defunct);
        self.inner.replace_up_to_initial();
    }

    pub fn statistics(&self) -> PoolStatistics {
        self.inner.counters.snapshot()
    }

    /// Idle connections currently in the pool
    pub fn available_count(&self) -> usize {
        self.inner.state.lock().unwrap().available.len()
    }

    /// Close every pooled connection and stop the sweeper. Checked-out
    /// connections are closed when released.
    pub fn close(&self) {
        let drained: Vec<LdapConnection> = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<LdapConnection> = state.available.drain(..).collect();
            state.open_count -= drained.len();
            state.created_at.clear();
            drained
        };
        self.inner.cond.notify_all();
        self.inner.sweeper_cond.notify_all();
        for conn in drained {
            conn.unbind();
            self.inner
                .counters
                .closed_unneeded
                .fetch_add(1, Ordering::Relaxed);
        }
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl PoolInner {
    fn create_connection(&self) -> Result<LdapConnection, Error> {
        match self
            .server_set
            .get_connection_with_health_check(self.health_check.as_deref())
        {
            Ok(conn) => {
                self.counters
                    .connections_created
                    .fetch_add(1, Ordering::Relaxed);
                Ok(conn)
            }
            Err(e) => {
                self.counters.failed_creates.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn expired(&self, conn: &LdapConnection) -> bool {
        let max_age = match self.config.max_connection_age {
            Some(max_age) => max_age,
            None => return false,
        };
        let state = self.state.lock().unwrap();
        state
            .created_at
            .get(&conn.connection_id())
            .map(|created| created.elapsed() > max_age)
            .unwrap_or(false)
    }

    /// Close a connection and free its pool slot
    fn discard(&self, conn: LdapConnection, counter: &AtomicU64) {
        {
            let mut state = self.state.lock().unwrap();
            state.open_count = state.open_count.saturating_sub(1);
            state.created_at.remove(&conn.connection_id());
        }
        conn.close();
        counter.fetch_add(1, Ordering::Relaxed);
        self.cond.notify_one();
    }

    /// Restore the pool to its initial size after discards
    fn replace_up_to_initial(&self) {
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.closed || state.open_count >= self.config.initial_size {
                    return;
                }
            }
            match self.create_connection() {
                Ok(conn) => {
                    let mut state = self.state.lock().unwrap();
                    if state.closed {
                        drop(state);
                        conn.close();
                        return;
                    }
                    state.open_count += 1;
                    state.created_at.insert(conn.connection_id(), Instant::now());
                    state.available.push_back(conn);
                    drop(state);
                    self.cond.notify_one();
                }
                Err(e) => {
                    warn!("failed to replace defunct pooled connection: {}", e);
                    return;
                }
            }
        }
    }
}

/// Periodically revalidates idle connections and replaces the ones that
/// fail or have outlived the maximum age
fn sweeper_loop(inner: Arc<PoolInner>) {
    loop {
        {
            let state = inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            let (state, _) = inner
                .sweeper_cond
                .wait_timeout(state, inner.config.health_check_interval)
                .unwrap();
            if state.closed {
                return;
            }
        }
        sweep_once(&inner);
    }
}

fn sweep_once(inner: &PoolInner) {
    let idle: Vec<LdapConnection> = {
        let mut state = inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.available.drain(..).collect()
    };
    for conn in idle {
        if inner.expired(&conn) {
            inner.discard(conn, &inner.counters.closed_expired);
            continue;
        }
        let healthy = match &inner.health_check {
            Some(health_check) => health_check
                .ensure_connection_valid_for_continued_use(&conn)
                .is_ok(),
            None => conn.is_open(),
        };
        if healthy {
            let mut state = inner.state.lock().unwrap();
            if state.closed {
                drop(state);
                conn.close();
                return;
            }
            state.available.push_back(conn);
            drop(state);
            inner.cond.notify_one();
        } else {
            debug!("idle pooled connection failed health check");
            inner.discard(conn, &inner.counters.closed_defunct);
        }
    }
    inner.replace_up_to_initial();
}
