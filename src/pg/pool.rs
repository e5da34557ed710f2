//! PostgreSQL connection pool.
//!
//! The pool owns a bounded set of [`Client`]s. Each entry is either idle or
//! checked out, never both; every transition happens inside one critical
//! section over [`PoolState`].
//!
//! - `acquire` reuses the most recently released idle entry (LIFO), else
//!   opens a new connection while under `max_connections`, else waits in a
//!   FIFO queue bounded by `connection_timeout`.
//! - `release` hands the entry straight to the longest-waiting request, or
//!   idles it. Connection-fatal errors destroy it instead.
//! - Entries checked out longer than `leak_detection_threshold` are reported,
//!   never reclaimed.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::client::{Client, Shared};
use super::config::{millis, Connect, PgConfig, TcpConnector};
use super::connection::QueryResult;
use super::error::{PgError, PgResult};
use super::types::PgValue;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Settings for every connection the pool opens
    pub connection: PgConfig,
    /// Maximum number of live connections
    pub max_connections: usize,
    /// Connections opened up front and kept through idle reaping
    pub min_connections: usize,
    /// Idle entries older than this are closed
    #[serde(deserialize_with = "millis")]
    pub idle_timeout: Option<Duration>,
    /// Bound on how long `acquire` may wait, including connecting
    #[serde(deserialize_with = "millis")]
    pub connection_timeout: Option<Duration>,
    /// Checkouts older than this are reported as possible leaks
    #[serde(deserialize_with = "millis")]
    pub leak_detection_threshold: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: PgConfig::default(),
            max_connections: 10,
            min_connections: 0,
            idle_timeout: Some(Duration::from_secs(10)),
            connection_timeout: None,
            leak_detection_threshold: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration.
    pub fn new(connection: PgConfig) -> Self {
        Self {
            connection,
            ..Self::default()
        }
    }

    /// Create a pool configuration from a connection URL.
    pub fn from_url(url: &str) -> PgResult<Self> {
        Ok(Self::new(PgConfig::from_url(url)?))
    }

    /// Set the minimum number of connections.
    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn leak_detection_threshold(mut self, threshold: Duration) -> Self {
        self.leak_detection_threshold = Some(threshold);
        self
    }

    fn validate(&self) -> PgResult<()> {
        if self.max_connections == 0 {
            return Err(PgError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PgError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// A checkout held longer than the leak detection threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    /// Last query dispatched on the connection, if any
    pub query: Option<String>,
    /// Time since checkout
    pub age: Duration,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Live connections, including ones being opened
    pub size: usize,
    pub idle: usize,
    pub checked_out: usize,
    /// Queued acquire requests
    pub waiting: usize,
}

// ============================================================================
// Pool State
// ============================================================================

struct IdleEntry {
    id: u64,
    client: Client,
    since: Instant,
}

struct Checkout {
    since: Instant,
    activity: Arc<Shared>,
    reported: bool,
}

/// What a waiting acquire receives.
enum Grant {
    /// A released entry, already registered as checked out.
    Entry(u64, Client),
    /// Permission to open a new connection; the slot is already counted.
    Slot,
}

struct PoolState {
    /// Most recently released last
    idle: Vec<IdleEntry>,
    checked_out: HashMap<u64, Checkout>,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    /// Live connections plus connections being opened
    size: usize,
    closed: bool,
}

impl PoolState {
    /// Hand `grant` to the longest-waiting live request.
    ///
    /// Returns the grant if nobody is waiting any more.
    fn offer(&mut self, mut grant: Grant) -> Result<(), Grant> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(grant) {
                Ok(()) => return Ok(()),
                // Waiter timed out or was dropped
                Err(returned) => grant = returned,
            }
        }
        Err(grant)
    }

    /// A counted slot is no longer backed by a connection.
    fn free_slot(&mut self) {
        if self.offer(Grant::Slot).is_err() {
            self.size -= 1;
        }
    }

    fn check_out(&mut self, id: u64, client: &Client) {
        self.checked_out.insert(
            id,
            Checkout {
                since: Instant::now(),
                activity: client.shared(),
                reported: false,
            },
        );
    }
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connect>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

impl PoolInner {
    /// Return a checked-out client. Runs synchronously so it is usable
    /// from `Drop`.
    fn release(&self, id: u64, client: Client, destroy: bool) {
        let mut state = self.state.lock();
        state.checked_out.remove(&id);

        if destroy || state.closed || client.is_closed() {
            state.free_slot();
            drop(state);
            debug!(pid = client.process_id(), "destroying pooled connection");
            // Dropping the client stops its task, which sends Terminate.
            drop(client);
            return;
        }

        state.check_out(id, &client);
        match state.offer(Grant::Entry(id, client)) {
            Ok(()) => {}
            Err(Grant::Entry(id, client)) => {
                state.checked_out.remove(&id);
                state.idle.push(IdleEntry {
                    id,
                    client,
                    since: Instant::now(),
                });
            }
            Err(Grant::Slot) => {}
        }
    }

    /// Put back a grant whose waiter went away before taking it.
    fn restore(&self, grant: Grant) {
        match grant {
            Grant::Entry(id, client) => self.release(id, client, false),
            Grant::Slot => self.state.lock().free_slot(),
        }
    }

    /// Drop expired idle entries and note new leaks.
    fn reap(&self) -> (Vec<Client>, Vec<LeakReport>) {
        let mut state = self.state.lock();
        let min = self.config.min_connections;
        let idle_timeout = self.config.idle_timeout;

        let mut expired = Vec::new();
        let mut i = 0;
        while i < state.idle.len() {
            let entry = &state.idle[i];
            let dead = entry.client.is_closed();
            let stale =
                idle_timeout.is_some_and(|t| entry.since.elapsed() >= t) && state.size > min;
            if dead || stale {
                let entry = state.idle.remove(i);
                state.size -= 1;
                expired.push(entry.client);
            } else {
                i += 1;
            }
        }

        let mut leaks = Vec::new();
        if let Some(threshold) = self.config.leak_detection_threshold {
            for checkout in state.checked_out.values_mut() {
                let age = checkout.since.elapsed();
                if !checkout.reported && age >= threshold {
                    checkout.reported = true;
                    leaks.push(LeakReport {
                        query: checkout.activity.last_query(),
                        age,
                    });
                }
            }
        }

        (expired, leaks)
    }
}

// ============================================================================
// Pooled Client
// ============================================================================

/// A client checked out from the pool.
///
/// When dropped, the client is returned to the pool.
pub struct PooledClient {
    /// The actual client (None once returned to the pool)
    client: Option<Client>,
    id: u64,
    pool: Arc<PoolInner>,
}

impl PooledClient {
    /// Return the client to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Return the client after `error`; connection-fatal errors destroy it.
    pub fn release_with_error(mut self, error: &PgError) {
        if let Some(client) = self.client.take() {
            self.pool.release(self.id, client, error.is_fatal());
        }
    }

    /// Destroy the connection instead of returning it.
    pub fn destroy(mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(self.id, client, true);
        }
    }
}

impl Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client
            .as_ref()
            .expect("client is present until the guard is released")
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(self.id, client, false);
        }
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("id", &self.id)
            .field("client", &self.client)
            .finish()
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool.
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a new connection pool over plain TCP.
    pub async fn connect(config: PoolConfig) -> PgResult<Self> {
        Self::connect_with(config, Arc::new(TcpConnector)).await
    }

    /// Create a new connection pool with a custom transport connector.
    ///
    /// Opens `min_connections` connections before returning.
    pub async fn connect_with(config: PoolConfig, connector: Arc<dyn Connect>) -> PgResult<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            config,
            connector,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                checked_out: HashMap::new(),
                waiters: VecDeque::new(),
                size: 0,
                closed: false,
            }),
            next_id: AtomicU64::new(0),
        });
        let pool = Self { inner };

        // Pre-create minimum connections
        for _ in 0..pool.inner.config.min_connections {
            pool.inner.state.lock().size += 1;
            match pool.open_client().await {
                Ok(client) => {
                    let id = pool.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    pool.inner.state.lock().idle.push(IdleEntry {
                        id,
                        client,
                        since: Instant::now(),
                    });
                }
                Err(err) => {
                    pool.inner.state.lock().size -= 1;
                    pool.end().await;
                    return Err(err);
                }
            }
        }

        if let Some(tick) = pool.maintenance_interval() {
            tokio::spawn(maintain(Arc::downgrade(&pool.inner), tick));
        }

        info!(
            max = pool.inner.config.max_connections,
            min = pool.inner.config.min_connections,
            "pool ready"
        );
        Ok(pool)
    }

    /// Check out a client.
    ///
    /// Never returns an entry that is already checked out.
    pub async fn acquire(&self) -> PgResult<PooledClient> {
        let deadline = self
            .inner
            .config
            .connection_timeout
            .map(|limit| Instant::now() + limit);

        let waiter = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PgError::PoolClosed);
            }

            while let Some(entry) = state.idle.pop() {
                if entry.client.is_closed() {
                    state.size -= 1;
                    continue;
                }
                state.check_out(entry.id, &entry.client);
                return Ok(self.guard(entry.id, entry.client));
            }

            if state.size < self.inner.config.max_connections {
                state.size += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(Waiter {
                    rx,
                    pool: Arc::clone(&self.inner),
                    settled: false,
                })
            }
        };

        let grant = match waiter {
            Some(waiter) => self.wait(waiter, deadline).await?,
            None => Grant::Slot,
        };

        match grant {
            Grant::Entry(id, client) => Ok(self.guard(id, client)),
            Grant::Slot => {
                let slot = SlotGuard {
                    pool: self.inner.as_ref(),
                    armed: true,
                };
                self.create(slot, deadline).await
            }
        }
    }

    /// Return a client, destroying it if `error` is connection-fatal.
    pub fn release(&self, client: PooledClient, error: Option<&PgError>) {
        match error {
            Some(err) => client.release_with_error(err),
            None => client.release(),
        }
    }

    /// Execute a simple query on a pooled connection.
    pub async fn simple_query(&self, query: &str) -> PgResult<Vec<QueryResult>> {
        let client = self.acquire().await?;
        let result = client.simple_query(query).await;
        settle(client, result)
    }

    /// Execute a parameterized query on a pooled connection.
    pub async fn query(&self, query: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let client = self.acquire().await?;
        let result = client.query(query, params).await;
        settle(client, result)
    }

    /// Execute a query without returning results (INSERT, UPDATE, DELETE).
    pub async fn execute(&self, query: &str, params: &[PgValue]) -> PgResult<u64> {
        Ok(self.query(query, params).await?.rows_affected())
    }

    /// Checkouts held longer than the leak detection threshold.
    pub fn leaked_connections(&self) -> Vec<LeakReport> {
        let Some(threshold) = self.inner.config.leak_detection_threshold else {
            return Vec::new();
        };

        let state = self.inner.state.lock();
        state
            .checked_out
            .values()
            .filter(|checkout| checkout.since.elapsed() >= threshold)
            .map(|checkout| LeakReport {
                query: checkout.activity.last_query(),
                age: checkout.since.elapsed(),
            })
            .collect()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            size: state.size,
            idle: state.idle.len(),
            checked_out: state.checked_out.len(),
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
        }
    }

    /// Close the pool.
    ///
    /// Queued acquires fail with `PoolClosed` and idle connections are
    /// closed. Checked-out clients are destroyed when released.
    pub async fn end(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.size -= idle.len();
            (idle, std::mem::take(&mut state.waiters))
        };

        // Dropped senders wake their waiters with PoolClosed.
        drop(waiters);

        for entry in idle {
            entry.client.end().await;
        }
        info!("pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn guard(&self, id: u64, client: Client) -> PooledClient {
        PooledClient {
            client: Some(client),
            id,
            pool: Arc::clone(&self.inner),
        }
    }

    async fn wait(&self, mut waiter: Waiter, deadline: Option<Instant>) -> PgResult<Grant> {
        let received = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, &mut waiter.rx)
                .await
                .ok(),
            None => Some((&mut waiter.rx).await),
        };
        waiter.settled = true;

        match received {
            Some(Ok(grant)) => Ok(grant),
            // The sender is only dropped unanswered by `end()`.
            Some(Err(_)) => Err(PgError::PoolClosed),
            None => waiter.expire(),
        }
    }

    /// Open a connection into an already-counted slot.
    async fn create(
        &self,
        slot: SlotGuard<'_>,
        deadline: Option<Instant>,
    ) -> PgResult<PooledClient> {
        let client = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.open_client())
                .await
                .unwrap_or(Err(PgError::PoolTimeout))?,
            None => self.open_client().await?,
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.state.lock();
            if !state.closed {
                state.check_out(id, &client);
                slot.disarm();
                return Ok(self.guard(id, client));
            }
        }

        drop(slot);
        client.end().await;
        Err(PgError::PoolClosed)
    }

    async fn open_client(&self) -> PgResult<Client> {
        let client = Client::with_connector(
            self.inner.config.connection.clone(),
            Arc::clone(&self.inner.connector),
        );
        client.connect().await?;
        debug!(pid = client.process_id(), "opened pooled connection");
        Ok(client)
    }

    fn maintenance_interval(&self) -> Option<Duration> {
        let config = &self.inner.config;
        let shortest = match (config.idle_timeout, config.leak_detection_threshold) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return None,
        };
        Some((shortest / 2).clamp(Duration::from_millis(10), Duration::from_secs(1)))
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .finish()
    }
}

/// A queued acquire.
///
/// Dropped while still queued (the acquire future was cancelled), it
/// withdraws and returns any grant that was already sent to it.
struct Waiter {
    rx: oneshot::Receiver<Grant>,
    pool: Arc<PoolInner>,
    settled: bool,
}

impl Waiter {
    /// Withdraw after the deadline, keeping a grant that raced it.
    fn expire(&mut self) -> PgResult<Grant> {
        match self.rx.try_recv() {
            Ok(grant) => return Ok(grant),
            Err(TryRecvError::Closed) => return Err(PgError::PoolClosed),
            Err(TryRecvError::Empty) => {}
        }
        self.rx.close();
        self.rx.try_recv().map_err(|_| PgError::PoolTimeout)
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if let Ok(grant) = self.rx.try_recv() {
            self.pool.restore(grant);
        }
    }
}

/// Releases a counted slot unless a connection took it over.
struct SlotGuard<'a> {
    pool: &'a PoolInner,
    armed: bool,
}

impl SlotGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().free_slot();
        }
    }
}

/// Release `client` according to the outcome of its last operation.
fn settle<T>(client: PooledClient, result: PgResult<T>) -> PgResult<T> {
    match result {
        Ok(value) => {
            client.release();
            Ok(value)
        }
        Err(err) => {
            client.release_with_error(&err);
            Err(err)
        }
    }
}

/// Background maintenance: idle reaping and leak logging.
///
/// Holds only a weak reference so an abandoned pool is not kept alive.
async fn maintain(pool: Weak<PoolInner>, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(inner) = pool.upgrade() else {
            break;
        };
        if inner.state.lock().closed {
            break;
        }

        let (expired, leaks) = inner.reap();
        drop(inner);

        for report in leaks {
            warn!(
                query = report.query.as_deref().unwrap_or("<none>"),
                age_ms = report.age.as_millis() as u64,
                "possible connection leak"
            );
        }
        for client in expired {
            debug!(pid = client.process_id(), "closing idle connection");
            client.end().await;
        }
    }
}
