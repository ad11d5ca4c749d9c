//! Connection pool management.
//!
//! A bounded pool of physical connections split into an idle list (LIFO), an
//! in-use set and a counter of creations in flight. Callers that find the pool
//! saturated wait in a FIFO queue and are served directly by `release`, ahead
//! of the idle list. Connections are created lazily, pre-warmed in the
//! background, and closed only when the whole pool is disposed.

use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::config::PoolOptions;
use crate::db::client::{Connector, NativeClient};
use crate::db::factory::ConnectionFactory;
use crate::error::{DbError, DbResult};

/// A physical connection checked out of the pool.
#[derive(Debug)]
pub struct PooledConnection<C> {
    id: u64,
    client: Arc<C>,
}

impl<C> PooledConnection<C> {
    /// Pool-local identity of the connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C> Clone for PooledConnection<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            client: Arc::clone(&self.client),
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub pending: usize,
    pub waiting: usize,
}

/// What a queued waiter receives.
enum Handoff<C> {
    Connection(PooledConnection<C>),
    /// Capacity was freed by a failed creation; try acquiring again.
    Retry,
}

struct PoolState<C> {
    connections: HashMap<u64, Arc<C>>,
    idle: Vec<PooledConnection<C>>,
    in_use: HashSet<u64>,
    pending: usize,
    waiters: VecDeque<oneshot::Sender<Handoff<C>>>,
    acquire_ticks: u64,
    release_ticks: u64,
    next_id: u64,
    disposed: bool,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
            idle: Vec::new(),
            in_use: HashSet::new(),
            pending: 0,
            waiters: VecDeque::new(),
            acquire_ticks: 0,
            release_ticks: 0,
            next_id: 0,
            disposed: false,
        }
    }

    fn total(&self) -> usize {
        self.connections.len()
    }

    fn register(&mut self, client: C) -> PooledConnection<C> {
        self.next_id += 1;
        let client = Arc::new(client);
        self.connections.insert(self.next_id, Arc::clone(&client));
        PooledConnection {
            id: self.next_id,
            client,
        }
    }

    /// Give `conn` to the oldest live waiter. Returns it if nobody took it.
    fn hand_off(&mut self, mut conn: PooledConnection<C>) -> Option<PooledConnection<C>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(Handoff::Connection(conn)) {
                Ok(()) => return None,
                Err(Handoff::Connection(returned)) => conn = returned,
                Err(Handoff::Retry) => return None,
            }
        }
        Some(conn)
    }

    /// Wake the oldest live waiter so it retries acquisition.
    fn wake_retry(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(Handoff::Retry).is_ok() {
                return;
            }
        }
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            total: self.total(),
            idle: self.idle.len(),
            in_use: self.in_use.len(),
            pending: self.pending,
            waiting: self.waiters.iter().filter(|w| !w.is_closed()).count(),
        }
    }
}

struct PoolInner<K: Connector> {
    factory: ConnectionFactory<K>,
    max_connections: usize,
    pre_warm: bool,
    pre_warm_threshold: usize,
    min_idle: usize,
    acquire_sample_interval: u64,
    release_sample_interval: u64,
    state: Mutex<PoolState<K::Client>>,
}

impl<K: Connector> PoolInner<K> {
    /// Whether a sampled check should start a background pre-warm.
    fn needs_warm_idle(&self, state: &PoolState<K::Client>) -> bool {
        self.pre_warm
            && !state.disposed
            && state.idle.len() < self.min_idle
            && state.total() < self.max_connections
            && state.pending == 0
            && state.waiters.is_empty()
    }
}

enum Created<C> {
    Ready(PooledConnection<C>, bool),
    Disposed(C),
    Failed(DbError),
}

enum AcquireStep<C> {
    Ready(PooledConnection<C>, bool),
    Create,
    Wait(oneshot::Receiver<Handoff<C>>),
}

/// A creation counted in `pending`. Dropped before `settle`, it gives the slot
/// back and wakes a waiter, so a cancelled acquisition leaves no phantom capacity.
struct PendingSlot<'a, K: Connector> {
    inner: &'a PoolInner<K>,
    armed: bool,
}

impl<'a, K: Connector> PendingSlot<'a, K> {
    fn new(inner: &'a PoolInner<K>) -> Self {
        Self { inner, armed: true }
    }

    /// Retire the slot under an already held lock.
    fn settle(mut self, state: &mut PoolState<K::Client>) {
        state.pending -= 1;
        self.armed = false;
    }
}

impl<K: Connector> Drop for PendingSlot<'_, K> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            state.pending = state.pending.saturating_sub(1);
            state.wake_retry();
            trace!("Abandoned connection creation");
        }
    }
}

/// A queued acquisition. Dropped before it resolves, it returns whatever was
/// already handed to it.
struct WaitTicket<'a, K: Connector> {
    pool: &'a Pool<K>,
    rx: oneshot::Receiver<Handoff<K::Client>>,
    settled: bool,
}

impl<K: Connector> Drop for WaitTicket<'_, K> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Handoff::Connection(conn)) => self.pool.release(conn),
            Ok(Handoff::Retry) => self.pool.inner.state.lock().wake_retry(),
            Err(_) => {}
        }
    }
}

/// Bounded, adaptively pre-warmed connection pool.
pub struct Pool<K: Connector> {
    inner: Arc<PoolInner<K>>,
}

impl<K: Connector> Clone for Pool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Connector> std::fmt::Debug for Pool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("max_connections", &self.inner.max_connections)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<K: Connector> Pool<K> {
    /// Create an empty pool. No connection is opened until the first acquisition.
    pub fn new(factory: ConnectionFactory<K>, options: &PoolOptions) -> Self {
        let max_connections = options.max_connections_or_default() as usize;
        info!(
            max_connections,
            pre_warm = options.pre_warm_or_default(),
            "Creating connection pool"
        );
        Self {
            inner: Arc::new(PoolInner {
                factory,
                max_connections,
                pre_warm: options.pre_warm_or_default(),
                pre_warm_threshold: options.pre_warm_threshold() as usize,
                min_idle: options.min_idle() as usize,
                acquire_sample_interval: options.acquire_sample_interval_or_default() as u64,
                release_sample_interval: options.release_sample_interval_or_default() as u64,
                state: Mutex::new(PoolState::new()),
            }),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }

    pub fn factory(&self) -> &ConnectionFactory<K> {
        &self.inner.factory
    }

    /// Current occupancy.
    pub fn status(&self) -> PoolStatus {
        self.inner.state.lock().status()
    }

    /// Check out a connection, waiting if the pool is saturated.
    ///
    /// Order: the most recently released idle connection, then a new connection
    /// if capacity remains, then a FIFO wait for the next release.
    pub async fn acquire(&self) -> DbResult<PooledConnection<K::Client>> {
        loop {
            let step = {
                let mut state = self.inner.state.lock();
                if state.disposed {
                    return Err(DbError::PoolDisposed);
                }
                if let Some(conn) = state.idle.pop() {
                    state.in_use.insert(conn.id);
                    state.acquire_ticks += 1;
                    let sampled = state.acquire_ticks % self.inner.acquire_sample_interval == 0
                        && self.inner.needs_warm_idle(&state);
                    AcquireStep::Ready(conn, sampled)
                } else if state.total() + state.pending < self.inner.max_connections {
                    state.pending += 1;
                    AcquireStep::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    trace!(waiting = state.waiters.len(), "Pool saturated, waiting");
                    AcquireStep::Wait(rx)
                }
            };

            match step {
                AcquireStep::Ready(conn, sampled) => {
                    trace!(connection = conn.id, "Reusing idle connection");
                    if sampled {
                        self.spawn_pre_warm();
                    }
                    return Ok(conn);
                }
                AcquireStep::Create => {
                    return self.create_in_use(PendingSlot::new(&self.inner)).await;
                }
                AcquireStep::Wait(rx) => {
                    let mut ticket = WaitTicket {
                        pool: self,
                        rx,
                        settled: false,
                    };
                    let received = (&mut ticket.rx).await;
                    ticket.settled = true;
                    match received {
                        Ok(Handoff::Connection(conn)) => {
                            trace!(connection = conn.id, "Received connection from release");
                            return Ok(conn);
                        }
                        Ok(Handoff::Retry) => continue,
                        Err(_) => return Err(DbError::PoolDisposed),
                    }
                }
            }
        }
    }

    /// Return a connection. Releasing a connection that is not checked out is a no-op.
    pub fn release(&self, conn: PooledConnection<K::Client>) {
        let sampled = {
            let mut state = self.inner.state.lock();
            if !state.in_use.contains(&conn.id) {
                trace!(connection = conn.id, "Ignoring release of connection not in use");
                return;
            }

            let id = conn.id;
            let Some(conn) = state.hand_off(conn) else {
                trace!(connection = id, "Handed connection to waiter");
                return;
            };

            state.in_use.remove(&conn.id);
            state.idle.push(conn);
            state.release_ticks += 1;
            state.release_ticks % self.inner.release_sample_interval == 0
                && self.inner.needs_warm_idle(&state)
        };

        if sampled {
            self.spawn_pre_warm();
        }
    }

    /// Close every connection and reject all queued waiters.
    pub async fn dispose(&self) {
        let (clients, waiters) = {
            let mut state = self.inner.state.lock();
            state.disposed = true;
            state.idle.clear();
            state.in_use.clear();
            state.acquire_ticks = 0;
            state.release_ticks = 0;
            let clients: Vec<Arc<K::Client>> =
                state.connections.drain().map(|(_, c)| c).collect();
            let waiters = std::mem::take(&mut state.waiters);
            (clients, waiters)
        };

        info!(
            connections = clients.len(),
            waiters = waiters.len(),
            "Disposing connection pool"
        );
        // Dropping the senders fails every pending acquisition with PoolDisposed.
        drop(waiters);

        let results = join_all(clients.iter().map(|client| client.close())).await;
        for err in results.into_iter().filter_map(Result::err) {
            warn!(error = %err, "Failed to close connection during dispose");
        }
    }

    async fn create_in_use(
        &self,
        slot: PendingSlot<'_, K>,
    ) -> DbResult<PooledConnection<K::Client>> {
        let opened = self.inner.factory.open().await;

        let outcome = {
            let mut state = self.inner.state.lock();
            slot.settle(&mut state);
            match opened {
                Err(e) => {
                    state.wake_retry();
                    Created::Failed(e)
                }
                Ok(client) if state.disposed => Created::Disposed(client),
                Ok(client) => {
                    let conn = state.register(client);
                    state.in_use.insert(conn.id);
                    let total = state.total();
                    let trigger = self.inner.pre_warm
                        && total >= self.inner.pre_warm_threshold
                        && total < self.inner.max_connections
                        && state.waiters.is_empty()
                        && state.pending == 0;
                    debug!(connection = conn.id, total, "Opened new pooled connection");
                    Created::Ready(conn, trigger)
                }
            }
        };

        match outcome {
            Created::Ready(conn, trigger) => {
                if trigger {
                    self.spawn_pre_warm();
                }
                Ok(conn)
            }
            Created::Disposed(client) => {
                let _ = client.close().await;
                Err(DbError::PoolDisposed)
            }
            Created::Failed(e) => Err(e),
        }
    }

    fn spawn_pre_warm(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        handle.spawn(pre_warm(inner));
    }
}

/// Create idle connections until the warm minimum is met or capacity runs out.
/// Failures end the run silently.
async fn pre_warm<K: Connector>(inner: Arc<PoolInner<K>>) {
    loop {
        {
            let mut state = inner.state.lock();
            if state.disposed
                || state.pending > 0
                || state.total() >= inner.max_connections
                || !state.waiters.is_empty()
                || state.idle.len() >= inner.min_idle
            {
                return;
            }
            state.pending += 1;
        }

        let slot = PendingSlot::new(&inner);
        let opened = inner.factory.open().await;

        let late_client = {
            let mut state = inner.state.lock();
            slot.settle(&mut state);
            match opened {
                Ok(client) if state.disposed => Some(client),
                Ok(client) => {
                    let conn = state.register(client);
                    trace!(connection = conn.id, "Pre-warmed connection");
                    state.in_use.insert(conn.id);
                    if let Some(conn) = state.hand_off(conn) {
                        state.in_use.remove(&conn.id);
                        state.idle.push(conn);
                    }
                    None
                }
                Err(e) => {
                    debug!(error = %e, "Pre-warm connection failed");
                    state.wake_retry();
                    return;
                }
            }
        };

        if let Some(client) = late_client {
            let _ = client.close().await;
            return;
        }
    }
}

/// Releases its connection back to the pool when dropped.
pub struct ConnectionGuard<K: Connector> {
    pool: Pool<K>,
    conn: PooledConnection<K::Client>,
    returned: bool,
}

impl<K: Connector> ConnectionGuard<K> {
    /// Acquire a connection from `pool`.
    pub async fn acquire(pool: &Pool<K>) -> DbResult<Self> {
        let conn = pool.acquire().await?;
        Ok(Self {
            pool: pool.clone(),
            conn,
            returned: false,
        })
    }

    pub fn connection(&self) -> &PooledConnection<K::Client> {
        &self.conn
    }

    /// Give up ownership without releasing.
    pub fn detach(mut self) -> PooledConnection<K::Client> {
        self.returned = true;
        self.conn.clone()
    }

    /// Explicitly release the connection.
    pub fn release(mut self) {
        self.returned = true;
        self.pool.release(self.conn.clone());
    }
}

impl<K: Connector> Drop for ConnectionGuard<K> {
    fn drop(&mut self) {
        if !self.returned {
            self.pool.release(self.conn.clone());
        }
    }
}

impl<K: Connector> std::ops::Deref for ConnectionGuard<K> {
    type Target = K::Client;

    fn deref(&self) -> &Self::Target {
        self.conn.client()
    }
}
