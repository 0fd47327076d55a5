use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use derive_builder::Builder;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::proto::google::spanner::v1 as proto;
use crate::{Backoff, CallOptions, Connection, Error, Session, SpannerResource};

/// Configuration of the [`SessionPool`].
#[derive(Builder, Clone, Debug, PartialEq)]
#[builder(default)]
pub struct SessionPoolConfig {
    /// Sessions kept in the pool even when idle. The pool is warmed up to this size.
    pub min_sessions: usize,
    /// Upper bound on idle, checked out and in-flight sessions.
    pub max_sessions: usize,
    /// A refill is started in the background when idle sessions fall below this fraction of the pool.
    pub target_idle_fraction: f64,
    /// Idle sessions older than this are deleted.
    pub max_idle_time: Duration,
    /// Default time to wait for a session in [`SessionPool::acquire`].
    pub acquire_timeout: Duration,
    /// Period of the maintenance task.
    pub ping_interval: Duration,
    /// Idle sessions unused for this long are pinged so the server does not expire them.
    pub keep_alive_interval: Duration,
    pub max_pings_per_cycle: usize,
    /// Largest number of sessions requested in a single `BatchCreateSessions` call.
    pub batch_create_size: usize,
    /// Serve read-only work from a single multiplexed session.
    pub multiplexed: bool,
    /// Also serve read-write transactions from the multiplexed session.
    pub multiplexed_for_read_write: bool,
    /// Delay between attempts to create a session for queued callers.
    pub create_backoff: Backoff,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            min_sessions: 100,
            max_sessions: 400,
            target_idle_fraction: 0.2,
            max_idle_time: Duration::from_secs(50 * 60),
            acquire_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(5 * 60),
            keep_alive_interval: Duration::from_secs(30 * 60),
            max_pings_per_cycle: 10,
            batch_create_size: 100,
            multiplexed: false,
            multiplexed_for_read_write: false,
            create_backoff: Backoff::default(),
        }
    }
}

/// The kind of work a session is acquired for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    ReadOnly,
    ReadWrite,
}

/// A snapshot of the pool's counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub creating: usize,
    pub waiters: usize,
}

struct Waiter {
    id: u64,
    sender: oneshot::Sender<Session>,
}

#[derive(Default)]
struct PoolState {
    // front is the least recently used session
    idle: VecDeque<Session>,
    in_use: usize,
    creating: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use + self.creating
    }

    /// Hands a session to the oldest live waiter, or makes it the most recently used idle session.
    fn put(&mut self, mut session: Session) {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.sender.send(session) {
                Ok(()) => {
                    self.in_use += 1;
                    return;
                }
                Err(returned) => session = returned,
            }
        }
        self.idle.push_back(session);
    }

    /// Removes a waiter from the queue. Returns the session it was granted in the meantime, if any.
    fn withdraw(&mut self, id: u64, receiver: &mut oneshot::Receiver<Session>) -> Option<Session> {
        if let Some(position) = self.waiters.iter().position(|waiter| waiter.id == id) {
            self.waiters.remove(position);
            return None;
        }
        receiver.close();
        receiver.try_recv().ok()
    }

    /// Whether a queued caller is left without any session being created for it.
    fn starved(&self, max_sessions: usize) -> bool {
        !self.closed && !self.waiters.is_empty() && self.total() < max_sessions
    }
}

enum Checkout {
    Idle(Session),
    Create,
    Wait(u64, oneshot::Receiver<Session>),
}

struct PoolInner {
    config: SessionPoolConfig,
    database_role: Option<String>,
    connection: Mutex<Box<dyn Connection>>,
    state: Mutex<PoolState>,
    multiplexed: Mutex<Option<Session>>,
    multiplexed_creation: tokio::sync::Mutex<()>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    // sessions released outside of a runtime are left to expire on the server
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
    }
}

fn exhausted() -> Error {
    Error::status(
        tonic::Code::ResourceExhausted,
        "timed out waiting for a session",
    )
    .with_operation("AcquireSession")
}

impl PoolInner {
    fn connection(&self) -> Box<dyn Connection> {
        self.connection.lock().clone()
    }

    fn template(&self, multiplexed: bool) -> proto::Session {
        proto::Session {
            creator_role: self.database_role.clone().unwrap_or_default(),
            multiplexed,
            ..Default::default()
        }
    }

    fn uses_multiplexed(&self, kind: SessionKind) -> bool {
        self.config.multiplexed
            && (kind == SessionKind::ReadOnly || self.config.multiplexed_for_read_write)
    }

    async fn create_session(&self, multiplexed: bool) -> Result<Session, Error> {
        let mut connection = self.connection();
        let database = connection.database().id();
        connection
            .create_session(
                proto::CreateSessionRequest {
                    database,
                    session: Some(self.template(multiplexed)),
                },
                CallOptions::leader(),
            )
            .await
            .map(Session::from)
    }

    async fn batch_create(&self, count: usize) -> Result<Vec<Session>, Error> {
        let mut connection = self.connection();
        let database = connection.database().id();
        let mut sessions = Vec::with_capacity(count);
        // the server may return fewer sessions than requested
        while sessions.len() < count {
            let request = proto::BatchCreateSessionsRequest {
                database: database.clone(),
                session_template: Some(self.template(false)),
                session_count: (count - sessions.len()) as i32,
            };
            match connection
                .batch_create_sessions(request, CallOptions::leader())
                .await
            {
                Ok(response) if response.session.is_empty() => break,
                Ok(response) => sessions.extend(response.session.into_iter().map(Session::from)),
                Err(err) if sessions.is_empty() => return Err(err),
                Err(err) => {
                    log::warn!("created {} of {} sessions: {}", sessions.len(), count, err);
                    break;
                }
            }
        }
        Ok(sessions)
    }

    async fn multiplexed_session(&self) -> Result<Session, Error> {
        if let Some(session) = self.multiplexed.lock().clone() {
            return Ok(session);
        }
        let _creating = self.multiplexed_creation.lock().await;
        if let Some(session) = self.multiplexed.lock().clone() {
            return Ok(session);
        }
        let session = self.create_session(true).await?;
        log::debug!("created multiplexed session {}", session.name());
        *self.multiplexed.lock() = Some(session.clone());
        Ok(session)
    }

    /// Forgets the multiplexed session so that the next checkout creates a new one.
    fn discard_multiplexed(&self, name: &str) {
        let mut current = self.multiplexed.lock();
        if current.as_ref().map_or(false, |session| session.name() == name) {
            log::debug!("discarding multiplexed session {}", name);
            *current = None;
        }
    }

    fn spawn_delete(&self, session: Session) {
        let mut connection = self.connection();
        spawn(async move {
            let name = session.name().to_string();
            if let Err(err) = session.delete(connection.as_mut()).await {
                log::debug!("failed to delete session {}: {}", name, err);
            }
        });
    }

    /// Adds a newly created session to the pool; its creation slot is released.
    fn settle_created(&self, session: Session) {
        let mut state = self.state.lock();
        state.creating -= 1;
        if state.closed {
            drop(state);
            self.spawn_delete(session);
        } else {
            state.put(session);
        }
    }

    /// Creates a session for the waiters, retrying with backoff while any remain.
    ///
    /// A creation slot must already be reserved.
    fn spawn_create(self: &Arc<Self>) {
        let inner = self.clone();
        spawn(async move {
            let mut attempt = 0;
            loop {
                let err = match inner.create_session(false).await {
                    Ok(session) => {
                        inner.settle_created(session);
                        return;
                    }
                    Err(err) => err,
                };
                let retry = {
                    let mut state = inner.state.lock();
                    let retry = !state.closed && !state.waiters.is_empty();
                    if !retry {
                        state.creating -= 1;
                    }
                    retry
                };
                if !retry {
                    log::warn!("failed to create a session: {}", err);
                    return;
                }
                let delay = inner.config.create_backoff.jittered(attempt);
                log::warn!("failed to create a session, retrying in {:?}: {}", delay, err);
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        });
    }

    /// Gives back a creation slot that did not produce a session.
    fn abandon_creation(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.creating -= 1;
        if state.starved(self.config.max_sessions) {
            state.creating += 1;
            drop(state);
            self.spawn_create();
        }
    }

    /// Creates `count` sessions in batches; the creation slots must already be reserved.
    async fn fill(self: Arc<Self>, count: usize) {
        log::debug!("creating {} sessions", count);
        let result = self.batch_create(count).await;
        let mut state = self.state.lock();
        state.creating -= count;
        match result {
            Ok(sessions) if state.closed => {
                drop(state);
                for session in sessions {
                    self.spawn_delete(session);
                }
            }
            Ok(sessions) => {
                log::debug!("added {} sessions to the pool", sessions.len());
                for session in sessions {
                    state.put(session);
                }
            }
            Err(err) => {
                log::warn!("failed to create {} sessions: {}", count, err);
                if state.starved(self.config.max_sessions) {
                    state.creating += 1;
                    drop(state);
                    self.spawn_create();
                }
            }
        }
    }

    /// Starts a background refill when the fraction of idle sessions is below its target.
    fn maybe_refill(self: &Arc<Self>) {
        let target = self.config.target_idle_fraction.min(0.99);
        if target <= 0.0 {
            return;
        }
        let count = {
            let mut state = self.state.lock();
            let idle = state.idle.len() as f64;
            let busy = state.in_use as f64;
            if state.closed || state.creating > 0 || idle / (idle + busy).max(1.0) >= target {
                return;
            }
            let wanted = ((target * busy / (1.0 - target)).ceil() as usize)
                .saturating_sub(state.idle.len())
                .max(1);
            let count = wanted
                .min(self.config.batch_create_size)
                .min(self.config.max_sessions.saturating_sub(state.total()));
            if count == 0 {
                return;
            }
            state.creating += count;
            count
        };
        spawn(self.clone().fill(count));
    }

    fn release(self: &Arc<Self>, session: Session, healthy: bool) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if state.closed {
            drop(state);
            self.spawn_delete(session);
            return;
        }
        if healthy && session.idle_time() <= self.config.max_idle_time {
            state.put(session);
            return;
        }
        let replace = state.starved(self.config.max_sessions);
        if replace {
            state.creating += 1;
        }
        drop(state);
        log::debug!("discarding session {}", session.name());
        self.spawn_delete(session);
        if replace {
            self.spawn_create();
        }
    }

    async fn maintain(self: &Arc<Self>) {
        let (evicted, stale, missing) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let mut evicted = Vec::new();
            while state.total() > self.config.min_sessions
                && state
                    .idle
                    .front()
                    .map_or(false, |s| s.idle_time() > self.config.max_idle_time)
            {
                if let Some(session) = state.idle.pop_front() {
                    evicted.push(session);
                }
            }

            let mut stale = Vec::new();
            while stale.len() < self.config.max_pings_per_cycle
                && state
                    .idle
                    .front()
                    .map_or(false, |s| s.idle_time() >= self.config.keep_alive_interval)
            {
                if let Some(session) = state.idle.pop_front() {
                    state.in_use += 1;
                    stale.push(session);
                }
            }

            let missing = self
                .config
                .min_sessions
                .min(self.config.max_sessions)
                .saturating_sub(state.total());
            state.creating += missing;
            (evicted, stale, missing)
        };

        if !evicted.is_empty() {
            log::debug!("evicting {} idle sessions", evicted.len());
        }
        for session in evicted {
            self.spawn_delete(session);
        }

        for mut session in stale {
            let mut connection = self.connection();
            let healthy = match session.ping(connection.as_mut()).await {
                Ok(()) => true,
                Err(err) => {
                    log::debug!("ping of session {} failed: {}", session.name(), err);
                    false
                }
            };
            self.release(session, healthy);
        }

        let mut missing = missing;
        while missing > 0 {
            let count = missing.min(self.config.batch_create_size.max(1));
            missing -= count;
            self.clone().fill(count).await;
        }
    }
}

/// A FIFO pool of Cloud Spanner sessions.
///
/// Idle sessions are handed out most recently used first. When the pool is full, callers wait in
/// a queue and are served strictly in arrival order.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(
        connection: Box<dyn Connection>,
        config: SessionPoolConfig,
        database_role: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                database_role,
                connection: Mutex::new(connection),
                state: Mutex::new(PoolState::default()),
                multiplexed: Mutex::new(None),
                multiplexed_creation: tokio::sync::Mutex::new(()),
                maintenance: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SessionPoolConfig {
        &self.inner.config
    }

    pub fn connection(&self) -> Box<dyn Connection> {
        self.inner.connection()
    }

    /// Starts the maintenance task, which warms the pool up to `min_sessions` right away.
    ///
    /// Must be called from within a tokio runtime. Calling it again has no effect.
    pub fn start(&self) {
        let mut maintenance = self.inner.maintenance.lock();
        if maintenance.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.ping_interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.maintain().await,
                    None => break,
                }
            }
        });
        *maintenance = Some(handle);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use,
            creating: state.creating,
            waiters: state.waiters.len(),
        }
    }

    /// Checks out a session, waiting at most the configured `acquire_timeout`.
    pub async fn acquire(&self, kind: SessionKind) -> Result<PooledSession, Error> {
        self.acquire_until(kind, Instant::now() + self.inner.config.acquire_timeout)
            .await
    }

    /// Checks out a session, failing with `ResourceExhausted` if none is available by `deadline`.
    pub async fn acquire_until(
        &self,
        kind: SessionKind,
        deadline: Instant,
    ) -> Result<PooledSession, Error> {
        if self.inner.uses_multiplexed(kind) {
            let session = self.inner.multiplexed_session().await?;
            return Ok(PooledSession::new(self.inner.clone(), session, false));
        }

        let checkout = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::Client("the session pool was closed".to_string()));
            }
            if let Some(session) = state.idle.pop_back() {
                state.in_use += 1;
                Checkout::Idle(session)
            } else if state.total() < self.inner.config.max_sessions {
                state.creating += 1;
                Checkout::Create
            } else {
                let (sender, receiver) = oneshot::channel();
                let id = state.next_waiter;
                state.next_waiter += 1;
                state.waiters.push_back(Waiter { id, sender });
                Checkout::Wait(id, receiver)
            }
        };

        let session = match checkout {
            Checkout::Idle(session) => session,
            Checkout::Create => {
                let slot = CreationSlot {
                    pool: self.inner.clone(),
                    reserved: true,
                };
                match tokio::time::timeout_at(deadline, self.inner.create_session(false)).await {
                    Ok(Ok(session)) => slot.check_out(session),
                    Ok(Err(err)) => {
                        log::warn!("failed to create a session: {}", err);
                        return Err(err);
                    }
                    Err(_) => return Err(exhausted()),
                }
            }
            Checkout::Wait(id, receiver) => {
                let pending = PendingCheckout {
                    pool: self.inner.clone(),
                    id,
                    receiver,
                    settled: false,
                };
                pending.wait(deadline).await?
            }
        };

        self.inner.maybe_refill();
        Ok(PooledSession::new(self.inner.clone(), session, true))
    }

    /// Deletes every idle session and stops the maintenance task.
    ///
    /// Checked out sessions are deleted when they are returned; pending and future checkouts fail.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.waiters.clear();
            std::mem::take(&mut state.idle)
        };
        if let Some(handle) = self.inner.maintenance.lock().take() {
            handle.abort();
        }
        let mut connection = self.inner.connection();
        let multiplexed = self.inner.multiplexed.lock().take();
        let sessions = idle.into_iter().chain(multiplexed);
        for session in sessions {
            let name = session.name().to_string();
            if let Err(err) = session.delete(connection.as_mut()).await {
                log::debug!("failed to delete session {}: {}", name, err);
            }
        }
    }
}

/// A creation slot reserved by a checkout, given back if the checkout does not complete.
struct CreationSlot {
    pool: Arc<PoolInner>,
    reserved: bool,
}

impl CreationSlot {
    fn check_out(mut self, session: Session) -> Session {
        let mut state = self.pool.state.lock();
        state.creating -= 1;
        state.in_use += 1;
        self.reserved = false;
        session
    }
}

impl Drop for CreationSlot {
    fn drop(&mut self) {
        if self.reserved {
            self.pool.abandon_creation();
        }
    }
}

/// A checkout queued behind other callers.
///
/// Dropped before it settles, it leaves the queue and returns any session it was granted.
struct PendingCheckout {
    pool: Arc<PoolInner>,
    id: u64,
    receiver: oneshot::Receiver<Session>,
    settled: bool,
}

impl PendingCheckout {
    async fn wait(mut self, deadline: Instant) -> Result<Session, Error> {
        let result = match tokio::time::timeout_at(deadline, &mut self.receiver).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(_)) => Err(Error::Client("the session pool was closed".to_string())),
            // the session may have been granted as the deadline expired
            Err(_) => {
                let mut state = self.pool.state.lock();
                state
                    .withdraw(self.id, &mut self.receiver)
                    .ok_or_else(exhausted)
            }
        };
        self.settled = true;
        result
    }
}

impl Drop for PendingCheckout {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.pool.state.lock();
        if let Some(session) = state.withdraw(self.id, &mut self.receiver) {
            state.in_use -= 1;
            if state.closed {
                drop(state);
                self.pool.spawn_delete(session);
            } else {
                state.put(session);
            }
        }
    }
}

/// A session checked out of the [`SessionPool`], returned to it when dropped.
pub struct PooledSession {
    pool: Arc<PoolInner>,
    session: Session,
    exclusive: bool,
    healthy: bool,
}

impl PooledSession {
    fn new(pool: Arc<PoolInner>, session: Session, exclusive: bool) -> Self {
        Self {
            pool,
            session,
            exclusive,
            healthy: true,
        }
    }

    /// Flags the session so that the pool stops handing it out.
    ///
    /// An exclusive session is deleted when returned. A multiplexed one is replaced on the next checkout.
    pub fn mark_bad(&mut self) {
        self.healthy = false;
        if !self.exclusive {
            self.pool.discard_multiplexed(self.session.name());
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub(crate) fn touch(&mut self) {
        self.session.touch();
    }

    pub(crate) fn connection(&self) -> Box<dyn Connection> {
        self.pool.connection()
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &self.session)
            .field("exclusive", &self.exclusive)
            .field("healthy", &self.healthy)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if self.exclusive {
            self.pool.release(self.session.clone(), self.healthy);
        }
    }
}
