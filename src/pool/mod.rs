//! Idle connection storage used by the default transport pool.
//!
//! A [`Pooled`] connection goes back to its [`ConnectionPool`] when dropped,
//! unless it reports itself closed or the pool is gone.
use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    hash::Hash,
    ops::{Deref, DerefMut},
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

use monoio::io::{AsyncReadRent, AsyncWriteRent, Split};

const DEFAULT_MAX_IDLE_PER_KEY: usize = 32;
const MAX_IDLE_PER_KEY: usize = 1024;
#[cfg(feature = "time")]
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub trait Poolable {
    fn is_open(&self) -> bool;
}

pub trait Key: Eq + Hash + Clone + 'static {}
impl<T: Eq + Hash + Clone + 'static> Key for T {}

struct Idle<T> {
    conn: T,
    since: Instant,
}

struct Shelves<K, T> {
    idle: HashMap<K, VecDeque<Idle<T>>>,
    max_idle_per_key: usize,
    idle_timeout: Option<Duration>,
}

impl<K: Key, T> Shelves<K, T> {
    fn is_fresh(&self, idle: &Idle<T>) -> bool {
        self.idle_timeout
            .map_or(true, |timeout| idle.since.elapsed() <= timeout)
    }

    fn shelve(&mut self, key: K, conn: T) {
        let max = self.max_idle_per_key;
        let queue = self.idle.entry(key).or_default();
        while queue.len() >= max {
            // oldest first
            queue.pop_front();
        }
        queue.push_back(Idle {
            conn,
            since: Instant::now(),
        });
    }

    fn take(&mut self, key: &K) -> Option<T> {
        loop {
            let idle = self.idle.get_mut(key)?.pop_front()?;
            if self.is_fresh(&idle) {
                return Some(idle.conn);
            }
        }
    }

    fn sweep(&mut self) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        self.idle.retain(|_, queue| {
            queue.retain(|idle| idle.since.elapsed() <= timeout);
            !queue.is_empty()
        });
    }
}

type Shared<K, T> = Rc<RefCell<Shelves<K, T>>>;

/// Per-key queues of idle connections.
pub struct ConnectionPool<K, T> {
    shared: Shared<K, T>,
    #[cfg(feature = "time")]
    _sweeper: Option<local_sync::oneshot::Receiver<()>>,
}

impl<K, T> std::fmt::Debug for ConnectionPool<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shelves = self.shared.borrow();
        f.debug_struct("ConnectionPool")
            .field("keys", &shelves.idle.len())
            .field("max_idle_per_key", &shelves.max_idle_per_key)
            .field("idle_timeout", &shelves.idle_timeout)
            .finish()
    }
}

impl<K: Key, T: 'static> ConnectionPool<K, T> {
    /// `max_idle_per_key` is capped; `None` keeps the default.
    pub fn new(max_idle_per_key: Option<usize>) -> Self {
        Self::build(max_idle_per_key, None)
    }

    /// Connections idle for longer than `idle_timeout` are never handed out
    /// and get swept periodically.
    #[cfg(feature = "time")]
    pub fn with_idle_timeout(max_idle_per_key: Option<usize>, idle_timeout: Duration) -> Self {
        let mut pool = Self::build(max_idle_per_key, Some(idle_timeout));
        let (tx, rx) = local_sync::oneshot::channel();
        monoio::spawn(Sweeper {
            tx,
            shelves: Rc::downgrade(&pool.shared),
            interval: monoio::time::interval(idle_timeout.max(MIN_SWEEP_INTERVAL)),
        });
        pool._sweeper = Some(rx);
        pool
    }

    fn build(max_idle_per_key: Option<usize>, idle_timeout: Option<Duration>) -> Self {
        let max_idle_per_key = max_idle_per_key
            .unwrap_or(DEFAULT_MAX_IDLE_PER_KEY)
            .clamp(1, MAX_IDLE_PER_KEY);
        Self {
            shared: Rc::new(RefCell::new(Shelves {
                idle: HashMap::new(),
                max_idle_per_key,
                idle_timeout,
            })),
            #[cfg(feature = "time")]
            _sweeper: None,
        }
    }
}

impl<K: Key, T: 'static> Default for ConnectionPool<K, T> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<K: Key, T: Poolable> ConnectionPool<K, T> {
    /// Takes the oldest fresh idle connection for `key`.
    pub fn get(&self, key: &K) -> Option<Pooled<K, T>> {
        let conn = self.shared.borrow_mut().take(key)?;
        #[cfg(feature = "logging")]
        tracing::debug!("reusing idle connection");
        Some(Pooled::new(key.clone(), conn, true, Rc::downgrade(&self.shared)))
    }

    pub fn put(&self, key: K, conn: T) {
        if conn.is_open() {
            self.shared.borrow_mut().shelve(key, conn);
        }
    }

    /// Wraps a fresh connection so it is shelved under `key` once dropped.
    pub fn link(&self, key: K, conn: T) -> Pooled<K, T> {
        Pooled::new(key, conn, false, Rc::downgrade(&self.shared))
    }

    pub fn idle_count(&self, key: &K) -> usize {
        let shelves = self.shared.borrow();
        shelves
            .idle
            .get(key)
            .map_or(0, |queue| queue.iter().filter(|i| shelves.is_fresh(i)).count())
    }

    pub fn total_idle_count(&self) -> usize {
        self.shared.borrow().idle.values().map(VecDeque::len).sum()
    }
}

/// A connection on loan from a [`ConnectionPool`].
pub struct Pooled<K: Key, T: Poolable> {
    value: Option<T>,
    is_reused: bool,
    home: Option<(K, Weak<RefCell<Shelves<K, T>>>)>,
}

impl<K: Key, T: Poolable> Pooled<K, T> {
    fn new(key: K, value: T, is_reused: bool, pool: Weak<RefCell<Shelves<K, T>>>) -> Self {
        Self {
            value: Some(value),
            is_reused,
            home: Some((key, pool)),
        }
    }

    /// A connection that is closed instead of shelved on drop.
    pub fn unpooled(value: T) -> Self {
        Self {
            value: Some(value),
            is_reused: false,
            home: None,
        }
    }

    #[inline]
    pub fn is_reused(&self) -> bool {
        self.is_reused
    }

    #[inline]
    fn inner(&mut self) -> &mut T {
        match self.value.as_mut() {
            Some(value) => value,
            None => unreachable!("pooled connection used after drop"),
        }
    }
}

impl<K: Key, T: Poolable + std::fmt::Debug> std::fmt::Debug for Pooled<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("value", &self.value)
            .field("is_reused", &self.is_reused)
            .finish()
    }
}

impl<K: Key, T: Poolable> Deref for Pooled<K, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.value.as_ref() {
            Some(value) => value,
            None => unreachable!("pooled connection used after drop"),
        }
    }
}

impl<K: Key, T: Poolable> DerefMut for Pooled<K, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner()
    }
}

impl<K: Key, T: Poolable> Drop for Pooled<K, T> {
    fn drop(&mut self) {
        let (Some(value), Some((key, pool))) = (self.value.take(), self.home.take()) else {
            return;
        };
        if !value.is_open() {
            return;
        }
        if let Some(pool) = pool.upgrade() {
            pool.borrow_mut().shelve(key, value);
        }
    }
}

unsafe impl<K: Key, T: Poolable + Split> Split for Pooled<K, T> {}

impl<K: Key, I: Poolable + AsyncReadRent> AsyncReadRent for Pooled<K, I> {
    #[inline]
    fn read<T: monoio::buf::IoBufMut>(
        &mut self,
        buf: T,
    ) -> impl std::future::Future<Output = monoio::BufResult<usize, T>> {
        self.inner().read(buf)
    }

    #[inline]
    fn readv<T: monoio::buf::IoVecBufMut>(
        &mut self,
        buf: T,
    ) -> impl std::future::Future<Output = monoio::BufResult<usize, T>> {
        self.inner().readv(buf)
    }
}

impl<K: Key, I: Poolable + AsyncWriteRent> AsyncWriteRent for Pooled<K, I> {
    #[inline]
    fn write<T: monoio::buf::IoBuf>(
        &mut self,
        buf: T,
    ) -> impl std::future::Future<Output = monoio::BufResult<usize, T>> {
        self.inner().write(buf)
    }

    #[inline]
    fn writev<T: monoio::buf::IoVecBuf>(
        &mut self,
        buf_vec: T,
    ) -> impl std::future::Future<Output = monoio::BufResult<usize, T>> {
        self.inner().writev(buf_vec)
    }

    #[inline]
    fn flush(&mut self) -> impl std::future::Future<Output = std::io::Result<()>> {
        self.inner().flush()
    }

    #[inline]
    fn shutdown(&mut self) -> impl std::future::Future<Output = std::io::Result<()>> {
        self.inner().shutdown()
    }
}

/// Drops stale idle connections until the pool goes away.
#[cfg(feature = "time")]
struct Sweeper<K, T> {
    tx: local_sync::oneshot::Sender<()>,
    shelves: Weak<RefCell<Shelves<K, T>>>,
    interval: monoio::time::Interval,
}

#[cfg(feature = "time")]
impl<K: Key, T> std::future::Future for Sweeper<K, T> {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if this.tx.poll_closed(cx).is_ready() {
                #[cfg(feature = "logging")]
                tracing::debug!("connection pool dropped, sweeper exit");
                return std::task::Poll::Ready(());
            }
            std::task::ready!(this.interval.poll_tick(cx));
            let Some(shelves) = this.shelves.upgrade() else {
                return std::task::Poll::Ready(());
            };
            shelves.borrow_mut().sweep();
        }
    }
}
