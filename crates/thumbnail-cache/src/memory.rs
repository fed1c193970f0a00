//! In-memory thumbnail tier
//!
//! `MemoryThumbnailCache` owns one [`BoundedRecencyCache`] and runs it inside a
//! dedicated task, so every operation is applied strictly one at a time.
//! Membership changes are coalesced and broadcast as a single [`CacheChange`]
//! once the notify delay has passed since the first unflushed change.

use crate::buffer::ThumbnailBuffer;
use crate::key::ThumbnailKey;
use crate::lru::BoundedRecencyCache;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

pub const DEFAULT_NOTIFY_DELAY: Duration = Duration::from_millis(250);

/// Coalesced membership change of the memory tier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheChange {
    pub stored: Vec<ThumbnailKey>,
    pub erased: Vec<ThumbnailKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCacheStat {
    pub size: usize,
    pub count: usize,
    pub max_size: usize,
    pub max_count: usize,
}

#[derive(Default)]
struct PendingChanges {
    stored: BTreeSet<ThumbnailKey>,
    erased: BTreeSet<ThumbnailKey>,
}

impl PendingChanges {
    fn record(&mut self, stored: &[ThumbnailKey], erased: &[ThumbnailKey]) {
        for key in stored {
            self.erased.remove(key);
            self.stored.insert(*key);
        }
        for key in erased {
            self.stored.remove(key);
            self.erased.insert(*key);
        }
    }

    fn is_empty(&self) -> bool {
        self.stored.is_empty() && self.erased.is_empty()
    }

    fn take(&mut self) -> CacheChange {
        CacheChange {
            stored: std::mem::take(&mut self.stored).into_iter().collect(),
            erased: std::mem::take(&mut self.erased).into_iter().collect(),
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Request {
    Store(ThumbnailKey, Arc<ThumbnailBuffer>, Reply<bool>),
    Retrieve(ThumbnailKey, Reply<Option<Arc<ThumbnailBuffer>>>),
    Preserve(ThumbnailKey, Reply<bool>),
    Erase(Vec<ThumbnailKey>, Reply<Vec<ThumbnailKey>>),
    Clear(Reply<()>),
    SetMaxSize(usize, Reply<()>),
    SetMaxCount(usize, Reply<()>),
    Stat(Reply<MemoryCacheStat>),
    Keys(Reply<Vec<ThumbnailKey>>),
    Shutdown(Reply<()>),
}

/// Cloneable handle to a running memory tier
///
/// Calls against a stopped service degrade to misses and no-ops.
#[derive(Clone)]
pub struct MemoryCacheHandle {
    tx: mpsc::UnboundedSender<Request>,
    changes: broadcast::Sender<CacheChange>,
}

impl MemoryCacheHandle {
    /// Insert a buffer; false when it cannot fit or the service has stopped
    pub async fn store(&self, key: ThumbnailKey, buffer: Arc<ThumbnailBuffer>) -> bool {
        self.call(|reply| Request::Store(key, buffer, reply))
            .await
            .unwrap_or(false)
    }

    /// Look up a buffer, making it the most recently used
    pub async fn retrieve(&self, key: ThumbnailKey) -> Option<Arc<ThumbnailBuffer>> {
        self.call(|reply| Request::Retrieve(key, reply)).await.flatten()
    }

    /// Refresh recency without reading the buffer
    pub async fn preserve(&self, key: ThumbnailKey) -> bool {
        self.call(|reply| Request::Preserve(key, reply))
            .await
            .unwrap_or(false)
    }

    /// Remove one key, returning whether it was present
    pub async fn erase(&self, key: ThumbnailKey) -> bool {
        !self.erase_many(vec![key]).await.is_empty()
    }

    /// Erase several keys, returning those that were present
    pub async fn erase_many(&self, keys: Vec<ThumbnailKey>) -> Vec<ThumbnailKey> {
        self.call(|reply| Request::Erase(keys, reply))
            .await
            .unwrap_or_default()
    }

    /// Drop every entry
    pub async fn clear(&self) {
        self.call(Request::Clear).await;
    }

    /// Change the byte budget, evicting down to it
    pub async fn set_max_size(&self, max_size: usize) {
        self.call(|reply| Request::SetMaxSize(max_size, reply)).await;
    }

    /// Change the entry budget, evicting down to it
    pub async fn set_max_count(&self, max_count: usize) {
        self.call(|reply| Request::SetMaxCount(max_count, reply)).await;
    }

    /// Current usage and budgets; all zero once stopped
    pub async fn stats(&self) -> MemoryCacheStat {
        self.call(Request::Stat).await.unwrap_or(MemoryCacheStat {
            size: 0,
            count: 0,
            max_size: 0,
            max_count: 0,
        })
    }

    /// Total bytes held
    pub async fn size(&self) -> usize {
        self.stats().await.size
    }

    /// Number of entries held
    pub async fn count(&self) -> usize {
        self.stats().await.count
    }

    /// Keys from most to least recently used
    pub async fn keys(&self) -> Vec<ThumbnailKey> {
        self.call(Request::Keys).await.unwrap_or_default()
    }

    /// Receive coalesced membership changes
    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }

    /// Flush pending notifications and stop the service
    pub async fn shutdown(&self) {
        self.call(Request::Shutdown).await;
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).ok()?;
        rx.await.ok()
    }
}

pub struct MemoryThumbnailCache {
    cache: BoundedRecencyCache<ThumbnailKey, ThumbnailBuffer>,
    pending: Arc<Mutex<PendingChanges>>,
    changes: broadcast::Sender<CacheChange>,
    notify_delay: Duration,
    flush_at: Option<Instant>,
}

impl MemoryThumbnailCache {
    /// Spawn the memory tier on the current tokio runtime
    pub fn spawn(max_size: usize, max_count: usize, notify_delay: Duration) -> MemoryCacheHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(64);

        let pending: Arc<Mutex<PendingChanges>> = Arc::default();
        let mut cache = BoundedRecencyCache::new(max_size, max_count);
        {
            let pending = Arc::clone(&pending);
            cache.bind_change_callback(move |stored, erased| {
                pending.lock().record(stored, erased);
            });
        }

        let service = Self {
            cache,
            pending,
            changes: changes.clone(),
            notify_delay,
            flush_at: None,
        };
        tokio::spawn(service.run(rx));

        MemoryCacheHandle { tx, changes }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        loop {
            let flush_at = self.flush_at;
            tokio::select! {
                request = rx.recv() => match request {
                    Some(Request::Shutdown(reply)) => {
                        self.flush();
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle(request),
                    None => {
                        self.flush();
                        break;
                    }
                },
                _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    self.flush();
                }
            }

            if self.flush_at.is_none() && !self.pending.lock().is_empty() {
                self.flush_at = Some(Instant::now() + self.notify_delay);
            }
        }
        debug!("memory thumbnail cache stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Store(key, buffer, reply) => {
                let stored = self.cache.store(key, buffer);
                trace!(%key, stored, "memory store");
                let _ = reply.send(stored);
            }
            Request::Retrieve(key, reply) => {
                let _ = reply.send(self.cache.retrieve(&key));
            }
            Request::Preserve(key, reply) => {
                let _ = reply.send(self.cache.preserve(&key));
            }
            Request::Erase(keys, reply) => {
                let _ = reply.send(self.cache.erase_many(&keys));
            }
            Request::Clear(reply) => {
                self.cache.clear();
                let _ = reply.send(());
            }
            Request::SetMaxSize(max_size, reply) => {
                debug!(max_size, "memory cache max size");
                self.cache.set_max_size(max_size);
                let _ = reply.send(());
            }
            Request::SetMaxCount(max_count, reply) => {
                debug!(max_count, "memory cache max count");
                self.cache.set_max_count(max_count);
                let _ = reply.send(());
            }
            Request::Stat(reply) => {
                let _ = reply.send(MemoryCacheStat {
                    size: self.cache.size(),
                    count: self.cache.count(),
                    max_size: self.cache.max_size(),
                    max_count: self.cache.max_count(),
                });
            }
            Request::Keys(reply) => {
                let _ = reply.send(self.cache.keys());
            }
            // Intercepted by the run loop
            Request::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn flush(&mut self) {
        self.flush_at = None;
        let change = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            pending.take()
        };
        trace!(
            stored = change.stored.len(),
            erased = change.erased.len(),
            "memory cache change"
        );
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}
