//! Persistent thumbnail tier
//!
//! `DiskThumbnailStore` owns the [`DiskCacheStat`] index and the budgets for one
//! cache directory. Its request loop never touches the filesystem: every read,
//! write, delete and scan is handed to the [`WorkerPool`], and the result comes
//! back to the loop as a completion message that updates the index.

use crate::buffer::ThumbnailBuffer;
use crate::codec::DEFAULT_JPEG_QUALITY;
use crate::disk_stat::{thumbnail_path, DiskCacheStat, DiskEntry};
use crate::error::{Result, ThumbnailError};
use crate::key::ThumbnailKey;
use crate::worker::{Pending, WorkerPool};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<T>;
type RemovalReply = Reply<Result<Vec<ThumbnailKey>>>;

const NOT_CONFIGURED: ThumbnailError = ThumbnailError::Unavailable("disk cache path not configured");

fn stopped() -> ThumbnailError {
    ThumbnailError::Unavailable("disk store stopped")
}

enum Request {
    Configure(PathBuf, Reply<Result<()>>),
    Rescan(Reply<Result<()>>),
    Has(ThumbnailKey, Reply<bool>),
    Read(ThumbnailKey, Reply<Result<Arc<ThumbnailBuffer>>>),
    Write(ThumbnailKey, Arc<ThumbnailBuffer>, Reply<Result<usize>>),
    Evict(usize, usize, RemovalReply),
    Remove(Vec<ThumbnailKey>, RemovalReply),
    SetMaxSize(usize, RemovalReply),
    SetMaxCount(usize, RemovalReply),
    SetQuality(u8, Reply<()>),
    Stat(Reply<DiskCacheStat>),
    Path(Reply<Option<PathBuf>>),
    Encode(Arc<ThumbnailBuffer>, u8, Reply<Result<Vec<u8>>>),
    Decode(Vec<u8>, Reply<Result<ThumbnailBuffer>>),
    Shutdown(Reply<()>),
}

/// Worker results routed back into the request loop
enum Completion {
    Scanned {
        generation: u64,
        result: Result<DiskCacheStat>,
        reply: Reply<Result<()>>,
    },
    Read {
        generation: u64,
        key: ThumbnailKey,
        result: Result<(ThumbnailBuffer, SystemTime)>,
        reply: Reply<Result<Arc<ThumbnailBuffer>>>,
    },
    Written {
        generation: u64,
        key: ThumbnailKey,
        result: Result<usize>,
        reply: Reply<Result<usize>>,
    },
    Removed {
        generation: u64,
        evicted: Vec<(ThumbnailKey, DiskEntry)>,
        result: Result<Vec<ThumbnailKey>>,
        reply: Option<RemovalReply>,
    },
}

/// Cloneable handle to a running disk tier
#[derive(Clone)]
pub struct DiskStoreHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl DiskStoreHandle {
    /// Point the store at `path`, creating it if needed, and rebuild the index
    ///
    /// Resolves once the scan has finished.
    pub async fn configure(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.try_call(|reply| Request::Configure(path, reply)).await
    }

    /// Rebuild the index from the current directory
    pub async fn rescan(&self) -> Result<()> {
        self.try_call(Request::Rescan).await
    }

    /// Index lookup only; the filesystem is not consulted
    pub async fn has(&self, key: ThumbnailKey) -> bool {
        self.call(|reply| Request::Has(key, reply))
            .await
            .unwrap_or(false)
    }

    pub async fn read(&self, key: ThumbnailKey) -> Result<Arc<ThumbnailBuffer>> {
        self.try_call(|reply| Request::Read(key, reply)).await
    }

    /// Persist a thumbnail, returning the encoded size in bytes
    pub async fn write(&self, key: ThumbnailKey, buffer: Arc<ThumbnailBuffer>) -> Result<usize> {
        self.try_call(|reply| Request::Write(key, buffer, reply))
            .await
    }

    /// Remove oldest entries until within the given limits
    pub async fn evict(&self, max_size: usize, max_count: usize) -> Result<Vec<ThumbnailKey>> {
        self.try_call(|reply| Request::Evict(max_size, max_count, reply))
            .await
    }

    /// Remove specific keys, returning those that were deleted
    pub async fn remove(&self, keys: Vec<ThumbnailKey>) -> Result<Vec<ThumbnailKey>> {
        self.try_call(|reply| Request::Remove(keys, reply)).await
    }

    /// Remove every cached file
    pub async fn clear(&self) -> Result<Vec<ThumbnailKey>> {
        self.evict(0, 0).await
    }

    pub async fn set_max_size(&self, max_size: usize) -> Result<Vec<ThumbnailKey>> {
        self.try_call(|reply| Request::SetMaxSize(max_size, reply))
            .await
    }

    pub async fn set_max_count(&self, max_count: usize) -> Result<Vec<ThumbnailKey>> {
        self.try_call(|reply| Request::SetMaxCount(max_count, reply))
            .await
    }

    pub async fn set_quality(&self, quality: u8) {
        self.call(|reply| Request::SetQuality(quality, reply)).await;
    }

    pub async fn stats(&self) -> DiskCacheStat {
        self.call(Request::Stat).await.unwrap_or_default()
    }

    pub async fn path(&self) -> Option<PathBuf> {
        self.call(Request::Path).await.flatten()
    }

    pub async fn encode(&self, buffer: Arc<ThumbnailBuffer>, quality: u8) -> Result<Vec<u8>> {
        self.try_call(|reply| Request::Encode(buffer, quality, reply))
            .await
    }

    pub async fn decode(&self, bytes: Vec<u8>) -> Result<ThumbnailBuffer> {
        self.try_call(|reply| Request::Decode(bytes, reply)).await
    }

    pub async fn shutdown(&self) {
        self.call(Request::Shutdown).await;
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).ok()?;
        rx.await.ok()
    }

    async fn try_call<T>(&self, make: impl FnOnce(Reply<Result<T>>) -> Request) -> Result<T> {
        self.call(make).await.unwrap_or_else(|| Err(stopped()))
    }
}

pub struct DiskThumbnailStore {
    pool: WorkerPool,
    root: Option<PathBuf>,
    stat: DiskCacheStat,
    max_size: usize,
    max_count: usize,
    quality: u8,
    /// Bumped on every (re)configure so late completions for an old
    /// directory leave the index alone
    generation: u64,
    scanning: bool,
    removed_during_scan: HashSet<ThumbnailKey>,
    done_tx: mpsc::UnboundedSender<Completion>,
}

impl DiskThumbnailStore {
    /// Spawn an unconfigured disk tier with its worker pool
    pub fn spawn(workers: usize, max_size: usize, max_count: usize) -> Result<DiskStoreHandle> {
        let pool = WorkerPool::new(workers)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let store = Self {
            pool,
            root: None,
            stat: DiskCacheStat::default(),
            max_size,
            max_count,
            quality: DEFAULT_JPEG_QUALITY,
            generation: 0,
            scanning: false,
            removed_during_scan: HashSet::new(),
            done_tx,
        };
        tokio::spawn(store.run(rx, done_rx));

        Ok(DiskStoreHandle { tx })
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Request>,
        mut done_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(Request::Shutdown(reply)) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle(request),
                    None => break,
                },
                Some(done) = done_rx.recv() => self.complete(done),
            }
        }

        debug!("disk thumbnail store stopped");
        // Joining the workers blocks until their current job finishes
        let pool = self.pool;
        tokio::task::spawn_blocking(move || drop(pool));
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Configure(path, reply) => {
                info!(path = %path.display(), "configuring disk thumbnail cache");
                self.start_scan(path, reply);
            }
            Request::Rescan(reply) => match self.root.clone() {
                Some(root) => self.start_scan(root, reply),
                None => {
                    let _ = reply.send(Err(NOT_CONFIGURED));
                }
            },
            Request::Has(key, reply) => {
                let _ = reply.send(self.stat.contains(key));
            }
            Request::Read(key, reply) => self.read(key, reply),
            Request::Write(key, buffer, reply) => self.write(key, buffer, reply),
            Request::Evict(max_size, max_count, reply) => {
                if self.root.is_none() {
                    let _ = reply.send(Err(NOT_CONFIGURED));
                    return;
                }
                let evicted = self.stat.evict(max_size, max_count);
                self.delete(evicted, Some(reply));
            }
            Request::Remove(keys, reply) => {
                if self.root.is_none() {
                    let _ = reply.send(Err(NOT_CONFIGURED));
                    return;
                }
                let evicted = keys
                    .into_iter()
                    .filter_map(|key| self.stat.remove(key).map(|entry| (key, entry)))
                    .collect();
                self.delete(evicted, Some(reply));
            }
            Request::SetMaxSize(max_size, reply) => {
                debug!(max_size, "disk cache max size");
                self.max_size = max_size;
                self.enforce_budget(Some(reply));
            }
            Request::SetMaxCount(max_count, reply) => {
                debug!(max_count, "disk cache max count");
                self.max_count = max_count;
                self.enforce_budget(Some(reply));
            }
            Request::SetQuality(quality, reply) => {
                self.quality = quality;
                let _ = reply.send(());
            }
            Request::Stat(reply) => {
                let _ = reply.send(self.stat.clone());
            }
            Request::Path(reply) => {
                let _ = reply.send(self.root.clone());
            }
            Request::Encode(buffer, quality, reply) => {
                let pending = self.pool.encode(buffer, quality);
                tokio::spawn(async move {
                    let _ = reply.send(pending.wait().await);
                });
            }
            Request::Decode(bytes, reply) => {
                let pending = self.pool.decode(bytes);
                tokio::spawn(async move {
                    let _ = reply.send(pending.wait().await);
                });
            }
            // Intercepted by the run loop
            Request::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn start_scan(&mut self, root: PathBuf, reply: Reply<Result<()>>) {
        self.generation += 1;
        self.root = Some(root.clone());
        self.stat = DiskCacheStat::default();
        self.scanning = true;
        self.removed_during_scan.clear();

        let generation = self.generation;
        self.complete_later(self.pool.scan(root), move |result| Completion::Scanned {
            generation,
            result,
            reply,
        });
    }

    fn read(&mut self, key: ThumbnailKey, reply: Reply<Result<Arc<ThumbnailBuffer>>>) {
        let Some(root) = &self.root else {
            let _ = reply.send(Err(NOT_CONFIGURED));
            return;
        };
        if !self.stat.contains(key) {
            let _ = reply.send(Err(ThumbnailError::NotFound(key)));
            return;
        }

        let generation = self.generation;
        let pending = self.pool.read(thumbnail_path(root, key));
        self.complete_later(pending, move |result| Completion::Read {
            generation,
            key,
            result,
            reply,
        });
    }

    fn write(&mut self, key: ThumbnailKey, buffer: Arc<ThumbnailBuffer>, reply: Reply<Result<usize>>) {
        let Some(root) = &self.root else {
            let _ = reply.send(Err(NOT_CONFIGURED));
            return;
        };

        let generation = self.generation;
        let pending = self
            .pool
            .write(thumbnail_path(root, key), buffer, self.quality);
        self.complete_later(pending, move |result| Completion::Written {
            generation,
            key,
            result,
            reply,
        });
    }

    fn enforce_budget(&mut self, reply: Option<RemovalReply>) {
        let evicted = self.stat.evict(self.max_size, self.max_count);
        self.delete(evicted, reply);
    }

    /// Delete files for entries already taken out of the index
    fn delete(&mut self, evicted: Vec<(ThumbnailKey, DiskEntry)>, reply: Option<RemovalReply>) {
        let root = match &self.root {
            Some(root) if !evicted.is_empty() => root,
            _ => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(Vec::new()));
                }
                return;
            }
        };

        if self.scanning {
            self.removed_during_scan
                .extend(evicted.iter().map(|(key, _)| *key));
        }

        let files = evicted
            .iter()
            .map(|(key, _)| (*key, thumbnail_path(root, *key)))
            .collect();
        let generation = self.generation;
        self.complete_later(self.pool.remove(files), move |result| Completion::Removed {
            generation,
            evicted,
            result,
            reply,
        });
    }

    fn complete_later<T: Send + 'static>(
        &self,
        pending: Pending<T>,
        finish: impl FnOnce(Result<T>) -> Completion + Send + 'static,
    ) {
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let result = pending.wait().await;
            let _ = done.send(finish(result));
        });
    }

    fn complete(&mut self, done: Completion) {
        match done {
            Completion::Scanned {
                generation,
                result,
                reply,
            } => {
                if generation != self.generation {
                    let _ = reply.send(Err(ThumbnailError::Cancelled));
                    return;
                }
                self.scanning = false;
                match result {
                    Ok(mut scanned) => {
                        // Keep what changed while the scan was running
                        for (key, entry) in self.stat.entries.drain() {
                            scanned.add(key, entry.size, entry.mtime);
                        }
                        for key in self.removed_during_scan.drain() {
                            scanned.remove(key);
                        }
                        self.stat = scanned;
                        info!(
                            count = self.stat.count,
                            size = self.stat.size,
                            "disk thumbnail cache scanned"
                        );
                        self.enforce_budget(None);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        warn!(error = %e, "disk thumbnail cache scan failed");
                        self.root = None;
                        self.stat = DiskCacheStat::default();
                        self.removed_during_scan.clear();
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Completion::Read {
                generation,
                key,
                result,
                reply,
            } => {
                let current = generation == self.generation;
                let result = match result {
                    Ok((buffer, mtime)) => {
                        if current {
                            self.stat.touch(key, mtime);
                        }
                        Ok(Arc::new(buffer))
                    }
                    Err(e) => {
                        if current && is_missing_file(&e) {
                            debug!(%key, "cached thumbnail vanished from disk");
                            self.stat.remove(key);
                        }
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            Completion::Written {
                generation,
                key,
                result,
                reply,
            } => {
                match &result {
                    Ok(size) if generation == self.generation => {
                        self.stat.add(key, *size, SystemTime::now());
                        self.removed_during_scan.remove(&key);
                        self.enforce_budget(None);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%key, error = %e, "failed to write thumbnail to disk"),
                }
                let _ = reply.send(result);
            }
            Completion::Removed {
                generation,
                evicted,
                result,
                reply,
            } => {
                let failed: HashSet<ThumbnailKey> = match result {
                    Ok(failed) => failed.into_iter().collect(),
                    Err(e) => {
                        warn!(error = %e, "disk thumbnail deletion did not run");
                        evicted.iter().map(|(key, _)| *key).collect()
                    }
                };

                let mut removed = Vec::with_capacity(evicted.len());
                for (key, entry) in evicted {
                    if !failed.contains(&key) {
                        removed.push(key);
                    } else if generation == self.generation && !self.stat.contains(key) {
                        // Retried on the next eviction pass
                        self.removed_during_scan.remove(&key);
                        self.stat.add(key, entry.size, entry.mtime);
                    }
                }

                if !removed.is_empty() {
                    debug!(removed = removed.len(), "evicted disk thumbnails");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(removed));
                }
            }
        }
    }
}

fn is_missing_file(e: &ThumbnailError) -> bool {
    matches!(e, ThumbnailError::Io { source, .. } if source.kind() == ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use image::{Rgb, RgbImage};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample(shade: u8) -> Arc<ThumbnailBuffer> {
        Arc::new(ThumbnailBuffer::from_rgb_image(RgbImage::from_pixel(
            12,
            8,
            Rgb([shade, 64, 200]),
        )))
    }

    fn key(name: &str) -> ThumbnailKey {
        ThumbnailKey::named(name, 256)
    }

    fn unbounded() -> DiskStoreHandle {
        DiskThumbnailStore::spawn(2, usize::MAX, usize::MAX).unwrap()
    }

    fn set_age(root: &std::path::Path, key: ThumbnailKey, secs: u64) {
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs);
        set_file_mtime(thumbnail_path(root, key), FileTime::from_system_time(mtime)).unwrap();
    }

    #[tokio::test]
    async fn test_unconfigured_store_is_unavailable() {
        let store = unbounded();

        assert!(!store.has(key("a")).await);
        assert!(matches!(
            store.read(key("a")).await,
            Err(ThumbnailError::Unavailable(_))
        ));
        assert!(matches!(
            store.write(key("a"), sample(1)).await,
            Err(ThumbnailError::Unavailable(_))
        ));
        assert!(store.set_max_count(3).await.unwrap().is_empty());
        assert_eq!(store.stats().await.count, 0);
    }

    #[tokio::test]
    async fn test_configure_scans_existing_files() {
        let dir = tempdir().unwrap();
        let mut expected = 0;
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let path = thumbnail_path(dir.path(), key(name));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, vec![0u8; 50 * (i + 1)]).unwrap();
            expected += 50 * (i + 1);
        }

        let store = unbounded();
        store.configure(dir.path()).await.unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.count, 3);
        assert_eq!(stats.size, expected);
        assert!(store.has(key("b")).await);
        assert_eq!(store.path().await.as_deref(), Some(dir.path()));
    }

    #[tokio::test]
    async fn test_configure_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        let store = unbounded();
        store.configure(&nested).await.unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_configure_rejects_uncreatable_directory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"x").unwrap();

        let store = unbounded();
        let err = store.configure(file.join("cache")).await.unwrap_err();
        assert!(matches!(err, ThumbnailError::Config(_)));
        assert!(store.path().await.is_none());
    }

    #[tokio::test]
    async fn test_write_read_round_trip_bumps_mtime() {
        let dir = tempdir().unwrap();
        let store = unbounded();
        store.configure(dir.path()).await.unwrap();

        let size = store.write(key("a"), sample(10)).await.unwrap();
        assert!(size > 0);
        assert!(store.has(key("a")).await);
        assert_eq!(store.stats().await.size, size);

        set_age(dir.path(), key("a"), 0);
        store.rescan().await.unwrap();
        let before = store.stats().await.entries[&key("a")].mtime;

        let buffer = store.read(key("a")).await.unwrap();
        assert_eq!((buffer.width(), buffer.height()), (12, 8));

        let after = store.stats().await.entries[&key("a")].mtime;
        assert!(after > before);
        let on_disk = fs::metadata(thumbnail_path(dir.path(), key("a")))
            .unwrap()
            .modified()
            .unwrap();
        assert!(on_disk > before);
    }

    #[tokio::test]
    async fn test_read_unknown_key_is_not_found() {
        let dir = tempdir().unwrap();
        let store = unbounded();
        store.configure(dir.path()).await.unwrap();

        assert!(matches!(
            store.read(key("missing")).await,
            Err(ThumbnailError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_vanished_file_drops_from_index() {
        let dir = tempdir().unwrap();
        let store = unbounded();
        store.configure(dir.path()).await.unwrap();
        store.write(key("a"), sample(1)).await.unwrap();

        fs::remove_file(thumbnail_path(dir.path(), key("a"))).unwrap();
        assert!(matches!(
            store.read(key("a")).await,
            Err(ThumbnailError::Io { .. })
        ));
        assert!(!store.has(key("a")).await);
        assert_eq!(store.stats().await.size, 0);
    }

    #[tokio::test]
    async fn test_set_max_count_evicts_oldest_mtime() {
        let dir = tempdir().unwrap();
        let store = unbounded();
        store.configure(dir.path()).await.unwrap();

        for (age, name) in [(20, "a"), (10, "b"), (30, "c")] {
            store.write(key(name), sample(age as u8)).await.unwrap();
            set_age(dir.path(), key(name), age);
        }
        store.rescan().await.unwrap();

        let removed = store.set_max_count(2).await.unwrap();
        assert_eq!(removed, vec![key("b")]);
        assert!(!thumbnail_path(dir.path(), key("b")).exists());
        assert!(store.has(key("a")).await);
        assert!(store.has(key("c")).await);
        assert_eq!(store.stats().await.count, 2);
    }

    #[tokio::test]
    async fn test_write_over_budget_evicts() {
        let dir = tempdir().unwrap();
        let store = DiskThumbnailStore::spawn(2, usize::MAX, 1).unwrap();
        store.configure(dir.path()).await.unwrap();

        store.write(key("a"), sample(1)).await.unwrap();
        set_age(dir.path(), key("a"), 0);
        store.rescan().await.unwrap();
        store.write(key("b"), sample(2)).await.unwrap();

        // Eviction is dispatched after the write reply; wait for it to land
        for _ in 0..100 {
            if !thumbnail_path(dir.path(), key("a")).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!thumbnail_path(dir.path(), key("a")).exists());
        assert!(!store.has(key("a")).await);
        assert!(store.has(key("b")).await);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempdir().unwrap();
        let store = unbounded();
        store.configure(dir.path()).await.unwrap();
        for name in ["a", "b", "c"] {
            store.write(key(name), sample(3)).await.unwrap();
        }

        let removed = store.remove(vec![key("a"), key("zzz")]).await.unwrap();
        assert_eq!(removed, vec![key("a")]);
        assert_eq!(store.stats().await.count, 2);

        let mut cleared = store.clear().await.unwrap();
        cleared.sort();
        let mut expected = vec![key("b"), key("c")];
        expected.sort();
        assert_eq!(cleared, expected);

        let stats = store.stats().await;
        assert_eq!((stats.size, stats.count), (0, 0));
    }

    #[tokio::test]
    async fn test_codec_through_store() {
        let store = unbounded();
        let bytes = store.encode(sample(90), 75).await.unwrap();
        let decoded = store.decode(bytes).await.unwrap();
        assert_eq!((decoded.width(), decoded.height()), (12, 8));
    }

    #[tokio::test]
    async fn test_shutdown_stops_store() {
        let store = unbounded();
        store.shutdown().await;
        assert!(matches!(
            store.rescan().await,
            Err(ThumbnailError::Unavailable(_))
        ));
    }
}
