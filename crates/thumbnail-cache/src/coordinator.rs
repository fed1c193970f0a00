//! Serialized thumbnail request pipeline
//!
//! Memory hits are answered directly by the handle. Everything else joins a
//! single FIFO queue that the coordinator works through one request at a time:
//! memory again, then disk, then the external reader. Only one call to the
//! reader is ever outstanding. Queued requests can be cancelled by job id until
//! they start. A request for a thumbnail that is already queued or being
//! serviced joins that entry instead of queueing a second reader call.

use crate::buffer::ThumbnailBuffer;
use crate::disk::DiskStoreHandle;
use crate::error::{Result, ThumbnailError};
use crate::key::{FrameId, JobId, ThumbnailKey};
use crate::memory::MemoryCacheHandle;
use crate::reader::ThumbnailReader;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub const DEFAULT_THUMBNAIL_SIZE: u32 = 256;
pub const DEFAULT_QUEUE_STEP_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(30);

type Reply<T> = oneshot::Sender<T>;
type BufferReply = Reply<Result<Arc<ThumbnailBuffer>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Pixel size used by [`CoordinatorHandle::get_thumbnail_default`]
    pub thumbnail_size: u32,
    /// Mirror of the disk budgets; a zero in either disables disk writes
    pub disk_max_size: usize,
    pub disk_max_count: usize,
    /// Pause between finishing one request and starting the next
    pub queue_step_delay: Duration,
    /// Upper bound on a single reader call; `None` waits forever
    pub generation_timeout: Option<Duration>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
            disk_max_size: usize::MAX,
            disk_max_count: usize::MAX,
            queue_step_delay: DEFAULT_QUEUE_STEP_DELAY,
            generation_timeout: Some(DEFAULT_GENERATION_TIMEOUT),
        }
    }
}

/// One caller waiting on a queue entry
struct Waiter {
    job_id: JobId,
    reply: BufferReply,
}

/// A queue entry; every waiter shares the same key and disk policy
struct PendingRequest {
    frame: FrameId,
    size: u32,
    key: ThumbnailKey,
    allow_disk_cache: bool,
    waiters: Vec<Waiter>,
}

impl PendingRequest {
    fn merges_with(&self, key: ThumbnailKey, allow_disk_cache: bool) -> bool {
        self.key == key && self.allow_disk_cache == allow_disk_cache
    }
}

enum Request {
    Enqueue(PendingRequest),
    Cancel(JobId, Reply<bool>),
    QueueLen(Reply<usize>),
    Settings(Reply<CoordinatorSettings>),
    SetThumbnailSize(u32, Reply<()>),
    SetDiskMaxSize(usize, Reply<()>),
    SetDiskMaxCount(usize, Reply<()>),
    SetGenerationTimeout(Option<Duration>, Reply<()>),
    Shutdown(Reply<()>),
}

/// Cloneable handle to a running coordinator
///
/// Dropping every handle shuts the coordinator down.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Request>,
    memory: MemoryCacheHandle,
}

impl CoordinatorHandle {
    /// Fetch or generate the thumbnail of `frame` at `size` pixels
    ///
    /// A memory hit returns without queueing. `job_id` is the handle used
    /// by [`cancel`](Self::cancel).
    pub async fn get_thumbnail(
        &self,
        frame: FrameId,
        size: u32,
        freshness_hash: u64,
        allow_disk_cache: bool,
        job_id: JobId,
    ) -> Result<Arc<ThumbnailBuffer>> {
        let key = ThumbnailKey::new(&frame, freshness_hash, size);
        if let Some(buffer) = self.memory.retrieve(key).await {
            trace!(%key, "memory fast path");
            return Ok(buffer);
        }

        let (reply, rx) = oneshot::channel();
        let request = PendingRequest {
            frame,
            size,
            key,
            allow_disk_cache,
            waiters: vec![Waiter { job_id, reply }],
        };
        self.tx
            .send(Request::Enqueue(request))
            .map_err(|_| ThumbnailError::ShuttingDown)?;
        rx.await.unwrap_or(Err(ThumbnailError::ShuttingDown))
    }

    /// [`get_thumbnail`](Self::get_thumbnail) at the configured default size
    pub async fn get_thumbnail_default(&self, frame: FrameId) -> Result<Arc<ThumbnailBuffer>> {
        let size = self.settings().await?.thumbnail_size;
        self.get_thumbnail(frame, size, 0, true, JobId::next())
            .await
    }

    /// Cancel every queued request carrying `job_id`
    ///
    /// Other callers merged into the same entry keep waiting. Returns false
    /// when nothing was queued under that id, including when the request is
    /// already being serviced.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        self.call(|reply| Request::Cancel(job_id, reply))
            .await
            .unwrap_or(false)
    }

    /// Memory-only lookup by pre-hashed key; never triggers generation
    pub async fn get_cached(&self, key: ThumbnailKey) -> Result<Arc<ThumbnailBuffer>> {
        self.memory
            .retrieve(key)
            .await
            .ok_or(ThumbnailError::NotCached)
    }

    /// Put a caller-produced thumbnail into the memory tier under `name`
    pub async fn store_cached(&self, name: &str, size: u32, buffer: ThumbnailBuffer) -> Option<ThumbnailKey> {
        let key = ThumbnailKey::named(name, size);
        self.memory
            .store(key, Arc::new(buffer))
            .await
            .then_some(key)
    }

    /// Distinct thumbnails waiting behind the one being serviced
    pub async fn queue_len(&self) -> usize {
        self.call(Request::QueueLen).await.unwrap_or(0)
    }

    pub async fn settings(&self) -> Result<CoordinatorSettings> {
        self.call(Request::Settings)
            .await
            .ok_or(ThumbnailError::ShuttingDown)
    }

    pub async fn set_thumbnail_size(&self, size: u32) {
        self.call(|reply| Request::SetThumbnailSize(size, reply))
            .await;
    }

    pub async fn set_disk_max_size(&self, max_size: usize) {
        self.call(|reply| Request::SetDiskMaxSize(max_size, reply))
            .await;
    }

    pub async fn set_disk_max_count(&self, max_count: usize) {
        self.call(|reply| Request::SetDiskMaxCount(max_count, reply))
            .await;
    }

    pub async fn set_generation_timeout(&self, timeout: Option<Duration>) {
        self.call(|reply| Request::SetGenerationTimeout(timeout, reply))
            .await;
    }

    /// Fail all queued and in-flight requests with `ShuttingDown` and stop
    pub async fn shutdown(&self) {
        self.call(Request::Shutdown).await;
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).ok()?;
        rx.await.ok()
    }
}

/// The request currently being serviced
struct InFlight {
    key: ThumbnailKey,
    allow_disk_cache: bool,
    waiters: Vec<Waiter>,
    task: JoinHandle<Result<Arc<ThumbnailBuffer>>>,
}

pub struct ThumbnailCoordinator {
    reader: Arc<dyn ThumbnailReader>,
    memory: MemoryCacheHandle,
    disk: Option<DiskStoreHandle>,
    settings: CoordinatorSettings,
    queue: VecDeque<PendingRequest>,
    in_flight: Option<InFlight>,
    next_step: Option<Instant>,
}

impl ThumbnailCoordinator {
    pub fn spawn(
        reader: Arc<dyn ThumbnailReader>,
        memory: MemoryCacheHandle,
        disk: Option<DiskStoreHandle>,
        settings: CoordinatorSettings,
    ) -> CoordinatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            reader,
            memory: memory.clone(),
            disk,
            settings,
            queue: VecDeque::new(),
            in_flight: None,
            next_step: None,
        };
        tokio::spawn(coordinator.run(rx));

        CoordinatorHandle { tx, memory }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        loop {
            let next_step = self.next_step;
            let busy = self.in_flight.is_some();
            tokio::select! {
                request = rx.recv() => match request {
                    Some(Request::Shutdown(reply)) => {
                        self.drain();
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle(request),
                    None => {
                        self.drain();
                        break;
                    }
                },
                result = join_in_flight(&mut self.in_flight), if busy => self.finish(result),
                _ = tokio::time::sleep_until(next_step.unwrap_or_else(Instant::now)), if next_step.is_some() => {
                    self.next_step = None;
                    self.start_next();
                }
            }
        }
        debug!("thumbnail coordinator stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Enqueue(request) => self.enqueue(request),
            Request::Cancel(job_id, reply) => {
                let mut cancelled = false;
                for request in self.queue.iter_mut() {
                    let (dropped, kept): (Vec<Waiter>, Vec<Waiter>) = request
                        .waiters
                        .drain(..)
                        .partition(|waiter| waiter.job_id == job_id);
                    request.waiters = kept;
                    for waiter in dropped {
                        debug!(job = %job_id, key = %request.key, "thumbnail request cancelled");
                        let _ = waiter.reply.send(Err(ThumbnailError::Cancelled));
                        cancelled = true;
                    }
                }
                self.queue.retain(|request| !request.waiters.is_empty());
                let _ = reply.send(cancelled);
            }
            Request::QueueLen(reply) => {
                let _ = reply.send(self.queue.len());
            }
            Request::Settings(reply) => {
                let _ = reply.send(self.settings.clone());
            }
            Request::SetThumbnailSize(size, reply) => {
                self.settings.thumbnail_size = size;
                let _ = reply.send(());
            }
            Request::SetDiskMaxSize(max_size, reply) => {
                self.settings.disk_max_size = max_size;
                let _ = reply.send(());
            }
            Request::SetDiskMaxCount(max_count, reply) => {
                self.settings.disk_max_count = max_count;
                let _ = reply.send(());
            }
            Request::SetGenerationTimeout(timeout, reply) => {
                self.settings.generation_timeout = timeout;
                let _ = reply.send(());
            }
            // Intercepted by the run loop
            Request::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn enqueue(&mut self, mut request: PendingRequest) {
        if let Some(in_flight) = self
            .in_flight
            .as_mut()
            .filter(|in_flight| {
                in_flight.key == request.key && in_flight.allow_disk_cache == request.allow_disk_cache
            })
        {
            debug!(key = %request.key, "thumbnail request joined the one in flight");
            in_flight.waiters.append(&mut request.waiters);
            return;
        }
        if let Some(queued) = self
            .queue
            .iter_mut()
            .find(|queued| queued.merges_with(request.key, request.allow_disk_cache))
        {
            debug!(key = %request.key, waiters = queued.waiters.len() + 1, "thumbnail request merged");
            queued.waiters.append(&mut request.waiters);
            return;
        }

        debug!(
            frame = %request.frame,
            size = request.size,
            queued = self.queue.len(),
            "thumbnail request queued"
        );
        self.queue.push_back(request);
        if self.in_flight.is_none() && self.next_step.is_none() {
            self.start_next();
        }
    }

    fn start_next(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(request) = self.queue.pop_front() else {
            return;
        };

        let write_to_disk = request.allow_disk_cache
            && self.settings.disk_max_size > 0
            && self.settings.disk_max_count > 0;
        let step = Step {
            reader: Arc::clone(&self.reader),
            memory: self.memory.clone(),
            disk: self.disk.clone(),
            frame: request.frame,
            size: request.size,
            key: request.key,
            write_to_disk,
            timeout: self.settings.generation_timeout,
        };

        trace!(key = %request.key, waiters = request.waiters.len(), "servicing thumbnail request");
        self.in_flight = Some(InFlight {
            key: request.key,
            allow_disk_cache: request.allow_disk_cache,
            waiters: request.waiters,
            task: tokio::spawn(step.run()),
        });
    }

    fn finish(&mut self, result: Result<Arc<ThumbnailBuffer>>) {
        if let Some(in_flight) = self.in_flight.take() {
            match &result {
                Err(e) if e.is_cancelled() => {
                    debug!(key = %in_flight.key, error = %e, "thumbnail request abandoned")
                }
                Err(e) => warn!(key = %in_flight.key, error = %e, "thumbnail request failed"),
                Ok(_) => {}
            }
            deliver(in_flight.waiters, result);
        }
        if !self.queue.is_empty() {
            self.next_step = Some(Instant::now() + self.settings.queue_step_delay);
        }
    }

    fn drain(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.task.abort();
            deliver(in_flight.waiters, Err(ThumbnailError::ShuttingDown));
        }
        if !self.queue.is_empty() {
            debug!(pending = self.queue.len(), "failing queued thumbnail requests");
        }
        for request in self.queue.drain(..) {
            deliver(request.waiters, Err(ThumbnailError::ShuttingDown));
        }
        self.next_step = None;
    }
}

/// Hand one result to every waiter of an entry
fn deliver(mut waiters: Vec<Waiter>, result: Result<Arc<ThumbnailBuffer>>) {
    let last = waiters.pop();
    for waiter in waiters {
        let shared = result
            .as_ref()
            .map(Arc::clone)
            .map_err(ThumbnailError::duplicate);
        let _ = waiter.reply.send(shared);
    }
    if let Some(waiter) = last {
        let _ = waiter.reply.send(result);
    }
}

async fn join_in_flight(slot: &mut Option<InFlight>) -> Result<Arc<ThumbnailBuffer>> {
    match slot {
        Some(in_flight) => match (&mut in_flight.task).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ThumbnailError::Cancelled),
            Err(e) => Err(ThumbnailError::Generation(anyhow::anyhow!(
                "thumbnail task failed: {}",
                e
            ))),
        },
        None => std::future::pending().await,
    }
}

/// Everything one serviced request needs, detached from the coordinator
struct Step {
    reader: Arc<dyn ThumbnailReader>,
    memory: MemoryCacheHandle,
    disk: Option<DiskStoreHandle>,
    frame: FrameId,
    size: u32,
    key: ThumbnailKey,
    write_to_disk: bool,
    timeout: Option<Duration>,
}

impl Step {
    async fn run(self) -> Result<Arc<ThumbnailBuffer>> {
        let key = self.key;

        // An earlier request in the queue may have produced it
        if let Some(buffer) = self.memory.retrieve(key).await {
            return Ok(buffer);
        }

        if let Some(disk) = &self.disk {
            if disk.has(key).await {
                match disk.read(key).await {
                    Ok(buffer) => {
                        trace!(%key, "disk hit");
                        self.memory.store(key, Arc::clone(&buffer)).await;
                        return Ok(buffer);
                    }
                    Err(e) if e.is_cancelled() => {
                        debug!(%key, error = %e, "disk read abandoned, regenerating")
                    }
                    Err(e) => warn!(%key, error = %e, "disk read failed, regenerating"),
                }
            }
        }

        let buffer = Arc::new(self.generate().await?);

        if self.write_to_disk {
            if let Some(disk) = &self.disk {
                match disk.write(key, Arc::clone(&buffer)).await {
                    Ok(_) => {}
                    Err(ThumbnailError::Unavailable(reason)) => {
                        trace!(%key, reason, "disk tier unavailable, not persisting")
                    }
                    Err(e) if e.is_cancelled() => debug!(%key, error = %e, "disk write abandoned"),
                    Err(e) => warn!(%key, error = %e, "failed to persist thumbnail"),
                }
            }
        }

        self.memory.store(key, Arc::clone(&buffer)).await;
        Ok(buffer)
    }

    async fn generate(&self) -> Result<ThumbnailBuffer> {
        debug!(frame = %self.frame, size = self.size, "generating thumbnail");
        let generate = self.reader.generate_thumbnail(&self.frame, self.size);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, generate)
                .await
                .map_err(|_| ThumbnailError::Timeout(limit))?,
            None => generate.await,
        };
        result.map_err(ThumbnailError::Generation)
    }
}
