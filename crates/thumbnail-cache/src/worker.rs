//! Fixed-size pool of blocking I/O workers
//!
//! Every filesystem and codec call made on behalf of the disk tier runs on one
//! of these threads, picked round-robin. Workers are interchangeable and keep
//! no cache state; each processes its own queue one job at a time.

use crate::buffer::ThumbnailBuffer;
use crate::codec::{decode_jpeg, encode_jpeg};
use crate::disk_stat::{DiskCacheStat, TEMP_SUFFIX};
use crate::error::{Result, ThumbnailError};
use crate::key::ThumbnailKey;
use filetime::{set_file_mtime, FileTime};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Reply of a dispatched job; resolve with [`Pending::wait`]
pub struct Pending<T>(oneshot::Receiver<Result<T>>);

impl<T> Pending<T> {
    pub async fn wait(self) -> Result<T> {
        self.0
            .await
            .unwrap_or(Err(ThumbnailError::Unavailable("disk worker pool stopped")))
    }
}

enum Job {
    Read {
        path: PathBuf,
        reply: oneshot::Sender<Result<(ThumbnailBuffer, SystemTime)>>,
    },
    Write {
        path: PathBuf,
        buffer: Arc<ThumbnailBuffer>,
        quality: u8,
        reply: oneshot::Sender<Result<usize>>,
    },
    Remove {
        files: Vec<(ThumbnailKey, PathBuf)>,
        reply: oneshot::Sender<Result<Vec<ThumbnailKey>>>,
    },
    Scan {
        root: PathBuf,
        reply: oneshot::Sender<Result<DiskCacheStat>>,
    },
    Encode {
        buffer: Arc<ThumbnailBuffer>,
        quality: u8,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Decode {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<ThumbnailBuffer>>,
    },
}

pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Job>>,
    next: AtomicUsize,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = mpsc::channel();
            let handle = thread::Builder::new()
                .name(format!("thumb-io-{}", index))
                .spawn(move || run_worker(rx))
                .map_err(|e| ThumbnailError::Config(format!("cannot spawn disk worker: {}", e)))?;
            senders.push(tx);
            handles.push(handle);
        }

        debug!(workers, "disk worker pool started");
        Ok(Self {
            senders,
            next: AtomicUsize::new(0),
            handles,
        })
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Read and decode a cached thumbnail, bumping its mtime on success
    pub fn read(&self, path: PathBuf) -> Pending<(ThumbnailBuffer, SystemTime)> {
        self.dispatch(|reply| Job::Read { path, reply })
    }

    /// Encode and persist a thumbnail, returning the bytes written
    pub fn write(&self, path: PathBuf, buffer: Arc<ThumbnailBuffer>, quality: u8) -> Pending<usize> {
        self.dispatch(|reply| Job::Write {
            path,
            buffer,
            quality,
            reply,
        })
    }

    /// Delete files, returning the keys whose deletion failed
    pub fn remove(&self, files: Vec<(ThumbnailKey, PathBuf)>) -> Pending<Vec<ThumbnailKey>> {
        self.dispatch(|reply| Job::Remove { files, reply })
    }

    /// Create `root` if needed and index its contents
    pub fn scan(&self, root: PathBuf) -> Pending<DiskCacheStat> {
        self.dispatch(|reply| Job::Scan { root, reply })
    }

    pub fn encode(&self, buffer: Arc<ThumbnailBuffer>, quality: u8) -> Pending<Vec<u8>> {
        self.dispatch(|reply| Job::Encode {
            buffer,
            quality,
            reply,
        })
    }

    pub fn decode(&self, bytes: Vec<u8>) -> Pending<ThumbnailBuffer> {
        self.dispatch(|reply| Job::Decode { bytes, reply })
    }

    fn next_slot(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len()
    }

    fn dispatch<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Job) -> Pending<T> {
        let (reply, rx) = oneshot::channel();
        let slot = self.next_slot();
        // A dead worker drops the job, and with it the reply sender, which
        // surfaces to the waiter as a stopped pool.
        let _ = self.senders[slot].send(make(reply));
        Pending(rx)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.join() {
                warn!("disk worker panicked: {:?}", e);
            }
        }
    }
}

fn run_worker(rx: mpsc::Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Read { path, reply } => {
                let _ = reply.send(read_thumbnail(&path));
            }
            Job::Write {
                path,
                buffer,
                quality,
                reply,
            } => {
                let _ = reply.send(write_thumbnail(&path, &buffer, quality));
            }
            Job::Remove { files, reply } => {
                let _ = reply.send(Ok(remove_thumbnails(files)));
            }
            Job::Scan { root, reply } => {
                let _ = reply.send(prepare_and_scan(&root));
            }
            Job::Encode {
                buffer,
                quality,
                reply,
            } => {
                let _ = reply.send(
                    encode_jpeg(&buffer, quality)
                        .map_err(|e| ThumbnailError::Codec(format!("{:#}", e))),
                );
            }
            Job::Decode { bytes, reply } => {
                let _ = reply.send(
                    decode_jpeg(&bytes).map_err(|e| ThumbnailError::Codec(format!("{:#}", e))),
                );
            }
        }
    }
}

fn read_thumbnail(path: &Path) -> Result<(ThumbnailBuffer, SystemTime)> {
    let bytes = fs::read(path).map_err(|e| ThumbnailError::io(path, e))?;
    let buffer = decode_jpeg(&bytes)
        .map_err(|e| ThumbnailError::Codec(format!("{}: {:#}", path.display(), e)))?;

    let now = SystemTime::now();
    set_file_mtime(path, FileTime::from_system_time(now)).map_err(|e| ThumbnailError::io(path, e))?;
    Ok((buffer, now))
}

fn write_thumbnail(path: &Path, buffer: &ThumbnailBuffer, quality: u8) -> Result<usize> {
    let bytes = encode_jpeg(buffer, quality)
        .map_err(|e| ThumbnailError::Codec(format!("{}: {:#}", path.display(), e)))?;

    let parent = path
        .parent()
        .ok_or(ThumbnailError::Unavailable("thumbnail path has no parent directory"))?;
    fs::create_dir_all(parent).map_err(|e| ThumbnailError::io(parent, e))?;

    // Write beside the target and rename into place, so readers never see a
    // partial file under the real name.
    let mut temp = tempfile::Builder::new()
        .prefix(".")
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)
        .map_err(|e| ThumbnailError::io(parent, e))?;
    temp.write_all(&bytes)
        .map_err(|e| ThumbnailError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| ThumbnailError::io(path, e.error))?;

    Ok(bytes.len())
}

fn prepare_and_scan(root: &Path) -> Result<DiskCacheStat> {
    fs::create_dir_all(root).map_err(|e| {
        ThumbnailError::Config(format!(
            "cannot create disk cache directory {}: {}",
            root.display(),
            e
        ))
    })?;
    DiskCacheStat::scan(root)
}

fn remove_thumbnails(files: Vec<(ThumbnailKey, PathBuf)>) -> Vec<ThumbnailKey> {
    let mut failed = Vec::new();
    for (key, path) in files {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(%key, path = %path.display(), error = %e, "failed to delete cached thumbnail");
                failed.push(key);
            }
        }
    }
    failed
}
