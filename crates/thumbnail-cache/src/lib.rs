//! Two-tier thumbnail caching and generation
//!
//! Thumbnails are looked up in a bounded in-memory LRU first, then in a
//! persistent disk cache, and only generated by an external reader when both
//! miss. Generation requests are queued and serviced strictly one at a time so
//! an expensive reader is never flooded; queued requests can be cancelled.
//!
//! # Features
//!
//! - **Bounded memory tier**: byte and entry budgets with least-recently-used eviction
//! - **Change notifications**: coalesced, debounced store/erase events from the memory tier
//! - **Disk tier**: fan-out JPEG store with mtime recency, atomic writes and startup rescan
//! - **Off-runtime I/O**: all file and codec work runs on a fixed round-robin worker pool
//! - **Serialized generation**: FIFO queue with cancellation, timeouts and clean shutdown
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use thumbnail_cache::{FrameId, ImageFileReader, JobId, ThumbnailConfig, ThumbnailService};
//!
//! # async fn run() -> thumbnail_cache::Result<()> {
//! let service = ThumbnailService::start(ThumbnailConfig::default(), Arc::new(ImageFileReader)).await?;
//! let thumb = service
//!     .coordinator()
//!     .get_thumbnail(FrameId::new("/shots/plate.png", 0), 256, 0, true, JobId::next())
//!     .await?;
//! println!("{}x{}", thumb.width(), thumb.height());
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod disk;
pub mod disk_stat;
pub mod error;
pub mod key;
pub mod lru;
pub mod memory;
pub mod reader;
pub mod service;
pub mod worker;

pub use buffer::{ByteSize, ThumbnailBuffer};
pub use config::ThumbnailConfig;
pub use coordinator::{CoordinatorHandle, CoordinatorSettings, ThumbnailCoordinator};
pub use disk::{DiskStoreHandle, DiskThumbnailStore};
pub use disk_stat::DiskCacheStat;
pub use error::{Result, ThumbnailError};
pub use key::{file_freshness_hash, FrameId, JobId, ThumbnailKey};
pub use crate::lru::BoundedRecencyCache;
pub use memory::{CacheChange, MemoryCacheHandle, MemoryCacheStat, MemoryThumbnailCache};
pub use reader::{ImageFileReader, ThumbnailReader};
pub use service::{CacheStats, ThumbnailService};
pub use worker::WorkerPool;
