//! Top-level thumbnail service
//!
//! Wires the memory tier, disk tier and coordinator together and exposes the
//! configuration surface the host application drives: budgets, cache path,
//! default thumbnail size, clearing and bulk eviction.

use crate::config::ThumbnailConfig;
use crate::coordinator::{CoordinatorHandle, ThumbnailCoordinator};
use crate::disk::{DiskStoreHandle, DiskThumbnailStore};
use crate::error::Result;
use crate::key::ThumbnailKey;
use crate::memory::{MemoryCacheHandle, MemoryCacheStat, MemoryThumbnailCache};
use crate::reader::ThumbnailReader;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Point-in-time usage of both tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_size: usize,
    pub memory_count: usize,
    pub memory_max_size: usize,
    pub memory_max_count: usize,
    pub disk_size: usize,
    pub disk_count: usize,
    pub disk_max_size: usize,
    pub disk_max_count: usize,
}

impl CacheStats {
    pub fn memory_usage_percent(&self) -> f64 {
        percent(self.memory_size, self.memory_max_size)
    }

    pub fn disk_usage_percent(&self) -> f64 {
        percent(self.disk_size, self.disk_max_size)
    }
}

fn percent(used: usize, budget: usize) -> f64 {
    if budget == 0 {
        return 0.0;
    }
    (used as f64 / budget as f64) * 100.0
}

pub struct ThumbnailService {
    config: ThumbnailConfig,
    memory: MemoryCacheHandle,
    disk: DiskStoreHandle,
    coordinator: CoordinatorHandle,
}

impl ThumbnailService {
    /// Spawn all tiers and the coordinator
    ///
    /// The disk tier is configured and scanned before this returns when the
    /// config names a cache path.
    pub async fn start(config: ThumbnailConfig, reader: Arc<dyn ThumbnailReader>) -> Result<Self> {
        let memory = MemoryThumbnailCache::spawn(
            config.memory_max_size,
            config.memory_max_count,
            config.notify_delay(),
        );

        let disk = DiskThumbnailStore::spawn(
            config.worker_count,
            config.disk_max_size,
            config.disk_max_count,
        )?;
        disk.set_quality(config.jpeg_quality).await;
        if let Some(path) = &config.disk_cache_path {
            disk.configure(path).await?;
        }

        let coordinator = ThumbnailCoordinator::spawn(
            reader,
            memory.clone(),
            Some(disk.clone()),
            config.coordinator_settings(),
        );

        info!(
            disk_cache = ?config.disk_cache_path,
            thumbnail_size = config.thumbnail_size,
            "thumbnail service started"
        );

        Ok(Self {
            config,
            memory,
            disk,
            coordinator,
        })
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    pub fn memory(&self) -> &MemoryCacheHandle {
        &self.memory
    }

    pub fn disk(&self) -> &DiskStoreHandle {
        &self.disk
    }

    pub fn config(&self) -> &ThumbnailConfig {
        &self.config
    }

    pub fn memory_max_size(&self) -> usize {
        self.config.memory_max_size
    }

    pub fn memory_max_count(&self) -> usize {
        self.config.memory_max_count
    }

    pub fn disk_max_size(&self) -> usize {
        self.config.disk_max_size
    }

    pub fn disk_max_count(&self) -> usize {
        self.config.disk_max_count
    }

    pub fn disk_cache_path(&self) -> Option<&Path> {
        self.config.disk_cache_path.as_deref()
    }

    pub fn thumbnail_size(&self) -> u32 {
        self.config.thumbnail_size
    }

    pub async fn set_memory_max_size(&mut self, max_size: usize) {
        self.memory.set_max_size(max_size).await;
        self.config.memory_max_size = max_size;
    }

    pub async fn set_memory_max_count(&mut self, max_count: usize) {
        self.memory.set_max_count(max_count).await;
        self.config.memory_max_count = max_count;
    }

    /// Returns the keys evicted from disk to meet the new budget
    pub async fn set_disk_max_size(&mut self, max_size: usize) -> Result<Vec<ThumbnailKey>> {
        self.coordinator.set_disk_max_size(max_size).await;
        self.config.disk_max_size = max_size;
        self.disk.set_max_size(max_size).await
    }

    /// Returns the keys evicted from disk to meet the new budget
    pub async fn set_disk_max_count(&mut self, max_count: usize) -> Result<Vec<ThumbnailKey>> {
        self.coordinator.set_disk_max_count(max_count).await;
        self.config.disk_max_count = max_count;
        self.disk.set_max_count(max_count).await
    }

    /// Move the disk tier to `path` and rescan it
    pub async fn set_disk_cache_path(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.disk.configure(&path).await?;
        self.config.disk_cache_path = Some(path);
        Ok(())
    }

    pub async fn set_thumbnail_size(&mut self, size: u32) {
        self.coordinator.set_thumbnail_size(size).await;
        self.config.thumbnail_size = size;
    }

    /// Push the differences between `config` and the active configuration
    ///
    /// Worker count and the notify/queue delays are fixed at start.
    pub async fn apply_config(&mut self, config: &ThumbnailConfig) -> Result<()> {
        if config.memory_max_size != self.config.memory_max_size {
            self.set_memory_max_size(config.memory_max_size).await;
        }
        if config.memory_max_count != self.config.memory_max_count {
            self.set_memory_max_count(config.memory_max_count).await;
        }
        if config.disk_cache_path != self.config.disk_cache_path {
            match &config.disk_cache_path {
                Some(path) => self.set_disk_cache_path(path).await?,
                None => debug!("disk cache path unset; keeping the current directory"),
            }
        }
        if config.disk_max_size != self.config.disk_max_size {
            self.set_disk_max_size(config.disk_max_size).await?;
        }
        if config.disk_max_count != self.config.disk_max_count {
            self.set_disk_max_count(config.disk_max_count).await?;
        }
        if config.thumbnail_size != self.config.thumbnail_size {
            self.set_thumbnail_size(config.thumbnail_size).await;
        }
        if config.jpeg_quality != self.config.jpeg_quality {
            self.disk.set_quality(config.jpeg_quality).await;
            self.config.jpeg_quality = config.jpeg_quality;
        }
        if config.generation_timeout_ms != self.config.generation_timeout_ms {
            self.coordinator
                .set_generation_timeout(config.generation_timeout())
                .await;
            self.config.generation_timeout_ms = config.generation_timeout_ms;
        }
        if config.worker_count != self.config.worker_count
            || config.notify_delay_ms != self.config.notify_delay_ms
            || config.queue_step_delay_ms != self.config.queue_step_delay_ms
        {
            debug!("worker count and delays take effect on restart");
        }
        Ok(())
    }

    /// Empty the selected tiers
    pub async fn clear(&self, memory: bool, disk: bool) -> Result<()> {
        if memory {
            self.memory.clear().await;
        }
        if disk && self.config.disk_cache_path.is_some() {
            let removed = self.disk.clear().await?;
            info!(removed = removed.len(), "disk thumbnail cache cleared");
        }
        Ok(())
    }

    /// Drop `keys` from both tiers
    pub async fn evict(&self, keys: &[ThumbnailKey]) -> Result<()> {
        let erased = self.memory.erase_many(keys.to_vec()).await;
        let removed = if self.config.disk_cache_path.is_some() {
            self.disk.remove(keys.to_vec()).await?
        } else {
            Vec::new()
        };
        debug!(
            requested = keys.len(),
            memory = erased.len(),
            disk = removed.len(),
            "evicted thumbnails"
        );
        Ok(())
    }

    pub async fn stats(&self) -> CacheStats {
        let MemoryCacheStat {
            size,
            count,
            max_size,
            max_count,
        } = self.memory.stats().await;
        let disk = self.disk.stats().await;

        CacheStats {
            memory_size: size,
            memory_count: count,
            memory_max_size: max_size,
            memory_max_count: max_count,
            disk_size: disk.size,
            disk_count: disk.count,
            disk_max_size: self.config.disk_max_size,
            disk_max_count: self.config.disk_max_count,
        }
    }

    /// Stop the coordinator first so no new work reaches the tiers
    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
        self.disk.shutdown().await;
        self.memory.shutdown().await;
        info!("thumbnail service stopped");
    }
}
