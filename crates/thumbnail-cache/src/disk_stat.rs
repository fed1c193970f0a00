//! On-disk layout and the in-memory index of the disk tier
//!
//! Thumbnails live at `<root>/<first hex digit>/<key hex>.jpg`. The index is
//! never persisted; it is rebuilt by scanning the tree and then kept current
//! incrementally by the disk store.

use crate::error::{Result, ThumbnailError};
use crate::key::ThumbnailKey;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

pub const THUMBNAIL_EXTENSION: &str = "jpg";
pub const TEMP_SUFFIX: &str = ".tmp";

/// Temp files younger than this may belong to a write still in progress
const STALE_TEMP_AGE: Duration = Duration::from_secs(5 * 60);

/// Path of the cached file for `key` under `root`
pub fn thumbnail_path(root: &Path, key: ThumbnailKey) -> PathBuf {
    let hex = key.to_hex();
    root.join(&hex[..1])
        .join(format!("{}.{}", hex, THUMBNAIL_EXTENSION))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskEntry {
    pub size: usize,
    pub mtime: SystemTime,
}

/// Aggregate size, count and per-key recency of the disk tier
#[derive(Debug, Clone, Default)]
pub struct DiskCacheStat {
    pub size: usize,
    pub count: usize,
    pub entries: HashMap<ThumbnailKey, DiskEntry>,
}

impl DiskCacheStat {
    /// Build a fresh index by walking `root`
    ///
    /// Stale temp files from interrupted writes are deleted on the way;
    /// anything that does not look like a cached thumbnail is ignored.
    pub fn scan(root: &Path) -> Result<Self> {
        let mut stat = Self::default();
        let mut pending = vec![root.to_path_buf()];
        let now = SystemTime::now();

        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if dir == root => return Err(ThumbnailError::io(dir, e)),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping unreadable cache directory");
                    continue;
                }
            };

            for entry in entries.flatten() {
                let path = entry.path();
                let metadata = match entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cannot stat cache entry");
                        continue;
                    }
                };

                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !metadata.is_file() {
                    continue;
                }

                let mtime = metadata.modified().unwrap_or(now);
                if is_temp_file(&path) {
                    let age = now.duration_since(mtime).unwrap_or_default();
                    if age >= STALE_TEMP_AGE {
                        debug!(path = %path.display(), "removing stale temp file");
                        if let Err(e) = fs::remove_file(&path) {
                            warn!(path = %path.display(), error = %e, "cannot remove stale temp file");
                        }
                    }
                    continue;
                }

                match key_for_path(&path) {
                    Some(key) => stat.add(key, metadata.len() as usize, mtime),
                    None => debug!(path = %path.display(), "ignoring foreign file in cache"),
                }
            }
        }

        Ok(stat)
    }

    /// Record a file, replacing any existing entry for the key
    pub fn add(&mut self, key: ThumbnailKey, size: usize, mtime: SystemTime) {
        self.remove(key);
        self.entries.insert(key, DiskEntry { size, mtime });
        self.size += size;
        self.count += 1;
    }

    pub fn remove(&mut self, key: ThumbnailKey) -> Option<DiskEntry> {
        let entry = self.entries.remove(&key)?;
        self.size -= entry.size;
        self.count -= 1;
        Some(entry)
    }

    /// Update the recency timestamp of a known key
    pub fn touch(&mut self, key: ThumbnailKey, mtime: SystemTime) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.mtime = mtime;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: ThumbnailKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Drop the oldest entries until within both limits
    ///
    /// Victims are chosen by ascending mtime, ties broken by key. The removed
    /// entries are returned so their files can be deleted.
    pub fn evict(&mut self, max_size: usize, max_count: usize) -> Vec<(ThumbnailKey, DiskEntry)> {
        if self.size <= max_size && self.count <= max_count {
            return Vec::new();
        }

        let mut by_age: Vec<(SystemTime, ThumbnailKey)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.mtime, *key))
            .collect();
        by_age.sort_unstable();

        let mut evicted = Vec::new();
        for (_, key) in by_age {
            if self.size <= max_size && self.count <= max_count {
                break;
            }
            if let Some(entry) = self.remove(key) {
                evicted.push((key, entry));
            }
        }
        evicted
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| name.ends_with(TEMP_SUFFIX))
}

fn key_for_path(path: &Path) -> Option<ThumbnailKey> {
    if path.extension()?.to_str()? != THUMBNAIL_EXTENSION {
        return None;
    }
    ThumbnailKey::from_hex(path.file_stem()?.to_str()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::tempdir;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn write_thumb(root: &Path, key: ThumbnailKey, len: usize) -> PathBuf {
        let path = thumbnail_path(root, key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![7u8; len]).unwrap();
        path
    }

    #[test]
    fn test_thumbnail_path_fans_out_on_first_digit() {
        let key = ThumbnailKey::from_raw(0xabcdef0123456789);
        let path = thumbnail_path(Path::new("/cache"), key);
        assert_eq!(path, PathBuf::from("/cache/a/abcdef0123456789.jpg"));
        assert_eq!(key_for_path(&path), Some(key));
    }

    #[test]
    fn test_add_replaces_existing_entry() {
        let mut stat = DiskCacheStat::default();
        let key = ThumbnailKey::from_raw(1);

        stat.add(key, 100, at(1));
        stat.add(key, 40, at(2));

        assert_eq!(stat.count, 1);
        assert_eq!(stat.size, 40);
        assert_eq!(stat.entries[&key].mtime, at(2));
    }

    #[test]
    fn test_evict_removes_oldest_first() {
        let mut stat = DiskCacheStat::default();
        let (a, b, c) = (
            ThumbnailKey::from_raw(1),
            ThumbnailKey::from_raw(2),
            ThumbnailKey::from_raw(3),
        );
        stat.add(a, 10, at(20));
        stat.add(b, 10, at(10));
        stat.add(c, 10, at(30));

        let evicted = stat.evict(usize::MAX, 2);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, b);
        assert!(stat.contains(a) && stat.contains(c));

        // Now the size limit: a is older than c
        let evicted = stat.evict(15, usize::MAX);
        assert_eq!(evicted.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![a]);
        assert_eq!((stat.size, stat.count), (10, 1));
    }

    #[test]
    fn test_evict_ties_break_by_key() {
        let mut stat = DiskCacheStat::default();
        for raw in [5, 3, 9] {
            stat.add(ThumbnailKey::from_raw(raw), 1, at(0));
        }

        let evicted: Vec<_> = stat.evict(0, 0).into_iter().map(|(k, _)| k.raw()).collect();
        assert_eq!(evicted, vec![3, 5, 9]);
        assert_eq!((stat.size, stat.count), (0, 0));
    }

    #[test]
    fn test_touch_updates_known_keys_only() {
        let mut stat = DiskCacheStat::default();
        let key = ThumbnailKey::from_raw(4);
        stat.add(key, 1, at(0));

        assert!(stat.touch(key, at(5)));
        assert!(!stat.touch(ThumbnailKey::from_raw(5), at(5)));
        assert_eq!(stat.entries[&key].mtime, at(5));
    }

    #[test]
    fn test_scan_matches_files_on_disk() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        let keys = [
            ThumbnailKey::named("one", 256),
            ThumbnailKey::named("two", 256),
            ThumbnailKey::named("three", 128),
        ];
        let mut expected = 0;
        for (i, key) in keys.iter().enumerate() {
            let len = 100 * (i + 1);
            let path = write_thumb(root, *key, len);
            set_file_mtime(&path, FileTime::from_system_time(at(i as u64))).unwrap();
            expected += len;
        }
        fs::write(root.join("README.txt"), b"not a thumbnail").unwrap();

        let stat = DiskCacheStat::scan(root).unwrap();
        assert_eq!(stat.count, 3);
        assert_eq!(stat.size, expected);
        assert_eq!(stat.entries[&keys[2]].mtime, at(2));
    }

    #[test]
    fn test_scan_removes_only_stale_temp_files() {
        let dir = tempdir().unwrap();
        let shard = dir.path().join("f");
        fs::create_dir_all(&shard).unwrap();

        let stale = shard.join(".tmpabc.tmp");
        let fresh = shard.join(".tmpdef.tmp");
        fs::write(&stale, b"partial").unwrap();
        fs::write(&fresh, b"partial").unwrap();
        set_file_mtime(&stale, FileTime::from_system_time(at(0))).unwrap();

        let stat = DiskCacheStat::scan(dir.path()).unwrap();
        assert_eq!(stat.count, 0);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_scan_missing_root_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            DiskCacheStat::scan(&missing),
            Err(ThumbnailError::Io { .. })
        ));
    }
}
