//! Persistent travel-time cache.
//!
//! The file is a JSON object keyed by `mode|origin|slug`. It is read once
//! when opened and rewritten atomically on [`DistanceCache::flush`]. A
//! missing file is an empty cache. An unreadable one degrades the cache to
//! memory only for the rest of the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Result, ScoutError};
use crate::models::{TravelMode, TravelTime};

/// Canonical form of an address for cache lookups.
///
/// Lower-cased, comma-separated parts trimmed, inner whitespace collapsed.
pub fn normalize_address(address: &str) -> String {
    address
        .split(',')
        .map(|part| part.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub origin: String,
    pub slug: String,
    pub mode: TravelMode,
}

/// Joins the parts of an encoded key. Slugs may not contain it.
pub const KEY_SEPARATOR: char = '|';

impl CacheKey {
    pub fn new(origin_address: &str, slug: &str, mode: TravelMode) -> Self {
        Self {
            origin: normalize_address(origin_address),
            slug: slug.to_string(),
            mode,
        }
    }

    fn encode(&self) -> String {
        let sep = KEY_SEPARATOR;
        format!("{}{sep}{}{sep}{}", self.mode, self.origin, self.slug)
    }

    fn decode(raw: &str) -> Option<Self> {
        let (mode, rest) = raw.split_once(KEY_SEPARATOR)?;
        let (origin, slug) = rest.rsplit_once(KEY_SEPARATOR)?;
        let mode = match mode {
            "transit" => TravelMode::Transit,
            "driving" => TravelMode::Driving,
            _ => return None,
        };
        Some(Self {
            origin: origin.to_string(),
            slug: slug.to_string(),
            mode,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: TravelTime,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct DistanceCache {
    /// `None` once the cache is memory only
    path: Option<PathBuf>,
    entries: BTreeMap<CacheKey, CacheEntry>,
    dirty: bool,
    warning: Option<ScoutError>,
}

impl DistanceCache {
    /// Cache that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the cache file at `path`. Never fails: problems are logged and
    /// kept in [`warning`](Self::warning).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No distance cache yet, starting empty");
                return Self {
                    path: Some(path),
                    ..Self::default()
                };
            }
            Err(e) => return Self::degraded(ScoutError::cache_io(&path, e)),
        };

        let raw: BTreeMap<String, CacheEntry> = match serde_json::from_str(&text) {
            Ok(raw) => raw,
            Err(e) => return Self::degraded(ScoutError::cache_io(&path, e)),
        };

        let mut entries = BTreeMap::new();
        for (key, entry) in raw {
            match CacheKey::decode(&key) {
                Some(key) => {
                    entries.insert(key, entry);
                }
                None => warn!(key = %key, "Ignoring malformed distance cache key"),
            }
        }
        info!(path = %path.display(), cached_routes = entries.len(), "Loaded distance cache");

        Self {
            path: Some(path),
            entries,
            dirty: false,
            warning: None,
        }
    }

    fn degraded(error: ScoutError) -> Self {
        warn!(%error, "Distance cache unavailable, continuing in memory only");
        Self {
            warning: Some(error),
            ..Self::default()
        }
    }

    /// Why the cache fell back to memory only, if it did.
    pub fn warning(&self) -> Option<&ScoutError> {
        self.warning.as_ref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Record a resolved value. An existing entry is left untouched until
    /// it is evicted. Returns whether the value was stored.
    pub fn insert(&mut self, key: CacheKey, value: TravelTime) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                cached_at: Utc::now(),
            },
        );
        self.dirty = true;
        true
    }

    pub fn evict(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        self.dirty |= removed.is_some();
        removed
    }

    /// Write pending changes to disk through a temp file and a rename.
    ///
    /// On failure the entries stay in memory and the cache stops trying to
    /// persist for the rest of the run.
    pub fn flush(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        match self.write_to(&path) {
            Ok(()) => {
                self.dirty = false;
                debug!(path = %path.display(), cached_routes = self.entries.len(), "Saved distance cache");
                Ok(())
            }
            Err(e) => {
                let error = ScoutError::cache_io(&path, e);
                warn!(%error, "Failed to save distance cache, continuing in memory only");
                self.path = None;
                self.warning = Some(ScoutError::cache_io(&path, "save failed"));
                Err(error)
            }
        }
    }

    fn write_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let raw: BTreeMap<String, &CacheEntry> = self.entries.iter().map(|(k, v)| (k.encode(), v)).collect();
        let json = serde_json::to_string_pretty(&raw)?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address("  12  Smith St ,Chatswood NSW   2067 "),
            "12 smith st, chatswood nsw 2067"
        );
        assert_eq!(normalize_address("12 Smith St, , Chatswood"), "12 smith st, chatswood");
    }

    #[test]
    fn test_key_ignores_address_formatting() {
        let a = CacheKey::new("12 Smith St, Chatswood", "qvb", TravelMode::Transit);
        let b = CacheKey::new("12 SMITH ST,  Chatswood ", "qvb", TravelMode::Transit);
        assert_eq!(a, b);
        assert_ne!(a, CacheKey::new("12 Smith St, Chatswood", "qvb", TravelMode::Driving));
    }

    #[test]
    fn test_key_encoding_survives_pipes_in_origin() {
        let key = CacheKey::new("Unit 3|4 Smith St", "rnsh", TravelMode::Driving);
        assert_eq!(CacheKey::decode(&key.encode()), Some(key));
        assert_eq!(CacheKey::decode("walking|x|y"), None);
    }

    #[test]
    fn test_missing_file_is_empty_cache() {
        let dir = tempdir().unwrap();
        let cache = DistanceCache::open(dir.path().join("distance_cache.json"));
        assert!(cache.is_empty());
        assert!(cache.warning().is_none());
        assert!(cache.path().is_some());
    }

    #[test]
    fn test_roundtrip_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache").join("distance_cache.json");
        let key = CacheKey::new("1 Smith St, Chatswood", "qvb", TravelMode::Transit);
        let far = CacheKey::new("1 Smith St, Chatswood", "bella_vista", TravelMode::Driving);

        let mut cache = DistanceCache::open(&path);
        assert!(cache.insert(key.clone(), TravelTime::Minutes(24)));
        assert!(cache.insert(far.clone(), TravelTime::Unreachable));
        cache.flush().unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = DistanceCache::open(&path);
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(&key).map(|e| e.value), Some(TravelTime::Minutes(24)));
        assert_eq!(reopened.get(&far).map(|e| e.value), Some(TravelTime::Unreachable));
    }

    #[test]
    fn test_insert_keeps_first_value_until_evicted() {
        let mut cache = DistanceCache::in_memory();
        let key = CacheKey::new("1 Smith St", "qvb", TravelMode::Transit);
        assert!(cache.insert(key.clone(), TravelTime::Minutes(20)));
        assert!(!cache.insert(key.clone(), TravelTime::Minutes(35)));
        assert_eq!(cache.get(&key).map(|e| e.value), Some(TravelTime::Minutes(20)));

        assert!(cache.evict(&key).is_some());
        assert!(cache.insert(key.clone(), TravelTime::Minutes(35)));
        assert_eq!(cache.get(&key).map(|e| e.value), Some(TravelTime::Minutes(35)));
    }

    #[test]
    fn test_corrupt_file_degrades_to_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("distance_cache.json");
        fs::write(&path, "{ not json").unwrap();

        let mut cache = DistanceCache::open(&path);
        assert!(cache.is_empty());
        assert!(matches!(cache.warning(), Some(ScoutError::CacheIo { .. })));
        assert!(cache.path().is_none());

        cache.insert(CacheKey::new("a", "b", TravelMode::Transit), TravelTime::Minutes(1));
        cache.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_unwritable_path_degrades_on_flush() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        let mut cache = DistanceCache::open(blocker.join("distance_cache.json"));
        assert!(cache.warning().is_none());
        fs::write(&blocker, "").unwrap();

        cache.insert(CacheKey::new("a", "b", TravelMode::Transit), TravelTime::Minutes(1));
        assert!(matches!(cache.flush(), Err(ScoutError::CacheIo { .. })));
        assert!(cache.path().is_none());
        assert_eq!(cache.len(), 1);
        cache.flush().unwrap();
    }
}
