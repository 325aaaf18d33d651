//! State map access and filesystem publication (pinning)

use crate::{HooktailError, Result};
use hooktail_common::{StateValue, STATE_KEY};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Single-entry key/value store shared with the probes
///
/// `upsert` always overwrites; there is no set-if-absent.
pub trait StateMap {
    fn upsert(&mut self, key: u32, value: StateValue) -> Result<()>;

    fn lookup(&self, key: u32) -> Result<StateValue>;
}

/// Write the "not yet initialized" sentinel before any probe can run
pub fn init_state<M: StateMap + ?Sized>(map: &mut M) -> Result<()> {
    map.upsert(STATE_KEY, StateValue::UNINITIALIZED)?;
    debug!("State map sentinel written at key {}", STATE_KEY);
    Ok(())
}

/// In-process array map with the same bounds rules as a BPF array
#[derive(Debug, Clone)]
pub struct MemoryStateMap {
    entries: Vec<StateValue>,
}

impl MemoryStateMap {
    pub fn with_max_entries(max_entries: u32) -> Self {
        Self {
            entries: vec![StateValue::default(); max_entries as usize],
        }
    }

    fn check_bounds(&self, key: u32) -> Result<usize> {
        let index = key as usize;
        if index >= self.entries.len() {
            return Err(HooktailError::MapError(format!(
                "key {} out of bounds (max_entries {})",
                key,
                self.entries.len()
            )));
        }
        Ok(index)
    }
}

impl StateMap for MemoryStateMap {
    fn upsert(&mut self, key: u32, value: StateValue) -> Result<()> {
        let index = self.check_bounds(key)?;
        self.entries[index] = value;
        Ok(())
    }

    fn lookup(&self, key: u32) -> Result<StateValue> {
        let index = self.check_bounds(key)?;
        Ok(self.entries[index])
    }
}

/// A map published at a filesystem path
///
/// The pin is a second reference with its own lifetime: it must be removed
/// explicitly with [`PinnedMap::remove`]. Dropping an unremoved guard (error
/// paths) removes the path best-effort.
#[derive(Debug)]
pub struct PinnedMap {
    path: Option<PathBuf>,
}

impl PinnedMap {
    /// Run `pin` against `path`, refusing to reuse a path that already exists
    pub fn publish<F>(path: impl Into<PathBuf>, pin: F) -> Result<Self>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let path = path.into();

        if path.exists() {
            return Err(HooktailError::PinConflict { path });
        }

        pin(&path)?;
        info!("Map pinned at {}", path.display());

        Ok(Self { path: Some(path) })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Remove the published path, failing if it no longer exists
    pub fn remove(mut self) -> Result<()> {
        let Some(path) = self.path.take() else {
            return Ok(());
        };

        std::fs::remove_file(&path).map_err(|source| HooktailError::UnpinFailed {
            path: path.clone(),
            source,
        })?;
        info!("Removed pinned map {}", path.display());
        Ok(())
    }
}

impl Drop for PinnedMap {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove pinned map {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use kernel::KernelStateMap;

#[cfg(target_os = "linux")]
mod kernel {
    use super::{PinnedMap, StateMap};
    use crate::{HooktailError, Result};
    use aya::maps::{Array, Map, MapData};
    use hooktail_common::StateValue;
    use std::path::Path;

    #[repr(transparent)]
    #[derive(Clone, Copy)]
    struct StateCell(StateValue);

    // SAFETY: StateValue is a #[repr(C)] struct of two u64s with no padding.
    unsafe impl aya::Pod for StateCell {}

    /// The probes' `STATE` array map
    pub struct KernelStateMap {
        inner: Array<MapData, StateCell>,
    }

    impl KernelStateMap {
        pub fn open(map: Map) -> Result<Self> {
            let inner = Array::try_from(map)
                .map_err(|e| HooktailError::MapError(format!("STATE is not an array: {}", e)))?;
            Ok(Self { inner })
        }

        /// Pin the map at `path`, then open it
        pub fn open_pinned(map: Map, path: &Path) -> Result<(Self, PinnedMap)> {
            let pinned = match &map {
                Map::Array(data) => PinnedMap::publish(path, |p| {
                    data.pin(p).map_err(|e| HooktailError::PinFailed {
                        path: p.to_path_buf(),
                        reason: e.to_string(),
                    })
                })?,
                _ => {
                    return Err(HooktailError::MapError(
                        "STATE is not an array map".to_string(),
                    ))
                }
            };

            Ok((Self::open(map)?, pinned))
        }
    }

    impl StateMap for KernelStateMap {
        fn upsert(&mut self, key: u32, value: StateValue) -> Result<()> {
            self.inner
                .set(key, StateCell(value), 0)
                .map_err(|e| HooktailError::MapError(format!("update key {}: {}", key, e)))
        }

        fn lookup(&self, key: u32) -> Result<StateValue> {
            self.inner
                .get(&key, 0)
                .map(|cell| cell.0)
                .map_err(|e| HooktailError::MapError(format!("lookup key {}: {}", key, e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) -> Result<()> {
        std::fs::write(path, b"")?;
        Ok(())
    }

    #[test]
    fn test_init_state_overwrites() {
        let mut map = MemoryStateMap::with_max_entries(1);
        map.upsert(
            STATE_KEY,
            StateValue {
                initialized: 1,
                hits: 9,
                callbacks: 4,
            },
        )
        .unwrap();

        init_state(&mut map).unwrap();
        assert_eq!(map.lookup(STATE_KEY).unwrap(), StateValue::UNINITIALIZED);
    }

    #[test]
    fn test_upsert_last_write_wins() {
        let mut map = MemoryStateMap::with_max_entries(1);
        init_state(&mut map).unwrap();
        assert!(!map.lookup(STATE_KEY).unwrap().is_initialized());

        map.upsert(
            STATE_KEY,
            StateValue {
                initialized: 1,
                hits: 1,
                callbacks: 0,
            },
        )
        .unwrap();
        assert!(map.lookup(STATE_KEY).unwrap().is_initialized());
    }

    #[test]
    fn test_out_of_bounds_key() {
        let mut map = MemoryStateMap::with_max_entries(1);
        assert!(matches!(
            map.upsert(1, StateValue::default()),
            Err(HooktailError::MapError(_))
        ));
        assert!(map.lookup(5).is_err());
    }

    #[test]
    fn test_publish_and_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state");

        let pinned = PinnedMap::publish(&path, touch).unwrap();
        assert!(path.exists());
        assert_eq!(pinned.path(), Some(path.as_path()));

        pinned.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_publish_conflict() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state");

        let _first = PinnedMap::publish(&path, touch).unwrap();
        let second = PinnedMap::publish(&path, |_| panic!("pin must not run on conflict"));
        assert!(matches!(second, Err(HooktailError::PinConflict { .. })));
    }

    #[test]
    fn test_remove_missing_path_fails_clearly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state");

        let pinned = PinnedMap::publish(&path, touch).unwrap();
        std::fs::remove_file(&path).unwrap();

        match pinned.remove() {
            Err(HooktailError::UnpinFailed { path: p, source }) => {
                assert_eq!(p, path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected UnpinFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_drop_cleans_up_on_error_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state");

        {
            let _pinned = PinnedMap::publish(&path, touch).unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_pin_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state");

        let result = PinnedMap::publish(&path, |p| {
            Err(HooktailError::PinFailed {
                path: p.to_path_buf(),
                reason: "EPERM".to_string(),
            })
        });
        assert!(result.is_err());
        assert!(!path.exists());
    }
}
