//! JSON snapshot files.
//!
//! A [`JsonStore`] persists one serializable value as `<dir>/<name>.json`.
//! Writes go to a uniquely named temporary file first and are renamed into
//! place, so a crash never leaves a half-written snapshot behind. Clones
//! share one write lock: [`JsonStore::save_with`] takes the copy and writes
//! it while holding that lock, so an older copy can never land after a
//! newer one.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

/// A single JSON snapshot file.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonStore {
    /// Creates a store for `<dir>/<name>.json`.
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{name}.json")),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot, or the default value when the file is missing or unreadable.
    pub fn load<T: DeserializeOwned + Default>(&self) -> T {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read snapshot");
                return T::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                debug!(path = %self.path.display(), "loaded snapshot");
                value
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring corrupt snapshot");
                T::default()
            }
        }
    }

    /// Writes the snapshot atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot be written.
    pub fn save<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write(value)
    }

    /// Takes a snapshot and writes it under the store's write lock.
    ///
    /// Callers that copy shared state should copy it inside `snapshot` so
    /// concurrent writers persist in the order they copied.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot be written.
    pub fn save_with<T: Serialize>(&self, snapshot: impl FnOnce() -> T) -> Result<()> {
        let _guard = self.write_lock.lock();
        let value = snapshot();
        self.write(&value)
    }

    fn write<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        if let Err(e) = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, &self.path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path(), "nothing");
        let map: HashMap<String, u32> = store.load();
        assert!(map.is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path(), "counts");
        let mut map = HashMap::new();
        map.insert("a".to_string(), 3u32);
        store.save(&map).unwrap();

        let reloaded: HashMap<String, u32> = JsonStore::new(dir.path(), "counts").load();
        assert_eq!(reloaded.get("a"), Some(&3));
    }

    #[test]
    fn corrupt_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path(), "bad");
        fs::write(store.path(), b"{not json").unwrap();
        let map: HashMap<String, u32> = store.load();
        assert!(map.is_empty());
    }

    #[test]
    fn save_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        let store = JsonStore::new(&nested, "x");
        store.save(&vec![1, 2, 3]).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn concurrent_writers_keep_latest_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path(), "counter");
        let counter = Arc::new(Mutex::new(0u32));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        *counter.lock() += 1;
                        store.save_with(|| *counter.lock()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reloaded: u32 = store.load();
        assert_eq!(reloaded, 200);
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path() != store.path())
            .count();
        assert_eq!(leftovers, 0);
    }
}
