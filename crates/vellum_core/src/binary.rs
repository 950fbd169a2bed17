//! Content-addressed binary storage.
//!
//! Binaries are stored once per content digest under a sharded
//! directory layout:
//!
//! ```text
//! <base>/
//! ├─ config.json       # digest algorithm and sharding depth
//! ├─ tmp/              # staging for in-flight writes
//! └─ data/ab/cd/abcd…  # one file per digest, sharded by prefix
//! ```
//!
//! Writes stage into `tmp/` and rename into place, so a reader never
//! observes a partial file. Garbage collection is mark-and-sweep:
//! callers mark every digest still referenced, then the sweep deletes
//! unmarked files, sparing files newer than the mark-phase start minus
//! a filesystem time-resolution slack since they may belong to an
//! upload racing the collection.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;
use vellum_mapper::{StoreError, StoreResult};

/// A handle to one stored binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    /// Content digest (lowercase hex).
    pub digest: String,
    /// Length in bytes.
    pub length: u64,
}

/// Result of a garbage collection sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcInfo {
    /// Binaries still referenced.
    pub num_binaries: u64,
    /// Bytes still referenced.
    pub size_binaries: u64,
    /// Unreferenced binaries found.
    pub num_orphans: u64,
    /// Unreferenced bytes found.
    pub size_orphans: u64,
}

/// Content-addressed binary storage with mark-and-sweep collection.
pub trait BinaryManager: Send + Sync {
    /// Stores bytes, returning their handle. Storing the same content
    /// twice is free.
    fn get_binary(&self, bytes: &[u8]) -> StoreResult<Binary>;

    /// Reads a binary back, `None` for unknown digests.
    fn binary_bytes(&self, digest: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Starts a collection cycle.
    fn gc_start(&self) -> StoreResult<()>;

    /// Marks a digest as still referenced.
    fn gc_mark(&self, digest: &str) -> StoreResult<()>;

    /// Sweeps: with `delete`, unreferenced binaries are removed;
    /// otherwise they are only counted.
    fn gc_stop(&self, delete: bool) -> StoreResult<GcInfo>;
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct StoreDescriptor {
    digest: String,
    depth: usize,
}

#[derive(Debug)]
struct GcState {
    start: SystemTime,
    marked: HashSet<String>,
}

/// The default on-disk binary store, SHA-256 digested.
pub struct FsBinaryStore {
    base: PathBuf,
    depth: usize,
    time_resolution: Duration,
    gc: parking_lot::Mutex<Option<GcState>>,
}

const DIGEST_ALGORITHM: &str = "sha256";
const DEFAULT_DEPTH: usize = 2;

impl FsBinaryStore {
    /// Opens or creates a store at `base`.
    ///
    /// `time_resolution` is the filesystem mtime granularity slack used
    /// by the sweep (see [`crate::StoreConfig::fs_time_resolution`]).
    pub fn open(base: &Path, time_resolution: Duration) -> StoreResult<Self> {
        fs::create_dir_all(base.join("data"))?;
        fs::create_dir_all(base.join("tmp"))?;
        let config_path = base.join("config.json");
        let depth = if config_path.exists() {
            let text = fs::read_to_string(&config_path)?;
            let descriptor: StoreDescriptor = serde_json::from_str(&text)
                .map_err(|e| StoreError::storage(format!("bad binary store config: {e}")))?;
            if descriptor.digest != DIGEST_ALGORITHM {
                return Err(StoreError::storage(format!(
                    "unsupported digest algorithm: {}",
                    descriptor.digest
                )));
            }
            descriptor.depth
        } else {
            let descriptor = StoreDescriptor {
                digest: DIGEST_ALGORITHM.to_owned(),
                depth: DEFAULT_DEPTH,
            };
            let text = serde_json::to_string_pretty(&descriptor)
                .map_err(|e| StoreError::storage(format!("cannot encode config: {e}")))?;
            fs::write(&config_path, text)?;
            DEFAULT_DEPTH
        };
        Ok(Self {
            base: base.to_owned(),
            depth,
            time_resolution,
            gc: parking_lot::Mutex::new(None),
        })
    }

    fn path_for(&self, digest: &str) -> PathBuf {
        let mut path = self.base.join("data");
        for i in 0..self.depth {
            let start = i * 2;
            path.push(digest.get(start..start + 2).unwrap_or("__"));
        }
        path.push(digest);
        path
    }

    fn digest_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            use std::fmt::Write as _;
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }

    fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> StoreResult<()> {
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::walk_files(&path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }
}

impl BinaryManager for FsBinaryStore {
    fn get_binary(&self, bytes: &[u8]) -> StoreResult<Binary> {
        let digest = Self::digest_hex(bytes);
        let target = self.path_for(&digest);
        if !target.exists() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            // stage then rename, so a concurrent reader never sees a
            // partial file
            let staging = self.base.join("tmp").join(format!("{digest}.part"));
            {
                let mut file = fs::File::create(&staging)?;
                file.write_all(bytes)?;
                file.sync_all()?;
            }
            fs::rename(&staging, &target)?;
            debug!(%digest, length = bytes.len(), "stored binary");
        }
        Ok(Binary {
            digest,
            length: bytes.len() as u64,
        })
    }

    fn binary_bytes(&self, digest: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.path_for(digest);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    fn gc_start(&self) -> StoreResult<()> {
        let mut gc = self.gc.lock();
        if gc.is_some() {
            return Err(StoreError::invalid_state("GC already in progress"));
        }
        *gc = Some(GcState {
            start: SystemTime::now(),
            marked: HashSet::new(),
        });
        Ok(())
    }

    fn gc_mark(&self, digest: &str) -> StoreResult<()> {
        let mut gc = self.gc.lock();
        match gc.as_mut() {
            Some(state) => {
                state.marked.insert(digest.to_owned());
                Ok(())
            }
            None => Err(StoreError::invalid_state("GC not started")),
        }
    }

    fn gc_stop(&self, delete: bool) -> StoreResult<GcInfo> {
        let state = self
            .gc
            .lock()
            .take()
            .ok_or_else(|| StoreError::invalid_state("GC not started"))?;
        // anything younger than this may be an upload racing us
        let cutoff = state.start - self.time_resolution;

        let mut files = Vec::new();
        Self::walk_files(&self.base.join("data"), &mut files)?;

        let mut info = GcInfo::default();
        for path in files {
            let metadata = fs::metadata(&path)?;
            let digest = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_owned();
            if state.marked.contains(&digest) {
                info.num_binaries += 1;
                info.size_binaries += metadata.len();
                continue;
            }
            let recent = metadata
                .modified()
                .map(|mtime| mtime > cutoff)
                .unwrap_or(true);
            if recent {
                // too fresh to judge, leave it for the next cycle
                continue;
            }
            info.num_orphans += 1;
            info.size_orphans += metadata.len();
            if delete {
                fs::remove_file(&path)?;
            }
        }
        debug!(?info, %delete, "binary GC sweep done");
        Ok(info)
    }
}

impl std::fmt::Debug for FsBinaryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsBinaryStore")
            .field("base", &self.base)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> FsBinaryStore {
        // zero slack so tests can collect immediately
        FsBinaryStore::open(dir, Duration::ZERO).unwrap()
    }

    #[test]
    fn store_and_read_back() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let binary = store.get_binary(b"hello world").unwrap();
        assert_eq!(binary.length, 11);
        assert_eq!(
            store.binary_bytes(&binary.digest).unwrap().unwrap(),
            b"hello world"
        );
        assert!(store.binary_bytes("0000").unwrap().is_none());
    }

    #[test]
    fn identical_content_is_stored_once() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let a = store.get_binary(b"same").unwrap();
        let b = store.get_binary(b"same").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn layout_is_sharded_by_digest_prefix() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let binary = store.get_binary(b"content").unwrap();
        let expected = dir
            .path()
            .join("data")
            .join(&binary.digest[0..2])
            .join(&binary.digest[2..4])
            .join(&binary.digest);
        assert!(expected.exists());
        assert!(dir.path().join("config.json").exists());
        assert!(dir.path().join("tmp").exists());
    }

    #[test]
    fn config_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let _ = store(dir.path());
        }
        let reopened = store(dir.path());
        assert_eq!(reopened.depth, DEFAULT_DEPTH);
    }

    #[test]
    fn gc_sweeps_unmarked_binaries() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let keep = store.get_binary(b"keep me").unwrap();
        let orphan = store.get_binary(b"orphan").unwrap();

        // make the files old enough to be judged
        std::thread::sleep(Duration::from_millis(20));

        store.gc_start().unwrap();
        store.gc_mark(&keep.digest).unwrap();
        let info = store.gc_stop(true).unwrap();

        assert_eq!(info.num_binaries, 1);
        assert_eq!(info.num_orphans, 1);
        assert!(store.binary_bytes(&keep.digest).unwrap().is_some());
        assert!(store.binary_bytes(&orphan.digest).unwrap().is_none());
    }

    #[test]
    fn gc_without_delete_only_counts() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let orphan = store.get_binary(b"orphan").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        store.gc_start().unwrap();
        let info = store.gc_stop(false).unwrap();
        assert_eq!(info.num_orphans, 1);
        assert!(store.binary_bytes(&orphan.digest).unwrap().is_some());
    }

    #[test]
    fn gc_spares_recent_files() {
        let dir = tempdir().unwrap();
        // large slack: everything is "recent"
        let store = FsBinaryStore::open(dir.path(), Duration::from_millis(2000)).unwrap();
        let fresh = store.get_binary(b"fresh upload").unwrap();

        store.gc_start().unwrap();
        let info = store.gc_stop(true).unwrap();
        assert_eq!(info.num_orphans, 0);
        assert!(store.binary_bytes(&fresh.digest).unwrap().is_some());
    }

    #[test]
    fn gc_misuse_is_an_error() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.gc_mark("abc").is_err());
        assert!(store.gc_stop(true).is_err());
        store.gc_start().unwrap();
        assert!(store.gc_start().is_err());
        store.gc_stop(false).unwrap();
    }
}
