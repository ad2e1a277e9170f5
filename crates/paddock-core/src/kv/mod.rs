//! Persistent key-value store of container state.
//!
//! One binary file per container id on a private tmpfs. Each file is a
//! concatenation of length-delimited records; replay merges records in order
//! with later values winning, so property updates append instead of
//! rewriting the whole node. A record that fails to decode aborts the load:
//! the caller (daemon startup) treats that as fatal and leaves the file for
//! the operator.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use prost::bytes::Buf;
use prost::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ContainerId;

/// A single key/value pair inside a record.
#[derive(Clone, PartialEq, Message)]
pub struct KvPair {
    /// Property name.
    #[prost(string, tag = "1")]
    pub key: String,
    /// Property value in its on-disk string encoding.
    #[prost(string, tag = "2")]
    pub val: String,
}

/// One length-delimited record; a file holds a sequence of these.
#[derive(Clone, PartialEq, Message)]
pub struct KvNode {
    /// Pairs written by this record.
    #[prost(message, repeated, tag = "1")]
    pub pairs: Vec<KvPair>,
}

/// Store of per-container record files.
#[derive(Debug)]
pub struct KvStore {
    root: PathBuf,
}

impl KvStore {
    /// Open a store over an existing directory without mounting anything.
    #[must_use]
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Mount the private tmpfs and open the store over it.
    ///
    /// Idempotent across daemon restarts: when a filesystem is already
    /// mounted at `path` the mount is skipped and the existing records are
    /// kept for restore.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the mount
    /// syscall fails. Callers treat this as fatal.
    pub fn mount(path: &Path, size: u64) -> Result<Self> {
        if !is_mountpoint(path)? {
            std::fs::create_dir_all(path)?;
            let data = format!("size={size}");
            nix::mount::mount(
                Some("tmpfs"),
                path,
                Some("tmpfs"),
                nix::mount::MsFlags::MS_NOEXEC | nix::mount::MsFlags::MS_NOSUID,
                Some(data.as_str()),
            )?;
            info!(path = %path.display(), size, "mounted key-value tmpfs");
        } else {
            debug!(path = %path.display(), "key-value tmpfs already mounted");
        }
        Ok(Self::open(path))
    }

    fn node_path(&self, id: ContainerId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Whether a record file exists for `id`.
    #[must_use]
    pub fn exists(&self, id: ContainerId) -> bool {
        self.node_path(id).exists()
    }

    /// Load and merge all records of a node, last write winning per key.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or any record fails to
    /// decode.
    pub fn load(&self, id: ContainerId) -> Result<Vec<KvPair>> {
        let mut raw = Vec::new();
        std::fs::File::open(self.node_path(id))?.read_to_end(&mut raw)?;

        let mut merged: Vec<KvPair> = Vec::new();
        let mut buf = raw.as_slice();
        while buf.has_remaining() {
            let node = KvNode::decode_length_delimited(&mut buf)
                .map_err(|e| Error::unknown(format!("kv node {id}: record decode error: {e}")))?;
            for pair in node.pairs {
                match merged.iter_mut().find(|p| p.key == pair.key) {
                    Some(existing) => existing.val = pair.val,
                    None => merged.push(pair),
                }
            }
        }
        Ok(merged)
    }

    /// Append one record to a node without rewriting earlier ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or written.
    pub fn append(&self, id: ContainerId, pairs: Vec<KvPair>) -> Result<()> {
        let node = KvNode { pairs };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.node_path(id))?;
        file.write_all(&node.encode_length_delimited_to_vec())?;
        Ok(())
    }

    /// Atomically replace a node with a single consolidated record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or written.
    pub fn save(&self, id: ContainerId, pairs: Vec<KvPair>) -> Result<()> {
        let node = KvNode { pairs };
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.node_path(id))?;
        file.write_all(&node.encode_length_delimited_to_vec())?;
        Ok(())
    }

    /// Remove a node file.
    ///
    /// # Errors
    ///
    /// Returns an error if the unlink fails for any reason other than the
    /// file already being gone.
    pub fn remove(&self, id: ContainerId) -> Result<()> {
        match std::fs::remove_file(self.node_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate stored container ids in increasing order.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn list(&self) -> Result<Vec<ContainerId>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            match name.to_string_lossy().parse::<u16>() {
                Ok(id) => ids.push(ContainerId(id)),
                Err(_) => warn!(name = %name.to_string_lossy(), "ignoring non-numeric kv file"),
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Log every node and its merged pairs. Operator debugging aid.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn dump(&self) -> Result<()> {
        for id in self.list()? {
            match self.load(id) {
                Ok(pairs) => {
                    info!(%id, "kv node");
                    for pair in pairs {
                        info!("  {} = {}", pair.key, pair.val);
                    }
                }
                Err(e) => warn!(%id, error = %e, "cannot load kv node"),
            }
        }
        Ok(())
    }
}

fn is_mountpoint(path: &Path) -> Result<bool> {
    let mounts = match std::fs::read_to_string("/proc/self/mounts") {
        Ok(text) => text,
        Err(_) => return Ok(false),
    };
    let want = path.to_string_lossy();
    Ok(mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mp| mp == want))
}

/// Convenience constructor for a pair.
#[must_use]
pub fn pair(key: impl Into<String>, val: impl Into<String>) -> KvPair {
    KvPair {
        key: key.into(),
        val: val.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KvStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path());
        (dir, store)
    }

    #[test]
    fn test_append_merge_last_wins() {
        let (_dir, store) = store();
        let id = ContainerId(3);

        store
            .append(id, vec![pair("state", "stopped"), pair("command", "/bin/true")])
            .unwrap();
        store.append(id, vec![pair("state", "running")]).unwrap();

        let pairs = store.load(id).unwrap();
        assert_eq!(pairs.len(), 2);
        let state = pairs.iter().find(|p| p.key == "state").unwrap();
        assert_eq!(state.val, "running");
    }

    #[test]
    fn test_save_truncates() {
        let (_dir, store) = store();
        let id = ContainerId(4);

        store.append(id, vec![pair("a", "1"), pair("b", "2")]).unwrap();
        store.save(id, vec![pair("a", "3")]).unwrap();

        let pairs = store.load(id).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].val, "3");
    }

    #[test]
    fn test_corrupt_record_fails_load() {
        let (dir, store) = store();
        let id = ContainerId(5);
        store.append(id, vec![pair("a", "1")]).unwrap();

        // Garbage after a valid record must abort the whole load.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("5"))
            .unwrap();
        file.write_all(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff]).unwrap();

        assert!(store.load(id).is_err());
    }

    #[test]
    fn test_list_and_remove() {
        let (_dir, store) = store();
        store.append(ContainerId(7), vec![pair("a", "1")]).unwrap();
        store.append(ContainerId(9), vec![pair("a", "1")]).unwrap();

        assert_eq!(store.list().unwrap(), vec![ContainerId(7), ContainerId(9)]);

        store.remove(ContainerId(7)).unwrap();
        assert_eq!(store.list().unwrap(), vec![ContainerId(9)]);

        // Removing twice is fine.
        store.remove(ContainerId(7)).unwrap();
    }
}
