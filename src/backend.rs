//! Persistence substrate: point get/put/delete and ordered prefix scans.
//!
//! Keys are `/`-separated relative paths such as `events/ab/cd/abcd….json`.
//! The store treats values as opaque bytes.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    ops::ControlFlow,
    path::{Component, Path, PathBuf},
};

use parking_lot::RwLock;

use crate::error::Result;

/// Visitor invoked for every entry of a scan; `Break` stops the scan early.
pub type Visit<'a> = dyn FnMut(&str, &[u8]) -> Result<ControlFlow<()>> + 'a;

/// Key-value substrate the event store persists into.
pub trait Backend: Send + Sync {
    /// Read a value, `None` if the key is absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value atomically, replacing any previous one.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Visit every entry whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str, visit: &mut Visit<'_>) -> Result<()>;
}

/// Directory tree backend; every key is a file under `root`.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto a path, refusing anything that could escape `root`.
    fn path(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid storage key {key:?}"),
            )
            .into());
        }
        Ok(self.root.join(rel))
    }
}

impl Backend for FsBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(key)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        let parent_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent_dir)?;
        // Write through a temp file in the same directory, then rename.
        let mut tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
        tmp.write_all(value)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn scan(&self, prefix: &str, visit: &mut Visit<'_>) -> Result<()> {
        // Walk the deepest directory named by the prefix and filter the rest.
        let dir = match prefix.rfind('/') {
            Some(pos) => self.path(&prefix[..pos])?,
            None => self.root.clone(),
        };
        if !dir.exists() {
            return Ok(());
        }
        let walker = walkdir::WalkDir::new(&dir).sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            // Skip leftovers of interrupted atomic writes.
            if !key.starts_with(prefix) || entry.file_name().to_string_lossy().starts_with(".tmp") {
                continue;
            }
            let data = fs::read(entry.path())?;
            if visit(&key, &data)?.is_break() {
                break;
            }
        }
        Ok(())
    }
}

/// In-memory ordered map backend, used in tests and for ephemeral stores.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &str, visit: &mut Visit<'_>) -> Result<()> {
        // Copy the range out so the visitor may call back into the backend.
        let entries: Vec<(String, Vec<u8>)> = self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in entries {
            if visit(&key, &value)?.is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn collect(backend: &dyn Backend, prefix: &str) -> Vec<String> {
        let mut keys = vec![];
        backend
            .scan(prefix, &mut |k, _| {
                keys.push(k.to_string());
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        keys
    }

    fn exercise(backend: &dyn Backend) {
        assert_eq!(backend.get("events/aa/1.json").unwrap(), None);
        backend.put("events/aa/1.json", b"one").unwrap();
        backend.put("events/bb/2.json", b"two").unwrap();
        backend.put("deleted/p/1", b"").unwrap();
        assert_eq!(backend.get("events/aa/1.json").unwrap().unwrap(), b"one");
        // overwrite
        backend.put("events/aa/1.json", b"uno").unwrap();
        assert_eq!(backend.get("events/aa/1.json").unwrap().unwrap(), b"uno");
        assert_eq!(
            collect(backend, "events/"),
            vec!["events/aa/1.json", "events/bb/2.json"]
        );
        assert_eq!(collect(backend, "deleted/"), vec!["deleted/p/1"]);
        backend.delete("events/aa/1.json").unwrap();
        backend.delete("events/aa/1.json").unwrap();
        assert_eq!(collect(backend, "events/"), vec!["events/bb/2.json"]);
        assert!(collect(backend, "missing/").is_empty());
    }

    #[test]
    fn memory_backend_contract() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn fs_backend_contract() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::open(dir.path()).unwrap();
        exercise(&backend);
        assert!(dir.path().join("events/bb/2.json").exists());
    }

    #[test]
    fn scan_stops_early() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            backend.put(&format!("k/{i}"), b"x").unwrap();
        }
        let mut seen = 0;
        backend
            .scan("k/", &mut |_, _| {
                seen += 1;
                Ok(if seen == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })
            .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn fs_backend_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::open(dir.path()).unwrap();
        assert!(backend.put("../outside", b"x").is_err());
        assert!(backend.put("/abs", b"x").is_err());
        assert!(backend.get("").is_err());
    }
}
