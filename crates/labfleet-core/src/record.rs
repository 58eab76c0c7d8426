//! Persistent per-server records
//!
//! Each server owns one TOML file holding its UUID, last port, certificate
//! metadata and handler-specific state. Records are opened through a
//! [`RecordStore`], which hands out a single shared handle per file so that
//! concurrent writers are serialized. Flushes are atomic: the content is
//! written to a sibling temporary file and renamed into place.
//!
//! Layout:
//! ```toml
//! [meta]
//! version = 2
//!
//! [server]
//! uuid = "…"
//! port = 50052
//! base_port = 50051
//!
//! [certificate]
//! not_before = "…"
//! ```

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const RECORD_VERSION: i64 = 2;

pub const SECTION_META: &str = "meta";
pub const SECTION_SERVER: &str = "server";

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot serialize record {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("Cannot store {section}.{key}: {reason}")]
    Value {
        section: String,
        key: String,
        reason: String,
    },
    #[error("Record {0} is already closed")]
    Closed(PathBuf),
}

type Sections = BTreeMap<String, toml::Table>;
type CloseHook = Box<dyn FnOnce(&ServerRecord) + Send>;

/// Convert a server name into a record file name
///
/// Whitespace becomes `_`, anything outside `[-\w.]` is dropped.
pub fn slugify(name: &str) -> String {
    name.trim()
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some('_')
            } else if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                Some(c)
            } else {
                None
            }
        })
        .collect()
}

/// Write `content` to `path` through a temporary sibling and a rename
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

struct RecordState {
    sections: Sections,
    dirty: bool,
}

/// Handle to one server's persisted record
pub struct ServerRecord {
    path: PathBuf,
    state: Mutex<RecordState>,
    hooks: Mutex<Vec<CloseHook>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ServerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRecord")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ServerRecord {
    /// Load the record at `path`, starting fresh if it is missing or unreadable
    fn load(path: PathBuf) -> Self {
        let sections = match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<Sections>(&content) {
                Ok(sections) => Some(sections),
                Err(e) => {
                    warn!("Record {} is corrupt, recreating: {}", path.display(), e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Cannot read record {}, recreating: {}", path.display(), e);
                None
            }
        };

        let fresh = sections.is_none();
        let mut sections = sections.unwrap_or_default();
        sections
            .entry(SECTION_META.to_string())
            .or_default()
            .insert("version".into(), toml::Value::Integer(RECORD_VERSION));

        Self {
            path,
            state: Mutex::new(RecordState {
                sections,
                dirty: fresh,
            }),
            hooks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the record file exists on disk
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Typed read of `section.key`; `None` when absent or of another type
    pub fn read<T: DeserializeOwned>(&self, section: &str, key: &str) -> Option<T> {
        let state = self.state.lock();
        let value = state.sections.get(section)?.get(key)?.clone();
        value.try_into().ok()
    }

    pub fn read_or<T: DeserializeOwned>(&self, section: &str, key: &str, default: T) -> T {
        self.read(section, key).unwrap_or(default)
    }

    /// Stage `section.key = value`; persisted on the next flush
    pub fn write<T: Serialize>(&self, section: &str, key: &str, value: T) -> Result<(), RecordError> {
        if self.is_closed() {
            return Err(RecordError::Closed(self.path.clone()));
        }
        let value = toml::Value::try_from(value).map_err(|e| RecordError::Value {
            section: section.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let mut state = self.state.lock();
        let table = state.sections.entry(section.to_string()).or_default();
        if table.get(key) != Some(&value) {
            table.insert(key.to_string(), value);
            state.dirty = true;
        }
        Ok(())
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.read::<String>(SECTION_SERVER, "uuid")
            .and_then(|s| Uuid::parse_str(&s).ok())
    }

    pub fn port(&self) -> Option<u16> {
        self.read(SECTION_SERVER, "port")
    }

    pub fn base_port(&self) -> Option<u16> {
        self.read(SECTION_SERVER, "base_port")
    }

    /// Record the port a server started on together with the base it was derived from
    pub fn set_port(&self, port: u16, base_port: u16) -> Result<(), RecordError> {
        self.write(SECTION_SERVER, "port", port)?;
        self.write(SECTION_SERVER, "base_port", base_port)
    }

    /// Persist staged changes atomically
    pub fn flush(&self) -> Result<(), RecordError> {
        let mut state = self.state.lock();
        if !state.dirty && self.path.exists() {
            return Ok(());
        }
        let content = toml::to_string_pretty(&state.sections).map_err(|source| {
            RecordError::Serialize {
                path: self.path.clone(),
                source,
            }
        })?;
        write_atomic(&self.path, content.as_bytes()).map_err(|source| RecordError::Io {
            path: self.path.clone(),
            source,
        })?;
        state.dirty = false;
        debug!("Flushed record {}", self.path.display());
        Ok(())
    }

    /// Register a hook that runs once, right before the record is closed
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce(&ServerRecord) + Send + 'static,
    {
        self.hooks.lock().push(Box::new(hook));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run close hooks, flush and mark the record closed
    ///
    /// Only the first call does any work. Hooks must not register further hooks.
    /// Records that were never flushed (the server never started) stay off disk.
    pub fn close(&self) -> Result<(), RecordError> {
        let mut hooks = self.hooks.lock();
        if self.is_closed() {
            return Ok(());
        }
        for hook in hooks.drain(..) {
            hook(self);
        }
        self.closed.store(true, Ordering::SeqCst);
        drop(hooks);
        if self.exists() {
            self.flush()
        } else {
            Ok(())
        }
    }
}

impl Drop for ServerRecord {
    fn drop(&mut self) {
        if !self.is_closed() && self.state.lock().dirty && self.path.exists() {
            if let Err(e) = self.flush() {
                warn!("Failed to flush record on drop: {}", e);
            }
        }
    }
}

/// Directory of server records for one configuration
pub struct RecordStore {
    dir: PathBuf,
    records: Mutex<HashMap<PathBuf, Arc<ServerRecord>>>,
    uuids: Mutex<HashSet<Uuid>>,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            records: Mutex::new(HashMap::new()),
            uuids: Mutex::new(HashSet::new()),
        }
    }

    pub fn path_for(&self, server_name: &str) -> PathBuf {
        self.dir.join(format!("{}.toml", slugify(server_name)))
    }

    /// Open the record for `server_name`
    ///
    /// Returns the same handle for every call naming the same file. A UUID is
    /// generated and staged for records that do not have one yet.
    pub fn open(&self, server_name: &str) -> Result<Arc<ServerRecord>, RecordError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| RecordError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let dir = self.dir.canonicalize().map_err(|source| RecordError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = dir.join(format!("{}.toml", slugify(server_name)));

        let mut records = self.records.lock();
        if let Some(record) = records.get(&path) {
            return Ok(record.clone());
        }

        let record = Arc::new(ServerRecord::load(path.clone()));
        let mut uuids = self.uuids.lock();
        match record.uuid() {
            Some(uuid) => {
                if !uuids.insert(uuid) {
                    warn!(
                        "Record {} shares UUID {} with another server",
                        path.display(),
                        uuid
                    );
                }
            }
            None => {
                let mut uuid = Uuid::new_v4();
                while !uuids.insert(uuid) {
                    uuid = Uuid::new_v4();
                }
                record.write(SECTION_SERVER, "uuid", uuid.to_string())?;
            }
        }

        records.insert(path, record.clone());
        Ok(record)
    }

    /// Close every open record, collecting failures
    pub fn close_all(&self) -> Vec<(PathBuf, RecordError)> {
        let records: Vec<Arc<ServerRecord>> = self.records.lock().values().cloned().collect();
        records
            .into_iter()
            .filter_map(|r| r.close().err().map(|e| (r.path().to_path_buf(), e)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("  Nemesys Pump 1 "), "Nemesys_Pump_1");
        assert_eq!(slugify("bal/1:a"), "bal1a");
        assert_eq!(slugify("lc-ms.v2"), "lc-ms.v2");
    }

    #[test]
    fn test_open_returns_shared_handle() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());

        let a = store.open("pump 1").unwrap();
        let b = store.open("pump 1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_opens_share_one_record() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());

        let handles: Vec<Arc<ServerRecord>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|i| {
                    let store = &store;
                    scope.spawn(move || {
                        let record = store.open("x").unwrap();
                        record.write("state", &format!("key{}", i), i).unwrap();
                        record.flush().unwrap();
                        record
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(store.len(), 1);

        let content = std::fs::read_to_string(store.path_for("x")).unwrap();
        let sections: Sections = toml::from_str(&content).unwrap();
        let state = &sections["state"];
        for i in 0..8 {
            assert_eq!(state.get(&format!("key{}", i)), Some(&toml::Value::Integer(i)));
        }
    }

    #[test]
    fn test_uuids_unique_and_stable() {
        let dir = TempDir::new().unwrap();
        let uuid = {
            let store = RecordStore::new(dir.path());
            let a = store.open("a").unwrap();
            let b = store.open("b").unwrap();
            assert_ne!(a.uuid(), b.uuid());
            a.flush().unwrap();
            a.uuid().unwrap()
        };

        let store = RecordStore::new(dir.path());
        assert_eq!(store.open("a").unwrap().uuid(), Some(uuid));
    }

    #[test]
    fn test_record_not_created_until_flush() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());
        let record = store.open("bal1").unwrap();
        assert!(!record.exists());

        record.set_port(50052, 50051).unwrap();
        record.flush().unwrap();
        assert!(record.exists());

        let content = std::fs::read_to_string(record.path()).unwrap();
        assert!(content.contains("version = 2"));
        assert!(content.contains("port = 50052"));
    }

    #[test]
    fn test_typed_read_write() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());
        let record = store.open("valve").unwrap();

        record.write("valve", "position", 3u32).unwrap();
        record.write("valve", "label", "waste").unwrap();
        assert_eq!(record.read::<u32>("valve", "position"), Some(3));
        assert_eq!(record.read::<String>("valve", "label").as_deref(), Some("waste"));
        assert_eq!(record.read::<u32>("valve", "label"), None);
        assert_eq!(record.read_or("valve", "missing", 7u32), 7);
    }

    #[test]
    fn test_corrupt_record_is_recreated() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bal1.toml"), "this is [[ not toml").unwrap();

        let store = RecordStore::new(dir.path());
        let record = store.open("bal1").unwrap();
        assert!(record.uuid().is_some());
        record.flush().unwrap();

        let content = std::fs::read_to_string(record.path()).unwrap();
        assert!(toml::from_str::<toml::Table>(&content).is_ok());
    }

    #[test]
    fn test_close_hooks_run_once() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());
        let record = store.open("pump").unwrap();
        record.flush().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        record.on_close(move |r| {
            counter.fetch_add(1, Ordering::SeqCst);
            r.write("pump", "fill_level", 0.5f64).unwrap();
        });

        record.close().unwrap();
        record.close().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(record.is_closed());
        assert!(record.write("pump", "x", 1).is_err());

        let content = std::fs::read_to_string(record.path()).unwrap();
        assert!(content.contains("fill_level = 0.5"));
    }

    #[test]
    fn test_close_without_start_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());
        let record = store.open("never started").unwrap();
        assert!(store.close_all().is_empty());
        assert!(!record.exists());
    }
}
