//! File-based storage backend for persistent storage.

use crate::backend::StorageBackend;
use crate::codec;
use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a FieldSync store log.
const MAGIC: &[u8; 8] = b"FSLOG\x00\x00\x01";

/// A single entry in the append-only log.
///
/// A `value` of `None` is a tombstone: the key was deleted.
#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    namespace: String,
    key: String,
    value: Option<Vec<u8>>,
}

struct Inner {
    file: File,
    /// Live key/value set, rebuilt from the log on open.
    index: HashMap<(String, String), Vec<u8>>,
    /// Total records appended since the last compaction.
    record_count: u64,
}

/// A file-based storage backend.
///
/// Writes go to an append-only log; the live key set is kept in an
/// in-memory index rebuilt by replaying the log on open. Each write is
/// flushed and fsynced before the call returns, so acknowledged data
/// survives process termination. A torn record at the log tail (crash
/// mid-write) is truncated away during replay and never surfaces to
/// callers.
///
/// An exclusive advisory lock is held on the log file for the lifetime of
/// the backend; a second process opening the same path gets
/// [`StoreError::Locked`].
///
/// # Example
///
/// ```no_run
/// use fieldsync_store::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("fieldsync.log")).unwrap();
/// backend.put("queue", "m-1", b"durable bytes").unwrap();
/// ```
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// Existing log contents are replayed to rebuild the index. When more
    /// than half of the replayed records turned out to be dead
    /// (overwritten or tombstoned), the log is compacted in place.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another process holds the log,
    /// [`StoreError::Corrupted`] if the header is not a FieldSync log,
    /// or an I/O error.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive().map_err(|_| StoreError::Locked)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(MAGIC)?;
            file.sync_all()?;
        }

        let (index, record_count) = Self::replay(&mut file)?;

        let backend = Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                file,
                index,
                record_count,
            }),
        };

        // Half the log being dead weight is the rewrite threshold.
        let live = backend.inner.lock().index.len() as u64;
        if record_count > 16 && live * 2 < record_count {
            backend.compact()?;
        }

        Ok(backend)
    }

    /// Returns the path to the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records in the log since the last compaction, dead ones
    /// included. Diagnostic only.
    #[must_use]
    pub fn log_records(&self) -> u64 {
        self.inner.lock().record_count
    }

    /// Rewrites the log to contain only the live key set.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewrite or the atomic swap fails.
    pub fn compact(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        tmp.write_all(MAGIC)?;
        let mut written = 0u64;
        for ((namespace, key), value) in &inner.index {
            let record = LogRecord {
                namespace: namespace.clone(),
                key: key.clone(),
                value: Some(value.clone()),
            };
            Self::append_record(&mut tmp, &record)?;
            written += 1;
        }
        tmp.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        // The rename leaves the old (still locked) file handle pointing at
        // an unlinked inode; swap in the new one and re-lock it.
        let new_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        new_file.try_lock_exclusive().map_err(|_| StoreError::Locked)?;

        inner.file = new_file;
        inner.record_count = written;
        Ok(())
    }

    /// Replays the log, returning the live index and total record count.
    ///
    /// Stops at the first incomplete or undecodable record and truncates
    /// the file there.
    fn replay(file: &mut File) -> StoreResult<(HashMap<(String, String), Vec<u8>>, u64)> {
        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;

        if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
            return Err(StoreError::Corrupted("bad log header".to_string()));
        }

        let mut index = HashMap::new();
        let mut record_count = 0u64;
        let mut offset = MAGIC.len();

        while offset < bytes.len() {
            let good_end = offset;

            if bytes.len() - offset < 4 {
                Self::truncate_tail(file, good_end as u64)?;
                break;
            }
            let len =
                u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
                    as usize;
            offset += 4;

            if bytes.len() - offset < len {
                Self::truncate_tail(file, good_end as u64)?;
                break;
            }

            let record: LogRecord = match codec::decode(&bytes[offset..offset + len]) {
                Ok(record) => record,
                Err(_) => {
                    Self::truncate_tail(file, good_end as u64)?;
                    break;
                }
            };
            offset += len;
            record_count += 1;

            let index_key = (record.namespace, record.key);
            match record.value {
                Some(value) => {
                    index.insert(index_key, value);
                }
                None => {
                    index.remove(&index_key);
                }
            }
        }

        Ok((index, record_count))
    }

    fn truncate_tail(file: &mut File, len: u64) -> StoreResult<()> {
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }

    fn append_record(file: &mut File, record: &LogRecord) -> StoreResult<()> {
        let payload = codec::encode(record)?;
        let len = payload.len() as u32;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&payload)?;
        Ok(())
    }

    /// Appends a record, fsyncs it, and applies it to the index.
    fn write_durable(&self, record: LogRecord) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        Self::append_record(&mut inner.file, &record)?;
        inner.file.flush()?;
        inner.file.sync_data()?;
        inner.record_count += 1;

        let index_key = (record.namespace, record.key);
        Ok(match record.value {
            Some(value) => {
                inner.index.insert(index_key, value);
                true
            }
            None => inner.index.remove(&index_key).is_some(),
        })
    }
}

impl StorageBackend for FileBackend {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        self.write_durable(LogRecord {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: Some(value.to_vec()),
        })?;
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .inner
            .lock()
            .index
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn scan(&self, namespace: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .inner
            .lock()
            .index
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn delete(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        // A delete of an absent key still writes a tombstone; harmless,
        // and it keeps the happy path a single code path.
        self.write_durable(LogRecord {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: None,
        })
    }
}
