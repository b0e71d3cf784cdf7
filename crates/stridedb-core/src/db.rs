//! Public store façade
//!
//! StrideDb ties the pieces together: `put` stages into the buffer and never
//! touches disk; `get` serves buffer-first, then tree-then-log; a background
//! thread runs the journalled flush on a fixed cadence.
//!
//! WRITE PATH ORDERING (one flush cycle):
//! 1. the journal walks the tree and assigns log offsets to staged keys
//! 2. value bytes are appended to the log
//! 3. rewritten nodes are persisted deepest-first, then republished
//! 4. the buffer drops its finished entries
//!
//! A failed cycle is logged and left in place — the buffer still holds the
//! work, and the next cycle retries it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::buffer::Buffer;
use crate::cache::NodeCache;
use crate::config::Config;
use crate::error::{StrideError, StrideResult};
use crate::journal::Journal;
use crate::key::Key;
use crate::store::{KeyStore, ValueStore, MAX_VALUE_LEN};
use crate::tree::Tree;

pub struct StrideDb {
    inner: Arc<DbInner>,
    close: Arc<AtomicBool>,
    flusher: Option<thread::JoinHandle<()>>,
}

struct DbInner {
    config: Config,
    keys: Arc<KeyStore>,
    values: ValueStore,
    cache: Arc<NodeCache>,
    tree: Tree,
    buffer: Buffer,
    buffer_hits: AtomicU64,
    key_misses: AtomicU64,
    value_hits: AtomicU64,
    value_misses: AtomicU64,
}

impl StrideDb {
    /// Opens (or creates) the store described by `config` and starts the
    /// background flush thread. Not safe to call concurrently for the same
    /// files; a store is single-process.
    pub fn open(config: Config) -> StrideResult<StrideDb> {
        config
            .validate()
            .map_err(|message| StrideError::InvalidConfig { message })?;

        let keys = Arc::new(KeyStore::open(&config.key_file, config.block_size)?);
        let values = ValueStore::open(&config.value_file)?;
        let cache = Arc::new(NodeCache::new(config.cache_size));
        let tree = Tree::new(keys.clone(), cache.clone());
        tree.init(true)?;

        let inner = Arc::new(DbInner {
            config,
            keys,
            values,
            cache,
            tree,
            buffer: Buffer::new(),
            buffer_hits: AtomicU64::new(0),
            key_misses: AtomicU64::new(0),
            value_hits: AtomicU64::new(0),
            value_misses: AtomicU64::new(0),
        });

        let close = Arc::new(AtomicBool::new(false));
        let flusher = {
            let inner = Arc::clone(&inner);
            let close = Arc::clone(&close);
            thread::Builder::new()
                .name("stridedb-flush".to_string())
                .spawn(move || flush_loop(inner, close))
                .map_err(|e| StrideError::Io {
                    path: None,
                    kind: e.kind(),
                    message: format!("Failed to spawn flush thread: {}", e),
                })?
        };

        Ok(StrideDb {
            inner,
            close,
            flusher: Some(flusher),
        })
    }

    /// Stages a write. Validation failures never change state; success means
    /// the pair will reach disk on a later flush. Never blocks on I/O.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StrideResult<()> {
        let key = parse_key(key)?;
        if value.is_empty() {
            return Err(StrideError::ZeroLengthValue);
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(StrideError::ValueTooLong {
                length: value.len() as u64,
                max: MAX_VALUE_LEN as u64,
            });
        }
        self.inner.buffer.add(key, value.to_vec());
        Ok(())
    }

    /// Reads a value: the staging buffer first, then the tree and value log.
    pub fn get(&self, key: &[u8]) -> StrideResult<Vec<u8>> {
        let key = parse_key(key)?;
        if let Some(value) = self.inner.buffer.get(&key) {
            self.inner.buffer_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        let kv = match self.inner.tree.get(&key) {
            Ok(kv) => kv,
            Err(e) => {
                self.inner.key_misses.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        match self.inner.values.get(kv.offset, kv.length) {
            Ok(value) => {
                self.inner.value_hits.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(e) => {
                self.inner.value_misses.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Scans the value log in insertion order. Overwritten and evicted keys
    /// still appear (the log is never rewritten), so the callback may see
    /// several records for one key; callers wanting unique keys deduplicate.
    pub fn each<F>(&self, f: F) -> StrideResult<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        self.inner.values.each(f)
    }

    /// Drops everything: staged entries, the tree, the value log. Not safe
    /// to call concurrently with `put`/`get`.
    pub fn clear(&self) -> StrideResult<()> {
        self.inner.buffer.clear();
        self.inner.keys.clear()?;
        self.inner.tree.init(true)?;
        self.inner.values.clear()
    }

    /// Stops the flush thread (which runs one final cycle first) and syncs
    /// both files. Dropping the handle does the same minus the syncs.
    pub fn close(mut self) -> StrideResult<()> {
        self.shutdown();
        self.inner.keys.sync()?;
        self.inner.values.sync()
    }

    fn shutdown(&mut self) {
        self.close.store(true, Ordering::Release);
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StrideDb {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn parse_key(key: &[u8]) -> StrideResult<Key> {
    let bytes: [u8; Key::BYTES] = key.try_into().map_err(|_| StrideError::KeyWrongLength {
        expected: Key::BYTES,
        actual: key.len(),
    })?;
    Ok(Key::from_be_bytes(bytes))
}

fn flush_loop(inner: Arc<DbInner>, close: Arc<AtomicBool>) {
    let interval = inner.config.flush_interval;
    let nap = interval.min(Duration::from_millis(100));
    loop {
        let wake = Instant::now() + interval;
        while Instant::now() < wake && !close.load(Ordering::Acquire) {
            thread::sleep(nap);
        }
        // Snapshot the flag before flushing so a close during the cycle still
        // gets one more cycle after it.
        let stop = close.load(Ordering::Acquire);
        if let Err(e) = flush(&inner) {
            eprintln!("[FLUSH] cycle failed, keeping buffer for retry: {}", e);
        }
        if stop {
            return;
        }
    }
}

fn flush(inner: &DbInner) -> StrideResult<()> {
    let mut journal = Journal::new(&inner.buffer, &inner.values);
    journal.process(&inner.tree)?;
    if !journal.is_empty() {
        eprintln!(
            "[FLUSH] committing {}/{} buffered keys into {} nodes (buffer hits: {}, key misses: {}, value hits: {}, value misses: {}, cache {})",
            inner.buffer.ready_for_committing(),
            inner.buffer.len(),
            journal.len(),
            inner.buffer_hits.load(Ordering::Relaxed),
            inner.key_misses.load(Ordering::Relaxed),
            inner.value_hits.load(Ordering::Relaxed),
            inner.value_misses.load(Ordering::Relaxed),
            inner.cache.stats(),
        );
    }
    journal.commit(&inner.tree, inner.config.write_buffer_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_config(dir: &TempDir) -> Config {
        Config::at(dir.path())
            .cache_size(64)
            .flush_interval(Duration::from_millis(20))
    }

    fn key_of(byte: u8) -> Vec<u8> {
        vec![byte; Key::BYTES]
    }

    #[test]
    fn test_put_validates_key_length() {
        let dir = TempDir::new().unwrap();
        let db = StrideDb::open(fast_config(&dir)).unwrap();

        let err = db.put(b"ABC", b"value").unwrap_err();
        assert_eq!(err, StrideError::KeyWrongLength { expected: 32, actual: 3 });
        let err = db.get(b"ABC").unwrap_err();
        assert_eq!(err, StrideError::KeyWrongLength { expected: 32, actual: 3 });

        let long = vec![0u8; 33];
        assert!(matches!(
            db.put(&long, b"value"),
            Err(StrideError::KeyWrongLength { actual: 33, .. })
        ));
    }

    #[test]
    fn test_put_validates_value() {
        let dir = TempDir::new().unwrap();
        let db = StrideDb::open(fast_config(&dir)).unwrap();

        assert!(matches!(
            db.put(&key_of(1), b""),
            Err(StrideError::ZeroLengthValue)
        ));

        // A rejected put leaves no trace.
        assert!(matches!(db.get(&key_of(1)), Err(StrideError::KeyNotFound)));
    }

    #[test]
    fn test_get_before_flush_serves_from_buffer() {
        let dir = TempDir::new().unwrap();
        let config = fast_config(&dir).flush_interval(Duration::from_secs(3600));
        let db = StrideDb::open(config).unwrap();

        db.put(&key_of(7), b"fresh").unwrap();
        assert_eq!(db.get(&key_of(7)).unwrap(), b"fresh");
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let db = StrideDb::open(fast_config(&dir)).unwrap();
        assert!(matches!(db.get(&key_of(9)), Err(StrideError::KeyNotFound)));
    }

    #[test]
    fn test_close_flushes_and_reopen_serves_from_disk() {
        let dir = TempDir::new().unwrap();

        {
            let db = StrideDb::open(fast_config(&dir)).unwrap();
            db.put(&key_of(0xaa), b"persisted-a").unwrap();
            db.put(&key_of(0xbb), b"persisted-b").unwrap();
            db.close().unwrap();
        }

        let db = StrideDb::open(fast_config(&dir)).unwrap();
        assert_eq!(db.get(&key_of(0xaa)).unwrap(), b"persisted-a");
        assert_eq!(db.get(&key_of(0xbb)).unwrap(), b"persisted-b");
    }

    #[test]
    fn test_duplicate_put_keeps_first_committed_value() {
        let dir = TempDir::new().unwrap();
        let db = StrideDb::open(fast_config(&dir)).unwrap();

        db.put(&key_of(5), b"v1").unwrap();
        // Wait out a flush so v1 is committed to the tree.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(db.get(&key_of(5)).unwrap(), b"v1");

        // The duplicate is served from the buffer until the next flush drops
        // it; afterwards the tree still holds v1.
        db.put(&key_of(5), b"v2").unwrap();
        assert_eq!(db.get(&key_of(5)).unwrap(), b"v2");
        thread::sleep(Duration::from_millis(200));
        assert_eq!(db.get(&key_of(5)).unwrap(), b"v1");
    }

    #[test]
    fn test_each_enumerates_committed_records() {
        let dir = TempDir::new().unwrap();
        let db = StrideDb::open(fast_config(&dir)).unwrap();

        for byte in 1..=5u8 {
            db.put(&key_of(byte), &[byte; 10]).unwrap();
        }
        thread::sleep(Duration::from_millis(200));

        let mut seen = Vec::new();
        db.each(|key, value| seen.push((key.to_vec(), value.to_vec())))
            .unwrap();
        assert_eq!(seen.len(), 5);
        for (key, value) in seen {
            assert_eq!(key, vec![value[0]; Key::BYTES]);
            assert_eq!(value.len(), 10);
        }
    }

    #[test]
    fn test_clear_empties_everything() {
        let dir = TempDir::new().unwrap();
        let db = StrideDb::open(fast_config(&dir)).unwrap();

        db.put(&key_of(1), b"gone").unwrap();
        thread::sleep(Duration::from_millis(100));
        db.clear().unwrap();

        assert!(matches!(db.get(&key_of(1)), Err(StrideError::KeyNotFound)));
        let mut count = 0;
        db.each(|_, _| count += 1).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = fast_config(&dir).block_size(16);
        assert!(matches!(
            StrideDb::open(config),
            Err(StrideError::InvalidConfig { .. })
        ));
    }
}
