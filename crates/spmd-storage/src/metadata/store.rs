//! Checksummed, transactional key-value store
//!
//! The store caches the decoded line set in memory. Reads refresh the cache
//! when it was invalidated; every mutation runs inside a transaction that
//! flushes the full line set once on success and writes the pre-transaction
//! snapshot back on failure.

use super::backing::MetadataBacking;
use parking_lot::ReentrantMutex;
use spmd_common::checksum::metadata_seal;
use spmd_common::{Error, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Key of the trailing checksum line
pub const CHECKSUM_KEY: &str = "_SHA_CKSUM";

/// Marker line written between the entries and the checksum
pub const EOF_MARKER: &str = "EOF";

#[derive(Default)]
struct State {
    entries: BTreeMap<String, String>,
    valid: bool,
    in_transaction: bool,
}

/// Sealed metadata of one domain
pub struct MetadataStore {
    backing: Box<dyn MetadataBacking>,
    state: ReentrantMutex<RefCell<State>>,
}

impl MetadataStore {
    /// Create a store over `backing`. Nothing is read until first access.
    pub fn new(backing: impl MetadataBacking + 'static) -> Self {
        Self {
            backing: Box::new(backing),
            state: ReentrantMutex::new(RefCell::new(State::default())),
        }
    }

    /// Name of the backing, for log lines
    #[must_use]
    pub fn name(&self) -> String {
        self.backing.name()
    }

    /// Whether the cache reflects the last read or flush
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state.lock().borrow().valid
    }

    /// Force the next access to re-read the backing
    pub fn invalidate(&self) {
        self.state.lock().borrow_mut().valid = false;
    }

    /// Raw value of `key`
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let guard = self.state.lock();
        self.ensure_valid(&guard)?;
        let value = guard.borrow().entries.get(key).cloned();
        Ok(value)
    }

    /// All keys in sorted order
    pub fn keys(&self) -> Result<Vec<String>> {
        let guard = self.state.lock();
        self.ensure_valid(&guard)?;
        let keys = guard.borrow().entries.keys().cloned().collect();
        Ok(keys)
    }

    /// Copy of the whole mapping
    pub fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        let guard = self.state.lock();
        self.ensure_valid(&guard)?;
        let entries = guard.borrow().entries.clone();
        Ok(entries)
    }

    /// Set one key
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        validate_entry(key, value)?;
        self.transaction(|store| {
            store.mutate(|entries| {
                entries.insert(key.to_string(), value.to_string());
            });
            Ok(())
        })
    }

    /// Set several keys in one flush
    pub fn update<I, K, V>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let items: Vec<(String, String)> = items
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        for (key, value) in &items {
            validate_entry(key, value)?;
        }
        self.transaction(|store| {
            store.mutate(|entries| entries.extend(items));
            Ok(())
        })
    }

    /// Remove one key, returning its previous value
    pub fn remove(&self, key: &str) -> Result<Option<String>> {
        self.transaction(|store| {
            let mut removed = None;
            store.mutate(|entries| removed = entries.remove(key));
            Ok(removed)
        })
    }

    /// Remove every key
    pub fn clear(&self) -> Result<()> {
        self.transaction(|store| {
            store.mutate(BTreeMap::clear);
            Ok(())
        })
    }

    /// Run `body` as one atomic unit.
    ///
    /// The outermost transaction snapshots the entries, runs `body`, and
    /// flushes once if anything changed. If `body` or the flush fails, the
    /// snapshot is written back and the original error is returned. A
    /// transaction started while one is active on this thread joins it.
    pub fn transaction<R>(&self, body: impl FnOnce(&Self) -> Result<R>) -> Result<R> {
        let guard = self.state.lock();
        if guard.borrow().in_transaction {
            debug!("reusing active transaction on {}", self.name());
            return body(self);
        }

        self.ensure_valid(&guard)?;
        let backup = {
            let mut state = guard.borrow_mut();
            state.in_transaction = true;
            state.entries.clone()
        };
        let _active = ActiveTransaction {
            store: self,
            state: &guard,
        };

        let result = body(self).and_then(|value| {
            let current = guard.borrow().entries.clone();
            if current != backup {
                self.flush(&current)?;
            }
            Ok(value)
        });

        if let Err(e) = &result {
            warn!("rolling back {} after error: {}", self.name(), e);
            let restored = self.flush(&backup);
            let mut state = guard.borrow_mut();
            state.entries = backup;
            if let Err(rollback_err) = restored {
                error!("rollback of {} failed: {}", self.name(), rollback_err);
                state.valid = false;
            }
        }

        result
    }

    /// Re-read the backing and verify its seal
    pub fn refresh(&self) -> Result<()> {
        let guard = self.state.lock();
        self.refresh_locked(&guard)
    }

    /// Serialize `entries` with a fresh seal in one backing write
    pub fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let mut lines: Vec<String> = entries.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let seal = metadata_seal(&lines);
        lines.push(EOF_MARKER.to_string());
        lines.push(format!("{CHECKSUM_KEY}={seal}"));
        self.backing.write_lines(&lines)?;
        debug!("flushed {} keys to {}", entries.len(), self.name());
        Ok(())
    }

    fn ensure_valid(&self, state: &RefCell<State>) -> Result<()> {
        if state.borrow().valid {
            return Ok(());
        }
        self.refresh_locked(state)
    }

    fn refresh_locked(&self, state: &RefCell<State>) -> Result<()> {
        let lines = self.backing.read_lines()?;
        let parsed = parse_lines(&lines, &self.name());

        match parsed.declared {
            Some(declared) => {
                let encoded: Vec<String> = parsed
                    .entries
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                let computed = metadata_seal(&encoded);
                if declared != computed {
                    warn!(
                        "metadata seal of {} is broken: declared {}, computed {}",
                        self.name(),
                        declared,
                        computed
                    );
                    state.borrow_mut().valid = false;
                    return Err(Error::SealBroken { declared, computed });
                }
            }
            // A marker without a seal means the seal line itself was damaged
            None if parsed.saw_eof => {
                state.borrow_mut().valid = false;
                return Err(Error::SealBroken {
                    declared: String::new(),
                    computed: String::new(),
                });
            }
            None if !parsed.entries.is_empty() => {
                warn!("metadata of {} has no seal, trusting legacy content", self.name());
            }
            None => {}
        }

        let mut state = state.borrow_mut();
        state.entries = parsed.entries;
        state.valid = true;
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) {
        let guard = self.state.lock();
        f(&mut guard.borrow_mut().entries);
    }
}

/// Ends the outermost transaction, also when its body unwinds.
///
/// Nothing is flushed before the body returns, so after a panic the backing
/// still holds the pre-transaction content; the cache is dropped so the next
/// access re-reads it.
struct ActiveTransaction<'a> {
    store: &'a MetadataStore,
    state: &'a RefCell<State>,
}

impl Drop for ActiveTransaction<'_> {
    fn drop(&mut self) {
        let Ok(mut state) = self.state.try_borrow_mut() else {
            return;
        };
        state.in_transaction = false;
        if std::thread::panicking() {
            warn!("transaction on {} panicked, dropping cache", self.store.name());
            state.valid = false;
        }
    }
}

struct Parsed {
    entries: BTreeMap<String, String>,
    declared: Option<String>,
    saw_eof: bool,
}

fn parse_lines(lines: &[String], name: &str) -> Parsed {
    let mut parsed = Parsed {
        entries: BTreeMap::new(),
        declared: None,
        saw_eof: false,
    };
    for line in lines {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if line == EOF_MARKER {
            parsed.saw_eof = true;
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("could not parse metadata line {:?} of {}", line, name);
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key == CHECKSUM_KEY {
            parsed.declared = Some(value.to_string());
        } else {
            parsed.entries.insert(key.to_string(), value.to_string());
        }
    }
    parsed
}

fn validate_entry(key: &str, value: &str) -> Result<()> {
    if key.is_empty()
        || key.contains(['=', '\n'])
        || key.trim() != key
        || key == CHECKSUM_KEY
        || key == EOF_MARKER
    {
        return Err(Error::KeyNotAllowed(key.to_string()));
    }
    if value.contains('\n') || value.trim() != value {
        return Err(Error::invalid_parameter(key, value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::backing::{FileMetadata, RangeMetadata};
    use crate::range::MemoryRange;
    use rand::Rng;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn file_store(dir: &tempfile::TempDir) -> MetadataStore {
        MetadataStore::new(FileMetadata::new(dir.path().join("metadata")))
    }

    /// Backing that can be told to fail its next writes
    struct FlakyBacking {
        inner: FileMetadata,
        fail: Arc<AtomicBool>,
    }

    impl MetadataBacking for FlakyBacking {
        fn read_lines(&self) -> Result<Vec<String>> {
            self.inner.read_lines()
        }

        fn write_lines(&self, lines: &[String]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::other("injected")));
            }
            self.inner.write_lines(lines)
        }

        fn name(&self) -> String {
            "flaky".to_string()
        }
    }

    #[test]
    fn test_flush_refresh_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        store
            .update([("SDUUID", "abc"), ("ROLE", "Regular"), ("DESCRIPTION", "caf\u{e9}")])
            .unwrap();

        let reopened = file_store(&dir);
        assert_eq!(reopened.snapshot().unwrap(), store.snapshot().unwrap());
        assert_eq!(reopened.get("ROLE").unwrap().as_deref(), Some("Regular"));

        let content = std::fs::read_to_string(dir.path().join("metadata")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[lines.len() - 2], EOF_MARKER);
        assert!(lines[lines.len() - 1].starts_with("_SHA_CKSUM="));
    }

    #[test]
    fn test_tamper_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata");
        let store = file_store(&dir);
        store
            .update([("CLASS", "Data"), ("POOL_UUID", ""), ("VERSION", "2")])
            .unwrap();

        let original = std::fs::read(&path).unwrap();
        let data_len = original
            .windows(4)
            .position(|w| w == b"EOF\n")
            .unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let mut tampered = original.clone();
            let pos = rng.gen_range(0..data_len);
            tampered[pos] ^= rng.gen_range(1..=255u8);
            std::fs::write(&path, &tampered).unwrap();

            let reader = file_store(&dir);
            assert!(
                matches!(reader.refresh(), Err(Error::SealBroken { .. })),
                "flip at {pos} went unnoticed"
            );
        }
    }

    #[test]
    fn test_damaged_seal_line_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata");
        file_store(&dir).set("A", "1").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("_SHA_CKSUM", "_SHA_CKSUX")).unwrap();
        assert!(matches!(
            file_store(&dir).refresh(),
            Err(Error::SealBroken { .. })
        ));
    }

    #[test]
    fn test_legacy_content_without_seal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("metadata"), "A=1\ngarbage\nB = 2\n").unwrap();
        let store = file_store(&dir);
        assert_eq!(store.get("A").unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("B").unwrap().as_deref(), Some("2"));
        assert_eq!(store.keys().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn test_failed_body_restores_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        store.update([("A", "1"), ("B", "2")]).unwrap();
        store.refresh().unwrap();
        let before = store.snapshot().unwrap();

        let result: Result<()> = store.transaction(|s| {
            s.set("A", "changed")?;
            s.remove("B")?;
            Err(Error::internal("abort"))
        });
        assert!(matches!(result, Err(Error::Internal(_))));

        store.refresh().unwrap();
        assert_eq!(store.snapshot().unwrap(), before);
    }

    #[test]
    fn test_panicking_body_ends_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        store.set("A", "1").unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            store.transaction(|s| -> Result<()> {
                s.set("A", "2")?;
                panic!("callback failed");
            })
        }));
        assert!(outcome.is_err());

        // The half-done change is gone and later writes reach the backing
        assert_eq!(store.get("A").unwrap().as_deref(), Some("1"));
        store.set("B", "1").unwrap();

        let reopened = file_store(&dir);
        assert_eq!(reopened.get("A").unwrap().as_deref(), Some("1"));
        assert_eq!(reopened.get("B").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_nested_transactions_flush_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata");
        let store = file_store(&dir);
        store.set("A", "1").unwrap();

        store
            .transaction(|s| {
                s.set("A", "2")?;
                s.transaction(|inner| inner.set("B", "3"))?;
                // Nothing reaches the backing before the outer commit
                let on_disk = std::fs::read_to_string(&path).unwrap();
                assert!(on_disk.contains("A=1"));
                assert!(!on_disk.contains("B=3"));
                Ok(())
            })
            .unwrap();

        let reopened = file_store(&dir);
        assert_eq!(reopened.get("A").unwrap().as_deref(), Some("2"));
        assert_eq!(reopened.get("B").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn test_failed_flush_rolls_back_memory() {
        let dir = tempfile::tempdir().unwrap();
        let fail = Arc::new(AtomicBool::new(false));
        let store = MetadataStore::new(FlakyBacking {
            inner: FileMetadata::new(dir.path().join("metadata")),
            fail: Arc::clone(&fail),
        });
        store.set("A", "1").unwrap();

        fail.store(true, Ordering::SeqCst);
        assert!(matches!(store.set("A", "2"), Err(Error::Io(_))));
        fail.store(false, Ordering::SeqCst);

        assert_eq!(store.get("A").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_invalidate_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let writer = file_store(&dir);
        let reader = file_store(&dir);
        writer.set("A", "1").unwrap();
        assert_eq!(reader.get("A").unwrap().as_deref(), Some("1"));

        writer.set("A", "2").unwrap();
        assert_eq!(reader.get("A").unwrap().as_deref(), Some("1"));
        reader.invalidate();
        assert_eq!(reader.get("A").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_rejects_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        assert!(matches!(store.set("A=B", "1"), Err(Error::KeyNotAllowed(_))));
        assert!(matches!(store.set(CHECKSUM_KEY, "1"), Err(Error::KeyNotAllowed(_))));
        assert!(matches!(
            store.set("A", "line\nbreak"),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_range_overflow_keeps_previous_content() {
        let range = MemoryRange::new(0);
        let store = MetadataStore::new(RangeMetadata::new(Arc::new(range.clone()), 0, 128));
        store.set("A", "1").unwrap();

        let result = store.set("B", &"x".repeat(200));
        assert!(matches!(result, Err(Error::MetadataOverflow { .. })));

        let reader = MetadataStore::new(RangeMetadata::new(Arc::new(range), 0, 128));
        assert_eq!(reader.snapshot().unwrap().len(), 1);
        assert_eq!(store.get("B").unwrap(), None);
    }

    #[test]
    fn test_concurrent_transactions_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(file_store(&dir));
        store.set("COUNTER", "0").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        store
                            .transaction(|s| {
                                let n: u32 = s.get("COUNTER")?.unwrap().parse().unwrap();
                                s.set("COUNTER", &(n + 1).to_string())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(file_store(&dir).get("COUNTER").unwrap().as_deref(), Some("40"));
    }
}
