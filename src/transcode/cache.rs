//! Persistent read-through cache of probe records keyed by absolute file path.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::transcode::anomaly::Anomaly;
use crate::transcode::probe::{ProbeRecord, Prober};
use crate::{append_extension_to_path, path_to_string, print_warning};

/// Default number of dirty writes between periodic flushes.
pub const DEFAULT_FLUSH_EVERY: usize = 100;

const PROGRESS_BAR_CHARS: &str = "=>-";
const PROGRESS_BAR_TEMPLATE: &str = "[{elapsed_precise}] {bar:80.magenta/blue} {pos}/{len} {percent}%";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to read cache file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse cache file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to rename {} to {}: {source}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to build probe worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("interrupted after probing {completed} of {requested} files")]
    Interrupted { completed: usize, requested: usize },
}

/// Counts from a bulk population run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Valid entries served without probing.
    pub hits: usize,
    /// Files probed successfully.
    pub probed: usize,
    /// Files whose probe failed.
    pub failed: usize,
}

/// Result of checking the in-memory map for a path.
enum Lookup {
    Hit(ProbeRecord),
    /// Entry was a retryable probe failure and has been removed.
    Retry(Anomaly),
    Miss,
}

#[derive(Debug, Default)]
struct CacheState {
    records: BTreeMap<String, ProbeRecord>,
    dirty: usize,
}

/// Probe record cache persisted as a single JSON file.
///
/// All map mutations go through one mutex.
/// Probing and disk writes happen outside it.
pub struct MetadataCache {
    path: PathBuf,
    prober: Arc<dyn Prober>,
    state: Mutex<CacheState>,
    flush_lock: Mutex<()>,
    flush_every: usize,
}

impl MetadataCache {
    /// Load the cache file at `path`, dropping invalid entries.
    ///
    /// A missing file starts an empty cache.
    /// An unreadable or corrupt file is reported and replaced on the next flush.
    pub fn open(path: impl Into<PathBuf>, prober: Arc<dyn Prober>) -> Self {
        let path = path.into();
        let state = match Self::load(&path) {
            Ok(state) => state,
            Err(error) => {
                print_warning!("{error}. Starting with an empty cache.");
                CacheState {
                    records: BTreeMap::new(),
                    dirty: 1,
                }
            }
        };
        Self {
            path,
            prober,
            state: Mutex::new(state),
            flush_lock: Mutex::new(()),
            flush_every: DEFAULT_FLUSH_EVERY,
        }
    }

    /// Set how many dirty writes trigger a periodic flush.
    #[must_use]
    pub fn with_flush_every(mut self, flush_every: usize) -> Self {
        self.flush_every = flush_every.max(1);
        self
    }

    fn load(path: &Path) -> Result<CacheState, CacheError> {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(CacheState::default()),
            Err(source) => {
                return Err(CacheError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let raw: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&contents).map_err(|source| CacheError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut state = CacheState::default();
        for (key, value) in raw {
            let Ok(record) = serde_json::from_value::<ProbeRecord>(value) else {
                state.dirty += 1;
                continue;
            };
            // Retryable placeholders are kept so their counters survive until the next access.
            if file_size(Path::new(&key)) == Some(record.size_bytes) {
                state.records.insert(key, record);
            } else {
                state.dirty += 1;
            }
        }
        Ok(state)
    }

    /// Location of the cache file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Number of changes not yet written to disk.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.lock().dirty
    }

    /// Snapshot of all cached entries.
    #[must_use]
    pub fn records(&self) -> Vec<(String, ProbeRecord)> {
        self.lock()
            .records
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect()
    }

    /// Cached record without validation or probing.
    #[must_use]
    pub fn peek(&self, path: &Path) -> Option<ProbeRecord> {
        self.lock().records.get(&cache_key(path)).cloned()
    }

    /// Stored anomaly for a path.
    #[must_use]
    pub fn anomaly(&self, path: &Path) -> Option<Anomaly> {
        self.lock().records.get(&cache_key(path)).and_then(|record| record.anomaly)
    }

    /// Remove the entry for a path.
    pub fn invalidate(&self, path: &Path) -> bool {
        let mut state = self.lock();
        let removed = state.records.remove(&cache_key(path)).is_some();
        if removed {
            state.dirty += 1;
        }
        removed
    }

    /// Return the valid cached record, probing the file on a miss.
    ///
    /// A failed probe escalates the probe-failure counter, flushes, and returns a placeholder carrying it.
    pub fn get(&self, path: &Path) -> ProbeRecord {
        let key = cache_key(path);
        let Some(size) = file_size(path) else {
            let prior = self.remove_entry(&key);
            return ProbeRecord::placeholder(Anomaly::escalate(prior, Anomaly::PROBE_FAILURE), 0);
        };

        let prior = match self.lookup(&key, size) {
            Lookup::Hit(record) => return record,
            Lookup::Retry(anomaly) => Some(anomaly),
            Lookup::Miss => None,
        };

        let record = self.probe_and_record(key, path, prior, size);
        if record.is_placeholder() {
            // Failure counters must survive a crash.
            if let Err(error) = self.flush() {
                print_warning!("{error}");
            }
        } else {
            self.flush_if_due();
        }
        record
    }

    /// Update the anomaly of a path and flush immediately.
    ///
    /// Failure anomalies of the stored family escalate, other values replace, `None` clears.
    /// Returns the value now stored.
    ///
    /// # Errors
    /// Returns an error if the cache file cannot be written.
    pub fn set_anomaly(&self, path: &Path, anomaly: Option<Anomaly>) -> Result<Option<Anomaly>, CacheError> {
        let key = cache_key(path);
        let size = file_size(path);
        let stored = {
            let mut state = self.lock();
            let current = state.records.get(&key).and_then(|record| record.anomaly);
            let next = anomaly.map(|value| Anomaly::escalate(current, value));
            if let Some(record) = state.records.get_mut(&key) {
                record.anomaly = next;
            } else if let (Some(value), Some(size)) = (next, size) {
                state.records.insert(key, ProbeRecord::placeholder(value, size));
            }
            state.dirty += 1;
            next
        };
        self.flush()?;
        Ok(stored)
    }

    /// Resolve all paths, probing misses concurrently with `workers` threads.
    ///
    /// Results are merged as they complete and flushed periodically.
    /// Once `abort` is set no new probe starts; the cache is flushed and
    /// [`CacheError::Interrupted`] is returned.
    ///
    /// # Errors
    /// Returns an error if the worker pool cannot be created, the final flush fails,
    /// or the run was interrupted.
    pub fn batch_get_or_probe(
        &self,
        paths: &[PathBuf],
        workers: usize,
        abort: &AtomicBool,
    ) -> Result<BatchOutcome, CacheError> {
        let mut outcome = BatchOutcome::default();
        let mut misses: Vec<(&Path, Option<Anomaly>, u64)> = Vec::new();
        for path in paths {
            let key = cache_key(path);
            let Some(size) = file_size(path) else {
                self.remove_entry(&key);
                outcome.failed += 1;
                continue;
            };
            match self.lookup(&key, size) {
                Lookup::Hit(_) => outcome.hits += 1,
                Lookup::Retry(anomaly) => misses.push((path, Some(anomaly), size)),
                Lookup::Miss => misses.push((path, None, size)),
            }
        }

        if misses.is_empty() {
            self.store()?;
            return Ok(outcome);
        }

        let pool = rayon::ThreadPoolBuilder::new().num_threads(workers.max(1)).build()?;

        let progress_bar = batch_progress_bar(misses.len());

        let probed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        pool.install(|| {
            misses.par_iter().for_each(|(path, prior, size)| {
                if abort.load(Ordering::SeqCst) {
                    return;
                }
                let record = self.probe_and_record(cache_key(path), path, *prior, *size);
                if record.is_placeholder() {
                    failed.fetch_add(1, Ordering::Relaxed);
                } else {
                    probed.fetch_add(1, Ordering::Relaxed);
                }
                progress_bar.inc(1);
                self.flush_if_due();
            });
        });
        progress_bar.finish_and_clear();

        outcome.probed = probed.into_inner();
        outcome.failed += failed.into_inner();

        self.store()?;

        if abort.load(Ordering::SeqCst) {
            return Err(CacheError::Interrupted {
                completed: outcome.hits + outcome.probed + outcome.failed,
                requested: paths.len(),
            });
        }
        Ok(outcome)
    }

    /// Flush only if there are unsaved changes.
    ///
    /// # Errors
    /// Returns an error if the cache file cannot be written.
    pub fn store(&self) -> Result<bool, CacheError> {
        if self.dirty_count() == 0 {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Atomically write the whole cache to disk.
    ///
    /// # Errors
    /// Returns an error if serialization, the temp file write, or the rename fails.
    pub fn flush(&self) -> Result<(), CacheError> {
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.flush_locked()
    }

    fn flush_locked(&self) -> Result<(), CacheError> {
        let (temp_path, written) = self.stage()?;
        self.commit(&temp_path)?;
        let mut state = self.lock();
        state.dirty = state.dirty.saturating_sub(written);
        Ok(())
    }

    /// Serialize a snapshot into the temp file next to the cache file.
    ///
    /// Returns the temp path and the dirty count covered by the snapshot.
    fn stage(&self) -> Result<(PathBuf, usize), CacheError> {
        let (json, written) = {
            let state = self.lock();
            (serde_json::to_vec_pretty(&state.records)?, state.dirty)
        };

        let temp_path = append_extension_to_path(self.path.clone(), "tmp");
        if let Some(parent) = temp_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| CacheError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&temp_path, json).map_err(|source| CacheError::Write {
            path: temp_path.clone(),
            source,
        })?;
        Ok((temp_path, written))
    }

    fn commit(&self, temp_path: &Path) -> Result<(), CacheError> {
        fs::rename(temp_path, &self.path).map_err(|source| CacheError::Rename {
            from: temp_path.to_path_buf(),
            to: self.path.clone(),
            source,
        })
    }

    /// Periodic flush from a worker; skipped when another flush is in progress.
    fn flush_if_due(&self) {
        if self.dirty_count() < self.flush_every {
            return;
        }
        let Ok(_guard) = self.flush_lock.try_lock() else {
            return;
        };
        if let Err(error) = self.flush_locked() {
            print_warning!("{error}");
        }
    }

    fn lookup(&self, key: &str, size: u64) -> Lookup {
        let mut state = self.lock();
        let Some(record) = state.records.get(key) else {
            return Lookup::Miss;
        };
        if record.size_bytes != size {
            state.records.remove(key);
            state.dirty += 1;
            return Lookup::Miss;
        }
        match record.anomaly {
            Some(anomaly) if anomaly.is_retryable() => {
                state.records.remove(key);
                state.dirty += 1;
                Lookup::Retry(anomaly)
            }
            _ => Lookup::Hit(record.clone()),
        }
    }

    fn probe_and_record(&self, key: String, path: &Path, prior: Option<Anomaly>, size: u64) -> ProbeRecord {
        let record = self.prober.probe(path).unwrap_or_else(|_| {
            ProbeRecord::placeholder(Anomaly::escalate(prior, Anomaly::PROBE_FAILURE), size)
        });
        let mut state = self.lock();
        state.records.insert(key, record.clone());
        state.dirty += 1;
        record
    }

    fn remove_entry(&self, key: &str) -> Option<Anomaly> {
        let mut state = self.lock();
        let removed = state.records.remove(key)?;
        state.dirty += 1;
        removed.anomaly
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("path", &self.path)
            .field("entries", &self.len())
            .field("flush_every", &self.flush_every)
            .finish_non_exhaustive()
    }
}

/// Progress bar for bulk probing, hidden in tests.
fn batch_progress_bar(len: usize) -> ProgressBar {
    if cfg!(test) {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar().template(PROGRESS_BAR_TEMPLATE) {
        pb.set_style(style.progress_chars(PROGRESS_BAR_CHARS));
    }
    pb
}

/// Key used in the cache file for a path.
#[must_use]
pub fn cache_key(path: &Path) -> String {
    path_to_string(path)
}

/// Current on-disk size, or `None` if the file is gone.
#[must_use]
pub fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(std::fs::Metadata::is_file).map(|meta| meta.len())
}
