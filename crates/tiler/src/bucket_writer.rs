//! Shared sink for routed point records.
//!
//! Submissions are sharded by key over a fixed set of writer threads. Each thread owns
//! its keys' files outright, so two writes to one bucket never race, and the bounded
//! queues push back on file jobs when the disks fall behind.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::job_pool::panic_message;
use crate::key::BucketKey;

const FILE_BUFFER_BYTES: usize = 64 << 10;

/// One bucket file left in scratch after the partition phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketFile {
    pub key: BucketKey,
    pub path: PathBuf,
    pub points: u64,
}

pub type BucketInventory = BTreeMap<BucketKey, BucketFile>;

/// Scratch file name of a bucket.
pub fn bucket_path(dir: &Path, key: BucketKey) -> PathBuf {
    dir.join(format!("{key}.bin"))
}

struct Batch {
    key: BucketKey,
    data: Vec<u8>,
}

#[derive(Default)]
struct Failure {
    failed: AtomicBool,
    first: Mutex<Option<Error>>,
}

impl Failure {
    fn record(&self, err: Error) {
        error!("{err}");
        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(err);
        }
        self.failed.store(true, Ordering::Release);
    }

    #[inline]
    fn is_set(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

pub struct BucketWriter {
    point_size: usize,
    senders: RwLock<Option<Vec<flume::Sender<Batch>>>>,
    workers: Mutex<Vec<JoinHandle<HashMap<BucketKey, u64>>>>,
    failure: Arc<Failure>,
    dir: PathBuf,
}

impl BucketWriter {
    /// Start `threads` writer threads appending `point_size`-byte records under `dir`.
    pub fn new(
        dir: &Path,
        point_size: usize,
        threads: usize,
        queue_depth: usize,
        max_open_files: usize,
    ) -> Result<Self> {
        if point_size == 0 {
            return Err(Error::Config("record size must be > 0".into()));
        }

        let failure = Arc::new(Failure::default());
        let mut senders = Vec::with_capacity(threads);
        let mut workers = Vec::with_capacity(threads);

        for tid in 0..threads.max(1) {
            let (tx, rx) = flume::bounded::<Batch>(queue_depth.max(1));
            let worker = Worker {
                dir: dir.to_path_buf(),
                point_size,
                max_open: max_open_files.max(1),
                failure: Arc::clone(&failure),
                open: HashMap::new(),
                order: VecDeque::new(),
                counts: HashMap::new(),
            };

            let handle = std::thread::Builder::new()
                .name(format!("bucket-writer-{tid}"))
                .spawn(move || worker.run(rx))
                .map_err(|e| Error::io("spawn bucket writer thread", e))?;

            senders.push(tx);
            workers.push(handle);
        }

        Ok(Self {
            point_size,
            senders: RwLock::new(Some(senders)),
            workers: Mutex::new(workers),
            failure,
            dir: dir.to_path_buf(),
        })
    }

    #[inline]
    pub fn point_size(&self) -> usize {
        self.point_size
    }

    /// Queue whole records for `key`. Blocks while that key's writer queue is full.
    pub fn submit(&self, key: BucketKey, data: Vec<u8>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        if data.len() % self.point_size != 0 {
            return Err(Error::Write {
                key,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "{} bytes is not a whole number of {}-byte records",
                        data.len(),
                        self.point_size
                    ),
                ),
            });
        }

        if self.failure.is_set() {
            return Err(Error::Write {
                key,
                source: io::Error::new(io::ErrorKind::Other, "an earlier bucket write failed"),
            });
        }

        // Clone the sender so `stop` is never held up by a blocked submitter.
        let sender = {
            let senders = self.senders.read();
            let senders = senders.as_ref().ok_or(Error::WriterStopped)?;
            senders[key.shard(senders.len())].clone()
        };

        sender
            .send(Batch { key, data })
            .map_err(|_| Error::WriterStopped)
    }

    /// Close the queues, wait for every writer to drain and close its files, and
    /// report the first write error or the buckets written.
    pub fn stop(&self) -> Result<BucketInventory> {
        let senders = self.senders.write().take().ok_or(Error::WriterStopped)?;
        drop(senders);

        let workers = std::mem::take(&mut *self.workers.lock());
        let mut inventory = BucketInventory::new();

        // Join every thread before reporting, so no writer outlives the call.
        for handle in workers {
            let name = handle.thread().name().unwrap_or("bucket-writer").to_string();
            let counts = match handle.join() {
                Ok(counts) => counts,
                Err(payload) => {
                    self.failure.record(Error::JobPanicked {
                        job: name,
                        message: panic_message(payload.as_ref()),
                    });
                    continue;
                }
            };

            for (key, points) in counts {
                inventory.insert(
                    key,
                    BucketFile {
                        key,
                        path: bucket_path(&self.dir, key),
                        points,
                    },
                );
            }
        }

        if let Some(err) = self.failure.first.lock().take() {
            return Err(err);
        }

        debug!(
            "bucket writer stopped: {} buckets, {} points",
            inventory.len(),
            inventory.values().map(|b| b.points).sum::<u64>()
        );

        Ok(inventory)
    }
}

/// State owned by one writer thread.
struct Worker {
    dir: PathBuf,
    point_size: usize,
    max_open: usize,
    failure: Arc<Failure>,
    open: HashMap<BucketKey, BufWriter<File>>,
    // open order, oldest first
    order: VecDeque<BucketKey>,
    counts: HashMap<BucketKey, u64>,
}

impl Worker {
    fn run(mut self, rx: flume::Receiver<Batch>) -> HashMap<BucketKey, u64> {
        // Ends once every sender is gone and the queue is empty.
        for batch in rx.iter() {
            // Keep draining after a failure so submitters never block on a dead queue.
            if self.failure.is_set() {
                continue;
            }

            match self.append(batch.key, &batch.data) {
                Ok(()) => {
                    *self.counts.entry(batch.key).or_insert(0) +=
                        (batch.data.len() / self.point_size) as u64;
                }
                Err((key, source)) => self.failure.record(Error::Write { key, source }),
            }
        }

        for (key, mut file) in self.open.drain() {
            if let Err(source) = file.flush() {
                self.failure.record(Error::Write { key, source });
            }
        }

        self.counts
    }

    fn append(&mut self, key: BucketKey, data: &[u8]) -> Result<(), (BucketKey, io::Error)> {
        if !self.open.contains_key(&key) {
            while self.open.len() >= self.max_open {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                if let Some(mut file) = self.open.remove(&oldest) {
                    file.flush().map_err(|e| (oldest, e))?;
                }
            }

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(bucket_path(&self.dir, key))
                .map_err(|e| (key, e))?;

            self.open
                .insert(key, BufWriter::with_capacity(FILE_BUFFER_BYTES, file));
            self.order.push_back(key);
        }

        match self.open.get_mut(&key) {
            Some(file) => file.write_all(data).map_err(|e| (key, e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::resume_unwind;

    const POINT_SIZE: usize = 12;

    fn records(tag: u8, n: usize) -> Vec<u8> {
        vec![tag; POINT_SIZE * n]
    }

    fn tmp() -> Result<tempfile::TempDir> {
        tempfile::tempdir().map_err(|e| Error::io("tempdir", e))
    }

    #[test]
    fn concurrent_submissions_land_whole() -> Result<()> {
        let dir = tmp()?;
        // One open file per thread forces constant eviction and reopening.
        let writer = Arc::new(BucketWriter::new(dir.path(), POINT_SIZE, 3, 2, 1)?);

        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || -> Result<()> {
                    for i in 0..50i32 {
                        let key = BucketKey::new(i % 5, 0, (i + t as i32) % 2, 0);
                        writer.submit(key, records(t * 16 + (i % 16) as u8, 1 + (i % 3) as usize))?;
                    }
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap_or_else(|e| resume_unwind(e))?;
        }

        let inventory = writer.stop()?;
        assert_eq!(inventory.len(), 10);

        let mut expected_total = 0u64;
        for _t in 0..8 {
            for i in 0..50u64 {
                expected_total += 1 + i % 3;
            }
        }

        let mut total = 0;
        for bucket in inventory.values() {
            let bytes = std::fs::read(&bucket.path).map_err(|e| Error::io("read bucket", e))?;
            assert_eq!(bytes.len() as u64, bucket.points * POINT_SIZE as u64);

            // A torn write would mix tags inside one record.
            for record in bytes.chunks_exact(POINT_SIZE) {
                assert!(record.iter().all(|b| *b == record[0]));
            }
            total += bucket.points;
        }
        assert_eq!(total, expected_total);

        Ok(())
    }

    #[test]
    fn rejects_partial_records_and_use_after_stop() -> Result<()> {
        let dir = tmp()?;
        let writer = BucketWriter::new(dir.path(), POINT_SIZE, 1, 4, 4)?;
        let key = BucketKey::new(0, 0, 0, 0);

        assert!(matches!(
            writer.submit(key, vec![0; POINT_SIZE + 1]),
            Err(Error::Write { .. })
        ));

        writer.submit(key, records(1, 2))?;
        let inventory = writer.stop()?;
        assert_eq!(inventory[&key].points, 2);
        assert_eq!(inventory[&key].path, dir.path().join("0-0-0-0.bin"));

        assert!(matches!(writer.submit(key, records(1, 1)), Err(Error::WriterStopped)));
        assert!(matches!(writer.stop(), Err(Error::WriterStopped)));

        Ok(())
    }

    #[test]
    fn crashed_writer_thread_is_an_error_after_all_joins() -> Result<()> {
        let dir = tmp()?;
        let writer = BucketWriter::new(dir.path(), POINT_SIZE, 1, 4, 4)?;
        let key = BucketKey::new(0, 0, 0, 0);

        let crashed = std::thread::Builder::new()
            .name("bucket-writer-crashed".into())
            .spawn(|| -> HashMap<BucketKey, u64> { panic!("disk went away") })
            .map_err(|e| Error::io("spawn", e))?;
        writer.workers.lock().push(crashed);

        writer.submit(key, records(3, 2))?;

        match writer.stop() {
            Err(Error::JobPanicked { job, message }) => {
                assert_eq!(job, "bucket-writer-crashed");
                assert_eq!(message, "disk went away");
            }
            other => panic!("expected a panicked writer, got {other:?}"),
        }

        // The healthy thread still drained and closed its bucket.
        let bytes = std::fs::read(bucket_path(dir.path(), key)).map_err(|e| Error::io("read", e))?;
        assert_eq!(bytes.len(), 2 * POINT_SIZE);

        Ok(())
    }

    #[test]
    fn write_failure_surfaces_at_stop() -> Result<()> {
        let dir = tmp()?;
        let missing = dir.path().join("does-not-exist");
        let writer = BucketWriter::new(&missing, POINT_SIZE, 2, 4, 4)?;

        // The submit itself only queues; the open fails on the writer thread.
        let _ = writer.submit(BucketKey::new(1, 2, 3, 0), records(9, 1));

        match writer.stop() {
            Err(Error::Write { key, .. }) => assert_eq!(key, BucketKey::new(1, 2, 3, 0)),
            other => panic!("expected a write error, got {other:?}"),
        }

        Ok(())
    }
}
