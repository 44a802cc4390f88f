use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::disk_manager::DiskManager;
use crate::pages::{Lsn, INVALID_LSN, PAGE_SIZE};
use crate::recovery::log_record::LogRecord;

pub const DEFAULT_LOG_TIMEOUT: Duration = Duration::from_millis(40);

/// Conventional sizing: one spare page over the pool size.
pub fn default_log_buffer_size(pool_size: usize) -> usize {
    (pool_size + 1) * PAGE_SIZE
}

/// Double-buffered group-commit log writer. Appenders fill the active
/// buffer under the mutex; the background flusher swaps buffers (on demand
/// or on timeout) and writes the full one out, so appends continue while
/// the disk write is in flight.
///
/// Dropping the manager stops the flusher *without* draining the active
/// buffer, so records that were never forced behave exactly like a crash.
pub struct LogManager {
    core: Arc<LogCore>,
    flush_thread: Option<JoinHandle<()>>,
}

struct LogCore {
    inner: Mutex<LogBuffers>,
    /// Wakes the flusher.
    flush_cv: Condvar,
    /// Wakes appenders waiting for space and committers waiting for
    /// durability.
    append_cv: Condvar,
    /// Every record with `lsn <= persistent_lsn` is on disk.
    persistent_lsn: AtomicI32,
    enabled: AtomicBool,
    disk: Arc<DiskManager>,
    timeout: Duration,
}

struct LogBuffers {
    log_buffer: Vec<u8>,
    flush_buffer: Vec<u8>,
    buffer_size: usize,
    next_lsn: Lsn,
    need_flush: bool,
}

impl LogManager {
    pub fn new(disk: Arc<DiskManager>, buffer_size: usize, timeout: Duration) -> Arc<Self> {
        let core = Arc::new(LogCore {
            inner: Mutex::new(LogBuffers {
                log_buffer: Vec::with_capacity(buffer_size),
                flush_buffer: Vec::with_capacity(buffer_size),
                buffer_size,
                // a zeroed page reads back LSN 0, so real LSNs start above it
                next_lsn: 1,
                need_flush: false,
            }),
            flush_cv: Condvar::new(),
            append_cv: Condvar::new(),
            persistent_lsn: AtomicI32::new(INVALID_LSN),
            enabled: AtomicBool::new(true),
            disk,
            timeout,
        });

        let flush_thread = {
            let core = core.clone();
            std::thread::spawn(move || core.flush_loop())
        };
        debug!("log flusher started, buffer size {buffer_size}");

        Arc::new(Self {
            core,
            flush_thread: Some(flush_thread),
        })
    }

    /// Assign the next LSN and serialize the record into the active buffer,
    /// blocking while both buffers are full.
    pub fn append_record(&self, record: &mut LogRecord) -> Lsn {
        let core = &self.core;
        let mut inner = core.inner.lock();
        let size = record.size() as usize;
        assert!(size <= inner.buffer_size, "log record exceeds the log buffer");

        while inner.log_buffer.len() + size > inner.buffer_size {
            inner.need_flush = true;
            core.flush_cv.notify_one();
            core.append_cv.wait(&mut inner);
        }

        record.lsn = inner.next_lsn;
        inner.next_lsn += 1;
        let bytes = record.to_bytes();
        inner.log_buffer.extend_from_slice(&bytes);
        record.lsn
    }

    /// Wait until everything up to `lsn` is durable. `force` triggers a
    /// buffer swap immediately; without it the commit path just waits for
    /// the timeout-driven flusher (amortized group commit).
    pub fn flush(&self, lsn: Lsn, force: bool) {
        if lsn == INVALID_LSN {
            return;
        }
        let core = &self.core;
        let mut inner = core.inner.lock();
        while core.persistent_lsn.load(Ordering::Acquire) < lsn {
            if !core.enabled.load(Ordering::Acquire) {
                warn!("flush({lsn}) after the log manager stopped");
                return;
            }
            if force {
                inner.need_flush = true;
                core.flush_cv.notify_one();
            }
            core.append_cv.wait(&mut inner);
        }
    }

    pub fn persistent_lsn(&self) -> Lsn {
        self.core.persistent_lsn.load(Ordering::Acquire)
    }

    pub fn next_lsn(&self) -> Lsn {
        self.core.inner.lock().next_lsn
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        self.core.enabled.store(false, Ordering::Release);
        self.core.flush_cv.notify_all();
        self.core.append_cv.notify_all();
        if let Some(handle) = self.flush_thread.take() {
            let _ = handle.join();
        }
        debug!("log flusher stopped");
    }
}

impl LogCore {
    fn flush_loop(self: Arc<Self>) {
        loop {
            let mut inner = self.inner.lock();
            if !inner.need_flush {
                // a timeout wake swaps on its own, picking up whatever the
                // active buffer accumulated
                self.flush_cv.wait_for(&mut inner, self.timeout);
            }
            if !self.enabled.load(Ordering::Acquire) {
                return;
            }

            // swap: the (empty) flush buffer becomes the new active buffer
            let reuse = std::mem::take(&mut inner.flush_buffer);
            let data = std::mem::replace(&mut inner.log_buffer, reuse);
            let flushed_lsn = inner.next_lsn - 1;
            inner.need_flush = false;
            self.append_cv.notify_all();
            drop(inner);

            if !data.is_empty() {
                if let Err(e) = self.disk.write_log(&data) {
                    warn!("log flush failed: {e}");
                }
            }
            self.persistent_lsn.store(flushed_lsn, Ordering::Release);

            let mut inner = self.inner.lock();
            let mut data = data;
            data.clear();
            inner.flush_buffer = data;
            drop(inner);
            self.append_cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::log_record::{LogPayload, LOG_HEADER_SIZE};
    use crate::test_utils::test_path;

    fn test_log(path: &str) -> (Arc<DiskManager>, Arc<LogManager>) {
        let disk = Arc::new(DiskManager::new(format!("{path}/test.db")).unwrap());
        let log = LogManager::new(disk.clone(), default_log_buffer_size(8), DEFAULT_LOG_TIMEOUT);
        (disk, log)
    }

    #[test]
    fn test_lsn_assignment() {
        let path = test_path();
        let (_disk, log) = test_log(&path);

        let mut r1 = LogRecord::new(0, INVALID_LSN, LogPayload::Begin);
        let mut r2 = LogRecord::new(0, 1, LogPayload::Commit);
        assert_eq!(log.append_record(&mut r1), 1);
        assert_eq!(log.append_record(&mut r2), 2);

        drop(log);
        std::fs::remove_dir_all(path).unwrap();
    }

    #[test]
    fn test_force_flush_is_durable() {
        let path = test_path();
        let (disk, log) = test_log(&path);

        let mut record = LogRecord::new(3, INVALID_LSN, LogPayload::Begin);
        let lsn = log.append_record(&mut record);
        log.flush(lsn, true);
        assert!(log.persistent_lsn() >= lsn);

        let mut buf = vec![0u8; 64];
        assert!(disk.read_log(&mut buf, 0).unwrap());
        let parsed = LogRecord::from_bytes(&buf).unwrap();
        assert_eq!(parsed, record);

        drop(log);
        std::fs::remove_dir_all(path).unwrap();
    }

    #[test]
    fn test_group_commit_without_force() {
        let path = test_path();
        let (_disk, log) = test_log(&path);

        let mut record = LogRecord::new(1, INVALID_LSN, LogPayload::Begin);
        let lsn = log.append_record(&mut record);
        // the timeout-driven flusher must eventually pick this up
        log.flush(lsn, false);
        assert!(log.persistent_lsn() >= lsn);

        drop(log);
        std::fs::remove_dir_all(path).unwrap();
    }

    #[test]
    fn test_swap_when_buffer_fills() {
        let path = test_path();
        let disk = Arc::new(DiskManager::new(format!("{path}/test.db")).unwrap());
        // tiny buffer: three Begin records fill it
        let log = LogManager::new(disk.clone(), LOG_HEADER_SIZE * 3, DEFAULT_LOG_TIMEOUT);

        let mut last = 0;
        for _ in 0..10 {
            let mut record = LogRecord::new(0, INVALID_LSN, LogPayload::Begin);
            last = log.append_record(&mut record);
        }
        log.flush(last, true);
        assert_eq!(disk.log_size(), 10 * LOG_HEADER_SIZE as u64);

        drop(log);
        std::fs::remove_dir_all(path).unwrap();
    }

    #[test]
    fn test_drop_without_force_loses_tail() {
        let path = test_path();
        let disk = Arc::new(DiskManager::new(format!("{path}/test.db")).unwrap());
        // timeout far beyond the test so only forced flushes hit disk
        let log = LogManager::new(
            disk.clone(),
            default_log_buffer_size(8),
            Duration::from_secs(60),
        );

        let mut r1 = LogRecord::new(0, INVALID_LSN, LogPayload::Begin);
        let lsn = log.append_record(&mut r1);
        log.flush(lsn, true);

        // appended but never forced; shutdown must not flush it
        let mut r2 = LogRecord::new(0, lsn, LogPayload::Commit);
        log.append_record(&mut r2);
        drop(log);

        assert_eq!(disk.log_size(), LOG_HEADER_SIZE as u64);
        std::fs::remove_dir_all(path).unwrap();
    }
}
