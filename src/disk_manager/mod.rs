use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use log::debug;
use parking_lot::Mutex;

use crate::pages::{PageId, PAGE_SIZE};

/// Raw paged I/O over two files: the page-addressed data file and the
/// append-only log file (data path with its extension swapped for `.log`).
/// A successful `write_page`/`write_log` is durable on return.
pub struct DiskManager {
    db_file: Mutex<File>,
    log_file: Mutex<File>,
    db_path: PathBuf,
    next_page_id: AtomicI32,
    allocate_count: AtomicU32,
    deallocate_count: AtomicU32,
    /// Append offset of the log file.
    log_size: AtomicU64,
}

impl DiskManager {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let log_path = db_path.with_extension("log");
        let open = |path: &Path| -> Result<File> {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .with_context(|| format!("opening {}", path.display()))
        };

        let db_file = open(&db_path)?;
        let log_file = open(&log_path)?;

        let db_len = db_file.metadata()?.len();
        let log_len = log_file.metadata()?.len();
        debug!(
            "opened {} ({} pages) and {} ({} log bytes)",
            db_path.display(),
            db_len / PAGE_SIZE as u64,
            log_path.display(),
            log_len
        );

        Ok(Self {
            db_file: Mutex::new(db_file),
            log_file: Mutex::new(log_file),
            db_path,
            next_page_id: AtomicI32::new((db_len / PAGE_SIZE as u64) as PageId),
            allocate_count: AtomicU32::new(0),
            deallocate_count: AtomicU32::new(0),
            log_size: AtomicU64::new(log_len),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Hand out the next page id. Pages are never reclaimed here;
    /// deallocation is bookkeeping only.
    pub fn allocate_page(&self) -> PageId {
        self.allocate_count.fetch_add(1, Ordering::Relaxed);
        self.next_page_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn deallocate_page(&self, _page_id: PageId) {
        self.deallocate_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allocate_count(&self) -> u32 {
        self.allocate_count.load(Ordering::Relaxed)
    }

    pub fn deallocate_count(&self) -> u32 {
        self.deallocate_count.load(Ordering::Relaxed)
    }

    /// Read one page. A read past the end of the file yields a zero-filled
    /// page unless `outbound_is_error` demands failure; a short read
    /// zero-fills the tail.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8], outbound_is_error: bool) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);
        let offset = page_id as u64 * PAGE_SIZE as u64;

        let mut file = self.db_file.lock();
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            if outbound_is_error {
                bail!("read past end of data file: page {page_id}");
            }
            data.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = file.read(&mut data[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        if read < PAGE_SIZE {
            debug!("read less than a page for page {page_id}");
            data[read..].fill(0);
        }
        Ok(())
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);
        let offset = page_id as u64 * PAGE_SIZE as u64;

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Append to the log file.
    pub fn write_log(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut file = self.log_file.lock();
        let offset = self.log_size.load(Ordering::Acquire);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        self.log_size.store(offset + data.len() as u64, Ordering::Release);
        Ok(())
    }

    /// Read log bytes at `offset`; returns `false` at end of file. The
    /// unread tail of `data` is zero-filled so record scans terminate on a
    /// zero size field.
    pub fn read_log(&self, data: &mut [u8], offset: u64) -> Result<bool> {
        let mut file = self.log_file.lock();
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            return Ok(false);
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < data.len() {
            let n = file.read(&mut data[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        data[read..].fill(0);
        Ok(true)
    }

    pub fn log_size(&self) -> u64 {
        self.log_size.load(Ordering::Acquire)
    }
}
