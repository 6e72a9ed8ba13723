//! The page store: a page-addressable block device (C1).
//!
//! No caching and no ordering guarantees across pages beyond `sync`. The
//! engine only ever talks to the trait; which implementation backs it is
//! decided once at open time.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::debug;

use crate::error::SmallError;
use crate::types::{PageId, SmallResult};

pub trait PageStore: Send + Sync {
    fn page_size(&self) -> usize;

    fn page_count(&self) -> PageId;

    /// Grow or truncate the device to exactly `count` pages.
    fn set_page_count(&self, count: PageId) -> SmallResult;

    /// Read page `pid` into `buf` (whose length is the page size).
    /// Reading past the current page count is an error.
    fn read_page(&self, pid: PageId, buf: &mut [u8]) -> SmallResult;

    /// Write page `pid` from `buf`, growing the device if needed.
    fn write_page(&self, pid: PageId, buf: &[u8]) -> SmallResult;

    /// Durably flush all previous writes.
    fn sync(&self) -> SmallResult;

    fn is_read_only(&self) -> bool;
}

fn check_read_bounds(pid: PageId, count: PageId) -> SmallResult {
    if pid >= count {
        return Err(SmallError::corrupt(&format!(
            "read of page {} beyond page count {}",
            pid, count
        )));
    }
    Ok(())
}

// ------------------------------------------------------------------
// single file
// ------------------------------------------------------------------

pub struct FilePageStore {
    file: Mutex<File>,
    page_size: usize,
    page_count: AtomicU64,
    read_only: bool,
}

impl FilePageStore {
    pub fn open<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        read_only: bool,
    ) -> Result<Self, SmallError> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        let page_count = len / page_size as u64;
        debug!(
            "page store opened, path: {:?}, pages: {}",
            path.as_ref(),
            page_count
        );
        Ok(Self {
            file: Mutex::new(file),
            page_size,
            page_count: AtomicU64::new(page_count),
            read_only,
        })
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> PageId {
        self.page_count.load(Ordering::Acquire)
    }

    fn set_page_count(&self, count: PageId) -> SmallResult {
        let file = self.file.lock().unwrap();
        file.set_len(count * self.page_size as u64)?;
        self.page_count.store(count, Ordering::Release);
        Ok(())
    }

    fn read_page(&self, pid: PageId, buf: &mut [u8]) -> SmallResult {
        check_read_bounds(pid, self.page_count())?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(pid * self.page_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_page(&self, pid: PageId, buf: &[u8]) -> SmallResult {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(pid * self.page_size as u64))?;
        file.write_all(buf)?;
        self.page_count.fetch_max(pid + 1, Ordering::AcqRel);
        Ok(())
    }

    fn sync(&self) -> SmallResult {
        let file = self.file.lock().unwrap();
        file.sync_data()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

// ------------------------------------------------------------------
// striped across several files
// ------------------------------------------------------------------

/// Pages are striped round-robin: page `p` lives in file `p % n` at file
/// offset `(p / n) * page_size`. Striping is invisible above this layer.
pub struct StripedPageStore {
    files: Vec<Mutex<File>>,
    page_size: usize,
    page_count: AtomicU64,
    read_only: bool,
}

impl StripedPageStore {
    pub fn open<P: AsRef<Path>>(
        paths: &[P],
        page_size: usize,
        read_only: bool,
    ) -> Result<Self, SmallError> {
        assert!(!paths.is_empty());
        let mut files = Vec::with_capacity(paths.len());
        let mut total_pages: u64 = 0;
        for path in paths {
            let file = OpenOptions::new()
                .read(true)
                .write(!read_only)
                .create(!read_only)
                .open(path.as_ref())?;
            total_pages += file.metadata()?.len() / page_size as u64;
            files.push(Mutex::new(file));
        }
        Ok(Self {
            files,
            page_size,
            page_count: AtomicU64::new(total_pages),
            read_only,
        })
    }

    fn locate(&self, pid: PageId) -> (usize, u64) {
        let stripe = (pid % self.files.len() as u64) as usize;
        let offset = (pid / self.files.len() as u64) * self.page_size as u64;
        (stripe, offset)
    }
}

impl PageStore for StripedPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> PageId {
        self.page_count.load(Ordering::Acquire)
    }

    fn set_page_count(&self, count: PageId) -> SmallResult {
        let stripes = self.files.len() as u64;
        for (i, file) in self.files.iter().enumerate() {
            // stripes below (count % n) keep one extra page
            let pages = count / stripes + if (i as u64) < count % stripes { 1 } else { 0 };
            file.lock().unwrap().set_len(pages * self.page_size as u64)?;
        }
        self.page_count.store(count, Ordering::Release);
        Ok(())
    }

    fn read_page(&self, pid: PageId, buf: &mut [u8]) -> SmallResult {
        check_read_bounds(pid, self.page_count())?;
        let (stripe, offset) = self.locate(pid);
        let mut file = self.files[stripe].lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_page(&self, pid: PageId, buf: &[u8]) -> SmallResult {
        let (stripe, offset) = self.locate(pid);
        let mut file = self.files[stripe].lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        self.page_count.fetch_max(pid + 1, Ordering::AcqRel);
        Ok(())
    }

    fn sync(&self) -> SmallResult {
        for file in &self.files {
            file.lock().unwrap().sync_data()?;
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

// ------------------------------------------------------------------
// in-memory
// ------------------------------------------------------------------

/// Backing store for engines opened without a base file. Nothing survives
/// the process, which is the point.
pub struct MemPageStore {
    pages: Mutex<Vec<Box<[u8]>>>,
    page_size: usize,
}

impl MemPageStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: Mutex::new(Vec::new()),
            page_size,
        }
    }
}

impl PageStore for MemPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> PageId {
        self.pages.lock().unwrap().len() as PageId
    }

    fn set_page_count(&self, count: PageId) -> SmallResult {
        let mut pages = self.pages.lock().unwrap();
        pages.resize_with(count as usize, || {
            vec![0u8; self.page_size].into_boxed_slice()
        });
        Ok(())
    }

    fn read_page(&self, pid: PageId, buf: &mut [u8]) -> SmallResult {
        let pages = self.pages.lock().unwrap();
        check_read_bounds(pid, pages.len() as PageId)?;
        buf.copy_from_slice(&pages[pid as usize]);
        Ok(())
    }

    fn write_page(&self, pid: PageId, buf: &[u8]) -> SmallResult {
        let mut pages = self.pages.lock().unwrap();
        if pid as usize >= pages.len() {
            let page_size = self.page_size;
            pages.resize_with(pid as usize + 1, || vec![0u8; page_size].into_boxed_slice());
        }
        pages[pid as usize].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> SmallResult {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        false
    }
}
