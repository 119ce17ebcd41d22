//! Memory-Mapped Pages
//!
//! A page is a fixed-size file mapped into memory and addressed by an
//! integer index. Segments, queue metadata, fan-out cursors and replica
//! sequences are all built from pages.
//!
//! ## File Layout
//!
//! ```text
//! <dir>/
//!   0.meta        page 0, suffix "meta"
//!   1024.idx      page 1024, suffix "idx"
//!   1024.dat      page 1024, suffix "dat"
//! ```
//!
//! Every file is exactly `page_size` bytes; new files are zero-extended to
//! that size before they are mapped.
//!
//! ## Ownership
//!
//! `PageFactory` is the single owner of its pages. Callers hold
//! `Arc<MappedPage>` handles, but the mapping itself lives inside the page
//! and is dropped by [`MappedPage::close`]. Reads return a [`PageView`]
//! that borrows the page, so a view can never outlive the mapping: closing
//! a page waits for outstanding views, and reads after close fail with
//! `PageClosed`.
//!
//! ## I/O Strategy
//!
//! Directory creation, mapping and deletion go through the [`PageIo`]
//! trait so tests can inject failures without touching global state.

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Read-only view into a mapped page, valid while the borrow lasts
pub type PageView<'a> = MappedRwLockReadGuard<'a, [u8]>;

/// File operations used by a [`PageFactory`]
pub trait PageIo: Send + Sync {
    /// Create `path` and any missing parents
    fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Open or create `path`, extend it to at least `size` bytes and map it
    fn map(&self, path: &Path, size: usize) -> io::Result<MmapMut>;

    /// Delete the file backing a page
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// [`PageIo`] backed by the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FilePageIo;

impl PageIo for FilePageIo {
    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn map(&self, path: &Path, size: usize) -> io::Result<MmapMut> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.metadata()?.len() < size as u64 {
            file.set_len(size as u64)?;
        }

        // SAFETY: the data directory is owned exclusively by this process and
        // a page file is only mapped once, by its factory.
        unsafe { MmapOptions::new().len(size).map_mut(&file) }
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// A single memory-mapped page
pub struct MappedPage {
    index: i64,
    path: PathBuf,
    size: usize,
    mmap: RwLock<Option<MmapMut>>,
}

impl std::fmt::Debug for MappedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedPage")
            .field("index", &self.index)
            .field("path", &self.path)
            .field("size", &self.size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MappedPage {
    fn new(index: i64, path: PathBuf, size: usize, mmap: MmapMut) -> Self {
        Self {
            index,
            path,
            size,
            mmap: RwLock::new(Some(mmap)),
        }
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.mmap.read().is_none()
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::PageBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    /// Borrow `len` bytes starting at `offset` without copying
    pub fn read(&self, offset: usize, len: usize) -> Result<PageView<'_>> {
        self.check_bounds(offset, len)?;
        let guard = self.mmap.read();
        RwLockReadGuard::try_map(guard, |mmap| {
            mmap.as_ref().map(|m| &m[offset..offset + len])
        })
        .map_err(|_| Error::PageClosed(self.index))
    }

    /// Copy `data` into the page at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        let mut guard = self.mmap.write();
        let mmap = guard.as_mut().ok_or(Error::PageClosed(self.index))?;
        mmap[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_i64(&self, offset: usize) -> Result<i64> {
        let view = self.read(offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&view);
        Ok(i64::from_le_bytes(raw))
    }

    pub fn write_i64(&self, offset: usize, value: i64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Flush dirty pages of the mapping to the backing file
    pub fn sync(&self) -> Result<()> {
        let guard = self.mmap.read();
        let mmap = guard.as_ref().ok_or(Error::PageClosed(self.index))?;
        mmap.flush()?;
        Ok(())
    }

    /// Flush and unmap. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.mmap.write();
        if let Some(mmap) = guard.take() {
            mmap.flush()?;
        }
        Ok(())
    }
}

/// Owner of all pages in one directory sharing a suffix and a size
pub struct PageFactory {
    path: PathBuf,
    suffix: String,
    page_size: usize,
    io: Arc<dyn PageIo>,
    pages: RwLock<BTreeMap<i64, Arc<MappedPage>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFactory")
            .field("path", &self.path)
            .field("suffix", &self.suffix)
            .field("page_size", &self.page_size)
            .field("pages", &self.pages.read().len())
            .finish()
    }
}

impl PageFactory {
    /// Open a factory on the local filesystem
    pub fn new(path: impl Into<PathBuf>, suffix: &str, page_size: usize) -> Result<Self> {
        Self::with_io(path, suffix, page_size, Arc::new(FilePageIo))
    }

    /// Open a factory, re-mapping every `<index>.<suffix>` file in `path`
    pub fn with_io(
        path: impl Into<PathBuf>,
        suffix: &str,
        page_size: usize,
        io: Arc<dyn PageIo>,
    ) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::InvalidConfig(
                "page size must be greater than zero".to_string(),
            ));
        }

        let path = path.into();
        io.create_dir(&path)?;

        let factory = Self {
            path,
            suffix: suffix.to_string(),
            page_size,
            io,
            pages: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        };
        factory.load_pages()?;
        Ok(factory)
    }

    fn load_pages(&self) -> Result<()> {
        let mut pages = self.pages.write();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let file_path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }
            if file_path.extension().and_then(|e| e.to_str()) != Some(self.suffix.as_str()) {
                continue;
            }

            let index = file_path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| Error::InvalidPageFile(file_path.clone()))?;

            let mmap = self.io.map(&file_path, self.page_size)?;
            pages.insert(
                index,
                Arc::new(MappedPage::new(index, file_path, self.page_size, mmap)),
            );
        }

        if !pages.is_empty() {
            debug!(
                path = %self.path.display(),
                suffix = %self.suffix,
                count = pages.len(),
                "Loaded existing pages"
            );
        }
        Ok(())
    }

    fn page_path(&self, index: i64) -> PathBuf {
        self.path.join(format!("{}.{}", index, self.suffix))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Return the page for `index`, mapping a new file if it does not exist
    pub fn acquire_page(&self, index: i64) -> Result<Arc<MappedPage>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PageClosed(index));
        }

        // Fast path: shared lock
        {
            let pages = self.pages.read();
            if let Some(page) = pages.get(&index) {
                return Ok(Arc::clone(page));
            }
        }

        let mut pages = self.pages.write();

        // Double-check in case another caller created it while we waited
        if let Some(page) = pages.get(&index) {
            return Ok(Arc::clone(page));
        }

        let path = self.page_path(index);
        let mmap = self.io.map(&path, self.page_size)?;
        let page = Arc::new(MappedPage::new(index, path, self.page_size, mmap));
        pages.insert(index, Arc::clone(&page));

        debug!(path = %self.path.display(), index, "Created page");
        Ok(page)
    }

    /// Lookup without creating
    pub fn get_page(&self, index: i64) -> Option<Arc<MappedPage>> {
        self.pages.read().get(&index).cloned()
    }

    /// Delete the page's file and forget it.
    ///
    /// If the file cannot be removed the page stays mapped and registered,
    /// so the release can be retried.
    pub fn release_page(&self, index: i64) -> Result<()> {
        let mut pages = self.pages.write();
        let Some(page) = pages.get(&index) else {
            return Ok(());
        };

        self.io.remove(page.path())?;

        if let Err(e) = page.close() {
            warn!(path = %page.path().display(), error = %e, "Failed to close released page");
        }
        pages.remove(&index);
        Ok(())
    }

    /// Indexes of all live pages, ascending
    pub fn page_indexes(&self) -> Vec<i64> {
        self.pages.read().keys().copied().collect()
    }

    /// Bytes mapped by live pages
    pub fn size(&self) -> usize {
        self.pages.read().len() * self.page_size
    }

    pub fn sync_all(&self) -> Result<()> {
        for page in self.pages.read().values() {
            page.sync()?;
        }
        Ok(())
    }

    /// Close every page once; later calls do nothing
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let pages = self.pages.read();
        for page in pages.values() {
            if let Err(e) = page.close() {
                warn!(path = %page.path().display(), error = %e, "Failed to close page");
            }
        }
        info!(path = %self.path.display(), pages = pages.len(), "Closed page factory");
    }
}
