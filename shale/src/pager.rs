//! The disk manager: reads and writes fixed-size pages across the data
//! files named by the catalog.
//!
//! Each backing store (heap, index, catalog) is one file tagged by a
//! `file_id`; the catalog resolves the id to a path at page-fetch time.

use crate::error::PoolError;
use crate::{Page, PageId, PAGE_SIZE};
use std::collections::HashMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Maps `file_id` to the on-disk path of its backing file.
#[derive(Debug, Default, Clone)]
pub struct FileCatalog {
    paths: HashMap<u64, PathBuf>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: AsRef<Path>>(&mut self, file_id: u64, path: P) {
        self.paths.insert(file_id, path.as_ref().to_path_buf());
    }

    pub fn resolve(&self, file_id: u64) -> Option<&Path> {
        self.paths.get(&file_id).map(PathBuf::as_path)
    }
}

struct BackingFile {
    file: File,
    num_pages: u64,
}

/// Owns the open file handles and performs page-granular I/O.
pub struct DiskManager {
    catalog: FileCatalog,
    files: HashMap<u64, BackingFile>,
}

impl DiskManager {
    pub fn new(catalog: FileCatalog) -> Self {
        Self {
            catalog,
            files: HashMap::new(),
        }
    }

    pub fn register_file<P: AsRef<Path>>(&mut self, file_id: u64, path: P) {
        self.catalog.register(file_id, path);
    }

    pub fn catalog(&self) -> &FileCatalog {
        &self.catalog
    }

    fn backing(&mut self, file_id: u64) -> Result<&mut BackingFile, PoolError> {
        if !self.files.contains_key(&file_id) {
            let path = self
                .catalog
                .resolve(file_id)
                .ok_or(PoolError::UnknownFile(file_id))?;
            if let Some(parent) = path.parent() {
                create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            let num_pages = file.metadata()?.len() / PAGE_SIZE as u64;
            self.files.insert(file_id, BackingFile { file, num_pages });
        }
        Ok(self.files.get_mut(&file_id).unwrap())
    }

    /// Reads a page, returning a freshly initialized one for addresses
    /// past the end of the file.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Page, PoolError> {
        let backing = self.backing(page_id.file_id)?;
        let mut page = Page::new(page_id);
        if page_id.page_no >= backing.num_pages {
            return Ok(page);
        }

        let offset = page_id.page_no * PAGE_SIZE as u64;
        backing.file.seek(SeekFrom::Start(offset))?;
        let bytes_read = backing.file.read(&mut page.data)?;
        if bytes_read == 0 {
            return Ok(page);
        }
        if bytes_read < PAGE_SIZE {
            // A partially written trailing page; zero the rest.
            page.data[bytes_read..].fill(0);
        }
        Ok(page)
    }

    /// Writes a page image and syncs it to stable storage.
    pub fn write_page(&mut self, page: &Page) -> Result<(), PoolError> {
        let backing = self.backing(page.id.file_id)?;
        let offset = page.id.page_no * PAGE_SIZE as u64;
        backing.file.seek(SeekFrom::Start(offset))?;
        backing.file.write_all(&page.data)?;
        backing.file.sync_all()?;
        if page.id.page_no >= backing.num_pages {
            backing.num_pages = page.id.page_no + 1;
        }
        Ok(())
    }

    /// Reserves the next page number in a file.
    pub fn allocate_page(&mut self, file_id: u64) -> Result<PageId, PoolError> {
        let backing = self.backing(file_id)?;
        let page_no = backing.num_pages;
        backing.num_pages += 1;
        Ok(PageId::new(file_id, page_no))
    }

    pub fn num_pages(&mut self, file_id: u64) -> Result<u64, PoolError> {
        Ok(self.backing(file_id)?.num_pages)
    }
}
