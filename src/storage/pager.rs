//! The pager: a fixed-capacity cache of page buffers over the database file.
//!
//! Pages are loaded lazily on first access and written back only by
//! [`Pager::flush_all`]; there is no dirty tracking and no eviction. The
//! working set is bounded by `TABLE_MAX_PAGES`, so every resident page is
//! flushed unconditionally at close.
//!
//! Page 0 never holds a node. It carries the database header, three
//! little-endian u32 fields read at open and rewritten at close.
use super::btree::Node;
use crate::errors::Error;
use bincode::{config, Decode, Encode};
use heapless;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Page size 4 kilobytes because it's the same size as a page used in
/// the virtual memory systems of most computer architectures.
pub const PAGE_SIZE: usize = 4096;

pub const TABLE_MAX_PAGES: usize = 256;

/// Serialized size of [`DbHeader`]: three u32 fields.
pub const DB_HEADER_SIZE: usize = 12;

/// Page number of the header page.
pub const HEADER_PAGE_NUM: u32 = 0;

/// The page 0 header. Field order is the on-disk order.
#[derive(Encode, Decode, Debug, PartialEq)]
pub struct DbHeader {
    /// Count of live rows across all leaves.
    pub num_rows: u32,
    /// Page number of the B+tree root.
    pub root_page_num: u32,
    /// Next page number the monotonic allocator will hand out.
    pub next_free_page: u32,
}

fn header_config() -> impl config::Config {
    // Fixed-width integers so the header is exactly three u32 LE fields,
    // not varints.
    config::standard().with_fixed_int_encoding()
}

/// Writes the header into the first bytes of a page buffer.
pub fn encode_header(header: &DbHeader, page: &mut [u8]) -> Result<(), Error> {
    let written = bincode::encode_into_slice(header, page, header_config())
        .map_err(|e| err!(Storage, "Failed to encode db header: {}", e))?;
    debug_assert_eq!(written, DB_HEADER_SIZE);
    Ok(())
}

/// Reads the header back from the first bytes of a page buffer.
pub fn decode_header(page: &[u8]) -> Result<DbHeader, Error> {
    let (header, _) = bincode::decode_from_slice(&page[..DB_HEADER_SIZE], header_config())
        .map_err(|e| err!(Corrupt, "Failed to decode db header: {}", e))?;
    Ok(header)
}

pub struct Pager {
    file: File,
    pages: heapless::Vec<Option<Arc<Mutex<Node>>>, TABLE_MAX_PAGES>,
    /// Number of whole pages in the file at open time.
    file_pages: u32,
    /// High-water mark of pages this session has touched.
    num_pages: u32,
}

impl Pager {
    /// Opens the database file, creating it empty if absent. A file whose
    /// length is not a whole number of pages was not written by this
    /// program.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let file_len = file.metadata()?.len();
        if file_len % PAGE_SIZE as u64 != 0 {
            return Err(err!(
                Corrupt,
                "Db file is not a whole number of pages ({} bytes)",
                file_len
            ));
        }
        let file_pages = (file_len / PAGE_SIZE as u64) as u32;
        debug!(path = %path.display(), file_pages, "Opened database file");

        Ok(Pager {
            file,
            pages: heapless::Vec::new(),
            file_pages,
            num_pages: file_pages,
        })
    }

    /// Makes a page resident: reads it from disk when it exists there,
    /// otherwise installs a zero-filled buffer. Touching a page past the
    /// current count extends the count to include it.
    pub fn fetch(&mut self, page_num: u32) -> Result<(), Error> {
        if page_num as usize >= TABLE_MAX_PAGES {
            return Err(Error::OutOfPages(page_num));
        }

        while self.pages.len() <= page_num as usize {
            if self.pages.push(None).is_err() {
                return Err(Error::OutOfPages(page_num));
            }
        }

        if self.pages[page_num as usize].is_none() {
            let mut node = Node::new();
            if page_num < self.file_pages {
                self.file
                    .seek(SeekFrom::Start(page_num as u64 * PAGE_SIZE as u64))?;
                self.file.read_exact(&mut node.data)?;
                debug!(page_num, "Read page from disk");
            }
            self.pages[page_num as usize] = Some(Arc::new(Mutex::new(node)));
        }

        if page_num >= self.num_pages {
            self.num_pages = page_num + 1;
        }
        Ok(())
    }

    /// Borrows a resident page. Call [`Pager::fetch`] first; splitting the
    /// two steps lets one operation hold guards on several pages at once.
    pub fn get(&self, page_num: u32) -> Result<MutexGuard<'_, Node>, Error> {
        let slot = self
            .pages
            .get(page_num as usize)
            .and_then(|p| p.as_ref())
            .ok_or_else(|| err!(Storage, "Page {} is not resident", page_num))?;

        slot.try_lock()
            .map_err(|_| err!(Lock, "Page {} is already borrowed", page_num))
    }

    /// Fetch-then-get for call sites that need a single page.
    pub fn get_or_fetch(&mut self, page_num: u32) -> Result<MutexGuard<'_, Node>, Error> {
        self.fetch(page_num)?;
        self.get(page_num)
    }

    /// Writes one resident page back to its file offset.
    pub fn flush(&mut self, page_num: u32) -> Result<(), Error> {
        let node = match self.pages.get(page_num as usize).and_then(|p| p.as_ref()) {
            Some(arc) => Arc::clone(arc),
            None => return Ok(()),
        };
        let node = node
            .try_lock()
            .map_err(|_| err!(Lock, "Page {} is already borrowed", page_num))?;

        self.file
            .seek(SeekFrom::Start(page_num as u64 * PAGE_SIZE as u64))?;
        self.file.write_all(&node.data)?;
        Ok(())
    }

    /// Flushes every resident page and syncs the file. Durability happens
    /// here and nowhere else.
    pub fn flush_all(&mut self) -> Result<(), Error> {
        for page_num in 0..self.num_pages {
            self.flush(page_num)?;
        }
        self.file.sync_all()?;
        self.file_pages = self.num_pages;
        info!(pages = self.num_pages, "Flushed all pages");
        Ok(())
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn file_pages(&self) -> u32 {
        self.file_pages
    }

    /// Largest key reachable from `page_num`: descends right children down
    /// to a leaf and takes its last key.
    pub fn node_max_key(&mut self, page_num: u32) -> Result<u32, Error> {
        use super::btree::NodeType;

        self.fetch(page_num)?;
        let (node_type, right_child, leaf_max) = {
            let node = self.get(page_num)?;
            match node.node_type()? {
                NodeType::Internal => (NodeType::Internal, node.internal_right_child(), 0),
                NodeType::Leaf => (NodeType::Leaf, 0, node.leaf_max_key()?),
            }
        };
        match node_type {
            NodeType::Internal => self.node_max_key(right_child),
            NodeType::Leaf => Ok(leaf_max),
        }
    }
}
