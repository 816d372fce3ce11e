//! In-memory pages.
//!
//! A page is a fixed byte buffer plus bookkeeping: record count, allocation
//! generation, dirty/full flags. The buffer sits behind a mutex so two
//! writers into the same tag serialize on the page while holding the
//! file-level read lock; count and flags are atomics so stats and positional
//! lookup stay lock-free.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::layout::PAGE_SIZE;

pub struct Page {
    pub id: u32,
    pub tag: u16,
    /// Allocation generation; drives cache eviction.
    pub generation: u64,
    /// Byte size of the page on disk.
    pub size: usize,
    /// Record capacity; zero for schema pages.
    pub capacity: u32,
    entry_size: usize,
    count: AtomicU32,
    dirty: AtomicBool,
    full: AtomicBool,
    buf: Mutex<Vec<u8>>,
}

impl Page {
    /// A fresh, empty entry page.
    pub fn for_entries(id: u32, tag: u16, generation: u64, size: usize, entry_size: usize) -> Self {
        debug_assert!(entry_size > 0 && size <= PAGE_SIZE);
        Self {
            id,
            tag,
            generation,
            size,
            capacity: (size / entry_size) as u32,
            entry_size,
            count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            full: AtomicBool::new(false),
            buf: Mutex::new(vec![0u8; size]),
        }
    }

    /// An entry page loaded from disk with `count` existing records.
    pub fn from_bytes(
        id: u32,
        tag: u16,
        generation: u64,
        bytes: Vec<u8>,
        entry_size: usize,
        count: u32,
    ) -> Self {
        let size = bytes.len();
        let capacity = (size / entry_size) as u32;
        Self {
            id,
            tag,
            generation,
            size,
            capacity,
            entry_size,
            count: AtomicU32::new(count),
            dirty: AtomicBool::new(false),
            full: AtomicBool::new(count >= capacity),
            buf: Mutex::new(bytes),
        }
    }

    /// A schema page: the blob is the whole payload, there are no records.
    pub fn for_schema(id: u32, tag: u16, generation: u64, blob: &[u8]) -> Self {
        let mut bytes = vec![0u8; PAGE_SIZE];
        bytes[..blob.len()].copy_from_slice(blob);
        Self {
            id,
            tag,
            generation,
            size: PAGE_SIZE,
            capacity: 0,
            entry_size: 0,
            count: AtomicU32::new(0),
            dirty: AtomicBool::new(true),
            full: AtomicBool::new(true),
            buf: Mutex::new(bytes),
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Append as many whole records from `records` as fit; returns how many.
    /// Marks the page dirty, and full once the next record would not fit.
    pub fn append(&self, records: &[u8]) -> u32 {
        debug_assert_eq!(records.len() % self.entry_size, 0);
        let buf = &mut *self.buf.lock().expect("page mutex poisoned");

        let have = self.count.load(Ordering::Acquire);
        let fit = self.capacity.saturating_sub(have);
        let offered = (records.len() / self.entry_size) as u32;
        let n = fit.min(offered);
        if n == 0 {
            self.full.store(true, Ordering::Release);
            return 0;
        }

        let at = have as usize * self.entry_size;
        let len = n as usize * self.entry_size;
        buf[at..at + len].copy_from_slice(&records[..len]);

        self.count.store(have + n, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
        if have + n == self.capacity {
            self.full.store(true, Ordering::Release);
        }
        n
    }

    /// Copy whole records `[start, start + out.len()/entry_size)` into `out`;
    /// returns how many were copied (bounded by the page's record count).
    pub fn read_records(&self, start: u32, out: &mut [u8]) -> Result<u32> {
        let buf = &*self.buf.lock().expect("page mutex poisoned");
        let have = self.count.load(Ordering::Acquire);
        if start > have {
            return Err(Error::OutOfRange { index: start as u64, count: have as u64 });
        }
        let want = (out.len() / self.entry_size) as u32;
        let n = want.min(have - start);
        let at = start as usize * self.entry_size;
        let len = n as usize * self.entry_size;
        out[..len].copy_from_slice(&buf[at..at + len]);
        Ok(n)
    }

    /// Clone the page bytes, e.g. for commit or raw import.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().expect("page mutex poisoned").clone()
    }
}
