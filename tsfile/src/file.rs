//! The TSFile orchestrator.
//!
//! A `TsFile` ties a `Storage` to the in-memory tables: schemas, page
//! descriptors, the page cache and the per-schema page indexes. One
//! read-write lock guards the tables; per-page mutexes guard buffer bytes;
//! counts and starting indexes are atomic words so stats and positional
//! lookup stay lock-free.
//!
//! Commit discipline: `add_entries` triggers a deferred commit that writes
//! the dirty pages currently marked full, rewrites the header pages with a
//! fresh super-block, and evicts the committed pages. `commit` (and the
//! final `put`) writes everything, partial pages included. A record batch is
//! therefore either durable after the next commit or dropped with the
//! handle; the file on disk is consistent either way.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{CacheStats, PageCache};
use crate::error::{Error, Result};
use crate::index::PageIndex;
use crate::layout::{
    self, FileHeader, PageDescriptor, SuperBlock, DESCRIPTOR_SIZE, FORMAT_EXT, FORMAT_V1,
    HEADER_SIZE, PAGE_SIZE, PF_SCHEMA, SUPER_BLOCK_COUNT, TAGS_PER_HEADER, TAG_DATA_BASE,
    TAG_HEADER,
};
use crate::page::Page;
use crate::schema::{Deserializer, FieldValue, Schema, SCHEMA_SIZE};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    V1,
    V2,
}

/// Per-schema runtime state.
struct SchemaState {
    tag: u16,
    schema: Schema,
    deser: Deserializer,
    /// Total records across all pages of this tag.
    count: AtomicU64,
    index: PageIndex,
}

impl SchemaState {
    fn new(tag: u16, schema: Schema) -> Result<Self> {
        let deser = Deserializer::new(&schema)?;
        Ok(Self { tag, schema, deser, count: AtomicU64::new(0), index: PageIndex::new() })
    }

    fn records_per_page(&self) -> u64 {
        layout::records_per_page(self.schema.entry_size) as u64
    }
}

/// The file tables, all behind one read-write lock.
struct State {
    header: FileHeader,
    schemas: Vec<Arc<SchemaState>>,
    /// V2 only: one descriptor per page, indexed by page id.
    descriptors: Vec<PageDescriptor>,
    /// Pages in the file, header pages included.
    page_count: u32,
    cache: PageCache,
}

struct Inner {
    storage: Box<dyn Storage>,
    format: Format,
    flags: u16,
    state: RwLock<State>,
    refs: AtomicU32,
    closed: AtomicBool,
    sb_index: AtomicU32,
    last_time: AtomicU64,
}

/// A reference-counted handle to a paged time-series file.
///
/// `get` acquires another reference, `put` releases one (committing and
/// syncing at zero), `detach` releases without the final commit. The backing
/// storage is considered closed once the count reaches zero.
pub struct TsFile {
    inner: Arc<Inner>,
}

impl TsFile {
    /// Create a fresh file on `storage` with the given format flags.
    /// Exactly one of V1/V2 must be set.
    pub fn create(storage: Box<dyn Storage>, flags: u16) -> Result<TsFile> {
        layout::check_format_flags(flags)?;
        let format = if flags & FORMAT_V1 != 0 { Format::V1 } else { Format::V2 };
        let state = State {
            header: FileHeader::new(flags),
            schemas: Vec::new(),
            descriptors: if format == Format::V2 {
                vec![PageDescriptor { tag: TAG_HEADER, ..Default::default() }]
            } else {
                Vec::new()
            },
            page_count: 1,
            cache: PageCache::new(),
        };
        let file = TsFile {
            inner: Arc::new(Inner {
                storage,
                format,
                flags,
                state: RwLock::new(state),
                refs: AtomicU32::new(1),
                closed: AtomicBool::new(false),
                sb_index: AtomicU32::new(0),
                last_time: AtomicU64::new(0),
            }),
        };
        {
            let mut state = file.inner.state.write().expect("file lock poisoned");
            file.commit_locked(&mut state, true)?;
        }
        Ok(file)
    }

    /// Open an existing file, picking the freshest super-block and following
    /// header-page chains. Ambiguous images are rejected, never guessed at.
    pub fn load(storage: Box<dyn Storage>) -> Result<TsFile> {
        let mut page0 = vec![0u8; PAGE_SIZE];
        storage
            .read_at(0, &mut page0)
            .map_err(|e| Error::Format(format!("header page unreadable: {e}")))?;
        let header = FileHeader::from_bytes(&page0)?;
        header.check()?;

        let flags = header.flags;
        let format = if flags & FORMAT_V1 != 0 { Format::V1 } else { Format::V2 };
        let (state, last_time) = match format {
            Format::V1 => Self::load_v1(&*storage, header, &page0)?,
            Format::V2 => Self::load_v2(&*storage, header)?,
        };
        Ok(TsFile {
            inner: Arc::new(Inner {
                storage,
                format,
                flags,
                state: RwLock::new(state),
                refs: AtomicU32::new(1),
                closed: AtomicBool::new(false),
                sb_index: AtomicU32::new(0),
                last_time: AtomicU64::new(last_time),
            }),
        })
    }

    fn load_v1(
        storage: &dyn Storage,
        header: FileHeader,
        page0: &[u8],
    ) -> Result<(State, u64)> {
        let sb = header
            .authoritative()
            .copied()
            .ok_or_else(|| Error::Format("no committed super-block".into()))?;

        let blob = &page0[HEADER_SIZE..HEADER_SIZE + SCHEMA_SIZE];
        let mut schemas = Vec::new();
        let mut page_count = 1;
        if blob.iter().any(|&b| b != 0) {
            let schema = Schema::decode_blob(blob)?;
            if schema.requires_extension() && header.flags & FORMAT_EXT == 0 {
                return Err(Error::Format(
                    "schema uses extension types but the extension flag is unset".into(),
                ));
            }
            let state = SchemaState::new(TAG_DATA_BASE, schema)?;
            let entries = sb.count as u64;
            let rpp = state.records_per_page();
            let pages = entries.div_ceil(rpp) as u32;

            // Reject a byte length that cannot hold the declared entries.
            let dps = layout::v1_data_page_size(state.schema.entry_size) as u64;
            let needed = PAGE_SIZE as u64 + pages as u64 * dps;
            if storage.size()? < needed {
                return Err(Error::Format(format!(
                    "file holds fewer bytes ({}) than {entries} entries need ({needed})",
                    storage.size()?
                )));
            }

            for p in 0..pages {
                state.index.push(p + 1, p as u64 * rpp);
            }
            state.count.store(entries, Ordering::Release);
            page_count += pages;
            schemas.push(Arc::new(state));
        } else if sb.count != 0 {
            return Err(Error::Format(format!(
                "super-block declares {} entries but no schema is present",
                sb.count
            )));
        }

        let state = State {
            header,
            schemas,
            descriptors: Vec::new(),
            page_count,
            cache: PageCache::new(),
        };
        Ok((state, sb.time))
    }

    fn load_v2(storage: &dyn Storage, header0: FileHeader) -> Result<(State, u64)> {
        let sb = header0
            .authoritative()
            .copied()
            .ok_or_else(|| Error::Format("no committed super-block".into()))?;
        let mut last_time = sb.time;
        let mut page_count = sb.count.max(1);
        let mut descriptors = vec![PageDescriptor::default(); page_count as usize];
        descriptors[0] = PageDescriptor { tag: TAG_HEADER, ..Default::default() };

        // Walk the header-page chain; each hop may observe super-blocks
        // bounding a further window.
        let mut header_page = 0u32;
        let mut page_bytes = vec![0u8; PAGE_SIZE];
        storage.read_at(0, &mut page_bytes)?;
        loop {
            let window_end = page_count.min(header_page + TAGS_PER_HEADER);
            for page in header_page + 1..window_end {
                let at = layout::descriptor_offset(page);
                descriptors[page as usize] =
                    PageDescriptor::from_bytes(&page_bytes[at..at + DESCRIPTOR_SIZE])?;
            }
            if page_count <= header_page + TAGS_PER_HEADER {
                break;
            }
            header_page += TAGS_PER_HEADER;
            storage.read_at(layout::v2_page_offset(header_page), &mut page_bytes)?;
            let chained = FileHeader::from_bytes(&page_bytes)?;
            chained.check()?;
            if let Some(sb) = chained.authoritative() {
                last_time = last_time.max(sb.time);
                if sb.count > page_count {
                    page_count = sb.count;
                    descriptors.resize(page_count as usize, PageDescriptor::default());
                }
            }
            descriptors[header_page as usize] =
                PageDescriptor { tag: TAG_HEADER, ..Default::default() };
        }

        if storage.size()? < page_count as u64 * PAGE_SIZE as u64 {
            return Err(Error::Format(format!(
                "super-block declares {page_count} pages, file holds {} bytes",
                storage.size()?
            )));
        }

        // Pass 1: schema pages define the tags.
        let mut schema_pages: Vec<(u16, u32)> = descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_schema() && d.tag >= TAG_DATA_BASE)
            .map(|(page, d)| (d.tag, page as u32))
            .collect();
        schema_pages.sort_unstable();

        let mut schemas = Vec::new();
        let mut blob = vec![0u8; SCHEMA_SIZE];
        for (pos, (tag, page)) in schema_pages.iter().enumerate() {
            if *tag != TAG_DATA_BASE + pos as u16 {
                return Err(Error::Format(format!(
                    "schema tags are not contiguous: expected {}, found {tag}",
                    TAG_DATA_BASE + pos as u16
                )));
            }
            storage.read_at(layout::v2_page_offset(*page), &mut blob)?;
            let schema = Schema::decode_blob(&blob)?;
            schemas.push(Arc::new(SchemaState::new(*tag, schema)?));
        }

        // Pass 2: entry pages in file order rebuild counts and indexes.
        for (page, desc) in descriptors.iter().enumerate() {
            if desc.tag < TAG_DATA_BASE || desc.is_schema() {
                continue;
            }
            let slot = (desc.tag - TAG_DATA_BASE) as usize;
            let schema = schemas
                .get(slot)
                .ok_or(Error::UnknownTag(desc.tag))?;
            let start = schema.count.load(Ordering::Acquire);
            schema.index.push(page as u32, start);
            schema.count.fetch_add(desc.count as u64, Ordering::AcqRel);
        }

        let state = State {
            header: header0,
            schemas,
            descriptors,
            page_count,
            cache: PageCache::new(),
        };
        Ok((state, last_time))
    }

    // ---- reference counting ----

    /// Acquire another handle to the same file.
    pub fn get(&self) -> TsFile {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        TsFile { inner: Arc::clone(&self.inner) }
    }

    /// Release this handle. The last release commits everything and syncs
    /// the backing storage.
    pub fn put(self) -> Result<()> {
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut state = self.inner.state.write().expect("file lock poisoned");
            self.commit_locked(&mut state, true)?;
            self.inner.closed.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Release this handle without the final commit; uncommitted records are
    /// dropped.
    pub fn detach(self) {
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.closed.store(true, Ordering::Release);
        }
    }

    /// Current handle count.
    pub fn ref_count(&self) -> u32 {
        self.inner.refs.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    // ---- schemas ----

    /// Register a schema; returns its data tag. Schemas are immutable once
    /// added.
    pub fn add_schema(&self, schema: &Schema) -> Result<u16> {
        self.check_open()?;
        schema.check()?;
        if self.inner.format == Format::V1
            && schema.requires_extension()
            && self.inner.flags & FORMAT_EXT == 0
        {
            return Err(Error::Format(
                "boolean and time fields require the extension flag on V1 files".into(),
            ));
        }

        let mut state = self.inner.state.write().expect("file lock poisoned");
        if state.schemas.iter().any(|s| s.schema.name == schema.name) {
            return Err(Error::Schema(format!(
                "schema {:?} already exists",
                schema.name
            )));
        }
        if self.inner.format == Format::V1 && !state.schemas.is_empty() {
            return Err(Error::Schema("V1 files hold a single schema".into()));
        }

        let tag = TAG_DATA_BASE + state.schemas.len() as u16;
        if self.inner.format == Format::V2 {
            let blob = schema.encode_blob()?;
            let page_id = self.reserve_page_id(&mut state)?;
            let generation = state.cache.next_generation();
            let page = Arc::new(Page::for_schema(page_id, tag, generation, &blob));
            state.descriptors[page_id as usize] =
                PageDescriptor { tag, flags: PF_SCHEMA, count: 0, pad: 0 };
            state.cache.insert(page);
        }
        state.schemas.push(Arc::new(SchemaState::new(tag, schema.clone())?));
        self.commit_locked(&mut state, false)?;
        info!(name = %schema.name, tag, "added schema");
        Ok(tag)
    }

    /// The schema registered under `tag`.
    pub fn get_schema(&self, tag: u16) -> Result<Schema> {
        Ok(self.schema_state(tag)?.schema.clone())
    }

    /// Data tag range as `(first, last_exclusive)`.
    pub fn get_data_tags(&self) -> (u16, u16) {
        let state = self.inner.state.read().expect("file lock poisoned");
        (TAG_DATA_BASE, TAG_DATA_BASE + state.schemas.len() as u16)
    }

    /// Records stored under `tag`; lock-free.
    pub fn get_entry_count(&self, tag: u16) -> Result<u64> {
        Ok(self.schema_state(tag)?.count.load(Ordering::Acquire))
    }

    fn schema_state(&self, tag: u16) -> Result<Arc<SchemaState>> {
        let state = self.inner.state.read().expect("file lock poisoned");
        if tag < TAG_DATA_BASE {
            return Err(Error::UnknownTag(tag));
        }
        state
            .schemas
            .get((tag - TAG_DATA_BASE) as usize)
            .cloned()
            .ok_or(Error::UnknownTag(tag))
    }

    // ---- writing ----

    /// Append typed rows under `tag`, then run the deferred commit.
    pub fn add_entries(&self, tag: u16, rows: &[Vec<FieldValue>]) -> Result<()> {
        let schema = self.schema_state(tag)?;
        let entry_size = schema.schema.entry_size;
        let mut bytes = vec![0u8; rows.len() * entry_size];
        for (row, chunk) in rows.iter().zip(bytes.chunks_mut(entry_size)) {
            schema.schema.encode_entry(row, chunk)?;
        }
        self.add_entries_raw(tag, &bytes)
    }

    /// Append pre-encoded records (a whole number of `entry_size` chunks).
    pub fn add_entries_raw(&self, tag: u16, records: &[u8]) -> Result<()> {
        self.check_open()?;
        let schema = self.schema_state(tag)?;
        let entry_size = schema.schema.entry_size;
        if records.len() % entry_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} bytes is not a whole number of {entry_size}-byte records",
                records.len()
            )));
        }
        if records.is_empty() {
            return Ok(());
        }

        let mut offset = 0usize;
        while offset < records.len() {
            let page = self.writable_page(&schema)?;
            let appended = {
                // Hold the table read lock while the page mutex is taken,
                // so commit (write lock) cannot interleave with the copy.
                let _state = self.inner.state.read().expect("file lock poisoned");
                page.append(&records[offset..])
            };
            if appended == 0 {
                let mut state = self.inner.state.write().expect("file lock poisoned");
                state.cache.clear_writable(schema.tag, page.id);
                continue;
            }
            schema.index.record_append(page.id, appended as u64);
            schema.count.fetch_add(appended as u64, Ordering::AcqRel);
            offset += appended as usize * entry_size;
            if page.is_full() {
                let mut state = self.inner.state.write().expect("file lock poisoned");
                state.cache.clear_writable(schema.tag, page.id);
            }
        }

        // Deferred commit: full dirty pages go to disk, the header page gets
        // a fresh super-block, committed pages leave the cache.
        let mut state = self.inner.state.write().expect("file lock poisoned");
        self.commit_locked(&mut state, false)
    }

    /// Import every schema and record of `other`. Per-tag entry layouts must
    /// validate; the source is read-locked for the whole copy.
    pub fn add_file(&self, other: &TsFile) -> Result<()> {
        self.check_open()?;
        other.check_open()?;
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return Err(Error::InvalidArgument("cannot import a file into itself".into()));
        }

        let src = other.inner.state.read().expect("file lock poisoned");
        // Map source tags onto ours, adding schemas as needed.
        let mut tag_map = Vec::with_capacity(src.schemas.len());
        for schema in &src.schemas {
            let existing = {
                let state = self.inner.state.read().expect("file lock poisoned");
                state
                    .schemas
                    .iter()
                    .find(|s| s.schema.name == schema.schema.name)
                    .map(|s| (s.tag, s.schema.clone()))
            };
            let tag = match existing {
                Some((tag, ours)) => {
                    ours.validate(&schema.schema)?;
                    tag
                }
                None => self.add_schema(&schema.schema)?,
            };
            tag_map.push(tag);
        }

        // Raw copy of every entry page's record region, in index order.
        for (schema, tag) in src.schemas.iter().zip(&tag_map) {
            let entry_size = schema.schema.entry_size;
            for located in schema.index.snapshot() {
                let bytes = match src.cache.get(located.page) {
                    Some(page) => {
                        let count = page.count();
                        if count == 0 {
                            continue;
                        }
                        let mut out = vec![0u8; count as usize * entry_size];
                        page.read_records(0, &mut out)?;
                        out
                    }
                    None => {
                        let count = other.page_record_count(&src, located.page, schema);
                        if count == 0 {
                            continue;
                        }
                        let mut out = vec![0u8; count as usize * entry_size];
                        let at = other.page_offset(located.page, entry_size);
                        other.inner.storage.read_at(at, &mut out)?;
                        out
                    }
                };
                self.add_entries_raw(*tag, &bytes)?;
            }
        }
        drop(src);

        let mut state = self.inner.state.write().expect("file lock poisoned");
        self.commit_locked(&mut state, true)
    }

    // ---- reading ----

    /// Decode `n` records starting at `start`.
    pub fn get_entries(&self, tag: u16, start: u64, n: usize) -> Result<Vec<Vec<FieldValue>>> {
        let schema = self.schema_state(tag)?;
        let entry_size = schema.schema.entry_size;
        let mut buf = vec![0u8; n * entry_size];
        let got = self.get_entries_raw(tag, start, &mut buf)?;
        buf.truncate(got * entry_size);
        buf.chunks(entry_size).map(|chunk| schema.deser.decode(chunk)).collect()
    }

    /// Fill `out` with raw records starting at `start`; returns how many
    /// whole records were copied. `start` past the entry count is an error.
    pub fn get_entries_raw(&self, tag: u16, start: u64, out: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let schema = self.schema_state(tag)?;
        let entry_size = schema.schema.entry_size;
        let capacity = out.len() / entry_size;
        let total = schema.count.load(Ordering::Acquire);
        if start >= total {
            return Err(Error::OutOfRange { index: start, count: total });
        }
        if capacity == 0 {
            return Ok(0);
        }
        let wanted = (capacity as u64).min(total - start) as usize;

        let mut read = 0usize;
        while read < wanted {
            let index = start + read as u64;
            let (page_id, page_start) = self.locate(&schema, index)?;
            let page = self.page_for_read(page_id, &schema)?;
            let in_page = (index - page_start) as u32;
            let slice = &mut out[read * entry_size..wanted * entry_size];
            let got = page.read_records(in_page, slice)?;
            if got == 0 {
                return Err(Error::Format(format!(
                    "page {page_id} holds no record {index} (starts at {page_start})"
                )));
            }
            read += got as usize;
        }
        Ok(wanted)
    }

    /// Positional lookup: O(1) arithmetic in V1, O(log n) index search in V2.
    fn locate(&self, schema: &SchemaState, index: u64) -> Result<(u32, u64)> {
        match self.inner.format {
            Format::V1 => {
                let rpp = schema.records_per_page();
                let page = (index / rpp) as u32 + 1;
                Ok((page, (page as u64 - 1) * rpp))
            }
            Format::V2 => {
                let located = schema
                    .index
                    .locate(index)
                    .ok_or(Error::OutOfRange { index, count: 0 })?;
                Ok((located.page, located.start))
            }
        }
    }

    // ---- stats ----

    pub fn get_stats(&self) -> TsFileStats {
        let state = self.inner.state.read().expect("file lock poisoned");
        TsFileStats {
            format_flags: self.inner.flags,
            page_count: state.page_count,
            schema_count: state.schemas.len(),
            schemas: state
                .schemas
                .iter()
                .map(|s| SchemaStats {
                    name: s.schema.name.clone(),
                    tag: s.tag,
                    entry_size: s.schema.entry_size,
                    entries: s.count.load(Ordering::Acquire),
                    pages: s.index.len(),
                })
                .collect(),
            cache: state.cache.stats(),
        }
    }

    // ---- commit ----

    /// Write all dirty pages and header state to storage.
    pub fn commit(&self) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.state.write().expect("file lock poisoned");
        self.commit_locked(&mut state, true)
    }

    fn commit_locked(&self, state: &mut State, write_all: bool) -> Result<()> {
        // V1 always writes everything: its super-block counts entries, so a
        // partial page must be durable before the count can mention it.
        let write_all = write_all || self.inner.format == Format::V1;

        let pages: Vec<Arc<Page>> = state.cache.pages().cloned().collect();
        let mut wrote = 0usize;
        for page in pages {
            if !page.is_dirty() || !(write_all || page.is_full()) {
                continue;
            }
            let offset = self.page_offset_sized(page.id, page.size);
            self.inner.storage.write_at(offset, &page.snapshot())?;
            if self.inner.format == Format::V2 {
                state.descriptors[page.id as usize].count = page.count();
            }
            page.mark_clean();
            wrote += 1;
        }

        // Fresh super-block: cyclic slot, strictly monotonic time stamp.
        let slot =
            self.inner.sb_index.fetch_add(1, Ordering::AcqRel) as usize % SUPER_BLOCK_COUNT;
        let count = match self.inner.format {
            Format::V1 => state
                .schemas
                .first()
                .map(|s| s.count.load(Ordering::Acquire) as u32)
                .unwrap_or(0),
            Format::V2 => state.page_count,
        };
        state.header.super_blocks[slot] = SuperBlock { time: self.next_time(), count, pad: 0 };

        self.write_header_pages(state)?;
        self.inner.storage.sync()?;
        let evicted = state.cache.evict_committed();
        debug!(wrote, evicted, count, "commit");
        Ok(())
    }

    fn write_header_pages(&self, state: &State) -> Result<()> {
        let header_bytes = state.header.to_bytes()?;
        match self.inner.format {
            Format::V1 => {
                let mut page = vec![0u8; PAGE_SIZE];
                page[..HEADER_SIZE].copy_from_slice(&header_bytes);
                if let Some(schema) = state.schemas.first() {
                    let blob = schema.schema.encode_blob()?;
                    page[HEADER_SIZE..HEADER_SIZE + SCHEMA_SIZE].copy_from_slice(&blob);
                }
                self.inner.storage.write_at(0, &page)?;
            }
            Format::V2 => {
                let mut header_page = 0u32;
                while header_page < state.page_count {
                    let mut page = vec![0u8; PAGE_SIZE];
                    page[..HEADER_SIZE].copy_from_slice(&header_bytes);
                    let window_end = state.page_count.min(header_page + TAGS_PER_HEADER);
                    for id in header_page..window_end {
                        let at = layout::descriptor_offset(id);
                        let desc = state.descriptors[id as usize].to_bytes()?;
                        page[at..at + DESCRIPTOR_SIZE].copy_from_slice(&desc);
                    }
                    self.inner.storage.write_at(layout::v2_page_offset(header_page), &page)?;
                    header_page += TAGS_PER_HEADER;
                }
            }
        }
        Ok(())
    }

    fn next_time(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        // Strictly monotonic even if the wall clock stalls.
        let previous = self
            .inner
            .last_time
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(0);
        now.max(previous + 1)
    }

    // ---- page plumbing ----

    fn page_offset(&self, page_id: u32, entry_size: usize) -> u64 {
        match self.inner.format {
            Format::V1 => layout::v1_page_offset(page_id, entry_size),
            Format::V2 => layout::v2_page_offset(page_id),
        }
    }

    /// Offset computed from the page's own byte size (V1 pages differ from
    /// `PAGE_SIZE`).
    fn page_offset_sized(&self, page_id: u32, page_size: usize) -> u64 {
        match self.inner.format {
            Format::V1 => PAGE_SIZE as u64 + (page_id as u64 - 1) * page_size as u64,
            Format::V2 => layout::v2_page_offset(page_id),
        }
    }

    fn page_size_for(&self, entry_size: usize) -> usize {
        match self.inner.format {
            Format::V1 => layout::v1_data_page_size(entry_size),
            Format::V2 => PAGE_SIZE,
        }
    }

    /// Records already durable in `page` (descriptor count in V2, position
    /// arithmetic in V1). Only meaningful for pages absent from the cache.
    fn page_record_count(&self, state: &State, page_id: u32, schema: &SchemaState) -> u32 {
        match self.inner.format {
            Format::V1 => {
                let rpp = schema.records_per_page();
                let before = (page_id as u64 - 1) * rpp;
                let total = schema.count.load(Ordering::Acquire);
                total.saturating_sub(before).min(rpp) as u32
            }
            Format::V2 => state
                .descriptors
                .get(page_id as usize)
                .map(|d| d.count)
                .unwrap_or(0),
        }
    }

    /// Reserve the next V2 page id, transparently inserting a header page at
    /// each 240-page boundary. Zero-extends storage so every allocated page
    /// fits inside the file.
    fn reserve_page_id(&self, state: &mut State) -> Result<u32> {
        debug_assert_eq!(self.inner.format, Format::V2);
        if layout::is_header_page(state.page_count) {
            let header_id = state.page_count;
            state.descriptors.push(PageDescriptor { tag: TAG_HEADER, ..Default::default() });
            state.page_count += 1;
            self.inner
                .storage
                .write_at(layout::v2_page_offset(header_id), &vec![0u8; PAGE_SIZE])?;
            debug!(header_id, "inserted chained header page");
        }
        let id = state.page_count;
        state.descriptors.push(PageDescriptor::default());
        state.page_count += 1;
        self.inner
            .storage
            .write_at(layout::v2_page_offset(id), &vec![0u8; PAGE_SIZE])?;
        Ok(id)
    }

    /// The page new records for this schema go into: the cached writable
    /// page, a partial last page resumed from disk, or a fresh allocation.
    fn writable_page(&self, schema: &Arc<SchemaState>) -> Result<Arc<Page>> {
        {
            let state = self.inner.state.read().expect("file lock poisoned");
            if let Some(page) = state.cache.writable_for(schema.tag) {
                if !page.is_full() {
                    return Ok(page);
                }
            }
        }

        let mut state = self.inner.state.write().expect("file lock poisoned");
        if let Some(page) = state.cache.writable_for(schema.tag) {
            if !page.is_full() {
                return Ok(page);
            }
            state.cache.clear_writable(schema.tag, page.id);
        }

        // The last page of the schema is the only candidate for resumed
        // writes; pick it back up if it is partial.
        if let Some(last) = schema.index.last() {
            let capacity = layout::records_per_page(schema.schema.entry_size);
            if let Some(page) = state.cache.get(last.page) {
                if !page.is_full() {
                    state.cache.set_writable(schema.tag, last.page);
                    return Ok(page);
                }
            } else {
                let committed = self.page_record_count(&state, last.page, schema);
                if committed < capacity {
                    let page = self.install_page(&mut state, last.page, schema, committed)?;
                    state.cache.set_writable(schema.tag, last.page);
                    return Ok(page);
                }
            }
        }

        self.allocate_entry_page(&mut state, schema)
    }

    fn allocate_entry_page(
        &self,
        state: &mut State,
        schema: &Arc<SchemaState>,
    ) -> Result<Arc<Page>> {
        let entry_size = schema.schema.entry_size;
        let size = self.page_size_for(entry_size);
        let id = match self.inner.format {
            Format::V1 => {
                let id = state.page_count;
                state.page_count += 1;
                self.inner
                    .storage
                    .write_at(self.page_offset_sized(id, size), &vec![0u8; size])?;
                id
            }
            Format::V2 => {
                let id = self.reserve_page_id(state)?;
                state.descriptors[id as usize] =
                    PageDescriptor { tag: schema.tag, flags: 0, count: 0, pad: 0 };
                id
            }
        };

        let generation = state.cache.next_generation();
        let page = Arc::new(Page::for_entries(id, schema.tag, generation, size, entry_size));
        schema.index.push(id, schema.count.load(Ordering::Acquire));
        state.cache.insert(Arc::clone(&page));
        state.cache.set_writable(schema.tag, id);
        state.cache.evict();
        debug!(page = id, tag = schema.tag, "allocated page");
        Ok(page)
    }

    /// A page for reading: cached, or installed from storage.
    fn page_for_read(&self, page_id: u32, schema: &Arc<SchemaState>) -> Result<Arc<Page>> {
        {
            let state = self.inner.state.read().expect("file lock poisoned");
            if let Some(page) = state.cache.get(page_id) {
                return Ok(page);
            }
        }
        let mut state = self.inner.state.write().expect("file lock poisoned");
        if let Some(page) = state.cache.get(page_id) {
            return Ok(page);
        }
        let committed = self.page_record_count(&state, page_id, schema);
        self.install_page(&mut state, page_id, schema, committed)
    }

    fn install_page(
        &self,
        state: &mut State,
        page_id: u32,
        schema: &Arc<SchemaState>,
        count: u32,
    ) -> Result<Arc<Page>> {
        let entry_size = schema.schema.entry_size;
        let size = self.page_size_for(entry_size);
        let mut bytes = vec![0u8; size];
        self.inner
            .storage
            .read_at(self.page_offset(page_id, entry_size), &mut bytes)?;
        let generation = state.cache.next_generation();
        let page = Arc::new(Page::from_bytes(
            page_id,
            schema.tag,
            generation,
            bytes,
            entry_size,
            count,
        ));
        state.cache.insert(Arc::clone(&page));
        state.cache.evict();
        Ok(page)
    }
}

/// Outward-facing snapshot of a file's state.
#[derive(Debug, Clone, Serialize)]
pub struct TsFileStats {
    pub format_flags: u16,
    pub page_count: u32,
    pub schema_count: usize,
    pub schemas: Vec<SchemaStats>,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaStats {
    pub name: String,
    pub tag: u16,
    pub entry_size: usize,
    pub entries: u64,
    pub pages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{FORMAT_V1, FORMAT_V2};
    use crate::schema::FieldValue;
    use crate::storage::MemStorage;

    fn mem() -> (Arc<MemStorage>, Box<dyn Storage>) {
        let storage = Arc::new(MemStorage::new());
        (Arc::clone(&storage), Box::new(storage))
    }

    fn int_schema(name: &str) -> Schema {
        Schema::builder(name).int32("I").build().unwrap()
    }

    #[test]
    fn test_empty_v2_roundtrip() {
        let (image, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V2).unwrap();
        assert_eq!(file.get_data_tags(), (TAG_DATA_BASE, TAG_DATA_BASE));
        file.put().unwrap();

        let file = TsFile::load(Box::new(MemStorage::from_bytes(image.to_bytes()))).unwrap();
        assert_eq!(file.get_data_tags(), (32, 32));
        file.put().unwrap();
    }

    #[test]
    fn test_one_entry() {
        let (_, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V2).unwrap();
        let tag = file.add_schema(&int_schema("points")).unwrap();
        assert_eq!(tag, 32);

        file.add_entries(tag, &[vec![FieldValue::Int(5)]]).unwrap();
        assert_eq!(file.get_entry_count(tag).unwrap(), 1);

        let rows = file.get_entries(tag, 0, 1).unwrap();
        assert_eq!(rows, vec![vec![FieldValue::Int(5)]]);

        // Reading past the last entry is a range error.
        assert!(matches!(
            file.get_entries(tag, 1, 1),
            Err(Error::OutOfRange { index: 1, count: 1 })
        ));
        file.put().unwrap();
    }

    #[test]
    fn test_two_schemas() {
        let (_, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V2).unwrap();
        let tag_i = file.add_schema(&int_schema("ints")).unwrap();
        let strings = Schema::builder("strings").string("S", 10).build().unwrap();
        let tag_s = file.add_schema(&strings).unwrap();
        assert_eq!((tag_i, tag_s), (32, 33));
        assert_eq!(file.get_data_tags(), (32, 34));

        file.add_entries(
            tag_s,
            &[
                vec![FieldValue::Str("a".into())],
                vec![FieldValue::Str("bbbbbbbbb".into())],
            ],
        )
        .unwrap();
        let rows = file.get_entries(tag_s, 1, 1).unwrap();
        assert_eq!(rows[0][0], FieldValue::Str("bbbbbbbbb".into()));
        file.put().unwrap();
    }

    #[test]
    fn test_v1_raw_import() {
        // Byte-perfect V1 image: header + schema on page 0, one data page
        // holding a single record {I = 5}.
        let schema = int_schema("points");
        let mut header = FileHeader::new(FORMAT_V1);
        header.super_blocks[0] = SuperBlock { time: 1, count: 1, pad: 0 };

        let dps = layout::v1_data_page_size(schema.entry_size);
        let mut image = vec![0u8; PAGE_SIZE + dps];
        image[..HEADER_SIZE].copy_from_slice(&header.to_bytes().unwrap());
        image[HEADER_SIZE..HEADER_SIZE + SCHEMA_SIZE]
            .copy_from_slice(&schema.encode_blob().unwrap());
        image[PAGE_SIZE..PAGE_SIZE + 4].copy_from_slice(&5i32.to_le_bytes());

        let file = TsFile::load(Box::new(MemStorage::from_bytes(image))).unwrap();
        let (first, last) = file.get_data_tags();
        assert_eq!((first, last), (32, 33));
        let loaded = file.get_schema(32).unwrap();
        loaded.validate(&schema).unwrap();

        assert_eq!(
            file.get_entries(32, 0, 1).unwrap(),
            vec![vec![FieldValue::Int(5)]]
        );

        file.add_entries(32, &[vec![FieldValue::Int(11)]]).unwrap();
        assert_eq!(file.get_entry_count(32).unwrap(), 2);
        assert_eq!(
            file.get_entries(32, 0, 2).unwrap(),
            vec![vec![FieldValue::Int(5)], vec![FieldValue::Int(11)]]
        );
        file.put().unwrap();
    }

    #[test]
    fn test_v1_truncated_image_rejected() {
        let schema = int_schema("points");
        let mut header = FileHeader::new(FORMAT_V1);
        // Declares more entries than the image holds pages for.
        header.super_blocks[0] = SuperBlock { time: 1, count: 5000, pad: 0 };

        let mut image = vec![0u8; PAGE_SIZE];
        image[..HEADER_SIZE].copy_from_slice(&header.to_bytes().unwrap());
        image[HEADER_SIZE..HEADER_SIZE + SCHEMA_SIZE]
            .copy_from_slice(&schema.encode_blob().unwrap());

        assert!(matches!(
            TsFile::load(Box::new(MemStorage::from_bytes(image))),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_parallel_writers() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let (_, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V2).unwrap();
        let schema = Schema::builder("chain").int32("L").int32("I").build().unwrap();
        let tag = file.add_schema(&schema).unwrap();

        const THREADS: u64 = 10;
        const PER_THREAD: u64 = 1000;
        let next = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    let handle = file.get();
                    for _ in 0..PER_THREAD {
                        let count = handle.get_entry_count(tag).unwrap();
                        let last = if count == 0 {
                            0
                        } else {
                            match &handle.get_entries(tag, count - 1, 1).unwrap()[0][1] {
                                FieldValue::Int(i) => *i,
                                other => panic!("unexpected value {other:?}"),
                            }
                        };
                        let seq = next.fetch_add(1, Ordering::AcqRel) as i64 + 1;
                        handle
                            .add_entries(
                                tag,
                                &[vec![FieldValue::Int(last), FieldValue::Int(seq)]],
                            )
                            .unwrap();
                    }
                    handle.put().unwrap();
                });
            }
        });

        let total = THREADS * PER_THREAD;
        assert_eq!(file.get_entry_count(tag).unwrap(), total);

        let rows = file.get_entries(tag, 0, total as usize).unwrap();
        let mut seen = vec![false; total as usize + 1];
        for row in &rows {
            let (l, i) = match (&row[0], &row[1]) {
                (FieldValue::Int(l), FieldValue::Int(i)) => (*l, *i),
                other => panic!("unexpected row {other:?}"),
            };
            assert!(i >= 1 && i <= total as i64);
            assert!(!seen[i as usize], "sequence {i} appears twice");
            seen[i as usize] = true;
            assert!(l == 0 || l < i, "last-seen {l} not older than {i}");
        }
        assert!(seen[1..].iter().all(|&b| b));
        file.put().unwrap();
    }

    #[test]
    fn test_reload_resumes_partial_page() {
        let (image, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V2).unwrap();
        let tag = file.add_schema(&int_schema("points")).unwrap();
        let rows: Vec<_> = (0..5).map(|i| vec![FieldValue::Int(i)]).collect();
        file.add_entries(tag, &rows).unwrap();
        file.put().unwrap();

        let file = TsFile::load(Box::new(MemStorage::from_bytes(image.to_bytes()))).unwrap();
        assert_eq!(file.get_entry_count(tag).unwrap(), 5);
        let stats = file.get_stats();
        assert_eq!(stats.schemas[0].pages, 1);

        file.add_entries(tag, &[vec![FieldValue::Int(100)]]).unwrap();
        assert_eq!(file.get_entry_count(tag).unwrap(), 6);
        // Still one page: the partial page was resumed, not reallocated.
        assert_eq!(file.get_stats().schemas[0].pages, 1);

        let rows = file.get_entries(tag, 0, 6).unwrap();
        assert_eq!(rows[5][0], FieldValue::Int(100));
        file.put().unwrap();
    }

    #[test]
    fn test_header_page_chain() {
        // Two records per page forces a header-page insertion at page 240.
        let schema = Schema::builder("wide")
            .int32("seq")
            .string("pad", 2044)
            .build()
            .unwrap();
        assert_eq!(layout::records_per_page(schema.entry_size), 2);

        let (image, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V2).unwrap();
        let tag = file.add_schema(&schema).unwrap();
        const N: usize = 600;
        for chunk in (0..N as i64).collect::<Vec<_>>().chunks(50) {
            let rows: Vec<_> = chunk
                .iter()
                .map(|i| vec![FieldValue::Int(*i), FieldValue::Str("x".into())])
                .collect();
            file.add_entries(tag, &rows).unwrap();
        }
        assert_eq!(file.get_entry_count(tag).unwrap(), N as u64);
        let stats = file.get_stats();
        assert!(stats.page_count > TAGS_PER_HEADER, "chain not exercised");
        file.put().unwrap();

        let file = TsFile::load(Box::new(MemStorage::from_bytes(image.to_bytes()))).unwrap();
        assert_eq!(file.get_entry_count(tag).unwrap(), N as u64);
        let rows = file.get_entries(tag, 599, 1).unwrap();
        assert_eq!(rows[0][0], FieldValue::Int(599));
        let rows = file.get_entries(tag, 0, N).unwrap();
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row[0], FieldValue::Int(i as i64));
        }
        file.put().unwrap();
    }

    #[test]
    fn test_add_file_import() {
        let (_, storage) = mem();
        let src = TsFile::create(storage, FORMAT_V2).unwrap();
        let tag = src.add_schema(&int_schema("points")).unwrap();
        let rows: Vec<_> = (0..10).map(|i| vec![FieldValue::Int(i)]).collect();
        src.add_entries(tag, &rows).unwrap();

        let (_, storage) = mem();
        let dst = TsFile::create(storage, FORMAT_V2).unwrap();
        dst.add_entries(dst.add_schema(&int_schema("points")).unwrap(), &rows[..3])
            .unwrap();

        dst.add_file(&src).unwrap();
        assert_eq!(dst.get_entry_count(tag).unwrap(), 13);
        let all = dst.get_entries(tag, 0, 13).unwrap();
        assert_eq!(all[3][0], FieldValue::Int(0));
        assert_eq!(all[12][0], FieldValue::Int(9));

        // Mismatched layouts under the same name are rejected.
        let (_, storage) = mem();
        let bad = TsFile::create(storage, FORMAT_V2).unwrap();
        let other = Schema::builder("points").int64("I").build().unwrap();
        bad.add_schema(&other).unwrap();
        assert!(matches!(bad.add_file(&src), Err(Error::Schema(_))));

        src.put().unwrap();
        dst.put().unwrap();
        bad.put().unwrap();
    }

    #[test]
    fn test_refcounting() {
        let (_, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V2).unwrap();
        assert_eq!(file.ref_count(), 1);

        let second = file.get();
        assert_eq!(file.ref_count(), 2);
        second.put().unwrap();
        assert_eq!(file.ref_count(), 1);

        let tag = file.add_schema(&int_schema("points")).unwrap();
        let third = file.get();
        file.put().unwrap();
        // Still open through the remaining handle.
        third.add_entries(tag, &[vec![FieldValue::Int(1)]]).unwrap();
        third.put().unwrap();
    }

    #[test]
    fn test_detach_skips_final_commit() {
        let (image, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V2).unwrap();
        let tag = file.add_schema(&int_schema("points")).unwrap();
        // A handful of records that stay in the partial writable page.
        file.add_entries(tag, &[vec![FieldValue::Int(1)], vec![FieldValue::Int(2)]])
            .unwrap();
        file.detach();

        let file = TsFile::load(Box::new(MemStorage::from_bytes(image.to_bytes()))).unwrap();
        // The schema was committed by add_schema; the uncommitted tail of
        // records was dropped with the handle.
        assert_eq!(file.get_data_tags(), (32, 33));
        assert_eq!(file.get_entry_count(32).unwrap(), 0);
        file.put().unwrap();
    }

    #[test]
    fn test_v1_single_schema_rules() {
        let (_, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V1).unwrap();
        file.add_schema(&int_schema("a")).unwrap();
        assert!(matches!(
            file.add_schema(&int_schema("b")),
            Err(Error::Schema(_))
        ));
        file.put().unwrap();

        // Extension types need the extension flag on V1.
        let (_, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V1).unwrap();
        let spans = Schema::builder("spans").start_time("t").int32("v").build().unwrap();
        assert!(matches!(file.add_schema(&spans), Err(Error::Format(_))));
        file.put().unwrap();

        let (_, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V1 | layout::FORMAT_EXT).unwrap();
        file.add_schema(&spans).unwrap();
        file.put().unwrap();
    }

    #[test]
    fn test_v1_write_reload() {
        let (image, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V1).unwrap();
        let tag = file.add_schema(&int_schema("points")).unwrap();
        let rows: Vec<_> = (0..2500).map(|i| vec![FieldValue::Int(i)]).collect();
        file.add_entries(tag, &rows).unwrap();
        file.put().unwrap();

        // 1024 records per page: three data pages.
        let file = TsFile::load(Box::new(MemStorage::from_bytes(image.to_bytes()))).unwrap();
        assert_eq!(file.get_entry_count(tag).unwrap(), 2500);
        let rows = file.get_entries(tag, 1024, 2).unwrap();
        assert_eq!(rows[0][0], FieldValue::Int(1024));
        assert_eq!(rows[1][0], FieldValue::Int(1025));
        file.put().unwrap();
    }

    #[test]
    fn test_unknown_tag_and_closed() {
        let (_, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V2).unwrap();
        assert!(matches!(file.get_entry_count(99), Err(Error::UnknownTag(99))));
        assert!(matches!(file.get_entry_count(5), Err(Error::UnknownTag(5))));

        let extra = file.get();
        file.put().unwrap();
        extra.put().unwrap();
    }

    #[test]
    fn test_stats_serialize() {
        let (_, storage) = mem();
        let file = TsFile::create(storage, FORMAT_V2).unwrap();
        let tag = file.add_schema(&int_schema("points")).unwrap();
        file.add_entries(tag, &[vec![FieldValue::Int(1)]]).unwrap();

        let stats = file.get_stats();
        assert_eq!(stats.schema_count, 1);
        assert_eq!(stats.schemas[0].entries, 1);
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"points\""));
        file.put().unwrap();
    }
}
