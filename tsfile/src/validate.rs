//! Offline validation of a TSFile byte image.
//!
//! Walks the raw image without constructing a handle and checks:
//! - magic and format-flag combination
//! - page alignment and super-block sanity
//! - header-page chain consistency (V2)
//! - schema blobs decode and their tags are contiguous
//! - every descriptor count fits its page
//! - per-schema totals (the recomputed `S.count`) match the page sums
//!
//! Problems that make the image unusable are errors; oddities a loader
//! would tolerate are warnings.

use serde::Serialize;

use crate::error::Result;
use crate::layout::{
    self, FileHeader, PageDescriptor, DESCRIPTOR_SIZE, FORMAT_V1, HEADER_SIZE, PAGE_SIZE,
    TAGS_PER_HEADER, TAG_DATA_BASE, TAG_EMPTY, TAG_HEADER,
};
use crate::schema::{Schema, SCHEMA_SIZE};

/// Per-schema statistics recomputed from the image.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaImageStats {
    pub tag: u16,
    pub name: String,
    pub entry_size: usize,
    pub entries: u64,
    pub pages: u32,
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub page_count: u32,
    pub schemas: Vec<SchemaImageStats>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn new() -> Self {
        Self {
            valid: true,
            page_count: 0,
            schemas: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.valid = false;
        self.errors.push(msg.into());
    }

    fn warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

/// Validate a raw TSFile image.
pub fn validate_image(data: &[u8]) -> ValidationReport {
    let mut report = ValidationReport::new();

    if data.len() < PAGE_SIZE {
        report.error(format!(
            "image too small: {} bytes (header page needs {PAGE_SIZE})",
            data.len()
        ));
        return report;
    }

    let header = match FileHeader::from_bytes(data) {
        Ok(h) => h,
        Err(e) => {
            report.error(format!("header unreadable: {e}"));
            return report;
        }
    };
    if let Err(e) = header.check() {
        report.error(e.to_string());
        return report;
    }
    let Some(sb) = header.authoritative().copied() else {
        report.error("no committed super-block");
        return report;
    };

    if header.flags & FORMAT_V1 != 0 {
        validate_v1(data, &header, sb.count as u64, &mut report);
    } else {
        validate_v2(data, sb.count, &mut report);
    }
    report
}

fn validate_v1(data: &[u8], header: &FileHeader, entries: u64, report: &mut ValidationReport) {
    let blob = &data[HEADER_SIZE..HEADER_SIZE + SCHEMA_SIZE];
    if blob.iter().all(|&b| b == 0) {
        if entries != 0 {
            report.error(format!("{entries} entries declared without a schema"));
        }
        report.page_count = 1;
        return;
    }
    let schema = match Schema::decode_blob(blob) {
        Ok(s) => s,
        Err(e) => {
            report.error(format!("schema blob: {e}"));
            return;
        }
    };
    if schema.requires_extension() && header.flags & layout::FORMAT_EXT == 0 {
        report.error("schema uses extension types, extension flag unset");
    }

    let rpp = layout::records_per_page(schema.entry_size) as u64;
    let pages = entries.div_ceil(rpp);
    let dps = layout::v1_data_page_size(schema.entry_size) as u64;
    let needed = PAGE_SIZE as u64 + pages * dps;
    if (data.len() as u64) < needed {
        report.error(format!(
            "{entries} entries need {needed} bytes, image holds {}",
            data.len()
        ));
    } else if data.len() as u64 > needed + dps {
        report.warning(format!(
            "image holds {} trailing bytes past the last entry page",
            data.len() as u64 - needed
        ));
    }

    report.page_count = pages as u32 + 1;
    report.schemas.push(SchemaImageStats {
        tag: TAG_DATA_BASE,
        name: schema.name,
        entry_size: schema.entry_size,
        entries,
        pages: pages as u32,
    });
}

fn validate_v2(data: &[u8], declared_pages: u32, report: &mut ValidationReport) {
    if data.len() % PAGE_SIZE != 0 {
        report.warning(format!(
            "image size {} is not a multiple of the page size",
            data.len()
        ));
    }

    // Collect descriptors along the header-page chain.
    let mut page_count = declared_pages.max(1);
    let mut descriptors: Vec<PageDescriptor> = Vec::new();
    let mut header_page = 0u32;
    loop {
        let at = header_page as usize * PAGE_SIZE;
        if at + PAGE_SIZE > data.len() {
            report.error(format!("header page {header_page} lies past the image end"));
            return;
        }
        let page = &data[at..at + PAGE_SIZE];
        if header_page != 0 {
            match FileHeader::from_bytes(page) {
                Ok(chained) => {
                    if let Err(e) = chained.check() {
                        report.error(format!("header page {header_page}: {e}"));
                        return;
                    }
                    if let Some(sb) = chained.authoritative() {
                        page_count = page_count.max(sb.count);
                    }
                }
                Err(e) => {
                    report.error(format!("header page {header_page}: {e}"));
                    return;
                }
            }
        }
        descriptors.resize(page_count as usize, PageDescriptor::default());
        descriptors[header_page as usize] =
            PageDescriptor { tag: TAG_HEADER, ..Default::default() };

        let window_end = page_count.min(header_page + TAGS_PER_HEADER);
        for id in header_page + 1..window_end {
            let at = layout::descriptor_offset(id);
            match PageDescriptor::from_bytes(&page[at..at + DESCRIPTOR_SIZE]) {
                Ok(desc) => descriptors[id as usize] = desc,
                Err(e) => report.error(format!("descriptor for page {id}: {e}")),
            }
        }
        if page_count <= header_page + TAGS_PER_HEADER {
            break;
        }
        header_page += TAGS_PER_HEADER;
    }
    report.page_count = page_count;

    if (data.len() as u64) < page_count as u64 * PAGE_SIZE as u64 {
        report.error(format!(
            "{page_count} pages declared, image holds {} bytes",
            data.len()
        ));
        return;
    }

    // Schemas, then per-tag record sums.
    let mut stats: Vec<SchemaImageStats> = Vec::new();
    for (id, desc) in descriptors.iter().enumerate() {
        if !desc.is_schema() || desc.tag < TAG_DATA_BASE {
            continue;
        }
        let at = id * PAGE_SIZE;
        match Schema::decode_blob(&data[at..at + SCHEMA_SIZE]) {
            Ok(schema) => stats.push(SchemaImageStats {
                tag: desc.tag,
                name: schema.name,
                entry_size: schema.entry_size,
                entries: 0,
                pages: 0,
            }),
            Err(e) => report.error(format!("schema page {id}: {e}")),
        }
    }
    stats.sort_by_key(|s| s.tag);
    for (pos, s) in stats.iter().enumerate() {
        if s.tag != TAG_DATA_BASE + pos as u16 {
            report.error(format!(
                "schema tags not contiguous: expected {}, found {}",
                TAG_DATA_BASE + pos as u16,
                s.tag
            ));
        }
    }

    for (id, desc) in descriptors.iter().enumerate() {
        match desc.tag {
            TAG_EMPTY | TAG_HEADER => continue,
            tag if tag >= TAG_DATA_BASE => {
                let Some(stat) = stats.iter_mut().find(|s| s.tag == tag) else {
                    report.error(format!("page {id} tagged {tag} has no schema page"));
                    continue;
                };
                if desc.is_schema() {
                    continue;
                }
                let capacity = layout::records_per_page(stat.entry_size);
                if desc.count > capacity {
                    report.error(format!(
                        "page {id} declares {} records, capacity is {capacity}",
                        desc.count
                    ));
                }
                stat.entries += desc.count as u64;
                stat.pages += 1;
            }
            tag => report.warning(format!("page {id} carries reserved tag {tag}")),
        }
    }

    report.schemas = stats;
}

/// Convenience wrapper: validate and fail on errors.
pub fn check_image(data: &[u8]) -> Result<ValidationReport> {
    let report = validate_image(data);
    if report.valid {
        Ok(report)
    } else {
        Err(crate::error::Error::Format(report.errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::TsFile;
    use crate::schema::{FieldValue, Schema};
    use crate::storage::MemStorage;
    use crate::layout::FORMAT_V2;
    use std::sync::Arc;

    fn build_image() -> Vec<u8> {
        let storage = Arc::new(MemStorage::new());
        let file = TsFile::create(Box::new(Arc::clone(&storage)), FORMAT_V2).unwrap();
        let schema = Schema::builder("points").int32("v").build().unwrap();
        let tag = file.add_schema(&schema).unwrap();
        let rows: Vec<_> = (0..100).map(|i| vec![FieldValue::Int(i)]).collect();
        file.add_entries(tag, &rows).unwrap();
        file.put().unwrap();
        storage.to_bytes()
    }

    #[test]
    fn test_valid_image() {
        let image = build_image();
        let report = validate_image(&image);
        assert!(report.valid, "errors: {:?}", report.errors);
        assert_eq!(report.schemas.len(), 1);
        assert_eq!(report.schemas[0].entries, 100);
        check_image(&image).unwrap();
    }

    #[test]
    fn test_empty_image() {
        let report = validate_image(&[]);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("too small")));
    }

    #[test]
    fn test_bad_magic() {
        let mut image = build_image();
        image[0] = b'X';
        let report = validate_image(&image);
        assert!(!report.valid);
    }

    #[test]
    fn test_corrupt_record_count() {
        let mut image = build_image();
        // Find the entry-page descriptor (tag 32, not schema) and inflate
        // its count past the page capacity.
        for slot in 1..TAGS_PER_HEADER as usize {
            let at = HEADER_SIZE + slot * DESCRIPTOR_SIZE;
            let desc = PageDescriptor::from_bytes(&image[at..at + DESCRIPTOR_SIZE]).unwrap();
            if desc.tag == TAG_DATA_BASE && !desc.is_schema() {
                let broken = PageDescriptor { count: 1_000_000, ..desc };
                image[at..at + DESCRIPTOR_SIZE].copy_from_slice(&broken.to_bytes().unwrap());
                break;
            }
        }
        let report = validate_image(&image);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("capacity")));
    }

    #[test]
    fn test_report_serializes() {
        let report = validate_image(&build_image());
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"valid\":true"));
    }
}
