//! tsfile: a paged, append-friendly binary time-series file format.
//!
//! Files are built from 4096-byte pages and come in two shapes: V1 (one
//! schema, header and schema on page 0, data pages sized to whole records)
//! and V2 (multiple schemas, header pages every 240 pages carrying page
//! descriptors, schema pages and entry pages in between). Four rotating
//! super-blocks in the header carry the commit pointer; the freshest time
//! stamp wins on load.
//!
//! The format supports schema evolution through `add_file` imports,
//! concurrent writers and readers on one handle, and random entry access
//! through per-schema page indexes.

pub mod cache;
pub mod error;
pub mod file;
pub mod index;
pub mod layout;
pub mod page;
pub mod schema;
pub mod storage;
pub mod validate;

// Re-exports for convenience
pub use cache::CacheStats;
pub use error::{Error, Result};
pub use file::{SchemaStats, TsFile, TsFileStats};
pub use layout::{FORMAT_EXT, FORMAT_V1, FORMAT_V2, PAGE_SIZE, TAG_DATA_BASE};
pub use schema::{Deserializer, Field, FieldType, FieldValue, Schema, SchemaBuilder};
pub use storage::{FileStorage, MemStorage, Storage};
pub use validate::{check_image, validate_image, ValidationReport};
