//! Domain Metadata Storage
//!
//! Every domain keeps its own metadata as `key=value` lines sealed by a
//! SHA1 checksum. Pool-wide fields live in the master domain's store.
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ SchemaView (typed get/set, first-match keys) │
//! └──────────────────────┬───────────────────────┘
//!                        │ encoded strings
//! ┌──────────────────────▼───────────────────────┐
//! │ MetadataStore                                 │
//! │  • in-memory map + validity flag              │
//! │  • reentrant transactions, one flush each     │
//! │  • rollback by overwriting with the snapshot  │
//! └──────────────────────┬───────────────────────┘
//!                        │ full line set per flush
//! ┌──────────────────────▼───────────────────────┐
//! │ MetadataBacking                               │
//! │  • FileMetadata:  write .new, then rename     │
//! │  • RangeMetadata: one padded write at offset  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! # On-disk format
//!
//! ```text
//! CLASS=Data
//! ROLE=Regular
//! ...
//! EOF
//! _SHA_CKSUM=<hex sha1 over the sorted key=value lines>
//! ```

mod backing;
mod schema;
mod store;

pub use backing::{FileMetadata, MetadataBacking, RangeMetadata};
pub use schema::{Codec, KeyPattern, Schema, SchemaEntry, SchemaView, Value};
pub use store::{CHECKSUM_KEY, EOF_MARKER, MetadataStore};
