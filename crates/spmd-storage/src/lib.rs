//! spmd Storage - Shared-storage primitives
//!
//! This crate implements the building blocks every domain is made of:
//! - Positional raw I/O with optional `O_DIRECT`
//! - The byte-range abstraction backing metadata and mailboxes
//! - The checksummed, transactional metadata store and its schema
//! - The cluster lease used for cross-host exclusion
//! - The on-disk directory layout of a domain
//! - The volume backend performing extend requests

pub mod layout;
pub mod lease;
pub mod metadata;
pub mod range;
pub mod raw_io;
pub mod volume;

// Re-exports
pub use layout::DomainLayout;
pub use lease::{ClusterLease, FileLease};
pub use metadata::{
    Codec, FileMetadata, KeyPattern, MetadataBacking, MetadataStore, RangeMetadata, Schema,
    SchemaEntry, SchemaView, Value,
};
pub use range::{ByteRange, MemoryRange, RawRange};
pub use raw_io::{ALIGNMENT, AlignedBuffer, RawFile};
pub use volume::{FileVolumeBackend, VolumeBackend};
