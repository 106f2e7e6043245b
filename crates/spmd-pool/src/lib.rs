//! spmd Pool - Domains, pools and the SPM role
//!
//! This crate ties the storage primitives together:
//! - `Domain`: one storage domain with its metadata, lease and master area
//! - `DomainRegistry`: process-wide cache of domain objects
//! - `StoragePool`: pool membership, master relocation and the SPM role
//! - `ReconnectInfo`: the local record a restarted host reconnects from

pub mod domain;
pub mod migrate;
pub mod pool;
pub mod reconnect;
pub mod recovery;
pub mod registry;
pub mod spm;

#[cfg(test)]
mod testing;

// Re-exports
pub use domain::{DOMAIN_SCHEMA, Domain, DomainInfo};
pub use pool::{POOL_SCHEMA, PoolInfo, PoolState, StoragePool};
pub use reconnect::ReconnectInfo;
pub use recovery::RecoveryStack;
pub use registry::{DirectoryDomainSource, DomainRegistry, DomainSource};
pub use spm::{SpmInfo, SpmStatus};
