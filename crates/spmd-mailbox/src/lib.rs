//! spmd Mailbox - host to SPM messaging over shared storage
//!
//! Hosts cannot assume a network path to the SPM, so requests travel
//! through two raw regions of the master domain:
//!
//! ```text
//!            dom_md/inbox                      dom_md/outbox
//! HSM host ──writes its mailbox──►  SPM  ──writes host's mailbox──► HSM host
//!            (SPM reads all N)                 (HSM reads its own)
//! ```
//!
//! Each host owns one 4KB mailbox at `host_id * 4096` in both regions: 63
//! message slots of 64 bytes and a 4-byte checksum trailer. The slot index
//! is the only request identity.

pub mod dispatch;
pub mod hsm;
pub mod mailbox;
pub mod message;
pub mod spm;

pub use dispatch::DispatchPool;
pub use hsm::{ExtendCallback, ExtendTicket, HsmMailbox};
pub use mailbox::{MAILBOX_SIZE, MESSAGES_PER_MAILBOX, Mailbox};
pub use message::{CLEAN_MESSAGE, ExtendRequest, MESSAGE_SIZE, RawMessage};
pub use spm::{ExtendHandler, MessageHandler, SpmMailbox};
