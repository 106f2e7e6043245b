//! Mailbox image
//!
//! A mailbox is the unit of every transfer: 63 message slots followed by a
//! checksum trailer. The trailer is the little-endian byte sum of the first
//! 4092 bytes, so an all-zero mailbox carries checksum 0 and reads as empty.

use crate::message::{MESSAGE_SIZE, RawMessage};
use spmd_common::checksum::byte_sum;
use spmd_common::{Error, Result};

/// Size of one host's mailbox
pub const MAILBOX_SIZE: usize = 4096;

/// Size of the checksum trailer
pub const CHECKSUM_BYTES: usize = 4;

/// Slot positions in a mailbox; the last one holds the trailer
pub const SLOTS_PER_MAILBOX: usize = MAILBOX_SIZE / MESSAGE_SIZE;

/// Slots usable for messages
pub const MESSAGES_PER_MAILBOX: usize = SLOTS_PER_MAILBOX - 1;

const CHECKSUM_OFFSET: usize = MAILBOX_SIZE - CHECKSUM_BYTES;

/// Checksum the first 4092 bytes of `mailbox` would need
#[must_use]
pub fn compute_checksum(mailbox: &[u8]) -> u32 {
    byte_sum(&mailbox[..CHECKSUM_OFFSET])
}

/// Checksum stored in the trailer of `mailbox`
#[must_use]
pub fn stored_checksum(mailbox: &[u8]) -> u32 {
    let mut trailer = [0u8; CHECKSUM_BYTES];
    trailer.copy_from_slice(&mailbox[CHECKSUM_OFFSET..MAILBOX_SIZE]);
    u32::from_le_bytes(trailer)
}

/// Write the trailer of `mailbox`
pub fn seal(mailbox: &mut [u8]) {
    let checksum = compute_checksum(mailbox);
    mailbox[CHECKSUM_OFFSET..MAILBOX_SIZE].copy_from_slice(&checksum.to_le_bytes());
}

/// Whether the trailer of `mailbox` matches its content
#[must_use]
pub fn verify(mailbox: &[u8]) -> bool {
    mailbox.len() >= MAILBOX_SIZE && stored_checksum(mailbox) == compute_checksum(mailbox)
}

/// Byte range of slot `slot` inside a mailbox
#[must_use]
pub const fn slot_range(slot: usize) -> std::ops::Range<usize> {
    slot * MESSAGE_SIZE..(slot + 1) * MESSAGE_SIZE
}

/// One host's mailbox
#[derive(Clone, PartialEq, Eq)]
pub struct Mailbox {
    bytes: Vec<u8>,
}

impl Mailbox {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            bytes: vec![0u8; MAILBOX_SIZE],
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != MAILBOX_SIZE {
            return Err(Error::invalid_message(format!(
                "mailbox of {} bytes",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn slot(&self, slot: usize) -> &[u8] {
        &self.bytes[slot_range(slot)]
    }

    pub fn set_slot(&mut self, slot: usize, message: &RawMessage) {
        self.bytes[slot_range(slot)].copy_from_slice(message);
    }

    pub fn clear_slot(&mut self, slot: usize) {
        self.bytes[slot_range(slot)].fill(0);
    }

    /// Recompute the trailer
    pub fn seal(&mut self) {
        seal(&mut self.bytes);
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        verify(&self.bytes)
    }

    /// Valid and without any content
    #[must_use]
    pub fn is_empty(&self) -> bool {
        stored_checksum(&self.bytes) == 0 && self.is_valid()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let used = (0..MESSAGES_PER_MAILBOX)
            .filter(|&i| !crate::message::is_empty_slot(self.slot(i)))
            .count();
        f.debug_struct("Mailbox")
            .field("used_slots", &used)
            .field("checksum", &stored_checksum(&self.bytes))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CLEAN_MESSAGE, ExtendRequest};
    use rand::Rng;
    use spmd_common::{DomainId, VolumeId};

    fn filled() -> Mailbox {
        let mut mailbox = Mailbox::empty();
        for slot in [0, 7, MESSAGES_PER_MAILBOX - 1] {
            let req = ExtendRequest::new(DomainId::new(), VolumeId::new(), 512).unwrap();
            mailbox.set_slot(slot, &req.encode());
        }
        mailbox.set_slot(3, &CLEAN_MESSAGE);
        mailbox.seal();
        mailbox
    }

    #[test]
    fn test_geometry() {
        assert_eq!(SLOTS_PER_MAILBOX, 64);
        assert_eq!(MESSAGES_PER_MAILBOX, 63);
        assert_eq!(slot_range(MESSAGES_PER_MAILBOX).end, CHECKSUM_OFFSET + CHECKSUM_BYTES);
    }

    #[test]
    fn test_zero_mailbox_is_empty_and_valid() {
        let mailbox = Mailbox::empty();
        assert!(mailbox.is_valid());
        assert!(mailbox.is_empty());
        assert!(!filled().is_empty());
    }

    #[test]
    fn test_sealed_mailbox_validates() {
        let mailbox = filled();
        assert!(mailbox.is_valid());
        assert_eq!(stored_checksum(mailbox.as_bytes()), compute_checksum(mailbox.as_bytes()));
    }

    #[test]
    fn test_any_corrupt_byte_is_rejected() {
        let original = filled();
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let mut bytes = original.as_bytes().to_vec();
            let pos = rng.gen_range(0..MAILBOX_SIZE);
            bytes[pos] = bytes[pos].wrapping_add(rng.gen_range(1..=255u8));
            let corrupted = Mailbox::from_bytes(bytes).unwrap();
            assert!(!corrupted.is_valid(), "corruption at {pos} accepted");
        }
    }

    #[test]
    fn test_unsealed_change_is_rejected() {
        let mut mailbox = filled();
        mailbox.clear_slot(0);
        assert!(!mailbox.is_valid());
        mailbox.seal();
        assert!(mailbox.is_valid());
    }

    #[test]
    fn test_wrong_size() {
        assert!(Mailbox::from_bytes(vec![0u8; 100]).is_err());
    }
}
