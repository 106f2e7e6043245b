//! Checksum utilities for spmd
//!
//! Two checksums guard shared-storage data: a SHA1 seal over the sorted
//! lines of a metadata store, and a byte-sum trailer on every mailbox.

use sha1::{Digest, Sha1};
use std::fmt::Write as _;

/// Metadata seal: hex SHA1 over `lines` sorted, each made ASCII-safe.
///
/// Non-ASCII characters are replaced by `&#NNN;` references before hashing
/// so the digest does not depend on the encoding used by the writer.
#[must_use]
pub fn metadata_seal<S: AsRef<str>>(lines: &[S]) -> String {
    let mut sorted: Vec<&str> = lines.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();

    let mut hasher = Sha1::new();
    for line in sorted {
        hasher.update(ascii_escape(line).as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn ascii_escape(line: &str) -> String {
    if line.is_ascii() {
        return line.to_string();
    }
    let mut out = String::with_capacity(line.len() + 8);
    for c in line.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let _ = write!(out, "&#{};", u32::from(c));
        }
    }
    out
}

/// Mailbox checksum: wrapping sum of all bytes
#[must_use]
pub fn byte_sum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}
