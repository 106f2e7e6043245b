//! Mailbox message format
//!
//! Message layout (64 bytes):
//! ```text
//! +---------+--------+-------------+-------------+------------+---------+
//! | version | opcode | domain uuid | volume uuid | size (MiB) | padding |
//! |   1B    |   4B   | 16B LE u128 | 16B LE u128 | 16 hex ch  | '0' ... |
//! +---------+--------+-------------+-------------+------------+---------+
//! ```
//!
//! A reply echoes the request header (version, opcode, both UUIDs) and
//! carries the granted size, or 0 when the operation failed.

use bytes::{Buf, BufMut, BytesMut};
use spmd_common::{DomainId, Error, Result, VolumeId};
use uuid::Uuid;

/// Size of one message
pub const MESSAGE_SIZE: usize = 64;

/// Protocol version byte
pub const MESSAGE_VERSION: u8 = b'1';

/// Opcode of a volume extend request
pub const EXTEND_OPCODE: [u8; 4] = *b"xtnd";

/// Width of the hex size field
pub const SIZE_CHARS: usize = 16;

/// Largest size a request may carry, in MiB
pub const VOLUME_MAX_SIZE_MB: u64 = 0xFFFF_FFFF;

/// Bytes a reply must share with its request
pub const HEADER_LEN: usize = 1 + 4 + 16 + 16;

/// Sentinel meaning "slot consumed"
pub const CLEAN_MESSAGE: RawMessage = [0x01; MESSAGE_SIZE];

/// One encoded slot
pub type RawMessage = [u8; MESSAGE_SIZE];

/// A slot whose version byte is NUL or ASCII `0` carries nothing
#[must_use]
pub fn is_empty_slot(raw: &[u8]) -> bool {
    matches!(raw.first(), None | Some(&(0 | b'0')))
}

#[must_use]
pub fn is_clean(raw: &[u8]) -> bool {
    raw == CLEAN_MESSAGE
}

/// Opcode of a raw message
#[must_use]
pub fn opcode(raw: &[u8]) -> Option<[u8; 4]> {
    raw.get(1..5)?.try_into().ok()
}

/// Whether `reply` answers `request`
#[must_use]
pub fn reply_matches(request: &[u8], reply: &[u8]) -> bool {
    request.len() >= HEADER_LEN && reply.len() >= HEADER_LEN && request[..HEADER_LEN] == reply[..HEADER_LEN]
}

/// Volume extend request, also used as its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendRequest {
    pub domain: DomainId,
    pub volume: VolumeId,
    /// Requested (or granted) size in MiB
    pub size_mb: u64,
}

impl ExtendRequest {
    pub fn new(domain: DomainId, volume: VolumeId, size_mb: u64) -> Result<Self> {
        if size_mb > VOLUME_MAX_SIZE_MB {
            return Err(Error::invalid_parameter("volumeSize", size_mb));
        }
        Ok(Self {
            domain,
            volume,
            size_mb,
        })
    }

    /// Size in bytes as understood by the volume backend
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_mb << 20
    }

    /// The same request with a different size, used to build replies
    #[must_use]
    pub const fn with_size(&self, size_mb: u64) -> Self {
        Self {
            domain: self.domain,
            volume: self.volume,
            size_mb,
        }
    }

    #[must_use]
    pub fn encode(&self) -> RawMessage {
        let mut buf = BytesMut::with_capacity(MESSAGE_SIZE);
        buf.put_u8(MESSAGE_VERSION);
        buf.put_slice(&EXTEND_OPCODE);
        buf.put_u128_le(self.domain.as_uuid().as_u128());
        buf.put_u128_le(self.volume.as_uuid().as_u128());
        buf.put_slice(format!("{:0>width$x}", self.size_mb, width = SIZE_CHARS).as_bytes());
        buf.resize(MESSAGE_SIZE, b'0');

        let mut raw = [0u8; MESSAGE_SIZE];
        raw.copy_from_slice(&buf);
        raw
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() != MESSAGE_SIZE {
            return Err(Error::invalid_message(format!("length {}", raw.len())));
        }
        let mut buf = raw;
        let version = buf.get_u8();
        if version != MESSAGE_VERSION {
            return Err(Error::invalid_message(format!("version {version:#x}")));
        }
        let mut code = [0u8; 4];
        buf.copy_to_slice(&mut code);
        if code != EXTEND_OPCODE {
            return Err(Error::invalid_message(format!(
                "opcode {:?}",
                String::from_utf8_lossy(&code)
            )));
        }
        let domain = DomainId::from_uuid(Uuid::from_u128(buf.get_u128_le()));
        let volume = VolumeId::from_uuid(Uuid::from_u128(buf.get_u128_le()));
        let size_field = std::str::from_utf8(&buf[..SIZE_CHARS])
            .map_err(|_| Error::invalid_message("size is not ASCII"))?;
        let size_mb = u64::from_str_radix(size_field, 16)
            .map_err(|_| Error::invalid_message(format!("size {size_field:?}")))?;
        Self::new(domain, volume, size_mb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(size_mb: u64) -> ExtendRequest {
        ExtendRequest::new(DomainId::new(), VolumeId::new(), size_mb).unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let domain: DomainId = "00112233-4455-6677-8899-aabbccddeeff".parse().unwrap();
        let volume = VolumeId::BLANK;
        let raw = ExtendRequest::new(domain, volume, 0x400).unwrap().encode();

        assert_eq!(raw[0], b'1');
        assert_eq!(&raw[1..5], b"xtnd");
        // Little-endian 128-bit integer: lowest byte first
        assert_eq!(raw[5], 0xff);
        assert_eq!(raw[20], 0x00);
        assert_eq!(&raw[37..53], b"0000000000000400");
        assert!(raw[53..].iter().all(|&b| b == b'0'));
    }

    #[test]
    fn test_decode_encoded() {
        let req = request(2048);
        assert_eq!(ExtendRequest::decode(&req.encode()).unwrap(), req);
        assert_eq!(req.size_bytes(), 2048 << 20);
    }

    #[test]
    fn test_reply_matching() {
        let req = request(100);
        assert!(reply_matches(&req.encode(), &req.with_size(0).encode()));
        assert!(!reply_matches(&req.encode(), &request(100).encode()));
    }

    #[test]
    fn test_rejects_bad_messages() {
        assert!(ExtendRequest::new(DomainId::new(), VolumeId::new(), VOLUME_MAX_SIZE_MB + 1).is_err());

        let mut raw = request(1).encode();
        raw[1] = b'X';
        assert!(matches!(ExtendRequest::decode(&raw), Err(Error::InvalidMessage(_))));

        let mut raw = request(1).encode();
        raw[40] = b'z';
        assert!(ExtendRequest::decode(&raw).is_err());

        assert!(ExtendRequest::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_slot_classification() {
        assert!(is_empty_slot(&[0u8; MESSAGE_SIZE]));
        assert!(is_empty_slot(b"0xtnd"));
        assert!(!is_empty_slot(&request(1).encode()));
        assert!(is_clean(&CLEAN_MESSAGE));
        assert!(!is_empty_slot(&CLEAN_MESSAGE));
        assert_eq!(opcode(&request(1).encode()), Some(EXTEND_OPCODE));
    }
}
