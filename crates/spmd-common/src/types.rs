//! Core type definitions for spmd
//!
//! Identifiers for domains, pools and volumes, the domain enums persisted in
//! metadata, and the cluster lease parameters.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Host identifier inside a pool. Also the index of the host's mailbox.
pub type HostId = u32;

/// Domain format versions this build can operate on
pub const SUPPORTED_DOMAIN_VERSIONS: &[u32] = &[0, 2];

/// Maximum length of a domain or pool description
pub const MAX_DESCRIPTION_LEN: usize = 50;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display)]
        #[display("{_0}")]
        pub struct $name(Uuid);

        impl $name {
            /// The all-zero identifier
            pub const BLANK: Self = Self(Uuid::nil());

            /// Generate a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Whether this is the all-zero identifier
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| Error::invalid_parameter(stringify!($name), s))
            }
        }
    };
}

uuid_id!(
    /// Storage domain identifier (sdUUID)
    DomainId
);
uuid_id!(
    /// Storage pool identifier (spUUID)
    PoolId
);
uuid_id!(
    /// Volume identifier
    VolumeId
);

/// Domain class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainClass {
    Data,
    Iso,
    Backup,
}

impl DomainClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Data => "Data",
            Self::Iso => "Iso",
            Self::Backup => "Backup",
        }
    }

    /// Numeric form used by callers of the API
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Data => 1,
            Self::Iso => 2,
            Self::Backup => 3,
        }
    }
}

impl fmt::Display for DomainClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "data" | "1" => Ok(Self::Data),
            "iso" | "2" => Ok(Self::Iso),
            "backup" | "3" => Ok(Self::Backup),
            _ => Err(Error::invalid_parameter("class", s)),
        }
    }
}

/// Domain role within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainRole {
    Regular,
    Master,
}

impl DomainRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "Regular",
            Self::Master => "Master",
        }
    }
}

impl fmt::Display for DomainRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "Regular" => Ok(Self::Regular),
            "Master" => Ok(Self::Master),
            _ => Err(Error::invalid_parameter("role", s)),
        }
    }
}

/// Membership status of a domain inside a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainStatus {
    Unattached,
    Attached,
    Active,
}

impl DomainStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unattached => "Unattached",
            Self::Attached => "Attached",
            Self::Active => "Active",
        }
    }

    /// Statuses reachable from `self`
    #[must_use]
    pub const fn successors(self) -> &'static [Self] {
        match self {
            Self::Attached => &[Self::Unattached, Self::Attached, Self::Active],
            Self::Unattached => &[Self::Attached],
            Self::Active => &[Self::Attached, Self::Active],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainStatus {
    type Err = Error;

    /// Case-insensitive; the legacy `Inactive` label reads as `Attached`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unattached" => Ok(Self::Unattached),
            "attached" | "inactive" => Ok(Self::Attached),
            "active" => Ok(Self::Active),
            _ => Err(Error::invalid_parameter("status", s)),
        }
    }
}

/// Backing storage technology of a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    Unknown,
    Nfs,
    Fcp,
    Iscsi,
    LocalFs,
    Cifs,
}

impl StorageType {
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Nfs => 1,
            Self::Fcp => 2,
            Self::Iscsi => 3,
            Self::LocalFs => 4,
            Self::Cifs => 5,
        }
    }

    #[must_use]
    pub const fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::Unknown),
            1 => Some(Self::Nfs),
            2 => Some(Self::Fcp),
            3 => Some(Self::Iscsi),
            4 => Some(Self::LocalFs),
            5 => Some(Self::Cifs),
            _ => None,
        }
    }

    /// Block domains keep metadata in a fixed-size raw region
    #[must_use]
    pub const fn is_block(self) -> bool {
        matches!(self, Self::Fcp | Self::Iscsi)
    }

    #[must_use]
    pub const fn is_file(self) -> bool {
        matches!(self, Self::Nfs | Self::LocalFs | Self::Cifs)
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Nfs => "nfs",
            Self::Fcp => "fcp",
            Self::Iscsi => "iscsi",
            Self::LocalFs => "localfs",
            Self::Cifs => "cifs",
        };
        f.write_str(name)
    }
}

impl FromStr for StorageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Self::from_number(n).ok_or_else(|| Error::invalid_parameter("type", s));
        }
        match s.to_ascii_lowercase().as_str() {
            "nfs" => Ok(Self::Nfs),
            "fcp" => Ok(Self::Fcp),
            "iscsi" => Ok(Self::Iscsi),
            "localfs" => Ok(Self::LocalFs),
            "cifs" => Ok(Self::Cifs),
            "unknown" => Ok(Self::Unknown),
            _ => Err(Error::invalid_parameter("type", s)),
        }
    }
}

/// Cluster lease tuning stored in every domain's metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseParams {
    pub policy: String,
    pub retries: u32,
    pub lease_time_sec: u32,
    pub renewal_interval_sec: u32,
    pub io_op_timeout_sec: u32,
}

impl Default for LeaseParams {
    fn default() -> Self {
        Self {
            policy: "ON".to_string(),
            retries: 3,
            lease_time_sec: 30,
            renewal_interval_sec: 5,
            io_op_timeout_sec: 1,
        }
    }
}

/// Check a description against [`MAX_DESCRIPTION_LEN`]
pub fn validate_description(description: &str) -> Result<()> {
    let len = description.chars().count();
    if len > MAX_DESCRIPTION_LEN {
        return Err(Error::DescriptionTooLong {
            len,
            max: MAX_DESCRIPTION_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [DomainStatus; 3] = [
        DomainStatus::Unattached,
        DomainStatus::Attached,
        DomainStatus::Active,
    ];

    #[test]
    fn test_domain_id_parse_and_blank() {
        let id = DomainId::new();
        let parsed: DomainId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(!id.is_blank());
        assert!(DomainId::BLANK.is_blank());
        assert_eq!(
            DomainId::BLANK.to_string(),
            "00000000-0000-0000-0000-000000000000"
        );
        assert!("not-a-uuid".parse::<DomainId>().is_err());
    }

    #[test]
    fn test_status_legacy_inactive() {
        assert_eq!(
            "Inactive".parse::<DomainStatus>().unwrap(),
            DomainStatus::Attached
        );
        assert_eq!("active".parse::<DomainStatus>().unwrap(), DomainStatus::Active);
        assert!("Frozen".parse::<DomainStatus>().is_err());
    }

    #[test]
    fn test_transition_table() {
        let legal = [
            (DomainStatus::Attached, DomainStatus::Unattached),
            (DomainStatus::Attached, DomainStatus::Attached),
            (DomainStatus::Attached, DomainStatus::Active),
            (DomainStatus::Unattached, DomainStatus::Attached),
            (DomainStatus::Active, DomainStatus::Attached),
            (DomainStatus::Active, DomainStatus::Active),
        ];
        for from in ALL_STATUSES {
            for to in ALL_STATUSES {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_storage_type_parse() {
        assert_eq!("3".parse::<StorageType>().unwrap(), StorageType::Iscsi);
        assert_eq!("localfs".parse::<StorageType>().unwrap(), StorageType::LocalFs);
        assert!(StorageType::Fcp.is_block());
        assert!(StorageType::Nfs.is_file());
        assert!("9".parse::<StorageType>().is_err());
    }

    #[test]
    fn test_class_parse() {
        assert_eq!("2".parse::<DomainClass>().unwrap(), DomainClass::Iso);
        assert_eq!("Backup".parse::<DomainClass>().unwrap(), DomainClass::Backup);
        assert_eq!(DomainClass::Data.number(), 1);
    }

    #[test]
    fn test_description_limit() {
        assert!(validate_description(&"x".repeat(MAX_DESCRIPTION_LEN)).is_ok());
        assert!(matches!(
            validate_description(&"x".repeat(MAX_DESCRIPTION_LEN + 1)),
            Err(Error::DescriptionTooLong { len: 51, max: 50 })
        ));
    }
}
