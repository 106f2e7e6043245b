//! Typed view over a [`MetadataStore`]
//!
//! A schema is an ordered list of entries, each naming a key (exactly or by
//! prefix) and the codec that turns the stored string into a [`Value`]. The
//! first matching entry wins.

use super::store::MetadataStore;
use spmd_common::{DomainClass, DomainId, DomainRole, DomainStatus, Error, Result, StorageType};
use std::collections::BTreeMap;

/// How a schema entry selects keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPattern {
    Exact(&'static str),
    Prefix(&'static str),
}

impl KeyPattern {
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(k) => key == *k,
            Self::Prefix(p) => key.starts_with(p),
        }
    }
}

/// Encoding of a stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Int,
    Text,
    /// Comma-separated strings, empty items dropped
    List,
    /// Comma-separated pool UUIDs, blank UUIDs dropped
    PoolList,
    /// `uuid:Status,...`
    DomainMap,
    Class,
    Role,
    StorageType,
}

/// Decoded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Text(String),
    List(Vec<String>),
    DomainMap(BTreeMap<DomainId, DomainStatus>),
    Class(DomainClass),
    Role(DomainRole),
    StorageType(StorageType),
}

const BLANK_UUID: &str = "00000000-0000-0000-0000-000000000000";

impl Codec {
    /// Decode the stored string of `key`
    pub fn decode(self, key: &str, raw: &str) -> Result<Value> {
        let bad = || Error::MetadataDecode {
            key: key.to_string(),
            value: raw.to_string(),
        };
        let raw = raw.trim();
        Ok(match self {
            Self::Int => Value::Int(raw.parse().map_err(|_| bad())?),
            Self::Text => Value::Text(raw.to_string()),
            Self::List => Value::List(split_list(raw).collect()),
            Self::PoolList => Value::List(split_list(raw).filter(|p| *p != BLANK_UUID).collect()),
            Self::DomainMap => {
                let mut map = BTreeMap::new();
                for item in split_list(raw) {
                    let (uuid, status) = item.split_once(':').ok_or_else(bad)?;
                    let uuid = uuid.trim().trim_matches(|c| c == '\'' || c == '"');
                    let status = status.trim().trim_matches(|c| c == '\'' || c == '"');
                    map.insert(
                        uuid.parse().map_err(|_| bad())?,
                        status.parse().map_err(|_| bad())?,
                    );
                }
                Value::DomainMap(map)
            }
            Self::Class => Value::Class(raw.parse().map_err(|_| bad())?),
            Self::Role => Value::Role(raw.parse().map_err(|_| bad())?),
            Self::StorageType => Value::StorageType(raw.parse().map_err(|_| bad())?),
        })
    }

    /// Encode `value`; fails when the value variant does not fit this codec
    pub fn encode(self, key: &str, value: &Value) -> Result<String> {
        Ok(match (self, value) {
            (Self::Int, Value::Int(n)) => n.to_string(),
            (Self::Text, Value::Text(s)) => s.clone(),
            (Self::List | Self::PoolList, Value::List(items)) => items.join(","),
            (Self::DomainMap, Value::DomainMap(map)) => map
                .iter()
                .map(|(uuid, status)| format!("{uuid}:{status}"))
                .collect::<Vec<_>>()
                .join(","),
            (Self::Class, Value::Class(c)) => c.to_string(),
            (Self::Role, Value::Role(r)) => r.to_string(),
            (Self::StorageType, Value::StorageType(t)) => t.number().to_string(),
            _ => return Err(Error::invalid_parameter(key, format!("{value:?}"))),
        })
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// One schema entry
#[derive(Debug, Clone, Copy)]
pub struct SchemaEntry {
    pub pattern: KeyPattern,
    pub codec: Codec,
    /// Encoded default returned when the key is absent
    pub default: Option<&'static str>,
}

impl SchemaEntry {
    #[must_use]
    pub const fn exact(key: &'static str, codec: Codec) -> Self {
        Self {
            pattern: KeyPattern::Exact(key),
            codec,
            default: None,
        }
    }

    #[must_use]
    pub const fn prefix(prefix: &'static str, codec: Codec) -> Self {
        Self {
            pattern: KeyPattern::Prefix(prefix),
            codec,
            default: None,
        }
    }

    #[must_use]
    pub const fn or(self, default: &'static str) -> Self {
        Self {
            default: Some(default),
            ..self
        }
    }
}

/// Ordered list of entries, first match wins
#[derive(Debug)]
pub struct Schema {
    pub name: &'static str,
    pub entries: &'static [SchemaEntry],
}

impl Schema {
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<&SchemaEntry> {
        self.entries.iter().find(|e| e.pattern.matches(key))
    }

    /// Typed view of `store` through this schema
    #[must_use]
    pub const fn view<'a>(&'a self, store: &'a MetadataStore) -> SchemaView<'a> {
        SchemaView {
            store,
            schema: self,
        }
    }
}

/// A [`MetadataStore`] read and written through a [`Schema`]
pub struct SchemaView<'a> {
    store: &'a MetadataStore,
    schema: &'a Schema,
}

impl SchemaView<'_> {
    fn entry(&self, key: &str) -> Result<&SchemaEntry> {
        self.schema
            .resolve(key)
            .ok_or_else(|| Error::KeyNotAllowed(format!("{}:{}", self.schema.name, key)))
    }

    #[must_use]
    pub const fn store(&self) -> &MetadataStore {
        self.store
    }

    /// Decoded value of `key`, or its default
    pub fn get(&self, key: &str) -> Result<Value> {
        let entry = self.entry(key)?;
        match self.store.get(key)? {
            Some(raw) => entry.codec.decode(key, &raw),
            None => match entry.default {
                Some(default) => entry.codec.decode(key, default),
                None => Err(Error::MetadataMissing(key.to_string())),
            },
        }
    }

    /// Decoded value of `key`, ignoring defaults
    pub fn get_opt(&self, key: &str) -> Result<Option<Value>> {
        let entry = self.entry(key)?;
        self.store
            .get(key)?
            .map(|raw| entry.codec.decode(key, &raw))
            .transpose()
    }

    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        let encoded = self.entry(key)?.codec.encode(key, value)?;
        self.store.set(key, &encoded)
    }

    /// Set several keys in one flush
    pub fn update(&self, items: &[(&str, Value)]) -> Result<()> {
        let encoded = items
            .iter()
            .map(|(key, value)| Ok(((*key).to_string(), self.entry(key)?.codec.encode(key, value)?)))
            .collect::<Result<Vec<_>>>()?;
        self.store.update(encoded)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.entry(key)?;
        self.store.remove(key).map(|_| ())
    }

    /// Decode every stored key. Keys the schema does not know are returned as text.
    pub fn copy(&self) -> Result<BTreeMap<String, Value>> {
        self.store
            .snapshot()?
            .into_iter()
            .map(|(key, raw)| {
                let value = match self.schema.resolve(&key) {
                    Some(entry) => entry.codec.decode(&key, &raw)?,
                    None => Value::Text(raw),
                };
                Ok((key, value))
            })
            .collect()
    }

    pub fn transaction<R>(&self, body: impl FnOnce(&Self) -> Result<R>) -> Result<R> {
        self.store.transaction(|_| body(self))
    }

    pub fn int(&self, key: &str) -> Result<i64> {
        match self.get(key)? {
            Value::Int(n) => Ok(n),
            other => Err(self.mismatch(key, &other)),
        }
    }

    pub fn text(&self, key: &str) -> Result<String> {
        match self.get(key)? {
            Value::Text(s) => Ok(s),
            other => Err(self.mismatch(key, &other)),
        }
    }

    pub fn list(&self, key: &str) -> Result<Vec<String>> {
        match self.get(key)? {
            Value::List(items) => Ok(items),
            other => Err(self.mismatch(key, &other)),
        }
    }

    pub fn domain_map(&self, key: &str) -> Result<BTreeMap<DomainId, DomainStatus>> {
        match self.get(key)? {
            Value::DomainMap(map) => Ok(map),
            other => Err(self.mismatch(key, &other)),
        }
    }

    pub fn class(&self, key: &str) -> Result<DomainClass> {
        match self.get(key)? {
            Value::Class(c) => Ok(c),
            other => Err(self.mismatch(key, &other)),
        }
    }

    pub fn role(&self, key: &str) -> Result<DomainRole> {
        match self.get(key)? {
            Value::Role(r) => Ok(r),
            other => Err(self.mismatch(key, &other)),
        }
    }

    pub fn storage_type(&self, key: &str) -> Result<StorageType> {
        match self.get(key)? {
            Value::StorageType(t) => Ok(t),
            other => Err(self.mismatch(key, &other)),
        }
    }

    fn mismatch(&self, key: &str, value: &Value) -> Error {
        Error::internal(format!(
            "schema {} decodes {} as {:?}",
            self.schema.name, key, value
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::backing::FileMetadata;

    static TEST_SCHEMA: Schema = Schema {
        name: "test",
        entries: &[
            SchemaEntry::exact("VERSION", Codec::Int).or("0"),
            SchemaEntry::exact("PVLIST", Codec::List),
            SchemaEntry::prefix("PV", Codec::Text),
            SchemaEntry::exact("POOL_UUID", Codec::PoolList).or(""),
            SchemaEntry::exact("POOL_DOMAINS", Codec::DomainMap).or(""),
            SchemaEntry::exact("CLASS", Codec::Class),
            SchemaEntry::exact("TYPE", Codec::StorageType),
        ],
    };

    fn store(dir: &tempfile::TempDir) -> MetadataStore {
        MetadataStore::new(FileMetadata::new(dir.path().join("metadata")))
    }

    #[test]
    fn test_defaults_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let view = TEST_SCHEMA.view(&store);
        assert_eq!(view.int("VERSION").unwrap(), 0);
        assert!(view.list("POOL_UUID").unwrap().is_empty());
        assert!(matches!(view.class("CLASS"), Err(Error::MetadataMissing(_))));
        assert_eq!(view.get_opt("VERSION").unwrap(), None);
    }

    #[test]
    fn test_first_match_wins() {
        assert_eq!(TEST_SCHEMA.resolve("PVLIST").unwrap().codec, Codec::List);
        assert_eq!(TEST_SCHEMA.resolve("PV0").unwrap().codec, Codec::Text);
        assert!(TEST_SCHEMA.resolve("NOPE").is_none());
    }

    #[test]
    fn test_unknown_key_rejected_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let view = TEST_SCHEMA.view(&store);
        assert!(matches!(
            view.set("NOPE", &Value::Int(1)),
            Err(Error::KeyNotAllowed(_))
        ));
        assert!(matches!(
            view.set("VERSION", &Value::Text("x".into())),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_domain_map_decoding() {
        let a = DomainId::new();
        let b = DomainId::new();
        let raw = format!("{a}:active, '{b}':'inactive'");
        let value = Codec::DomainMap.decode("POOL_DOMAINS", &raw).unwrap();
        let Value::DomainMap(map) = value else {
            panic!("expected domain map");
        };
        assert_eq!(map[&a], DomainStatus::Active);
        assert_eq!(map[&b], DomainStatus::Attached);

        let encoded = Codec::DomainMap
            .encode("POOL_DOMAINS", &Value::DomainMap(map.clone()))
            .unwrap();
        assert!(encoded.contains(&format!("{a}:Active")));
        assert!(Codec::DomainMap.decode("POOL_DOMAINS", "garbage").is_err());
    }

    #[test]
    fn test_pool_list_drops_blank() {
        let value = Codec::PoolList
            .decode("POOL_UUID", &format!("{BLANK_UUID},abc,"))
            .unwrap();
        assert_eq!(value, Value::List(vec!["abc".to_string()]));
    }

    #[test]
    fn test_copy_reports_unknown_keys_raw() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.update([("VERSION", "2"), ("LEGACY", "x"), ("TYPE", "3")]).unwrap();
        let copy = TEST_SCHEMA.view(&store).copy().unwrap();
        assert_eq!(copy["VERSION"], Value::Int(2));
        assert_eq!(copy["LEGACY"], Value::Text("x".into()));
        assert_eq!(copy["TYPE"], Value::StorageType(StorageType::Iscsi));
    }

    #[test]
    fn test_view_transaction_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let view = TEST_SCHEMA.view(&store);
        view.set("VERSION", &Value::Int(1)).unwrap();

        let result: Result<()> = view.transaction(|v| {
            v.set("VERSION", &Value::Int(5))?;
            v.set("CLASS", &Value::Int(5))
        });
        assert!(result.is_err());
        assert_eq!(view.int("VERSION").unwrap(), 1);
    }
}
