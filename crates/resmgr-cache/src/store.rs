//! The policy-entry store: string-keyed values policies persist across
//! restarts.
//!
//! Values live in a typed in-memory map and, in parallel, as serialized
//! JSON strings which are what the snapshot carries. After a restore only
//! the JSON side is populated; the typed side fills in lazily on first
//! read and is cached from then on.

use std::{any::Any, collections::BTreeMap};

use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};
use tracing::{debug, error};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize policy entry {key:?}"))]
    SerializeEntry {
        source: serde_json::Error,
        key: String,
    },
}

/// Codec of one storable entry type. Blanket-implemented for everything
/// serde can handle; `CpuSet` and id-set maps get their list-string form
/// through their serde representation.
pub trait CacheEntry: Sized {
    fn to_entry_json(&self) -> serde_json::Result<String>;
    fn from_entry_json(json: &str) -> serde_json::Result<Self>;
}

impl<T> CacheEntry for T
where
    T: Serialize + DeserializeOwned,
{
    fn to_entry_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    fn from_entry_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Capability for caller-managed values: the store only ever sees their
/// JSON form.
pub trait Cachable {
    fn to_cache_json(&self) -> serde_json::Result<String>;
    fn from_cache_json(&mut self, json: &str) -> serde_json::Result<()>;
}

struct Entry {
    /// Unset for entries restored from a snapshot until first read.
    typed: Option<Box<dyn Any>>,
    json: String,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("typed", &self.typed.is_some())
            .field("json", &self.json)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct PolicyStore {
    entries: BTreeMap<String, Entry>,
}

impl PolicyStore {
    /// Stores a typed value under `key`, replacing any previous entry.
    pub fn set<T>(&mut self, key: &str, value: T) -> Result<()>
    where
        T: CacheEntry + Any,
    {
        let json = value.to_entry_json().context(SerializeEntrySnafu { key })?;
        self.entries.insert(
            key.to_owned(),
            Entry {
                typed: Some(Box::new(value)),
                json,
            },
        );
        Ok(())
    }

    /// Fetches the value stored under `key`.
    ///
    /// Entries restored from a snapshot deserialize on first read and the
    /// typed result is cached. Asking for a different type than what an
    /// entry holds is a stored-state incompatibility.
    pub fn get<T>(&mut self, key: &str) -> Option<T>
    where
        T: CacheEntry + Any + Clone,
    {
        let entry = self.entries.get_mut(key)?;

        if let Some(typed) = &entry.typed {
            let Some(value) = typed.downcast_ref::<T>() else {
                error!(key, "cache entry type mismatch, stored state is incompatible");
                return None;
            };
            return Some(value.clone());
        }

        match T::from_entry_json(&entry.json) {
            Ok(value) => {
                entry.typed = Some(Box::new(value.clone()));
                Some(value)
            }
            Err(err) => {
                error!(key, error = %err, "cache entry type mismatch, stored state is incompatible");
                None
            }
        }
    }

    pub fn set_cachable(&mut self, key: &str, value: &dyn Cachable) -> Result<()> {
        let json = value.to_cache_json().context(SerializeEntrySnafu { key })?;
        self.entries.insert(key.to_owned(), Entry { typed: None, json });
        Ok(())
    }

    /// Loads the entry under `key` into a caller-supplied receiver.
    /// Returns whether the entry existed and deserialized.
    pub fn get_cachable(&self, key: &str, into: &mut dyn Cachable) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return false;
        };
        match into.from_cache_json(&entry.json) {
            Ok(()) => true,
            Err(err) => {
                debug!(key, error = %err, "failed to deserialize cachable entry");
                false
            }
        }
    }

    /// The serialized form of every entry, as stored in the snapshot.
    pub fn to_json_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.json.clone()))
            .collect()
    }

    /// Replaces the store contents with snapshot data; typed values
    /// materialize lazily on read.
    pub fn load_json_map(&mut self, entries: BTreeMap<String, String>) {
        self.entries = entries
            .into_iter()
            .map(|(key, json)| (key, Entry { typed: None, json }))
            .collect();
    }
}
