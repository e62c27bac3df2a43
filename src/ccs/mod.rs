//! Cluster config store client
//!
//! Hierarchical key-value access on top of a [`KVStore`]. Values are JSON
//! documents written with a 4-space indent. A key may carry a field path
//! after a `|` separator, e.g. `/ovs/framework/hosts/<id>/ports|mds`; the
//! part after the bar is a dotted path into the document stored at the key.

pub mod arakoon;
pub mod keys;
pub mod mutex;

pub use arakoon::ArakoonConfig;
pub use mutex::{VolatileMutex, VolatileMutexGuard};

use crate::common::{CcsBackend, KVStore, MemStore, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Handle on the cluster config store
#[derive(Clone)]
pub struct Configuration {
    store: Arc<dyn KVStore>,
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration").finish_non_exhaustive()
    }
}

impl Configuration {
    pub fn new(store: Arc<dyn KVStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemStore::new()))
    }

    /// Open the backend selected in the controller configuration
    pub fn open(backend: &CcsBackend) -> Result<Self> {
        match backend {
            CcsBackend::Memory => Ok(Self::in_memory()),
            #[cfg(feature = "sled-backend")]
            CcsBackend::Sled { path } => Ok(Self::new(Arc::new(
                crate::common::storage::SledStore::open(path)?,
            ))),
            #[cfg(not(feature = "sled-backend"))]
            CcsBackend::Sled { .. } => Err(crate::Error::InvalidConfig(
                "sled CCS backend requires the `sled-backend` feature".into(),
            )),
        }
    }

    /// Serialize a value the way every CCS document is stored
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        value.serialize(&mut ser)?;
        Ok(out)
    }

    /// URL form of a key, as handed to services reading the CCS themselves
    pub fn configuration_url(key: &str) -> String {
        format!("ccs://{}", key)
    }

    /// Typed read. Returns `None` when the key or the field path is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let (key, path) = split_key(key);
        let raw = match self.store.get(key)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let doc: Value = serde_json::from_slice(&raw)?;
        match lookup(&doc, path) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Typed write. With a field path the surrounding document is kept and
    /// missing intermediate objects are created.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let (key, path) = split_key(key);
        match path {
            None => self.store.put(key, Self::serialize(value)?),
            Some(path) => {
                let mut doc = match self.store.get(key)? {
                    Some(raw) => serde_json::from_slice(&raw)?,
                    None => Value::Object(Default::default()),
                };
                assign(&mut doc, path, serde_json::to_value(value)?)?;
                self.store.put(key, Self::serialize(&doc)?)
            }
        }
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        let (bare, path) = split_key(key);
        match path {
            None => Ok(self.store.get(bare)?.is_some()),
            Some(_) => Ok(self.get::<Value>(key)?.is_some()),
        }
    }

    /// Delete a key, and with `recursive` everything below it.
    pub fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let key = key.trim_end_matches('/');
        self.store.delete(key)?;
        if recursive {
            for child in self.store.keys_with_prefix(&format!("{}/", key))? {
                self.store.delete(&child)?;
            }
        }
        Ok(())
    }

    /// Immediate children of a key, sorted and deduplicated
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let mut children = BTreeSet::new();
        for key in self.store.keys_with_prefix(&prefix)? {
            if let Some(child) = key[prefix.len()..].split('/').next() {
                if !child.is_empty() {
                    children.insert(child.to_string());
                }
            }
        }
        Ok(children.into_iter().collect())
    }

    pub fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(key)
    }

    pub fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.store.put(key, value)
    }

    /// Parsed value together with the exact stored bytes, for a later
    /// [`Configuration::compare_and_set_raw`] against that prior value.
    pub fn get_with_raw<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<(Option<T>, Option<Vec<u8>>)> {
        match self.store.get(key)? {
            Some(raw) => Ok((Some(serde_json::from_slice(&raw)?), Some(raw))),
            None => Ok((None, None)),
        }
    }

    /// Returns `false` when the stored value no longer equals `expected`.
    pub fn compare_and_set_raw(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool> {
        self.store.compare_and_swap(key, expected, new)
    }
}

fn split_key(key: &str) -> (&str, Option<&str>) {
    match key.split_once('|') {
        Some((key, path)) if !path.is_empty() => (key, Some(path)),
        Some((key, _)) => (key, None),
        None => (key, None),
    }
}

fn lookup<'a>(doc: &'a Value, path: Option<&str>) -> Option<&'a Value> {
    let mut current = doc;
    if let Some(path) = path {
        for part in path.split('.') {
            current = current.as_object()?.get(part)?;
        }
    }
    Some(current)
}

fn assign(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = doc;
    for (i, part) in parts.iter().enumerate() {
        let object = current.as_object_mut().ok_or_else(|| {
            crate::Error::InvalidParameter(format!("'{}' does not address an object", path))
        })?;
        if i == parts.len() - 1 {
            object.insert(part.to_string(), value);
            return Ok(());
        }
        current = object
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_path_addressing() {
        let ccs = Configuration::in_memory();
        ccs.set("/ovs/framework/hosts/m1/ports|mds", &[26300u16, 26399])
            .unwrap();
        ccs.set("/ovs/framework/hosts/m1/ports|storagedriver", &[26200u16, 26299])
            .unwrap();

        let mds: Vec<u16> = ccs.get("/ovs/framework/hosts/m1/ports|mds").unwrap().unwrap();
        assert_eq!(mds, vec![26300, 26399]);
        let whole: Value = ccs.get("/ovs/framework/hosts/m1/ports").unwrap().unwrap();
        assert_eq!(
            whole,
            json!({"mds": [26300, 26399], "storagedriver": [26200, 26299]})
        );
        assert!(ccs.exists("/ovs/framework/hosts/m1/ports|mds").unwrap());
        assert!(!ccs.exists("/ovs/framework/hosts/m1/ports|dtl").unwrap());
    }

    #[test]
    fn test_nested_path_creates_objects() {
        let ccs = Configuration::in_memory();
        ccs.set("/ovs/framework/messagequeue|queues.storagedriver", "volumerouter")
            .unwrap();
        let queue: String = ccs
            .get("/ovs/framework/messagequeue|queues.storagedriver")
            .unwrap()
            .unwrap();
        assert_eq!(queue, "volumerouter");
    }

    #[test]
    fn test_four_space_indent() {
        let ccs = Configuration::in_memory();
        ccs.set("/k", &json!({"a": 1})).unwrap();
        let raw = String::from_utf8(ccs.get_raw("/k").unwrap().unwrap()).unwrap();
        assert_eq!(raw, "{\n    \"a\": 1\n}");
    }

    #[test]
    fn test_list_and_recursive_delete() {
        let ccs = Configuration::in_memory();
        ccs.set("/ovs/vpools/p1/mds_config", &json!({})).unwrap();
        ccs.set("/ovs/vpools/p1/hosts/sd1/config/scocache", &json!({}))
            .unwrap();
        ccs.set("/ovs/vpools/p2/mds_config", &json!({})).unwrap();

        assert_eq!(ccs.list("/ovs/vpools").unwrap(), vec!["p1", "p2"]);
        assert_eq!(ccs.list("/ovs/vpools/p1/").unwrap(), vec!["hosts", "mds_config"]);

        ccs.delete("/ovs/vpools/p1", true).unwrap();
        assert_eq!(ccs.list("/ovs/vpools").unwrap(), vec!["p2"]);
    }

    #[test]
    fn test_compare_and_set_on_prior_value() {
        let ccs = Configuration::in_memory();
        ccs.set("/ovs/jobs/catchup/v1", &Vec::<u32>::new()).unwrap();
        let (value, raw) = ccs.get_with_raw::<Vec<u32>>("/ovs/jobs/catchup/v1").unwrap();
        assert_eq!(value, Some(vec![]));

        let next = Configuration::serialize(&vec![1u32]).unwrap();
        assert!(ccs
            .compare_and_set_raw("/ovs/jobs/catchup/v1", raw.as_deref(), Some(next.clone()))
            .unwrap());
        // same expected value again: the store moved on
        assert!(!ccs
            .compare_and_set_raw("/ovs/jobs/catchup/v1", raw.as_deref(), Some(next))
            .unwrap());
    }
}
