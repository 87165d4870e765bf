use crate::membership::Delegate;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Static description of how to reach a node, advertised alongside its
/// membership record. Ordered so that it always encodes to the same bytes.
pub type NodeMetadata = BTreeMap<String, String>;

/// A single configuration property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

impl ConfigEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Node-local configuration set, replicated through push/pull exchanges.
///
/// Every read and write of the mapping goes through one [`Mutex`], so a merge
/// is never observed half applied. Keys are never removed: a merge either
/// inserts a key or overwrites its value.
///
/// The merge rule is a plain overwrite. There are no timestamps or version
/// vectors, so with concurrent writes of the same key on different nodes the
/// value that survives depends on the order and direction of the exchanges.
#[derive(Debug, Default)]
pub struct ConfigStore {
    /// Never mutated after construction, so it lives outside the lock.
    metadata: NodeMetadata,

    config: Mutex<HashMap<String, String>>,
}

impl ConfigStore {
    pub fn new(metadata: NodeMetadata) -> ConfigStore {
        ConfigStore {
            metadata,
            config: Mutex::new(HashMap::new()),
        }
    }

    pub fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    /// Insert or overwrite the value of a key.
    pub fn put(&self, key: String, value: String) {
        debug!(key, value, "Setting key");
        self.lock().insert(key, value);
    }

    /// Retrieve the value of a key, or an empty string when it was never set.
    pub fn get(&self, key: &str) -> String {
        self.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// An ordered copy of the current configuration set.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Serialize the static metadata, refusing payloads above `limit` bytes.
    pub fn encode_metadata(&self, limit: usize) -> Result<Vec<u8>> {
        let data = bincode::serialize(&self.metadata).map_err(|source| Error::Encode {
            what: "node metadata",
            source,
        })?;
        if data.len() > limit {
            return Err(Error::MetadataTooLarge {
                size: data.len(),
                limit,
            });
        }
        Ok(data)
    }

    /// Serialize the whole configuration set for a push/pull exchange.
    pub fn encode_local_state(&self) -> Result<Vec<u8>> {
        let config = self.lock();
        bincode::serialize(&*config).map_err(|source| Error::Encode {
            what: "local state",
            source,
        })
    }

    /// Apply a remote configuration set on top of the local one.
    ///
    /// Keys missing locally or holding a different value take the remote
    /// value; keys the remote does not know about are left alone. Returns the
    /// number of keys that changed. A payload that fails to decode leaves the
    /// store untouched.
    pub fn merge_remote_state(&self, buf: &[u8]) -> Result<usize> {
        let remote: HashMap<String, String> =
            bincode::deserialize(buf).map_err(|source| Error::Decode {
                what: "remote state",
                source,
            })?;

        let mut config = self.lock();
        let mut updated = 0;
        for (key, value) in remote {
            if config.get(&key) != Some(&value) {
                debug!(key, value, "Updating config from remote state");
                config.insert(key, value);
                updated += 1;
            }
        }
        debug!(updated, "Merged remote state");
        Ok(updated)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        // Nothing panics while holding the guard, but don't take the node down
        // with a poisoned lock if something ever does.
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Delegate for ConfigStore {
    fn node_meta(&self, limit: usize) -> Result<Vec<u8>> {
        self.encode_metadata(limit)
    }

    // Point-to-point messages are not used, push/pull carries everything.
    fn notify_msg(&self, _msg: &[u8]) {}

    fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn local_state(&self, _join: bool) -> Result<Vec<u8>> {
        self.encode_local_state()
    }

    fn merge_remote_state(&self, buf: &[u8], _join: bool) -> Result<()> {
        ConfigStore::merge_remote_state(self, buf).map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn store_with(entries: &[(&str, &str)]) -> ConfigStore {
        let store = ConfigStore::default();
        for (k, v) in entries {
            store.put(k.to_string(), v.to_string());
        }
        store
    }

    #[test]
    fn get_returns_last_put() {
        let store = ConfigStore::default();
        store.put("key1".to_owned(), "value1".to_owned());
        assert_eq!(store.get("key1"), "value1");

        store.put("key1".to_owned(), "value2".to_owned());
        assert_eq!(store.get("key1"), "value2");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn get_missing_key_is_empty() {
        let store = store_with(&[("key1", "value1")]);
        assert_eq!(store.get("key2"), "");
    }

    #[test]
    fn merge_twice_is_idempotent() {
        let local = store_with(&[("a", "1")]);
        let remote = store_with(&[("a", "2"), ("b", "3")]);
        let state = remote.encode_local_state().unwrap();

        assert_eq!(local.merge_remote_state(&state).unwrap(), 2);
        let after_first = local.snapshot();

        assert_eq!(local.merge_remote_state(&state).unwrap(), 0);
        assert_eq!(local.snapshot(), after_first);
    }

    #[test]
    fn merge_disjoint_is_union() {
        let local = store_with(&[("a", "1"), ("b", "2")]);
        let remote = store_with(&[("c", "3")]);

        local
            .merge_remote_state(&remote.encode_local_state().unwrap())
            .unwrap();

        let expected: BTreeMap<String, String> = [("a", "1"), ("b", "2"), ("c", "3")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(local.snapshot(), expected);
    }

    #[test]
    fn merge_never_drops_local_keys() {
        let local = store_with(&[("only.local", "x"), ("shared", "old")]);
        let remote = store_with(&[("shared", "new")]);

        local
            .merge_remote_state(&remote.encode_local_state().unwrap())
            .unwrap();

        assert_eq!(local.get("only.local"), "x");
        assert_eq!(local.get("shared"), "new");
    }

    // There is no conflict resolution: whichever side is merged into last
    // decides the surviving value.
    #[test]
    fn conflicting_writes_follow_merge_order() {
        let a = store_with(&[("k", "1")]);
        let b = store_with(&[("k", "2")]);

        a.merge_remote_state(&b.encode_local_state().unwrap())
            .unwrap();
        assert_eq!(a.get("k"), "2");
        b.merge_remote_state(&a.encode_local_state().unwrap())
            .unwrap();
        assert_eq!(b.get("k"), "2");

        let a = store_with(&[("k", "1")]);
        let b = store_with(&[("k", "2")]);

        b.merge_remote_state(&a.encode_local_state().unwrap())
            .unwrap();
        assert_eq!(b.get("k"), "1");
        a.merge_remote_state(&b.encode_local_state().unwrap())
            .unwrap();
        assert_eq!(a.get("k"), "1", "reversed merge order picks the other value");
    }

    #[test]
    fn corrupt_remote_state_leaves_store_untouched() {
        let store = store_with(&[("a", "1")]);

        let err = store.merge_remote_state(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
        assert!(err.is_codec());
        assert_eq!(store.get("a"), "1");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn metadata_encoding_is_deterministic() {
        let mut metadata = NodeMetadata::new();
        metadata.insert("apiPort".to_string(), "9000".to_string());
        metadata.insert("zone".to_string(), "local".to_string());
        let store = ConfigStore::new(metadata.clone());
        store.put("ignored".to_owned(), "by metadata".to_owned());

        let first = store.encode_metadata(512).unwrap();
        assert_eq!(first, store.encode_metadata(512).unwrap());

        let decoded: NodeMetadata = bincode::deserialize(&first).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn metadata_over_limit_is_rejected() {
        let mut metadata = NodeMetadata::new();
        metadata.insert("apiPort".to_string(), "9000".to_string());
        let store = ConfigStore::new(metadata);

        match store.encode_metadata(4) {
            Err(Error::MetadataTooLarge { limit, .. }) => assert_eq!(limit, 4),
            other => panic!("expected MetadataTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn delegate_has_no_broadcasts() {
        let store = store_with(&[("a", "1")]);
        store.notify_msg(b"ignored");
        assert!(store.get_broadcasts(2, 1400).is_empty());
        assert_eq!(store.get("a"), "1");
    }

    #[test]
    fn delegate_round_trips_through_trait() {
        let local = ConfigStore::default();
        let remote = store_with(&[("cluster.config.test.prop", "distributed!")]);

        let delegate: &dyn Delegate = &local;
        delegate
            .merge_remote_state(&remote.local_state(false).unwrap(), true)
            .unwrap();
        assert_eq!(local.get("cluster.config.test.prop"), "distributed!");
    }
}
