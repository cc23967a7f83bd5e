//! Partition keys, key extraction and partition-to-replica assignment.

mod distribution;
mod service;

pub use distribution::{PartitionDistribution, PartitionMigration};
pub use service::PartitionService;

use sluice_api::{Tuple, Value};
use std::hash::{Hash, Hasher};
use xxhash_rust::xxh3::Xxh3;

/// Maps a partition hash to a partition id in `[0, partition_count)`.
pub fn partition_id(hash: u64, partition_count: usize) -> usize {
    (hash % partition_count as u64) as usize
}

/// The identity used for partitioned routing: a tuple of field values plus
/// a precomputed partition hash.
///
/// The hash may cover only a prefix of the values (see
/// [`PartitionKeyExtractor`]); equal keys always produce equal hashes, since
/// equality covers a superset of the hashed prefix.
#[derive(Clone, Debug)]
pub struct PartitionKey {
    values: Vec<Value>,
    hash: u64,
}

impl PartitionKey {
    pub fn new(values: Vec<Value>, forward_key_limit: usize) -> Self {
        let hash = hash_values(values.iter().take(forward_key_limit));
        Self { values, hash }
    }

    pub fn partition_hash(&self) -> u64 {
        self.hash
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl PartialEq for PartitionKey {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for PartitionKey {}

impl Hash for PartitionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
        state.write_usize(self.values.len());
    }
}

fn hash_values<'a>(values: impl Iterator<Item = &'a Value>) -> u64 {
    let mut hasher = Xxh3::new();
    for value in values {
        value.hash_into(&mut hasher);
    }
    hasher.digest()
}

/// Extracts partition keys from tuples by field name.
///
/// `forward_key_limit` supports regions whose operators key on a superset of
/// the region's partition fields: the hash covers only the first
/// `forward_key_limit` fields so that all operators of the region agree on
/// partition placement, while key equality still covers every extracted
/// field.
#[derive(Clone, Debug)]
pub struct PartitionKeyExtractor {
    field_names: Vec<String>,
    forward_key_limit: usize,
}

impl PartitionKeyExtractor {
    pub fn new(field_names: Vec<String>) -> Self {
        let forward_key_limit = field_names.len();
        Self::with_forward_key_limit(field_names, forward_key_limit)
    }

    pub fn with_forward_key_limit(field_names: Vec<String>, forward_key_limit: usize) -> Self {
        assert!(
            forward_key_limit > 0 && forward_key_limit <= field_names.len(),
            "forward key limit {forward_key_limit} out of range for {} partition fields",
            field_names.len()
        );
        Self {
            field_names,
            forward_key_limit,
        }
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    pub fn extract(&self, tuple: &Tuple) -> PartitionKey {
        let values = self
            .field_names
            .iter()
            .map(|name| self.field_value(tuple, name).clone())
            .collect();
        PartitionKey::new(values, self.forward_key_limit)
    }

    /// Computes the partition hash without materializing the key.
    pub fn partition_hash(&self, tuple: &Tuple) -> u64 {
        let mut hasher = Xxh3::new();
        for name in self.field_names.iter().take(self.forward_key_limit) {
            self.field_value(tuple, name).hash_into(&mut hasher);
        }
        hasher.digest()
    }

    fn field_value<'t>(&self, tuple: &'t Tuple, name: &str) -> &'t Value {
        tuple.get(name).unwrap_or_else(|| {
            // Schema validation happens upstream of the engine; a tuple
            // reaching a partitioned operator without its partition fields
            // is a programming defect.
            panic!("tuple is missing partition field {name}")
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tuple(key: i64, aux: &str) -> Tuple {
        let mut t = Tuple::of("key", key);
        t.set("aux", aux);
        t
    }

    #[test]
    fn equal_keys_have_equal_hashes() {
        let extractor = PartitionKeyExtractor::new(vec!["key".into()]);
        let a = extractor.extract(&tuple(7, "x"));
        let b = extractor.extract(&tuple(7, "y"));
        assert_eq!(a, b);
        assert_eq!(a.partition_hash(), b.partition_hash());
    }

    #[test]
    fn forward_key_limit_hashes_prefix_only() {
        let extractor =
            PartitionKeyExtractor::with_forward_key_limit(vec!["key".into(), "aux".into()], 1);
        let a = extractor.extract(&tuple(7, "x"));
        let b = extractor.extract(&tuple(7, "y"));
        // Same routing, different identity.
        assert_eq!(a.partition_hash(), b.partition_hash());
        assert_ne!(a, b);
    }

    #[test]
    fn extractor_hash_matches_key_hash() {
        let extractor = PartitionKeyExtractor::new(vec!["key".into(), "aux".into()]);
        let t = tuple(42, "x");
        assert_eq!(
            extractor.partition_hash(&t),
            extractor.extract(&t).partition_hash()
        );
    }

    #[test]
    fn partition_id_stays_in_range() {
        for hash in [0u64, 1, 270, 271, u64::MAX] {
            assert!(partition_id(hash, 271) < 271);
        }
    }
}
