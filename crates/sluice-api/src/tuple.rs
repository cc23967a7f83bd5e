use crate::Value;
use indexmap::IndexMap;
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::time::Instant;

/// One data record: an ordered mapping of field names to non-null values.
///
/// Tuples also carry optional bookkeeping used by the engine: a sequence
/// number assigned by source operators, an ingestion timestamp, and the time
/// the tuple was last offered to a queue (stamped by the partitioned sender
/// for latency tracing). Equality and hashing cover the field mapping only;
/// the bookkeeping is invisible to them.
#[derive(Clone, Default)]
pub struct Tuple {
    fields: IndexMap<String, Value>,
    sequence_number: Option<u64>,
    ingestion_time: Option<Instant>,
    queue_offer_time: Option<Instant>,
}

impl Tuple {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a tuple with a single field.
    pub fn of(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut tuple = Self::new();
        tuple.set(field, value);
        tuple
    }

    /// Sets a field. Values are never null; absence is expressed by not
    /// setting the field at all.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.shift_remove(field)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn sequence_number(&self) -> Option<u64> {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, sequence_number: u64) {
        self.sequence_number = Some(sequence_number);
    }

    pub fn ingestion_time(&self) -> Option<Instant> {
        self.ingestion_time
    }

    pub fn set_ingestion_time(&mut self, at: Instant) {
        self.ingestion_time = Some(at);
    }

    pub fn queue_offer_time(&self) -> Option<Instant> {
        self.queue_offer_time
    }

    pub fn set_queue_offer_time(&mut self, at: Instant) {
        self.queue_offer_time = Some(at);
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for Tuple {}

impl Hash for Tuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (name, value) in &self.fields {
            name.hash(state);
            value.hash(state);
        }
    }
}

impl Debug for Tuple {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in &self.fields {
            map.entry(&name, value);
        }
        map.finish()
    }
}
