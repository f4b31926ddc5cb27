//! Key/value records exchanged with callers at the configuration boundary.
//!
//! Drivers (scripts, interactive viewers, pipelines) talk to the imaging
//! components through flat records of named scalars. Everything behind the
//! boundary is typed; the readers here are the only place where a record
//! value is interpreted, and they never coerce between incompatible types.
//! The single widening allowed is integer to float.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthesisError};

/// One scalar value stored in a [`Record`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<bool> for RecordValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for RecordValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for RecordValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<usize> for RecordValue {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for RecordValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for RecordValue {
    fn from(value: f32) -> Self {
        Self::Float(value.into())
    }
}

impl From<&str> for RecordValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RecordValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Ordered map of named scalar values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, RecordValue>,
}

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    pub fn with<K: Into<String>, V: Into<RecordValue>>(mut self, key: K, value: V) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts or replaces a field.
    pub fn insert<K: Into<String>, V: Into<RecordValue>>(&mut self, key: K, value: V) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&RecordValue> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates over fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RecordValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Reads an optional string field.
    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.fields.get(key) {
            None => Ok(None),
            Some(RecordValue::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(SynthesisError::field_type(key, "string")),
        }
    }

    /// Reads an optional integer field.
    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.fields.get(key) {
            None => Ok(None),
            Some(RecordValue::Int(i)) => Ok(Some(*i)),
            Some(_) => Err(SynthesisError::field_type(key, "integer")),
        }
    }

    /// Reads an optional non-negative integer field as a count.
    pub fn get_count(&self, key: &str) -> Result<Option<usize>> {
        match self.get_int(key)? {
            None => Ok(None),
            Some(i) => usize::try_from(i)
                .map(Some)
                .map_err(|_| SynthesisError::field_type(key, "non-negative integer")),
        }
    }

    /// Reads an optional float field; integers are widened.
    pub fn get_float(&self, key: &str) -> Result<Option<f64>> {
        match self.fields.get(key) {
            None => Ok(None),
            Some(RecordValue::Float(f)) => Ok(Some(*f)),
            Some(RecordValue::Int(i)) => Ok(Some(*i as f64)),
            Some(_) => Err(SynthesisError::field_type(key, "float")),
        }
    }

    /// Reads an optional boolean field.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.fields.get(key) {
            None => Ok(None),
            Some(RecordValue::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(SynthesisError::field_type(key, "bool")),
        }
    }
}

impl<K: Into<String>, V: Into<RecordValue>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_readers_reject_incompatible_values() {
        let record = Record::new()
            .with("imagename", "field0")
            .with("niter", 100)
            .with("threshold", 0.5)
            .with("interactive", false);

        assert_eq!(record.get_str("imagename").unwrap(), Some("field0"));
        assert_eq!(record.get_count("niter").unwrap(), Some(100));
        assert_eq!(record.get_bool("interactive").unwrap(), Some(false));
        assert_eq!(record.get_str("missing").unwrap(), None);

        assert!(matches!(
            record.get_int("imagename"),
            Err(SynthesisError::FieldType { .. })
        ));
        assert!(matches!(
            record.get_str("threshold"),
            Err(SynthesisError::FieldType { .. })
        ));
    }

    #[test]
    fn integers_widen_to_floats_but_not_back() {
        let record = Record::new().with("threshold", 2).with("gain", 0.1);
        assert_eq!(record.get_float("threshold").unwrap(), Some(2.0));
        assert!(record.get_int("gain").is_err());
    }

    #[test]
    fn negative_counts_are_rejected() {
        let record = Record::new().with("niter", -5);
        assert!(record.get_count("niter").is_err());
    }

    #[test]
    fn json_round_trip_keeps_value_types() {
        let record = Record::new().with("id", 3).with("cyclefactor", 1.5);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"cyclefactor":1.5,"id":3}"#);
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
