use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{CairnError, Result};

/// Default ceiling on the encoded size of a metadata map.
pub const MAX_METADATA_LEN: usize = 4096;

/// Deepest nesting of lists/maps accepted in metadata.
pub const MAX_METADATA_DEPTH: usize = 16;

/// A metadata value.
///
/// JSON `null` has no counterpart and is rejected when decoding. Integers
/// and floats stay distinct so numbers round-trip with the type they were
/// written with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Finite floating-point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered list of values.
    List(Vec<MetaValue>),
    /// Nested string-keyed map.
    Map(BTreeMap<String, MetaValue>),
}

impl MetaValue {
    /// Numeric view of the value, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Int(v) => Some(*v as f64),
            MetaValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String view of the value, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn check(&self, depth: usize) -> Result<()> {
        if depth > MAX_METADATA_DEPTH {
            return Err(CairnError::Invalid(format!(
                "metadata nested deeper than {MAX_METADATA_DEPTH} levels"
            )));
        }
        match self {
            MetaValue::Float(v) if !v.is_finite() => Err(CairnError::Invalid(
                "metadata numbers must be finite".into(),
            )),
            MetaValue::List(items) => items.iter().try_for_each(|v| v.check(depth + 1)),
            MetaValue::Map(map) => map.values().try_for_each(|v| v.check(depth + 1)),
            _ => Ok(()),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Float(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

/// String-keyed metadata map with deterministic (sorted) encoding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetaValue>);

impl Metadata {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts or replaces a key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Looks up a key.
    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    /// Removes a key.
    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        self.0.remove(key)
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the map has no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaValue)> {
        self.0.iter()
    }

    /// Returns `self` overlaid with every key of `other`.
    pub fn overlay(&self, other: &Metadata) -> Metadata {
        let mut merged = self.0.clone();
        for (k, v) in &other.0 {
            merged.insert(k.clone(), v.clone());
        }
        Metadata(merged)
    }

    /// Validates structure and size, returning the encoded bytes.
    ///
    /// This is the single boundary where metadata is checked; nothing is
    /// written when it fails.
    pub fn encode_checked(&self, limit: usize) -> Result<Vec<u8>> {
        for (key, value) in &self.0 {
            if key.is_empty() {
                return Err(CairnError::Invalid("metadata keys must be non-empty".into()));
            }
            value.check(1)?;
        }
        let bytes = serde_json::to_vec(&self.0)?;
        if bytes.len() > limit {
            return Err(CairnError::Capacity {
                what: "metadata",
                size: bytes.len(),
                limit,
            });
        }
        Ok(bytes)
    }

    /// Decodes bytes produced by [`Metadata::encode_checked`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Metadata::new());
        }
        Ok(Metadata(serde_json::from_slice(bytes)?))
    }
}

impl FromIterator<(String, MetaValue)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, MetaValue)>>(iter: T) -> Self {
        Metadata(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_keep_their_type() {
        let meta: Metadata =
            serde_json::from_str(r#"{"a":1,"b":1.5,"c":"x","d":[true,{"e":2}]}"#).unwrap();
        assert_eq!(meta.get("a"), Some(&MetaValue::Int(1)));
        assert_eq!(meta.get("b"), Some(&MetaValue::Float(1.5)));
        assert_eq!(meta.get("c").and_then(MetaValue::as_str), Some("x"));
        let bytes = meta.encode_checked(MAX_METADATA_LEN).unwrap();
        assert_eq!(Metadata::decode(&bytes).unwrap(), meta);
    }

    #[test]
    fn null_is_rejected_at_decode() {
        assert!(serde_json::from_str::<Metadata>(r#"{"a":null}"#).is_err());
    }

    #[test]
    fn oversized_metadata_is_a_capacity_error() {
        let meta = Metadata::new().with("blob", "x".repeat(MAX_METADATA_LEN));
        match meta.encode_checked(MAX_METADATA_LEN) {
            Err(CairnError::Capacity { what, limit, .. }) => {
                assert_eq!(what, "metadata");
                assert_eq!(limit, MAX_METADATA_LEN);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn non_finite_floats_are_invalid() {
        let meta = Metadata::new().with("x", f64::NAN);
        assert!(matches!(
            meta.encode_checked(MAX_METADATA_LEN),
            Err(CairnError::Invalid(_))
        ));
    }

    #[test]
    fn overlay_prefers_other() {
        let base = Metadata::new().with("a", 1i64).with("b", "old");
        let top = Metadata::new().with("b", "new").with("c", true);
        let merged = base.overlay(&top);
        assert_eq!(merged.get("a"), Some(&MetaValue::Int(1)));
        assert_eq!(merged.get("b").and_then(MetaValue::as_str), Some("new"));
        assert_eq!(merged.get("c"), Some(&MetaValue::Bool(true)));
    }
}
