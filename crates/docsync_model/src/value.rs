//! Dynamic field values stored in documents.

use crate::path::{DocumentKey, FieldPath};
use crate::version::Timestamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Relative order of value types when values of different types compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeOrder {
    /// Null.
    Null,
    /// Booleans.
    Boolean,
    /// Integers and doubles share a type order.
    Number,
    /// Timestamps, including server timestamps that are not yet resolved.
    Timestamp,
    /// UTF-8 strings.
    String,
    /// Byte strings.
    Bytes,
    /// Document references.
    Reference,
    /// Geographic points.
    GeoPoint,
    /// Arrays.
    Array,
    /// Maps.
    Object,
}

/// A value stored in a document field.
///
/// Equality follows value semantics: an integer never equals a double even
/// when they are numerically equal, and NaN equals NaN. Ordering is provided
/// by [`FieldValue::compare`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    /// Null value.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Double(f64),
    /// Timestamp value.
    Timestamp(Timestamp),
    /// Placeholder for a server timestamp that has not been acknowledged.
    ServerTimestamp {
        /// When the write that produced it was made locally.
        local_write_time: Timestamp,
        /// The value the field held before the write, if any.
        previous_value: Option<Box<FieldValue>>,
    },
    /// UTF-8 string.
    String(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Reference to another document.
    Reference(DocumentKey),
    /// Latitude/longitude pair.
    GeoPoint {
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
    },
    /// Array of values.
    Array(Vec<FieldValue>),
    /// Nested map.
    Map(ObjectValue),
}

fn compare_f64(a: f64, b: f64) -> Ordering {
    match a.partial_cmp(&b) {
        Some(ordering) => ordering,
        // NaN sorts before every other number.
        None => match (a.is_nan(), b.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            _ => Ordering::Greater,
        },
    }
}

fn compare_mixed(int: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    let as_double = int as f64;
    match compare_f64(as_double, double) {
        // Break ties that are only ties because of float precision.
        Ordering::Equal if double.fract() == 0.0 && double.abs() < 9.2e18 => int.cmp(&(double as i64)),
        ordering => ordering,
    }
}

fn f64_equals(a: f64, b: f64) -> bool {
    if a.is_nan() && b.is_nan() {
        return true;
    }
    // -0.0 and 0.0 are distinct values.
    a.to_bits() == b.to_bits()
}

impl FieldValue {
    /// Returns the type order of this value.
    pub fn type_order(&self) -> TypeOrder {
        match self {
            FieldValue::Null => TypeOrder::Null,
            FieldValue::Boolean(_) => TypeOrder::Boolean,
            FieldValue::Integer(_) | FieldValue::Double(_) => TypeOrder::Number,
            FieldValue::Timestamp(_) | FieldValue::ServerTimestamp { .. } => TypeOrder::Timestamp,
            FieldValue::String(_) => TypeOrder::String,
            FieldValue::Bytes(_) => TypeOrder::Bytes,
            FieldValue::Reference(_) => TypeOrder::Reference,
            FieldValue::GeoPoint { .. } => TypeOrder::GeoPoint,
            FieldValue::Array(_) => TypeOrder::Array,
            FieldValue::Map(_) => TypeOrder::Object,
        }
    }

    /// Returns true for integers and doubles.
    pub fn is_number(&self) -> bool {
        matches!(self, FieldValue::Integer(_) | FieldValue::Double(_))
    }

    /// Returns true for NaN doubles.
    pub fn is_nan(&self) -> bool {
        matches!(self, FieldValue::Double(d) if d.is_nan())
    }

    /// Returns the elements if this is an array.
    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Returns the nested map if this is a map.
    pub fn as_map(&self) -> Option<&ObjectValue> {
        match self {
            FieldValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Returns true if `self` is an array holding a value equal to `value`.
    pub fn array_contains(&self, value: &FieldValue) -> bool {
        self.as_array().is_some_and(|values| values.contains(value))
    }

    /// Total order over all values.
    pub fn compare(&self, other: &FieldValue) -> Ordering {
        let type_ordering = self.type_order().cmp(&other.type_order());
        if type_ordering != Ordering::Equal {
            return type_ordering;
        }
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => Ordering::Equal,
            (FieldValue::Boolean(a), FieldValue::Boolean(b)) => a.cmp(b),
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a.cmp(b),
            (FieldValue::Double(a), FieldValue::Double(b)) => compare_f64(*a, *b),
            (FieldValue::Integer(a), FieldValue::Double(b)) => compare_mixed(*a, *b),
            (FieldValue::Double(a), FieldValue::Integer(b)) => compare_mixed(*b, *a).reverse(),
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => a.cmp(b),
            (
                FieldValue::ServerTimestamp {
                    local_write_time: a, ..
                },
                FieldValue::ServerTimestamp {
                    local_write_time: b, ..
                },
            ) => a.cmp(b),
            // Pending server timestamps sort after every resolved timestamp.
            (FieldValue::Timestamp(_), FieldValue::ServerTimestamp { .. }) => Ordering::Less,
            (FieldValue::ServerTimestamp { .. }, FieldValue::Timestamp(_)) => Ordering::Greater,
            (FieldValue::String(a), FieldValue::String(b)) => a.cmp(b),
            (FieldValue::Bytes(a), FieldValue::Bytes(b)) => a.cmp(b),
            (FieldValue::Reference(a), FieldValue::Reference(b)) => a.cmp(b),
            (
                FieldValue::GeoPoint {
                    latitude: lat1,
                    longitude: lng1,
                },
                FieldValue::GeoPoint {
                    latitude: lat2,
                    longitude: lng2,
                },
            ) => compare_f64(*lat1, *lat2).then_with(|| compare_f64(*lng1, *lng2)),
            (FieldValue::Array(a), FieldValue::Array(b)) => {
                for (left, right) in a.iter().zip(b) {
                    let ordering = left.compare(right);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                a.len().cmp(&b.len())
            }
            (FieldValue::Map(a), FieldValue::Map(b)) => a.compare(b),
            _ => unreachable!("values with equal type order must be comparable"),
        }
    }

    /// Deterministic string form used in canonical ids.
    pub fn canonical_string(&self) -> String {
        match self {
            FieldValue::Null => "null".to_string(),
            FieldValue::Boolean(b) => b.to_string(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Double(d) => d.to_string(),
            FieldValue::Timestamp(ts) => ts.to_string(),
            FieldValue::ServerTimestamp {
                local_write_time, ..
            } => format!("ServerTimestamp(localTime={local_write_time})"),
            FieldValue::String(s) => s.clone(),
            FieldValue::Bytes(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
            FieldValue::Reference(key) => key.to_string(),
            FieldValue::GeoPoint {
                latitude,
                longitude,
            } => format!("GeoPoint(latitude={latitude}, longitude={longitude})"),
            FieldValue::Array(values) => {
                let inner: Vec<_> = values.iter().map(FieldValue::canonical_string).collect();
                format!("[{}]", inner.join(","))
            }
            FieldValue::Map(map) => map.canonical_string(),
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => true,
            (FieldValue::Boolean(a), FieldValue::Boolean(b)) => a == b,
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a == b,
            (FieldValue::Double(a), FieldValue::Double(b)) => f64_equals(*a, *b),
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => a == b,
            (
                FieldValue::ServerTimestamp {
                    local_write_time: a,
                    previous_value: pa,
                },
                FieldValue::ServerTimestamp {
                    local_write_time: b,
                    previous_value: pb,
                },
            ) => a == b && pa == pb,
            (FieldValue::String(a), FieldValue::String(b)) => a == b,
            (FieldValue::Bytes(a), FieldValue::Bytes(b)) => a == b,
            (FieldValue::Reference(a), FieldValue::Reference(b)) => a == b,
            (
                FieldValue::GeoPoint {
                    latitude: lat1,
                    longitude: lng1,
                },
                FieldValue::GeoPoint {
                    latitude: lat2,
                    longitude: lng2,
                },
            ) => f64_equals(*lat1, *lat2) && f64_equals(*lng1, *lng2),
            (FieldValue::Array(a), FieldValue::Array(b)) => a == b,
            (FieldValue::Map(a), FieldValue::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

/// A nested map of field values; the data of a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    fields: BTreeMap<String, FieldValue>,
}

impl ObjectValue {
    /// The empty map.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds an object from top-level entries.
    pub fn from_fields<K: Into<String>>(fields: impl IntoIterator<Item = (K, FieldValue)>) -> Self {
        Self {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Returns the number of top-level fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates over top-level fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    /// Returns the value at `path`, descending through nested maps.
    pub fn field(&self, path: &FieldPath) -> Option<&FieldValue> {
        let mut segments = path.segments();
        let mut current = self.fields.get(segments.next()?)?;
        for segment in segments {
            current = current.as_map()?.fields.get(segment)?;
        }
        Some(current)
    }

    /// Returns a copy with `value` stored at `path`.
    ///
    /// Intermediate maps are created, and non-map intermediates replaced.
    #[must_use]
    pub fn set(&self, path: &FieldPath, value: FieldValue) -> Self {
        let mut copy = self.clone();
        copy.set_in_place(path, value);
        copy
    }

    fn set_in_place(&mut self, path: &FieldPath, value: FieldValue) {
        let Some(first) = path.first_segment() else {
            return;
        };
        if path.len() == 1 {
            self.fields.insert(first.to_string(), value);
            return;
        }
        let child = self
            .fields
            .entry(first.to_string())
            .or_insert_with(|| FieldValue::Map(ObjectValue::empty()));
        if !matches!(child, FieldValue::Map(_)) {
            *child = FieldValue::Map(ObjectValue::empty());
        }
        if let FieldValue::Map(map) = child {
            map.set_in_place(&path.pop_first(), value);
        }
    }

    /// Returns a copy with the value at `path` removed.
    #[must_use]
    pub fn delete(&self, path: &FieldPath) -> Self {
        let mut copy = self.clone();
        copy.delete_in_place(path);
        copy
    }

    fn delete_in_place(&mut self, path: &FieldPath) {
        let Some(first) = path.first_segment() else {
            return;
        };
        if path.len() == 1 {
            self.fields.remove(first);
        } else if let Some(FieldValue::Map(map)) = self.fields.get_mut(first) {
            map.delete_in_place(&path.pop_first());
        }
    }

    /// Orders maps entry by entry, then by size.
    pub fn compare(&self, other: &ObjectValue) -> Ordering {
        for ((k1, v1), (k2, v2)) in self.fields.iter().zip(&other.fields) {
            let ordering = k1.cmp(k2).then_with(|| v1.compare(v2));
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        self.fields.len().cmp(&other.fields.len())
    }

    /// Deterministic string form used in canonical ids.
    pub fn canonical_string(&self) -> String {
        let entries: Vec<_> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}:{}", v.canonical_string()))
            .collect();
        format!("{{{}}}", entries.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    #[test]
    fn type_order_dominates() {
        assert_eq!(FieldValue::Null.compare(&FieldValue::Boolean(false)), Ordering::Less);
        assert_eq!(
            FieldValue::String("a".into()).compare(&FieldValue::Integer(100)),
            Ordering::Greater
        );
    }

    #[test]
    fn numbers_compare_across_types() {
        assert_eq!(FieldValue::Integer(1).compare(&FieldValue::Double(1.5)), Ordering::Less);
        assert_eq!(FieldValue::Double(2.0).compare(&FieldValue::Integer(2)), Ordering::Equal);
        assert_eq!(FieldValue::Double(f64::NAN).compare(&FieldValue::Integer(i64::MIN)), Ordering::Less);
        assert_ne!(FieldValue::Integer(2), FieldValue::Double(2.0));
        assert_eq!(FieldValue::Double(f64::NAN), FieldValue::Double(f64::NAN));
    }

    #[test]
    fn server_timestamps_sort_after_timestamps() {
        let resolved = FieldValue::Timestamp(Timestamp::new(i64::MAX / 2, 0));
        let pending = FieldValue::ServerTimestamp {
            local_write_time: Timestamp::new(1, 0),
            previous_value: None,
        };
        assert_eq!(resolved.compare(&pending), Ordering::Less);
        assert_eq!(pending.type_order(), TypeOrder::Timestamp);
    }

    #[test]
    fn nested_set_and_delete() {
        let obj = ObjectValue::empty()
            .set(&path("a.b"), FieldValue::Integer(1))
            .set(&path("a.c"), FieldValue::Integer(2))
            .set(&path("d"), FieldValue::Boolean(true));
        assert_eq!(obj.field(&path("a.b")), Some(&FieldValue::Integer(1)));
        let obj = obj.delete(&path("a.b"));
        assert_eq!(obj.field(&path("a.b")), None);
        assert_eq!(obj.field(&path("a.c")), Some(&FieldValue::Integer(2)));
        // Setting through a scalar replaces it with a map.
        let obj = obj.set(&path("d.e"), FieldValue::Null);
        assert_eq!(obj.field(&path("d.e")), Some(&FieldValue::Null));
    }

    #[test]
    fn arrays_compare_elementwise_then_by_length() {
        let short = FieldValue::Array(vec![FieldValue::Integer(1)]);
        let long = FieldValue::Array(vec![FieldValue::Integer(1), FieldValue::Integer(0)]);
        assert_eq!(short.compare(&long), Ordering::Less);
        assert!(long.array_contains(&FieldValue::Integer(0)));
        assert!(!long.array_contains(&FieldValue::Double(0.0)));
    }
}
