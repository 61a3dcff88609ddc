//! Typed key/value payload carried by every job.
//!
//! `JobData` is immutable once built. Values keep their exact type through the
//! JSON wire form: integers are never widened, and floats are written as their
//! IEEE-754 bit patterns so that every value (NaN payloads and infinities
//! included) comes back bit-for-bit identical.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobDataError {
    #[error("missing key '{0}' in job data")]
    Missing(String),

    #[error("key '{key}' holds a {actual}, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("malformed job data: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A single value stored in [`JobData`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DataValue {
    String(String),
    Int(i32),
    Long(i64),
    Float(#[serde(with = "f32_bits")] f32),
    Double(#[serde(with = "f64_bits")] f64),
    Boolean(bool),
    StringArray(Vec<String>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(#[serde(with = "f32_bits::vec")] Vec<f32>),
    DoubleArray(#[serde(with = "f64_bits::vec")] Vec<f64>),
    BooleanArray(Vec<bool>),
}

impl DataValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::String(_) => "string",
            DataValue::Int(_) => "int",
            DataValue::Long(_) => "long",
            DataValue::Float(_) => "float",
            DataValue::Double(_) => "double",
            DataValue::Boolean(_) => "boolean",
            DataValue::StringArray(_) => "string_array",
            DataValue::IntArray(_) => "int_array",
            DataValue::LongArray(_) => "long_array",
            DataValue::FloatArray(_) => "float_array",
            DataValue::DoubleArray(_) => "double_array",
            DataValue::BooleanArray(_) => "boolean_array",
        }
    }
}

// Floats compare by bit pattern so that equality means "exactly reconstructible".
impl PartialEq for DataValue {
    fn eq(&self, other: &Self) -> bool {
        use DataValue::*;
        match (self, other) {
            (String(a), String(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Long(a), Long(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Boolean(a), Boolean(b)) => a == b,
            (StringArray(a), StringArray(b)) => a == b,
            (IntArray(a), IntArray(b)) => a == b,
            (LongArray(a), LongArray(b)) => a == b,
            (FloatArray(a), FloatArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (DoubleArray(a), DoubleArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (BooleanArray(a), BooleanArray(b)) => a == b,
            _ => false,
        }
    }
}

/// Immutable job payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobData {
    values: BTreeMap<String, DataValue>,
}

/// Generates the required and defaulting accessors for one value type.
macro_rules! typed_accessors {
    ($get:ident, $get_or_default:ident, $has:ident, $variant:ident, $ret:ty, $expected:expr, |$v:ident| $conv:expr) => {
        pub fn $get(&self, key: &str) -> Result<$ret, JobDataError> {
            match self.values.get(key) {
                Some(DataValue::$variant($v)) => Ok($conv),
                Some(other) => Err(JobDataError::WrongType {
                    key: key.to_string(),
                    expected: $expected,
                    actual: other.type_name(),
                }),
                None => Err(JobDataError::Missing(key.to_string())),
            }
        }

        /// Returns `default` when the key is absent. A value of another type is still an error.
        pub fn $get_or_default(&self, key: &str, default: $ret) -> Result<$ret, JobDataError> {
            match self.$get(key) {
                Err(JobDataError::Missing(_)) => Ok(default),
                other => other,
            }
        }

        pub fn $has(&self, key: &str) -> bool {
            matches!(self.values.get(key), Some(DataValue::$variant(_)))
        }
    };
}

impl JobData {
    pub fn builder() -> JobDataBuilder {
        JobDataBuilder::default()
    }

    /// Starts a builder pre-populated with this payload's entries.
    pub fn to_builder(&self) -> JobDataBuilder {
        JobDataBuilder {
            values: self.values.clone(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&DataValue> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    typed_accessors!(get_string, get_string_or_default, has_string, String, String, "string", |v| v.clone());
    typed_accessors!(get_int, get_int_or_default, has_int, Int, i32, "int", |v| *v);
    typed_accessors!(get_long, get_long_or_default, has_long, Long, i64, "long", |v| *v);
    typed_accessors!(get_float, get_float_or_default, has_float, Float, f32, "float", |v| *v);
    typed_accessors!(get_double, get_double_or_default, has_double, Double, f64, "double", |v| *v);
    typed_accessors!(get_boolean, get_boolean_or_default, has_boolean, Boolean, bool, "boolean", |v| *v);
    typed_accessors!(get_string_array, get_string_array_or_default, has_string_array, StringArray, Vec<String>, "string_array", |v| v.clone());
    typed_accessors!(get_int_array, get_int_array_or_default, has_int_array, IntArray, Vec<i32>, "int_array", |v| v.clone());
    typed_accessors!(get_long_array, get_long_array_or_default, has_long_array, LongArray, Vec<i64>, "long_array", |v| v.clone());
    typed_accessors!(get_float_array, get_float_array_or_default, has_float_array, FloatArray, Vec<f32>, "float_array", |v| v.clone());
    typed_accessors!(get_double_array, get_double_array_or_default, has_double_array, DoubleArray, Vec<f64>, "double_array", |v| v.clone());
    typed_accessors!(get_boolean_array, get_boolean_array_or_default, has_boolean_array, BooleanArray, Vec<bool>, "boolean_array", |v| v.clone());

    /// Serializes to the stable JSON wire form stored in the job table.
    pub fn serialize(&self) -> Result<String, JobDataError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(serialized: &str) -> Result<Self, JobDataError> {
        if serialized.trim().is_empty() {
            return Ok(Self::empty());
        }
        Ok(serde_json::from_str(serialized)?)
    }
}

/// Accumulates typed entries and produces an immutable [`JobData`].
#[derive(Debug, Default, Clone)]
pub struct JobDataBuilder {
    values: BTreeMap<String, DataValue>,
}

impl JobDataBuilder {
    pub fn put(mut self, key: impl Into<String>, value: DataValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn put_string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put(key, DataValue::String(value.into()))
    }

    pub fn put_int(self, key: impl Into<String>, value: i32) -> Self {
        self.put(key, DataValue::Int(value))
    }

    pub fn put_long(self, key: impl Into<String>, value: i64) -> Self {
        self.put(key, DataValue::Long(value))
    }

    pub fn put_float(self, key: impl Into<String>, value: f32) -> Self {
        self.put(key, DataValue::Float(value))
    }

    pub fn put_double(self, key: impl Into<String>, value: f64) -> Self {
        self.put(key, DataValue::Double(value))
    }

    pub fn put_boolean(self, key: impl Into<String>, value: bool) -> Self {
        self.put(key, DataValue::Boolean(value))
    }

    pub fn put_string_array(self, key: impl Into<String>, value: Vec<String>) -> Self {
        self.put(key, DataValue::StringArray(value))
    }

    pub fn put_int_array(self, key: impl Into<String>, value: Vec<i32>) -> Self {
        self.put(key, DataValue::IntArray(value))
    }

    pub fn put_long_array(self, key: impl Into<String>, value: Vec<i64>) -> Self {
        self.put(key, DataValue::LongArray(value))
    }

    pub fn put_float_array(self, key: impl Into<String>, value: Vec<f32>) -> Self {
        self.put(key, DataValue::FloatArray(value))
    }

    pub fn put_double_array(self, key: impl Into<String>, value: Vec<f64>) -> Self {
        self.put(key, DataValue::DoubleArray(value))
    }

    pub fn put_boolean_array(self, key: impl Into<String>, value: Vec<bool>) -> Self {
        self.put(key, DataValue::BooleanArray(value))
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.values.remove(key);
        self
    }

    pub fn build(self) -> JobData {
        JobData {
            values: self.values,
        }
    }
}

mod f32_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(value.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
        Ok(f32::from_bits(u32::deserialize(deserializer)?))
    }

    pub mod vec {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        pub fn serialize<S: Serializer>(values: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
            values
                .iter()
                .map(|v| v.to_bits())
                .collect::<Vec<_>>()
                .serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
            Ok(Vec::<u32>::deserialize(deserializer)?
                .into_iter()
                .map(f32::from_bits)
                .collect())
        }
    }
}

mod f64_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(f64::from_bits(u64::deserialize(deserializer)?))
    }

    pub mod vec {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
            values
                .iter()
                .map(|v| v.to_bits())
                .collect::<Vec<_>>()
                .serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
            Ok(Vec::<u64>::deserialize(deserializer)?
                .into_iter()
                .map(f64::from_bits)
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(data: &JobData) -> JobData {
        let serialized = data.serialize().unwrap();
        JobData::deserialize(&serialized).unwrap()
    }

    #[test]
    fn test_round_trip_boundary_values() {
        let data = JobData::builder()
            .put_int("int_max", i32::MAX)
            .put_int("int_min", i32::MIN)
            .put_long("long_max", i64::MAX)
            .put_long("long_min", i64::MIN)
            .put_float("float_max", f32::MAX)
            .put_float("float_min_positive", f32::MIN_POSITIVE)
            .put_double("double_max", f64::MAX)
            .put_double("double_neg_zero", -0.0)
            .put_double("double_inf", f64::INFINITY)
            .put_float("float_nan", f32::NAN)
            .put_string("empty_string", "")
            .put_boolean("flag", true)
            .build();

        let restored = round_trip(&data);
        assert_eq!(restored, data);
        assert_eq!(restored.get_int("int_max").unwrap(), i32::MAX);
        assert_eq!(restored.get_long("long_min").unwrap(), i64::MIN);
        assert!(restored.get_float("float_nan").unwrap().is_nan());
        assert_eq!(
            restored.get_double("double_neg_zero").unwrap().to_bits(),
            (-0.0f64).to_bits()
        );
    }

    #[test]
    fn test_round_trip_arrays() {
        let data = JobData::builder()
            .put_string_array("strings", vec!["a".to_string(), "".to_string()])
            .put_int_array("ints", vec![i32::MIN, 0, i32::MAX])
            .put_long_array("longs", vec![i64::MIN, i64::MAX])
            .put_float_array("floats", vec![0.1, -2.5])
            .put_double_array("doubles", vec![std::f64::consts::PI])
            .put_boolean_array("bools", vec![true, false])
            .put_long_array("empty_longs", vec![])
            .build();

        let restored = round_trip(&data);
        assert_eq!(restored, data);
        assert_eq!(restored.get_long_array("empty_longs").unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_empty_array_is_distinct_from_absent_key() {
        let data = JobData::builder().put_int_array("present", vec![]).build();
        let restored = round_trip(&data);

        assert!(restored.has("present"));
        assert!(restored.has_int_array("present"));
        assert!(!restored.has("absent"));
        assert!(matches!(
            restored.get_int_array("absent"),
            Err(JobDataError::Missing(_))
        ));
    }

    #[test]
    fn test_int_and_long_are_not_interchangeable() {
        let data = round_trip(&JobData::builder().put_int("n", 7).build());

        assert_eq!(data.get_int("n").unwrap(), 7);
        let err = data.get_long("n").unwrap_err();
        match err {
            JobDataError::WrongType {
                key,
                expected,
                actual,
            } => {
                assert_eq!(key, "n");
                assert_eq!(expected, "long");
                assert_eq!(actual, "int");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_or_default_only_covers_absent_keys() {
        let data = JobData::builder().put_string("name", "x").build();

        assert_eq!(data.get_int_or_default("missing", 42).unwrap(), 42);
        assert_eq!(data.get_string_or_default("name", "y".into()).unwrap(), "x");
        assert!(data.get_int_or_default("name", 0).is_err());
    }

    #[test]
    fn test_to_builder_keeps_existing_entries() {
        let original = JobData::builder().put_int("a", 1).put_int("b", 2).build();
        let updated = original.to_builder().remove("a").put_int("c", 3).build();

        assert!(!updated.has("a"));
        assert_eq!(updated.get_int("b").unwrap(), 2);
        assert_eq!(updated.get_int("c").unwrap(), 3);
        assert_eq!(original.len(), 2);
    }

    #[test]
    fn test_deserialize_rejects_malformed_input() {
        assert!(matches!(
            JobData::deserialize("{\"k\": {\"type\": \"unknown\", \"value\": 1}}"),
            Err(JobDataError::Malformed(_))
        ));
        assert!(JobData::deserialize("").unwrap().is_empty());
    }
}
