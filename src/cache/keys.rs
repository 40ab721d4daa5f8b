//! Cache key construction.
//!
//! A key is the base resource name optionally followed by `:` and a canonical JSON object of
//! the query parameters. Parameter order and null entries never change the key.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Number, Value};
use uuid::Uuid;

/// Canonical identity of a cached query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resource name the key was built from (everything before the first `:`).
    pub fn base(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(base, _)| base)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Namespace label attached to cache entries for bulk invalidation.
///
/// Tags match exactly: `team` never matches an entry tagged `teams-data`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(String);

impl Tag {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Scalar value allowed in key parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Primitive {
    pub fn is_null(&self) -> bool {
        matches!(self, Primitive::Null)
    }

    /// JSON form used in keys and store filters.
    ///
    /// Integral floats collapse to integers so `2.0` and `2` address the same entry;
    /// non-finite floats become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Primitive::Null => Value::Null,
            Primitive::Bool(value) => Value::Bool(*value),
            Primitive::Int(value) => Value::from(*value),
            Primitive::Float(value) => {
                if value.is_finite() && value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0
                {
                    Value::from(*value as i64)
                } else {
                    Number::from_f64(*value).map_or(Value::Null, Value::Number)
                }
            }
            Primitive::Text(value) => Value::String(value.clone()),
        }
    }
}

impl From<bool> for Primitive {
    fn from(value: bool) -> Self {
        Primitive::Bool(value)
    }
}

macro_rules! primitive_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Primitive {
                fn from(value: $ty) -> Self {
                    Primitive::Int(i64::from(value))
                }
            }
        )*
    };
}

primitive_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Primitive {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Primitive::Float(value as f64), Primitive::Int)
    }
}

impl From<usize> for Primitive {
    fn from(value: usize) -> Self {
        i64::try_from(value).map_or(Primitive::Float(value as f64), Primitive::Int)
    }
}

impl From<f32> for Primitive {
    fn from(value: f32) -> Self {
        Primitive::Float(f64::from(value))
    }
}

impl From<f64> for Primitive {
    fn from(value: f64) -> Self {
        Primitive::Float(value)
    }
}

impl From<&str> for Primitive {
    fn from(value: &str) -> Self {
        Primitive::Text(value.to_string())
    }
}

impl From<String> for Primitive {
    fn from(value: String) -> Self {
        Primitive::Text(value)
    }
}

impl From<&String> for Primitive {
    fn from(value: &String) -> Self {
        Primitive::Text(value.clone())
    }
}

impl From<Uuid> for Primitive {
    fn from(value: Uuid) -> Self {
        Primitive::Text(value.to_string())
    }
}

impl<T> From<Option<T>> for Primitive
where
    T: Into<Primitive>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Primitive::Null, Into::into)
    }
}

/// Ordered parameter list for [`build_key`]. Later entries with the same name win.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyParams {
    entries: Vec<(String, Primitive)>,
}

impl KeyParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Primitive>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Primitive>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Effective parameters: last value per name, nulls dropped, sorted by name.
    pub fn canonical(&self) -> BTreeMap<&str, &Primitive> {
        let mut resolved = BTreeMap::new();
        for (name, value) in &self.entries {
            resolved.insert(name.as_str(), value);
        }
        resolved.retain(|_, value| !value.is_null());
        resolved
    }
}

impl<K, V> FromIterator<(K, V)> for KeyParams
where
    K: Into<String>,
    V: Into<Primitive>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = KeyParams::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

/// Build the cache key for `base` and `params`.
///
/// `build_key("posts", {status: "open", page: 2})` yields `posts:{"page":2,"status":"open"}`;
/// with no effective parameters the key is `base` itself.
pub fn build_key(base: &str, params: &KeyParams) -> CacheKey {
    let canonical = params.canonical();
    if canonical.is_empty() {
        return CacheKey::new(base);
    }

    // collected from the sorted map, so member order is canonical either way
    let body: Map<String, Value> = canonical
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.to_json()))
        .collect();

    CacheKey(format!("{base}:{}", Value::Object(body)))
}
