//! The dynamic runtime value.
//!
//! [`Value`] uniformly represents everything a template can touch: nil,
//! booleans, integers, floats, strings, lists, maps, date-times, opaque
//! host objects and callables. Every value additionally carries a `safe`
//! flag consulted by the auto-escape pipeline.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Local, Utc};

use crate::context::ExecutionContext;
use crate::error::Error;

/// A host object exposed to templates.
///
/// This is the data-shape hook used in place of runtime reflection: a type
/// implementing `Object` decides how attribute lookups, integer indexing and
/// method calls on it resolve. Returning `None` means "not found", which
/// renders as the nil value under the missing-value policy.
pub trait Object: Send + Sync + fmt::Debug {
    /// Resolves an attribute access (`value.name`).
    fn get_named_field(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Resolves an integer index access (`value.0` or `value[i]`).
    fn get_indexed_field(&self, _index: i64) -> Option<Value> {
        None
    }

    /// Invokes a method (`value.name(args...)`). `None` means the method
    /// does not exist; `Some(Err(..))` aborts the render.
    fn call_method(&self, _name: &str, _args: &[Value]) -> Option<Result<Value, Error>> {
        None
    }

    /// The number of elements, for objects that behave like collections.
    fn length(&self) -> Option<usize> {
        None
    }

    /// The string form used when the object is written to the output.
    fn render(&self) -> String {
        format!("{self:?}")
    }
}

/// The signature of a callable template value.
///
/// Macros and user-registered functions both take this shape: the current
/// execution context plus the already-evaluated call arguments.
pub type NativeFunction = dyn Fn(&mut ExecutionContext, &[Value]) -> Result<Value, Error> + Send + Sync;

/// A callable wrapped as a template value.
#[derive(Clone)]
pub struct FunctionValue(pub Arc<NativeFunction>);

impl fmt::Debug for FunctionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<function>")
    }
}

/// The data carried by a [`Value`].
#[derive(Debug, Clone)]
pub enum ValueData {
    /// The absence of a value.
    None,
    /// A boolean.
    Bool(bool),
    /// A 64-bit integer.
    Integer(i64),
    /// A 64-bit float.
    Float(f64),
    /// A string.
    String(String),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A key-value mapping with deterministic (sorted) iteration order.
    Map(BTreeMap<String, Value>),
    /// A point in time.
    DateTime(DateTime<FixedOffset>),
    /// An opaque host object.
    Object(Arc<dyn Object>),
    /// A callable.
    Function(FunctionValue),
}

/// A dynamic template value plus its auto-escape safety flag.
#[derive(Debug, Clone)]
pub struct Value {
    /// The wrapped data.
    pub data: ValueData,
    safe: bool,
}

impl Value {
    /// The nil value.
    pub fn none() -> Self {
        Self {
            data: ValueData::None,
            safe: false,
        }
    }

    /// Wraps a string already known to be escaped; the auto-escape pipeline
    /// will not touch it.
    pub fn safe(s: impl Into<String>) -> Self {
        Self {
            data: ValueData::String(s.into()),
            safe: true,
        }
    }

    /// Wraps a host object.
    pub fn object(obj: Arc<dyn Object>) -> Self {
        Self {
            data: ValueData::Object(obj),
            safe: false,
        }
    }

    /// Wraps a callable.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&mut ExecutionContext, &[Value]) -> Result<Value, Error> + Send + Sync + 'static,
    {
        Self {
            data: ValueData::Function(FunctionValue(Arc::new(f))),
            safe: false,
        }
    }

    // ── Classification ───────────────────────────────────────────────

    /// Returns `true` for the nil value.
    pub fn is_nil(&self) -> bool {
        matches!(self.data, ValueData::None)
    }

    /// Returns `true` for a boolean.
    pub fn is_bool(&self) -> bool {
        matches!(self.data, ValueData::Bool(_))
    }

    /// Returns `true` for an integer.
    pub fn is_integer(&self) -> bool {
        matches!(self.data, ValueData::Integer(_))
    }

    /// Returns `true` for a float.
    pub fn is_float(&self) -> bool {
        matches!(self.data, ValueData::Float(_))
    }

    /// Returns `true` for an integer or a float.
    pub fn is_number(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    /// Returns `true` for a string.
    pub fn is_string(&self) -> bool {
        matches!(self.data, ValueData::String(_))
    }

    /// Returns `true` for a date-time.
    pub fn is_time(&self) -> bool {
        matches!(self.data, ValueData::DateTime(_))
    }

    /// Returns `true` for a list.
    pub fn is_list(&self) -> bool {
        matches!(self.data, ValueData::List(_))
    }

    /// Returns `true` for a mapping.
    pub fn is_map(&self) -> bool {
        matches!(self.data, ValueData::Map(_))
    }

    /// Returns `true` if the value can be iterated (string, list or map).
    pub fn is_iterable(&self) -> bool {
        matches!(
            self.data,
            ValueData::String(_) | ValueData::List(_) | ValueData::Map(_)
        )
    }

    /// Returns `true` for a callable.
    pub fn is_callable(&self) -> bool {
        matches!(self.data, ValueData::Function(_))
    }

    // ── Safety ───────────────────────────────────────────────────────

    /// Returns `true` if auto-escaping must not be applied to this value.
    pub fn is_safe(&self) -> bool {
        self.safe
    }

    /// Marks the value as already escaped.
    #[must_use]
    pub fn mark_safe(mut self) -> Self {
        self.safe = true;
        self
    }

    // ── Coercion ─────────────────────────────────────────────────────

    /// Truthiness: nil, `false`, `0`, `0.0`, empty string, empty list and
    /// empty map are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match &self.data {
            ValueData::None => false,
            ValueData::Bool(b) => *b,
            ValueData::Integer(i) => *i != 0,
            ValueData::Float(f) => *f != 0.0,
            ValueData::String(s) => !s.is_empty(),
            ValueData::List(l) => !l.is_empty(),
            ValueData::Map(m) => !m.is_empty(),
            ValueData::DateTime(_) | ValueData::Object(_) | ValueData::Function(_) => true,
        }
    }

    /// Attempts to read this value as an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match &self.data {
            ValueData::Integer(i) => Some(*i),
            ValueData::Float(f) => Some(*f as i64),
            ValueData::String(s) => s.trim().parse::<i64>().ok(),
            ValueData::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Attempts to read this value as a float.
    pub fn as_float(&self) -> Option<f64> {
        match &self.data {
            ValueData::Float(f) => Some(*f),
            ValueData::Integer(i) => Some(*i as f64),
            ValueData::String(s) => s.trim().parse::<f64>().ok(),
            ValueData::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Borrows the string contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            ValueData::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrows the list contents, if this is a list.
    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match &self.data {
            ValueData::List(l) => Some(l),
            _ => None,
        }
    }

    /// Borrows the map contents, if this is a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match &self.data {
            ValueData::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Reads the date-time, if this is one.
    pub fn as_datetime(&self) -> Option<DateTime<FixedOffset>> {
        match &self.data {
            ValueData::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Converts this value to its output string (without HTML escaping).
    pub fn to_display_string(&self) -> String {
        match &self.data {
            ValueData::None => String::new(),
            ValueData::Bool(b) => {
                if *b {
                    "True".to_string()
                } else {
                    "False".to_string()
                }
            }
            ValueData::Integer(i) => i.to_string(),
            ValueData::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            ValueData::String(s) => s.clone(),
            ValueData::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::to_repr).collect();
                format!("[{}]", inner.join(", "))
            }
            ValueData::Map(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.to_repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            ValueData::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S %:z").to_string(),
            ValueData::Object(obj) => obj.render(),
            ValueData::Function(_) => "<function>".to_string(),
        }
    }

    /// A Python-like repr, used when nesting inside lists and maps.
    fn to_repr(&self) -> String {
        match &self.data {
            ValueData::String(s) => format!("'{s}'"),
            ValueData::None => "None".to_string(),
            _ => self.to_display_string(),
        }
    }

    // ── Structure ────────────────────────────────────────────────────

    /// Length of a string (in characters), list, map or sized object.
    pub fn len(&self) -> Option<usize> {
        match &self.data {
            ValueData::String(s) => Some(s.chars().count()),
            ValueData::List(l) => Some(l.len()),
            ValueData::Map(m) => Some(m.len()),
            ValueData::Object(obj) => obj.length(),
            _ => None,
        }
    }

    /// Returns `true` for an empty string, list or map.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Element access by position. Strings index by character; negative
    /// indices count from the end.
    pub fn index(&self, idx: i64) -> Option<Value> {
        let len = self.len()? as i64;
        let idx = if idx < 0 { len + idx } else { idx };
        if idx < 0 || idx >= len {
            return None;
        }
        match &self.data {
            ValueData::String(s) => s
                .chars()
                .nth(idx as usize)
                .map(|c| Value::from(c.to_string())),
            ValueData::List(l) => l.get(idx as usize).cloned(),
            ValueData::Object(obj) => obj.get_indexed_field(idx),
            _ => None,
        }
    }

    /// Python-style slicing of strings (by character) and lists. Either
    /// bound may be omitted; negative bounds count from the end.
    pub fn slice(&self, from: Option<i64>, to: Option<i64>) -> Option<Value> {
        let len = self.len()? as i64;
        let clamp = |bound: i64| -> i64 {
            let b = if bound < 0 { len + bound } else { bound };
            b.clamp(0, len)
        };
        let start = clamp(from.unwrap_or(0));
        let end = clamp(to.unwrap_or(len)).max(start);
        match &self.data {
            ValueData::String(s) => {
                let sliced: String = s
                    .chars()
                    .skip(start as usize)
                    .take((end - start) as usize)
                    .collect();
                Some(Value::from(sliced))
            }
            ValueData::List(l) => Some(Value::from(l[start as usize..end as usize].to_vec())),
            _ => None,
        }
    }

    /// Membership test: substring for strings, element for lists, key for
    /// maps, named field for objects.
    pub fn contains(&self, needle: &Value) -> bool {
        match &self.data {
            ValueData::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
            ValueData::List(items) => items.iter().any(|item| item == needle),
            ValueData::Map(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
            ValueData::Object(obj) => needle
                .as_str()
                .is_some_and(|k| obj.get_named_field(k).is_some()),
            _ => false,
        }
    }

    /// Forward iteration. Maps yield `(key, Some(value))`; strings yield
    /// one-character strings; lists yield their elements.
    pub fn iterate(&self) -> Option<Vec<(Value, Option<Value>)>> {
        match &self.data {
            ValueData::String(s) => Some(
                s.chars()
                    .map(|c| (Value::from(c.to_string()), None))
                    .collect(),
            ),
            ValueData::List(l) => Some(l.iter().map(|v| (v.clone(), None)).collect()),
            ValueData::Map(m) => Some(
                m.iter()
                    .map(|(k, v)| (Value::from(k.clone()), Some(v.clone())))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Iteration with optional sorting (by natural order of the yielded
    /// item) and optional reversal.
    pub fn iterate_order(&self, sorted: bool, reversed: bool) -> Option<Vec<(Value, Option<Value>)>> {
        let mut items = self.iterate()?;
        if sorted {
            items.sort_by(|a, b| natural_cmp(&a.0, &b.0));
        }
        if reversed {
            items.reverse();
        }
        Some(items)
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (&self.data, &other.data) {
            (ValueData::None, ValueData::None) => true,
            (ValueData::Bool(a), ValueData::Bool(b)) => a == b,
            (ValueData::Integer(a), ValueData::Integer(b)) => a == b,
            (ValueData::Float(a), ValueData::Float(b)) => a == b,
            (ValueData::Integer(a), ValueData::Float(b))
            | (ValueData::Float(b), ValueData::Integer(a)) => (*a as f64) == *b,
            (ValueData::String(a), ValueData::String(b)) => a == b,
            (ValueData::List(a), ValueData::List(b)) => a == b,
            (ValueData::Map(a), ValueData::Map(b)) => a == b,
            (ValueData::DateTime(a), ValueData::DateTime(b)) => a == b,
            (ValueData::Object(a), ValueData::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Total natural ordering used for sorting and the relational operators:
/// numbers compare numerically, strings by code point, everything else by
/// display string.
pub(crate) fn natural_cmp(a: &Value, b: &Value) -> Ordering {
    if a.is_number() && b.is_number() {
        let (x, y) = (a.as_float().unwrap_or(0.0), b.as_float().unwrap_or(0.0));
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    match (&a.data, &b.data) {
        (ValueData::String(x), ValueData::String(y)) => x.cmp(y),
        (ValueData::DateTime(x), ValueData::DateTime(y)) => x.cmp(y),
        _ => a.to_display_string().cmp(&b.to_display_string()),
    }
}

/// Escapes `& < > " '` to `&amp; &lt; &gt; &quot; &#39;`.
///
/// This is the single function behind both the `escape` filter and the
/// implicit auto-escape pipeline.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

// ── From implementations ─────────────────────────────────────────────

macro_rules! value_from_data {
    ($ty:ty, $val:ident => $data:expr) => {
        impl From<$ty> for Value {
            fn from($val: $ty) -> Self {
                Self {
                    data: $data,
                    safe: false,
                }
            }
        }
    };
}

value_from_data!(&str, s => ValueData::String(s.to_string()));
value_from_data!(String, s => ValueData::String(s));
value_from_data!(bool, b => ValueData::Bool(b));
value_from_data!(i32, i => ValueData::Integer(i64::from(i)));
value_from_data!(i64, i => ValueData::Integer(i));
value_from_data!(u32, i => ValueData::Integer(i64::from(i)));
value_from_data!(u64, i => ValueData::Integer(i as i64));
value_from_data!(usize, i => ValueData::Integer(i as i64));
value_from_data!(f32, f => ValueData::Float(f64::from(f)));
value_from_data!(f64, f => ValueData::Float(f));
value_from_data!(DateTime<FixedOffset>, dt => ValueData::DateTime(dt));
value_from_data!(DateTime<Utc>, dt => ValueData::DateTime(dt.fixed_offset()));
value_from_data!(DateTime<Local>, dt => ValueData::DateTime(dt.fixed_offset()));

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self {
            data: ValueData::List(v.into_iter().map(Into::into).collect()),
            safe: false,
        }
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(m: BTreeMap<String, T>) -> Self {
        Self {
            data: ValueData::Map(m.into_iter().map(|(k, v)| (k, v.into())).collect()),
            safe: false,
        }
    }
}

impl<T: Into<Value>> From<HashMap<String, T>> for Value {
    fn from(m: HashMap<String, T>) -> Self {
        Self {
            data: ValueData::Map(m.into_iter().map(|(k, v)| (k, v.into())).collect()),
            safe: false,
        }
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(o: Option<T>) -> Self {
        o.map_or_else(Self::none, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::none(),
            serde_json::Value::Bool(b) => Self::from(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::from(i)
                } else if let Some(f) = n.as_f64() {
                    Self::from(f)
                } else {
                    Self::none()
                }
            }
            serde_json::Value::String(s) => Self::from(s),
            serde_json::Value::Array(arr) => {
                Self::from(arr.into_iter().map(Value::from).collect::<Vec<_>>())
            }
            serde_json::Value::Object(map) => Self {
                data: ValueData::Map(
                    map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
                ),
                safe: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::none().is_truthy());
        assert!(!Value::from(false).is_truthy());
        assert!(!Value::from(0i64).is_truthy());
        assert!(!Value::from(0.0f64).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::from(Vec::<Value>::new()).is_truthy());
        assert!(!Value::from(BTreeMap::<String, Value>::new()).is_truthy());

        assert!(Value::from(true).is_truthy());
        assert!(Value::from(-1i64).is_truthy());
        assert!(Value::from(0.5f64).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(Value::from(vec![1i64]).is_truthy());
    }

    #[test]
    fn test_display_strings() {
        assert_eq!(Value::from(42i64).to_display_string(), "42");
        assert_eq!(Value::from(3.0f64).to_display_string(), "3.0");
        assert_eq!(Value::from(3.25f64).to_display_string(), "3.25");
        assert_eq!(Value::from(true).to_display_string(), "True");
        assert_eq!(Value::none().to_display_string(), "");
        assert_eq!(
            Value::from(vec!["a", "b"]).to_display_string(),
            "['a', 'b']"
        );
    }

    #[test]
    fn test_map_display_is_sorted() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), Value::from(2i64));
        map.insert("a".to_string(), Value::from(1i64));
        assert_eq!(Value::from(map).to_display_string(), "{'a': 1, 'b': 2}");
    }

    #[test]
    fn test_numeric_equality_crosses_types() {
        assert_eq!(Value::from(1i64), Value::from(1.0f64));
        assert_ne!(Value::from(1i64), Value::from(1.5f64));
    }

    #[test]
    fn test_string_len_counts_chars() {
        assert_eq!(Value::from("héllo").len(), Some(5));
        assert_eq!(Value::from("日本語").len(), Some(3));
    }

    #[test]
    fn test_index_positive_and_negative() {
        let list = Value::from(vec!["a", "b", "c"]);
        assert_eq!(list.index(0).unwrap().to_display_string(), "a");
        assert_eq!(list.index(-1).unwrap().to_display_string(), "c");
        assert!(list.index(3).is_none());
        assert!(list.index(-4).is_none());

        let s = Value::from("abc");
        assert_eq!(s.index(1).unwrap().to_display_string(), "b");
    }

    #[test]
    fn test_slice_python_semantics() {
        let list = Value::from(vec![0i64, 1, 2, 3, 4]);
        assert_eq!(
            list.slice(Some(1), Some(3)).unwrap().to_display_string(),
            "[1, 2]"
        );
        assert_eq!(
            list.slice(None, Some(-2)).unwrap().to_display_string(),
            "[0, 1, 2]"
        );
        assert_eq!(
            list.slice(Some(-2), None).unwrap().to_display_string(),
            "[3, 4]"
        );
        assert_eq!(
            list.slice(Some(4), Some(1)).unwrap().to_display_string(),
            "[]"
        );

        let s = Value::from("héllo");
        assert_eq!(s.slice(Some(1), Some(3)).unwrap().to_display_string(), "él");
    }

    #[test]
    fn test_contains() {
        assert!(Value::from("hello").contains(&Value::from("ell")));
        assert!(Value::from(vec![1i64, 2, 3]).contains(&Value::from(2i64)));
        let mut map = BTreeMap::new();
        map.insert("key".to_string(), Value::from(1i64));
        assert!(Value::from(map).contains(&Value::from("key")));
        assert!(!Value::from(5i64).contains(&Value::from(5i64)));
    }

    #[test]
    fn test_iterate_order() {
        let list = Value::from(vec![3i64, 1, 2]);
        let forward: Vec<String> = list
            .iterate_order(false, false)
            .unwrap()
            .into_iter()
            .map(|(v, _)| v.to_display_string())
            .collect();
        assert_eq!(forward, ["3", "1", "2"]);

        let sorted: Vec<String> = list
            .iterate_order(true, false)
            .unwrap()
            .into_iter()
            .map(|(v, _)| v.to_display_string())
            .collect();
        assert_eq!(sorted, ["1", "2", "3"]);

        let reversed: Vec<String> = list
            .iterate_order(false, true)
            .unwrap()
            .into_iter()
            .map(|(v, _)| v.to_display_string())
            .collect();
        assert_eq!(reversed, ["2", "1", "3"]);
    }

    #[test]
    fn test_map_iteration_yields_pairs() {
        let mut map = BTreeMap::new();
        map.insert("one".to_string(), Value::from(1i64));
        map.insert("two".to_string(), Value::from(2i64));
        let items = Value::from(map).iterate().unwrap();
        assert_eq!(items[0].0.to_display_string(), "one");
        assert_eq!(items[0].1.as_ref().unwrap().to_display_string(), "1");
    }

    #[test]
    fn test_safe_flag() {
        let v = Value::from("<b>");
        assert!(!v.is_safe());
        let v = v.mark_safe();
        assert!(v.is_safe());
        assert!(Value::safe("<b>").is_safe());
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">it's &"#),
            "&lt;a href=&quot;x&quot;&gt;it&#39;s &amp;"
        );
    }

    #[test]
    fn test_from_json() {
        let json = serde_json::json!({
            "name": "vellum",
            "version": 1,
            "pi": 3.14,
            "tags": ["a", "b"],
            "missing": null
        });
        let v = Value::from(json);
        let map = v.as_map().unwrap();
        assert_eq!(map.get("name").unwrap().as_str(), Some("vellum"));
        assert_eq!(map.get("version").unwrap().as_integer(), Some(1));
        assert!(map.get("missing").unwrap().is_nil());
        assert_eq!(map.get("tags").unwrap().len(), Some(2));
    }

    #[test]
    fn test_as_integer_coercions() {
        assert_eq!(Value::from("42").as_integer(), Some(42));
        assert_eq!(Value::from(3.9f64).as_integer(), Some(3));
        assert_eq!(Value::from(true).as_integer(), Some(1));
        assert_eq!(Value::none().as_integer(), None);
    }

    #[test]
    fn test_natural_cmp() {
        assert_eq!(
            natural_cmp(&Value::from(2i64), &Value::from(10i64)),
            Ordering::Less
        );
        assert_eq!(
            natural_cmp(&Value::from("b"), &Value::from("a")),
            Ordering::Greater
        );
        assert_eq!(
            natural_cmp(&Value::from(1.5f64), &Value::from(1i64)),
            Ordering::Greater
        );
    }

    #[derive(Debug)]
    struct Point {
        x: i64,
        y: i64,
    }

    impl Object for Point {
        fn get_named_field(&self, name: &str) -> Option<Value> {
            match name {
                "x" => Some(Value::from(self.x)),
                "y" => Some(Value::from(self.y)),
                _ => None,
            }
        }

        fn call_method(&self, name: &str, _args: &[Value]) -> Option<Result<Value, Error>> {
            match name {
                "sum" => Some(Ok(Value::from(self.x + self.y))),
                _ => None,
            }
        }

        fn render(&self) -> String {
            format!("({}, {})", self.x, self.y)
        }
    }

    #[test]
    fn test_object_fields_and_render() {
        let v = Value::object(Arc::new(Point { x: 3, y: 4 }));
        assert_eq!(v.to_display_string(), "(3, 4)");
        assert!(v.contains(&Value::from("x")));
        assert!(!v.contains(&Value::from("z")));
    }
}
