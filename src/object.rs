//! # Typed Value Graph
//!
//! The unit of exchange between peers is an [`Object`]: a reference-counted
//! node in a recursive, tag-discriminated value tree. Scalars (`null`,
//! `bool`, `int64`, `uint64`, `double`, `date`, `data`, `string`, `uuid`,
//! `error`) are immutable after creation; the two containers (`array`,
//! `dictionary`) accept mutation and own their children.
//!
//! ## Ownership
//!
//! `Object` is a cheap handle backed by an `Arc`. Cloning a handle retains
//! the node; dropping a handle releases it. When the last handle goes away
//! the node is destroyed exactly once, recursively releasing owned children.
//! Inserting a value into a container stores a clone of the handle, so the
//! container keeps its children alive for as long as it lives.
//!
//! ## Permissive accessors
//!
//! Typed getters never panic and never error: a missing key or a mismatched
//! tag yields the kind's zero value (or `None` for reference-shaped
//! payloads). This keeps message-unpacking code free of error plumbing at
//! the cost of silently absorbing type confusion, which is the intended
//! trade-off for this API.
//!
//! ## Threading
//!
//! The reference count is atomic and handles may be sent across threads
//! freely. Container mutation is internally locked for memory safety, but
//! mutating one container from two threads concurrently has unspecified
//! ordering and is a caller bug.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Sentinel index for [`Object::array_set_value`] meaning "append".
pub const ARRAY_APPEND: usize = usize::MAX;

/// The closed set of value tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Null,
    Bool,
    Int64,
    Uint64,
    Double,
    Date,
    Data,
    String,
    Uuid,
    Array,
    Dictionary,
    Error,
}

impl Kind {
    /// Lowercase tag name, as used by [`Object::description`].
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Null => "null",
            Kind::Bool => "bool",
            Kind::Int64 => "int64",
            Kind::Uint64 => "uint64",
            Kind::Double => "double",
            Kind::Date => "date",
            Kind::Data => "data",
            Kind::String => "string",
            Kind::Uuid => "uuid",
            Kind::Array => "array",
            Kind::Dictionary => "dictionary",
            Kind::Error => "error",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) enum Payload {
    Null,
    Bool(bool),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Date(i64),
    Data(Vec<u8>),
    String(String),
    Uuid(Uuid),
    Array(Mutex<Vec<Object>>),
    Dictionary(Mutex<Vec<(String, Object)>>),
    Error(ErrorCode),
}

struct Node {
    payload: Payload,
    from_wire: bool,
    // Correlation id of the frame this node arrived in; 0 when locally
    // minted. Written once by the receive path before the node is shared.
    wire_id: AtomicU64,
}

/// A node in the value graph. See the module documentation.
#[derive(Clone)]
pub struct Object {
    node: Arc<Node>,
}

impl Object {
    fn with_payload(payload: Payload, from_wire: bool) -> Object {
        Object {
            node: Arc::new(Node {
                payload,
                from_wire,
                wire_id: AtomicU64::new(0),
            }),
        }
    }

    /// The null value.
    pub fn null() -> Object {
        Object::with_payload(Payload::Null, false)
    }

    pub fn boolean(value: bool) -> Object {
        Object::with_payload(Payload::Bool(value), false)
    }

    pub fn int64(value: i64) -> Object {
        Object::with_payload(Payload::Int64(value), false)
    }

    pub fn uint64(value: u64) -> Object {
        Object::with_payload(Payload::Uint64(value), false)
    }

    pub fn double(value: f64) -> Object {
        Object::with_payload(Payload::Double(value), false)
    }

    /// A date value. The interval is interpreted as nanoseconds since the
    /// Unix epoch; the library never converts it, so producer and consumer
    /// must agree on that unit.
    pub fn date(interval: i64) -> Object {
        Object::with_payload(Payload::Date(interval), false)
    }

    /// A date value holding the current wall clock, in nanoseconds since
    /// the Unix epoch.
    pub fn date_now() -> Object {
        let now = chrono::Utc::now();
        Object::date(now.timestamp_nanos_opt().unwrap_or(i64::MAX))
    }

    /// A data value. The bytes are always copied into node-owned storage.
    pub fn data(bytes: &[u8]) -> Object {
        Object::with_payload(Payload::Data(bytes.to_vec()), false)
    }

    pub fn string(value: impl Into<String>) -> Object {
        Object::with_payload(Payload::String(value.into()), false)
    }

    pub fn uuid(value: Uuid) -> Object {
        Object::with_payload(Payload::Uuid(value), false)
    }

    /// An array holding the given children, in order.
    pub fn array(values: impl IntoIterator<Item = Object>) -> Object {
        Object::with_payload(Payload::Array(Mutex::new(values.into_iter().collect())), false)
    }

    /// An empty dictionary.
    pub fn dictionary() -> Object {
        Object::with_payload(Payload::Dictionary(Mutex::new(Vec::new())), false)
    }

    /// A dictionary pre-populated from `pairs`, honoring last-write-wins
    /// for duplicate keys.
    pub fn dictionary_from<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Object)>) -> Object {
        let dict = Object::dictionary();
        for (key, value) in pairs {
            dict.dictionary_set_value(&key.into(), value);
        }
        dict
    }

    pub(crate) fn dictionary_from_wire() -> Object {
        Object::with_payload(Payload::Dictionary(Mutex::new(Vec::new())), true)
    }

    /// An error value carrying `code`.
    pub fn error(code: ErrorCode) -> Object {
        Object::with_payload(Payload::Error(code), false)
    }

    pub(crate) fn payload(&self) -> &Payload {
        &self.node.payload
    }

    pub(crate) fn is_from_wire(&self) -> bool {
        self.node.from_wire
    }

    pub(crate) fn wire_id(&self) -> u64 {
        self.node.wire_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_wire_id(&self, id: u64) {
        self.node.wire_id.store(id, Ordering::Relaxed);
    }

    /// The node's tag.
    pub fn kind(&self) -> Kind {
        match self.payload() {
            Payload::Null => Kind::Null,
            Payload::Bool(_) => Kind::Bool,
            Payload::Int64(_) => Kind::Int64,
            Payload::Uint64(_) => Kind::Uint64,
            Payload::Double(_) => Kind::Double,
            Payload::Date(_) => Kind::Date,
            Payload::Data(_) => Kind::Data,
            Payload::String(_) => Kind::String,
            Payload::Uuid(_) => Kind::Uuid,
            Payload::Array(_) => Kind::Array,
            Payload::Dictionary(_) => Kind::Dictionary,
            Payload::Error(_) => Kind::Error,
        }
    }

    /// Semantic size: element count for containers, byte length for data
    /// and string, 1 for scalars, 0 for null.
    pub fn len(&self) -> usize {
        match self.payload() {
            Payload::Null => 0,
            Payload::Data(bytes) => bytes.len(),
            Payload::String(s) => s.len(),
            Payload::Array(items) => items.lock().len(),
            Payload::Dictionary(pairs) => pairs.lock().len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bool_value(&self) -> bool {
        match self.payload() {
            Payload::Bool(v) => *v,
            _ => false,
        }
    }

    pub fn int64_value(&self) -> i64 {
        match self.payload() {
            Payload::Int64(v) => *v,
            _ => 0,
        }
    }

    pub fn uint64_value(&self) -> u64 {
        match self.payload() {
            Payload::Uint64(v) => *v,
            _ => 0,
        }
    }

    pub fn double_value(&self) -> f64 {
        match self.payload() {
            Payload::Double(v) => *v,
            _ => 0.0,
        }
    }

    pub fn date_value(&self) -> i64 {
        match self.payload() {
            Payload::Date(v) => *v,
            _ => 0,
        }
    }

    /// Borrowed view of a string payload, valid while this handle lives.
    pub fn string_value(&self) -> Option<&str> {
        match self.payload() {
            Payload::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Borrowed view of a data payload, valid while this handle lives.
    pub fn data_value(&self) -> Option<&[u8]> {
        match self.payload() {
            Payload::Data(bytes) => Some(bytes.as_slice()),
            _ => None,
        }
    }

    pub fn uuid_value(&self) -> Option<Uuid> {
        match self.payload() {
            Payload::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self.payload() {
            Payload::Error(code) => Some(*code),
            _ => None,
        }
    }

    // -- array operations ---------------------------------------------------

    /// Append `value` to an array. No-op on any other kind.
    pub fn array_append_value(&self, value: Object) {
        if let Payload::Array(items) = self.payload() {
            items.lock().push(value);
        }
    }

    /// Replace the element at `index`. [`ARRAY_APPEND`] appends instead;
    /// any other out-of-range index is a silent no-op.
    pub fn array_set_value(&self, index: usize, value: Object) {
        let Payload::Array(items) = self.payload() else {
            return;
        };
        if index == ARRAY_APPEND {
            items.lock().push(value);
            return;
        }
        let mut items = items.lock();
        if index < items.len() {
            items[index] = value;
        }
    }

    /// Retained handle to the element at `index`, if any.
    pub fn array_get_value(&self, index: usize) -> Option<Object> {
        match self.payload() {
            Payload::Array(items) => items.lock().get(index).cloned(),
            _ => None,
        }
    }

    /// Visit elements in insertion order until `applier` returns `false`.
    /// Returns `true` when the walk completed.
    pub fn array_apply(&self, mut applier: impl FnMut(usize, &Object) -> bool) -> bool {
        let snapshot: Vec<Object> = match self.payload() {
            Payload::Array(items) => items.lock().clone(),
            _ => return true,
        };
        for (index, value) in snapshot.iter().enumerate() {
            if !applier(index, value) {
                return false;
            }
        }
        true
    }

    pub fn array_set_bool(&self, index: usize, value: bool) {
        self.array_set_value(index, Object::boolean(value));
    }

    pub fn array_set_int64(&self, index: usize, value: i64) {
        self.array_set_value(index, Object::int64(value));
    }

    pub fn array_set_uint64(&self, index: usize, value: u64) {
        self.array_set_value(index, Object::uint64(value));
    }

    pub fn array_set_double(&self, index: usize, value: f64) {
        self.array_set_value(index, Object::double(value));
    }

    pub fn array_set_date(&self, index: usize, value: i64) {
        self.array_set_value(index, Object::date(value));
    }

    pub fn array_set_data(&self, index: usize, value: &[u8]) {
        self.array_set_value(index, Object::data(value));
    }

    pub fn array_set_string(&self, index: usize, value: &str) {
        self.array_set_value(index, Object::string(value));
    }

    pub fn array_set_uuid(&self, index: usize, value: Uuid) {
        self.array_set_value(index, Object::uuid(value));
    }

    pub fn array_get_bool(&self, index: usize) -> bool {
        self.array_get_value(index).map(|o| o.bool_value()).unwrap_or(false)
    }

    pub fn array_get_int64(&self, index: usize) -> i64 {
        self.array_get_value(index).map(|o| o.int64_value()).unwrap_or(0)
    }

    pub fn array_get_uint64(&self, index: usize) -> u64 {
        self.array_get_value(index).map(|o| o.uint64_value()).unwrap_or(0)
    }

    pub fn array_get_double(&self, index: usize) -> f64 {
        self.array_get_value(index).map(|o| o.double_value()).unwrap_or(0.0)
    }

    pub fn array_get_date(&self, index: usize) -> i64 {
        self.array_get_value(index).map(|o| o.date_value()).unwrap_or(0)
    }

    pub fn array_get_data(&self, index: usize) -> Option<Vec<u8>> {
        self.array_get_value(index)
            .and_then(|o| o.data_value().map(|b| b.to_vec()))
    }

    pub fn array_get_string(&self, index: usize) -> Option<String> {
        self.array_get_value(index)
            .and_then(|o| o.string_value().map(|s| s.to_owned()))
    }

    pub fn array_get_uuid(&self, index: usize) -> Option<Uuid> {
        self.array_get_value(index).and_then(|o| o.uuid_value())
    }

    // -- dictionary operations ----------------------------------------------

    /// Bind `key` to `value`. An existing entry keeps its position and has
    /// its value replaced (last write wins); a new key is appended at the
    /// tail. No-op on non-dictionaries.
    pub fn dictionary_set_value(&self, key: &str, value: Object) {
        debug_assert!(!key.is_empty(), "dictionary keys must be non-empty");
        let Payload::Dictionary(pairs) = self.payload() else {
            return;
        };
        let mut pairs = pairs.lock();
        for pair in pairs.iter_mut() {
            if pair.0 == key {
                pair.1 = value;
                return;
            }
        }
        pairs.push((key.to_owned(), value));
    }

    /// Retained handle to the value bound to `key`, if any.
    pub fn dictionary_get_value(&self, key: &str) -> Option<Object> {
        match self.payload() {
            Payload::Dictionary(pairs) => pairs
                .lock()
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    /// Visit entries in insertion order until `applier` returns `false`.
    /// Returns `true` when the walk completed.
    pub fn dictionary_apply(&self, mut applier: impl FnMut(&str, &Object) -> bool) -> bool {
        let snapshot: Vec<(String, Object)> = match self.payload() {
            Payload::Dictionary(pairs) => pairs.lock().clone(),
            _ => return true,
        };
        for (key, value) in &snapshot {
            if !applier(key, value) {
                return false;
            }
        }
        true
    }

    /// Reply dictionary for a message that arrived over the wire.
    ///
    /// Succeeds only for decoder-produced dictionaries; locally minted
    /// messages yield `None`. The reply remembers the original's
    /// correlation id, so sending it routes back to the matching pending
    /// call on the far side.
    pub fn dictionary_create_reply(&self) -> Option<Object> {
        if self.kind() != Kind::Dictionary || !self.is_from_wire() {
            return None;
        }
        let reply = Object::dictionary();
        reply.set_wire_id(self.wire_id());
        Some(reply)
    }

    pub fn dictionary_set_bool(&self, key: &str, value: bool) {
        self.dictionary_set_value(key, Object::boolean(value));
    }

    pub fn dictionary_set_int64(&self, key: &str, value: i64) {
        self.dictionary_set_value(key, Object::int64(value));
    }

    pub fn dictionary_set_uint64(&self, key: &str, value: u64) {
        self.dictionary_set_value(key, Object::uint64(value));
    }

    pub fn dictionary_set_double(&self, key: &str, value: f64) {
        self.dictionary_set_value(key, Object::double(value));
    }

    pub fn dictionary_set_date(&self, key: &str, value: i64) {
        self.dictionary_set_value(key, Object::date(value));
    }

    pub fn dictionary_set_data(&self, key: &str, value: &[u8]) {
        self.dictionary_set_value(key, Object::data(value));
    }

    pub fn dictionary_set_string(&self, key: &str, value: &str) {
        self.dictionary_set_value(key, Object::string(value));
    }

    pub fn dictionary_set_uuid(&self, key: &str, value: Uuid) {
        self.dictionary_set_value(key, Object::uuid(value));
    }

    pub fn dictionary_get_bool(&self, key: &str) -> bool {
        self.dictionary_get_value(key).map(|o| o.bool_value()).unwrap_or(false)
    }

    pub fn dictionary_get_int64(&self, key: &str) -> i64 {
        self.dictionary_get_value(key).map(|o| o.int64_value()).unwrap_or(0)
    }

    pub fn dictionary_get_uint64(&self, key: &str) -> u64 {
        self.dictionary_get_value(key).map(|o| o.uint64_value()).unwrap_or(0)
    }

    pub fn dictionary_get_double(&self, key: &str) -> f64 {
        self.dictionary_get_value(key).map(|o| o.double_value()).unwrap_or(0.0)
    }

    pub fn dictionary_get_date(&self, key: &str) -> i64 {
        self.dictionary_get_value(key).map(|o| o.date_value()).unwrap_or(0)
    }

    pub fn dictionary_get_data(&self, key: &str) -> Option<Vec<u8>> {
        self.dictionary_get_value(key)
            .and_then(|o| o.data_value().map(|b| b.to_vec()))
    }

    pub fn dictionary_get_string(&self, key: &str) -> Option<String> {
        self.dictionary_get_value(key)
            .and_then(|o| o.string_value().map(|s| s.to_owned()))
    }

    pub fn dictionary_get_uuid(&self, key: &str) -> Option<Uuid> {
        self.dictionary_get_value(key).and_then(|o| o.uuid_value())
    }

    // -- structural operations ----------------------------------------------

    /// Structural hash.
    ///
    /// Scalars with a 64-bit payload hash to that payload; strings and data
    /// use djb2 over their bytes; arrays XOR-fold their children;
    /// dictionaries XOR-fold `djb2(key) ^ hash(value)`. Null, double, uuid
    /// and error hash to zero.
    pub fn hash_value(&self) -> u64 {
        match self.payload() {
            Payload::Bool(v) => *v as u64,
            Payload::Int64(v) => *v as u64,
            Payload::Uint64(v) => *v,
            Payload::Date(v) => *v as u64,
            Payload::String(s) => djb2(s.as_bytes()),
            Payload::Data(bytes) => djb2(bytes),
            Payload::Array(items) => items
                .lock()
                .iter()
                .fold(0u64, |hash, item| hash ^ item.hash_value()),
            Payload::Dictionary(pairs) => pairs
                .lock()
                .iter()
                .fold(0u64, |hash, (key, value)| {
                    hash ^ djb2(key.as_bytes()) ^ value.hash_value()
                }),
            _ => 0,
        }
    }

    /// Structural equality: tag and payload for scalars, hash comparison
    /// for containers.
    ///
    /// A non-negative `int64` compares equal to the same-valued `uint64`:
    /// the wire's minimal integer encoding folds the two classes together
    /// on decode, so structural equality must as well. Doubles compare by
    /// bit pattern.
    pub fn equal(&self, other: &Object) -> bool {
        if Arc::ptr_eq(&self.node, &other.node) {
            return true;
        }
        match (self.payload(), other.payload()) {
            (Payload::Null, Payload::Null) => true,
            (Payload::Bool(a), Payload::Bool(b)) => a == b,
            (Payload::Int64(a), Payload::Int64(b)) => a == b,
            (Payload::Uint64(a), Payload::Uint64(b)) => a == b,
            (Payload::Int64(a), Payload::Uint64(b)) | (Payload::Uint64(b), Payload::Int64(a)) => {
                *a >= 0 && *a as u64 == *b
            }
            (Payload::Double(a), Payload::Double(b)) => a.to_bits() == b.to_bits(),
            (Payload::Date(a), Payload::Date(b)) => a == b,
            (Payload::String(a), Payload::String(b)) => a == b,
            (Payload::Data(a), Payload::Data(b)) => a == b,
            (Payload::Uuid(a), Payload::Uuid(b)) => a == b,
            (Payload::Error(a), Payload::Error(b)) => a == b,
            (Payload::Array(_), Payload::Array(_))
            | (Payload::Dictionary(_), Payload::Dictionary(_)) => {
                self.hash_value() == other.hash_value()
            }
            _ => false,
        }
    }

    /// Deep, independently-owned clone. Containers are rebuilt child by
    /// child; the copy never carries wire provenance.
    pub fn deep_copy(&self) -> Object {
        match self.payload() {
            Payload::Null => Object::null(),
            Payload::Bool(v) => Object::boolean(*v),
            Payload::Int64(v) => Object::int64(*v),
            Payload::Uint64(v) => Object::uint64(*v),
            Payload::Double(v) => Object::double(*v),
            Payload::Date(v) => Object::date(*v),
            Payload::Data(bytes) => Object::data(bytes),
            Payload::String(s) => Object::string(s.clone()),
            Payload::Uuid(u) => Object::uuid(*u),
            Payload::Error(code) => Object::error(*code),
            Payload::Array(items) => {
                let copy = Object::array([]);
                for item in items.lock().iter() {
                    copy.array_append_value(item.deep_copy());
                }
                copy
            }
            Payload::Dictionary(pairs) => {
                let copy = Object::dictionary();
                for (key, value) in pairs.lock().iter() {
                    copy.dictionary_set_value(key, value.deep_copy());
                }
                copy
            }
        }
    }

    /// Human-readable dump of the tree, for diagnostics only.
    pub fn description(&self) -> String {
        let mut out = String::new();
        self.describe(&mut out, 0);
        out
    }

    fn describe(&self, out: &mut String, level: usize) {
        use std::fmt::Write;

        let _ = write!(out, "({}) ", self.kind().name());
        match self.payload() {
            Payload::Null => out.push_str("<null>\n"),
            Payload::Bool(v) => {
                let _ = writeln!(out, "{}", v);
            }
            Payload::Int64(v) => {
                let _ = writeln!(out, "{}", v);
            }
            Payload::Uint64(v) => {
                let _ = writeln!(out, "{:#x}", v);
            }
            Payload::Double(v) => {
                let _ = writeln!(out, "{}", v);
            }
            Payload::Date(v) => {
                let _ = writeln!(out, "{}", v);
            }
            Payload::Data(bytes) => {
                let _ = writeln!(out, "{} bytes", bytes.len());
            }
            Payload::String(s) => {
                let _ = writeln!(out, "\"{}\"", s);
            }
            Payload::Uuid(u) => {
                let _ = writeln!(out, "{}", u);
            }
            Payload::Error(code) => {
                let _ = writeln!(out, "{}", code);
            }
            Payload::Array(_) => {
                out.push('\n');
                self.array_apply(|index, value| {
                    let _ = write!(out, "{:indent$}{}: ", "", index, indent = (level + 1) * 4);
                    value.describe(out, level + 1);
                    true
                });
            }
            Payload::Dictionary(_) => {
                out.push('\n');
                self.dictionary_apply(|key, value| {
                    let _ = write!(out, "{:indent$}\"{}\": ", "", key, indent = (level + 1) * 4);
                    value.describe(out, level + 1);
                    true
                });
            }
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description().trim_end())
    }
}

fn djb2(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 5381;
    for &byte in bytes {
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(byte as u64);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_values_round_trip() {
        assert!(Object::boolean(true).bool_value());
        assert_eq!(Object::int64(-42).int64_value(), -42);
        assert_eq!(Object::uint64(42).uint64_value(), 42);
        assert_eq!(Object::double(1.5).double_value(), 1.5);
        assert_eq!(Object::date(1_000_000).date_value(), 1_000_000);
        assert_eq!(Object::string("hello").string_value(), Some("hello"));
        assert_eq!(Object::data(b"abc").data_value(), Some(b"abc".as_slice()));

        let id = Uuid::new_v4();
        assert_eq!(Object::uuid(id).uuid_value(), Some(id));
        assert_eq!(
            Object::error(ErrorCode::ConnectionInvalid).error_code(),
            Some(ErrorCode::ConnectionInvalid)
        );
    }

    #[test]
    fn mismatched_getters_return_defaults() {
        let s = Object::string("not a number");
        assert_eq!(s.int64_value(), 0);
        assert_eq!(s.uint64_value(), 0);
        assert!(!s.bool_value());
        assert_eq!(s.double_value(), 0.0);
        assert_eq!(s.data_value(), None);
        assert_eq!(s.uuid_value(), None);

        let b = Object::boolean(true);
        assert_eq!(b.string_value(), None);
        assert_eq!(b.dictionary_get_value("k"), None);
        assert_eq!(b.array_get_value(0), None);
    }

    #[test]
    fn len_follows_the_size_semantics() {
        assert_eq!(Object::null().len(), 0);
        assert_eq!(Object::int64(9).len(), 1);
        assert_eq!(Object::string("abc").len(), 3);
        assert_eq!(Object::data(&[1, 2, 3, 4]).len(), 4);
        let arr = Object::array([Object::int64(1), Object::int64(2)]);
        assert_eq!(arr.len(), 2);
    }

    #[test]
    fn array_append_grows_and_indexes() {
        let arr = Object::array([]);
        arr.array_append_value(Object::int64(7));
        arr.array_append_value(Object::string("x"));
        assert_eq!(arr.len(), 2);
        assert_eq!(arr.array_get_int64(0), 7);
        assert_eq!(arr.array_get_string(1).as_deref(), Some("x"));
        assert_eq!(arr.array_get_value(2), None);
    }

    #[test]
    fn array_set_value_sentinel_and_bounds() {
        let arr = Object::array([Object::int64(1)]);
        arr.array_set_value(ARRAY_APPEND, Object::int64(2));
        assert_eq!(arr.len(), 2);
        assert_eq!(arr.array_get_int64(1), 2);

        arr.array_set_value(0, Object::int64(10));
        assert_eq!(arr.array_get_int64(0), 10);

        // out of range is a silent no-op
        arr.array_set_value(5, Object::int64(99));
        assert_eq!(arr.len(), 2);
    }

    #[test]
    fn dictionary_last_write_wins() {
        let dict = Object::dictionary();
        dict.dictionary_set_string("k", "first");
        dict.dictionary_set_string("other", "x");
        dict.dictionary_set_string("k", "second");

        assert_eq!(dict.len(), 2);
        assert_eq!(dict.dictionary_get_string("k").as_deref(), Some("second"));

        // replacement keeps the original position
        let mut keys = Vec::new();
        dict.dictionary_apply(|key, _| {
            keys.push(key.to_owned());
            true
        });
        assert_eq!(keys, vec!["k", "other"]);
    }

    #[test]
    fn apply_short_circuits() {
        let arr = Object::array([Object::int64(1), Object::int64(2), Object::int64(3)]);
        let mut seen = 0;
        let completed = arr.array_apply(|_, _| {
            seen += 1;
            seen < 2
        });
        assert!(!completed);
        assert_eq!(seen, 2);
    }

    #[test]
    fn deep_copy_is_equal_but_independent() {
        let dict = Object::dictionary();
        dict.dictionary_set_value(
            "arr",
            Object::array([Object::int64(1), Object::string("s")]),
        );
        dict.dictionary_set_bool("flag", true);

        let copy = dict.deep_copy();
        assert!(dict.equal(&copy));
        assert_eq!(dict.hash_value(), copy.hash_value());

        copy.dictionary_set_bool("flag", false);
        assert!(dict.dictionary_get_bool("flag"));
        assert!(!copy.dictionary_get_bool("flag"));
        assert!(!dict.equal(&copy));
    }

    #[test]
    fn equality_folds_integer_sign_classes() {
        assert!(Object::int64(42).equal(&Object::uint64(42)));
        assert!(Object::uint64(42).equal(&Object::int64(42)));
        assert!(!Object::int64(-1).equal(&Object::uint64(u64::MAX)));
        assert_eq!(
            Object::int64(42).hash_value(),
            Object::uint64(42).hash_value()
        );
    }

    #[test]
    fn cloned_handles_share_the_node() {
        let dict = Object::dictionary();
        dict.dictionary_set_int64("n", 1);
        let retained = dict.clone();
        drop(dict);
        // the surviving handle still reaches the shared storage
        assert_eq!(retained.dictionary_get_int64("n"), 1);
    }

    #[test]
    fn reply_requires_wire_provenance() {
        let local = Object::dictionary();
        assert!(local.dictionary_create_reply().is_none());
        assert!(Object::string("nope").dictionary_create_reply().is_none());

        let wire = Object::dictionary_from_wire();
        wire.set_wire_id(9);
        let reply = wire.dictionary_create_reply().expect("reply");
        assert_eq!(reply.kind(), Kind::Dictionary);
        assert_eq!(reply.len(), 0);
        assert_eq!(reply.wire_id(), 9);
    }

    #[test]
    fn description_renders_nested_values() {
        let dict = Object::dictionary();
        dict.dictionary_set_value("items", Object::array([Object::int64(1)]));
        let text = dict.description();
        assert!(text.starts_with("(dictionary)"));
        assert!(text.contains("\"items\": (array)"));
        assert!(text.contains("(int64) 1"));
    }
}
