#![forbid(unsafe_code)]

//! **continuum-value** – the closed value universe the engine persists.
//!
//! Every other crate in the workspace builds on [`Value`] and [`classify`].
//! No crate outside this one is allowed to match on `Value` variants directly
//! to decide behaviour — they call [`classify`] first and dispatch on the
//! resulting [`ValueCategory`]. This keeps the type-tag decision in one place.
//!
//! Composite variants (`Array`, `Map`, `Set`, `Object`, `Date`, `Regex`,
//! `Function`) are `Rc<RefCell<_>>` handles rather than owned trees. This is
//! what lets `Value` represent shared references and cycles at all —
//! `Value::clone()` on a composite shares identity, exactly like assigning an
//! object reference in the source language, and a node's stable identity for
//! the lifetime of the `Rc` is simply its allocation address (see
//! [`identity`]). It is also what realises the spec's weak `target→facade`
//! maps directly: `std::rc::Weak` is the natural Rust analogue, used by
//! `continuum-proxy`.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};

/// Shared, interior-mutable handle to a composite payload.
pub type Ref<T> = Rc<RefCell<T>>;

pub fn new_ref<T>(value: T) -> Ref<T> {
    Rc::new(RefCell::new(value))
}

/// Stable identity of a composite value for the lifetime of its `Rc`
/// allocation — the systems-language replacement for weak-map identity.
pub type NodeId = usize;

//─────────────────────────────
//  Symbols
//─────────────────────────────

/// Process-local opaque identity token. Two `SymbolId`s are equal iff they
/// were produced by the same [`SymbolId::new`] call; identity is not
/// preserved across processes (per the spec's `SymbolLike` definition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(u64);

static NEXT_SYMBOL_ID: AtomicU64 = AtomicU64::new(1);

impl SymbolId {
    pub fn new() -> Self {
        Self(NEXT_SYMBOL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SymbolId {
    fn default() -> Self {
        Self::new()
    }
}

//─────────────────────────────
//  Date and Regex composites
//─────────────────────────────

/// A `Date` value: a timestamp plus arbitrary user-attached properties.
///
/// `timestamp` is `None` for an invalid date (the source allows constructing
/// an invalid `Date`; it still round-trips, just with `__dateValue__: null`
/// on the wire per spec §4.3).
#[derive(Debug, Clone)]
pub struct DateValue {
    pub timestamp: Option<DateTime<Utc>>,
    pub properties: IndexMap<String, Value>,
}

impl DateValue {
    pub fn valid(ts: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(ts),
            properties: IndexMap::new(),
        }
    }

    pub fn invalid() -> Self {
        Self {
            timestamp: None,
            properties: IndexMap::new(),
        }
    }
}

/// A `Regex` value: pattern, flags, and a mutable scanning cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct RegexValue {
    pub source: String,
    pub flags: String,
    pub last_index: i64,
}

/// An opaque function handle: only the captured source text survives.
/// There is no live callable restoration (spec §9 Design Notes).
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionValue {
    /// `None` when no source text could be captured at wrap time — such a
    /// function is silently unserialisable (spec §4.3 / §7 `Unserialisable`).
    pub source_code: Option<String>,
}

//─────────────────────────────
//  Map / Set keys
//─────────────────────────────

/// A key usable in a [`Value::Map`] or [`Value::Set`]. Composite keys
/// compare/hash by reference identity (the `Rc` address); primitive keys
/// compare/hash structurally, matching the host's SameValueZero-style key
/// equality (NaN equals NaN as a key, `+0`/`-0` do not need to be
/// distinguished since the engine never produces `-0.0`).
#[derive(Debug, Clone)]
pub struct MapKey(pub Value);

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        key_eq(&self.0, &other.0)
    }
}
impl Eq for MapKey {}

impl std::hash::Hash for MapKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        hash_key(&self.0, state);
    }
}

/// A key usable in a [`Value::Set`]; same comparison rules as [`MapKey`].
#[derive(Debug, Clone)]
pub struct SetKey(pub Value);

impl PartialEq for SetKey {
    fn eq(&self, other: &Self) -> bool {
        key_eq(&self.0, &other.0)
    }
}
impl Eq for SetKey {}

impl std::hash::Hash for SetKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        hash_key(&self.0, state);
    }
}

fn key_eq(a: &Value, b: &Value) -> bool {
    match (identity(a), identity(b)) {
        (Some(x), Some(y)) => x == y,
        (None, None) => primitive_fingerprint(a) == primitive_fingerprint(b),
        _ => false,
    }
}

fn hash_key<H: std::hash::Hasher>(v: &Value, state: &mut H) {
    use std::hash::Hash;
    match identity(v) {
        Some(id) => id.hash(state),
        None => primitive_fingerprint(v).hash(state),
    }
}

fn primitive_fingerprint(v: &Value) -> String {
    match v {
        Value::Null => "n".into(),
        Value::Undefined => "u".into(),
        Value::Bool(b) => format!("b{b}"),
        Value::Number(n) => format!("f{}", n.to_bits()),
        Value::Str(s) => format!("s{s}"),
        Value::BigInt(s) => format!("i{s}"),
        Value::Symbol(id, _) => format!("y{id:?}"),
        // composites never reach here; key_eq/hash_key route them through `identity`.
        _ => unreachable!("composite value has no primitive fingerprint"),
    }
}

//─────────────────────────────
//  The Value universe (spec §3)
//─────────────────────────────

/// The closed sum of values the engine can persist.
#[derive(Clone)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    /// Finite, NaN, or ±∞ — all are valid and all round-trip (spec §3).
    Number(f64),
    Str(String),
    /// Arbitrary-precision integer, carried as decimal text.
    BigInt(String),
    Symbol(SymbolId, Option<String>),
    Date(Ref<DateValue>),
    Regex(Ref<RegexValue>),
    Function(Ref<FunctionValue>),
    Array(Ref<Vec<Value>>),
    Map(Ref<IndexMap<MapKey, Value>>),
    Set(Ref<IndexSet<SetKey>>),
    Object(Ref<IndexMap<String, Value>>),
}

impl Value {
    pub fn object() -> Self {
        Value::Object(new_ref(IndexMap::new()))
    }

    pub fn array() -> Self {
        Value::Array(new_ref(Vec::new()))
    }

    pub fn is_composite(&self) -> bool {
        let c = classify(self);
        c.is_object || c.is_collection
    }
}

/// Stable identity of a composite `Value` (the `Rc` allocation address), or
/// `None` for primitives. Two composites share identity iff `identity`
/// returns the same `NodeId` for both — this is what "the same underlying
/// value is always wrapped by the same façade" (spec §3 Invariants) reduces
/// to in this representation.
pub fn identity(v: &Value) -> Option<NodeId> {
    match v {
        Value::Date(r) => Some(Rc::as_ptr(r) as *const () as usize),
        Value::Regex(r) => Some(Rc::as_ptr(r) as *const () as usize),
        Value::Function(r) => Some(Rc::as_ptr(r) as *const () as usize),
        Value::Array(r) => Some(Rc::as_ptr(r) as *const () as usize),
        Value::Map(r) => Some(Rc::as_ptr(r) as *const () as usize),
        Value::Set(r) => Some(Rc::as_ptr(r) as *const () as usize),
        Value::Object(r) => Some(Rc::as_ptr(r) as *const () as usize),
        _ => None,
    }
}

impl fmt::Debug for Value {
    /// Never recurses into composite children — a cyclic graph would
    /// otherwise overflow the stack when debug-printed. Composites print
    /// their category and identity only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Undefined => write!(f, "Undefined"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::BigInt(s) => write!(f, "BigInt({s})"),
            Value::Symbol(id, desc) => write!(f, "Symbol({id:?}, {desc:?})"),
            other => write!(
                f,
                "{:?}(#{:x})",
                classify(other).category,
                identity(other).unwrap_or(0)
            ),
        }
    }
}

/// The finite tag set every `Value` maps to (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueCategory {
    Null,
    Undefined,
    Bool,
    Number,
    Str,
    BigInt,
    Symbol,
    Date,
    Regexp,
    Function,
    Array,
    Map,
    Set,
    Object,
}

/// The classifier's output: category plus the coarse predicates every other
/// component dispatches on (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ValueCategory,
    pub is_primitive: bool,
    pub is_object: bool,
    pub is_collection: bool,
    pub needs_special_encoding: bool,
}

/// Classify a value. This is the sole authority for type dispatch in the
/// engine — no other module performs its own type tests (spec §4.1).
pub fn classify(v: &Value) -> Classification {
    use ValueCategory::*;
    let category = match v {
        Value::Null => Null,
        Value::Undefined => Undefined,
        Value::Bool(_) => Bool,
        Value::Number(_) => Number,
        Value::Str(_) => Str,
        Value::BigInt(_) => BigInt,
        Value::Symbol(..) => Symbol,
        Value::Date(_) => Date,
        Value::Regex(_) => Regexp,
        Value::Function(_) => Function,
        Value::Array(_) => Array,
        Value::Map(_) => Map,
        Value::Set(_) => Set,
        Value::Object(_) => Object,
    };

    let is_primitive = matches!(
        category,
        Null | Undefined | Bool | Number | Str | BigInt | Symbol
    );
    let is_collection = matches!(category, Array | Map | Set);
    let is_object = matches!(category, Object | Date | Regexp | Function);
    let needs_special_encoding =
        matches!(category, BigInt | Symbol | Date | Regexp | Function | Map | Set);

    Classification {
        category,
        is_primitive,
        is_object,
        is_collection,
        needs_special_encoding,
    }
}

/// Cycle-safe structural equality: two values compare equal when every
/// reachable leaf compares equal and the *set of already-compared pairs of
/// composites* matches up, so cyclic graphs terminate instead of recursing
/// forever (spec §8 property 1: cycles "compare by identity ... at the
/// points where the source had identity").
pub fn structural_eq(a: &Value, b: &Value) -> bool {
    let mut seen = std::collections::HashSet::new();
    eq_inner(a, b, &mut seen)
}

fn eq_inner(a: &Value, b: &Value, seen: &mut std::collections::HashSet<(NodeId, NodeId)>) -> bool {
    match (identity(a), identity(b)) {
        (Some(ia), Some(ib)) => {
            if !seen.insert((ia, ib)) {
                // already comparing this pair higher up the call stack: a
                // shared/cyclic reference on both sides is consistent.
                return true;
            }
        }
        (None, None) => {}
        _ => return false,
    }

    match (a, b) {
        (Value::Null, Value::Null) | (Value::Undefined, Value::Undefined) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x.to_bits() == y.to_bits() || x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        (Value::Symbol(x, _), Value::Symbol(y, _)) => x == y,
        (Value::Date(x), Value::Date(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.timestamp == y.timestamp
                && x.properties.len() == y.properties.len()
                && x.properties
                    .iter()
                    .all(|(k, v)| y.properties.get(k).is_some_and(|yv| eq_inner(v, yv, seen)))
        }
        (Value::Regex(x), Value::Regex(y)) => *x.borrow() == *y.borrow(),
        (Value::Function(x), Value::Function(y)) => *x.borrow() == *y.borrow(),
        (Value::Array(x), Value::Array(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| eq_inner(p, q, seen))
        }
        (Value::Map(x), Value::Map(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.get(k).is_some_and(|yv| eq_inner(v, yv, seen))
                })
        }
        (Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().all(|k| y.contains(k))
        }
        (Value::Object(x), Value::Object(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.get(k).is_some_and(|yv| eq_inner(v, yv, seen))
                })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_every_category_before_generic_fallback() {
        assert_eq!(classify(&Value::Null).category, ValueCategory::Null);
        assert_eq!(
            classify(&Value::Date(new_ref(DateValue::invalid()))).category,
            ValueCategory::Date
        );
        assert_eq!(
            classify(&Value::Regex(new_ref(RegexValue {
                source: "a".into(),
                flags: "g".into(),
                last_index: 0
            })))
            .category,
            ValueCategory::Regexp
        );
        assert_eq!(
            classify(&Value::Function(new_ref(FunctionValue { source_code: None }))).category,
            ValueCategory::Function
        );
    }

    #[test]
    fn cloning_a_composite_shares_identity() {
        let a = Value::object();
        let b = a.clone();
        assert_eq!(identity(&a), identity(&b));
    }

    #[test]
    fn two_fresh_objects_have_different_identity() {
        let a = Value::object();
        let b = Value::object();
        assert_ne!(identity(&a), identity(&b));
    }

    #[test]
    fn structural_eq_handles_self_cycle() {
        let a = Value::object();
        if let Value::Object(fields) = &a {
            fields.borrow_mut().insert("self".into(), a.clone());
        }
        assert!(structural_eq(&a, &a.clone()));
    }

    #[test]
    fn structural_eq_distinguishes_different_content() {
        let a = Value::Number(1.0);
        let b = Value::Number(2.0);
        assert!(!structural_eq(&a, &b));
    }

    #[test]
    fn needs_special_encoding_matches_spec_wire_tags() {
        for (v, expected) in [
            (Value::Null, false),
            (Value::Bool(true), false),
            (Value::Number(1.0), false),
            (Value::Str("s".into()), false),
            (Value::BigInt("1".into()), true),
            (Value::Symbol(SymbolId::new(), None), true),
            (Value::Date(new_ref(DateValue::invalid())), true),
            (
                Value::Regex(new_ref(RegexValue {
                    source: "a".into(),
                    flags: "".into(),
                    last_index: 0,
                })),
                true,
            ),
            (Value::Function(new_ref(FunctionValue { source_code: None })), true),
            (Value::array(), false),
            (Value::object(), false),
        ] {
            assert_eq!(classify(&v).needs_special_encoding, expected);
        }
    }
}
