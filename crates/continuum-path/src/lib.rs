#![forbid(unsafe_code)]

//! **continuum-path** – path navigation over [`continuum_value::Value`] trees.
//!
//! A [`Path`] is an immutable ordered sequence of string segments from some
//! root. The empty path denotes the root itself. A segment that looks
//! numeric (`^\d+$`) signals that a missing intermediate along the way
//! should be created as an array; any other segment signals an object
//! (spec §3, §4.2). When the *parent* at a given point in the path is a
//! [`Value::Map`], the final segment is used as a map key rather than a
//! property access — this distinction is load-bearing and is never
//! collapsed into generic property access.
//!
//! Because composites are `Rc<RefCell<_>>` handles (see `continuum-value`),
//! navigation never needs `&mut` access chained all the way from the root:
//! every composite is mutated through its own interior `RefCell`, so `root`
//! is always taken by shared reference. `Value::clone()` on a composite is
//! an `Rc` clone, so `get` returns owned values cheaply.

use continuum_value::{classify, MapKey, Value, ValueCategory};
use thiserror::Error;

/// An ordered sequence of string segments identifying a node from a root.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Path(pub Vec<String>);

impl Path {
    pub fn root() -> Self {
        Path(Vec::new())
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Path(segments.into_iter().map(Into::into).collect())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Path(segments)
    }

    /// Join as a dot-separated string, the representation used for
    /// transaction delta keys (spec §4.12).
    pub fn to_dotted(&self) -> String {
        self.0.join(".")
    }

    pub fn from_dotted(s: &str) -> Path {
        if s.is_empty() {
            Path::root()
        } else {
            Path(s.split('.').map(str::to_string).collect())
        }
    }

    /// Whether `self` lies inside (or at) the subtree rooted at `other`
    /// (used by the event-value cycle tracker, spec §4.3 rule 1).
    pub fn is_within(&self, other: &Path) -> bool {
        self.0.len() >= other.0.len() && self.0[..other.0.len()] == other.0[..]
    }

    /// Re-root `self` (assumed to be within `base`) as a path relative to
    /// `base` (spec §4.3 rule 2 / §4.4 hierarchical resolution).
    pub fn relative_to(&self, base: &Path) -> Path {
        Path(self.0[base.0.len()..].to_vec())
    }
}

fn looks_numeric(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Errors raised while resolving or mutating a path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path segment not found: {0:?}")]
    NotFound(Path),
    #[error("cannot descend into a non-composite value at {0:?}")]
    NotComposite(Path),
    #[error("cannot replace the root in place: incompatible value category")]
    IncompatibleRootReplacement,
}

/// Read a value at `path`. Returns `None` if any segment along the way is
/// absent (spec §4.2: `get` returns "not present").
pub fn get(root: &Value, path: &Path) -> Option<Value> {
    let mut current = root.clone();
    for segment in &path.0 {
        current = step(&current, segment)?;
    }
    Some(current)
}

fn step(value: &Value, segment: &str) -> Option<Value> {
    match value {
        Value::Object(fields) => fields.borrow().get(segment).cloned(),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|i| items.borrow().get(i).cloned()),
        Value::Map(entries) => entries
            .borrow()
            .get(&MapKey(Value::Str(segment.to_string())))
            .cloned(),
        Value::Date(d) => d.borrow().properties.get(segment).cloned(),
        _ => None,
    }
}

/// Navigate to the parent of `path` and report the final segment and
/// whether it already exists, creating missing intermediates when
/// `create_intermediates` is set (spec §4.2). Returns `None` for the empty
/// path (the root has no parent).
pub fn parent_of(
    root: &Value,
    path: &Path,
    create_intermediates: bool,
) -> Result<Option<(Value, String, bool)>, PathError> {
    if path.0.is_empty() {
        return Ok(None);
    }
    let (last, init) = path.0.split_last().expect("checked non-empty above");
    let mut current = root.clone();
    for (i, segment) in init.iter().enumerate() {
        match step(&current, segment) {
            Some(next) => current = next,
            None => {
                if !create_intermediates {
                    return Err(PathError::NotFound(Path(path.0[..=i].to_vec())));
                }
                let next_is_numeric = init
                    .get(i + 1)
                    .map(|s| looks_numeric(s))
                    .unwrap_or_else(|| looks_numeric(last));
                insert_intermediate(&current, segment, next_is_numeric)?;
                current = step(&current, segment)
                    .ok_or_else(|| PathError::NotComposite(Path(path.0[..=i].to_vec())))?;
            }
        }
    }
    let existed = step(&current, last).is_some();
    Ok(Some((current, last.clone(), existed)))
}

fn insert_intermediate(parent: &Value, segment: &str, child_is_array: bool) -> Result<(), PathError> {
    let child = if child_is_array { Value::array() } else { Value::object() };
    match parent {
        Value::Object(fields) => {
            fields.borrow_mut().insert(segment.to_string(), child);
            Ok(())
        }
        Value::Array(items) => {
            let idx: usize = segment
                .parse()
                .map_err(|_| PathError::NotComposite(Path::from_segments([segment])))?;
            let mut items = items.borrow_mut();
            while items.len() <= idx {
                items.push(Value::Undefined);
            }
            items[idx] = child;
            Ok(())
        }
        Value::Map(entries) => {
            entries
                .borrow_mut()
                .insert(MapKey(Value::Str(segment.to_string())), child);
            Ok(())
        }
        Value::Date(d) => {
            d.borrow_mut().properties.insert(segment.to_string(), child);
            Ok(())
        }
        _ => Err(PathError::NotComposite(Path::root())),
    }
}

/// Write `value` at `path`, creating intermediates as necessary. Array vs.
/// object for each missing intermediate is decided by looking one segment
/// ahead (numeric → array), per spec §4.2.
pub fn set(root: &Value, path: &Path, value: Value) -> Result<(), PathError> {
    match parent_of(root, path, true)? {
        None => replace_root_in_place(root, value),
        Some((parent, segment, _existed)) => write_final(&parent, &segment, value),
    }
}

/// Replace the root's contents in place. Only possible when `value` is the
/// same composite category as the current root (an `Rc` can't change which
/// container type it wraps) — the only realistic caller of an empty-path
/// `set` is test/tooling code exercising the root directly.
fn replace_root_in_place(root: &Value, value: Value) -> Result<(), PathError> {
    match (root, &value) {
        (Value::Object(dst), Value::Object(src)) => {
            let replacement = src.borrow().clone();
            *dst.borrow_mut() = replacement;
            Ok(())
        }
        (Value::Array(dst), Value::Array(src)) => {
            let replacement = src.borrow().clone();
            *dst.borrow_mut() = replacement;
            Ok(())
        }
        (Value::Map(dst), Value::Map(src)) => {
            let replacement = src.borrow().clone();
            *dst.borrow_mut() = replacement;
            Ok(())
        }
        (Value::Set(dst), Value::Set(src)) => {
            let replacement = src.borrow().clone();
            *dst.borrow_mut() = replacement;
            Ok(())
        }
        _ => Err(PathError::IncompatibleRootReplacement),
    }
}

fn write_final(parent: &Value, segment: &str, value: Value) -> Result<(), PathError> {
    match parent {
        Value::Object(fields) => {
            fields.borrow_mut().insert(segment.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let idx: usize = segment
                .parse()
                .map_err(|_| PathError::NotComposite(Path::from_segments([segment])))?;
            let mut items = items.borrow_mut();
            while items.len() <= idx {
                items.push(Value::Undefined);
            }
            items[idx] = value;
            Ok(())
        }
        Value::Map(entries) => {
            entries
                .borrow_mut()
                .insert(MapKey(Value::Str(segment.to_string())), value);
            Ok(())
        }
        Value::Date(d) => {
            d.borrow_mut().properties.insert(segment.to_string(), value);
            Ok(())
        }
        _ => Err(PathError::NotComposite(Path::root())),
    }
}

/// Delete the value at `path`; a no-op if the path does not exist
/// (spec §4.2).
pub fn delete(root: &Value, path: &Path) -> Result<(), PathError> {
    match parent_of(root, path, false) {
        Ok(None) => Ok(()),
        Ok(Some((parent, segment, existed))) => {
            if !existed {
                return Ok(());
            }
            match &parent {
                Value::Object(fields) => {
                    fields.borrow_mut().shift_remove(&segment);
                }
                Value::Array(items) => {
                    if let Ok(idx) = segment.parse::<usize>() {
                        let mut items = items.borrow_mut();
                        if idx < items.len() {
                            items[idx] = Value::Undefined;
                        }
                    }
                }
                Value::Map(entries) => {
                    entries
                        .borrow_mut()
                        .shift_remove(&MapKey(Value::Str(segment.clone())));
                }
                Value::Date(d) => {
                    d.borrow_mut().properties.shift_remove(&segment);
                }
                _ => {}
            }
            Ok(())
        }
        Err(PathError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Convenience: the `ValueCategory` at `path`, if present.
pub fn category_at(root: &Value, path: &Path) -> Option<ValueCategory> {
    get(root, path).map(|v| classify(&v).category)
}

#[cfg(test)]
mod tests {
    use super::*;
    use continuum_value::new_ref;
    use proptest::prelude::*;

    #[test]
    fn set_creates_object_intermediates_for_non_numeric_segments() {
        let root = Value::object();
        let path = Path::from_segments(["a", "b"]);
        set(&root, &path, Value::Number(1.0)).unwrap();
        assert!(matches!(get(&root, &path), Some(Value::Number(n)) if n == 1.0));
        assert!(matches!(
            get(&root, &Path::from_segments(["a"])),
            Some(Value::Object(_))
        ));
    }

    #[test]
    fn set_creates_array_intermediate_when_next_segment_is_numeric() {
        let root = Value::object();
        let path = Path::from_segments(["items", "0"]);
        set(&root, &path, Value::Str("x".into())).unwrap();
        assert!(matches!(
            get(&root, &Path::from_segments(["items"])),
            Some(Value::Array(_))
        ));
    }

    #[test]
    fn map_parent_uses_key_access_not_property_access() {
        let root = Value::Map(new_ref(Default::default()));
        let path = Path::from_segments(["k"]);
        set(&root, &path, Value::Number(42.0)).unwrap();
        if let Value::Map(entries) = &root {
            assert!(entries
                .borrow()
                .contains_key(&MapKey(Value::Str("k".into()))));
        } else {
            panic!("expected map");
        }
        assert!(matches!(get(&root, &path), Some(Value::Number(n)) if n == 42.0));
    }

    #[test]
    fn delete_is_noop_for_missing_path() {
        let root = Value::object();
        delete(&root, &Path::from_segments(["nope"])).unwrap();
        if let Value::Object(fields) = &root {
            assert!(fields.borrow().is_empty());
        }
    }

    #[test]
    fn path_is_within_and_relative_to() {
        let base = Path::from_segments(["a", "b"]);
        let nested = Path::from_segments(["a", "b", "c"]);
        assert!(nested.is_within(&base));
        assert_eq!(nested.relative_to(&base), Path::from_segments(["c"]));
        assert!(!base.is_within(&nested));
    }

    proptest::proptest! {
        #[test]
        fn set_then_get_round_trips_any_numeric_string_path(
            seg0 in "[a-z]{1,4}",
            idx in 0u32..20,
        ) {
            let root = Value::object();
            let path = Path::from_segments([seg0.clone(), idx.to_string()]);
            set(&root, &path, Value::Number(7.0)).unwrap();
            let got = get(&root, &path);
            prop_assert!(matches!(got, Some(Value::Number(n)) if n == 7.0));
            prop_assert!(matches!(get(&root, &Path::from_segments([seg0])), Some(Value::Array(_))));
        }
    }
}
