#![forbid(unsafe_code)]

//! Dynamic values stored in scope attributes and observed by watchers.
//!
//! [`Value`] is the engine's payload type: a small tree of primitives and
//! reference-shared containers. Containers (`List`, `Map`) are held behind
//! `Rc<RefCell<..>>`, so cloning a `Value` aliases the same container and
//! in-place mutation through one handle is visible through every other.
//! Both the attribute-inheritance rules and the identity equality mode
//! depend on that aliasing.
//!
//! Two equality relations are provided:
//!
//! - [`Value::identical`]: primitives by value (NaN equal to NaN), strings
//!   by contents, containers by pointer identity. Reassigning an attribute
//!   to a structurally equal but distinct container *is* a change here.
//! - `PartialEq` (structural): recursive contents comparison, still
//!   NaN-aware. Used by deep-equality watchers and convenient in tests.
//!
//! # Invariants
//!
//! 1. `identical(a, b)` implies `a == b`.
//! 2. `deep_copy` produces a structurally equal value sharing no container
//!    with the source.
//! 3. `shallow_copy` produces a fresh top-level container whose elements
//!    still alias the source's elements.
//! 4. NaN compares equal to NaN under both relations; standard float
//!    comparison never sees the sentinel path.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;

/// Shared list container.
pub type ListRef = Rc<RefCell<Vec<Value>>>;

/// Shared map container.
pub type MapRef = Rc<RefCell<AHashMap<String, Value>>>;

/// A dynamic value held in a scope attribute.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// Absent or explicitly cleared.
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    /// Ordered container, shared by reference.
    List(ListRef),
    /// Keyed container, shared by reference.
    Map(MapRef),
}

/// NaN-aware float comparison.
fn num_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

impl Value {
    /// Build a list value from an iterator of elements.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Self::List(Rc::new(RefCell::new(items.into_iter().collect())))
    }

    /// Build an empty map value.
    #[must_use]
    pub fn map() -> Self {
        Self::Map(Rc::new(RefCell::new(AHashMap::new())))
    }

    /// Build a map value from key/value pairs.
    pub fn map_from<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Map(Rc::new(RefCell::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    /// Whether this value is `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The boolean payload, if any.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The numeric payload, if any.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The string payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Element count for containers, `None` for primitives.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::List(items) => Some(items.borrow().len()),
            Self::Map(entries) => Some(entries.borrow().len()),
            _ => None,
        }
    }

    /// Whether this is a container with no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Element at `idx` of a list, cloned (container elements stay shared).
    #[must_use]
    pub fn item(&self, idx: usize) -> Option<Value> {
        match self {
            Self::List(items) => items.borrow().get(idx).cloned(),
            _ => None,
        }
    }

    /// Overwrite the element at `idx` of a list in place.
    ///
    /// Returns `false` when the value is not a list or `idx` is out of range.
    pub fn set_item(&self, idx: usize, value: Value) -> bool {
        match self {
            Self::List(items) => {
                let mut items = items.borrow_mut();
                match items.get_mut(idx) {
                    Some(slot) => {
                        *slot = value;
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// Append an element to a list in place.
    pub fn push(&self, value: Value) -> bool {
        match self {
            Self::List(items) => {
                items.borrow_mut().push(value);
                true
            }
            _ => false,
        }
    }

    /// Remove and return the last element of a list.
    pub fn pop(&self) -> Option<Value> {
        match self {
            Self::List(items) => items.borrow_mut().pop(),
            _ => None,
        }
    }

    /// Value under `key` in a map, cloned (container values stay shared).
    #[must_use]
    pub fn key(&self, key: &str) -> Option<Value> {
        match self {
            Self::Map(entries) => entries.borrow().get(key).cloned(),
            _ => None,
        }
    }

    /// Insert or overwrite `key` in a map in place.
    pub fn set_key(&self, key: impl Into<String>, value: Value) -> bool {
        match self {
            Self::Map(entries) => {
                entries.borrow_mut().insert(key.into(), value);
                true
            }
            _ => false,
        }
    }

    /// Remove `key` from a map in place.
    pub fn remove_key(&self, key: &str) -> Option<Value> {
        match self {
            Self::Map(entries) => entries.borrow_mut().remove(key),
            _ => None,
        }
    }

    /// Identity equality: primitives by value (NaN-aware), strings by
    /// contents, containers by pointer.
    #[must_use]
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => num_eq(*a, *b),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b),
            (Self::Map(a), Self::Map(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Recursive copy into fresh containers. Mutating the copy never
    /// affects the source and vice versa.
    #[must_use]
    pub fn deep_copy(&self) -> Value {
        match self {
            Self::List(items) => {
                let copied: Vec<Value> = items.borrow().iter().map(Value::deep_copy).collect();
                Self::List(Rc::new(RefCell::new(copied)))
            }
            Self::Map(entries) => {
                let copied: AHashMap<String, Value> = entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect();
                Self::Map(Rc::new(RefCell::new(copied)))
            }
            other => other.clone(),
        }
    }

    /// Fresh top-level container whose elements still alias the source's.
    /// Primitives copy as-is.
    #[must_use]
    pub fn shallow_copy(&self) -> Value {
        match self {
            Self::List(items) => Self::List(Rc::new(RefCell::new(items.borrow().clone()))),
            Self::Map(entries) => Self::Map(Rc::new(RefCell::new(entries.borrow().clone()))),
            other => other.clone(),
        }
    }
}

impl PartialEq for Value {
    /// Structural equality: recursive contents comparison, NaN-aware.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => num_eq(*a, *b),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
            }
            (Self::Map(a), Self::Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|other| v == other))
            }
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}
