//! Forward-reference fix-up.
//!
//! Some payload graphs hold maps keyed by a sibling object that is decoded
//! elsewhere in the same graph. On the wire such a map is keyed by the
//! sibling's name ([`NamedRefs`]). After the raw decode, the aggregate that
//! owns both the map and the sibling collection ([`Arena`]) resolves the
//! names into [`Handle`]s, producing a [`RefMap`]. Encoding runs the same
//! mapping in reverse.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use super::CodecError;

/// An object addressable by a name unique within its arena.
pub trait Keyed {
    fn key(&self) -> &str;
}

/// Index of an object inside an [`Arena`].
pub struct Handle<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: usize) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.index)
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Insertion-ordered collection of keyed objects.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    items: Vec<T>,
    by_key: HashMap<String, usize>,
}

impl<T: Keyed> Arena<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    pub fn from_items(items: impl IntoIterator<Item = T>) -> Result<Self, CodecError> {
        let mut arena = Self::new();
        for item in items {
            arena.insert(item)?;
        }
        Ok(arena)
    }

    /// Add an object. Names must be unique.
    pub fn insert(&mut self, item: T) -> Result<Handle<T>, CodecError> {
        let key = item.key().to_string();
        if self.by_key.contains_key(&key) {
            return Err(CodecError::DuplicateKey(key));
        }
        let index = self.items.len();
        self.by_key.insert(key, index);
        self.items.push(item);
        Ok(Handle::new(index))
    }

    pub fn handle_of(&self, key: &str) -> Option<Handle<T>> {
        self.by_key.get(key).copied().map(Handle::new)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.items.get(handle.index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Handle::new(i), item))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Keyed> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Name-keyed (raw) and handle-keyed (resolved) maps
// ---------------------------------------------------------------------------

/// Raw decoded form of a reference map: sibling name -> value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamedRefs<V>(pub BTreeMap<String, V>);

impl<V> NamedRefs<V> {
    /// Fix-up pass: rewrite every name into a handle from `arena`.
    pub fn resolve<T: Keyed>(self, arena: &Arena<T>) -> Result<RefMap<T, V>, CodecError> {
        let mut resolved = RefMap::new();
        for (name, value) in self.0 {
            let handle = arena
                .handle_of(&name)
                .ok_or(CodecError::UnresolvedReference(name))?;
            resolved.insert(handle, value);
        }
        Ok(resolved)
    }
}

/// Reference map keyed by sibling objects living in an [`Arena`].
#[derive(Debug, Clone)]
pub struct RefMap<T, V> {
    entries: Vec<(Handle<T>, V)>,
}

impl<T, V> RefMap<T, V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert or replace the value bound to `handle`.
    pub fn insert(&mut self, handle: Handle<T>, value: V) {
        match self.entries.iter_mut().find(|(h, _)| *h == handle) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((handle, value)),
        }
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&V> {
        self.entries
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &V)> {
        self.entries.iter().map(|(h, v)| (*h, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Keyed, V> RefMap<T, V> {
    /// Pair every entry with the object it refers to.
    pub fn resolved<'a>(
        &'a self,
        arena: &'a Arena<T>,
    ) -> impl Iterator<Item = (&'a T, &'a V)> + 'a {
        self.entries
            .iter()
            .filter_map(move |(h, v)| arena.get(*h).map(|item| (item, v)))
    }
}

impl<T: Keyed, V: Clone> RefMap<T, V> {
    /// Inverse of [`NamedRefs::resolve`], used when encoding the owner.
    pub fn to_named(&self, arena: &Arena<T>) -> Result<NamedRefs<V>, CodecError> {
        let mut named = BTreeMap::new();
        for (handle, value) in &self.entries {
            let item = arena
                .get(*handle)
                .ok_or_else(|| CodecError::UnresolvedReference(format!("{handle:?}")))?;
            named.insert(item.key().to_string(), value.clone());
        }
        Ok(NamedRefs(named))
    }
}

impl<T, V> Default for RefMap<T, V> {
    fn default() -> Self {
        Self::new()
    }
}
