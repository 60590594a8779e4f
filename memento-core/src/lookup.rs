/*!
Lookup contexts used while rebinding.

A [`LookupContext`] resolves a [`MementoRef`] to an [`ObjectHandle`]: a cheap,
copyable name for a live object that may not be hydrated yet. Handles never own
the object they name, which is what lets a cyclic graph be rebuilt in two
phases.
*/

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;

use crate::memento::{MementoKind, MementoRef};

/// Where the object behind a handle lives.
#[derive(Debug, Clone, Copy)]
pub enum HandleOrigin {
    /// Slot in a rebuilt graph's arena
    Arena(usize),
    /// Inert stand-in shared by every reference of one kind
    Placeholder(&'static Placeholder),
    /// Object owned by the caller outside the persisted graph
    External,
}

/// Non-owning handle on a live object. Two handles are equal when they name
/// the same memento, whatever their origin.
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    reference: MementoRef,
    origin: HandleOrigin,
}

impl ObjectHandle {
    pub fn new(reference: MementoRef, origin: HandleOrigin) -> Self {
        Self { reference, origin }
    }

    pub fn reference(&self) -> &MementoRef {
        &self.reference
    }

    pub fn kind(&self) -> MementoKind {
        self.reference.kind
    }

    pub fn id(&self) -> &str {
        &self.reference.id
    }

    pub fn origin(&self) -> HandleOrigin {
        self.origin
    }

    /// Arena slot, when the handle points into a rebuilt graph.
    pub fn slot(&self) -> Option<usize> {
        match self.origin {
            HandleOrigin::Arena(slot) => Some(slot),
            _ => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.origin, HandleOrigin::Placeholder(_))
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl Eq for ObjectHandle {}

impl Hash for ObjectHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.reference.hash(state);
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.reference.fmt(f)
    }
}

/// Resolves identifiers to live objects during rebind
pub trait LookupContext {
    fn lookup(&self, reference: &MementoRef) -> Option<ObjectHandle>;

    fn lookup_entity(&self, id: &str) -> Option<ObjectHandle> {
        self.lookup(&MementoRef::entity(id))
    }

    fn lookup_location(&self, id: &str) -> Option<ObjectHandle> {
        self.lookup(&MementoRef::location(id))
    }

    fn lookup_policy(&self, id: &str) -> Option<ObjectHandle> {
        self.lookup(&MementoRef::policy(id))
    }

    fn lookup_enricher(&self, id: &str) -> Option<ObjectHandle> {
        self.lookup(&MementoRef::enricher(id))
    }

    fn lookup_feed(&self, id: &str) -> Option<ObjectHandle> {
        self.lookup(&MementoRef::feed(id))
    }
}

/// Inert stand-in for an object of one kind.
#[derive(Debug, PartialEq, Eq)]
pub struct Placeholder {
    kind: MementoKind,
}

impl Placeholder {
    pub fn kind(&self) -> MementoKind {
        self.kind
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "placeholder {}", self.kind)
    }
}

static PLACEHOLDERS: Lazy<BTreeMap<MementoKind, Placeholder>> = Lazy::new(|| {
    MementoKind::ALL
        .iter()
        .map(|kind| (*kind, Placeholder { kind: *kind }))
        .collect()
});

static SHARED_PLACEHOLDERS: PlaceholderLookupContext = PlaceholderLookupContext;

/// Resolves every reference to the shared placeholder of its kind
///
/// Used when a graph has to be decoded without the live objects it refers to,
/// e.g. to check that a checkpoint reads back.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderLookupContext;

impl PlaceholderLookupContext {
    pub fn shared() -> &'static PlaceholderLookupContext {
        &SHARED_PLACEHOLDERS
    }

    pub fn placeholder(kind: MementoKind) -> Option<&'static Placeholder> {
        PLACEHOLDERS.get(&kind)
    }
}

impl LookupContext for PlaceholderLookupContext {
    fn lookup(&self, reference: &MementoRef) -> Option<ObjectHandle> {
        let placeholder = Self::placeholder(reference.kind)?;
        Some(ObjectHandle::new(
            reference.clone(),
            HandleOrigin::Placeholder(placeholder),
        ))
    }
}

/// Resolves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedLookupContext;

impl LookupContext for DetachedLookupContext {
    fn lookup(&self, _reference: &MementoRef) -> Option<ObjectHandle> {
        None
    }
}

/// Resolves a fixed set of objects the caller keeps alive outside the
/// persisted graph.
#[derive(Debug, Clone, Default)]
pub struct ExternalObjects {
    known: BTreeSet<MementoRef>,
}

impl ExternalObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reference: MementoRef) -> Self {
        self.known.insert(reference);
        self
    }

    pub fn insert(&mut self, reference: MementoRef) {
        self.known.insert(reference);
    }
}

impl LookupContext for ExternalObjects {
    fn lookup(&self, reference: &MementoRef) -> Option<ObjectHandle> {
        self.known
            .get(reference)
            .map(|known| ObjectHandle::new(known.clone(), HandleOrigin::External))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_are_shared_per_kind() {
        let context = PlaceholderLookupContext::shared();
        let first = context.lookup_entity("e1").unwrap();
        let second = context.lookup_entity("e2").unwrap();

        match (first.origin(), second.origin()) {
            (HandleOrigin::Placeholder(a), HandleOrigin::Placeholder(b)) => {
                assert!(std::ptr::eq(a, b));
                assert_eq!(a.kind(), MementoKind::Entity);
            }
            other => panic!("expected placeholders, got {other:?}"),
        }
        assert_ne!(first, second);
        assert!(context.lookup_feed("f1").unwrap().is_placeholder());
    }

    #[test]
    fn test_handles_compare_by_reference() {
        let arena = ObjectHandle::new(MementoRef::entity("e1"), HandleOrigin::Arena(3));
        let external = ObjectHandle::new(MementoRef::entity("e1"), HandleOrigin::External);
        assert_eq!(arena, external);
        assert_eq!(arena.slot(), Some(3));
        assert_eq!(external.slot(), None);
        assert_eq!(arena.to_string(), "entity 'e1'");
    }

    #[test]
    fn test_detached_and_external_contexts() {
        assert!(DetachedLookupContext.lookup_location("l1").is_none());

        let external = ExternalObjects::new().with(MementoRef::location("l1"));
        let handle = external.lookup_location("l1").unwrap();
        assert!(matches!(handle.origin(), HandleOrigin::External));
        assert!(external.lookup_location("l2").is_none());
    }
}
