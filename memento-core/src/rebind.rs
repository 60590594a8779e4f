/*!
Two-phase reconstruction of a live object graph from mementos.

Mementos reference each other by id and the graph may contain cycles
(a parent lists its children, each child names its parent). Rebind therefore
never builds an object from its neighbours. Instead:

1. [`Rebinder::skeletons`] creates one [`Skeleton`] per memento in an arena
   indexed by [`MementoRef`]. From then on every id in the aggregate resolves
   to an [`ObjectHandle`], hydrated or not.
2. [`SkeletonGraph::hydrate`] resolves each memento's references to handles
   and builds the object with the constructor registered for its type,
   upgrading the arena slot in place.

Problems local to one object (a dangling reference, an unknown type, a failing
constructor) are collected in a [`RebindReport`] rather than aborting the whole
rebind; [`RebindPolicy`] decides whether a non-empty report is an error.

# Example
```rust
use memento_core::{
    EntityRelations, Memento, MementoAggregate, Rebinder, TypeRegistry,
};

let aggregate = MementoAggregate::builder()
    .memento(
        Memento::entity("app", "BasicApplication")
            .with_relations(EntityRelations::default().with_child("web")),
    )
    .memento(
        Memento::entity("web", "WebServer")
            .with_relations(EntityRelations::default().with_parent("app")),
    )
    .application("app")
    .build()?;

let registry = TypeRegistry::new().with_fallback(|memento, _| Ok(memento.type_name.clone()));
let outcome = Rebinder::new(aggregate).skeletons()?.hydrate(&registry)?;

let app = outcome.graph.entity("app").unwrap();
let web = outcome.graph.resolve(&app.children()[0]).unwrap();
assert_eq!(web.object(), Some(&"WebServer".to_string()));
assert_eq!(web.parent(), Some(app.handle()));
# Ok::<(), memento_core::PersistError>(())
```
*/

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregate::MementoAggregate;
use crate::lookup::{HandleOrigin, LookupContext, ObjectHandle};
use crate::memento::{relation, Memento, MementoKind, MementoRef};
use crate::{PersistError, Result};

/// Whether per-object problems fail the rebind.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RebindPolicy {
    /// Any reported problem fails the rebind
    Strict,
    /// Problems are reported next to the (partially degraded) graph
    #[default]
    Lenient,
}

/// What went wrong with one object.
#[derive(Debug, Clone, PartialEq)]
pub enum RebindProblem {
    /// A reference resolved neither in the graph nor externally; the object is
    /// hydrated without that link
    UnresolvedReference { relation: String, target: MementoRef },
    /// No constructor for the type; the object stays a skeleton
    UnknownType(String),
    /// The constructor returned an error; the object stays a skeleton
    ConstructionFailed(String),
}

/// A problem attributed to one object.
#[derive(Debug, Clone, PartialEq)]
pub struct RebindIssue {
    pub object: MementoRef,
    pub problem: RebindProblem,
}

impl fmt::Display for RebindIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.problem {
            RebindProblem::UnresolvedReference { relation, target } => {
                write!(f, "{} has unresolved {relation} reference to {target}", self.object)
            }
            RebindProblem::UnknownType(type_name) => {
                write!(f, "{} has unknown type '{type_name}'", self.object)
            }
            RebindProblem::ConstructionFailed(message) => {
                write!(f, "{} could not be constructed: {message}", self.object)
            }
        }
    }
}

/// Issues found during a rebind
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RebindReport {
    issues: Vec<RebindIssue>,
}

impl RebindReport {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn issues(&self) -> &[RebindIssue] {
        &self.issues
    }

    pub fn push(&mut self, object: MementoRef, problem: RebindProblem) {
        self.issues.push(RebindIssue { object, problem });
    }

    /// Issues about `object`.
    pub fn issues_for<'a>(&'a self, object: &'a MementoRef) -> impl Iterator<Item = &'a RebindIssue> {
        self.issues.iter().filter(move |issue| issue.object == *object)
    }

    pub fn has_unresolved(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| matches!(issue.problem, RebindProblem::UnresolvedReference { .. }))
    }

    /// Every referenced id that could not be resolved.
    pub fn missing(&self) -> BTreeSet<&MementoRef> {
        self.issues
            .iter()
            .filter_map(|issue| match &issue.problem {
                RebindProblem::UnresolvedReference { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for RebindReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.issues.is_empty() {
            return write!(f, "no issues");
        }
        write!(f, "{} issue(s): ", self.issues.len())?;
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

/// Builds a live object from its memento.
pub type Constructor<T> =
    Box<dyn Fn(&Memento, &dyn LookupContext) -> Result<T> + Send + Sync>;

/// Constructors keyed by memento type name
///
/// The core never interprets type names; the caller registers one constructor
/// per type it knows, plus an optional fallback for the rest.
pub struct TypeRegistry<T> {
    constructors: HashMap<String, Constructor<T>>,
    fallback: Option<Constructor<T>>,
}

impl<T> TypeRegistry<T> {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            fallback: None,
        }
    }

    pub fn register<S, F>(mut self, type_name: S, constructor: F) -> Self
    where
        S: Into<String>,
        F: Fn(&Memento, &dyn LookupContext) -> Result<T> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_name.into(), Box::new(constructor));
        self
    }

    pub fn with_fallback<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&Memento, &dyn LookupContext) -> Result<T> + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(constructor));
        self
    }

    /// Whether `type_name` can be constructed, directly or by the fallback.
    pub fn knows(&self, type_name: &str) -> bool {
        self.fallback.is_some() || self.constructors.contains_key(type_name)
    }

    fn constructor_for(&self, type_name: &str) -> Option<&Constructor<T>> {
        self.constructors
            .get(type_name)
            .or(self.fallback.as_ref())
    }
}

impl<T> Default for TypeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TypeRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("TypeRegistry")
            .field("types", &types)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// A resolved outgoing reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub relation: String,
    pub target: ObjectHandle,
}

/// Identity of an object before hydration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skeleton {
    handle: ObjectHandle,
    type_name: String,
}

/// One arena slot of a rebuilt graph.
#[derive(Debug)]
pub enum LiveObject<T> {
    Skeleton(Skeleton),
    Hydrated {
        skeleton: Skeleton,
        object: T,
        links: Vec<Link>,
    },
}

impl<T> LiveObject<T> {
    fn skeleton(&self) -> &Skeleton {
        match self {
            LiveObject::Skeleton(skeleton) => skeleton,
            LiveObject::Hydrated { skeleton, .. } => skeleton,
        }
    }

    /// Handle naming this object
    pub fn handle(&self) -> &ObjectHandle {
        &self.skeleton().handle
    }

    pub fn reference(&self) -> &MementoRef {
        self.handle().reference()
    }

    pub fn type_name(&self) -> &str {
        &self.skeleton().type_name
    }

    pub fn is_hydrated(&self) -> bool {
        matches!(self, LiveObject::Hydrated { .. })
    }

    pub fn object(&self) -> Option<&T> {
        match self {
            LiveObject::Hydrated { object, .. } => Some(object),
            LiveObject::Skeleton(_) => None,
        }
    }

    /// Resolved references, relations first and then config values, in
    /// memento order. Empty for a skeleton.
    pub fn links(&self) -> &[Link] {
        match self {
            LiveObject::Hydrated { links, .. } => links,
            LiveObject::Skeleton(_) => &[],
        }
    }

    /// Targets of one relation, in order.
    pub fn related<'a>(&'a self, relation: &'a str) -> impl Iterator<Item = &'a ObjectHandle> {
        self.links()
            .iter()
            .filter(move |link| link.relation == relation)
            .map(|link| &link.target)
    }

    pub fn parent(&self) -> Option<&ObjectHandle> {
        self.related(relation::PARENT).next()
    }

    pub fn children(&self) -> Vec<&ObjectHandle> {
        self.related(relation::CHILDREN).collect()
    }
}

/// Entry point of a rebind
///
/// Consumed by [`Rebinder::skeletons`]; the returned [`SkeletonGraph`] is in
/// turn consumed by [`SkeletonGraph::hydrate`].
pub struct Rebinder<'a> {
    aggregate: MementoAggregate,
    policy: RebindPolicy,
    external: Option<&'a dyn LookupContext>,
}

impl<'a> Rebinder<'a> {
    pub fn new(aggregate: MementoAggregate) -> Self {
        Self {
            aggregate,
            policy: RebindPolicy::default(),
            external: None,
        }
    }

    pub fn with_policy(mut self, policy: RebindPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resolve ids outside the aggregate through `lookup`.
    pub fn with_external_lookup(mut self, lookup: &'a dyn LookupContext) -> Self {
        self.external = Some(lookup);
        self
    }

    /// Phase one: one skeleton per memento
    ///
    /// # Errors
    /// * `PersistError::UnresolvedReference` - If an application root has no
    ///   entity memento, whatever the policy
    pub fn skeletons(self) -> Result<SkeletonGraph<'a>> {
        let mut report = RebindReport::default();
        for root in self.aggregate.application_ids() {
            if self.aggregate.entity(root).is_none() {
                report.push(
                    MementoRef::entity(root.clone()),
                    RebindProblem::UnresolvedReference {
                        relation: "application".to_string(),
                        target: MementoRef::entity(root.clone()),
                    },
                );
            }
        }
        if !report.is_empty() {
            return Err(PersistError::UnresolvedReference(report));
        }

        let mut skeletons = Vec::with_capacity(self.aggregate.len());
        let mut index = HashMap::with_capacity(self.aggregate.len());
        for memento in self.aggregate.iter() {
            let slot = skeletons.len();
            let reference = memento.reference();
            index.insert(reference.clone(), slot);
            skeletons.push(Skeleton {
                handle: ObjectHandle::new(reference, HandleOrigin::Arena(slot)),
                type_name: memento.type_name.clone(),
            });
        }
        debug!(skeletons = skeletons.len(), "Created rebind skeletons");

        Ok(SkeletonGraph {
            aggregate: self.aggregate,
            policy: self.policy,
            external: self.external,
            skeletons,
            index,
        })
    }

    /// Both phases in one call.
    pub fn rebind<T>(self, registry: &TypeRegistry<T>) -> Result<RebindOutcome<T>> {
        self.skeletons()?.hydrate(registry)
    }
}

/// Output of the skeleton phase
///
/// Resolves every id of the aggregate, and ids outside it through the external
/// lookup if one was given.
pub struct SkeletonGraph<'a> {
    aggregate: MementoAggregate,
    policy: RebindPolicy,
    external: Option<&'a dyn LookupContext>,
    skeletons: Vec<Skeleton>,
    index: HashMap<MementoRef, usize>,
}

impl<'a> SkeletonGraph<'a> {
    pub fn len(&self) -> usize {
        self.skeletons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skeletons.is_empty()
    }

    pub fn skeletons(&self) -> &[Skeleton] {
        &self.skeletons
    }

    /// Phase two: build every object with its registered constructor
    ///
    /// # Errors
    /// Only under [`RebindPolicy::Strict`] with a non-empty report:
    /// * `PersistError::UnresolvedReference` - If any reference is unresolved
    /// * `PersistError::InvalidState` - If only types or constructors failed
    pub fn hydrate<T>(self, registry: &TypeRegistry<T>) -> Result<RebindOutcome<T>> {
        let mut objects: Vec<LiveObject<T>> = self
            .skeletons
            .iter()
            .cloned()
            .map(LiveObject::Skeleton)
            .collect();
        let mut report = RebindReport::default();
        let lookup: &dyn LookupContext = &self;

        for (slot, memento) in self.aggregate.iter().enumerate() {
            let reference = memento.reference();

            let mut links = Vec::new();
            for outgoing in memento.references() {
                match lookup.lookup(&outgoing.target) {
                    Some(target) => links.push(Link {
                        relation: outgoing.relation,
                        target,
                    }),
                    None => report.push(
                        reference.clone(),
                        RebindProblem::UnresolvedReference {
                            relation: outgoing.relation,
                            target: outgoing.target,
                        },
                    ),
                }
            }

            let Some(constructor) = registry.constructor_for(&memento.type_name) else {
                report.push(reference, RebindProblem::UnknownType(memento.type_name.clone()));
                continue;
            };
            match constructor(memento, lookup) {
                Ok(object) => {
                    let skeleton = self.skeletons[slot].clone();
                    objects[slot] = LiveObject::Hydrated {
                        skeleton,
                        object,
                        links,
                    };
                }
                Err(e) => report.push(reference, RebindProblem::ConstructionFailed(e.to_string())),
            }
        }

        if self.policy == RebindPolicy::Strict && !report.is_empty() {
            return Err(if report.has_unresolved() {
                PersistError::UnresolvedReference(report)
            } else {
                PersistError::invalid_state(format!("rebind failed: {report}"))
            });
        }
        for issue in report.issues() {
            warn!(issue = %issue, "Rebind degraded an object");
        }

        let graph = RebuiltGraph {
            objects,
            index: self.index,
            application_ids: self.aggregate.application_ids().to_vec(),
        };
        debug!(
            objects = graph.len(),
            hydrated = graph.hydrated_count(),
            issues = report.len(),
            "Rebind complete"
        );
        Ok(RebindOutcome { graph, report })
    }
}

impl LookupContext for SkeletonGraph<'_> {
    fn lookup(&self, reference: &MementoRef) -> Option<ObjectHandle> {
        match self.index.get(reference) {
            Some(slot) => Some(self.skeletons[*slot].handle.clone()),
            None => self.external.and_then(|external| external.lookup(reference)),
        }
    }
}

/// Rebuilt graph plus the issues met on the way.
#[derive(Debug)]
pub struct RebindOutcome<T> {
    pub graph: RebuiltGraph<T>,
    pub report: RebindReport,
}

/// Arena of live objects keyed by [`MementoRef`]
#[derive(Debug)]
pub struct RebuiltGraph<T> {
    objects: Vec<LiveObject<T>>,
    index: HashMap<MementoRef, usize>,
    application_ids: Vec<String>,
}

impl<T> RebuiltGraph<T> {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn hydrated_count(&self) -> usize {
        self.objects.iter().filter(|o| o.is_hydrated()).count()
    }

    pub fn get(&self, reference: &MementoRef) -> Option<&LiveObject<T>> {
        self.index.get(reference).map(|slot| &self.objects[*slot])
    }

    pub fn get_mut(&mut self, reference: &MementoRef) -> Option<&mut LiveObject<T>> {
        let slot = *self.index.get(reference)?;
        self.objects.get_mut(slot)
    }

    pub fn entity(&self, id: &str) -> Option<&LiveObject<T>> {
        self.get(&MementoRef::entity(id))
    }

    pub fn location(&self, id: &str) -> Option<&LiveObject<T>> {
        self.get(&MementoRef::location(id))
    }

    /// Follow a handle into this graph. Handles from elsewhere resolve by
    /// reference, so placeholders and external objects yield `None`.
    pub fn resolve(&self, handle: &ObjectHandle) -> Option<&LiveObject<T>> {
        match handle.slot() {
            Some(slot) => self
                .objects
                .get(slot)
                .filter(|object| object.reference() == handle.reference()),
            None => self.get(handle.reference()),
        }
    }

    /// Application root entities, in order.
    pub fn applications(&self) -> impl Iterator<Item = &LiveObject<T>> {
        self.application_ids
            .iter()
            .filter_map(|id| self.entity(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &LiveObject<T>> {
        self.objects.iter()
    }

    /// Objects of one kind, ordered by id.
    pub fn objects_of(&self, kind: MementoKind) -> impl Iterator<Item = &LiveObject<T>> {
        self.objects
            .iter()
            .filter(move |object| object.reference().kind == kind)
    }
}

impl<T> LookupContext for RebuiltGraph<T> {
    fn lookup(&self, reference: &MementoRef) -> Option<ObjectHandle> {
        self.get(reference).map(|object| object.handle().clone())
    }
}
