/*!
The full-graph snapshot: every memento by kind and id, plus application roots.
*/

use std::collections::BTreeMap;

use serde::Serialize;

use crate::lookup::LookupContext;
use crate::memento::{Memento, MementoKind, MementoRef, OutgoingRef};
use crate::{PersistError, Result};

/// A reference that neither the aggregate nor the lookup context can resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    pub owner: MementoRef,
    pub relation: String,
    pub target: MementoRef,
}

/// Immutable snapshot of a whole memento graph.
///
/// Built once through [`AggregateBuilder`], which enforces that every
/// application root is an entity of the aggregate. Delta application returns a
/// new value rather than modifying this one.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct MementoAggregate {
    mementos: BTreeMap<MementoKind, BTreeMap<String, Memento>>,
    application_ids: Vec<String>,
}

impl MementoAggregate {
    pub fn builder() -> AggregateBuilder {
        AggregateBuilder::default()
    }

    /// The aggregate of a graph that was never checkpointed.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Assemble an aggregate without checking roots. Used by delta
    /// application, where roots are maintained by the delta itself.
    pub(crate) fn from_parts(
        mementos: BTreeMap<MementoKind, BTreeMap<String, Memento>>,
        application_ids: Vec<String>,
    ) -> Self {
        Self {
            mementos,
            application_ids,
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (BTreeMap<MementoKind, BTreeMap<String, Memento>>, Vec<String>) {
        (self.mementos, self.application_ids)
    }

    pub fn get(&self, kind: MementoKind, id: &str) -> Option<&Memento> {
        self.mementos.get(&kind).and_then(|by_id| by_id.get(id))
    }

    pub fn get_ref(&self, reference: &MementoRef) -> Option<&Memento> {
        self.get(reference.kind, &reference.id)
    }

    pub fn entity(&self, id: &str) -> Option<&Memento> {
        self.get(MementoKind::Entity, id)
    }

    pub fn location(&self, id: &str) -> Option<&Memento> {
        self.get(MementoKind::Location, id)
    }

    pub fn contains(&self, reference: &MementoRef) -> bool {
        self.get_ref(reference).is_some()
    }

    /// Mementos of one kind, ordered by id.
    pub fn mementos(&self, kind: MementoKind) -> impl Iterator<Item = &Memento> {
        self.mementos
            .get(&kind)
            .into_iter()
            .flat_map(|by_id| by_id.values())
    }

    /// Every memento, grouped by kind and ordered by id within a kind.
    pub fn iter(&self) -> impl Iterator<Item = &Memento> {
        self.mementos.values().flat_map(|by_id| by_id.values())
    }

    pub fn count(&self, kind: MementoKind) -> usize {
        self.mementos.get(&kind).map_or(0, BTreeMap::len)
    }

    pub fn len(&self) -> usize {
        self.mementos.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-level application entity ids, in registration order.
    pub fn application_ids(&self) -> &[String] {
        &self.application_ids
    }

    /// Application roots that are not entities of this aggregate.
    pub fn missing_application_roots(&self) -> Vec<&str> {
        missing_roots(&self.mementos, &self.application_ids)
    }

    /// Fail with `InvalidState` unless every application root is an entity.
    pub fn check_application_roots(&self) -> Result<()> {
        match self.missing_application_roots().as_slice() {
            [] => Ok(()),
            missing => Err(PersistError::invalid_state(format!(
                "application root(s) {} not entities of the aggregate",
                missing
                    .iter()
                    .map(|id| format!("'{id}'"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Drop application roots with no entity, returning the dropped ids.
    pub fn drop_missing_application_roots(&mut self) -> Vec<String> {
        let missing: Vec<String> = self
            .missing_application_roots()
            .into_iter()
            .map(str::to_string)
            .collect();
        self.application_ids.retain(|id| !missing.contains(id));
        missing
    }

    /// References that point neither into this aggregate nor at anything the
    /// lookup context knows about.
    pub fn dangling_references(&self, lookup: &dyn LookupContext) -> Vec<DanglingReference> {
        let mut dangling = Vec::new();
        for memento in self.iter() {
            for OutgoingRef { relation, target } in memento.references() {
                if self.contains(&target) || lookup.lookup(&target).is_some() {
                    continue;
                }
                dangling.push(DanglingReference {
                    owner: memento.reference(),
                    relation,
                    target,
                });
            }
        }
        dangling
    }
}

/// Consuming builder for [`MementoAggregate`].
#[derive(Debug, Default)]
pub struct AggregateBuilder {
    mementos: BTreeMap<MementoKind, BTreeMap<String, Memento>>,
    application_ids: Vec<String>,
}

impl AggregateBuilder {
    /// Add a memento, replacing any earlier one with the same kind and id.
    pub fn memento(mut self, memento: Memento) -> Self {
        self.mementos
            .entry(memento.kind())
            .or_default()
            .insert(memento.id.clone(), memento);
        self
    }

    pub fn mementos<I: IntoIterator<Item = Memento>>(self, mementos: I) -> Self {
        mementos.into_iter().fold(self, Self::memento)
    }

    /// Register a top-level application entity.
    pub fn application<S: Into<String>>(mut self, entity_id: S) -> Self {
        let id = entity_id.into();
        if !self.application_ids.contains(&id) {
            self.application_ids.push(id);
        }
        self
    }

    pub fn build(self) -> Result<MementoAggregate> {
        for memento in self.mementos.values().flat_map(BTreeMap::values) {
            memento.validate()?;
        }

        if let Some(missing) = missing_roots(&self.mementos, &self.application_ids).first() {
            return Err(PersistError::invalid_state(format!(
                "application root '{missing}' is not an entity of the aggregate"
            )));
        }

        Ok(MementoAggregate {
            mementos: self.mementos,
            application_ids: self.application_ids,
        })
    }
}

fn missing_roots<'a>(
    mementos: &BTreeMap<MementoKind, BTreeMap<String, Memento>>,
    application_ids: &'a [String],
) -> Vec<&'a str> {
    let entities = mementos.get(&MementoKind::Entity);
    application_ids
        .iter()
        .filter(|id| !entities.is_some_and(|by_id| by_id.contains_key(id.as_str())))
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{DetachedLookupContext, PlaceholderLookupContext};
    use crate::memento::EntityRelations;

    fn sample() -> MementoAggregate {
        MementoAggregate::builder()
            .memento(
                Memento::entity("app", "BasicApplication")
                    .with_relations(EntityRelations::default().with_child("e1")),
            )
            .memento(
                Memento::entity("e1", "VanillaSoftwareProcess").with_relations(
                    EntityRelations::default()
                        .with_parent("app")
                        .with_location("l1")
                        .with_location("l-missing"),
                ),
            )
            .memento(Memento::location("l1", "LocalhostMachineProvisioningLocation"))
            .application("app")
            .build()
            .unwrap()
    }

    #[test]
    fn test_accessors() {
        let aggregate = sample();
        assert_eq!(aggregate.len(), 3);
        assert_eq!(aggregate.count(MementoKind::Entity), 2);
        assert_eq!(aggregate.count(MementoKind::Policy), 0);
        assert_eq!(aggregate.application_ids(), ["app".to_string()]);
        assert!(aggregate.location("l1").is_some());
        assert!(aggregate.entity("l1").is_none());
        let ids: Vec<_> = aggregate.mementos(MementoKind::Entity).map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["app", "e1"]);
    }

    #[test]
    fn test_root_must_be_entity() {
        let result = MementoAggregate::builder()
            .memento(Memento::location("l1", "Loc"))
            .application("l1")
            .build();
        assert!(matches!(result, Err(PersistError::InvalidState(_))));
    }

    #[test]
    fn test_duplicate_application_registered_once() {
        let aggregate = MementoAggregate::builder()
            .memento(Memento::entity("app", "App"))
            .application("app")
            .application("app")
            .build()
            .unwrap();
        assert_eq!(aggregate.application_ids().len(), 1);
    }

    #[test]
    fn test_dangling_references() {
        let aggregate = sample();

        let dangling = aggregate.dangling_references(&DetachedLookupContext);
        assert_eq!(
            dangling,
            vec![DanglingReference {
                owner: MementoRef::entity("e1"),
                relation: "locations".to_string(),
                target: MementoRef::location("l-missing"),
            }]
        );

        // Everything resolves against placeholders
        assert!(aggregate
            .dangling_references(PlaceholderLookupContext::shared())
            .is_empty());
    }

    #[test]
    fn test_roots_left_without_entity_are_detected() {
        let delta = crate::delta::Delta::builder()
            .add_application("ghost")
            .add_application("e1")
            .build()
            .unwrap();
        let mut applied = sample().apply(&delta);
        assert_eq!(applied.missing_application_roots(), vec!["ghost"]);
        assert!(matches!(
            applied.check_application_roots(),
            Err(PersistError::InvalidState(_))
        ));

        let dropped = applied.drop_missing_application_roots();
        assert_eq!(dropped, vec!["ghost".to_string()]);
        assert_eq!(applied.application_ids(), ["app".to_string(), "e1".to_string()]);
        applied.check_application_roots().unwrap();
    }

    #[test]
    fn test_empty_aggregate() {
        let aggregate = MementoAggregate::empty();
        assert!(aggregate.is_empty());
        assert!(aggregate.application_ids().is_empty());
        assert_eq!(aggregate.iter().count(), 0);
    }
}
