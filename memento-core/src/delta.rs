/*!
Incremental write units and their algebra.

A [`Delta`] lists, per kind, the mementos to upsert and the ids to remove, plus
changes to the application roots. Applying a delta is idempotent (upserts are
full-record replacements, removals are unconditional) and two deltas can be
merged into one with the same effect as applying them in order.
*/

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::aggregate::MementoAggregate;
use crate::memento::{Memento, MementoKind};
use crate::Result;

/// Changes to a memento graph since the previous write.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Delta {
    #[serde(default)]
    upserts: BTreeMap<MementoKind, BTreeMap<String, Memento>>,
    #[serde(default)]
    removals: BTreeMap<MementoKind, BTreeSet<String>>,
    #[serde(default)]
    added_application_ids: Vec<String>,
    #[serde(default)]
    removed_application_ids: BTreeSet<String>,
}

impl Delta {
    pub fn builder() -> DeltaBuilder {
        DeltaBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty()
            && self.removals.is_empty()
            && self.added_application_ids.is_empty()
            && self.removed_application_ids.is_empty()
    }

    /// Upserted mementos of one kind, ordered by id.
    pub fn upserts(&self, kind: MementoKind) -> impl Iterator<Item = &Memento> {
        self.upserts
            .get(&kind)
            .into_iter()
            .flat_map(|by_id| by_id.values())
    }

    /// Every upserted memento.
    pub fn all_upserts(&self) -> impl Iterator<Item = &Memento> {
        self.upserts.values().flat_map(|by_id| by_id.values())
    }

    /// Removed ids of one kind.
    pub fn removals(&self, kind: MementoKind) -> impl Iterator<Item = &str> {
        self.removals
            .get(&kind)
            .into_iter()
            .flat_map(|ids| ids.iter().map(String::as_str))
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.values().map(BTreeMap::len).sum()
    }

    pub fn removal_count(&self) -> usize {
        self.removals.values().map(BTreeSet::len).sum()
    }

    pub fn added_application_ids(&self) -> &[String] {
        &self.added_application_ids
    }

    pub fn removed_application_ids(&self) -> &BTreeSet<String> {
        &self.removed_application_ids
    }

    /// Produce the aggregate that results from applying this delta.
    ///
    /// Upserts are overlaid first, then removals are deleted, so a removal wins
    /// over an upsert of the same id within one delta. Root ids are removed
    /// before added ones are appended.
    pub fn apply_to(&self, aggregate: &MementoAggregate) -> MementoAggregate {
        let (mut mementos, mut roots) = aggregate.clone().into_parts();

        for (kind, by_id) in &self.upserts {
            let existing = mementos.entry(*kind).or_default();
            for (id, memento) in by_id {
                existing.insert(id.clone(), memento.clone());
            }
        }
        for (kind, ids) in &self.removals {
            if let Some(existing) = mementos.get_mut(kind) {
                for id in ids {
                    existing.remove(id);
                }
            }
        }
        mementos.retain(|_, by_id| !by_id.is_empty());

        roots.retain(|id| !self.removed_application_ids.contains(id));
        for id in &self.added_application_ids {
            if !roots.contains(id) {
                roots.push(id.clone());
            }
        }

        MementoAggregate::from_parts(mementos, roots)
    }

    /// Fold a later delta into this one.
    ///
    /// `a.apply(d1).apply(d2)` equals `a.apply(d1.merge(d2))`: later upserts and
    /// removals of the same id win.
    pub fn merge(mut self, later: Delta) -> Delta {
        for (kind, by_id) in later.upserts {
            if let Some(removed) = self.removals.get_mut(&kind) {
                for id in by_id.keys() {
                    removed.remove(id);
                }
            }
            self.upserts.entry(kind).or_default().extend(by_id);
        }
        for (kind, ids) in later.removals {
            if let Some(upserted) = self.upserts.get_mut(&kind) {
                for id in &ids {
                    upserted.remove(id);
                }
            }
            self.removals.entry(kind).or_default().extend(ids);
        }
        self.upserts.retain(|_, by_id| !by_id.is_empty());
        self.removals.retain(|_, ids| !ids.is_empty());

        // An id re-added later stays in the removed set: apply drops it and
        // appends it again, which is where sequential application leaves it.
        self.added_application_ids
            .retain(|id| !later.removed_application_ids.contains(id));
        for id in later.added_application_ids {
            if !self.added_application_ids.contains(&id) {
                self.added_application_ids.push(id);
            }
        }
        self.removed_application_ids
            .extend(later.removed_application_ids);

        self
    }
}

impl MementoAggregate {
    /// Shorthand for [`Delta::apply_to`].
    pub fn apply(&self, delta: &Delta) -> MementoAggregate {
        delta.apply_to(self)
    }
}

/// Consuming builder for [`Delta`]. Within one builder, the last call for a
/// given kind and id wins.
#[derive(Debug, Default)]
pub struct DeltaBuilder {
    delta: Delta,
}

impl DeltaBuilder {
    pub fn upsert(mut self, memento: Memento) -> Self {
        let kind = memento.kind();
        if let Some(removed) = self.delta.removals.get_mut(&kind) {
            removed.remove(&memento.id);
        }
        self.delta
            .upserts
            .entry(kind)
            .or_default()
            .insert(memento.id.clone(), memento);
        self
    }

    /// Remove a memento. Removing an entity also removes it from the
    /// application roots.
    pub fn remove<S: Into<String>>(mut self, kind: MementoKind, id: S) -> Self {
        let id = id.into();
        if let Some(upserted) = self.delta.upserts.get_mut(&kind) {
            upserted.remove(&id);
        }
        if kind == MementoKind::Entity {
            self.delta.added_application_ids.retain(|root| *root != id);
            self.delta.removed_application_ids.insert(id.clone());
        }
        self.delta.removals.entry(kind).or_default().insert(id);
        self
    }

    pub fn add_application<S: Into<String>>(mut self, entity_id: S) -> Self {
        let id = entity_id.into();
        if !self.delta.added_application_ids.contains(&id) {
            self.delta.added_application_ids.push(id);
        }
        self
    }

    pub fn remove_application<S: Into<String>>(mut self, entity_id: S) -> Self {
        let id = entity_id.into();
        self.delta.added_application_ids.retain(|root| *root != id);
        self.delta.removed_application_ids.insert(id);
        self
    }

    pub fn build(mut self) -> Result<Delta> {
        for memento in self.delta.all_upserts() {
            memento.validate()?;
        }
        self.delta.upserts.retain(|_, by_id| !by_id.is_empty());
        self.delta.removals.retain(|_, ids| !ids.is_empty());
        Ok(self.delta)
    }
}
