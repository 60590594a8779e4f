/*!
Memento data model.

A memento is a plain snapshot of one live object. It refers to other objects only
through [`MementoRef`]s (kind + id), never by embedding them, so a graph of
mementos is acyclic by construction even when the live graph it describes is not.
*/

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{PersistError, Result};

/// Relation names reported by [`Memento::references`].
pub mod relation {
    pub const PARENT: &str = "parent";
    pub const CHILDREN: &str = "children";
    pub const LOCATIONS: &str = "locations";
    pub const POLICIES: &str = "policies";
    pub const ENRICHERS: &str = "enrichers";
    pub const FEEDS: &str = "feeds";
    pub const GROUPS: &str = "groups";
    pub const ENTITY: &str = "entity";
    /// Prefix of relations found inside config values (`config.<key>`).
    pub const CONFIG_PREFIX: &str = "config.";
}

/// Discriminator of the live object a memento describes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MementoKind {
    Entity,
    Location,
    Policy,
    Enricher,
    Feed,
}

impl MementoKind {
    /// Every kind, in persistence order.
    pub const ALL: [MementoKind; 5] = [
        MementoKind::Entity,
        MementoKind::Location,
        MementoKind::Policy,
        MementoKind::Enricher,
        MementoKind::Feed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MementoKind::Entity => "entity",
            MementoKind::Location => "location",
            MementoKind::Policy => "policy",
            MementoKind::Enricher => "enricher",
            MementoKind::Feed => "feed",
        }
    }

    /// Directory name used by file-based backends.
    pub fn plural(&self) -> &'static str {
        match self {
            MementoKind::Entity => "entities",
            MementoKind::Location => "locations",
            MementoKind::Policy => "policies",
            MementoKind::Enricher => "enrichers",
            MementoKind::Feed => "feeds",
        }
    }

    /// Parse a kind from either its singular or plural name.
    pub fn from_plural(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.plural() == name || kind.as_str() == name)
    }
}

impl fmt::Display for MementoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MementoKind {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_plural(&s.to_ascii_lowercase())
            .ok_or_else(|| PersistError::invalid_state(format!("unknown memento kind '{s}'")))
    }
}

/// Reference to a memento by kind and id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MementoRef {
    pub kind: MementoKind,
    pub id: String,
}

impl MementoRef {
    pub fn new<S: Into<String>>(kind: MementoKind, id: S) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn entity<S: Into<String>>(id: S) -> Self {
        Self::new(MementoKind::Entity, id)
    }

    pub fn location<S: Into<String>>(id: S) -> Self {
        Self::new(MementoKind::Location, id)
    }

    pub fn policy<S: Into<String>>(id: S) -> Self {
        Self::new(MementoKind::Policy, id)
    }

    pub fn enricher<S: Into<String>>(id: S) -> Self {
        Self::new(MementoKind::Enricher, id)
    }

    pub fn feed<S: Into<String>>(id: S) -> Self {
        Self::new(MementoKind::Feed, id)
    }
}

impl fmt::Display for MementoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.id)
    }
}

/// Value stored under a config key or field name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
    Reference(MementoRef),
}

impl ConfigValue {
    /// Collect every reference contained in this value, at any depth.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a MementoRef>) {
        match self {
            ConfigValue::Reference(target) => out.push(target),
            ConfigValue::List(items) => items.iter().for_each(|item| item.collect_references(out)),
            ConfigValue::Map(entries) => entries
                .values()
                .for_each(|value| value.collect_references(out)),
            _ => {}
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Float(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::String(value)
    }
}

impl From<MementoRef> for ConfigValue {
    fn from(value: MementoRef) -> Self {
        ConfigValue::Reference(value)
    }
}

impl<T: Into<ConfigValue>> From<Vec<T>> for ConfigValue {
    fn from(values: Vec<T>) -> Self {
        ConfigValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// Relations of an entity memento.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct EntityRelations {
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
    pub location_ids: Vec<String>,
    pub policy_ids: Vec<String>,
    pub enricher_ids: Vec<String>,
    pub feed_ids: Vec<String>,
    pub group_ids: Vec<String>,
}

impl EntityRelations {
    pub fn with_parent<S: Into<String>>(mut self, id: S) -> Self {
        self.parent_id = Some(id.into());
        self
    }

    pub fn with_child<S: Into<String>>(mut self, id: S) -> Self {
        self.child_ids.push(id.into());
        self
    }

    pub fn with_location<S: Into<String>>(mut self, id: S) -> Self {
        self.location_ids.push(id.into());
        self
    }

    pub fn with_policy<S: Into<String>>(mut self, id: S) -> Self {
        self.policy_ids.push(id.into());
        self
    }

    pub fn with_enricher<S: Into<String>>(mut self, id: S) -> Self {
        self.enricher_ids.push(id.into());
        self
    }

    pub fn with_feed<S: Into<String>>(mut self, id: S) -> Self {
        self.feed_ids.push(id.into());
        self
    }

    pub fn with_group<S: Into<String>>(mut self, id: S) -> Self {
        self.group_ids.push(id.into());
        self
    }
}

/// Relations of a location memento.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct LocationRelations {
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
}

impl LocationRelations {
    pub fn with_parent<S: Into<String>>(mut self, id: S) -> Self {
        self.parent_id = Some(id.into());
        self
    }

    pub fn with_child<S: Into<String>>(mut self, id: S) -> Self {
        self.child_ids.push(id.into());
        self
    }
}

/// Relations of a policy, enricher or feed: the owning entity, if attached.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AdjunctRelations {
    pub entity_id: Option<String>,
}

impl AdjunctRelations {
    pub fn owned_by<S: Into<String>>(entity_id: S) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
        }
    }
}

/// Kind-specific relations. The variant is the memento's kind.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Relations {
    Entity(EntityRelations),
    Location(LocationRelations),
    Policy(AdjunctRelations),
    Enricher(AdjunctRelations),
    Feed(AdjunctRelations),
}

impl Relations {
    pub fn kind(&self) -> MementoKind {
        match self {
            Relations::Entity(_) => MementoKind::Entity,
            Relations::Location(_) => MementoKind::Location,
            Relations::Policy(_) => MementoKind::Policy,
            Relations::Enricher(_) => MementoKind::Enricher,
            Relations::Feed(_) => MementoKind::Feed,
        }
    }

    /// Empty relations for the given kind.
    pub fn empty(kind: MementoKind) -> Self {
        match kind {
            MementoKind::Entity => Relations::Entity(EntityRelations::default()),
            MementoKind::Location => Relations::Location(LocationRelations::default()),
            MementoKind::Policy => Relations::Policy(AdjunctRelations::default()),
            MementoKind::Enricher => Relations::Enricher(AdjunctRelations::default()),
            MementoKind::Feed => Relations::Feed(AdjunctRelations::default()),
        }
    }

    fn push_references(&self, out: &mut Vec<OutgoingRef>) {
        fn push_all(out: &mut Vec<OutgoingRef>, relation: &str, kind: MementoKind, ids: &[String]) {
            out.extend(ids.iter().map(|id| OutgoingRef {
                relation: relation.to_string(),
                target: MementoRef::new(kind, id.clone()),
            }));
        }

        match self {
            Relations::Entity(rel) => {
                push_all(out, relation::PARENT, MementoKind::Entity, rel.parent_id.as_slice());
                push_all(out, relation::CHILDREN, MementoKind::Entity, &rel.child_ids);
                push_all(out, relation::LOCATIONS, MementoKind::Location, &rel.location_ids);
                push_all(out, relation::POLICIES, MementoKind::Policy, &rel.policy_ids);
                push_all(out, relation::ENRICHERS, MementoKind::Enricher, &rel.enricher_ids);
                push_all(out, relation::FEEDS, MementoKind::Feed, &rel.feed_ids);
                push_all(out, relation::GROUPS, MementoKind::Entity, &rel.group_ids);
            }
            Relations::Location(rel) => {
                push_all(out, relation::PARENT, MementoKind::Location, rel.parent_id.as_slice());
                push_all(out, relation::CHILDREN, MementoKind::Location, &rel.child_ids);
            }
            Relations::Policy(rel) | Relations::Enricher(rel) | Relations::Feed(rel) => {
                push_all(out, relation::ENTITY, MementoKind::Entity, rel.entity_id.as_slice());
            }
        }
    }
}

impl From<EntityRelations> for Relations {
    fn from(relations: EntityRelations) -> Self {
        Relations::Entity(relations)
    }
}

impl From<LocationRelations> for Relations {
    fn from(relations: LocationRelations) -> Self {
        Relations::Location(relations)
    }
}

/// A reference leaving a memento, with the relation it was found under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutgoingRef {
    pub relation: String,
    pub target: MementoRef,
}

/// Snapshot of one live object's state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Memento {
    /// Globally unique, immutable identifier of the live object
    pub id: String,

    /// Declared implementation type, resolved by the hydration layer
    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub config: BTreeMap<String, ConfigValue>,

    /// Last-known attribute values (sensor values for entities)
    #[serde(default)]
    pub fields: BTreeMap<String, ConfigValue>,

    pub relations: Relations,
}

impl Memento {
    /// Create a memento with the given relations; the kind follows from them.
    pub fn new<S1, S2, R>(id: S1, type_name: S2, relations: R) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        R: Into<Relations>,
    {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            display_name: None,
            tags: BTreeSet::new(),
            config: BTreeMap::new(),
            fields: BTreeMap::new(),
            relations: relations.into(),
        }
    }

    pub fn entity<S1: Into<String>, S2: Into<String>>(id: S1, type_name: S2) -> Self {
        Self::new(id, type_name, Relations::empty(MementoKind::Entity))
    }

    pub fn location<S1: Into<String>, S2: Into<String>>(id: S1, type_name: S2) -> Self {
        Self::new(id, type_name, Relations::empty(MementoKind::Location))
    }

    pub fn policy<S1: Into<String>, S2: Into<String>>(id: S1, type_name: S2) -> Self {
        Self::new(id, type_name, Relations::empty(MementoKind::Policy))
    }

    pub fn enricher<S1: Into<String>, S2: Into<String>>(id: S1, type_name: S2) -> Self {
        Self::new(id, type_name, Relations::empty(MementoKind::Enricher))
    }

    pub fn feed<S1: Into<String>, S2: Into<String>>(id: S1, type_name: S2) -> Self {
        Self::new(id, type_name, Relations::empty(MementoKind::Feed))
    }

    pub fn kind(&self) -> MementoKind {
        self.relations.kind()
    }

    pub fn reference(&self) -> MementoRef {
        MementoRef::new(self.kind(), self.id.clone())
    }

    pub fn with_display_name<S: Into<String>>(mut self, name: S) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_config<K: Into<String>, V: Into<ConfigValue>>(mut self, key: K, value: V) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_field<K: Into<String>, V: Into<ConfigValue>>(mut self, name: K, value: V) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Replace the relations. Adjunct kinds (policy, enricher, feed) take
    /// [`Relations`] directly since their relation shape is shared.
    pub fn with_relations<R: Into<Relations>>(mut self, relations: R) -> Self {
        self.relations = relations.into();
        self
    }

    /// Attach an adjunct (policy, enricher, feed) to its owning entity.
    ///
    /// Fails for entities and locations, which have no owner.
    pub fn owned_by<S: Into<String>>(mut self, entity_id: S) -> Result<Self> {
        match &mut self.relations {
            Relations::Policy(rel) | Relations::Enricher(rel) | Relations::Feed(rel) => {
                rel.entity_id = Some(entity_id.into());
                Ok(self)
            }
            other => Err(PersistError::invalid_state(format!(
                "{} '{}' cannot be owned by an entity",
                other.kind(),
                self.id
            ))),
        }
    }

    pub fn entity_relations(&self) -> Option<&EntityRelations> {
        match &self.relations {
            Relations::Entity(rel) => Some(rel),
            _ => None,
        }
    }

    pub fn location_relations(&self) -> Option<&LocationRelations> {
        match &self.relations {
            Relations::Location(rel) => Some(rel),
            _ => None,
        }
    }

    /// Every reference leaving this memento: relations first, then config
    /// entries in key order.
    pub fn references(&self) -> Vec<OutgoingRef> {
        let mut out = Vec::new();
        self.relations.push_references(&mut out);

        for (key, value) in &self.config {
            let mut targets = Vec::new();
            value.collect_references(&mut targets);
            out.extend(targets.into_iter().map(|target| OutgoingRef {
                relation: format!("{}{key}", relation::CONFIG_PREFIX),
                target: target.clone(),
            }));
        }
        out
    }

    /// Check the structural requirements on ids.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(PersistError::invalid_state(format!(
                "{} memento has an empty id",
                self.kind()
            )));
        }
        if self.type_name.is_empty() {
            return Err(PersistError::invalid_state(format!(
                "{} has an empty type",
                self.reference()
            )));
        }
        if let Some(empty) = self.references().iter().find(|r| r.target.id.is_empty()) {
            return Err(PersistError::invalid_state(format!(
                "{} has an empty id under relation '{}'",
                self.reference(),
                empty.relation
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_relations() {
        let memento = Memento::location("l1", "SshMachineLocation");
        assert_eq!(memento.kind(), MementoKind::Location);

        let memento = memento.with_relations(EntityRelations::default());
        assert_eq!(memento.kind(), MementoKind::Entity);
    }

    #[test]
    fn test_references_cover_relations_and_config() {
        let memento = Memento::entity("e1", "BasicApplication")
            .with_relations(
                EntityRelations::default()
                    .with_parent("app")
                    .with_child("e2")
                    .with_location("l1")
                    .with_policy("p1"),
            )
            .with_config(
                "nested",
                ConfigValue::Map(BTreeMap::from([(
                    "inner".to_string(),
                    ConfigValue::List(vec![MementoRef::location("l2").into()]),
                )])),
            );

        let references = memento.references();
        let relations: Vec<_> = references.iter().map(|r| r.relation.as_str()).collect();
        assert_eq!(
            relations,
            vec!["parent", "children", "locations", "policies", "config.nested"]
        );
        assert_eq!(references[4].target, MementoRef::location("l2"));
        assert_eq!(references[0].target, MementoRef::entity("app"));
    }

    #[test]
    fn test_owned_by_rejects_entities() {
        let policy = Memento::policy("p1", "ServiceRestarter").owned_by("e1").unwrap();
        assert_eq!(
            policy.references()[0],
            OutgoingRef {
                relation: relation::ENTITY.to_string(),
                target: MementoRef::entity("e1"),
            }
        );

        let result = Memento::entity("e1", "BasicEntity").owned_by("e0");
        assert!(matches!(result, Err(PersistError::InvalidState(_))));
    }

    #[test]
    fn test_validate_rejects_empty_ids() {
        assert!(Memento::entity("", "T").validate().is_err());
        assert!(Memento::entity("e1", "").validate().is_err());

        let memento = Memento::entity("e1", "T")
            .with_relations(EntityRelations::default().with_child(""));
        assert!(memento.validate().is_err());
        assert!(Memento::entity("e1", "T").validate().is_ok());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("entities".parse::<MementoKind>().unwrap(), MementoKind::Entity);
        assert_eq!("Feed".parse::<MementoKind>().unwrap(), MementoKind::Feed);
        assert!("widget".parse::<MementoKind>().is_err());
    }

    #[test]
    fn test_serialized_shape() {
        let memento = Memento::enricher("en1", "Propagator")
            .owned_by("e1")
            .unwrap()
            .with_config("enabled", true);

        let json = serde_json::to_value(&memento).unwrap();
        assert_eq!(json["type"], "Propagator");
        assert_eq!(json["relations"]["kind"], "enricher");
        assert_eq!(json["relations"]["entity_id"], "e1");
        assert_eq!(json["config"]["enabled"]["bool"], true);

        let back: Memento = serde_json::from_value(json).unwrap();
        assert_eq!(back, memento);
    }
}
