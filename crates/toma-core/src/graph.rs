//! # Graph Store
//!
//! The deterministic construct store for one topic map.
//!
//! All constructs live in a single arena keyed by [`ConstructId`]; every
//! cross-reference (type, player, theme, parent, reifier) is a handle
//! lookup through the owning map, never a pointer. All collections are
//! `BTreeMap`/`BTreeSet` for deterministic ordering.
//!
//! The store is the sole mutator of its indexes: every structural mutation
//! publishes an event on the notification bus immediately after applying
//! and before returning (see [`crate::events`]).

use crate::events::{self, GraphEvent, GraphObserver};
use crate::identity::IdentityIndex;
use crate::index::{LiteralIndex, ScopedIndex, TypeInstanceIndex};
use crate::literal::{Literal, LiteralTable};
use crate::merge::MergeEngine;
use crate::scope::ScopeTable;
use crate::types::{
    ConstructId, ConstructKind, IdentityKind, IdentityRef, LiteralId, Locator, ScopeId, TomaError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Map-wide configuration switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapConfig {
    /// When set, a variant's *effective* scope merges its parent name's
    /// themes into its own stored scope. Only queries are affected; the
    /// stored scope and duplicate-detection signatures always use the
    /// variant's own themes (see DESIGN.md).
    pub variant_scope_inheritance: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            variant_scope_inheritance: true,
        }
    }
}

// =============================================================================
// CONSTRUCT DATA
// =============================================================================

/// A topic: identities, characteristics and derived back-references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicData {
    pub subject_identifiers: BTreeSet<Locator>,
    pub subject_locators: BTreeSet<Locator>,
    pub item_identifiers: BTreeSet<Locator>,
    /// Type-set of this topic.
    pub types: BTreeSet<ConstructId>,
    pub occurrences: BTreeSet<ConstructId>,
    pub names: BTreeSet<ConstructId>,
    /// Derived inverse edge: roles whose player is this topic.
    pub roles_played: BTreeSet<ConstructId>,
    /// The construct this topic reifies, if any (at most one).
    pub reified: Option<ConstructId>,
}

/// An association: a typed, scoped set of roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationData {
    pub item_identifiers: BTreeSet<Locator>,
    pub typ: Option<ConstructId>,
    pub scope: ScopeId,
    pub roles: BTreeSet<ConstructId>,
    pub reifier: Option<ConstructId>,
}

/// A role: a typed slot with exactly one player topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleData {
    pub item_identifiers: BTreeSet<Locator>,
    pub parent: ConstructId,
    pub typ: ConstructId,
    pub player: ConstructId,
    pub reifier: Option<ConstructId>,
}

/// An occurrence: a typed, scoped literal characteristic of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccurrenceData {
    pub item_identifiers: BTreeSet<Locator>,
    pub parent: ConstructId,
    pub typ: Option<ConstructId>,
    pub value: LiteralId,
    pub scope: ScopeId,
    pub reifier: Option<ConstructId>,
}

/// A name: a typed, scoped string characteristic owning variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameData {
    pub item_identifiers: BTreeSet<Locator>,
    pub parent: ConstructId,
    pub typ: Option<ConstructId>,
    pub value: LiteralId,
    pub scope: ScopeId,
    pub variants: BTreeSet<ConstructId>,
    pub reifier: Option<ConstructId>,
}

/// A variant: an alternate form of a name, valid in its scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantData {
    pub item_identifiers: BTreeSet<Locator>,
    pub parent: ConstructId,
    pub value: LiteralId,
    pub scope: ScopeId,
    pub reifier: Option<ConstructId>,
}

/// The closed union over all construct kinds stored in the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Construct {
    Topic(TopicData),
    Association(AssociationData),
    Role(RoleData),
    Occurrence(OccurrenceData),
    Name(NameData),
    Variant(VariantData),
}

impl Construct {
    /// The kind tag of this construct.
    #[must_use]
    pub fn kind(&self) -> ConstructKind {
        match self {
            Construct::Topic(_) => ConstructKind::Topic,
            Construct::Association(_) => ConstructKind::Association,
            Construct::Role(_) => ConstructKind::Role,
            Construct::Occurrence(_) => ConstructKind::Occurrence,
            Construct::Name(_) => ConstructKind::Name,
            Construct::Variant(_) => ConstructKind::Variant,
        }
    }

    /// Item identifiers of this construct.
    #[must_use]
    pub fn item_identifiers(&self) -> &BTreeSet<Locator> {
        match self {
            Construct::Topic(d) => &d.item_identifiers,
            Construct::Association(d) => &d.item_identifiers,
            Construct::Role(d) => &d.item_identifiers,
            Construct::Occurrence(d) => &d.item_identifiers,
            Construct::Name(d) => &d.item_identifiers,
            Construct::Variant(d) => &d.item_identifiers,
        }
    }

    pub(crate) fn item_identifiers_mut(&mut self) -> &mut BTreeSet<Locator> {
        match self {
            Construct::Topic(d) => &mut d.item_identifiers,
            Construct::Association(d) => &mut d.item_identifiers,
            Construct::Role(d) => &mut d.item_identifiers,
            Construct::Occurrence(d) => &mut d.item_identifiers,
            Construct::Name(d) => &mut d.item_identifiers,
            Construct::Variant(d) => &mut d.item_identifiers,
        }
    }

    /// Every topic typing this construct: the type-set for topics, the
    /// type slot for typed constructs, nothing for variants.
    #[must_use]
    pub fn types(&self) -> Vec<ConstructId> {
        match self {
            Construct::Topic(d) => d.types.iter().copied().collect(),
            Construct::Association(d) => d.typ.into_iter().collect(),
            Construct::Role(d) => vec![d.typ],
            Construct::Occurrence(d) => d.typ.into_iter().collect(),
            Construct::Name(d) => d.typ.into_iter().collect(),
            Construct::Variant(_) => Vec::new(),
        }
    }

    /// The stored scope of this construct, if it is a scoped kind.
    #[must_use]
    pub fn scope(&self) -> Option<ScopeId> {
        match self {
            Construct::Association(d) => Some(d.scope),
            Construct::Occurrence(d) => Some(d.scope),
            Construct::Name(d) => Some(d.scope),
            Construct::Variant(d) => Some(d.scope),
            Construct::Topic(_) | Construct::Role(_) => None,
        }
    }

    /// The literal value of this construct, if it is a valued kind.
    #[must_use]
    pub fn value(&self) -> Option<LiteralId> {
        match self {
            Construct::Occurrence(d) => Some(d.value),
            Construct::Name(d) => Some(d.value),
            Construct::Variant(d) => Some(d.value),
            Construct::Topic(_) | Construct::Association(_) | Construct::Role(_) => None,
        }
    }

    /// The topic reifying this construct, if any.
    #[must_use]
    pub fn reifier(&self) -> Option<ConstructId> {
        match self {
            Construct::Association(d) => d.reifier,
            Construct::Role(d) => d.reifier,
            Construct::Occurrence(d) => d.reifier,
            Construct::Name(d) => d.reifier,
            Construct::Variant(d) => d.reifier,
            Construct::Topic(_) => None,
        }
    }

    fn reifier_mut(&mut self) -> Option<&mut Option<ConstructId>> {
        match self {
            Construct::Association(d) => Some(&mut d.reifier),
            Construct::Role(d) => Some(&mut d.reifier),
            Construct::Occurrence(d) => Some(&mut d.reifier),
            Construct::Name(d) => Some(&mut d.reifier),
            Construct::Variant(d) => Some(&mut d.reifier),
            Construct::Topic(_) => None,
        }
    }
}

// =============================================================================
// TOPIC MAP
// =============================================================================

/// The root of one working graph: owns every construct and all indexes.
///
/// Single-threaded; no internal locking. Distinct maps share no mutable
/// state and may live on different threads.
#[derive(Debug, Clone)]
pub struct TopicMap {
    arena: BTreeMap<ConstructId, Construct>,
    /// Next handle to allocate; `0` is the map root.
    next_id: u64,
    /// Item identifiers of the map itself.
    item_identifiers: BTreeSet<Locator>,
    /// Topic reifying the map itself.
    reifier: Option<ConstructId>,
    literals: LiteralTable,
    scopes: ScopeTable,
    identity: IdentityIndex,
    types_index: TypeInstanceIndex,
    scoped_index: ScopedIndex,
    literal_index: LiteralIndex,
    /// (doomed, survivor) pairs recorded by the merge engine, drained by
    /// the streaming builder to rewrite its construction stack.
    merge_log: Vec<(ConstructId, ConstructId)>,
    config: MapConfig,
}

impl Default for TopicMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicMap {
    /// Create an empty map with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MapConfig::default())
    }

    /// Create an empty map with an explicit configuration.
    #[must_use]
    pub fn with_config(config: MapConfig) -> Self {
        Self {
            arena: BTreeMap::new(),
            next_id: 1,
            item_identifiers: BTreeSet::new(),
            reifier: None,
            literals: LiteralTable::default(),
            scopes: ScopeTable::default(),
            identity: IdentityIndex::default(),
            types_index: TypeInstanceIndex::default(),
            scoped_index: ScopedIndex::default(),
            literal_index: LiteralIndex::default(),
            merge_log: Vec::new(),
            config,
        }
    }

    /// The map's configuration.
    #[must_use]
    pub fn config(&self) -> MapConfig {
        self.config
    }

    // =========================================================================
    // NOTIFICATION BUS
    // =========================================================================

    /// Publish one event synchronously to every index.
    ///
    /// Composite additions are expanded by the multiplier first; the
    /// fine-grained events are delivered before the composite itself.
    pub(crate) fn publish(&mut self, event: GraphEvent) {
        let mut batch = if let GraphEvent::ConstructAdded { id, .. } = &event {
            events::expand_added(&self.arena, &self.scopes, *id)
        } else {
            Vec::new()
        };
        batch.push(event);
        self.deliver(&batch);
    }

    /// Publish the removal of an already-extracted construct.
    fn publish_removed(&mut self, id: ConstructId, construct: &Construct) {
        let mut batch = events::expand_removed(construct, &self.scopes, id);
        batch.push(GraphEvent::ConstructRemoved {
            id,
            kind: construct.kind(),
        });
        self.deliver(&batch);
    }

    fn deliver(&mut self, batch: &[GraphEvent]) {
        for event in batch {
            self.identity.dispatch(event);
            self.types_index.dispatch(event);
            self.scoped_index.dispatch(event);
            self.literal_index.dispatch(event);
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Whether the handle addresses a construct of this map (the root
    /// handle always does).
    #[must_use]
    pub fn contains(&self, id: ConstructId) -> bool {
        id == ConstructId::TOPIC_MAP || self.arena.contains_key(&id)
    }

    /// The kind behind a handle.
    pub fn kind_of(&self, id: ConstructId) -> Result<ConstructKind, TomaError> {
        if id == ConstructId::TOPIC_MAP {
            return Ok(ConstructKind::TopicMap);
        }
        self.arena
            .get(&id)
            .map(Construct::kind)
            .ok_or(TomaError::ConstructNotFound(id))
    }

    /// The construct behind a handle (the map root is not an arena entry).
    pub fn construct(&self, id: ConstructId) -> Result<&Construct, TomaError> {
        self.arena
            .get(&id)
            .ok_or(TomaError::ConstructNotFound(id))
    }

    fn construct_mut(&mut self, id: ConstructId) -> Result<&mut Construct, TomaError> {
        self.arena
            .get_mut(&id)
            .ok_or(TomaError::ConstructNotFound(id))
    }

    /// Topic data behind a handle.
    pub fn topic(&self, id: ConstructId) -> Result<&TopicData, TomaError> {
        match self.construct(id)? {
            Construct::Topic(d) => Ok(d),
            c => Err(TomaError::KindMismatch {
                expected: ConstructKind::Topic,
                found: c.kind(),
            }),
        }
    }

    pub(crate) fn topic_mut(&mut self, id: ConstructId) -> Result<&mut TopicData, TomaError> {
        match self.construct_mut(id)? {
            Construct::Topic(d) => Ok(d),
            c => Err(TomaError::KindMismatch {
                expected: ConstructKind::Topic,
                found: c.kind(),
            }),
        }
    }

    /// Association data behind a handle.
    pub fn association(&self, id: ConstructId) -> Result<&AssociationData, TomaError> {
        match self.construct(id)? {
            Construct::Association(d) => Ok(d),
            c => Err(TomaError::KindMismatch {
                expected: ConstructKind::Association,
                found: c.kind(),
            }),
        }
    }

    pub(crate) fn association_mut(
        &mut self,
        id: ConstructId,
    ) -> Result<&mut AssociationData, TomaError> {
        match self.construct_mut(id)? {
            Construct::Association(d) => Ok(d),
            c => Err(TomaError::KindMismatch {
                expected: ConstructKind::Association,
                found: c.kind(),
            }),
        }
    }

    /// Role data behind a handle.
    pub fn role(&self, id: ConstructId) -> Result<&RoleData, TomaError> {
        match self.construct(id)? {
            Construct::Role(d) => Ok(d),
            c => Err(TomaError::KindMismatch {
                expected: ConstructKind::Role,
                found: c.kind(),
            }),
        }
    }

    /// Occurrence data behind a handle.
    pub fn occurrence(&self, id: ConstructId) -> Result<&OccurrenceData, TomaError> {
        match self.construct(id)? {
            Construct::Occurrence(d) => Ok(d),
            c => Err(TomaError::KindMismatch {
                expected: ConstructKind::Occurrence,
                found: c.kind(),
            }),
        }
    }

    /// Name data behind a handle.
    pub fn name(&self, id: ConstructId) -> Result<&NameData, TomaError> {
        match self.construct(id)? {
            Construct::Name(d) => Ok(d),
            c => Err(TomaError::KindMismatch {
                expected: ConstructKind::Name,
                found: c.kind(),
            }),
        }
    }

    /// Variant data behind a handle.
    pub fn variant(&self, id: ConstructId) -> Result<&VariantData, TomaError> {
        match self.construct(id)? {
            Construct::Variant(d) => Ok(d),
            c => Err(TomaError::KindMismatch {
                expected: ConstructKind::Variant,
                found: c.kind(),
            }),
        }
    }

    /// All construct handles with their data, in handle order.
    pub fn constructs(&self) -> impl Iterator<Item = (ConstructId, &Construct)> {
        self.arena.iter().map(|(&id, c)| (id, c))
    }

    /// All topic handles, in handle order.
    pub fn topics(&self) -> impl Iterator<Item = ConstructId> + '_ {
        self.arena.iter().filter_map(|(&id, c)| match c {
            Construct::Topic(_) => Some(id),
            _ => None,
        })
    }

    /// All association handles, in handle order.
    pub fn associations(&self) -> impl Iterator<Item = ConstructId> + '_ {
        self.arena.iter().filter_map(|(&id, c)| match c {
            Construct::Association(_) => Some(id),
            _ => None,
        })
    }

    /// Number of topics in the map.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics().count()
    }

    /// Number of associations in the map.
    #[must_use]
    pub fn association_count(&self) -> usize {
        self.associations().count()
    }

    /// Number of constructs in the arena (map root excluded).
    #[must_use]
    pub fn construct_count(&self) -> usize {
        self.arena.len()
    }

    /// Item identifiers of the map root itself.
    #[must_use]
    pub fn map_item_identifiers(&self) -> &BTreeSet<Locator> {
        &self.item_identifiers
    }

    /// Topic reifying the map root, if any.
    #[must_use]
    pub fn map_reifier(&self) -> Option<ConstructId> {
        self.reifier
    }

    /// The interned literal behind a handle.
    #[must_use]
    pub fn literal(&self, id: LiteralId) -> Option<&Literal> {
        self.literals.get(id)
    }

    /// The theme-set behind a scope handle.
    #[must_use]
    pub fn themes(&self, scope: ScopeId) -> &BTreeSet<ConstructId> {
        self.scopes.themes(scope)
    }

    /// Intern a theme-set, validating that every theme is a topic.
    pub fn intern_scope(&mut self, themes: &[ConstructId]) -> Result<ScopeId, TomaError> {
        let mut set = BTreeSet::new();
        for &theme in themes {
            self.topic(theme)?;
            set.insert(theme);
        }
        Ok(self.scopes.intern(set))
    }

    pub(crate) fn intern_literal(&mut self, literal: Literal) -> Result<LiteralId, TomaError> {
        self.literals.intern(literal)
    }

    /// The effective scope of a variant: its stored themes, merged with
    /// its parent name's themes when `variant_scope_inheritance` is set.
    pub fn effective_scope(&self, variant: ConstructId) -> Result<BTreeSet<ConstructId>, TomaError> {
        let data = self.variant(variant)?;
        let mut themes = self.scopes.themes(data.scope).clone();
        if self.config.variant_scope_inheritance {
            let parent = self.name(data.parent)?;
            themes.extend(self.scopes.themes(parent.scope).iter().copied());
        }
        Ok(themes)
    }

    // =========================================================================
    // IDENTITY QUERIES
    // =========================================================================

    /// Topic carrying the subject identifier, if any.
    #[must_use]
    pub fn topic_by_subject_identifier(&self, locator: &Locator) -> Option<ConstructId> {
        self.identity.resolve(IdentityKind::SubjectIdentifier, locator)
    }

    /// Topic carrying the subject locator, if any.
    #[must_use]
    pub fn topic_by_subject_locator(&self, locator: &Locator) -> Option<ConstructId> {
        self.identity.resolve(IdentityKind::SubjectLocator, locator)
    }

    /// Construct (any kind, including the map root) carrying the item
    /// identifier, if any.
    #[must_use]
    pub fn construct_by_item_identifier(&self, locator: &Locator) -> Option<ConstructId> {
        self.identity.resolve(IdentityKind::ItemIdentifier, locator)
    }

    /// Resolve a tagged identity the way the streaming protocol does:
    /// by its own kind first, then through the subject-identifier ↔
    /// item-identifier cross-check.
    #[must_use]
    pub fn resolve_identity(&self, identity: &IdentityRef) -> Option<ConstructId> {
        match identity.kind {
            IdentityKind::SubjectIdentifier => self
                .topic_by_subject_identifier(&identity.locator)
                .or_else(|| self.construct_by_item_identifier(&identity.locator)),
            IdentityKind::SubjectLocator => self.topic_by_subject_locator(&identity.locator),
            IdentityKind::ItemIdentifier => self
                .construct_by_item_identifier(&identity.locator)
                .or_else(|| self.topic_by_subject_identifier(&identity.locator)),
        }
    }

    // =========================================================================
    // INDEX QUERIES
    // =========================================================================

    /// Every construct typed by `typ`. Trust requires [`Self::indexes_live`].
    #[must_use]
    pub fn instances_of(&self, typ: ConstructId) -> BTreeSet<ConstructId> {
        self.types_index.instances_of(typ)
    }

    /// Every scoped construct whose scope contains `theme`.
    #[must_use]
    pub fn scoped_by_theme(&self, theme: ConstructId) -> BTreeSet<ConstructId> {
        self.scoped_index.by_theme(theme)
    }

    /// Every scoped construct in the unconstrained scope, by arena scan.
    #[must_use]
    pub fn unconstrained_scoped(&self) -> Vec<ConstructId> {
        self.arena
            .iter()
            .filter(|(_, c)| c.scope() == Some(ScopeId::UNCONSTRAINED))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Every characteristic carrying the given value. A `None` datatype
    /// means `xsd:string`.
    #[must_use]
    pub fn characteristics_by_value(
        &self,
        value: &str,
        datatype: Option<&Locator>,
    ) -> BTreeSet<ConstructId> {
        let literal = match datatype {
            Some(dt) => Literal::new(value, dt.clone()),
            None => Literal::string(value),
        };
        self.literals
            .lookup(&literal)
            .map(|id| self.literal_index.by_literal(id))
            .unwrap_or_default()
    }

    /// Whether the secondary indexes are continuously maintained right now.
    /// The identity index is always live.
    #[must_use]
    pub fn indexes_live(&self) -> bool {
        self.types_index.is_live() && self.scoped_index.is_live() && self.literal_index.is_live()
    }

    /// Suspend the secondary indexes for a bulk structural change. Until
    /// [`Self::reindex`] runs, their answers must not be trusted.
    pub fn suspend_secondary_indexes(&mut self) {
        self.types_index.suspend();
        self.scoped_index.suspend();
        self.literal_index.suspend();
    }

    /// Rebuild all secondary indexes from the arena and mark them live.
    pub fn reindex(&mut self) {
        let mut types: BTreeMap<ConstructId, BTreeSet<ConstructId>> = BTreeMap::new();
        let mut scoped: BTreeMap<ConstructId, BTreeSet<ConstructId>> = BTreeMap::new();
        let mut values: BTreeMap<LiteralId, BTreeSet<ConstructId>> = BTreeMap::new();
        for (&id, construct) in &self.arena {
            for typ in construct.types() {
                types.entry(typ).or_default().insert(id);
            }
            if let Some(scope) = construct.scope() {
                for &theme in self.scopes.themes(scope) {
                    scoped.entry(theme).or_default().insert(id);
                }
            }
            if let Some(value) = construct.value() {
                values.entry(value).or_default().insert(id);
            }
        }
        self.types_index.rebuild(types);
        self.scoped_index.rebuild(scoped);
        self.literal_index.rebuild(values);
    }

    /// Rebuild the secondary indexes only if they are suspended.
    pub fn ensure_indexes_live(&mut self) {
        if !self.indexes_live() {
            self.reindex();
        }
    }

    // =========================================================================
    // MERGE LOG
    // =========================================================================

    pub(crate) fn log_merge(&mut self, doomed: ConstructId, survivor: ConstructId) {
        if self.merge_log.len() >= crate::primitives::MAX_MERGE_LOG {
            self.merge_log.remove(0);
        }
        self.merge_log.push((doomed, survivor));
    }

    /// Follow the merge log to the handle that currently stands for `id`.
    ///
    /// A cascading merge can doom a topic some caller still holds; the
    /// log pairs, applied in order, lead to its survivor.
    #[must_use]
    pub(crate) fn current_handle(&self, id: ConstructId) -> ConstructId {
        let mut current = id;
        for &(doomed, survivor) in &self.merge_log {
            if current == doomed {
                current = survivor;
            }
        }
        current
    }

    /// Drain the (doomed, survivor) pairs recorded since the last drain.
    /// The streaming builder uses this to rewrite its construction stack.
    pub fn drain_merges(&mut self) -> Vec<(ConstructId, ConstructId)> {
        std::mem::take(&mut self.merge_log)
    }

    // =========================================================================
    // FACTORIES
    // =========================================================================

    fn alloc(&mut self) -> ConstructId {
        let id = ConstructId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        id
    }

    /// Create a fresh topic with no identities.
    pub fn create_topic(&mut self) -> ConstructId {
        let id = self.alloc();
        self.arena.insert(id, Construct::Topic(TopicData::default()));
        self.publish(GraphEvent::ConstructAdded {
            id,
            kind: ConstructKind::Topic,
        });
        id
    }

    /// Resolve a tagged identity to a topic, creating one if nothing
    /// resolves. Resolution to a non-topic construct is an identity clash.
    pub fn ensure_topic(&mut self, identity: &IdentityRef) -> Result<ConstructId, TomaError> {
        identity.locator.validate()?;
        let topic = if let Some(existing) = self.resolve_identity(identity) {
            if self.kind_of(existing)? != ConstructKind::Topic {
                return Err(TomaError::IdentityClash(identity.locator.clone()));
            }
            // Resolution through the si/ii cross-check leaves the asked-for
            // identity unregistered; the idempotent add closes that gap.
            existing
        } else {
            self.create_topic()
        };
        match identity.kind {
            IdentityKind::SubjectIdentifier => {
                self.add_subject_identifier(topic, identity.locator.clone())
            }
            IdentityKind::SubjectLocator => {
                self.add_subject_locator(topic, identity.locator.clone())
            }
            IdentityKind::ItemIdentifier => {
                self.add_item_identifier(topic, identity.locator.clone())
            }
        }
    }

    /// Create an association with an optional type and a scope.
    pub fn create_association(
        &mut self,
        typ: Option<ConstructId>,
        scope: ScopeId,
    ) -> Result<ConstructId, TomaError> {
        if let Some(t) = typ {
            self.topic(t)?;
        }
        let id = self.alloc();
        self.arena.insert(
            id,
            Construct::Association(AssociationData {
                item_identifiers: BTreeSet::new(),
                typ,
                scope,
                roles: BTreeSet::new(),
                reifier: None,
            }),
        );
        self.publish(GraphEvent::ConstructAdded {
            id,
            kind: ConstructKind::Association,
        });
        Ok(id)
    }

    /// Create a role in an association, with a type and a player.
    pub fn create_role(
        &mut self,
        association: ConstructId,
        typ: ConstructId,
        player: ConstructId,
    ) -> Result<ConstructId, TomaError> {
        self.association(association)?;
        self.topic(typ)?;
        self.topic(player)?;
        let id = self.alloc();
        self.arena.insert(
            id,
            Construct::Role(RoleData {
                item_identifiers: BTreeSet::new(),
                parent: association,
                typ,
                player,
                reifier: None,
            }),
        );
        self.association_mut(association)?.roles.insert(id);
        self.topic_mut(player)?.roles_played.insert(id);
        self.publish(GraphEvent::ConstructAdded {
            id,
            kind: ConstructKind::Role,
        });
        Ok(id)
    }

    /// Create an occurrence on a topic. A `None` datatype means
    /// `xsd:string`.
    pub fn create_occurrence(
        &mut self,
        topic: ConstructId,
        typ: Option<ConstructId>,
        value: &str,
        datatype: Option<&Locator>,
        scope: ScopeId,
    ) -> Result<ConstructId, TomaError> {
        self.topic(topic)?;
        if let Some(t) = typ {
            self.topic(t)?;
        }
        let literal = match datatype {
            Some(dt) => Literal::new(value, dt.clone()),
            None => Literal::string(value),
        };
        let value = self.literals.intern(literal)?;
        let id = self.alloc();
        self.arena.insert(
            id,
            Construct::Occurrence(OccurrenceData {
                item_identifiers: BTreeSet::new(),
                parent: topic,
                typ,
                value,
                scope,
                reifier: None,
            }),
        );
        self.topic_mut(topic)?.occurrences.insert(id);
        self.publish(GraphEvent::ConstructAdded {
            id,
            kind: ConstructKind::Occurrence,
        });
        Ok(id)
    }

    /// Create a name on a topic. Name values are always `xsd:string`.
    pub fn create_name(
        &mut self,
        topic: ConstructId,
        typ: Option<ConstructId>,
        value: &str,
        scope: ScopeId,
    ) -> Result<ConstructId, TomaError> {
        self.topic(topic)?;
        if let Some(t) = typ {
            self.topic(t)?;
        }
        let value = self.literals.intern(Literal::string(value))?;
        let id = self.alloc();
        self.arena.insert(
            id,
            Construct::Name(NameData {
                item_identifiers: BTreeSet::new(),
                parent: topic,
                typ,
                value,
                scope,
                variants: BTreeSet::new(),
                reifier: None,
            }),
        );
        self.topic_mut(topic)?.names.insert(id);
        self.publish(GraphEvent::ConstructAdded {
            id,
            kind: ConstructKind::Name,
        });
        Ok(id)
    }

    /// Create a variant on a name. A `None` datatype means `xsd:string`.
    pub fn create_variant(
        &mut self,
        name: ConstructId,
        value: &str,
        datatype: Option<&Locator>,
        scope: ScopeId,
    ) -> Result<ConstructId, TomaError> {
        self.name(name)?;
        let literal = match datatype {
            Some(dt) => Literal::new(value, dt.clone()),
            None => Literal::string(value),
        };
        let value = self.literals.intern(literal)?;
        let id = self.alloc();
        self.arena.insert(
            id,
            Construct::Variant(VariantData {
                item_identifiers: BTreeSet::new(),
                parent: name,
                value,
                scope,
                reifier: None,
            }),
        );
        match self.construct_mut(name)? {
            Construct::Name(d) => {
                d.variants.insert(id);
            }
            _ => {
                return Err(TomaError::InternalInvariant(
                    "variant parent changed kind mid-creation".to_string(),
                ));
            }
        }
        self.publish(GraphEvent::ConstructAdded {
            id,
            kind: ConstructKind::Variant,
        });
        Ok(id)
    }

    // =========================================================================
    // IDENTITY MUTATORS (merge-on-collision)
    // =========================================================================

    /// Add a subject identifier to a topic.
    ///
    /// If the locator already identifies a *different* topic (as subject
    /// identifier, or as item identifier under the cross-check), the two
    /// topics are merged and the surviving handle is returned. Collision
    /// with a non-topic construct is an identity clash.
    pub fn add_subject_identifier(
        &mut self,
        topic: ConstructId,
        locator: Locator,
    ) -> Result<ConstructId, TomaError> {
        locator.validate()?;
        if self.topic(topic)?.subject_identifiers.contains(&locator) {
            return Ok(topic);
        }
        if let Some(existing) = self.topic_by_subject_identifier(&locator)
            && existing != topic
        {
            let survivor = MergeEngine::merge_topics(self, topic, existing)?;
            return self.add_subject_identifier(survivor, locator);
        }
        // Cross-check: the same locator as another construct's item
        // identifier forces a merge when both are topics, a clash otherwise.
        if let Some(existing) = self.construct_by_item_identifier(&locator)
            && existing != topic
        {
            if self.kind_of(existing)? != ConstructKind::Topic {
                return Err(TomaError::IdentityClash(locator));
            }
            let survivor = MergeEngine::merge_topics(self, topic, existing)?;
            return self.add_subject_identifier(survivor, locator);
        }
        self.topic_mut(topic)?.subject_identifiers.insert(locator.clone());
        self.publish(GraphEvent::IdentityAdded {
            construct: topic,
            kind: IdentityKind::SubjectIdentifier,
            locator,
        });
        Ok(topic)
    }

    /// Remove a subject identifier from a topic, freeing the locator.
    pub fn remove_subject_identifier(
        &mut self,
        topic: ConstructId,
        locator: &Locator,
    ) -> Result<(), TomaError> {
        if self.topic_mut(topic)?.subject_identifiers.remove(locator) {
            self.publish(GraphEvent::IdentityRemoved {
                construct: topic,
                kind: IdentityKind::SubjectIdentifier,
                locator: locator.clone(),
            });
        }
        Ok(())
    }

    /// Add a subject locator to a topic, merging on collision.
    pub fn add_subject_locator(
        &mut self,
        topic: ConstructId,
        locator: Locator,
    ) -> Result<ConstructId, TomaError> {
        locator.validate()?;
        if self.topic(topic)?.subject_locators.contains(&locator) {
            return Ok(topic);
        }
        if let Some(existing) = self.topic_by_subject_locator(&locator)
            && existing != topic
        {
            let survivor = MergeEngine::merge_topics(self, topic, existing)?;
            return self.add_subject_locator(survivor, locator);
        }
        self.topic_mut(topic)?.subject_locators.insert(locator.clone());
        self.publish(GraphEvent::IdentityAdded {
            construct: topic,
            kind: IdentityKind::SubjectLocator,
            locator,
        });
        Ok(topic)
    }

    /// Remove a subject locator from a topic, freeing the locator.
    pub fn remove_subject_locator(
        &mut self,
        topic: ConstructId,
        locator: &Locator,
    ) -> Result<(), TomaError> {
        if self.topic_mut(topic)?.subject_locators.remove(locator) {
            self.publish(GraphEvent::IdentityRemoved {
                construct: topic,
                kind: IdentityKind::SubjectLocator,
                locator: locator.clone(),
            });
        }
        Ok(())
    }

    /// Add an item identifier to any construct (the map root included).
    ///
    /// Topic/topic collisions merge; any collision involving a non-topic
    /// construct is a hard identity clash. Returns the surviving handle.
    pub fn add_item_identifier(
        &mut self,
        id: ConstructId,
        locator: Locator,
    ) -> Result<ConstructId, TomaError> {
        locator.validate()?;
        let kind = self.kind_of(id)?;
        if self.item_identifiers_of(id)?.contains(&locator) {
            return Ok(id);
        }
        if let Some(existing) = self.construct_by_item_identifier(&locator)
            && existing != id
        {
            let both_topics = kind == ConstructKind::Topic
                && self.kind_of(existing)? == ConstructKind::Topic;
            if !both_topics {
                return Err(TomaError::IdentityClash(locator));
            }
            let survivor = MergeEngine::merge_topics(self, id, existing)?;
            return self.add_item_identifier(survivor, locator);
        }
        // Cross-check against subject identifiers.
        if let Some(existing) = self.topic_by_subject_identifier(&locator)
            && existing != id
        {
            if kind != ConstructKind::Topic {
                return Err(TomaError::IdentityClash(locator));
            }
            let survivor = MergeEngine::merge_topics(self, id, existing)?;
            return self.add_item_identifier(survivor, locator);
        }
        if id == ConstructId::TOPIC_MAP {
            self.item_identifiers.insert(locator.clone());
        } else {
            self.construct_mut(id)?.item_identifiers_mut().insert(locator.clone());
        }
        self.publish(GraphEvent::IdentityAdded {
            construct: id,
            kind: IdentityKind::ItemIdentifier,
            locator,
        });
        Ok(id)
    }

    /// Remove an item identifier from a construct, freeing the locator.
    pub fn remove_item_identifier(
        &mut self,
        id: ConstructId,
        locator: &Locator,
    ) -> Result<(), TomaError> {
        let removed = if id == ConstructId::TOPIC_MAP {
            self.item_identifiers.remove(locator)
        } else {
            self.construct_mut(id)?.item_identifiers_mut().remove(locator)
        };
        if removed {
            self.publish(GraphEvent::IdentityRemoved {
                construct: id,
                kind: IdentityKind::ItemIdentifier,
                locator: locator.clone(),
            });
        }
        Ok(())
    }

    fn item_identifiers_of(&self, id: ConstructId) -> Result<&BTreeSet<Locator>, TomaError> {
        if id == ConstructId::TOPIC_MAP {
            Ok(&self.item_identifiers)
        } else {
            Ok(self.construct(id)?.item_identifiers())
        }
    }

    // =========================================================================
    // TYPING, SCOPING, VALUES, PLAYERS, REIFICATION
    // =========================================================================

    /// Add a topic to another topic's type-set.
    pub fn add_topic_type(
        &mut self,
        topic: ConstructId,
        typ: ConstructId,
    ) -> Result<(), TomaError> {
        self.topic(typ)?;
        if self.topic_mut(topic)?.types.insert(typ) {
            self.publish(GraphEvent::TypeAdded {
                construct: topic,
                typ,
            });
        }
        Ok(())
    }

    /// Remove a topic from another topic's type-set.
    pub fn remove_topic_type(
        &mut self,
        topic: ConstructId,
        typ: ConstructId,
    ) -> Result<(), TomaError> {
        if self.topic_mut(topic)?.types.remove(&typ) {
            self.publish(GraphEvent::TypeRemoved {
                construct: topic,
                typ,
            });
        }
        Ok(())
    }

    /// Set the type slot of an association, role, occurrence or name.
    /// Roles must stay typed.
    pub fn set_type(
        &mut self,
        id: ConstructId,
        typ: Option<ConstructId>,
    ) -> Result<(), TomaError> {
        if let Some(t) = typ {
            self.topic(t)?;
        }
        let old = match self.construct_mut(id)? {
            Construct::Association(d) => std::mem::replace(&mut d.typ, typ),
            Construct::Role(d) => match typ {
                Some(t) => Some(std::mem::replace(&mut d.typ, t)),
                None => {
                    return Err(TomaError::InvalidInput(
                        "role type is required".to_string(),
                    ));
                }
            },
            Construct::Occurrence(d) => std::mem::replace(&mut d.typ, typ),
            Construct::Name(d) => std::mem::replace(&mut d.typ, typ),
            c => {
                let found = c.kind();
                return Err(TomaError::KindMismatch {
                    expected: ConstructKind::Association,
                    found,
                });
            }
        };
        if old != typ {
            if let Some(t) = old {
                self.publish(GraphEvent::TypeRemoved { construct: id, typ: t });
            }
            if let Some(t) = typ {
                self.publish(GraphEvent::TypeAdded { construct: id, typ: t });
            }
        }
        Ok(())
    }

    /// Set the scope of a scoped construct to an interned theme-set.
    pub fn set_scope(&mut self, id: ConstructId, scope: ScopeId) -> Result<(), TomaError> {
        let old = match self.construct_mut(id)? {
            Construct::Association(d) => std::mem::replace(&mut d.scope, scope),
            Construct::Occurrence(d) => std::mem::replace(&mut d.scope, scope),
            Construct::Name(d) => std::mem::replace(&mut d.scope, scope),
            Construct::Variant(d) => std::mem::replace(&mut d.scope, scope),
            c => {
                let found = c.kind();
                return Err(TomaError::KindMismatch {
                    expected: ConstructKind::Association,
                    found,
                });
            }
        };
        if old != scope {
            let old_themes = self.scopes.themes(old).clone();
            let new_themes = self.scopes.themes(scope).clone();
            for &theme in old_themes.difference(&new_themes) {
                self.publish(GraphEvent::ThemeRemoved {
                    construct: id,
                    theme,
                });
            }
            for &theme in new_themes.difference(&old_themes) {
                self.publish(GraphEvent::ThemeAdded {
                    construct: id,
                    theme,
                });
            }
        }
        Ok(())
    }

    /// Add a theme to a scoped construct's scope.
    pub fn add_theme(&mut self, id: ConstructId, theme: ConstructId) -> Result<(), TomaError> {
        self.topic(theme)?;
        let current = self
            .construct(id)?
            .scope()
            .ok_or(TomaError::KindMismatch {
                expected: ConstructKind::Association,
                found: self.kind_of(id)?,
            })?;
        let scope = self.scopes.with_theme(current, theme);
        self.set_scope(id, scope)
    }

    /// Remove a theme from a scoped construct's scope.
    pub fn remove_theme(&mut self, id: ConstructId, theme: ConstructId) -> Result<(), TomaError> {
        let current = self
            .construct(id)?
            .scope()
            .ok_or(TomaError::KindMismatch {
                expected: ConstructKind::Association,
                found: self.kind_of(id)?,
            })?;
        let scope = self.scopes.without_theme(current, theme);
        self.set_scope(id, scope)
    }

    /// Re-point one theme in a scoped construct's scope. Used by the merge
    /// engine; no-op when the old theme is absent.
    pub(crate) fn repoint_theme(
        &mut self,
        id: ConstructId,
        old: ConstructId,
        new: ConstructId,
    ) -> Result<(), TomaError> {
        let current = self
            .construct(id)?
            .scope()
            .ok_or(TomaError::KindMismatch {
                expected: ConstructKind::Association,
                found: self.kind_of(id)?,
            })?;
        let scope = self.scopes.replace_theme(current, old, new);
        self.set_scope(id, scope)
    }

    /// Set the literal value of an occurrence, name or variant. A `None`
    /// datatype means `xsd:string`; names reject explicit datatypes.
    pub fn set_value(
        &mut self,
        id: ConstructId,
        value: &str,
        datatype: Option<&Locator>,
    ) -> Result<(), TomaError> {
        let kind = self.kind_of(id)?;
        let literal = match (kind, datatype) {
            (ConstructKind::Name, Some(_)) => {
                return Err(TomaError::InvalidInput(
                    "names carry xsd:string values only".to_string(),
                ));
            }
            (_, Some(dt)) => Literal::new(value, dt.clone()),
            (_, None) => Literal::string(value),
        };
        let new = self.literals.intern(literal)?;
        let old = match self.construct_mut(id)? {
            Construct::Occurrence(d) => std::mem::replace(&mut d.value, new),
            Construct::Name(d) => std::mem::replace(&mut d.value, new),
            Construct::Variant(d) => std::mem::replace(&mut d.value, new),
            c => {
                let found = c.kind();
                return Err(TomaError::KindMismatch {
                    expected: ConstructKind::Occurrence,
                    found,
                });
            }
        };
        if old != new {
            self.publish(GraphEvent::ValueRemoved {
                construct: id,
                literal: old,
            });
            self.publish(GraphEvent::ValueAdded {
                construct: id,
                kind,
                literal: new,
            });
        }
        Ok(())
    }

    /// Re-point a role onto a new player topic.
    pub fn set_player(&mut self, role: ConstructId, player: ConstructId) -> Result<(), TomaError> {
        self.topic(player)?;
        let old = self.role(role)?.player;
        if old == player {
            return Ok(());
        }
        self.topic_mut(old)?.roles_played.remove(&role);
        match self.construct_mut(role)? {
            Construct::Role(d) => d.player = player,
            _ => {
                return Err(TomaError::InternalInvariant(
                    "role changed kind mid-repoint".to_string(),
                ));
            }
        }
        self.topic_mut(player)?.roles_played.insert(role);
        Ok(())
    }

    /// The topic reifying a construct (the map root included), if any.
    pub fn reifier_of(&self, id: ConstructId) -> Result<Option<ConstructId>, TomaError> {
        if id == ConstructId::TOPIC_MAP {
            return Ok(self.reifier);
        }
        Ok(self.construct(id)?.reifier())
    }

    /// Set or clear the reifier of a construct.
    ///
    /// Rejected before mutation when the construct is already reified by a
    /// different topic, or the topic already reifies a different construct.
    pub fn set_reifier(
        &mut self,
        id: ConstructId,
        reifier: Option<ConstructId>,
    ) -> Result<(), TomaError> {
        let kind = self.kind_of(id)?;
        if kind == ConstructKind::Topic {
            return Err(TomaError::KindMismatch {
                expected: ConstructKind::Association,
                found: ConstructKind::Topic,
            });
        }
        let current = self.reifier_of(id)?;
        match (current, reifier) {
            (old, new) if old == new => Ok(()),
            (Some(existing), Some(incoming)) => {
                Err(TomaError::ReificationConflict { existing, incoming })
            }
            (Some(old), None) => {
                self.topic_mut(old)?.reified = None;
                self.set_raw_reifier(id, None)?;
                self.publish(GraphEvent::ReifierRemoved {
                    construct: id,
                    reifier: old,
                });
                Ok(())
            }
            (None, Some(new)) => {
                if let Some(other) = self.topic(new)?.reified
                    && other != id
                {
                    return Err(TomaError::ReificationConflict {
                        existing: other,
                        incoming: id,
                    });
                }
                self.topic_mut(new)?.reified = Some(id);
                self.set_raw_reifier(id, Some(new))?;
                self.publish(GraphEvent::ReifierAdded {
                    construct: id,
                    reifier: new,
                });
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    fn set_raw_reifier(
        &mut self,
        id: ConstructId,
        reifier: Option<ConstructId>,
    ) -> Result<(), TomaError> {
        if id == ConstructId::TOPIC_MAP {
            self.reifier = reifier;
            return Ok(());
        }
        match self.construct_mut(id)?.reifier_mut() {
            Some(slot) => {
                *slot = reifier;
                Ok(())
            }
            None => Err(TomaError::KindMismatch {
                expected: ConstructKind::Association,
                found: ConstructKind::Topic,
            }),
        }
    }

    // =========================================================================
    // RE-PARENTING (merge engine internals)
    // =========================================================================

    /// Move an occurrence or name from one topic onto another.
    pub(crate) fn reparent_characteristic(
        &mut self,
        id: ConstructId,
        to: ConstructId,
    ) -> Result<(), TomaError> {
        self.topic(to)?;
        match self.construct(id)? {
            Construct::Occurrence(d) => {
                let from = d.parent;
                self.topic_mut(from)?.occurrences.remove(&id);
                self.topic_mut(to)?.occurrences.insert(id);
                match self.construct_mut(id)? {
                    Construct::Occurrence(d) => d.parent = to,
                    _ => {
                        return Err(TomaError::InternalInvariant(
                            "occurrence changed kind mid-reparent".to_string(),
                        ));
                    }
                }
            }
            Construct::Name(d) => {
                let from = d.parent;
                self.topic_mut(from)?.names.remove(&id);
                self.topic_mut(to)?.names.insert(id);
                match self.construct_mut(id)? {
                    Construct::Name(d) => d.parent = to,
                    _ => {
                        return Err(TomaError::InternalInvariant(
                            "name changed kind mid-reparent".to_string(),
                        ));
                    }
                }
            }
            c => {
                let found = c.kind();
                return Err(TomaError::KindMismatch {
                    expected: ConstructKind::Occurrence,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Move a variant from one name onto another.
    pub(crate) fn reparent_variant(
        &mut self,
        id: ConstructId,
        to: ConstructId,
    ) -> Result<(), TomaError> {
        self.name(to)?;
        let from = self.variant(id)?.parent;
        match self.construct_mut(from)? {
            Construct::Name(d) => {
                d.variants.remove(&id);
            }
            _ => {
                return Err(TomaError::InternalInvariant(
                    "variant parent is not a name".to_string(),
                ));
            }
        }
        match self.construct_mut(to)? {
            Construct::Name(d) => {
                d.variants.insert(id);
            }
            _ => {
                return Err(TomaError::InternalInvariant(
                    "variant target is not a name".to_string(),
                ));
            }
        }
        match self.construct_mut(id)? {
            Construct::Variant(d) => d.parent = to,
            _ => {
                return Err(TomaError::InternalInvariant(
                    "variant changed kind mid-reparent".to_string(),
                ));
            }
        }
        Ok(())
    }

    // =========================================================================
    // REMOVAL
    // =========================================================================

    /// Remove a construct and everything it owns.
    ///
    /// Topics are only removable while not in use as type, player, theme
    /// or reifier; the graph is unchanged on rejection.
    pub fn remove_construct(&mut self, id: ConstructId) -> Result<(), TomaError> {
        match self.kind_of(id)? {
            ConstructKind::TopicMap => Err(TomaError::InvalidInput(
                "the map root cannot be removed".to_string(),
            )),
            ConstructKind::Topic => self.remove_topic(id),
            ConstructKind::Association => self.remove_association(id),
            ConstructKind::Role => self.remove_role(id),
            ConstructKind::Occurrence => self.remove_characteristic(id),
            ConstructKind::Name => self.remove_name(id),
            ConstructKind::Variant => self.remove_variant(id),
        }
    }

    fn remove_topic(&mut self, id: ConstructId) -> Result<(), TomaError> {
        self.ensure_indexes_live();
        let data = self.topic(id)?;
        let in_use = data.reified.is_some()
            || !data.roles_played.is_empty()
            || self.types_index.is_used_as_type(id)
            || self.scoped_index.is_used_as_theme(id);
        if in_use {
            return Err(TomaError::ConstructInUse(id));
        }
        for occurrence in self.topic(id)?.occurrences.clone() {
            self.remove_characteristic(occurrence)?;
        }
        for name in self.topic(id)?.names.clone() {
            self.remove_name(name)?;
        }
        self.extract(id)
    }

    fn remove_association(&mut self, id: ConstructId) -> Result<(), TomaError> {
        for role in self.association(id)?.roles.clone() {
            self.remove_role(role)?;
        }
        self.set_reifier(id, None)?;
        self.extract(id)
    }

    fn remove_role(&mut self, id: ConstructId) -> Result<(), TomaError> {
        let data = self.role(id)?.clone();
        self.set_reifier(id, None)?;
        self.topic_mut(data.player)?.roles_played.remove(&id);
        self.association_mut(data.parent)?.roles.remove(&id);
        self.extract(id)
    }

    fn remove_characteristic(&mut self, id: ConstructId) -> Result<(), TomaError> {
        let parent = self.occurrence(id)?.parent;
        self.set_reifier(id, None)?;
        self.topic_mut(parent)?.occurrences.remove(&id);
        self.extract(id)
    }

    fn remove_name(&mut self, id: ConstructId) -> Result<(), TomaError> {
        for variant in self.name(id)?.variants.clone() {
            self.remove_variant(variant)?;
        }
        let parent = self.name(id)?.parent;
        self.set_reifier(id, None)?;
        self.topic_mut(parent)?.names.remove(&id);
        self.extract(id)
    }

    fn remove_variant(&mut self, id: ConstructId) -> Result<(), TomaError> {
        let parent = self.variant(id)?.parent;
        self.set_reifier(id, None)?;
        match self.construct_mut(parent)? {
            Construct::Name(d) => {
                d.variants.remove(&id);
            }
            _ => {
                return Err(TomaError::InternalInvariant(
                    "variant parent is not a name".to_string(),
                ));
            }
        }
        self.extract(id)
    }

    /// Pull the construct out of the arena and publish its removal.
    pub(crate) fn extract(&mut self, id: ConstructId) -> Result<(), TomaError> {
        let construct = self
            .arena
            .remove(&id)
            .ok_or(TomaError::ConstructNotFound(id))?;
        self.publish_removed(id, &construct);
        Ok(())
    }

    // =========================================================================
    // CLOSE
    // =========================================================================

    /// Release everything the map owns.
    ///
    /// Indexes are cleared *before* constructs so that no lookup can
    /// dangle while the arena unwinds.
    pub fn close(&mut self) {
        self.identity.clear();
        self.types_index.clear();
        self.scoped_index.clear();
        self.literal_index.clear();
        self.arena.clear();
        self.literals.clear();
        self.scopes.clear();
        self.item_identifiers.clear();
        self.reifier = None;
        self.merge_log.clear();
        self.next_id = 1;
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(s: &str) -> Locator {
        Locator::new(s)
    }

    #[test]
    fn create_topic_and_resolve_by_subject_identifier() {
        let mut map = TopicMap::new();
        let t = map.create_topic();
        let survivor = map
            .add_subject_identifier(t, loc("http://example.org/puccini"))
            .expect("add si");
        assert_eq!(survivor, t);
        assert_eq!(
            map.topic_by_subject_identifier(&loc("http://example.org/puccini")),
            Some(t)
        );
    }

    #[test]
    fn adding_same_identity_twice_is_idempotent() {
        let mut map = TopicMap::new();
        let t = map.create_topic();
        map.add_subject_identifier(t, loc("http://a")).expect("add");
        let again = map.add_subject_identifier(t, loc("http://a")).expect("add");
        assert_eq!(again, t);
        assert_eq!(map.topic_count(), 1);
    }

    #[test]
    fn subject_identifier_collision_merges_topics() {
        let mut map = TopicMap::new();
        let a = map.create_topic();
        let b = map.create_topic();
        map.add_subject_identifier(a, loc("http://a")).expect("add");
        let survivor = map.add_subject_identifier(b, loc("http://a")).expect("add");
        assert_eq!(survivor, a);
        assert!(!map.contains(b));
        assert_eq!(map.topic_count(), 1);
    }

    #[test]
    fn item_identifier_clash_with_non_topic_is_rejected() {
        let mut map = TopicMap::new();
        let assoc = map
            .create_association(None, ScopeId::UNCONSTRAINED)
            .expect("assoc");
        map.add_item_identifier(assoc, loc("http://ii")).expect("add");

        let other = map
            .create_association(None, ScopeId::UNCONSTRAINED)
            .expect("assoc");
        let result = map.add_item_identifier(other, loc("http://ii"));
        assert!(matches!(result, Err(TomaError::IdentityClash(_))));
        // Graph unchanged: locator still resolves to the first association.
        assert_eq!(map.construct_by_item_identifier(&loc("http://ii")), Some(assoc));
    }

    #[test]
    fn item_identifier_vs_subject_identifier_cross_merge() {
        let mut map = TopicMap::new();
        let x = map.create_topic();
        map.add_subject_identifier(x, loc("http://u1")).expect("add");

        let y = map.create_topic();
        let survivor = map.add_item_identifier(y, loc("http://u1")).expect("add");
        assert_eq!(survivor, x);
        assert!(!map.contains(y));
    }

    #[test]
    fn ensure_topic_registers_cross_checked_item_identifier() {
        let mut map = TopicMap::new();
        let t = map.create_topic();
        map.add_subject_identifier(t, loc("http://u1")).expect("add");

        // The item identifier resolves through the cross-check onto the
        // subject-identified topic, and must still be registered.
        let resolved = map
            .ensure_topic(&IdentityRef::item_identifier("http://u1"))
            .expect("ensure");
        assert_eq!(resolved, t);
        assert_eq!(map.construct_by_item_identifier(&loc("http://u1")), Some(t));
        assert!(map.topic(t).expect("topic").item_identifiers.contains(&loc("http://u1")));
        assert_eq!(map.topic_count(), 1);
    }

    #[test]
    fn merge_log_is_capped() {
        let mut map = TopicMap::new();
        for i in 0..crate::primitives::MAX_MERGE_LOG + 10 {
            let a = map.create_topic();
            let b = map.create_topic();
            let shared = loc(&format!("http://pair/{i}"));
            map.add_subject_identifier(a, shared.clone()).expect("add");
            map.add_subject_identifier(b, shared).expect("merge");
        }
        assert_eq!(map.drain_merges().len(), crate::primitives::MAX_MERGE_LOG);
    }

    #[test]
    fn removing_identity_frees_the_locator() {
        let mut map = TopicMap::new();
        let t = map.create_topic();
        map.add_subject_identifier(t, loc("http://a")).expect("add");
        map.remove_subject_identifier(t, &loc("http://a")).expect("remove");
        assert_eq!(map.topic_by_subject_identifier(&loc("http://a")), None);

        // Another topic can now claim it without a merge.
        let u = map.create_topic();
        let survivor = map.add_subject_identifier(u, loc("http://a")).expect("add");
        assert_eq!(survivor, u);
        assert_eq!(map.topic_count(), 2);
    }

    #[test]
    fn map_root_can_carry_item_identifiers() {
        let mut map = TopicMap::new();
        let survivor = map
            .add_item_identifier(ConstructId::TOPIC_MAP, loc("http://map"))
            .expect("add");
        assert_eq!(survivor, ConstructId::TOPIC_MAP);
        assert_eq!(
            map.construct_by_item_identifier(&loc("http://map")),
            Some(ConstructId::TOPIC_MAP)
        );
    }

    #[test]
    fn occurrence_creation_feeds_all_indexes() {
        let mut map = TopicMap::new();
        let t = map.create_topic();
        let typ = map.create_topic();
        let theme = map.create_topic();
        let scope = map.intern_scope(&[theme]).expect("scope");
        let occ = map
            .create_occurrence(t, Some(typ), "1858-06-22", None, scope)
            .expect("occ");

        assert!(map.instances_of(typ).contains(&occ));
        assert!(map.scoped_by_theme(theme).contains(&occ));
        assert!(map.characteristics_by_value("1858-06-22", None).contains(&occ));
    }

    #[test]
    fn set_value_moves_literal_index_postings() {
        let mut map = TopicMap::new();
        let t = map.create_topic();
        let occ = map
            .create_occurrence(t, None, "old", None, ScopeId::UNCONSTRAINED)
            .expect("occ");
        map.set_value(occ, "new", None).expect("set");

        assert!(map.characteristics_by_value("old", None).is_empty());
        assert!(map.characteristics_by_value("new", None).contains(&occ));
    }

    #[test]
    fn reification_is_bidirectional_and_exclusive() {
        let mut map = TopicMap::new();
        let assoc = map
            .create_association(None, ScopeId::UNCONSTRAINED)
            .expect("assoc");
        let r1 = map.create_topic();
        let r2 = map.create_topic();

        map.set_reifier(assoc, Some(r1)).expect("reify");
        assert_eq!(map.reifier_of(assoc).expect("reifier"), Some(r1));
        assert_eq!(map.topic(r1).expect("topic").reified, Some(assoc));

        let conflict = map.set_reifier(assoc, Some(r2));
        assert!(matches!(conflict, Err(TomaError::ReificationConflict { .. })));
        // Unchanged after rejection.
        assert_eq!(map.reifier_of(assoc).expect("reifier"), Some(r1));
    }

    #[test]
    fn topic_reifying_two_constructs_is_rejected() {
        let mut map = TopicMap::new();
        let a1 = map
            .create_association(None, ScopeId::UNCONSTRAINED)
            .expect("assoc");
        let a2 = map
            .create_association(None, ScopeId::UNCONSTRAINED)
            .expect("assoc");
        let r = map.create_topic();
        map.set_reifier(a1, Some(r)).expect("reify");
        assert!(matches!(
            map.set_reifier(a2, Some(r)),
            Err(TomaError::ReificationConflict { .. })
        ));
    }

    #[test]
    fn topic_in_use_cannot_be_removed() {
        let mut map = TopicMap::new();
        let t = map.create_topic();
        let typ = map.create_topic();
        map.add_topic_type(t, typ).expect("type");

        assert!(matches!(
            map.remove_construct(typ),
            Err(TomaError::ConstructInUse(_))
        ));
        assert!(map.contains(typ));

        // Not in use after the edge is removed.
        map.remove_topic_type(t, typ).expect("untype");
        map.remove_construct(typ).expect("remove");
        assert!(!map.contains(typ));
    }

    #[test]
    fn removing_topic_cascades_to_characteristics() {
        let mut map = TopicMap::new();
        let t = map.create_topic();
        let occ = map
            .create_occurrence(t, None, "v", None, ScopeId::UNCONSTRAINED)
            .expect("occ");
        let name = map
            .create_name(t, None, "n", ScopeId::UNCONSTRAINED)
            .expect("name");
        let variant = map
            .create_variant(name, "vn", None, ScopeId::UNCONSTRAINED)
            .expect("variant");
        map.add_item_identifier(occ, loc("http://occ")).expect("ii");

        map.remove_construct(t).expect("remove");
        assert!(!map.contains(occ));
        assert!(!map.contains(name));
        assert!(!map.contains(variant));
        // Identifier freed for reuse.
        assert_eq!(map.construct_by_item_identifier(&loc("http://occ")), None);
    }

    #[test]
    fn removing_association_detaches_players() {
        let mut map = TopicMap::new();
        let t1 = map.create_topic();
        let t2 = map.create_topic();
        let typ = map.create_topic();
        let rt = map.create_topic();
        let assoc = map
            .create_association(Some(typ), ScopeId::UNCONSTRAINED)
            .expect("assoc");
        map.create_role(assoc, rt, t1).expect("role");
        map.create_role(assoc, rt, t2).expect("role");

        map.remove_construct(assoc).expect("remove");
        assert!(map.topic(t1).expect("t1").roles_played.is_empty());
        assert!(map.topic(t2).expect("t2").roles_played.is_empty());
        assert_eq!(map.association_count(), 0);
    }

    #[test]
    fn effective_scope_inherits_parent_name_themes() {
        let mut map = TopicMap::new();
        let t = map.create_topic();
        let name_theme = map.create_topic();
        let variant_theme = map.create_topic();
        let name_scope = map.intern_scope(&[name_theme]).expect("scope");
        let variant_scope = map.intern_scope(&[variant_theme]).expect("scope");
        let name = map.create_name(t, None, "n", name_scope).expect("name");
        let variant = map
            .create_variant(name, "v", None, variant_scope)
            .expect("variant");

        let effective = map.effective_scope(variant).expect("effective");
        assert!(effective.contains(&name_theme));
        assert!(effective.contains(&variant_theme));

        // Stored scope stays untouched.
        assert_eq!(map.variant(variant).expect("variant").scope, variant_scope);

        // Without inheritance, only the stored themes count.
        let mut flat = TopicMap::with_config(MapConfig {
            variant_scope_inheritance: false,
        });
        let t = flat.create_topic();
        let nt = flat.create_topic();
        let vt = flat.create_topic();
        let ns = flat.intern_scope(&[nt]).expect("scope");
        let vs = flat.intern_scope(&[vt]).expect("scope");
        let n = flat.create_name(t, None, "n", ns).expect("name");
        let v = flat.create_variant(n, "v", None, vs).expect("variant");
        let effective = flat.effective_scope(v).expect("effective");
        assert!(!effective.contains(&nt));
        assert!(effective.contains(&vt));
    }

    #[test]
    fn suspended_indexes_answer_after_reindex() {
        let mut map = TopicMap::new();
        let t = map.create_topic();
        let typ = map.create_topic();
        map.suspend_secondary_indexes();
        assert!(!map.indexes_live());

        map.add_topic_type(t, typ).expect("type");
        assert!(map.instances_of(typ).is_empty());

        map.reindex();
        assert!(map.indexes_live());
        assert!(map.instances_of(typ).contains(&t));
    }

    #[test]
    fn close_clears_everything() {
        let mut map = TopicMap::new();
        let t = map.create_topic();
        map.add_subject_identifier(t, loc("http://a")).expect("add");
        map.close();

        assert_eq!(map.construct_count(), 0);
        assert_eq!(map.topic_by_subject_identifier(&loc("http://a")), None);
    }
}
