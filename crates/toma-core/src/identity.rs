//! # Identity Index
//!
//! Maintains the three identity mappings of a map:
//! subject-identifier → topic, subject-locator → topic and
//! item-identifier → construct (any kind).
//!
//! The index subscribes to identity events on the notification bus and is
//! always live: the store consults it *before* mutating, so a duplicate
//! registration for a different topic is reported as a merge requirement to
//! the caller rather than silently accepted, and a duplicate between
//! non-mergeable constructs is rejected before any change.
//!
//! The index holds handles only, never ownership; closing the map clears it.

use crate::events::GraphObserver;
use crate::types::{ConstructId, IdentityKind, Locator};
use std::collections::BTreeMap;

/// The identity lookup tables of one map.
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    subject_identifiers: BTreeMap<Locator, ConstructId>,
    subject_locators: BTreeMap<Locator, ConstructId>,
    item_identifiers: BTreeMap<Locator, ConstructId>,
}

impl IdentityIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a locator under one identity kind.
    #[must_use]
    pub fn resolve(&self, kind: IdentityKind, locator: &Locator) -> Option<ConstructId> {
        self.table(kind).get(locator).copied()
    }

    /// Total number of registered identities across all three kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subject_identifiers
            .len()
            .saturating_add(self.subject_locators.len())
            .saturating_add(self.item_identifiers.len())
    }

    /// Whether no identity is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration. Called when the map closes.
    pub fn clear(&mut self) {
        self.subject_identifiers.clear();
        self.subject_locators.clear();
        self.item_identifiers.clear();
    }

    fn table(&self, kind: IdentityKind) -> &BTreeMap<Locator, ConstructId> {
        match kind {
            IdentityKind::SubjectIdentifier => &self.subject_identifiers,
            IdentityKind::SubjectLocator => &self.subject_locators,
            IdentityKind::ItemIdentifier => &self.item_identifiers,
        }
    }

    fn table_mut(&mut self, kind: IdentityKind) -> &mut BTreeMap<Locator, ConstructId> {
        match kind {
            IdentityKind::SubjectIdentifier => &mut self.subject_identifiers,
            IdentityKind::SubjectLocator => &mut self.subject_locators,
            IdentityKind::ItemIdentifier => &mut self.item_identifiers,
        }
    }
}

impl GraphObserver for IdentityIndex {
    fn identity_added(&mut self, construct: ConstructId, kind: IdentityKind, locator: &Locator) {
        self.table_mut(kind).insert(locator.clone(), construct);
    }

    fn identity_removed(&mut self, construct: ConstructId, kind: IdentityKind, locator: &Locator) {
        // Only unregister if the entry still points at the sender; a merge
        // may already have re-registered the locator for the survivor.
        let table = self.table_mut(kind);
        if table.get(locator) == Some(&construct) {
            table.remove(locator);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
