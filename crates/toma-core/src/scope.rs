//! # Scope Interning
//!
//! Canonicalizes theme-sets: two scopes with the same themes are the same
//! handle, and the empty scope is the singleton [`ScopeId::UNCONSTRAINED`].
//! Theme order never matters; theme-sets are `BTreeSet`s.

use crate::types::{ConstructId, ScopeId};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// The interning table for theme-sets.
///
/// `ScopeId(0)` is always the empty scope; it exists from the moment the
/// table is created.
#[derive(Debug, Clone)]
pub struct ScopeTable {
    by_id: BTreeMap<ScopeId, BTreeSet<ConstructId>>,
    by_themes: BTreeMap<BTreeSet<ConstructId>, ScopeId>,
    next_id: u64,
}

impl Default for ScopeTable {
    fn default() -> Self {
        let empty = BTreeSet::new();
        let mut by_id = BTreeMap::new();
        let mut by_themes = BTreeMap::new();
        by_id.insert(ScopeId::UNCONSTRAINED, empty.clone());
        by_themes.insert(empty, ScopeId::UNCONSTRAINED);
        Self {
            by_id,
            by_themes,
            next_id: 1,
        }
    }
}

impl ScopeTable {
    /// Create a table holding only the unconstrained scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a theme-set, returning its canonical handle.
    pub fn intern(&mut self, themes: BTreeSet<ConstructId>) -> ScopeId {
        if let Some(&id) = self.by_themes.get(&themes) {
            return id;
        }
        let id = ScopeId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        self.by_themes.insert(themes.clone(), id);
        self.by_id.insert(id, themes);
        id
    }

    /// The theme-set behind a handle.
    ///
    /// Unknown handles resolve to the empty set; handles are only produced
    /// by this table, so a miss indicates a caller bug, not data loss.
    #[must_use]
    pub fn themes(&self, id: ScopeId) -> &BTreeSet<ConstructId> {
        static EMPTY: BTreeSet<ConstructId> = BTreeSet::new();
        self.by_id.get(&id).unwrap_or(&EMPTY)
    }

    /// Whether a scope contains a given theme.
    #[must_use]
    pub fn contains(&self, id: ScopeId, theme: ConstructId) -> bool {
        self.themes(id).contains(&theme)
    }

    /// Derive the scope with one theme added.
    pub fn with_theme(&mut self, id: ScopeId, theme: ConstructId) -> ScopeId {
        let mut themes = self.themes(id).clone();
        themes.insert(theme);
        self.intern(themes)
    }

    /// Derive the scope with one theme removed.
    pub fn without_theme(&mut self, id: ScopeId, theme: ConstructId) -> ScopeId {
        let mut themes = self.themes(id).clone();
        themes.remove(&theme);
        self.intern(themes)
    }

    /// Derive the scope with every occurrence of `old` replaced by `new`.
    ///
    /// Used by the merge engine to re-point theme references from a doomed
    /// topic to its survivor.
    pub fn replace_theme(&mut self, id: ScopeId, old: ConstructId, new: ConstructId) -> ScopeId {
        let mut themes = self.themes(id).clone();
        if themes.remove(&old) {
            themes.insert(new);
        }
        self.intern(themes)
    }

    /// Number of distinct interned scopes (including the empty scope).
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether only the unconstrained scope is interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.len() <= 1
    }

    /// Reset to holding only the unconstrained scope. Used on map close.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// =============================================================================
// TESTS
// =============================================================================
