//! # Secondary Indexes
//!
//! Reverse lookups kept consistent with the graph through the notification
//! bus: type → instances, theme → scoped constructs and literal value →
//! characteristics.
//!
//! Each index declares whether it is currently live. The secondary indexes
//! are maintained continuously under normal operation, but a bulk
//! structural change (map merge/copy) may suspend them; consumers — the
//! merge engine above all — must call `reindex` before trusting a
//! suspended index. The identity index is never suspended.

use crate::events::GraphObserver;
use crate::types::{ConstructId, ConstructKind, LiteralId};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// TYPE -> INSTANCES
// =============================================================================

/// Maps a type topic to every construct it types: topics via their type
/// set, associations/roles/occurrences/names via their type slot.
#[derive(Debug, Clone)]
pub struct TypeInstanceIndex {
    postings: BTreeMap<ConstructId, BTreeSet<ConstructId>>,
    live: bool,
}

impl Default for TypeInstanceIndex {
    fn default() -> Self {
        Self {
            postings: BTreeMap::new(),
            live: true,
        }
    }
}

impl TypeInstanceIndex {
    /// Create an empty, live index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every construct typed by `typ`, in deterministic order.
    #[must_use]
    pub fn instances_of(&self, typ: ConstructId) -> BTreeSet<ConstructId> {
        self.postings.get(&typ).cloned().unwrap_or_default()
    }

    /// Every topic currently used as a type.
    #[must_use]
    pub fn types(&self) -> Vec<ConstructId> {
        self.postings
            .iter()
            .filter(|(_, instances)| !instances.is_empty())
            .map(|(typ, _)| *typ)
            .collect()
    }

    /// Whether `typ` types anything at all.
    #[must_use]
    pub fn is_used_as_type(&self, typ: ConstructId) -> bool {
        self.postings
            .get(&typ)
            .is_some_and(|instances| !instances.is_empty())
    }

    /// Whether the index can be trusted without a rebuild.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Suspend continuous maintenance until the next rebuild.
    pub fn suspend(&mut self) {
        self.live = false;
    }

    /// Replace the postings with a full rebuild and mark the index live.
    pub fn rebuild(&mut self, postings: BTreeMap<ConstructId, BTreeSet<ConstructId>>) {
        self.postings = postings;
        self.live = true;
    }

    /// Drop all postings. Called when the map closes.
    pub fn clear(&mut self) {
        self.postings.clear();
        self.live = true;
    }
}

impl GraphObserver for TypeInstanceIndex {
    fn type_added(&mut self, construct: ConstructId, typ: ConstructId) {
        if self.live {
            self.postings.entry(typ).or_default().insert(construct);
        }
    }

    fn type_removed(&mut self, construct: ConstructId, typ: ConstructId) {
        if self.live
            && let Some(instances) = self.postings.get_mut(&typ)
        {
            instances.remove(&construct);
            if instances.is_empty() {
                self.postings.remove(&typ);
            }
        }
    }
}

// =============================================================================
// THEME -> SCOPED CONSTRUCTS
// =============================================================================

/// Maps a theme topic to every scoped construct whose scope contains it.
#[derive(Debug, Clone)]
pub struct ScopedIndex {
    postings: BTreeMap<ConstructId, BTreeSet<ConstructId>>,
    live: bool,
}

impl Default for ScopedIndex {
    fn default() -> Self {
        Self {
            postings: BTreeMap::new(),
            live: true,
        }
    }
}

impl ScopedIndex {
    /// Create an empty, live index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every scoped construct whose scope contains `theme`.
    #[must_use]
    pub fn by_theme(&self, theme: ConstructId) -> BTreeSet<ConstructId> {
        self.postings.get(&theme).cloned().unwrap_or_default()
    }

    /// Whether `theme` appears in any scope.
    #[must_use]
    pub fn is_used_as_theme(&self, theme: ConstructId) -> bool {
        self.postings
            .get(&theme)
            .is_some_and(|scoped| !scoped.is_empty())
    }

    /// Whether the index can be trusted without a rebuild.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Suspend continuous maintenance until the next rebuild.
    pub fn suspend(&mut self) {
        self.live = false;
    }

    /// Replace the postings with a full rebuild and mark the index live.
    pub fn rebuild(&mut self, postings: BTreeMap<ConstructId, BTreeSet<ConstructId>>) {
        self.postings = postings;
        self.live = true;
    }

    /// Drop all postings. Called when the map closes.
    pub fn clear(&mut self) {
        self.postings.clear();
        self.live = true;
    }
}

impl GraphObserver for ScopedIndex {
    fn theme_added(&mut self, construct: ConstructId, theme: ConstructId) {
        if self.live {
            self.postings.entry(theme).or_default().insert(construct);
        }
    }

    fn theme_removed(&mut self, construct: ConstructId, theme: ConstructId) {
        if self.live
            && let Some(scoped) = self.postings.get_mut(&theme)
        {
            scoped.remove(&construct);
            if scoped.is_empty() {
                self.postings.remove(&theme);
            }
        }
    }
}

// =============================================================================
// VALUE -> CHARACTERISTICS
// =============================================================================

/// Maps an interned literal to every characteristic carrying it.
#[derive(Debug, Clone)]
pub struct LiteralIndex {
    postings: BTreeMap<LiteralId, BTreeSet<ConstructId>>,
    live: bool,
}

impl Default for LiteralIndex {
    fn default() -> Self {
        Self {
            postings: BTreeMap::new(),
            live: true,
        }
    }
}

impl LiteralIndex {
    /// Create an empty, live index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every occurrence/name/variant carrying the literal.
    #[must_use]
    pub fn by_literal(&self, literal: LiteralId) -> BTreeSet<ConstructId> {
        self.postings.get(&literal).cloned().unwrap_or_default()
    }

    /// Whether the index can be trusted without a rebuild.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Suspend continuous maintenance until the next rebuild.
    pub fn suspend(&mut self) {
        self.live = false;
    }

    /// Replace the postings with a full rebuild and mark the index live.
    pub fn rebuild(&mut self, postings: BTreeMap<LiteralId, BTreeSet<ConstructId>>) {
        self.postings = postings;
        self.live = true;
    }

    /// Drop all postings. Called when the map closes.
    pub fn clear(&mut self) {
        self.postings.clear();
        self.live = true;
    }
}

impl GraphObserver for LiteralIndex {
    fn value_added(&mut self, construct: ConstructId, _kind: ConstructKind, literal: LiteralId) {
        if self.live {
            self.postings.entry(literal).or_default().insert(construct);
        }
    }

    fn value_removed(&mut self, construct: ConstructId, literal: LiteralId) {
        if self.live
            && let Some(carriers) = self.postings.get_mut(&literal)
        {
            carriers.remove(&construct);
            if carriers.is_empty() {
                self.postings.remove(&literal);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_index_tracks_add_and_remove() {
        let mut index = TypeInstanceIndex::new();
        index.type_added(ConstructId(5), ConstructId(1));
        index.type_added(ConstructId(6), ConstructId(1));
        assert_eq!(
            index.instances_of(ConstructId(1)),
            [ConstructId(5), ConstructId(6)].into_iter().collect()
        );
        assert!(index.is_used_as_type(ConstructId(1)));

        index.type_removed(ConstructId(5), ConstructId(1));
        index.type_removed(ConstructId(6), ConstructId(1));
        assert!(!index.is_used_as_type(ConstructId(1)));
        assert!(index.types().is_empty());
    }

    #[test]
    fn suspended_index_ignores_events_until_rebuilt() {
        let mut index = TypeInstanceIndex::new();
        index.suspend();
        assert!(!index.is_live());
        index.type_added(ConstructId(5), ConstructId(1));
        assert!(index.instances_of(ConstructId(1)).is_empty());

        let mut postings: BTreeMap<ConstructId, BTreeSet<ConstructId>> = BTreeMap::new();
        postings.entry(ConstructId(1)).or_default().insert(ConstructId(5));
        index.rebuild(postings);
        assert!(index.is_live());
        assert!(index.is_used_as_type(ConstructId(1)));
    }

    #[test]
    fn scoped_index_tracks_themes() {
        let mut index = ScopedIndex::new();
        index.theme_added(ConstructId(9), ConstructId(2));
        assert!(index.is_used_as_theme(ConstructId(2)));
        assert_eq!(
            index.by_theme(ConstructId(2)),
            [ConstructId(9)].into_iter().collect()
        );

        index.theme_removed(ConstructId(9), ConstructId(2));
        assert!(!index.is_used_as_theme(ConstructId(2)));
    }

    #[test]
    fn literal_index_tracks_values() {
        let mut index = LiteralIndex::new();
        index.value_added(ConstructId(3), ConstructKind::Occurrence, LiteralId(0));
        index.value_added(ConstructId(4), ConstructKind::Name, LiteralId(0));
        assert_eq!(index.by_literal(LiteralId(0)).len(), 2);

        index.value_removed(ConstructId(3), LiteralId(0));
        assert_eq!(
            index.by_literal(LiteralId(0)),
            [ConstructId(4)].into_iter().collect()
        );
    }
}
