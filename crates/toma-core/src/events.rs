//! # Notification Bus
//!
//! In-process publish/subscribe between the graph store and its indexes.
//!
//! Dispatch is single-threaded, synchronous and same-call-stack: a mutation
//! method on [`crate::TopicMap`] publishes its event immediately after
//! applying the mutation and before returning, and every subscribed
//! observer runs to completion before the publishing call returns. Indexes
//! never observe a transiently inconsistent graph.
//!
//! The multiplier expands a composite add/remove — a construct spliced in
//! or taken out while already carrying identities, types, themes and a
//! value — into the fine-grained events for each nested fact, so indexes
//! built purely on fine-grained events stay correct during merge and bulk
//! copy. Multiplied events are delivered before the composite leaf event,
//! in deterministic order.

use crate::graph::Construct;
use crate::scope::ScopeTable;
use crate::types::{ConstructId, ConstructKind, IdentityKind, LiteralId, Locator};
use std::collections::BTreeMap;

// =============================================================================
// EVENTS
// =============================================================================

/// A structural-change event published by the graph store.
///
/// A closed tagged union, matched exhaustively by every observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    /// A construct entered the map.
    ConstructAdded { id: ConstructId, kind: ConstructKind },
    /// A construct left the map.
    ConstructRemoved { id: ConstructId, kind: ConstructKind },
    /// An identity was attached to a construct.
    IdentityAdded {
        construct: ConstructId,
        kind: IdentityKind,
        locator: Locator,
    },
    /// An identity was detached, freeing the locator for reuse.
    IdentityRemoved {
        construct: ConstructId,
        kind: IdentityKind,
        locator: Locator,
    },
    /// `typ` now types `construct` (topic type-set member or type slot).
    TypeAdded {
        construct: ConstructId,
        typ: ConstructId,
    },
    /// `typ` no longer types `construct`.
    TypeRemoved {
        construct: ConstructId,
        typ: ConstructId,
    },
    /// `theme` entered the scope of `construct`.
    ThemeAdded {
        construct: ConstructId,
        theme: ConstructId,
    },
    /// `theme` left the scope of `construct`.
    ThemeRemoved {
        construct: ConstructId,
        theme: ConstructId,
    },
    /// `reifier` now reifies `construct`.
    ReifierAdded {
        construct: ConstructId,
        reifier: ConstructId,
    },
    /// `reifier` no longer reifies `construct`.
    ReifierRemoved {
        construct: ConstructId,
        reifier: ConstructId,
    },
    /// `construct` now carries the literal value.
    ValueAdded {
        construct: ConstructId,
        kind: ConstructKind,
        literal: LiteralId,
    },
    /// `construct` no longer carries the literal value.
    ValueRemoved {
        construct: ConstructId,
        literal: LiteralId,
    },
}

// =============================================================================
// OBSERVER
// =============================================================================

/// A subscriber on the notification bus, one method per event category.
///
/// All methods default to no-ops so observers override only what they
/// index. `dispatch` routes a [`GraphEvent`] exhaustively; forgetting a
/// category when one is added is a compile error here, not a silent gap.
pub trait GraphObserver {
    fn construct_added(&mut self, _id: ConstructId, _kind: ConstructKind) {}
    fn construct_removed(&mut self, _id: ConstructId, _kind: ConstructKind) {}
    fn identity_added(&mut self, _construct: ConstructId, _kind: IdentityKind, _locator: &Locator) {
    }
    fn identity_removed(
        &mut self,
        _construct: ConstructId,
        _kind: IdentityKind,
        _locator: &Locator,
    ) {
    }
    fn type_added(&mut self, _construct: ConstructId, _typ: ConstructId) {}
    fn type_removed(&mut self, _construct: ConstructId, _typ: ConstructId) {}
    fn theme_added(&mut self, _construct: ConstructId, _theme: ConstructId) {}
    fn theme_removed(&mut self, _construct: ConstructId, _theme: ConstructId) {}
    fn reifier_added(&mut self, _construct: ConstructId, _reifier: ConstructId) {}
    fn reifier_removed(&mut self, _construct: ConstructId, _reifier: ConstructId) {}
    fn value_added(&mut self, _construct: ConstructId, _kind: ConstructKind, _literal: LiteralId) {}
    fn value_removed(&mut self, _construct: ConstructId, _literal: LiteralId) {}

    /// Route an event to its category handler.
    fn dispatch(&mut self, event: &GraphEvent) {
        match event {
            GraphEvent::ConstructAdded { id, kind } => self.construct_added(*id, *kind),
            GraphEvent::ConstructRemoved { id, kind } => self.construct_removed(*id, *kind),
            GraphEvent::IdentityAdded {
                construct,
                kind,
                locator,
            } => self.identity_added(*construct, *kind, locator),
            GraphEvent::IdentityRemoved {
                construct,
                kind,
                locator,
            } => self.identity_removed(*construct, *kind, locator),
            GraphEvent::TypeAdded { construct, typ } => self.type_added(*construct, *typ),
            GraphEvent::TypeRemoved { construct, typ } => self.type_removed(*construct, *typ),
            GraphEvent::ThemeAdded { construct, theme } => self.theme_added(*construct, *theme),
            GraphEvent::ThemeRemoved { construct, theme } => self.theme_removed(*construct, *theme),
            GraphEvent::ReifierAdded { construct, reifier } => {
                self.reifier_added(*construct, *reifier);
            }
            GraphEvent::ReifierRemoved { construct, reifier } => {
                self.reifier_removed(*construct, *reifier);
            }
            GraphEvent::ValueAdded {
                construct,
                kind,
                literal,
            } => self.value_added(*construct, *kind, *literal),
            GraphEvent::ValueRemoved { construct, literal } => {
                self.value_removed(*construct, *literal);
            }
        }
    }
}

// =============================================================================
// MULTIPLIER
// =============================================================================

/// Expand a composite addition into fine-grained events.
///
/// The construct at `id` is read from the arena *after* the splice; every
/// identity, type, theme, value and reifier fact it already carries is
/// re-emitted so that indexes fed only fine-grained events see them.
/// Children are not recursed into: they enter the arena through their own
/// `ConstructAdded` publications.
#[must_use]
pub fn expand_added(
    arena: &BTreeMap<ConstructId, Construct>,
    scopes: &ScopeTable,
    id: ConstructId,
) -> Vec<GraphEvent> {
    let Some(construct) = arena.get(&id) else {
        return Vec::new();
    };
    expand(construct, scopes, id, Direction::Added)
}

/// Expand a composite removal into fine-grained events.
///
/// The construct has already been detached from the arena; its facts are
/// read from the extracted value so indexes can unregister them.
#[must_use]
pub fn expand_removed(
    construct: &Construct,
    scopes: &ScopeTable,
    id: ConstructId,
) -> Vec<GraphEvent> {
    expand(construct, scopes, id, Direction::Removed)
}

#[derive(Clone, Copy)]
enum Direction {
    Added,
    Removed,
}

fn expand(
    construct: &Construct,
    scopes: &ScopeTable,
    id: ConstructId,
    direction: Direction,
) -> Vec<GraphEvent> {
    let mut out = Vec::new();
    let kind = construct.kind();

    let identity = |k: IdentityKind, locator: &Locator| match direction {
        Direction::Added => GraphEvent::IdentityAdded {
            construct: id,
            kind: k,
            locator: locator.clone(),
        },
        Direction::Removed => GraphEvent::IdentityRemoved {
            construct: id,
            kind: k,
            locator: locator.clone(),
        },
    };

    for locator in construct.item_identifiers() {
        out.push(identity(IdentityKind::ItemIdentifier, locator));
    }
    if let Construct::Topic(topic) = construct {
        for locator in &topic.subject_identifiers {
            out.push(identity(IdentityKind::SubjectIdentifier, locator));
        }
        for locator in &topic.subject_locators {
            out.push(identity(IdentityKind::SubjectLocator, locator));
        }
    }

    for typ in construct.types() {
        out.push(match direction {
            Direction::Added => GraphEvent::TypeAdded { construct: id, typ },
            Direction::Removed => GraphEvent::TypeRemoved { construct: id, typ },
        });
    }

    if let Some(scope) = construct.scope() {
        for &theme in scopes.themes(scope) {
            out.push(match direction {
                Direction::Added => GraphEvent::ThemeAdded {
                    construct: id,
                    theme,
                },
                Direction::Removed => GraphEvent::ThemeRemoved {
                    construct: id,
                    theme,
                },
            });
        }
    }

    if let Some(literal) = construct.value() {
        out.push(match direction {
            Direction::Added => GraphEvent::ValueAdded {
                construct: id,
                kind,
                literal,
            },
            Direction::Removed => GraphEvent::ValueRemoved {
                construct: id,
                literal,
            },
        });
    }

    if let Some(reifier) = construct.reifier() {
        out.push(match direction {
            Direction::Added => GraphEvent::ReifierAdded {
                construct: id,
                reifier,
            },
            Direction::Removed => GraphEvent::ReifierRemoved {
                construct: id,
                reifier,
            },
        });
    }

    out
}

// =============================================================================
// TESTS
// =============================================================================
