//! # Core Type Definitions
//!
//! This module contains the foundation types for the Toma engine:
//! - Construct handles (`ConstructId`) and the closed kind enum (`ConstructKind`)
//! - Locators and tagged identities (`Locator`, `IdentityKind`, `IdentityRef`)
//! - Error types (`TomaError`)
//!
//! ## Determinism Guarantees
//!
//! All types in this module:
//! - Use integer handles only (no floating-point, no pointers)
//! - Implement `Ord` for deterministic ordering in `BTreeMap`/`BTreeSet`
//! - Compare by value; reference identity plays no role anywhere

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// CONSTRUCT HANDLES
// =============================================================================

/// Stable, map-unique handle for a construct.
///
/// Every construct owned by a [`crate::TopicMap`] is addressed through its
/// handle; "references" between constructs are handle lookups through the
/// owning map. This makes "construct still belongs to this map" a checkable
/// invariant instead of an assumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConstructId(pub u64);

impl ConstructId {
    /// The reserved handle of the topic map root itself.
    pub const TOPIC_MAP: ConstructId = ConstructId(0);
}

/// The closed set of construct kinds.
///
/// Matched exhaustively everywhere; adding a kind is a compile error at
/// every dispatch site until handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConstructKind {
    TopicMap,
    Topic,
    Association,
    Role,
    Occurrence,
    Name,
    Variant,
}

// =============================================================================
// LOCATORS & IDENTITIES
// =============================================================================

/// An IRI reference, already normalized by the caller.
///
/// Locator parsing and normalization is an external collaborator's concern;
/// the engine treats locators as opaque, ordered, equal-by-string values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Locator(pub String);

impl Locator {
    /// Create a new locator from a string.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the locator as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate the locator against the engine's input limits.
    ///
    /// Returns `TomaError::InvalidInput` for empty or oversized locators.
    pub fn validate(&self) -> Result<(), TomaError> {
        if self.0.is_empty() {
            return Err(TomaError::InvalidInput("empty locator".to_string()));
        }
        if self.0.len() > crate::primitives::MAX_LOCATOR_LENGTH {
            return Err(TomaError::InvalidInput(format!(
                "locator exceeds {} bytes",
                crate::primitives::MAX_LOCATOR_LENGTH
            )));
        }
        Ok(())
    }
}

/// The three ways a locator can identify something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IdentityKind {
    /// Identifies the construct (the data node) itself.
    ItemIdentifier,
    /// Names the subject the topic is about.
    SubjectIdentifier,
    /// The subject *is* the resource at this locator.
    SubjectLocator,
}

/// A tagged identity as consumed by the streaming protocol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityRef {
    /// How the locator identifies.
    pub kind: IdentityKind,
    /// The identifying locator.
    pub locator: Locator,
}

impl IdentityRef {
    /// Create a new tagged identity.
    #[must_use]
    pub fn new(kind: IdentityKind, locator: Locator) -> Self {
        Self { kind, locator }
    }

    /// Item identifier helper.
    #[must_use]
    pub fn item_identifier(s: impl Into<String>) -> Self {
        Self::new(IdentityKind::ItemIdentifier, Locator::new(s))
    }

    /// Subject identifier helper.
    #[must_use]
    pub fn subject_identifier(s: impl Into<String>) -> Self {
        Self::new(IdentityKind::SubjectIdentifier, Locator::new(s))
    }

    /// Subject locator helper.
    #[must_use]
    pub fn subject_locator(s: impl Into<String>) -> Self {
        Self::new(IdentityKind::SubjectLocator, Locator::new(s))
    }
}

// =============================================================================
// INTERNED HANDLES
// =============================================================================

/// Handle of an interned `(value, datatype)` literal pair.
///
/// Equal pairs intern to the same handle, so value equality is handle
/// equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LiteralId(pub u64);

/// Handle of an interned theme-set.
///
/// Two scopes with the same theme-set get the same handle; the empty scope
/// is the canonical `ScopeId::UNCONSTRAINED`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ScopeId(pub u64);

impl ScopeId {
    /// The canonical empty scope ("valid in all contexts").
    pub const UNCONSTRAINED: ScopeId = ScopeId(0);
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors surfaced by the Toma engine.
///
/// - No silent failures
/// - Use `Result<T, TomaError>` for fallible operations
/// - The engine never panics; all errors are reported
///
/// Identity and reification errors are detected *before* any mutation: a
/// failed operation leaves the graph exactly as it was. Protocol errors
/// abort the whole streaming construction session.
#[derive(Debug, Error)]
pub enum TomaError {
    /// The streaming state machine received a call illegal in its current
    /// state. Fatal to the construction session.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Two constructs that cannot be merged claim the same identity.
    /// Only topics merge; everything else clashes.
    #[error("identity clash on {0:?}: already claimed by a non-mergeable construct")]
    IdentityClash(Locator),

    /// Two reification assertions that cannot coexist.
    #[error("reification conflict between {existing:?} and {incoming:?}")]
    ReificationConflict {
        existing: ConstructId,
        incoming: ConstructId,
    },

    /// Removal rejected: the topic is still used as type, player, theme or
    /// reifier.
    #[error("construct in use: {0:?}")]
    ConstructInUse(ConstructId),

    /// The handle does not address a construct owned by this map.
    #[error("construct not found: {0:?}")]
    ConstructNotFound(ConstructId),

    /// The construct exists but has the wrong kind for the operation.
    #[error("kind mismatch: expected {expected:?}, found {found:?}")]
    KindMismatch {
        expected: ConstructKind,
        found: ConstructKind,
    },

    /// Input rejected by validation (empty/oversized locator or value).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A structural invariant was violated. Indicates an engine bug; never
    /// expected in correct operation.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_ids_order_deterministically() {
        let mut ids = vec![ConstructId(3), ConstructId(1), ConstructId(2)];
        ids.sort();
        assert_eq!(ids, vec![ConstructId(1), ConstructId(2), ConstructId(3)]);
    }

    #[test]
    fn topic_map_handle_is_zero() {
        assert_eq!(ConstructId::TOPIC_MAP, ConstructId(0));
    }

    #[test]
    fn locator_equality_is_by_string() {
        assert_eq!(Locator::new("http://a"), Locator::new("http://a"));
        assert_ne!(Locator::new("http://a"), Locator::new("http://a/"));
    }

    #[test]
    fn locator_validation_rejects_empty() {
        assert!(Locator::new("").validate().is_err());
        assert!(Locator::new("http://example.org").validate().is_ok());
    }

    #[test]
    fn identity_ref_helpers_tag_correctly() {
        let si = IdentityRef::subject_identifier("http://a");
        assert_eq!(si.kind, IdentityKind::SubjectIdentifier);
        let sl = IdentityRef::subject_locator("http://a");
        assert_eq!(sl.kind, IdentityKind::SubjectLocator);
        let ii = IdentityRef::item_identifier("http://a");
        assert_eq!(ii.kind, IdentityKind::ItemIdentifier);
    }

    #[test]
    fn unconstrained_scope_is_default() {
        assert_eq!(ScopeId::default(), ScopeId::UNCONSTRAINED);
    }
}
