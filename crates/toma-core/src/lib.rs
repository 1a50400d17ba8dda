//! # toma-core
//!
//! The deterministic Topic Maps engine for Toma - THE GRAPH.
//!
//! This crate implements an in-memory topic map store with identity-driven
//! merging: topics claiming the same identifier become one topic the
//! moment the claim is made, and everything hanging off the doomed topic
//! funnels onto the survivor.
//!
//! ## Architecture
//!
//! - `graph` owns every construct in one handle-keyed arena and is the
//!   sole mutator; every mutation publishes on a synchronous bus that
//!   keeps the identity and secondary indexes continuously consistent
//! - `merge` folds structural duplicates by signature and drives topic
//!   and whole-map merges
//! - `builder` is a streaming start/end protocol that survives merges
//!   firing in the middle of a half-built stream
//!
//! ## Constraints
//!
//! - Deterministic: ordered collections only, identical inputs give
//!   identical traversal orders
//! - Single-threaded per map: no internal locking, distinct maps share
//!   no mutable state
//! - No persistence: the map lives and dies in memory

// =============================================================================
// MODULES
// =============================================================================

pub mod builder;
pub mod events;
pub mod graph;
pub mod identity;
pub mod index;
pub mod literal;
pub mod merge;
pub mod primitives;
pub mod scope;
pub mod signature;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    ConstructId, ConstructKind, IdentityKind, IdentityRef, LiteralId, Locator, ScopeId, TomaError,
};

// =============================================================================
// RE-EXPORTS: Graph Engine
// =============================================================================

pub use builder::MapBuilder;
pub use events::{GraphEvent, GraphObserver};
pub use graph::{
    AssociationData, Construct, MapConfig, NameData, OccurrenceData, RoleData, TopicData,
    TopicMap, VariantData,
};
pub use identity::IdentityIndex;
pub use index::{LiteralIndex, ScopedIndex, TypeInstanceIndex};
pub use literal::{Literal, LiteralTable};
pub use merge::MergeEngine;
pub use scope::ScopeTable;
pub use signature::Signature;
