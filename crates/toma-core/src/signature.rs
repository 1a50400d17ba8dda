//! # Structural Signatures
//!
//! Equality keys for duplicate detection. Two constructs are duplicates
//! exactly when their signatures are equal; identities, reifiers and
//! children never participate.
//!
//! Signatures are plain `Ord` values so that folding passes can collect
//! them into `BTreeMap`s and walk candidates in a deterministic order.
//! They hold raw handles, so a signature is only comparable against
//! signatures computed from the same map at the same instant; any
//! mutation invalidates it.

use crate::graph::TopicMap;
use crate::types::{ConstructId, LiteralId, ScopeId, TomaError};

/// Structural equality key of one construct.
///
/// Variant signatures use the *stored* scope, not the effective scope:
/// folding only ever compares siblings under one name, whose inherited
/// themes are identical by construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Signature {
    Occurrence {
        typ: Option<ConstructId>,
        scope: ScopeId,
        value: LiteralId,
    },
    Name {
        typ: Option<ConstructId>,
        scope: ScopeId,
        value: LiteralId,
    },
    Variant {
        scope: ScopeId,
        value: LiteralId,
    },
    Role {
        typ: ConstructId,
        player: ConstructId,
    },
    Association {
        typ: Option<ConstructId>,
        scope: ScopeId,
        /// Role keys as sorted (type, player) pairs. Role order never
        /// matters; multiplicity does.
        roles: Vec<(ConstructId, ConstructId)>,
    },
}

/// Signature of an occurrence.
pub fn occurrence(map: &TopicMap, id: ConstructId) -> Result<Signature, TomaError> {
    let data = map.occurrence(id)?;
    Ok(Signature::Occurrence {
        typ: data.typ,
        scope: data.scope,
        value: data.value,
    })
}

/// Signature of a name.
pub fn name(map: &TopicMap, id: ConstructId) -> Result<Signature, TomaError> {
    let data = map.name(id)?;
    Ok(Signature::Name {
        typ: data.typ,
        scope: data.scope,
        value: data.value,
    })
}

/// Signature of a variant, over its stored scope.
pub fn variant(map: &TopicMap, id: ConstructId) -> Result<Signature, TomaError> {
    let data = map.variant(id)?;
    Ok(Signature::Variant {
        scope: data.scope,
        value: data.value,
    })
}

/// Signature of a role.
pub fn role(map: &TopicMap, id: ConstructId) -> Result<Signature, TomaError> {
    let data = map.role(id)?;
    Ok(Signature::Role {
        typ: data.typ,
        player: data.player,
    })
}

/// Signature of an association, role keys sorted.
pub fn association(map: &TopicMap, id: ConstructId) -> Result<Signature, TomaError> {
    let data = map.association(id)?;
    let mut roles = Vec::with_capacity(data.roles.len());
    for &r in &data.roles {
        let rd = map.role(r)?;
        roles.push((rd.typ, rd.player));
    }
    Ok(association_from_parts(data.typ, data.scope, roles))
}

/// Build an association signature from parts that are not (yet) in the
/// map. The map-merge copy pass uses this to probe for an existing
/// equivalent before creating anything.
#[must_use]
pub fn association_from_parts(
    typ: Option<ConstructId>,
    scope: ScopeId,
    mut roles: Vec<(ConstructId, ConstructId)>,
) -> Signature {
    roles.sort_unstable();
    Signature::Association { typ, scope, roles }
}
