//! # Literal Interning
//!
//! Canonicalizes `(value, datatype)` pairs so that structurally equal
//! values are representationally identical. Duplicate detection on values
//! becomes handle comparison instead of deep string equality.
//!
//! The table holds interned entries for the lifetime of the map; literals
//! are cheap and removal never needs to reclaim them.

use crate::types::{LiteralId, Locator, TomaError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// LITERAL
// =============================================================================

/// An interned `(value, datatype)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Literal {
    /// The lexical value.
    pub value: String,
    /// Datatype locator (`xsd:string` for plain values, `xsd:anyURI` for
    /// locator values).
    pub datatype: Locator,
}

impl Literal {
    /// Create a literal from value and datatype.
    #[must_use]
    pub fn new(value: impl Into<String>, datatype: Locator) -> Self {
        Self {
            value: value.into(),
            datatype,
        }
    }

    /// Create a plain `xsd:string` literal.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::new(value, Locator::new(crate::primitives::XSD_STRING))
    }

    /// Create an `xsd:anyURI` literal from a locator.
    #[must_use]
    pub fn locator(value: &Locator) -> Self {
        Self::new(
            value.as_str(),
            Locator::new(crate::primitives::XSD_ANY_URI),
        )
    }
}

// =============================================================================
// LITERAL TABLE
// =============================================================================

/// The interning table for literals.
///
/// Equal `(value, datatype)` pairs intern to the same [`LiteralId`], which
/// is what makes O(log n) duplicate detection on values possible.
#[derive(Debug, Clone, Default)]
pub struct LiteralTable {
    by_id: BTreeMap<LiteralId, Literal>,
    by_literal: BTreeMap<Literal, LiteralId>,
    next_id: u64,
}

impl LiteralTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a literal, validating the value length.
    ///
    /// Returns the existing handle when an equal pair was interned before.
    pub fn intern(&mut self, literal: Literal) -> Result<LiteralId, TomaError> {
        if literal.value.len() > crate::primitives::MAX_VALUE_LENGTH {
            return Err(TomaError::InvalidInput(format!(
                "value exceeds {} bytes",
                crate::primitives::MAX_VALUE_LENGTH
            )));
        }
        literal.datatype.validate()?;
        if let Some(&id) = self.by_literal.get(&literal) {
            return Ok(id);
        }
        let id = LiteralId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        self.by_literal.insert(literal.clone(), id);
        self.by_id.insert(id, literal);
        Ok(id)
    }

    /// Look up an interned literal by handle.
    #[must_use]
    pub fn get(&self, id: LiteralId) -> Option<&Literal> {
        self.by_id.get(&id)
    }

    /// Look up the handle of an already-interned pair.
    #[must_use]
    pub fn lookup(&self, literal: &Literal) -> Option<LiteralId> {
        self.by_literal.get(literal).copied()
    }

    /// Number of distinct interned literals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Drop all interned literals. Used when closing a map.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_literal.clear();
        self.next_id = 0;
    }
}

// =============================================================================
// TESTS
// =============================================================================
