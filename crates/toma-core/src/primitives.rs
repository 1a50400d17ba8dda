//! # Innate Primitives
//!
//! Hardcoded constants for the Toma engine.
//!
//! The engine starts with zero data but fixed vocabulary: the TMDM published
//! subject identifiers (PSIs) and XML Schema datatype locators are compiled
//! into the binary and immutable at runtime.

// =============================================================================
// TMDM PUBLISHED SUBJECT IDENTIFIERS
// =============================================================================

/// PSI of the type-instance association type.
///
/// Associations of this type written in the legacy pattern are converted
/// into direct topic-type edges when a streaming session closes.
pub const PSI_TYPE_INSTANCE: &str = "http://psi.topicmaps.org/iso13250/model/type-instance";

/// PSI of the role held by the typing topic in a type-instance association.
pub const PSI_TYPE: &str = "http://psi.topicmaps.org/iso13250/model/type";

/// PSI of the role held by the typed topic in a type-instance association.
pub const PSI_INSTANCE: &str = "http://psi.topicmaps.org/iso13250/model/instance";

/// PSI of the default topic name type.
///
/// Names started without an explicit type in the streaming protocol are
/// typed with the topic carrying this PSI.
pub const PSI_TOPIC_NAME: &str = "http://psi.topicmaps.org/iso13250/model/topic-name";

// =============================================================================
// XML SCHEMA DATATYPES
// =============================================================================

/// Datatype locator of plain string values.
pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";

/// Datatype locator of locator-valued occurrences and variants.
pub const XSD_ANY_URI: &str = "http://www.w3.org/2001/XMLSchema#anyURI";

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length for locator strings.
///
/// Locators longer than this are rejected before any mutation.
/// This prevents memory exhaustion from malformed input.
pub const MAX_LOCATOR_LENGTH: usize = 4096;

/// Maximum length for literal value strings.
///
/// Values longer than this (64KB) are rejected before any mutation.
pub const MAX_VALUE_LENGTH: usize = 65536;

/// Maximum retained merge-log entries.
///
/// Consumers tracking handles across merges drain the log after every
/// operation, as the streaming builder does; the cap bounds memory on
/// maps driven without a drain. Oldest entries are dropped first.
pub const MAX_MERGE_LOG: usize = 4096;
