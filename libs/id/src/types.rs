//! Typed ID definitions for engine records and registered resources.

use crate::{define_id, define_name, IdError};

/// Longest accepted resource or group name.
pub const MAX_NAME_LEN: usize = 64;

/// Validates an operator-assigned name.
pub fn validate_name(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    let len = s.chars().count();
    if len > MAX_NAME_LEN {
        return Err(IdError::TooLong {
            len,
            max: MAX_NAME_LEN,
        });
    }

    for (position, ch) in s.chars().enumerate() {
        if !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')) {
            return Err(IdError::InvalidCharacter { ch, position });
        }
    }

    Ok(())
}

// =============================================================================
// Registered resources
// =============================================================================

define_name!(ResourceId);
define_name!(GroupId);

// =============================================================================
// Engine-generated records
// =============================================================================

define_id!(ReservationId, "rsv");
define_id!(PipelineId, "pipe");
define_id!(RequestId, "req");

// =============================================================================
// Events
// =============================================================================

/// Event ID is a simple monotonic integer, not ULID-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    /// Creates a new EventId.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EventId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = u64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Tests
// =============================================================================
