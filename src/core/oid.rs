//! Object identifiers and their allocation
//!
//! Every backend object and index is named by a 128-bit [`ObjectId`]. Ids are
//! derived from the request URI by hashing (deterministic mode) or drawn at
//! random, then normalized so they never land in the range the backend
//! reserves for its own use:
//!
//! - The top 8 bits of the high word are cleared (the backend encodes the
//!   entity type there).
//! - Values below [`RESERVED_ID_LIMIT`] are shifted up by that limit.
//!
//! Collisions are resolved by re-salting the seed with a fixed prefix and the
//! attempt counter. [`CollisionRetry`] caps the number of attempts.

use crate::config::IdMode;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use xxhash_rust::xxh3::xxh3_128;

/// Mask that clears the entity-type byte of the high word
const TYPE_BITS_MASK: u128 = !(0xFFu128 << 120);

/// Ids strictly below this value are reserved by the backend
pub const RESERVED_ID_LIMIT: u128 = 0x10_0000;

/// Salt prefix mixed into the seed when resolving a collision
const COLLISION_SALT: &str = "uri_salt_";

/// Default retry bound for collision resolution
pub const MAX_COLLISION_RETRIES: u32 = 20;

/// 128-bit identifier of a backend object or index
///
/// The zero value means "no object" (e.g. the old id of a fresh create).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId(u128);

impl ObjectId {
    /// The "no object" id
    pub const ZERO: ObjectId = ObjectId(0);

    pub const fn from_u128(raw: u128) -> Self {
        ObjectId(raw)
    }

    pub const fn from_parts(hi: u64, lo: u64) -> Self {
        ObjectId(((hi as u128) << 64) | lo as u128)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn hi(&self) -> u64 {
        (self.0 >> 64) as u64
    }

    pub fn lo(&self) -> u64 {
        self.0 as u64
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// True if the id lies inside the backend-reserved range
    pub fn is_reserved(&self) -> bool {
        self.0 < RESERVED_ID_LIMIT || (self.0 & !TYPE_BITS_MASK) != 0
    }

    /// Normalize a raw 128-bit value into the application id range
    fn normalize(raw: u128) -> Self {
        let mut value = raw & TYPE_BITS_MASK;
        if value < RESERVED_ID_LIMIT {
            value += RESERVED_ID_LIMIT;
        }
        ObjectId(value)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.hi(), self.lo())
    }
}

impl FromStr for ObjectId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 32 {
            return Err(GatewayError::InvalidArgument(format!(
                "object id must be 32 hex digits, got {:?}",
                s
            )));
        }
        u128::from_str_radix(s, 16)
            .map(ObjectId)
            .map_err(|e| GatewayError::InvalidArgument(format!("bad object id {:?}: {}", s, e)))
    }
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Generates object ids from request seeds
#[derive(Debug, Clone)]
pub struct IdAllocator {
    mode: IdMode,
    max_retries: u32,
}

impl IdAllocator {
    pub fn new(mode: IdMode, max_retries: u32) -> Self {
        IdAllocator { mode, max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Generate the id for `seed` (normally the object URI)
    ///
    /// Deterministic mode always maps the same seed to the same id. Random
    /// mode ignores the seed.
    pub fn generate(&self, seed: &str) -> ObjectId {
        match self.mode {
            IdMode::Deterministic => ObjectId::normalize(xxh3_128(seed.as_bytes())),
            IdMode::Random => ObjectId::normalize(rand::random::<u128>()),
        }
    }

    /// Produce a replacement id after a collision on `previous`
    ///
    /// The seed is re-salted with the attempt counter; an inner salt counter
    /// guarantees the result differs from `previous`.
    pub fn resolve_collision(&self, seed: &str, previous: ObjectId, attempt: u32) -> ObjectId {
        let mut salt_counter = 0u32;
        loop {
            let salted = format!("{}{}{}{}", seed, COLLISION_SALT, salt_counter, attempt);
            let candidate = self.generate(&salted);
            if candidate != previous {
                return candidate;
            }
            salt_counter += 1;
        }
    }

    /// Start a bounded collision-retry sequence
    pub fn retry_sequence(&self) -> CollisionRetry {
        CollisionRetry {
            attempts: 0,
            max: self.max_retries,
        }
    }
}

/// Bounded collision retry counter for one create operation
#[derive(Debug, Clone)]
pub struct CollisionRetry {
    attempts: u32,
    max: u32,
}

impl CollisionRetry {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Next id after a collision on `previous`, or an error once the bound is hit
    pub fn next_id(
        &mut self,
        allocator: &IdAllocator,
        seed: &str,
        previous: ObjectId,
    ) -> Result<ObjectId> {
        if self.attempts >= self.max {
            return Err(GatewayError::CollisionRetriesExhausted {
                seed: seed.to_string(),
                attempts: self.attempts,
            });
        }
        let id = allocator.resolve_collision(seed, previous, self.attempts);
        self.attempts += 1;
        if self.attempts > 5 {
            tracing::info!(
                "Object ID collision happened {} times for {}",
                self.attempts,
                seed
            );
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deterministic() -> IdAllocator {
        IdAllocator::new(IdMode::Deterministic, MAX_COLLISION_RETRIES)
    }

    #[test]
    fn test_generate_is_deterministic() {
        let alloc = deterministic();
        let a = alloc.generate("/bucket/photos/cat.jpg");
        let b = alloc.generate("/bucket/photos/cat.jpg");
        let c = alloc.generate("/bucket/photos/dog.jpg");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_reserved());
    }

    #[test]
    fn test_normalize_moves_out_of_reserved_range() {
        assert_eq!(ObjectId::normalize(0), ObjectId(RESERVED_ID_LIMIT));
        assert_eq!(ObjectId::normalize(5), ObjectId(RESERVED_ID_LIMIT + 5));
        // Type byte is stripped before the range check
        let id = ObjectId::normalize(0xFFu128 << 120 | 7);
        assert_eq!(id, ObjectId(RESERVED_ID_LIMIT + 7));
        assert!(!id.is_reserved());
    }

    #[test]
    fn test_random_mode_stays_outside_reserved_range() {
        let alloc = IdAllocator::new(IdMode::Random, MAX_COLLISION_RETRIES);
        for _ in 0..1000 {
            assert!(!alloc.generate("ignored").is_reserved());
        }
    }

    #[test]
    fn test_resolve_collision_differs_per_attempt() {
        let alloc = deterministic();
        let base = alloc.generate("/b/k");
        let first = alloc.resolve_collision("/b/k", base, 0);
        let second = alloc.resolve_collision("/b/k", base, 1);
        assert_ne!(first, base);
        assert_ne!(second, base);
        assert_ne!(first, second);
    }

    #[test]
    fn test_retry_sequence_fails_after_bound() {
        let alloc = deterministic();
        let mut retry = alloc.retry_sequence();
        let mut current = alloc.generate("/b/k");
        let mut issued = 0;
        while let Ok(next) = retry.next_id(&alloc, "/b/k", current) {
            assert_ne!(next, current);
            current = next;
            issued += 1;
        }
        assert_eq!(issued, MAX_COLLISION_RETRIES);
        assert!(matches!(
            retry.next_id(&alloc, "/b/k", current),
            Err(GatewayError::CollisionRetriesExhausted { attempts: 20, .. })
        ));
    }

    #[test]
    fn test_display_round_trip() {
        let id = ObjectId::from_parts(0x0012_3456_789a_bcde, 0xdead_beef);
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<ObjectId>().unwrap(), id);
        assert!("xyz".parse::<ObjectId>().is_err());
    }
}
