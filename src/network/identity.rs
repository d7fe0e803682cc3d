//! Node identity generation
//!
//! Identities are random lowercase hex strings of a fixed length. The
//! generator is a trait object so tests (and deterministic deployments) can
//! plug in a seeded source.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::Mutex;

/// Length of a generated node identity, in characters
pub const NODE_ID_LENGTH: usize = 32;

/// Source of fresh node identities
pub trait IdGenerator: Send + Sync {
    fn generate(&self, len: usize) -> String;
}

/// Random hex identities backed by a `StdRng`
pub struct RandomIdGenerator {
    rng: Mutex<StdRng>,
}

impl RandomIdGenerator {
    /// Seeded from OS entropy
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sequence of identities for a given seed
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for RandomIdGenerator {
    fn generate(&self, len: usize) -> String {
        let mut bytes = vec![0u8; len.div_ceil(2)];
        match self.rng.lock() {
            Ok(mut rng) => rng.fill_bytes(&mut bytes),
            // A poisoned lock still holds a valid RNG state.
            Err(poisoned) => poisoned.into_inner().fill_bytes(&mut bytes),
        }

        let mut id = hex::encode(bytes);
        id.truncate(len);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_length_and_charset() {
        let gen = RandomIdGenerator::new();
        let id = gen.generate(NODE_ID_LENGTH);
        assert_eq!(id.len(), NODE_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        assert_eq!(gen.generate(7).len(), 7);
    }

    #[test]
    fn test_seeded_generator_is_deterministic() {
        let a = RandomIdGenerator::seeded(42);
        let b = RandomIdGenerator::seeded(42);

        let first = a.generate(NODE_ID_LENGTH);
        assert_eq!(first, b.generate(NODE_ID_LENGTH));
        assert_ne!(first, a.generate(NODE_ID_LENGTH));
    }

    #[test]
    fn test_unseeded_ids_differ() {
        let gen = RandomIdGenerator::new();
        assert_ne!(gen.generate(NODE_ID_LENGTH), gen.generate(NODE_ID_LENGTH));
    }
}
