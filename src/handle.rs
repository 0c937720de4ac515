//! Opaque dataspace handles
//!
//! Handles are fixed-width 128-bit identifiers with a canonical textual form
//! of 32 hex digits, no separators. The null handle is the all-zero value and
//! is never assigned to a dataspace.

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use crate::error::StorageError;

/// Opaque 128-bit dataspace identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle(pub u128);

impl Handle {
    /// The null handle; compares equal to the fixed all-zero value.
    pub const NULL: Handle = Handle(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Big-endian byte form used as the database key, so that byte-lexical
    /// ordering of keys coincides with numeric handle ordering.
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Handle {
        Handle(u128::from_be_bytes(bytes))
    }

    /// Bstream bucket index: low-order bits of the handle.
    pub fn bucket(&self, num_buckets: u32) -> u32 {
        debug_assert!(num_buckets.is_power_of_two());
        (self.0 as u32) & (num_buckets - 1)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for Handle {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Handle, StorageError> {
        if s.len() != 32 {
            return Err(StorageError::Invalid);
        }
        u128::from_str_radix(s, 16)
            .map(Handle)
            .map_err(|_| StorageError::Invalid)
    }
}

/// Mints fresh handles for dataspace creation when the caller does not place
/// one explicitly. Uniqueness is still verified against the dataspace
/// database at creation time; the generator only has to make collisions
/// unlikely.
pub struct HandleGenerator {
    rng: Mutex<Xoshiro256PlusPlus>,
}

impl HandleGenerator {
    pub fn new() -> Self {
        HandleGenerator {
            rng: Mutex::new(Xoshiro256PlusPlus::from_entropy()),
        }
    }

    /// Generate a non-null handle.
    pub fn generate(&self) -> Handle {
        let mut rng = self.rng.lock().unwrap();
        loop {
            let mut bytes = [0u8; 16];
            rng.fill_bytes(&mut bytes);
            let handle = Handle(u128::from_be_bytes(bytes));
            if !handle.is_null() {
                return handle;
            }
        }
    }
}

impl Default for HandleGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle() {
        assert!(Handle::NULL.is_null());
        assert!(!Handle(1).is_null());
        assert_eq!(Handle::NULL, Handle(0));
    }

    #[test]
    fn test_canonical_text_form() {
        let h = Handle(0x1);
        assert_eq!(h.to_string(), "00000000000000000000000000000001");
        assert_eq!("00000000000000000000000000000001".parse::<Handle>().unwrap(), h);

        let h = Handle(u128::MAX);
        assert_eq!(h.to_string(), "ffffffffffffffffffffffffffffffff");
    }

    #[test]
    fn test_text_form_rejects_bad_input() {
        assert!("1".parse::<Handle>().is_err());
        assert!("zz000000000000000000000000000001".parse::<Handle>().is_err());
    }

    #[test]
    fn test_byte_order_matches_numeric_order() {
        let a = Handle(5);
        let b = Handle(0x1_0000_0000);
        assert!(a.to_bytes() < b.to_bytes());
        assert_eq!(Handle::from_bytes(a.to_bytes()), a);
    }

    #[test]
    fn test_bucket_uses_low_bits() {
        assert_eq!(Handle(0x1234).bucket(1024), 0x234);
        assert_eq!(Handle(1024).bucket(1024), 0);
    }

    #[test]
    fn test_generator_never_returns_null() {
        let gen = HandleGenerator::new();
        for _ in 0..64 {
            assert!(!gen.generate().is_null());
        }
    }
}
