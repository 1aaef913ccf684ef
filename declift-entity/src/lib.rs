//! Array-based data structures using densely numbered entity references as mapping keys.
//!
//! This crate defines a number of data structures based on densely numbered entity references:
//!
//! - The `EntityRef` trait should be implemented by types to be used as indexes into the
//!   containers here.
//! - The `entity_impl!` macro provides convenient defaults for types wrapping `u32` which are
//!   the norm.
//! - `PrimaryMap<K, V>` is used to keep track of a vector of entities, assigning a unique entity
//!   reference to each. A primary map is the sole allocator of its key space.
//! - `SecondaryMap<K, V>` associates secondary information with entities allocated by some
//!   primary map. Untouched entries read back as a default value.
//! - `PackedOption<K>` is an `Option<K>` that does not grow the in-memory representation,
//!   reserving one key as the `None` encoding.
//!
//! Entity references are plain `u32` newtypes. They are cheap to copy, trivially comparable, and
//! keep the containers free of interior pointers, which is what makes wholesale graph teardown a
//! single deallocation.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod iter;
mod keys;
mod map;
mod packed_option;
mod primary;

pub use self::iter::{Iter, IterMut};
pub use self::keys::Keys;
pub use self::map::SecondaryMap;
pub use self::packed_option::{PackedOption, ReservedValue};
pub use self::primary::PrimaryMap;

/// A type wrapping a small integer index should implement `EntityRef` so it can be used as the
/// key of a `PrimaryMap` or `SecondaryMap`.
pub trait EntityRef: Copy + Eq {
    /// Create a new entity reference from a small integer.
    /// This should crash if the requested index is not representable.
    fn new(index: usize) -> Self;

    /// Get the index that was used to create this entity reference.
    fn index(self) -> usize;
}

/// Macro which provides the common implementation of a 32-bit entity reference.
#[macro_export]
macro_rules! entity_impl {
    // Basic traits: EntityRef, ReservedValue, and accessors.
    ($entity:ident) => {
        impl $crate::EntityRef for $entity {
            #[inline]
            fn new(index: usize) -> Self {
                debug_assert!(index < (u32::MAX as usize));
                $entity(index as u32)
            }

            #[inline]
            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl $crate::ReservedValue for $entity {
            #[inline]
            fn reserved_value() -> $entity {
                $entity(u32::MAX)
            }

            #[inline]
            fn is_reserved_value(&self) -> bool {
                self.0 == u32::MAX
            }
        }

        impl $entity {
            /// Create a new entity reference from its number.
            ///
            /// This method is for use by the test and host glue code; normal allocation goes
            /// through a `PrimaryMap`.
            #[allow(dead_code, reason = "macro-provided API")]
            pub fn from_u32(x: u32) -> Self {
                debug_assert!(x < u32::MAX);
                $entity(x)
            }

            /// Return the underlying index value as a `u32`.
            #[allow(dead_code, reason = "macro-provided API")]
            pub fn as_u32(self) -> u32 {
                self.0
            }
        }
    };

    // Include basic traits and add a textual display prefix, e.g. `block12`.
    ($entity:ident, $display_prefix:expr) => {
        $crate::entity_impl!($entity);

        impl core::fmt::Display for $entity {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, concat!($display_prefix, "{}"), self.0)
            }
        }

        impl core::fmt::Debug for $entity {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                (self as &dyn core::fmt::Display).fmt(f)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq, Eq)]
    struct E(u32);
    entity_impl!(E, "e");

    #[test]
    fn ref_roundtrip() {
        let e = E::new(7);
        assert_eq!(e.index(), 7);
        assert_eq!(e.to_string(), "e7");
        assert!(!e.is_reserved_value());
        assert!(E::reserved_value().is_reserved_value());
    }
}
