//! Machine registers viewed as bit-masked slices.
//!
//! The decompiler tracks several concurrently live sub-slices of one architectural register
//! (`AL` and `AH` inside `RAX` can hold unrelated values). A [`Register`] therefore names a byte
//! range inside a register id, and [`BitMask64`] is the derived bit mask the exec contexts use to
//! partition, compare and recombine those slices.

use core::fmt;

/// An architectural register id. The numbering is defined by the register factory of the target;
/// the core only requires ids to be stable and comparable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterId(u16);

impl RegisterId {
    /// Create a register id from the target's numbering.
    pub fn from_u16(id: u16) -> Self {
        Self(id)
    }

    /// The raw id value.
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Debug for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (self as &dyn fmt::Display).fmt(f)
    }
}

/// A 64-bit value mask covering a byte range of a register.
///
/// Masks are always byte-granular: produced from `(size, byte_offset)` pairs and recombined only
/// by the set operations below, so `ones` is always a multiple of 8 in one contiguous run per
/// slice (subtraction can split a run; the parts are handled separately by the callers).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BitMask64(u64);

impl BitMask64 {
    /// The empty mask.
    pub const ZERO: Self = Self(0);

    /// Build the mask of a `size`-byte slice starting `byte_offset` bytes into the register.
    pub fn from_size_offset(size: u8, byte_offset: u8) -> Self {
        debug_assert!(size > 0 && size as u32 + byte_offset as u32 <= 8);
        let ones = if size == 8 {
            u64::MAX
        } else {
            (1u64 << (u32::from(size) * 8)) - 1
        };
        Self(ones << (u32::from(byte_offset) * 8))
    }

    /// The raw mask value.
    pub fn value(self) -> u64 {
        self.0
    }

    /// Reconstitute a mask from a raw value. Used when intersecting or splitting masks.
    pub fn from_value(value: u64) -> Self {
        Self(value)
    }

    /// Is this the empty mask?
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Is every set bit of `self` also set in `other`?
    pub fn is_fully_contained_in(self, other: Self) -> bool {
        self.0 & other.0 == self.0
    }

    /// Do the two masks share any bits?
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// The bits of `self` that are also in `other`.
    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// The bits of `self` that are not in `other`.
    pub fn subtract(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// The union of both masks.
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Byte offset of the lowest covered byte. The mask must not be empty.
    pub fn low_byte_offset(self) -> u8 {
        debug_assert!(!self.is_zero());
        (self.0.trailing_zeros() / 8) as u8
    }

    /// Number of bytes covered by the mask.
    pub fn size_in_bytes(self) -> u8 {
        (self.0.count_ones() / 8) as u8
    }
}

impl fmt::Display for BitMask64 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for BitMask64 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (self as &dyn fmt::Display).fmt(f)
    }
}

/// A byte-range slice of an architectural register.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    /// The architectural register holding the slice.
    pub id: RegisterId,
    /// First byte of the slice within the register.
    pub byte_offset: u8,
    /// Width of the slice in bytes, 1 to 8.
    pub size: u8,
}

impl Register {
    /// Create a register slice.
    pub fn new(id: RegisterId, byte_offset: u8, size: u8) -> Self {
        debug_assert!(size > 0 && size as u32 + byte_offset as u32 <= 8);
        Self {
            id,
            byte_offset,
            size,
        }
    }

    /// A slice covering the low `size` bytes of the register.
    pub fn whole(id: RegisterId, size: u8) -> Self {
        Self::new(id, 0, size)
    }

    /// The value mask of this slice.
    pub fn mask(self) -> BitMask64 {
        BitMask64::from_size_offset(self.size, self.byte_offset)
    }

    /// Build the slice of `self`'s register covered by `mask`.
    pub fn with_mask(self, mask: BitMask64) -> Self {
        Self::new(self.id, mask.low_byte_offset(), mask.size_in_bytes())
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.byte_offset == 0 {
            write!(f, "{}:{}", self.id, self.size)
        } else {
            write!(f, "{}+{}:{}", self.id, self.byte_offset, self.size)
        }
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (self as &dyn fmt::Display).fmt(f)
    }
}

/// Provider of the distinguished registers of the target architecture.
///
/// The decompiler does not know the target's numbering; it asks the factory for the registers it
/// has to treat specially. Implementations are expected to be cheap and immutable.
pub trait RegisterFactory {
    /// The full-width stack pointer.
    fn stack_pointer(&self) -> Register;

    /// The full-width instruction pointer.
    fn instruction_pointer(&self) -> Register;

    /// Optional display name of a register id, used by the textual writer.
    fn register_name(&self, id: RegisterId) -> Option<&str> {
        let _ = id;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_construction() {
        assert_eq!(BitMask64::from_size_offset(8, 0).value(), u64::MAX);
        assert_eq!(BitMask64::from_size_offset(4, 0).value(), 0xffff_ffff);
        assert_eq!(BitMask64::from_size_offset(1, 1).value(), 0xff00);
    }

    #[test]
    fn mask_algebra() {
        let eax = BitMask64::from_size_offset(4, 0);
        let ah = BitMask64::from_size_offset(1, 1);
        assert!(ah.is_fully_contained_in(eax));
        assert!(!eax.is_fully_contained_in(ah));
        assert!(eax.intersects(ah));
        assert_eq!(eax.subtract(ah).value(), 0xffff_00ff);
        assert_eq!(ah.low_byte_offset(), 1);
        assert_eq!(ah.size_in_bytes(), 1);
    }

    #[test]
    fn slice_from_mask() {
        let id = RegisterId::from_u16(0);
        let rax = Register::whole(id, 8);
        let ah = rax.with_mask(BitMask64::from_size_offset(1, 1));
        assert_eq!(ah.byte_offset, 1);
        assert_eq!(ah.size, 1);
        assert_eq!(ah.mask().value(), 0xff00);
    }
}
