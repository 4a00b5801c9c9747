//! Provides identifiers such as `ConglomId`.
use core::fmt;

/// Identifies a conglomerate: a base heap, a secondary index,
/// or a temporary heap owned by a statement.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct ConglomId(pub u64);

impl ConglomId {
    /// The magic conglomerate id used when a violation is remembered
    /// before the supporting index has been assigned its final id.
    ///
    /// Entries keyed by this id are later re-keyed by
    /// `associate_duplicates_with_conglomerate`.
    pub const UNDEFINED: Self = Self(u64::MAX);

    pub fn is_undefined(self) -> bool {
        self == Self::UNDEFINED
    }
}

/// A 0-based column position within a row.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct ColId(pub u32);

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct ConstraintId(pub u32);

/// Identifies a sort created through the transaction controller.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct SortId(pub u64);

/// The number a compiled plan assigns to each operator.
/// Current-row slots in the activation are keyed by it.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct ResultSetNumber(pub u32);

macro_rules! system_id {
    ($name:ident, $repr:ty) => {
        impl $name {
            pub fn idx(self) -> usize {
                self.0 as usize
            }
        }

        impl From<i32> for $name {
            fn from(value: i32) -> Self {
                Self(value as $repr)
            }
        }
        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                Self(value as $repr)
            }
        }
        impl From<usize> for $name {
            fn from(value: usize) -> Self {
                Self(value as $repr)
            }
        }
        impl From<$name> for usize {
            fn from(value: $name) -> Self {
                value.0 as usize
            }
        }
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}
system_id!(ConglomId, u64);
system_id!(ColId, u32);
system_id!(ConstraintId, u32);
system_id!(ResultSetNumber, u32);
system_id!(SortId, u64);

/// An opaque handle identifying a physical row in a base conglomerate.
///
/// Row locations are the join key between an index entry and its base row.
/// They are comparable so that they can be used as hash and btree keys,
/// but callers must not interpret the slot number.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct RowLocation {
    /// The conglomerate the row lives in.
    pub conglom: ConglomId,
    /// The slot of the row within the conglomerate.
    pub slot: u64,
}

impl RowLocation {
    pub const fn new(conglom: ConglomId, slot: u64) -> Self {
        Self { conglom, slot }
    }
}

impl fmt::Display for RowLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.conglom, self.slot)
    }
}
