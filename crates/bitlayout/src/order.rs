//! Bit and byte ordering options shared by the stream engine and the compiler.

/// Order in which the bits of a byte are consumed by sub-byte reads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitOrder {
    /// The most significant unread bit is consumed first.
    MsbFirst,
    /// The least significant unread bit is consumed first.
    #[default]
    LsbFirst,
}

/// Byte order of multi-byte values.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    /// Grammar prefix selecting this byte order (`>` or `<`).
    pub fn prefix(self) -> char {
        match self {
            ByteOrder::BigEndian => '>',
            ByteOrder::LittleEndian => '<',
        }
    }
}

#[cfg(feature = "serde")]
impl From<crate::serde::BitOrderDef> for BitOrder {
    fn from(value: crate::serde::BitOrderDef) -> Self {
        match value {
            crate::serde::BitOrderDef::MsbFirst => BitOrder::MsbFirst,
            crate::serde::BitOrderDef::LsbFirst => BitOrder::LsbFirst,
        }
    }
}

#[cfg(feature = "serde")]
impl From<crate::serde::ByteOrderDef> for ByteOrder {
    fn from(value: crate::serde::ByteOrderDef) -> Self {
        match value {
            crate::serde::ByteOrderDef::BigEndian => ByteOrder::BigEndian,
            crate::serde::ByteOrderDef::LittleEndian => ByteOrder::LittleEndian,
        }
    }
}
