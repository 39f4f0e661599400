//! JSON‑deserializable schema description.
//!
//! A [SchemaDef] bundles grammar text with the parser options it was written
//! for, so a layout can ship as a single configuration file and be turned
//! into a [crate::schema::Schema] with `TryFrom`.

use serde::{Deserialize, Serialize};

use crate::config::ParserFlags;

/// Bit order for sub‑byte reads.
#[derive(Debug, Deserialize, Serialize, Default, Clone, Copy, PartialEq, Eq)]
pub enum BitOrderDef {
    /// Most‑significant bit first.
    MsbFirst,
    #[default]
    /// Least‑significant bit first.
    LsbFirst,
}

/// Default byte order for multi‑byte fields.
#[derive(Debug, Deserialize, Serialize, Default, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrderDef {
    #[default]
    BigEndian,
    LittleEndian,
}

/// Top‑level schema definition.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchemaDef {
    /// Grammar text, e.g. `"ubyte len; byte [len] data;"`.
    pub grammar: String,
    #[serde(default)]
    pub bit_order: BitOrderDef,
    #[serde(default)]
    pub byte_order: ByteOrderDef,
    #[serde(default)]
    pub flags: ParserFlags,
}
