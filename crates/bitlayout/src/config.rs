//! Parser configuration: orders, flags, and injected handlers.

use std::{fmt, sync::Arc};

use crate::{
    handler::{CustomTypeHandler, VarFieldHandler},
    order::{BitOrder, ByteOrder},
};

/// Behavior switches for the parse engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParserFlags {
    /// Stop quietly when the source is exhausted at the start of a field,
    /// returning the fields read so far.
    #[cfg_attr(feature = "serde", serde(default))]
    pub skip_remaining_fields_if_eof: bool,
}

/// Configuration used when compiling and executing a [crate::schema::Schema].
///
/// Use the builder-style setters to configure:
///
/// ```
/// use bitlayout::config::ParserConfig;
/// use bitlayout::order::{BitOrder, ByteOrder};
///
/// let mut config = ParserConfig::new();
/// config
///     .set_bit_order(BitOrder::MsbFirst)
///     .set_byte_order(ByteOrder::LittleEndian)
///     .set_skip_remaining_fields_if_eof(true);
/// assert!(config.flags.skip_remaining_fields_if_eof);
/// ```
#[derive(Clone, Default)]
pub struct ParserConfig {
    /// Bit order for sub-byte reads. Defaults to LSB-first.
    pub bit_order: BitOrder,
    /// Byte order for fields without a `<` or `>` prefix. Defaults to big-endian.
    pub byte_order: ByteOrder,
    pub flags: ParserFlags,
    /// Handler for type names that are not built in.
    pub custom_types: Option<Arc<dyn CustomTypeHandler>>,
    /// Handler for `var` fields.
    pub var_fields: Option<Arc<dyn VarFieldHandler>>,
}

impl ParserConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bit_order(&mut self, bit_order: BitOrder) -> &mut Self {
        self.bit_order = bit_order;
        self
    }

    pub fn set_byte_order(&mut self, byte_order: ByteOrder) -> &mut Self {
        self.byte_order = byte_order;
        self
    }

    pub fn set_flags(&mut self, flags: ParserFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    pub fn set_skip_remaining_fields_if_eof(&mut self, skip: bool) -> &mut Self {
        self.flags.skip_remaining_fields_if_eof = skip;
        self
    }

    pub fn set_custom_types(&mut self, handler: Arc<dyn CustomTypeHandler>) -> &mut Self {
        self.custom_types = Some(handler);
        self
    }

    pub fn set_var_fields(&mut self, handler: Arc<dyn VarFieldHandler>) -> &mut Self {
        self.var_fields = Some(handler);
        self
    }
}

impl fmt::Debug for ParserConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserConfig")
            .field("bit_order", &self.bit_order)
            .field("byte_order", &self.byte_order)
            .field("flags", &self.flags)
            .field(
                "custom_types",
                &self.custom_types.as_ref().map(|handler| handler.type_names()),
            )
            .field("var_fields", &self.var_fields.is_some())
            .finish()
    }
}
