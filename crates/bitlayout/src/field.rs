//! Field descriptors: one compiled declaration of a [crate::compiled::CompiledSchema].

use crate::{expr::Program, lexer::Position, order::ByteOrder};

/// Fixed-size primitive types built into the grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PrimitiveKind {
    /// One byte, non-zero is true.
    Bool,
    /// Signed 8-bit.
    Byte,
    /// Unsigned 8-bit.
    UByte,
    /// Signed 16-bit.
    Short,
    /// Unsigned 16-bit.
    UShort,
    /// Signed 32-bit.
    Int,
    /// Unsigned 32-bit.
    UInt,
    /// Signed 64-bit.
    Long,
}

impl PrimitiveKind {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        let kind = match keyword {
            "bool" => PrimitiveKind::Bool,
            "byte" => PrimitiveKind::Byte,
            "ubyte" => PrimitiveKind::UByte,
            "short" => PrimitiveKind::Short,
            "ushort" => PrimitiveKind::UShort,
            "int" => PrimitiveKind::Int,
            "uint" => PrimitiveKind::UInt,
            "long" => PrimitiveKind::Long,
            _ => return None,
        };
        Some(kind)
    }

    pub fn keyword(self) -> &'static str {
        match self {
            PrimitiveKind::Bool => "bool",
            PrimitiveKind::Byte => "byte",
            PrimitiveKind::UByte => "ubyte",
            PrimitiveKind::Short => "short",
            PrimitiveKind::UShort => "ushort",
            PrimitiveKind::Int => "int",
            PrimitiveKind::UInt => "uint",
            PrimitiveKind::Long => "long",
        }
    }

    /// Width in bytes on the wire.
    pub fn size_bytes(self) -> usize {
        match self {
            PrimitiveKind::Bool | PrimitiveKind::Byte | PrimitiveKind::UByte => 1,
            PrimitiveKind::Short | PrimitiveKind::UShort => 2,
            PrimitiveKind::Int | PrimitiveKind::UInt => 4,
            PrimitiveKind::Long => 8,
        }
    }
}

/// Name of a declared field together with its qualified path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct NamedFieldInfo {
    /// Name as declared, lowercase.
    pub name: String,
    /// Dot-qualified path through enclosing named structures.
    pub path: String,
    /// Offset of the descriptor inside the compiled schema.
    pub offset: usize,
}

/// Type information handed to a [crate::handler::CustomTypeHandler].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldTypeInfo {
    pub type_name: String,
    /// Byte order written in front of the declaration, if any.
    pub byte_order: Option<ByteOrder>,
}

/// Array clause of a declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArraySize {
    /// Element count computed from an expression, once per occurrence.
    Expr(Program),
    /// `[_]`: read elements until the source is exhausted.
    WholeStream,
}

/// Stream directive that reads no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// `align:n`: advance until the counter is a multiple of `n`.
    Align,
    /// `skip:n`: discard `n` bytes.
    Skip,
    /// `reset$$`: zero the position counter.
    ResetCounter,
}

impl ActionKind {
    pub fn keyword(self) -> &'static str {
        match self {
            ActionKind::Align => "align",
            ActionKind::Skip => "skip",
            ActionKind::ResetCounter => "reset$$",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Primitive(PrimitiveKind),
    /// Bit group; the width may exceed 8 bits.
    Bits { width: Program },
    Custom {
        type_info: FieldTypeInfo,
        extra: Option<Program>,
    },
    /// Field read by a [crate::handler::VarFieldHandler].
    Var { extra: Option<Program> },
    /// Computed value, no bytes consumed.
    Val { expr: Program },
    /// Opens a structure; `end` is the offset of the matching end marker.
    StructStart { end: usize },
    /// Closes the structure opened at `start`.
    StructEnd { start: usize },
    Action {
        kind: ActionKind,
        argument: Option<Program>,
    },
}

/// One compiled schema entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    pub kind: FieldKind,
    /// `None` for anonymous fields, structure end markers, and actions.
    pub name: Option<NamedFieldInfo>,
    /// Synthetic identity of anonymous value-producing fields.
    pub anonymous_id: Option<u32>,
    /// `None` inherits the stream's default byte order.
    pub byte_order: Option<ByteOrder>,
    pub array: Option<ArraySize>,
    /// Where the declaration starts in the grammar text.
    pub position: Position,
}

impl FieldDescriptor {
    pub fn new(kind: FieldKind) -> Self {
        FieldDescriptor {
            kind,
            name: None,
            anonymous_id: None,
            byte_order: None,
            array: None,
            position: Position::default(),
        }
    }

    /// Field path, synthetic identity, or the kind keyword, for messages and generators.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.path.clone();
        }
        if let Some(id) = self.anonymous_id {
            return format!("_afield{id}");
        }

        match &self.kind {
            FieldKind::Primitive(kind) => kind.keyword().to_string(),
            FieldKind::Bits { .. } => "bit".to_string(),
            FieldKind::Custom { type_info, .. } => type_info.type_name.clone(),
            FieldKind::Var { .. } => "var".to_string(),
            FieldKind::Val { .. } => "val".to_string(),
            FieldKind::StructStart { .. } | FieldKind::StructEnd { .. } => "{}".to_string(),
            FieldKind::Action { kind, .. } => kind.keyword().to_string(),
        }
    }

    pub fn is_array(&self) -> bool {
        self.array.is_some()
    }

    pub fn reads_whole_stream(&self) -> bool {
        matches!(self.array, Some(ArraySize::WholeStream))
    }
}
