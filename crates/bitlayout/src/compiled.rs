//! Compiled schema: the immutable output of the schema compiler.

use std::collections::BTreeMap;

use crate::{
    expr::Program,
    field::{ArraySize, FieldDescriptor, FieldKind},
    visitor::SchemaVisitor,
};

/// What a symbol names, which decides whether expressions may use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// Scalar field with a numeric value.
    Value,
    Array,
    Struct,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub path: String,
    /// Offset of the descriptor in the compiled schema.
    pub offset: usize,
    /// Position among named fields, in declaration order.
    pub ordinal: usize,
    pub kind: SymbolKind,
    /// Offset of the nearest enclosing structure array, if any.
    pub array_scope: Option<usize>,
}

/// Dot-qualified path to symbol map. Frozen once compilation completes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SymbolTable {
    entries: BTreeMap<String, Symbol>,
}

impl SymbolTable {
    pub(crate) fn insert(&mut self, symbol: Symbol) {
        self.entries.insert(symbol.path.clone(), symbol);
    }

    pub fn get(&self, path: &str) -> Option<&Symbol> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Symbols in declaration order.
    pub fn in_declaration_order(&self) -> Vec<&Symbol> {
        let mut symbols: Vec<&Symbol> = self.entries.values().collect();
        symbols.sort_by_key(|symbol| symbol.ordinal);
        symbols
    }
}

/// Ordered descriptor sequence with paired structure markers, plus its symbol table.
///
/// Immutable and free of side effects, so one schema may be executed
/// against any number of independent sources, from any number of threads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledSchema {
    fields: Vec<FieldDescriptor>,
    symbols: SymbolTable,
}

impl CompiledSchema {
    pub(crate) fn new(fields: Vec<FieldDescriptor>, symbols: SymbolTable) -> Self {
        CompiledSchema { fields, symbols }
    }

    /// Builds a schema from hand-made descriptors, without validation.
    ///
    /// Marker pairing is checked only when the schema is executed.
    pub fn from_descriptors(fields: Vec<FieldDescriptor>) -> Self {
        CompiledSchema {
            fields,
            symbols: SymbolTable::default(),
        }
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Descriptor declared under `path`.
    pub fn find(&self, path: &str) -> Option<&FieldDescriptor> {
        let symbol = self.symbols.get(&path.to_ascii_lowercase())?;
        self.fields.get(symbol.offset)
    }

    pub fn has_custom_fields(&self) -> bool {
        self.fields
            .iter()
            .any(|field| matches!(field.kind, FieldKind::Custom { .. }))
    }

    pub fn has_var_fields(&self) -> bool {
        self.fields
            .iter()
            .any(|field| matches!(field.kind, FieldKind::Var { .. }))
    }

    /// True if any expression needs an external value provider.
    pub fn has_external_names(&self) -> bool {
        self.programs().any(|program| program.external_names().next().is_some())
    }

    fn programs(&self) -> impl Iterator<Item = &Program> {
        self.fields.iter().flat_map(|field| {
            let array = match &field.array {
                Some(ArraySize::Expr(program)) => Some(program),
                _ => None,
            };
            let own = match &field.kind {
                FieldKind::Bits { width } => Some(width),
                FieldKind::Custom { extra, .. } | FieldKind::Var { extra } => extra.as_ref(),
                FieldKind::Val { expr } => Some(expr),
                FieldKind::Action { argument, .. } => argument.as_ref(),
                FieldKind::Primitive(_) | FieldKind::StructStart { .. } | FieldKind::StructEnd { .. } => {
                    None
                }
            };
            array.into_iter().chain(own)
        })
    }

    /// Walks the descriptors in order, calling one visitor method per descriptor.
    pub fn visit<V: SchemaVisitor + ?Sized>(&self, visitor: &mut V) {
        for (offset, field) in self.fields.iter().enumerate() {
            let name = field.name.as_ref();
            let array = field.array.as_ref();

            match &field.kind {
                FieldKind::StructStart { .. } => visitor.on_struct_start(offset, name, array),
                FieldKind::StructEnd { .. } => visitor.on_struct_end(offset, name),
                FieldKind::Primitive(kind) => {
                    visitor.on_primitive(offset, *kind, name, field.byte_order, array)
                }
                FieldKind::Bits { width } => visitor.on_bit_field(offset, name, width, array),
                FieldKind::Custom { type_info, extra } => visitor.on_custom(
                    offset,
                    type_info,
                    name,
                    field.byte_order,
                    field.reads_whole_stream(),
                    array,
                    extra.as_ref(),
                ),
                FieldKind::Var { .. } => visitor.on_var(offset, name, field.byte_order, array),
                FieldKind::Val { expr } => visitor.on_val(offset, name, expr),
                FieldKind::Action { kind, argument } => {
                    visitor.on_action(offset, *kind, argument.as_ref())
                }
            }
        }
    }
}
