//! Visitor contract for code generators, dump writers, and other consumers.
//!
//! [crate::compiled::CompiledSchema::visit] calls exactly one method per
//! descriptor, in declaration order, with structure markers paired.
//! Every method has an empty default so consumers override only what they need.

use crate::{
    expr::Program,
    field::{ActionKind, ArraySize, FieldTypeInfo, NamedFieldInfo, PrimitiveKind},
    order::ByteOrder,
};

#[allow(unused_variables)]
pub trait SchemaVisitor {
    fn on_struct_start(
        &mut self,
        offset: usize,
        name: Option<&NamedFieldInfo>,
        array_size: Option<&ArraySize>,
    ) {
    }

    fn on_struct_end(&mut self, offset: usize, name: Option<&NamedFieldInfo>) {}

    fn on_primitive(
        &mut self,
        offset: usize,
        kind: PrimitiveKind,
        name: Option<&NamedFieldInfo>,
        byte_order: Option<ByteOrder>,
        array_size: Option<&ArraySize>,
    ) {
    }

    fn on_bit_field(
        &mut self,
        offset: usize,
        name: Option<&NamedFieldInfo>,
        width: &Program,
        array_size: Option<&ArraySize>,
    ) {
    }

    #[allow(clippy::too_many_arguments)]
    fn on_custom(
        &mut self,
        offset: usize,
        type_info: &FieldTypeInfo,
        name: Option<&NamedFieldInfo>,
        byte_order: Option<ByteOrder>,
        read_whole_stream: bool,
        array_size: Option<&ArraySize>,
        extra_data: Option<&Program>,
    ) {
    }

    fn on_var(
        &mut self,
        offset: usize,
        name: Option<&NamedFieldInfo>,
        byte_order: Option<ByteOrder>,
        array_size: Option<&ArraySize>,
    ) {
    }

    fn on_val(&mut self, offset: usize, name: Option<&NamedFieldInfo>, expr: &Program) {}

    fn on_action(&mut self, offset: usize, kind: ActionKind, argument: Option<&Program>) {}
}
