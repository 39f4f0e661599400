//! Schema: compiled grammar plus the parser configuration it runs with.

use std::io::Read;

use crate::{
    compiled::CompiledSchema,
    compiler,
    config::ParserConfig,
    engine,
    errors::{CompileError, ParseError},
    handler::ExternalValueProvider,
    stream::BitStream,
    value::StructValue,
    visitor::SchemaVisitor,
};

/// A compiled schema ready to parse any number of sources.
///
/// Use [Schema::compile] (or [Schema::compile_with] for non-default options)
/// to build one from grammar text, then [Schema::parse] to read a source
/// into a [StructValue] tree. A `Schema` is immutable and can be shared
/// between threads.
#[derive(Debug, Clone)]
pub struct Schema {
    compiled: CompiledSchema,
    config: ParserConfig,
}

impl Schema {
    /// Compiles `grammar` with the default configuration.
    pub fn compile(grammar: &str) -> Result<Self, CompileError> {
        Self::compile_with(grammar, ParserConfig::default())
    }

    /// Compiles `grammar`; custom type names are those served by `config.custom_types`.
    pub fn compile_with(grammar: &str, config: ParserConfig) -> Result<Self, CompileError> {
        let compiled = compiler::compile(grammar, config.custom_types.as_deref())?;
        Ok(Self { compiled, config })
    }

    pub fn compiled(&self) -> &CompiledSchema {
        &self.compiled
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Parses `source` from its current position. Fails if an expression uses an external name.
    pub fn parse(&self, source: impl Read) -> Result<StructValue, ParseError> {
        self.run(source, None)
    }

    pub fn parse_bytes(&self, data: &[u8]) -> Result<StructValue, ParseError> {
        self.run(data, None)
    }

    /// Parses `source`, resolving `$name` references through `externals`.
    pub fn parse_with_externals(
        &self,
        source: impl Read,
        externals: &dyn ExternalValueProvider,
    ) -> Result<StructValue, ParseError> {
        self.run(source, Some(externals))
    }

    /// See [CompiledSchema::visit].
    pub fn visit<V: SchemaVisitor + ?Sized>(&self, visitor: &mut V) {
        self.compiled.visit(visitor);
    }

    fn run(
        &self,
        source: impl Read,
        externals: Option<&dyn ExternalValueProvider>,
    ) -> Result<StructValue, ParseError> {
        let mut stream = BitStream::new(source, self.config.bit_order, self.config.byte_order);
        engine::execute(&self.compiled, &mut stream, &self.config, externals)
    }
}

#[cfg(feature = "serde")]
impl TryFrom<crate::serde::SchemaDef> for Schema {
    type Error = CompileError;

    fn try_from(value: crate::serde::SchemaDef) -> Result<Self, Self::Error> {
        let mut config = ParserConfig::new();
        config
            .set_bit_order(value.bit_order.into())
            .set_byte_order(value.byte_order.into())
            .set_flags(value.flags);
        Schema::compile_with(&value.grammar, config)
    }
}
