//! Parse engine: runs a [CompiledSchema] against a [BitStream].
//!
//! Descriptors are executed in order. Structures are tracked on an explicit
//! frame stack; a structure array jumps back to the first descriptor of its
//! body until its element count is reached or the source is exhausted.

use std::mem;

use tracing::{debug, instrument, trace};

use crate::{
    compiled::CompiledSchema,
    config::ParserConfig,
    errors::{ExprError, HandlerError, ParseError, ReadError},
    expr::{EvalContext, FieldRef, Program},
    field::{ActionKind, ArraySize, FieldDescriptor, FieldKind, NamedFieldInfo},
    handler::{CustomFieldRequest, ExternalValueProvider, VarFieldRequest},
    order::BitOrder,
    stream::{ArrayLength, BitStream, MAX_PREALLOCATED},
    value::{ArrayValue, FieldValue, ParsedField, ScalarValue, StructValue},
};

/// Executes `schema` against `stream` and returns the root structure.
///
/// Parsing is all-or-nothing: on error no partial tree is returned. The
/// only exception is [crate::config::ParserFlags::skip_remaining_fields_if_eof],
/// which ends the parse quietly when the source runs dry at a field boundary.
#[instrument(skip_all, fields(descriptors = schema.len()))]
pub fn execute(
    schema: &CompiledSchema,
    stream: &mut BitStream<'_>,
    config: &ParserConfig,
    externals: Option<&dyn ExternalValueProvider>,
) -> Result<StructValue, ParseError> {
    let engine = Engine {
        schema,
        config,
        externals,
        slots: vec![None; schema.len()],
        frames: Vec::new(),
        root: Vec::new(),
    };

    let root = engine.run(stream)?;
    debug!(fields = root.len(), counter = stream.counter(), "parse finished");
    Ok(root)
}

/// How often a structure body runs.
enum Repeat {
    Once,
    Times {
        remaining: usize,
        items: Vec<FieldValue>,
    },
    UntilExhausted {
        items: Vec<FieldValue>,
        /// Stream bit position when the current element started.
        mark: u64,
    },
}

struct Frame {
    start: usize,
    name: Option<NamedFieldInfo>,
    fields: Vec<ParsedField>,
    repeat: Repeat,
}

impl Frame {
    /// Value of a frame closed early by exhaustion; a non-empty element in progress is kept.
    fn into_partial(self) -> FieldValue {
        let element = StructValue::new(self.fields);
        match self.repeat {
            Repeat::Once => FieldValue::Struct(element),
            Repeat::Times { mut items, .. } | Repeat::UntilExhausted { mut items, .. } => {
                if !element.is_empty() {
                    items.push(FieldValue::Struct(element));
                }
                FieldValue::Array(ArrayValue::new(items))
            }
        }
    }
}

/// Values visible to expressions during one evaluation.
struct Env<'e> {
    slots: &'e [Option<i64>],
    externals: Option<&'e dyn ExternalValueProvider>,
    counter: u64,
}

impl EvalContext for Env<'_> {
    fn field_value(&self, field: &FieldRef) -> Option<i64> {
        self.slots.get(field.offset).copied().flatten()
    }

    fn external_value(&self, name: &str) -> Option<i64> {
        self.externals?.value_of(name)
    }

    fn counter(&self) -> u64 {
        self.counter
    }
}

struct Engine<'s> {
    schema: &'s CompiledSchema,
    config: &'s ParserConfig,
    externals: Option<&'s dyn ExternalValueProvider>,
    /// Latest scalar value per descriptor offset.
    slots: Vec<Option<i64>>,
    frames: Vec<Frame>,
    root: Vec<ParsedField>,
}

fn consumes_input(kind: &FieldKind) -> bool {
    matches!(
        kind,
        FieldKind::Primitive(_)
            | FieldKind::Bits { .. }
            | FieldKind::Custom { .. }
            | FieldKind::Var { .. }
            | FieldKind::StructStart { .. }
    )
}

fn read_error(field: &FieldDescriptor, stream: &BitStream<'_>, source: ReadError) -> ParseError {
    ParseError::Read {
        field: field.display_name(),
        position: stream.counter(),
        source,
    }
}

fn handler_error(field: &FieldDescriptor, stream: &BitStream<'_>, err: HandlerError) -> ParseError {
    match err {
        HandlerError::Read(source) => read_error(field, stream, source),
        HandlerError::Invalid(message) => ParseError::Handler {
            field: field.display_name(),
            message,
        },
    }
}

/// Reads a bit group of `width` bits (`1..=64`) as a run of sub-byte reads.
fn read_bit_group(stream: &mut BitStream<'_>, width: u32) -> Result<u64, ReadError> {
    let mut value = 0u64;
    let mut done = 0u32;

    while done < width {
        let chunk = (width - done).min(8);
        let part = stream.read_bits(chunk as u8)? as u64;
        match stream.bit_order() {
            BitOrder::MsbFirst => value = (value << chunk) | part,
            BitOrder::LsbFirst => value |= part << done,
        }
        done += chunk;
    }

    Ok(value)
}

impl<'s> Engine<'s> {
    fn run(mut self, stream: &mut BitStream<'_>) -> Result<StructValue, ParseError> {
        let schema = self.schema;
        let fields = schema.fields();
        let skip_if_eof = self.config.flags.skip_remaining_fields_if_eof;
        let mut pc = 0;

        while pc < fields.len() {
            let field = &fields[pc];
            trace!(offset = pc, field = %field.display_name(), counter = stream.counter(), "descriptor");

            if skip_if_eof && consumes_input(&field.kind) && !self.has_data(stream, field)? {
                debug!(offset = pc, "source exhausted, skipping remaining fields");
                return Ok(self.unwind());
            }

            pc = match &field.kind {
                FieldKind::StructStart { end } => self.open_struct(stream, pc, *end)?,
                FieldKind::StructEnd { start } => self.close_struct(stream, pc, *start)?,
                FieldKind::Action { kind, argument } => {
                    self.action(stream, field, *kind, argument.as_ref())?;
                    pc + 1
                }
                _ => {
                    let value = self.read_value(stream, pc, field)?;
                    self.members().push(ParsedField {
                        name: field.name.clone(),
                        value,
                    });
                    pc + 1
                }
            };
        }

        if let Some(frame) = self.frames.last() {
            return Err(ParseError::StructuralViolation {
                offset: frame.start,
                message: "structure is never closed".to_string(),
            });
        }

        Ok(StructValue::new(self.root))
    }

    fn members(&mut self) -> &mut Vec<ParsedField> {
        match self.frames.last_mut() {
            Some(frame) => &mut frame.fields,
            None => &mut self.root,
        }
    }

    /// Closes every open frame with what it holds so far.
    fn unwind(mut self) -> StructValue {
        while let Some(frame) = self.frames.pop() {
            let name = frame.name.clone();
            let value = frame.into_partial();
            self.members().push(ParsedField { name, value });
        }
        StructValue::new(self.root)
    }

    fn has_data(&self, stream: &mut BitStream<'_>, field: &FieldDescriptor) -> Result<bool, ParseError> {
        stream
            .has_available_data()
            .map_err(|err| read_error(field, stream, err))
    }

    fn evaluate(
        &self,
        stream: &BitStream<'_>,
        field: &FieldDescriptor,
        program: &Program,
    ) -> Result<i64, ParseError> {
        let env = Env {
            slots: &self.slots,
            externals: self.externals,
            counter: stream.counter(),
        };
        program
            .evaluate(&env)
            .map_err(|source: ExprError| ParseError::Expression {
                field: field.display_name(),
                position: stream.counter(),
                source,
            })
    }

    /// Evaluates the array clause once for this occurrence.
    fn array_length(
        &self,
        stream: &BitStream<'_>,
        field: &FieldDescriptor,
    ) -> Result<Option<ArrayLength>, ParseError> {
        match &field.array {
            None => Ok(None),
            Some(ArraySize::WholeStream) => Ok(Some(ArrayLength::Remaining)),
            Some(ArraySize::Expr(program)) => {
                let length = self.evaluate(stream, field, program)?;
                if length < 0 {
                    return Err(ParseError::NegativeArrayLength {
                        field: field.display_name(),
                        length,
                    });
                }
                let length = usize::try_from(length).unwrap_or(usize::MAX);
                Ok(Some(ArrayLength::Fixed(length)))
            }
        }
    }

    fn open_struct(&mut self, stream: &mut BitStream<'_>, pc: usize, end: usize) -> Result<usize, ParseError> {
        let schema = self.schema;
        let field = &schema.fields()[pc];

        let paired = matches!(
            schema.fields().get(end).map(|end_field| &end_field.kind),
            Some(FieldKind::StructEnd { start }) if *start == pc
        );
        if !paired {
            return Err(ParseError::StructuralViolation {
                offset: pc,
                message: format!("recorded end {end} is not the matching end marker"),
            });
        }

        let repeat = match self.array_length(stream, field)? {
            None => Repeat::Once,
            Some(ArrayLength::Fixed(0)) => return Ok(self.empty_struct_array(field, end)),
            Some(ArrayLength::Fixed(count)) => Repeat::Times {
                remaining: count,
                items: Vec::with_capacity(count.min(MAX_PREALLOCATED)),
            },
            Some(ArrayLength::Remaining) => {
                if !self.has_data(stream, field)? {
                    return Ok(self.empty_struct_array(field, end));
                }
                Repeat::UntilExhausted {
                    items: Vec::new(),
                    mark: stream.bit_position(),
                }
            }
        };

        self.frames.push(Frame {
            start: pc,
            name: field.name.clone(),
            fields: Vec::new(),
            repeat,
        });

        Ok(pc + 1)
    }

    fn empty_struct_array(&mut self, field: &FieldDescriptor, end: usize) -> usize {
        self.members().push(ParsedField {
            name: field.name.clone(),
            value: FieldValue::Array(ArrayValue::default()),
        });
        end + 1
    }

    fn close_struct(&mut self, stream: &mut BitStream<'_>, pc: usize, start: usize) -> Result<usize, ParseError> {
        let schema = self.schema;
        let field = &schema.fields()[pc];

        let Some(frame) = self.frames.last() else {
            return Err(ParseError::StructuralViolation {
                offset: pc,
                message: "end marker without an open structure".to_string(),
            });
        };
        if frame.start != start {
            return Err(ParseError::StructuralViolation {
                offset: pc,
                message: format!(
                    "end marker closes {start} but the innermost open structure is {}",
                    frame.start
                ),
            });
        }

        let more = match frame.repeat {
            Repeat::UntilExhausted { mark, .. } => {
                if stream.bit_position() == mark {
                    return Err(ParseError::StructuralViolation {
                        offset: start,
                        message: "read-to-end structure array consumed no input".to_string(),
                    });
                }
                self.has_data(stream, field)?
            }
            _ => false,
        };
        let next_mark = stream.bit_position();

        let Some(frame) = self.frames.last_mut() else {
            return Ok(pc + 1);
        };
        let element = FieldValue::Struct(StructValue::new(mem::take(&mut frame.fields)));

        let finished = match &mut frame.repeat {
            Repeat::Once => Some(element),
            Repeat::Times { remaining, items } => {
                items.push(element);
                *remaining -= 1;
                (*remaining == 0).then(|| FieldValue::Array(ArrayValue::new(mem::take(items))))
            }
            Repeat::UntilExhausted { items, mark } => {
                items.push(element);
                *mark = next_mark;
                (!more).then(|| FieldValue::Array(ArrayValue::new(mem::take(items))))
            }
        };

        match finished {
            None => {
                trace!(offset = start, "next structure array element");
                Ok(start + 1)
            }
            Some(value) => {
                if let Some(frame) = self.frames.pop() {
                    self.members().push(ParsedField {
                        name: frame.name,
                        value,
                    });
                }
                Ok(pc + 1)
            }
        }
    }

    fn action(
        &self,
        stream: &mut BitStream<'_>,
        field: &FieldDescriptor,
        kind: ActionKind,
        argument: Option<&Program>,
    ) -> Result<(), ParseError> {
        let value = match argument {
            Some(program) => self.evaluate(stream, field, program)?,
            None => 1,
        };
        if value < 0 {
            return Err(ParseError::InvalidActionArgument {
                action: kind.keyword(),
                value,
            });
        }

        let result = match kind {
            ActionKind::Align => stream.align(value as u64),
            ActionKind::Skip => stream.skip(value as u64),
            ActionKind::ResetCounter => {
                stream.reset_counter();
                Ok(())
            }
        };
        result.map_err(|err| read_error(field, stream, err))
    }

    fn read_value(
        &mut self,
        stream: &mut BitStream<'_>,
        pc: usize,
        field: &FieldDescriptor,
    ) -> Result<FieldValue, ParseError> {
        let length = self.array_length(stream, field)?;

        let value = match &field.kind {
            FieldKind::Primitive(kind) => match length {
                None => stream
                    .read_scalar(*kind, field.byte_order)
                    .map(FieldValue::Scalar),
                Some(length) => stream
                    .read_array(*kind, length, field.byte_order)
                    .map(|values| FieldValue::Array(ArrayValue::from_scalars(values))),
            }
            .map_err(|err| read_error(field, stream, err))?,

            FieldKind::Bits { width } => {
                let width = self.evaluate(stream, field, width)?;
                if !(1..=64).contains(&width) {
                    return Err(ParseError::InvalidBitWidth {
                        field: field.display_name(),
                        width,
                    });
                }
                self.read_bits(stream, width as u32, length)
                    .map_err(|err| read_error(field, stream, err))?
            }

            FieldKind::Custom { type_info, extra } => {
                let Some(handler) = self.config.custom_types.as_deref() else {
                    return Err(ParseError::MissingHandler {
                        kind: "custom type",
                        field: field.display_name(),
                    });
                };
                let extra_data = match extra {
                    Some(program) => self.evaluate(stream, field, program)?,
                    None => 0,
                };
                let request = CustomFieldRequest {
                    bit_order: stream.bit_order(),
                    flags: self.config.flags,
                    type_info,
                    name: field.name.as_ref(),
                    extra_data,
                    read_whole_stream: length == Some(ArrayLength::Remaining),
                    array_length: match length {
                        Some(ArrayLength::Fixed(count)) => Some(count),
                        _ => None,
                    },
                };
                match handler.read(stream, &request) {
                    Ok(value) => value,
                    Err(err) => return Err(handler_error(field, stream, err)),
                }
            }

            FieldKind::Var { extra } => {
                let Some(handler) = self.config.var_fields.as_deref() else {
                    return Err(ParseError::MissingHandler {
                        kind: "var field",
                        field: field.display_name(),
                    });
                };
                let extra_data = match extra {
                    Some(program) => self.evaluate(stream, field, program)?,
                    None => 0,
                };
                let request = VarFieldRequest {
                    bit_order: stream.bit_order(),
                    byte_order: field.byte_order.unwrap_or(stream.byte_order()),
                    flags: self.config.flags,
                    name: field.name.as_ref(),
                    extra_data,
                    read_whole_stream: length == Some(ArrayLength::Remaining),
                    array_length: match length {
                        Some(ArrayLength::Fixed(count)) => Some(count),
                        _ => None,
                    },
                };
                match handler.read(stream, &request) {
                    Ok(value) => value,
                    Err(err) => return Err(handler_error(field, stream, err)),
                }
            }

            FieldKind::Val { expr } => {
                FieldValue::Scalar(ScalarValue::Long(self.evaluate(stream, field, expr)?))
            }

            FieldKind::StructStart { .. } | FieldKind::StructEnd { .. } | FieldKind::Action { .. } => {
                return Err(ParseError::StructuralViolation {
                    offset: pc,
                    message: "marker executed as a value field".to_string(),
                });
            }
        };

        if let FieldValue::Scalar(scalar) = &value {
            self.slots[pc] = Some(scalar.as_i64());
        }

        Ok(value)
    }

    fn read_bits(
        &self,
        stream: &mut BitStream<'_>,
        width: u32,
        length: Option<ArrayLength>,
    ) -> Result<FieldValue, ReadError> {
        let bits = |value: u64| ScalarValue::Bits {
            value,
            width: width as u8,
        };

        let values = match length {
            None => return Ok(FieldValue::Scalar(bits(read_bit_group(stream, width)?))),
            Some(length) if width <= 8 => stream
                .read_bits_array(width as u8, length)?
                .into_iter()
                .map(|value| bits(value as u64))
                .collect(),
            Some(ArrayLength::Fixed(count)) => {
                let mut values = Vec::with_capacity(count.min(MAX_PREALLOCATED));
                for _ in 0..count {
                    values.push(bits(read_bit_group(stream, width)?));
                }
                values
            }
            Some(ArrayLength::Remaining) => {
                let mut values = Vec::new();
                while stream.has_available_data()? {
                    values.push(bits(read_bit_group(stream, width)?));
                }
                values
            }
        };

        Ok(FieldValue::Array(ArrayValue::from_scalars(values)))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use super::*;
    use crate::{
        compiler::compile,
        field::PrimitiveKind,
        handler::{FloatTypes, VarFieldHandler},
        order::ByteOrder,
    };

    fn parse_with(
        grammar: &str,
        data: &[u8],
        config: &ParserConfig,
        externals: Option<&dyn ExternalValueProvider>,
    ) -> Result<StructValue, ParseError> {
        let schema = compile(grammar, config.custom_types.as_deref()).unwrap();
        let mut stream = BitStream::from_slice(data, config.bit_order, config.byte_order);
        execute(&schema, &mut stream, config, externals)
    }

    fn parse(grammar: &str, data: &[u8]) -> Result<StructValue, ParseError> {
        parse_with(grammar, data, &ParserConfig::default(), None)
    }

    fn msb_config() -> ParserConfig {
        let mut config = ParserConfig::new();
        config.set_bit_order(BitOrder::MsbFirst);
        config
    }

    #[test]
    fn test_primitives_and_byte_order() {
        let root = parse("ushort be; <ushort le; byte neg; bool flag;", &[0x12, 0x34, 0x12, 0x34, 0xFF, 0x02])
            .unwrap();
        assert_eq!(root.get_i64("be"), Some(0x1234));
        assert_eq!(root.get_i64("le"), Some(0x3412));
        assert_eq!(root.get_i64("neg"), Some(-1));
        assert_eq!(root.get_bool("flag"), Some(true));
    }

    #[test]
    fn test_array_length_evaluated_once() {
        let root = parse("ubyte n; byte [n*2] data; ubyte tail;", &[2, 1, 2, 3, 4, 9]).unwrap();
        assert_eq!(root.get_array("data").unwrap().to_i64_vec(), Some(vec![1, 2, 3, 4]));
        assert_eq!(root.get_i64("tail"), Some(9));
    }

    #[test]
    fn test_struct_arrays_and_nested_references() {
        let root = parse(
            "ubyte n; items [n] { ubyte len; ubyte [len] data; } ubyte end;",
            &[2, 1, 0xAA, 2, 0xBB, 0xCC, 0x7F],
        )
        .unwrap();

        let items = root.get_array("items").unwrap();
        assert_eq!(items.len(), 2);
        let second = items.get(1).unwrap().as_struct().unwrap();
        assert_eq!(second.get_i64("len"), Some(2));
        assert_eq!(second.get_array("data").unwrap().to_bytes(), Some(vec![0xBB, 0xCC]));
        assert_eq!(root.get_i64("end"), Some(0x7F));
    }

    #[test]
    fn test_zero_length_struct_array_skips_body() {
        let root = parse("ubyte n; items [n] { int x; } ubyte end;", &[0, 5]).unwrap();
        assert!(root.get_array("items").unwrap().is_empty());
        assert_eq!(root.get_i64("end"), Some(5));
    }

    #[test]
    fn test_whole_stream_arrays() {
        let root = parse("ubyte head; ushort [_] rest;", &[1, 0, 2, 0, 3]).unwrap();
        assert_eq!(root.get_array("rest").unwrap().to_i64_vec(), Some(vec![2, 3]));

        let root = parse("pairs [_] { ubyte a; ubyte b; }", &[1, 2, 3, 4]).unwrap();
        assert_eq!(root.get_array("pairs").unwrap().len(), 2);

        let root = parse("ubyte a; byte [_] rest;", &[1]).unwrap();
        assert!(root.get_array("rest").unwrap().is_empty());
    }

    #[test]
    fn test_nested_named_and_anonymous_structs() {
        let root = parse("header { ubyte a; { ubyte b; } } ubyte c;", &[1, 2, 3]).unwrap();
        assert_eq!(root.get_i64("header.a"), Some(1));
        assert_eq!(root.get_i64("c"), Some(3));

        let header = root.get_struct("header").unwrap();
        let anonymous = header.fields()[1].value.as_struct().unwrap();
        assert_eq!(anonymous.get_i64("b"), Some(2));
    }

    #[test]
    fn test_bit_fields_msb_first() {
        let root = parse_with("bit:3 a; bit:5 b; bit:12 wide; bit:4 rest;", &[0b1011_0010, 0x12, 0x34], &msb_config(), None)
            .unwrap();
        assert_eq!(root.get_i64("a"), Some(0b101));
        assert_eq!(root.get_i64("b"), Some(0b10010));
        assert_eq!(root.get_i64("wide"), Some(0x123));
        assert_eq!(root.get_i64("rest"), Some(0x4));
    }

    #[test]
    fn test_bit_fields_lsb_first() {
        let root = parse("bit:3 a; bit:5 b; bit:12 wide;", &[0b1011_0010, 0x12, 0x34]).unwrap();
        assert_eq!(root.get_i64("a"), Some(0b010));
        assert_eq!(root.get_i64("b"), Some(0b10110));
        assert_eq!(root.get_i64("wide"), Some(0x412));
    }

    #[test]
    fn test_bit_arrays() {
        let grammar = "bit:4 [4] nibbles; bit:12 [_] wide;";
        let root = parse_with(grammar, &[0xAB, 0xCD, 0x01, 0x23, 0x45], &msb_config(), None).unwrap();
        assert_eq!(
            root.get_array("nibbles").unwrap().to_i64_vec(),
            Some(vec![0xA, 0xB, 0xC, 0xD])
        );
        assert_eq!(root.get_array("wide").unwrap().to_i64_vec(), Some(vec![0x012, 0x345]));

        // 16 bits left: one group, then a partial one
        let err = parse_with(grammar, &[0xAB, 0xCD, 0x01, 0x23], &msb_config(), None).unwrap_err();
        assert!(err.is_truncated_input());
    }

    #[test]
    fn test_runtime_bit_width_checked() {
        let err = parse("ubyte w; bit:w v;", &[0, 0xFF]).unwrap_err();
        assert!(matches!(err, ParseError::InvalidBitWidth { width: 0, ref field } if field == "v"));

        let err = parse("ubyte w; bit:w v;", &[65, 0xFF]).unwrap_err();
        assert!(matches!(err, ParseError::InvalidBitWidth { width: 65, .. }));
    }

    #[test]
    fn test_negative_array_length() {
        let err = parse("byte n; byte [n] a;", &[0xFF, 0]).unwrap_err();
        assert!(matches!(err, ParseError::NegativeArrayLength { length: -1, ref field } if field == "a"));
    }

    #[test]
    fn test_external_names() {
        let externals = HashMap::from([("len".to_string(), 3)]);
        let root = parse_with("ubyte [$len] a;", &[1, 2, 3], &ParserConfig::default(), Some(&externals)).unwrap();
        assert_eq!(root.get_array("a").unwrap().len(), 3);

        let err = parse("ubyte [$len] a;", &[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Expression {
                source: ExprError::ExternalNameUnresolved { ref name },
                ..
            } if name == "len"
        ));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_truncated_input_fails_whole_parse() {
        let err = parse("ubyte a; int b;", &[1, 2, 3]).unwrap_err();
        assert!(err.is_truncated_input());
        assert!(matches!(err, ParseError::Read { ref field, position: 3, .. } if field == "b"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_skip_remaining_fields_if_eof() {
        let mut config = ParserConfig::new();
        config.set_skip_remaining_fields_if_eof(true);

        let root = parse_with("ubyte a; s { ubyte b; ubyte c; } ubyte d;", &[1, 2], &config, None).unwrap();
        assert_eq!(root.len(), 2);
        assert_eq!(root.get_i64("a"), Some(1));
        assert_eq!(root.get_i64("s.b"), Some(2));
        assert_eq!(root.get_i64("s.c"), None);

        // a field that starts with data but runs out is still an error
        let err = parse_with("ubyte a; int b;", &[1, 2], &config, None).unwrap_err();
        assert!(err.is_truncated_input());
    }

    #[test]
    fn test_val_fields_and_counter() {
        let root = parse("ubyte a; ubyte b; val:(a*3+b) t; val:$$ pos;", &[2, 1]).unwrap();
        assert_eq!(root.find_path("t"), Some(&FieldValue::Scalar(ScalarValue::Long(7))));
        assert_eq!(root.get_i64("pos"), Some(2));
    }

    #[test]
    fn test_actions() {
        let root = parse("bit:3 a; align; ubyte b; skip:2; ubyte c;", &[0xFF, 0x11, 0, 0, 0x22]).unwrap();
        assert_eq!(root.get_i64("b"), Some(0x11));
        assert_eq!(root.get_i64("c"), Some(0x22));

        let root = parse("ubyte a; reset$$; ubyte b; align:4; ubyte c;", &[1, 2, 0, 0, 0, 3]).unwrap();
        assert_eq!(root.get_i64("c"), Some(3));

        let err = parse("byte n; skip:n;", &[0xFE]).unwrap_err();
        assert!(matches!(err, ParseError::InvalidActionArgument { action: "skip", value: -2 }));
    }

    #[test]
    fn test_custom_types() {
        let mut config = ParserConfig::new();
        config.set_custom_types(Arc::new(FloatTypes));

        let mut data = 1.5f32.to_be_bytes().to_vec();
        data.extend_from_slice(&2.0f64.to_le_bytes());
        let root = parse_with("float f; <double [1] d;", &data, &config, None).unwrap();
        assert_eq!(root.find_path("f"), Some(&FieldValue::Scalar(ScalarValue::Float(1.5))));
        assert_eq!(
            root.get_array("d").unwrap().get(0),
            Some(&FieldValue::Scalar(ScalarValue::Double(2.0)))
        );
    }

    #[test]
    fn test_missing_handlers() {
        let err = parse("var v;", &[1]).unwrap_err();
        assert!(matches!(err, ParseError::MissingHandler { kind: "var field", .. }));

        let schema = compile("float f;", Some(&FloatTypes)).unwrap();
        let mut stream = BitStream::from_slice(&[0; 4], BitOrder::LsbFirst, ByteOrder::BigEndian);
        let err = execute(&schema, &mut stream, &ParserConfig::default(), None).unwrap_err();
        assert!(matches!(err, ParseError::MissingHandler { kind: "custom type", .. }));
    }

    /// Reads a length byte followed by that many bytes, plus `extra_data` bytes.
    struct LengthPrefixed;

    impl VarFieldHandler for LengthPrefixed {
        fn read(&self, stream: &mut BitStream<'_>, request: &VarFieldRequest<'_>) -> Result<FieldValue, HandlerError> {
            let len = stream.read_u8()? as i64 + request.extra_data;
            if len > 4 {
                return Err(HandlerError::Invalid(format!("length {len} too large")));
            }
            let values = stream.read_array(PrimitiveKind::UByte, ArrayLength::Fixed(len as usize), None)?;
            Ok(FieldValue::Array(ArrayValue::from_scalars(values)))
        }
    }

    #[test]
    fn test_var_fields() {
        let mut config = ParserConfig::new();
        config.set_var_fields(Arc::new(LengthPrefixed));

        let root = parse_with("var:1 payload; ubyte end;", &[1, 0xA, 0xB, 0xC], &config, None).unwrap();
        assert_eq!(root.get_array("payload").unwrap().to_bytes(), Some(vec![0xA, 0xB]));
        assert_eq!(root.get_i64("end"), Some(0xC));

        let err = parse_with("var payload;", &[9], &config, None).unwrap_err();
        assert!(matches!(err, ParseError::Handler { ref field, .. } if field == "payload"));

        let err = parse_with("var payload;", &[3, 1], &config, None).unwrap_err();
        assert!(err.is_truncated_input());
    }

    #[test]
    fn test_structural_violations() {
        let mut stream = BitStream::from_slice(&[], BitOrder::LsbFirst, ByteOrder::BigEndian);
        let config = ParserConfig::default();

        let schema = CompiledSchema::from_descriptors(vec![FieldDescriptor::new(FieldKind::StructEnd { start: 0 })]);
        assert!(matches!(
            execute(&schema, &mut stream, &config, None),
            Err(ParseError::StructuralViolation { offset: 0, .. })
        ));

        let schema = CompiledSchema::from_descriptors(vec![
            FieldDescriptor::new(FieldKind::StructStart { end: 1 }),
            FieldDescriptor::new(FieldKind::Action {
                kind: ActionKind::ResetCounter,
                argument: None,
            }),
        ]);
        assert!(matches!(
            execute(&schema, &mut stream, &config, None),
            Err(ParseError::StructuralViolation { offset: 0, .. })
        ));

        let schema = CompiledSchema::from_descriptors(vec![
            FieldDescriptor::new(FieldKind::StructStart { end: 2 }),
            FieldDescriptor::new(FieldKind::StructStart { end: 3 }),
            FieldDescriptor::new(FieldKind::StructEnd { start: 0 }),
            FieldDescriptor::new(FieldKind::StructEnd { start: 1 }),
        ]);
        assert!(matches!(
            execute(&schema, &mut stream, &config, None),
            Err(ParseError::StructuralViolation { offset: 2, .. })
        ));
    }

    #[test]
    fn test_read_to_end_struct_without_input_is_rejected() {
        let err = parse("items [_] { val:(1) one; }", &[1]).unwrap_err();
        assert!(matches!(err, ParseError::StructuralViolation { offset: 0, .. }));
    }

    #[test]
    fn test_read_to_end_struct_with_sub_byte_body() {
        let root = parse_with("items [_] { bit:2 a; }", &[0b1110_0100], &msb_config(), None).unwrap();
        let items = root.get_array("items").unwrap();
        let values: Vec<_> = items
            .iter()
            .map(|item| item.as_struct().unwrap().get_i64("a").unwrap())
            .collect();
        assert_eq!(values, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_read_to_end_struct_resetting_counter() {
        let root = parse("items [_] { ubyte a; reset$$; }", &[1, 2, 3]).unwrap();
        let items = root.get_array("items").unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items.get(2).unwrap().as_struct().unwrap().get_i64("a"), Some(3));
    }

    #[test]
    fn test_schema_reused_across_sources() {
        let schema = compile("ubyte n; ubyte [n] data;", None).unwrap();
        let config = ParserConfig::default();
        for data in [&[1u8, 7][..], &[2, 8, 9][..]] {
            let mut stream = BitStream::from_slice(data, config.bit_order, config.byte_order);
            let root = execute(&schema, &mut stream, &config, None).unwrap();
            assert_eq!(root.get_array("data").unwrap().len(), data[0] as usize);
        }
    }
}
