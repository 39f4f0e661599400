//! Collaborator interfaces injected into the parse engine.
//!
//! - [CustomTypeHandler] reads fields whose type name is not built in.
//! - [VarFieldHandler] reads `var` fields.
//! - [ExternalValueProvider] supplies values for external names in expressions.

use std::collections::HashMap;

use crate::{
    config::ParserFlags,
    errors::HandlerError,
    expr::Program,
    field::{FieldTypeInfo, NamedFieldInfo},
    order::{BitOrder, ByteOrder},
    stream::{ArrayLength, BitStream, MAX_PREALLOCATED},
    value::{ArrayValue, FieldValue, ScalarValue},
};

/// Everything a [CustomTypeHandler] needs to read one occurrence of a field.
#[derive(Debug, Clone, Copy)]
pub struct CustomFieldRequest<'r> {
    pub bit_order: BitOrder,
    pub flags: ParserFlags,
    pub type_info: &'r FieldTypeInfo,
    pub name: Option<&'r NamedFieldInfo>,
    /// Evaluated extra-data expression, `0` when absent.
    pub extra_data: i64,
    /// `[_]` array: read until the source is exhausted.
    pub read_whole_stream: bool,
    /// Evaluated element count for sized arrays, `None` otherwise.
    pub array_length: Option<usize>,
}

impl CustomFieldRequest<'_> {
    /// Array length as understood by [BitStream] array reads; `None` for scalars.
    pub fn length(&self) -> Option<ArrayLength> {
        if self.read_whole_stream {
            Some(ArrayLength::Remaining)
        } else {
            self.array_length.map(ArrayLength::Fixed)
        }
    }
}

/// Reads fields of custom types. The engine knows nothing about their wire format.
pub trait CustomTypeHandler: Send + Sync {
    /// Lowercase type names served by this handler.
    fn type_names(&self) -> &[&'static str];

    /// Compile-time check of a declaration using one of [CustomTypeHandler::type_names].
    fn is_allowed(&self, _type_info: &FieldTypeInfo, _extra: Option<&Program>, _is_array: bool) -> bool {
        true
    }

    fn read(
        &self,
        stream: &mut BitStream<'_>,
        request: &CustomFieldRequest<'_>,
    ) -> Result<FieldValue, HandlerError>;
}

/// Everything a [VarFieldHandler] needs to read one occurrence of a `var` field.
#[derive(Debug, Clone, Copy)]
pub struct VarFieldRequest<'r> {
    pub bit_order: BitOrder,
    /// Declared byte order, or the stream default.
    pub byte_order: ByteOrder,
    pub flags: ParserFlags,
    pub name: Option<&'r NamedFieldInfo>,
    pub extra_data: i64,
    pub read_whole_stream: bool,
    pub array_length: Option<usize>,
}

pub trait VarFieldHandler: Send + Sync {
    fn read(
        &self,
        stream: &mut BitStream<'_>,
        request: &VarFieldRequest<'_>,
    ) -> Result<FieldValue, HandlerError>;
}

/// Supplies values for names that are not declared fields.
///
/// `None` means "no value", which is distinct from a value of zero.
pub trait ExternalValueProvider {
    fn value_of(&self, name: &str) -> Option<i64>;
}

impl<F> ExternalValueProvider for F
where
    F: Fn(&str) -> Option<i64>,
{
    fn value_of(&self, name: &str) -> Option<i64> {
        self(name)
    }
}

impl ExternalValueProvider for HashMap<String, i64> {
    fn value_of(&self, name: &str) -> Option<i64> {
        self.get(name).copied()
    }
}

/// IEEE-754 `float` (32-bit) and `double` (64-bit) fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct FloatTypes;

impl FloatTypes {
    fn read_one(
        stream: &mut BitStream<'_>,
        double: bool,
        order: ByteOrder,
    ) -> Result<ScalarValue, HandlerError> {
        let value = if double {
            ScalarValue::Double(f64::from_bits(stream.read_uint(8, Some(order))?))
        } else {
            ScalarValue::Float(f32::from_bits(stream.read_uint(4, Some(order))? as u32))
        };
        Ok(value)
    }
}

impl CustomTypeHandler for FloatTypes {
    fn type_names(&self) -> &[&'static str] {
        &["float", "double"]
    }

    fn is_allowed(&self, _type_info: &FieldTypeInfo, extra: Option<&Program>, _is_array: bool) -> bool {
        extra.is_none()
    }

    fn read(
        &self,
        stream: &mut BitStream<'_>,
        request: &CustomFieldRequest<'_>,
    ) -> Result<FieldValue, HandlerError> {
        let double = match request.type_info.type_name.as_str() {
            "float" => false,
            "double" => true,
            other => return Err(HandlerError::Invalid(format!("unsupported type '{other}'"))),
        };
        let order = request.type_info.byte_order.unwrap_or(stream.byte_order());

        let values = match request.length() {
            None => return Ok(FieldValue::Scalar(Self::read_one(stream, double, order)?)),
            Some(ArrayLength::Fixed(count)) => {
                let mut values = Vec::with_capacity(count.min(MAX_PREALLOCATED));
                for _ in 0..count {
                    values.push(Self::read_one(stream, double, order)?);
                }
                values
            }
            Some(ArrayLength::Remaining) => {
                let mut values = Vec::new();
                while stream.has_available_data()? {
                    values.push(Self::read_one(stream, double, order)?);
                }
                values
            }
        };

        Ok(FieldValue::Array(ArrayValue::from_scalars(values)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(type_info: &FieldTypeInfo, array_length: Option<usize>) -> CustomFieldRequest<'_> {
        CustomFieldRequest {
            bit_order: BitOrder::MsbFirst,
            flags: ParserFlags::default(),
            type_info,
            name: None,
            extra_data: 0,
            read_whole_stream: false,
            array_length,
        }
    }

    #[test]
    fn test_float_big_endian() {
        let data = 1.5f32.to_be_bytes();
        let mut stream = BitStream::from_slice(&data, BitOrder::MsbFirst, ByteOrder::BigEndian);
        let info = FieldTypeInfo {
            type_name: "float".to_string(),
            byte_order: None,
        };
        let value = FloatTypes.read(&mut stream, &request(&info, None)).unwrap();
        assert_eq!(value, FieldValue::Scalar(ScalarValue::Float(1.5)));
    }

    #[test]
    fn test_double_array_little_endian() {
        let mut data = Vec::new();
        data.extend_from_slice(&2.25f64.to_le_bytes());
        data.extend_from_slice(&(-8.0f64).to_le_bytes());
        let mut stream = BitStream::from_slice(&data, BitOrder::MsbFirst, ByteOrder::BigEndian);
        let info = FieldTypeInfo {
            type_name: "double".to_string(),
            byte_order: Some(ByteOrder::LittleEndian),
        };
        let value = FloatTypes.read(&mut stream, &request(&info, Some(2))).unwrap();
        assert_eq!(
            value,
            FieldValue::Array(ArrayValue::from_scalars(vec![
                ScalarValue::Double(2.25),
                ScalarValue::Double(-8.0)
            ]))
        );
    }

    #[test]
    fn test_closure_and_map_providers() {
        let closure = |name: &str| (name == "k").then_some(4i64);
        assert_eq!(closure.value_of("k"), Some(4));
        assert_eq!(closure.value_of("x"), None);

        let map = HashMap::from([("k".to_string(), 0)]);
        assert_eq!(map.value_of("k"), Some(0));
        assert_eq!(map.value_of("x"), None);
    }
}
