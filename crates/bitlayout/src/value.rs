//! Value tree produced by executing a compiled schema.

use crate::{
    bits::{low_mask, reverse_bits_n},
    field::NamedFieldInfo,
};

/// A single parsed value with its storage width preserved.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ScalarValue {
    Bool(bool),
    Byte(i8),
    UByte(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(i64),
    /// Bit group of `width` bits, `1..=64`.
    Bits { value: u64, width: u8 },
    Float(f32),
    Double(f64),
}

impl ScalarValue {
    pub fn as_bool(&self) -> bool {
        match *self {
            ScalarValue::Bool(b) => b,
            ScalarValue::Float(v) => v != 0.0,
            ScalarValue::Double(v) => v != 0.0,
            _ => self.as_i64() != 0,
        }
    }

    /// Widens to `i64`; unsigned payloads are zero-extended, floats truncated.
    pub fn as_i64(&self) -> i64 {
        match *self {
            ScalarValue::Bool(b) => b as i64,
            ScalarValue::Byte(v) => v as i64,
            ScalarValue::UByte(v) => v as i64,
            ScalarValue::Short(v) => v as i64,
            ScalarValue::UShort(v) => v as i64,
            ScalarValue::Int(v) => v as i64,
            ScalarValue::UInt(v) => v as i64,
            ScalarValue::Long(v) => v,
            ScalarValue::Bits { value, .. } => value as i64,
            ScalarValue::Float(v) => v as i64,
            ScalarValue::Double(v) => v as i64,
        }
    }

    /// Low 32 bits of [ScalarValue::as_i64].
    pub fn as_i32(&self) -> i32 {
        self.as_i64() as i32
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            ScalarValue::Float(v) => v as f64,
            ScalarValue::Double(v) => v,
            _ => self.as_i64() as f64,
        }
    }

    /// Number of payload bits.
    pub fn bit_width(&self) -> u32 {
        match *self {
            ScalarValue::Bool(_) | ScalarValue::Byte(_) | ScalarValue::UByte(_) => 8,
            ScalarValue::Short(_) | ScalarValue::UShort(_) => 16,
            ScalarValue::Int(_) | ScalarValue::UInt(_) | ScalarValue::Float(_) => 32,
            ScalarValue::Long(_) | ScalarValue::Double(_) => 64,
            ScalarValue::Bits { width, .. } => width as u32,
        }
    }

    /// Same value with the order of its payload bits reversed.
    pub fn inverted_bit_order(&self) -> ScalarValue {
        let reverse = |raw: u64, width: u32| reverse_bits_n(raw & low_mask(width), width as usize);

        match *self {
            ScalarValue::Bool(b) => ScalarValue::Bool(b),
            ScalarValue::Byte(v) => ScalarValue::Byte(reverse(v as u8 as u64, 8) as u8 as i8),
            ScalarValue::UByte(v) => ScalarValue::UByte(reverse(v as u64, 8) as u8),
            ScalarValue::Short(v) => ScalarValue::Short(reverse(v as u16 as u64, 16) as u16 as i16),
            ScalarValue::UShort(v) => ScalarValue::UShort(reverse(v as u64, 16) as u16),
            ScalarValue::Int(v) => ScalarValue::Int(reverse(v as u32 as u64, 32) as u32 as i32),
            ScalarValue::UInt(v) => ScalarValue::UInt(reverse(v as u64, 32) as u32),
            ScalarValue::Long(v) => ScalarValue::Long(reverse(v as u64, 64) as i64),
            ScalarValue::Bits { value, width } => ScalarValue::Bits {
                value: reverse(value, width as u32),
                width,
            },
            ScalarValue::Float(v) => ScalarValue::Float(f32::from_bits(reverse(v.to_bits() as u64, 32) as u32)),
            ScalarValue::Double(v) => ScalarValue::Double(f64::from_bits(reverse(v.to_bits(), 64))),
        }
    }
}

/// A node of the value tree.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FieldValue {
    Scalar(ScalarValue),
    Array(ArrayValue),
    Struct(StructValue),
}

impl FieldValue {
    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            FieldValue::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            FieldValue::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            FieldValue::Struct(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_scalar().map(ScalarValue::as_i64)
    }
}

impl From<ScalarValue> for FieldValue {
    fn from(value: ScalarValue) -> Self {
        FieldValue::Scalar(value)
    }
}

/// Array node. Elements are owned by the node; callers get shared borrows or copies.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ArrayValue {
    items: Vec<FieldValue>,
}

impl ArrayValue {
    pub fn new(items: Vec<FieldValue>) -> Self {
        ArrayValue { items }
    }

    pub fn from_scalars(values: Vec<ScalarValue>) -> Self {
        ArrayValue {
            items: values.into_iter().map(FieldValue::Scalar).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FieldValue> {
        self.items.iter()
    }

    /// Owned copy of the elements.
    pub fn to_vec(&self) -> Vec<FieldValue> {
        self.items.clone()
    }

    /// Widened copy of the elements; `None` if any element is not a scalar.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        self.items.iter().map(FieldValue::as_i64).collect()
    }

    /// Low byte of each scalar element; `None` if any element is not a scalar.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        self.items
            .iter()
            .map(|item| item.as_i64().map(|v| v as u8))
            .collect()
    }
}

impl<'a> IntoIterator for &'a ArrayValue {
    type Item = &'a FieldValue;
    type IntoIter = std::slice::Iter<'a, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// A structure member; anonymous members keep their place without a name.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ParsedField {
    pub name: Option<NamedFieldInfo>,
    pub value: FieldValue,
}

impl ParsedField {
    pub fn name(&self) -> Option<&str> {
        self.name.as_ref().map(|info| info.name.as_str())
    }
}

/// Structure node: members in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StructValue {
    fields: Vec<ParsedField>,
}

impl StructValue {
    pub fn new(fields: Vec<ParsedField>) -> Self {
        StructValue { fields }
    }

    pub fn fields(&self) -> &[ParsedField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Direct member by name (case-insensitive).
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        let name = name.to_ascii_lowercase();
        self.fields
            .iter()
            .find(|field| field.name() == Some(name.as_str()))
            .map(|field| &field.value)
    }

    /// Member reached through nested structures, e.g. `header.flags.ack`.
    pub fn find_path(&self, path: &str) -> Option<&FieldValue> {
        let mut segments = path.split('.');
        let mut current = self.field(segments.next()?)?;
        for segment in segments {
            current = current.as_struct()?.field(segment)?;
        }
        Some(current)
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.find_path(path)?.as_i64()
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.find_path(path)?.as_scalar().map(ScalarValue::as_bool)
    }

    pub fn get_array(&self, path: &str) -> Option<&ArrayValue> {
        self.find_path(path)?.as_array()
    }

    pub fn get_struct(&self, path: &str) -> Option<&StructValue> {
        self.find_path(path)?.as_struct()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str, value: FieldValue) -> ParsedField {
        ParsedField {
            name: Some(NamedFieldInfo {
                name: name.to_string(),
                path: name.to_string(),
                offset: 0,
            }),
            value,
        }
    }

    #[test]
    fn test_widening_preserves_unsigned() {
        assert_eq!(ScalarValue::UShort(0xFFFF).as_i64(), 0xFFFF);
        assert_eq!(ScalarValue::UByte(0x80).as_i32(), 0x80);
        assert_eq!(ScalarValue::Byte(-1).as_i64(), -1);
        assert_eq!(ScalarValue::UInt(u32::MAX).as_i64(), u32::MAX as i64);
        assert!(ScalarValue::Bits { value: 1, width: 1 }.as_bool());
        assert!(!ScalarValue::Short(0).as_bool());
    }

    #[test]
    fn test_inverted_bit_order() {
        assert_eq!(
            ScalarValue::UByte(0b1000_0001).inverted_bit_order(),
            ScalarValue::UByte(0b1000_0001)
        );
        assert_eq!(
            ScalarValue::UByte(0b1100_0000).inverted_bit_order(),
            ScalarValue::UByte(0b0000_0011)
        );
        assert_eq!(
            ScalarValue::Bits { value: 0b001, width: 3 }.inverted_bit_order(),
            ScalarValue::Bits { value: 0b100, width: 3 }
        );
        assert_eq!(ScalarValue::Byte(1).inverted_bit_order(), ScalarValue::Byte(i8::MIN));
    }

    #[test]
    fn test_find_path() {
        let inner = StructValue::new(vec![named("len", ScalarValue::UByte(7).into())]);
        let root = StructValue::new(vec![
            named("header", FieldValue::Struct(inner)),
            ParsedField {
                name: None,
                value: ScalarValue::Int(1).into(),
            },
        ]);

        assert_eq!(root.get_i64("header.len"), Some(7));
        assert_eq!(root.get_i64("HEADER.LEN"), Some(7));
        assert_eq!(root.get_i64("header.missing"), None);
        assert_eq!(root.len(), 2);
    }

    #[test]
    fn test_array_copies() {
        let array = ArrayValue::from_scalars(vec![ScalarValue::UByte(1), ScalarValue::UByte(200)]);
        let mut copy = array.to_vec();
        copy.clear();
        assert_eq!(array.len(), 2);
        assert_eq!(array.to_i64_vec(), Some(vec![1, 200]));
        assert_eq!(array.to_bytes(), Some(vec![1, 200]));
    }
}
