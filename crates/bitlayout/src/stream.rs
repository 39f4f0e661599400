//! Bit-precise reader over any [std::io::Read] source.
//!
//! The stream keeps a partially consumed byte and a cursor inside it, so
//! successive sub-byte reads continue where the previous one stopped.
//!
//! Counter rule: the logical position counter advances by one when all 8
//! bits of a byte have been consumed. A byte that is only partly consumed
//! is not counted until its last bit is read or the stream is aligned.

use std::io::{self, Read};

use crate::{
    bits::sign_extend,
    errors::ReadError,
    field::PrimitiveKind,
    order::{BitOrder, ByteOrder},
    value::ScalarValue,
};

/// Number of elements for an array read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLength {
    Fixed(usize),
    /// Read until the source is exhausted.
    Remaining,
}

/// Upper bound for pre-allocating array storage from an untrusted length.
pub const MAX_PREALLOCATED: usize = 1 << 16;

pub struct BitStream<'a> {
    source: Box<dyn Read + 'a>,
    bit_order: BitOrder,
    byte_order: ByteOrder,
    /// Byte currently being consumed bit by bit.
    current: u8,
    /// Unread bits left in `current`.
    unread_bits: u8,
    /// Byte fetched by a lookahead and not consumed yet.
    peeked: Option<u8>,
    counter: u64,
    /// Bits consumed since creation; unaffected by [BitStream::reset_counter].
    consumed_bits: u64,
}

impl<'a> BitStream<'a> {
    pub fn new(source: impl Read + 'a, bit_order: BitOrder, byte_order: ByteOrder) -> Self {
        BitStream {
            source: Box::new(source),
            bit_order,
            byte_order,
            current: 0,
            unread_bits: 0,
            peeked: None,
            counter: 0,
            consumed_bits: 0,
        }
    }

    pub fn from_slice(data: &'a [u8], bit_order: BitOrder, byte_order: ByteOrder) -> Self {
        BitStream::new(data, bit_order, byte_order)
    }

    pub fn bit_order(&self) -> BitOrder {
        self.bit_order
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Whole bytes consumed since creation or the last [BitStream::reset_counter].
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Zeroes the position counter. Buffered bits are kept.
    pub fn reset_counter(&mut self) {
        self.counter = 0;
    }

    /// Absolute number of bits consumed, including bits dropped by [BitStream::align].
    pub fn bit_position(&self) -> u64 {
        self.consumed_bits
    }

    /// True when the bit cursor sits on a byte boundary.
    pub fn is_aligned(&self) -> bool {
        self.unread_bits == 0
    }

    fn truncated(&self) -> ReadError {
        ReadError::TruncatedInput {
            position: self.counter,
        }
    }

    fn fetch_byte(&mut self) -> Result<Option<u8>, ReadError> {
        if let Some(byte) = self.peeked.take() {
            return Ok(Some(byte));
        }

        let mut buf = [0u8; 1];
        loop {
            match self.source.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// True if at least one more bit can be read.
    pub fn has_available_data(&mut self) -> Result<bool, ReadError> {
        if self.unread_bits > 0 || self.peeked.is_some() {
            return Ok(true);
        }

        match self.fetch_byte()? {
            Some(byte) => {
                self.peeked = Some(byte);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn next_bit(&mut self) -> Result<u8, ReadError> {
        if self.unread_bits == 0 {
            self.current = self.fetch_byte()?.ok_or_else(|| self.truncated())?;
            self.unread_bits = 8;
        }

        let consumed = 8 - self.unread_bits;
        let bit = match self.bit_order {
            BitOrder::MsbFirst => (self.current >> (7 - consumed)) & 1,
            BitOrder::LsbFirst => (self.current >> consumed) & 1,
        };

        self.unread_bits -= 1;
        self.consumed_bits += 1;
        if self.unread_bits == 0 {
            self.counter += 1;
        }

        Ok(bit)
    }

    /// Reads `width` bits (`1..=8`).
    ///
    /// Under [BitOrder::MsbFirst] the first consumed bit becomes the most
    /// significant bit of the result; under [BitOrder::LsbFirst] it becomes
    /// bit 0.
    pub fn read_bits(&mut self, width: u8) -> Result<u8, ReadError> {
        if !(1..=8).contains(&width) {
            return Err(ReadError::InvalidBitCount(width));
        }

        let mut value = 0u8;
        for i in 0..width {
            let bit = self.next_bit()?;
            match self.bit_order {
                BitOrder::MsbFirst => value = (value << 1) | bit,
                BitOrder::LsbFirst => value |= bit << i,
            }
        }

        Ok(value)
    }

    /// Reads `count` bit groups of `width` bits each, or until exhaustion.
    pub fn read_bits_array(&mut self, width: u8, length: ArrayLength) -> Result<Vec<u8>, ReadError> {
        match length {
            ArrayLength::Fixed(count) => {
                let mut values = Vec::with_capacity(count.min(MAX_PREALLOCATED));
                for _ in 0..count {
                    values.push(self.read_bits(width)?);
                }
                Ok(values)
            }
            ArrayLength::Remaining => {
                let mut values = Vec::new();
                while self.has_available_data()? {
                    values.push(self.read_bits(width)?);
                }
                Ok(values)
            }
        }
    }

    /// Reads one byte; an unaligned cursor reads the next 8 bits instead.
    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        if self.unread_bits > 0 {
            return self.read_bits(8);
        }

        let byte = self.fetch_byte()?.ok_or_else(|| self.truncated())?;
        self.counter += 1;
        self.consumed_bits += 8;
        Ok(byte)
    }

    /// Reads `size` bytes (`1..=8`) as an unsigned value in the given byte order.
    pub fn read_uint(&mut self, size: usize, byte_order: Option<ByteOrder>) -> Result<u64, ReadError> {
        if !(1..=8).contains(&size) {
            return Err(ReadError::InvalidByteCount(size));
        }

        let order = byte_order.unwrap_or(self.byte_order);
        let mut value = 0u64;

        for i in 0..size {
            let byte = self.read_u8()? as u64;
            match order {
                ByteOrder::BigEndian => value = (value << 8) | byte,
                ByteOrder::LittleEndian => value |= byte << (8 * i),
            }
        }

        Ok(value)
    }

    /// Reads one primitive. `byte_order` overrides the stream default for this read only.
    pub fn read_scalar(
        &mut self,
        kind: PrimitiveKind,
        byte_order: Option<ByteOrder>,
    ) -> Result<ScalarValue, ReadError> {
        let raw = self.read_uint(kind.size_bytes(), byte_order)?;
        let bits = kind.size_bytes() * 8;

        let value = match kind {
            PrimitiveKind::Bool => ScalarValue::Bool(raw != 0),
            PrimitiveKind::Byte => ScalarValue::Byte(sign_extend(raw, bits) as i8),
            PrimitiveKind::UByte => ScalarValue::UByte(raw as u8),
            PrimitiveKind::Short => ScalarValue::Short(sign_extend(raw, bits) as i16),
            PrimitiveKind::UShort => ScalarValue::UShort(raw as u16),
            PrimitiveKind::Int => ScalarValue::Int(sign_extend(raw, bits) as i32),
            PrimitiveKind::UInt => ScalarValue::UInt(raw as u32),
            PrimitiveKind::Long => ScalarValue::Long(raw as i64),
        };

        Ok(value)
    }

    /// Repeats [BitStream::read_scalar] `length` times, or until exhaustion.
    pub fn read_array(
        &mut self,
        kind: PrimitiveKind,
        length: ArrayLength,
        byte_order: Option<ByteOrder>,
    ) -> Result<Vec<ScalarValue>, ReadError> {
        match length {
            ArrayLength::Fixed(count) => {
                let mut values = Vec::with_capacity(count.min(MAX_PREALLOCATED));
                for _ in 0..count {
                    values.push(self.read_scalar(kind, byte_order)?);
                }
                Ok(values)
            }
            ArrayLength::Remaining => {
                let mut values = Vec::new();
                while self.has_available_data()? {
                    values.push(self.read_scalar(kind, byte_order)?);
                }
                Ok(values)
            }
        }
    }

    /// Drops the rest of a partial byte, then whole bytes until the counter is a multiple of `n`.
    pub fn align(&mut self, n: u64) -> Result<(), ReadError> {
        if self.unread_bits > 0 {
            self.consumed_bits += self.unread_bits as u64;
            self.unread_bits = 0;
            self.counter += 1;
        }

        if n > 1 {
            while self.counter % n != 0 {
                self.read_u8()?;
            }
        }

        Ok(())
    }

    /// Discards `n` bytes.
    pub fn skip(&mut self, n: u64) -> Result<(), ReadError> {
        for _ in 0..n {
            self.read_u8()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msb(data: &[u8]) -> BitStream<'_> {
        BitStream::from_slice(data, BitOrder::MsbFirst, ByteOrder::BigEndian)
    }

    fn lsb(data: &[u8]) -> BitStream<'_> {
        BitStream::from_slice(data, BitOrder::LsbFirst, ByteOrder::BigEndian)
    }

    #[test]
    fn test_single_bits_msb_first() {
        let mut stream = msb(&[0b1011_0010]);
        let bits: Vec<u8> = (0..8).map(|_| stream.read_bits(1).unwrap()).collect();
        assert_eq!(bits, vec![1, 0, 1, 1, 0, 0, 1, 0]);
    }

    #[test]
    fn test_single_bits_lsb_first() {
        let mut stream = lsb(&[0b1011_0010]);
        let bits: Vec<u8> = (0..8).map(|_| stream.read_bits(1).unwrap()).collect();
        assert_eq!(bits, vec![0, 1, 0, 0, 1, 1, 0, 1]);
    }

    #[test]
    fn test_sub_byte_reads_carry_cursor() {
        let mut stream = msb(&[0b1011_0010]);
        assert_eq!(stream.read_bits(3).unwrap(), 0b101);
        assert_eq!(stream.read_bits(5).unwrap(), 0b10010);

        let mut stream = lsb(&[0b1011_0010]);
        assert_eq!(stream.read_bits(3).unwrap(), 0b010);
        assert_eq!(stream.read_bits(5).unwrap(), 0b10110);
    }

    #[test]
    fn test_bits_cross_byte_boundary() {
        let mut stream = msb(&[0b0000_0011, 0b1100_0000]);
        stream.read_bits(6).unwrap();
        assert_eq!(stream.read_bits(4).unwrap(), 0b1111);
        assert_eq!(stream.counter(), 1);
    }

    #[test]
    fn test_full_byte_bits_equal_byte() {
        assert_eq!(msb(&[0xA5]).read_bits(8).unwrap(), 0xA5);
        assert_eq!(lsb(&[0xA5]).read_bits(8).unwrap(), 0xA5);
    }

    #[test]
    fn test_invalid_bit_count() {
        assert!(matches!(msb(&[0]).read_bits(0), Err(ReadError::InvalidBitCount(0))));
        assert!(matches!(msb(&[0]).read_bits(9), Err(ReadError::InvalidBitCount(9))));
    }

    #[test]
    fn test_byte_order() {
        let mut stream = msb(&[0x12, 0x34, 0x12, 0x34]);
        assert_eq!(
            stream.read_scalar(PrimitiveKind::UShort, Some(ByteOrder::LittleEndian)).unwrap(),
            ScalarValue::UShort(0x3412)
        );
        assert_eq!(
            stream.read_scalar(PrimitiveKind::UShort, None).unwrap(),
            ScalarValue::UShort(0x1234)
        );
    }

    #[test]
    fn test_signed_scalars() {
        let mut stream = msb(&[0xFF, 0xFF, 0xFE, 0x80, 0x00, 0x00, 0x00]);
        assert_eq!(stream.read_scalar(PrimitiveKind::Byte, None).unwrap(), ScalarValue::Byte(-1));
        assert_eq!(stream.read_scalar(PrimitiveKind::Short, None).unwrap(), ScalarValue::Short(-2));
        assert_eq!(
            stream.read_scalar(PrimitiveKind::Int, None).unwrap(),
            ScalarValue::Int(i32::MIN)
        );
    }

    #[test]
    fn test_long_little_endian() {
        let data = [1, 0, 0, 0, 0, 0, 0, 0x80];
        let mut stream = BitStream::from_slice(&data, BitOrder::LsbFirst, ByteOrder::LittleEndian);
        assert_eq!(
            stream.read_scalar(PrimitiveKind::Long, None).unwrap(),
            ScalarValue::Long(i64::MIN + 1)
        );
    }

    #[test]
    fn test_read_remaining() {
        let mut stream = msb(&[1, 2, 3, 4, 5]);
        let values = stream.read_array(PrimitiveKind::UByte, ArrayLength::Remaining, None).unwrap();
        assert_eq!(values.len(), 5);
        assert!(!stream.has_available_data().unwrap());
    }

    #[test]
    fn test_truncated_input() {
        let mut stream = msb(&[1, 2, 3]);
        let err = stream.read_scalar(PrimitiveKind::Int, None).unwrap_err();
        assert!(matches!(err, ReadError::TruncatedInput { position: 3 }));
    }

    #[test]
    fn test_align() {
        let mut stream = msb(&[0; 8]);
        stream.skip(3).unwrap();
        stream.align(4).unwrap();
        assert_eq!(stream.counter(), 4);
        stream.align(4).unwrap();
        assert_eq!(stream.counter(), 4);
    }

    #[test]
    fn test_align_drops_partial_byte() {
        let mut stream = msb(&[0xFF, 0x42]);
        stream.read_bits(3).unwrap();
        assert_eq!(stream.counter(), 0);
        stream.align(1).unwrap();
        assert_eq!(stream.counter(), 1);
        assert_eq!(stream.read_u8().unwrap(), 0x42);
    }

    #[test]
    fn test_reset_counter_keeps_content() {
        let mut stream = msb(&[1, 2, 3]);
        stream.read_u8().unwrap();
        stream.reset_counter();
        assert_eq!(stream.counter(), 0);
        assert_eq!(stream.read_u8().unwrap(), 2);
        assert_eq!(stream.counter(), 1);
    }

    #[test]
    fn test_lookahead_does_not_consume() {
        let mut stream = msb(&[7]);
        assert!(stream.has_available_data().unwrap());
        assert_eq!(stream.counter(), 0);
        assert_eq!(stream.read_u8().unwrap(), 7);
        assert!(!stream.has_available_data().unwrap());
    }

    #[test]
    fn test_bit_position_survives_counter_reset() {
        let mut stream = msb(&[0xFF, 1, 2]);
        stream.read_bits(2).unwrap();
        assert_eq!(stream.bit_position(), 2);
        assert_eq!(stream.counter(), 0);
        stream.read_bits(2).unwrap();
        assert_eq!(stream.bit_position(), 4);

        stream.align(1).unwrap();
        assert_eq!(stream.bit_position(), 8);
        stream.read_u8().unwrap();
        stream.reset_counter();
        assert_eq!(stream.counter(), 0);
        assert_eq!(stream.bit_position(), 16);
    }

    #[test]
    fn test_read_uint_rejects_bad_size() {
        assert!(matches!(msb(&[0; 9]).read_uint(0, None), Err(ReadError::InvalidByteCount(0))));
        assert!(matches!(msb(&[0; 9]).read_uint(9, None), Err(ReadError::InvalidByteCount(9))));
        assert_eq!(msb(&[0x12, 0x34]).read_uint(2, None).unwrap(), 0x1234);
    }

    #[test]
    fn test_unaligned_byte_read() {
        let mut stream = msb(&[0b0000_1111, 0b0000_0000]);
        stream.read_bits(4).unwrap();
        assert_eq!(stream.read_u8().unwrap(), 0b1111_0000);
        assert_eq!(stream.counter(), 1);
    }
}
