//! Bit- and byte-level stream codec over fixed-capacity buffers.
//!
//! Writes never grow the buffer. A write that does not fit fails softly:
//! it returns `false`, bumps the failed-write counter and leaves previously
//! written bytes untouched. Callers check [`DataStreamWriter::has_failed_writes`]
//! before trusting a buffer. Reads past the end behave the same way, returning
//! zero values and bumping [`DataStreamReader::has_failed_reads`].
//!
//! Bits are packed least significant bit first into a 64-bit accumulator.
//! Byte-oriented writes after bit writes start at the next byte boundary.

use byteorder::{ByteOrder, NativeEndian, NetworkEndian};

use crate::compression::{NetworkCompressionModel, BUCKET_OFFSETS, BUCKET_SIZES, MAX_HUFFMAN_SYMBOL_LENGTH};

/// Size classes for length-prefixed strings. The capacity includes the
/// two-byte length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixedStringCapacity {
    /// 32 bytes.
    Bytes32,
    /// 64 bytes.
    Bytes64,
    /// 128 bytes.
    Bytes128,
    /// 512 bytes.
    Bytes512,
    /// 4096 bytes.
    Bytes4096,
}

impl FixedStringCapacity {
    /// Total bytes including the prefix.
    pub fn capacity(self) -> usize {
        match self {
            FixedStringCapacity::Bytes32 => 32,
            FixedStringCapacity::Bytes64 => 64,
            FixedStringCapacity::Bytes128 => 128,
            FixedStringCapacity::Bytes512 => 512,
            FixedStringCapacity::Bytes4096 => 4096,
        }
    }

    /// Longest UTF-8 string that fits.
    pub fn max_len(self) -> usize {
        self.capacity() - 2
    }
}

fn mask(num_bits: u32) -> u64 {
    (1u64 << num_bits) - 1
}

fn zig_zag(value: i32) -> u32 {
    ((value >> 31) ^ (value << 1)) as u32
}

fn un_zig_zag(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Writes primitives and bit-packed values into a fixed-capacity buffer.
#[derive(Debug, Clone)]
pub struct DataStreamWriter {
    buffer: Vec<u8>,
    length: usize,
    bit_buffer: u64,
    bit_index: u32,
    failed_writes: u32,
}

impl DataStreamWriter {
    /// Creates a writer over a zeroed buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self::from_vec(vec![0; capacity])
    }

    /// Creates a writer reusing `buffer`; its length is the capacity.
    pub fn from_vec(buffer: Vec<u8>) -> Self {
        Self { buffer, length: 0, bit_buffer: 0, bit_index: 0, failed_writes: 0 }
    }

    /// Total bytes the writer can hold.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes written, counting a partially filled trailing byte.
    pub fn length(&self) -> usize {
        self.length + ((self.bit_index + 7) >> 3) as usize
    }

    /// Bits written.
    pub fn length_in_bits(&self) -> usize {
        self.length * 8 + self.bit_index as usize
    }

    /// Returns true if any write failed since the last clear.
    pub fn has_failed_writes(&self) -> bool {
        self.failed_writes > 0
    }

    /// Number of failed writes since the last clear.
    pub fn failed_writes(&self) -> u32 {
        self.failed_writes
    }

    /// Written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.length()]
    }

    /// Consumes the writer, returning the written bytes.
    pub fn into_vec(mut self) -> Vec<u8> {
        let length = self.length();
        self.buffer.truncate(length);
        self.buffer
    }

    /// Resets the writer to empty and clears the failure counter.
    pub fn clear(&mut self) {
        self.length = 0;
        self.bit_buffer = 0;
        self.bit_index = 0;
        self.failed_writes = 0;
    }

    /// Pads pending bits out to a byte boundary.
    pub fn flush(&mut self) {
        self.length += ((self.bit_index + 7) >> 3) as usize;
        self.bit_buffer = 0;
        self.bit_index = 0;
    }

    fn fail(&mut self) -> bool {
        self.failed_writes += 1;
        false
    }

    /// Writes raw bytes at the next byte boundary.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> bool {
        if self.length() + bytes.len() > self.capacity() {
            return self.fail();
        }
        self.flush();
        self.buffer[self.length..self.length + bytes.len()].copy_from_slice(bytes);
        self.length += bytes.len();
        true
    }

    fn write_with<const N: usize>(&mut self, fill: impl FnOnce(&mut [u8])) -> bool {
        let mut bytes = [0u8; N];
        fill(&mut bytes);
        self.write_bytes(&bytes)
    }

    /// Writes one byte.
    pub fn write_byte(&mut self, value: u8) -> bool {
        self.write_bytes(&[value])
    }

    /// Writes an `i16` in native byte order.
    pub fn write_short(&mut self, value: i16) -> bool {
        self.write_with::<2>(|b| NativeEndian::write_i16(b, value))
    }

    /// Writes a `u16` in native byte order.
    pub fn write_ushort(&mut self, value: u16) -> bool {
        self.write_with::<2>(|b| NativeEndian::write_u16(b, value))
    }

    /// Writes an `i32` in native byte order.
    pub fn write_int(&mut self, value: i32) -> bool {
        self.write_with::<4>(|b| NativeEndian::write_i32(b, value))
    }

    /// Writes a `u32` in native byte order.
    pub fn write_uint(&mut self, value: u32) -> bool {
        self.write_with::<4>(|b| NativeEndian::write_u32(b, value))
    }

    /// Writes an `i64` in native byte order.
    pub fn write_long(&mut self, value: i64) -> bool {
        self.write_with::<8>(|b| NativeEndian::write_i64(b, value))
    }

    /// Writes a `u64` in native byte order.
    pub fn write_ulong(&mut self, value: u64) -> bool {
        self.write_with::<8>(|b| NativeEndian::write_u64(b, value))
    }

    /// Writes an `f32` in native byte order.
    pub fn write_float(&mut self, value: f32) -> bool {
        self.write_with::<4>(|b| NativeEndian::write_f32(b, value))
    }

    /// Writes an `f64` in native byte order.
    pub fn write_double(&mut self, value: f64) -> bool {
        self.write_with::<8>(|b| NativeEndian::write_f64(b, value))
    }

    /// Writes an `i16` in network byte order.
    pub fn write_short_network_byte_order(&mut self, value: i16) -> bool {
        self.write_with::<2>(|b| NetworkEndian::write_i16(b, value))
    }

    /// Writes a `u16` in network byte order.
    pub fn write_ushort_network_byte_order(&mut self, value: u16) -> bool {
        self.write_with::<2>(|b| NetworkEndian::write_u16(b, value))
    }

    /// Writes an `i32` in network byte order.
    pub fn write_int_network_byte_order(&mut self, value: i32) -> bool {
        self.write_with::<4>(|b| NetworkEndian::write_i32(b, value))
    }

    /// Writes a `u32` in network byte order.
    pub fn write_uint_network_byte_order(&mut self, value: u32) -> bool {
        self.write_with::<4>(|b| NetworkEndian::write_u32(b, value))
    }

    /// Writes the low `num_bits` bits of `value` (at most 32).
    pub fn write_raw_bits(&mut self, value: u32, num_bits: u32) -> bool {
        if num_bits > 32 {
            return self.fail();
        }
        if self.length + ((self.bit_index + num_bits + 7) >> 3) as usize > self.capacity() {
            return self.fail();
        }
        self.bit_buffer |= (value as u64 & mask(num_bits)) << self.bit_index;
        self.bit_index += num_bits;
        while self.bit_index >= 8 {
            self.buffer[self.length] = self.bit_buffer as u8;
            self.length += 1;
            self.bit_buffer >>= 8;
            self.bit_index -= 8;
        }
        if self.bit_index > 0 {
            // Keep the partial byte visible through as_slice.
            self.buffer[self.length] = self.bit_buffer as u8;
        }
        true
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_fixed_string(&mut self, value: &str, capacity: FixedStringCapacity) -> bool {
        if value.len() > capacity.max_len() {
            return self.fail();
        }
        if self.length() + 2 + value.len() > self.capacity() {
            return self.fail();
        }
        self.write_ushort(value.len() as u16) && self.write_bytes(value.as_bytes())
    }

    /// Writes a `u32` with the packed integer model.
    pub fn write_packed_uint(&mut self, value: u32, model: &NetworkCompressionModel) -> bool {
        let bucket = model.calculate_bucket(value);
        let (code, length) = model.encode(bucket);
        let offset = value - BUCKET_OFFSETS[bucket];
        let bits = BUCKET_SIZES[bucket] as u32;
        if self.length + ((self.bit_index + length + bits + 7) >> 3) as usize > self.capacity() {
            return self.fail();
        }
        self.write_raw_bits(code, length) && self.write_raw_bits(offset, bits)
    }

    /// Writes a `u64` as two packed halves, high half first.
    pub fn write_packed_ulong(&mut self, value: u64, model: &NetworkCompressionModel) -> bool {
        self.write_packed_uint((value >> 32) as u32, model) && self.write_packed_uint(value as u32, model)
    }

    /// Writes an `i32` zig-zag interleaved so small magnitudes stay small.
    pub fn write_packed_int(&mut self, value: i32, model: &NetworkCompressionModel) -> bool {
        self.write_packed_uint(zig_zag(value), model)
    }

    /// Writes an `i64` zig-zag interleaved.
    pub fn write_packed_long(&mut self, value: i64, model: &NetworkCompressionModel) -> bool {
        self.write_packed_ulong(((value >> 63) ^ (value << 1)) as u64, model)
    }

    /// Writes `baseline - value` as a packed signed integer.
    pub fn write_packed_uint_delta(&mut self, value: u32, baseline: u32, model: &NetworkCompressionModel) -> bool {
        self.write_packed_int(baseline.wrapping_sub(value) as i32, model)
    }

    /// Writes `baseline - value` as a packed signed integer.
    pub fn write_packed_int_delta(&mut self, value: i32, baseline: i32, model: &NetworkCompressionModel) -> bool {
        self.write_packed_int(baseline.wrapping_sub(value), model)
    }

    /// Writes `baseline - value` as a packed signed long.
    pub fn write_packed_long_delta(&mut self, value: i64, baseline: i64, model: &NetworkCompressionModel) -> bool {
        self.write_packed_long(baseline.wrapping_sub(value), model)
    }

    /// Writes one bit if `value` equals `baseline`, otherwise a bit and the raw float.
    pub fn write_packed_float_delta(&mut self, value: f32, baseline: f32) -> bool {
        if value.to_bits() == baseline.to_bits() {
            return self.write_raw_bits(0, 1);
        }
        if self.length + ((self.bit_index + 33 + 7) >> 3) as usize > self.capacity() {
            return self.fail();
        }
        self.write_raw_bits(1, 1) && self.write_raw_bits(value.to_bits(), 32)
    }
}

/// Reads primitives and bit-packed values from a borrowed buffer.
#[derive(Debug, Clone)]
pub struct DataStreamReader<'a> {
    data: &'a [u8],
    read_byte_index: usize,
    bit_buffer: u64,
    bit_index: u32,
    failed_reads: u32,
}

impl<'a> DataStreamReader<'a> {
    /// Creates a reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, read_byte_index: 0, bit_buffer: 0, bit_index: 0, failed_reads: 0 }
    }

    /// Total bytes in the stream.
    pub fn length(&self) -> usize {
        self.data.len()
    }

    /// Bytes consumed, counting a partially read byte.
    pub fn bytes_read(&self) -> usize {
        self.read_byte_index - (self.bit_index >> 3) as usize
    }

    /// Bits consumed.
    pub fn bits_read(&self) -> usize {
        self.read_byte_index * 8 - self.bit_index as usize
    }

    /// Bytes left after the current position.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.bytes_read()
    }

    /// Returns true if any read ran past the end.
    pub fn has_failed_reads(&self) -> bool {
        self.failed_reads > 0
    }

    /// The underlying bytes.
    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    /// Moves to an absolute byte position. Returns false if out of range.
    pub fn seek_set(&mut self, position: usize) -> bool {
        if position > self.data.len() {
            self.failed_reads += 1;
            return false;
        }
        self.read_byte_index = position;
        self.bit_buffer = 0;
        self.bit_index = 0;
        true
    }

    fn flush(&mut self) {
        self.read_byte_index -= (self.bit_index >> 3) as usize;
        self.bit_index = 0;
        self.bit_buffer = 0;
    }

    fn fill_bits(&mut self) {
        while self.bit_index <= 56 && self.read_byte_index < self.data.len() {
            self.bit_buffer |= (self.data[self.read_byte_index] as u64) << self.bit_index;
            self.read_byte_index += 1;
            self.bit_index += 8;
        }
    }

    fn read_raw_bits_internal(&mut self, num_bits: u32) -> u32 {
        if self.bit_index < num_bits {
            self.failed_reads += 1;
            return 0;
        }
        let value = self.bit_buffer & mask(num_bits);
        self.bit_buffer >>= num_bits;
        self.bit_index -= num_bits;
        value as u32
    }

    /// Borrows the next `len` bytes, starting at the next byte boundary.
    pub fn read_slice(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.bytes_read() + len > self.data.len() {
            self.failed_reads += 1;
            return None;
        }
        self.flush();
        let slice = &self.data[self.read_byte_index..self.read_byte_index + len];
        self.read_byte_index += len;
        Some(slice)
    }

    /// Fills `out` with the next bytes. On failure `out` is zeroed.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> bool {
        match self.read_slice(out.len()) {
            Some(slice) => {
                out.copy_from_slice(slice);
                true
            }
            None => {
                out.fill(0);
                false
            }
        }
    }

    fn read_array<const N: usize>(&mut self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.read_bytes(&mut bytes);
        bytes
    }

    /// Reads one byte.
    pub fn read_byte(&mut self) -> u8 {
        self.read_array::<1>()[0]
    }

    /// Reads an `i16` in native byte order.
    pub fn read_short(&mut self) -> i16 {
        NativeEndian::read_i16(&self.read_array::<2>())
    }

    /// Reads a `u16` in native byte order.
    pub fn read_ushort(&mut self) -> u16 {
        NativeEndian::read_u16(&self.read_array::<2>())
    }

    /// Reads an `i32` in native byte order.
    pub fn read_int(&mut self) -> i32 {
        NativeEndian::read_i32(&self.read_array::<4>())
    }

    /// Reads a `u32` in native byte order.
    pub fn read_uint(&mut self) -> u32 {
        NativeEndian::read_u32(&self.read_array::<4>())
    }

    /// Reads an `i64` in native byte order.
    pub fn read_long(&mut self) -> i64 {
        NativeEndian::read_i64(&self.read_array::<8>())
    }

    /// Reads a `u64` in native byte order.
    pub fn read_ulong(&mut self) -> u64 {
        NativeEndian::read_u64(&self.read_array::<8>())
    }

    /// Reads an `f32` in native byte order.
    pub fn read_float(&mut self) -> f32 {
        NativeEndian::read_f32(&self.read_array::<4>())
    }

    /// Reads an `f64` in native byte order.
    pub fn read_double(&mut self) -> f64 {
        NativeEndian::read_f64(&self.read_array::<8>())
    }

    /// Reads an `i16` in network byte order.
    pub fn read_short_network_byte_order(&mut self) -> i16 {
        NetworkEndian::read_i16(&self.read_array::<2>())
    }

    /// Reads a `u16` in network byte order.
    pub fn read_ushort_network_byte_order(&mut self) -> u16 {
        NetworkEndian::read_u16(&self.read_array::<2>())
    }

    /// Reads an `i32` in network byte order.
    pub fn read_int_network_byte_order(&mut self) -> i32 {
        NetworkEndian::read_i32(&self.read_array::<4>())
    }

    /// Reads a `u32` in network byte order.
    pub fn read_uint_network_byte_order(&mut self) -> u32 {
        NetworkEndian::read_u32(&self.read_array::<4>())
    }

    /// Reads `num_bits` raw bits (at most 32).
    pub fn read_raw_bits(&mut self, num_bits: u32) -> u32 {
        if num_bits > 32 {
            self.failed_reads += 1;
            return 0;
        }
        self.fill_bits();
        self.read_raw_bits_internal(num_bits)
    }

    /// Reads a length-prefixed UTF-8 string. Returns an empty string on failure.
    pub fn read_fixed_string(&mut self, capacity: FixedStringCapacity) -> String {
        let len = self.read_ushort() as usize;
        if len > capacity.max_len() {
            self.failed_reads += 1;
            return String::new();
        }
        match self.read_slice(len).map(std::str::from_utf8) {
            Some(Ok(value)) => value.to_owned(),
            Some(Err(_)) => {
                self.failed_reads += 1;
                String::new()
            }
            None => String::new(),
        }
    }

    /// Reads a packed `u32`.
    pub fn read_packed_uint(&mut self, model: &NetworkCompressionModel) -> u32 {
        self.fill_bits();
        let (bucket, length) = model.decode(self.bit_buffer & mask(MAX_HUFFMAN_SYMBOL_LENGTH));
        if self.bit_index < length {
            self.failed_reads += 1;
            return 0;
        }
        self.bit_buffer >>= length;
        self.bit_index -= length;
        let offset = self.read_raw_bits_internal(BUCKET_SIZES[bucket] as u32);
        offset.wrapping_add(BUCKET_OFFSETS[bucket])
    }

    /// Reads a packed `u64`.
    pub fn read_packed_ulong(&mut self, model: &NetworkCompressionModel) -> u64 {
        let high = self.read_packed_uint(model) as u64;
        let low = self.read_packed_uint(model) as u64;
        (high << 32) | low
    }

    /// Reads a packed zig-zag `i32`.
    pub fn read_packed_int(&mut self, model: &NetworkCompressionModel) -> i32 {
        un_zig_zag(self.read_packed_uint(model))
    }

    /// Reads a packed zig-zag `i64`.
    pub fn read_packed_long(&mut self, model: &NetworkCompressionModel) -> i64 {
        let folded = self.read_packed_ulong(model);
        ((folded >> 1) as i64) ^ -((folded & 1) as i64)
    }

    /// Reads a value written with [`DataStreamWriter::write_packed_uint_delta`].
    pub fn read_packed_uint_delta(&mut self, baseline: u32, model: &NetworkCompressionModel) -> u32 {
        baseline.wrapping_sub(self.read_packed_int(model) as u32)
    }

    /// Reads a value written with [`DataStreamWriter::write_packed_int_delta`].
    pub fn read_packed_int_delta(&mut self, baseline: i32, model: &NetworkCompressionModel) -> i32 {
        baseline.wrapping_sub(self.read_packed_int(model))
    }

    /// Reads a value written with [`DataStreamWriter::write_packed_long_delta`].
    pub fn read_packed_long_delta(&mut self, baseline: i64, model: &NetworkCompressionModel) -> i64 {
        baseline.wrapping_sub(self.read_packed_long(model))
    }

    /// Reads a value written with [`DataStreamWriter::write_packed_float_delta`].
    pub fn read_packed_float_delta(&mut self, baseline: f32) -> f32 {
        if self.read_raw_bits(1) == 0 {
            return baseline;
        }
        f32::from_bits(self.read_raw_bits(32))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::compression::DEFAULT_COMPRESSION_MODEL;

    #[test]
    fn test_mixed_round_trip() {
        let mut writer = DataStreamWriter::new(64);
        assert!(writer.write_byte(0xAB));
        assert!(writer.write_short(-1234));
        assert!(writer.write_int(-123_456_789));
        assert!(writer.write_long(i64::MIN + 7));
        assert!(writer.write_float(3.25));
        assert!(writer.write_raw_bits(0b101, 3));
        assert!(writer.write_raw_bits(u32::MAX, 32));
        assert!(writer.write_raw_bits(1, 1));
        assert!(writer.write_ushort_network_byte_order(0x1234));
        assert!(!writer.has_failed_writes());

        let mut reader = DataStreamReader::new(writer.as_slice());
        assert_eq!(reader.read_byte(), 0xAB);
        assert_eq!(reader.read_short(), -1234);
        assert_eq!(reader.read_int(), -123_456_789);
        assert_eq!(reader.read_long(), i64::MIN + 7);
        assert_eq!(reader.read_float(), 3.25);
        assert_eq!(reader.read_raw_bits(3), 0b101);
        assert_eq!(reader.read_raw_bits(32), u32::MAX);
        assert_eq!(reader.read_raw_bits(1), 1);
        assert_eq!(reader.read_ushort_network_byte_order(), 0x1234);
        assert!(!reader.has_failed_reads());
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_network_byte_order_layout() {
        let mut writer = DataStreamWriter::new(8);
        writer.write_uint_network_byte_order(0x0102_0304);
        assert_eq!(writer.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_overflow_keeps_previous_bytes() {
        let mut writer = DataStreamWriter::new(5);
        assert!(writer.write_int(0x0A0B_0C0D));
        assert!(!writer.write_int(7));
        assert!(!writer.write_raw_bits(0xFFFF, 16));
        assert!(writer.write_raw_bits(0x3, 2));

        assert_eq!(writer.failed_writes(), 2);
        assert_eq!(writer.length(), 5);
        let mut reader = DataStreamReader::new(writer.as_slice());
        assert_eq!(reader.read_int(), 0x0A0B_0C0D);
        assert_eq!(reader.read_raw_bits(2), 0x3);
    }

    #[test]
    fn test_raw_bits_limit() {
        let mut writer = DataStreamWriter::new(16);
        assert!(!writer.write_raw_bits(0, 33));
        assert!(writer.has_failed_writes());

        writer.clear();
        assert!(!writer.has_failed_writes());
        assert_eq!(writer.length(), 0);
    }

    #[test]
    fn test_read_past_end_fails_softly() {
        let data = [1u8, 2];
        let mut reader = DataStreamReader::new(&data);
        assert_eq!(reader.read_int(), 0);
        assert!(reader.has_failed_reads());
        assert_eq!(reader.read_ushort_network_byte_order(), 0x0102);
    }

    #[test]
    fn test_fixed_strings() {
        let mut writer = DataStreamWriter::new(128);
        assert!(writer.write_fixed_string("hello", FixedStringCapacity::Bytes32));
        assert!(!writer.write_fixed_string(&"x".repeat(31), FixedStringCapacity::Bytes32));
        assert!(writer.write_fixed_string(&"y".repeat(62), FixedStringCapacity::Bytes64));

        let mut reader = DataStreamReader::new(writer.as_slice());
        assert_eq!(reader.read_fixed_string(FixedStringCapacity::Bytes32), "hello");
        assert_eq!(reader.read_fixed_string(FixedStringCapacity::Bytes64), "y".repeat(62));
        assert!(!reader.has_failed_reads());
    }

    #[test]
    fn test_fixed_string_longer_than_capacity_is_rejected_on_read() {
        let mut writer = DataStreamWriter::new(128);
        writer.write_fixed_string(&"z".repeat(40), FixedStringCapacity::Bytes64);

        let mut reader = DataStreamReader::new(writer.as_slice());
        assert_eq!(reader.read_fixed_string(FixedStringCapacity::Bytes32), "");
        assert!(reader.has_failed_reads());
    }

    #[test]
    fn test_packed_values_are_compact() {
        let model = DEFAULT_COMPRESSION_MODEL;
        let mut writer = DataStreamWriter::new(64);
        for value in 0..8u32 {
            writer.write_packed_uint(value, &model);
        }
        assert_eq!(writer.length(), 5);

        let mut reader = DataStreamReader::new(writer.as_slice());
        for value in 0..8u32 {
            assert_eq!(reader.read_packed_uint(&model), value);
        }
    }

    #[test]
    fn test_packed_float_delta() {
        let mut writer = DataStreamWriter::new(16);
        writer.write_packed_float_delta(1.5, 1.5);
        writer.write_packed_float_delta(-2.0, 1.5);
        assert_eq!(writer.length_in_bits(), 1 + 33);

        let mut reader = DataStreamReader::new(writer.as_slice());
        assert_eq!(reader.read_packed_float_delta(1.5), 1.5);
        assert_eq!(reader.read_packed_float_delta(1.5), -2.0);
    }

    #[test]
    fn test_packed_write_overflow() {
        let model = DEFAULT_COMPRESSION_MODEL;
        let mut writer = DataStreamWriter::new(2);
        assert!(!writer.write_packed_uint(u32::MAX, &model));
        assert_eq!(writer.length(), 0);
        assert!(writer.has_failed_writes());
    }

    proptest! {
        #[test]
        fn prop_packed_int_delta_round_trip(value: i32, baseline: i32) {
            let model = DEFAULT_COMPRESSION_MODEL;
            let mut writer = DataStreamWriter::new(16);
            prop_assert!(writer.write_packed_int_delta(value, baseline, &model));

            let mut reader = DataStreamReader::new(writer.as_slice());
            prop_assert_eq!(reader.read_packed_int_delta(baseline, &model), value);
            prop_assert!(!reader.has_failed_reads());
        }

        #[test]
        fn prop_packed_uint_and_long_round_trip(a: u32, b: u32, c: i64, d: i64) {
            let model = DEFAULT_COMPRESSION_MODEL;
            let mut writer = DataStreamWriter::new(64);
            writer.write_packed_uint_delta(a, b, &model);
            writer.write_packed_long_delta(c, d, &model);
            writer.write_packed_ulong(c as u64, &model);

            let mut reader = DataStreamReader::new(writer.as_slice());
            prop_assert_eq!(reader.read_packed_uint_delta(b, &model), a);
            prop_assert_eq!(reader.read_packed_long_delta(d, &model), c);
            prop_assert_eq!(reader.read_packed_ulong(&model), c as u64);
        }

        #[test]
        fn prop_stream_round_trip(
            byte: u8, short: i16, int: i32, long: i64, float: f32,
            bits in 1u32..=32, raw: u32,
        ) {
            let mut writer = DataStreamWriter::new(64);
            writer.write_byte(byte);
            writer.write_raw_bits(raw, bits);
            writer.write_short(short);
            writer.write_int(int);
            writer.write_long(long);
            writer.write_float(float);
            prop_assert!(!writer.has_failed_writes());

            let mut reader = DataStreamReader::new(writer.as_slice());
            let expected_raw = if bits == 32 { raw } else { raw & ((1 << bits) - 1) };
            prop_assert_eq!(reader.read_byte(), byte);
            prop_assert_eq!(reader.read_raw_bits(bits), expected_raw);
            prop_assert_eq!(reader.read_short(), short);
            prop_assert_eq!(reader.read_int(), int);
            prop_assert_eq!(reader.read_long(), long);
            prop_assert_eq!(reader.read_float().to_bits(), float.to_bits());
        }
    }
}
