//! Packed integer compression model.
//!
//! Values are split into sixteen magnitude buckets. A bucket is identified by
//! a canonical Huffman code (2 to 6 bits) followed by the value's offset into
//! the bucket as raw bits. Small values, the common case for deltas against a
//! baseline, cost a handful of bits.
//!
//! Codes are stored bit-reversed because the stream writes least significant
//! bit first; the first bit on the wire is the most significant bit of the
//! canonical code, which keeps decoding a single table lookup on the next
//! [`MAX_HUFFMAN_SYMBOL_LENGTH`] bits.

/// Number of magnitude buckets.
pub const BUCKET_COUNT: usize = 16;

/// Longest Huffman code in bits.
pub const MAX_HUFFMAN_SYMBOL_LENGTH: u32 = 6;

/// Raw bits stored after the code, per bucket.
pub const BUCKET_SIZES: [u8; BUCKET_COUNT] = [0, 0, 1, 2, 3, 4, 6, 8, 10, 12, 15, 18, 21, 24, 27, 32];

/// Smallest value of each bucket.
pub const BUCKET_OFFSETS: [u32; BUCKET_COUNT] = [
    0, 1, 2, 4, 8, 16, 32, 96, 352, 1376, 5472, 38240, 300384, 2397536, 19174752, 153392480,
];

/// Code length of each bucket symbol.
const SYMBOL_LENGTHS: [u8; BUCKET_COUNT] = [2, 3, 3, 3, 4, 4, 4, 5, 5, 5, 6, 6, 6, 6, 6, 6];

const DECODE_TABLE_SIZE: usize = 1 << MAX_HUFFMAN_SYMBOL_LENGTH;

/// Shared encode/decode tables.
#[derive(Debug, Clone)]
pub struct NetworkCompressionModel {
    /// `(length << 16) | reversed_code` per symbol.
    encode_table: [u32; BUCKET_COUNT],
    /// `(symbol << 8) | length` per 6-bit peek.
    decode_table: [u16; DECODE_TABLE_SIZE],
}

/// The model every stream uses unless told otherwise.
pub const DEFAULT_COMPRESSION_MODEL: NetworkCompressionModel = NetworkCompressionModel::new();

impl NetworkCompressionModel {
    /// Builds the canonical code from the fixed symbol lengths.
    pub const fn new() -> Self {
        let mut encode_table = [0u32; BUCKET_COUNT];
        let mut decode_table = [0u16; DECODE_TABLE_SIZE];

        let mut code: u32 = 0;
        let mut symbol = 0;
        while symbol < BUCKET_COUNT {
            let length = SYMBOL_LENGTHS[symbol] as u32;
            if symbol > 0 {
                code = (code + 1) << (length - SYMBOL_LENGTHS[symbol - 1] as u32);
            }
            let reversed = reverse_bits(code, length);
            encode_table[symbol] = (length << 16) | reversed;

            let mask = (1u32 << length) - 1;
            let mut peek = 0;
            while peek < DECODE_TABLE_SIZE {
                if (peek as u32) & mask == reversed {
                    decode_table[peek] = ((symbol as u16) << 8) | length as u16;
                }
                peek += 1;
            }
            symbol += 1;
        }

        Self { encode_table, decode_table }
    }

    /// Bucket holding `value`.
    pub fn calculate_bucket(&self, value: u32) -> usize {
        let mut bucket = 0;
        while bucket + 1 < BUCKET_COUNT && value >= BUCKET_OFFSETS[bucket + 1] {
            bucket += 1;
        }
        bucket
    }

    /// Reversed code and its length for a bucket.
    pub fn encode(&self, bucket: usize) -> (u32, u32) {
        let entry = self.encode_table[bucket];
        (entry & 0xFFFF, entry >> 16)
    }

    /// Bucket and code length for the next six stream bits.
    pub fn decode(&self, peek: u64) -> (usize, u32) {
        let entry = self.decode_table[(peek as usize) & (DECODE_TABLE_SIZE - 1)];
        ((entry >> 8) as usize, (entry & 0xFF) as u32)
    }

    /// Bits needed to pack `value`.
    pub fn packed_size(&self, value: u32) -> u32 {
        let bucket = self.calculate_bucket(value);
        let (_, length) = self.encode(bucket);
        length + BUCKET_SIZES[bucket] as u32
    }
}

impl Default for NetworkCompressionModel {
    fn default() -> Self {
        Self::new()
    }
}

const fn reverse_bits(value: u32, length: u32) -> u32 {
    let mut result = 0;
    let mut i = 0;
    while i < length {
        result |= ((value >> i) & 1) << (length - 1 - i);
        i += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_offsets_are_contiguous() {
        for bucket in 0..BUCKET_COUNT - 1 {
            assert_eq!(
                BUCKET_OFFSETS[bucket] + (1u32 << BUCKET_SIZES[bucket]),
                BUCKET_OFFSETS[bucket + 1]
            );
        }
    }

    #[test]
    fn test_code_is_complete() {
        let kraft: f64 = SYMBOL_LENGTHS.iter().map(|&l| 0.5f64.powi(l as i32)).sum();
        assert!((kraft - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_every_symbol_decodes_to_itself() {
        let model = NetworkCompressionModel::new();
        for bucket in 0..BUCKET_COUNT {
            let (code, length) = model.encode(bucket);
            // Trailing garbage must not change the result.
            let peek = code as u64 | (0b10_1010 << length);
            assert_eq!(model.decode(peek), (bucket, length));
        }
    }

    #[test]
    fn test_bucket_selection() {
        let model = NetworkCompressionModel::default();
        assert_eq!(model.calculate_bucket(0), 0);
        assert_eq!(model.calculate_bucket(1), 1);
        assert_eq!(model.calculate_bucket(3), 2);
        assert_eq!(model.calculate_bucket(95), 6);
        assert_eq!(model.calculate_bucket(96), 7);
        assert_eq!(model.calculate_bucket(u32::MAX), 15);
    }

    #[test]
    fn test_small_values_are_cheap() {
        let model = DEFAULT_COMPRESSION_MODEL;
        assert_eq!(model.packed_size(0), 2);
        assert!(model.packed_size(10) < 10);
        assert_eq!(model.packed_size(u32::MAX), 6 + 32);
    }
}
