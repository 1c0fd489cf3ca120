use crate::support::constants::MAX_PACKET_DATA_SIZE;
use quark::crypto;

/// Returns the number of bits needed to represent values in `[0, value)`.
#[inline]
pub fn next_binary_log2(value: u32) -> u32 {
    if value <= 1 {
        0
    } else {
        32 - (value - 1).leading_zeros()
    }
}

/// Bit-granular serialization over a fixed buffer.
///
/// Writes past the end of the stream (or reads past the end of received data) set a sticky
/// error flag instead of failing the individual operation; reads return zero values once the
/// stream has errored. Packet assembly code checks the flag once at the end and treats it as
/// a protocol error, which keeps the hot encode/decode paths free of result plumbing.
pub struct BitStream {
    data: Vec<u8>,
    bit_num: usize,
    bit_end: usize,
    error: bool,
}

impl BitStream {
    /// Creates a write stream over a zeroed buffer of `byte_size` bytes.
    #[inline]
    pub fn with_size(byte_size: usize) -> BitStream {
        BitStream {
            data: vec![0; byte_size],
            bit_num: 0,
            bit_end: byte_size * 8,
            error: false,
        }
    }

    /// Creates a write stream for an outgoing packet. The buffer is allocated at the
    /// maximum datagram size so a trailing message signature can be appended after the
    /// payload, but writes are limited to `target_size` bytes.
    #[inline]
    pub fn packet(target_size: usize) -> BitStream {
        let target = target_size.min(MAX_PACKET_DATA_SIZE);
        BitStream {
            data: vec![0; MAX_PACKET_DATA_SIZE],
            bit_num: 0,
            bit_end: target * 8,
            error: false,
        }
    }

    /// Creates a read stream over a copy of received datagram bytes.
    #[inline]
    pub fn from_bytes(bytes: &[u8]) -> BitStream {
        BitStream {
            data: bytes.to_vec(),
            bit_num: 0,
            bit_end: bytes.len() * 8,
            error: false,
        }
    }

    #[inline]
    pub fn was_error(&self) -> bool {
        self.error
    }

    #[inline]
    pub fn raise_error(&mut self) {
        self.error = true;
    }

    #[inline]
    pub fn clear_error(&mut self) {
        self.error = false;
    }

    #[inline]
    pub fn bit_position(&self) -> usize {
        self.bit_num
    }

    /// Moves the stream cursor. Used to rewind a partially written entry that did not fit.
    #[inline]
    pub fn set_bit_position(&mut self, position: usize) {
        self.bit_num = position;
    }

    /// Reserves `bit_count` bits to be backpatched later with `write_int_at`.
    #[inline]
    pub fn advance_bit_position(&mut self, bit_count: usize) {
        self.bit_num += bit_count;
    }

    /// Current position rounded up to a whole byte.
    #[inline]
    pub fn byte_position(&self) -> usize {
        (self.bit_num + 7) >> 3
    }

    /// Rounds the cursor up to the next byte boundary, the precondition for the
    /// encrypted regions of handshake and data packets.
    #[inline]
    pub fn align_byte(&mut self) {
        self.bit_num = (self.bit_num + 7) & !7;
    }

    #[inline]
    pub fn bit_space_available(&self) -> usize {
        self.bit_end.saturating_sub(self.bit_num)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.bit_num >= self.bit_end
    }

    /// Total stream size in bytes (for read streams, the received datagram size).
    #[inline]
    pub fn stream_byte_size(&self) -> usize {
        (self.bit_end + 7) >> 3
    }

    /// The assembled bytes of a write stream.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.byte_position()]
    }

    #[inline]
    pub fn buffer(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    fn check_space(&mut self, bit_count: usize) -> bool {
        if self.error || self.bit_num + bit_count > self.bit_end {
            self.error = true;
            return false;
        }
        true
    }

    /// Writes the low `bit_count` bits of `value`, least significant bit first.
    pub fn write_int(&mut self, value: u32, bit_count: u32) {
        debug_assert!(bit_count <= 32);
        if bit_count == 0 || !self.check_space(bit_count as usize) {
            return;
        }
        let mut value = u64::from(value);
        let mut bits_left = bit_count as usize;
        let mut pos = self.bit_num;
        while bits_left > 0 {
            let byte = pos >> 3;
            let bit = pos & 7;
            let take = (8 - bit).min(bits_left);
            let mask = ((1u16 << take) - 1) as u8;
            self.data[byte] =
                (self.data[byte] & !(mask << bit)) | (((value as u8) & mask) << bit);
            value >>= take;
            pos += take;
            bits_left -= take;
        }
        self.bit_num = pos;
    }

    /// Reads `bit_count` bits, returning 0 once the stream has errored.
    pub fn read_int(&mut self, bit_count: u32) -> u32 {
        debug_assert!(bit_count <= 32);
        if bit_count == 0 || !self.check_space(bit_count as usize) {
            return 0;
        }
        let mut value: u64 = 0;
        let mut shift = 0usize;
        let mut bits_left = bit_count as usize;
        let mut pos = self.bit_num;
        while bits_left > 0 {
            let byte = pos >> 3;
            let bit = pos & 7;
            let take = (8 - bit).min(bits_left);
            let mask = ((1u16 << take) - 1) as u8;
            value |= u64::from((self.data[byte] >> bit) & mask) << shift;
            shift += take;
            pos += take;
            bits_left -= take;
        }
        self.bit_num = pos;
        value as u32
    }

    /// Backpatches `bit_count` bits at an earlier position without moving the cursor.
    pub fn write_int_at(&mut self, value: u32, bit_count: u32, bit_position: usize) {
        let saved = self.bit_num;
        self.bit_num = bit_position;
        self.write_int(value, bit_count);
        self.bit_num = saved;
    }

    /// Writes a single bit and returns the value written, enabling the
    /// `if stream.write_flag(cond) { ... }` idiom.
    #[inline]
    pub fn write_flag(&mut self, value: bool) -> bool {
        self.write_int(value as u32, 1);
        value
    }

    #[inline]
    pub fn read_flag(&mut self) -> bool {
        self.read_int(1) != 0
    }

    /// Signed integers are biased into the unsigned range for transmission.
    #[inline]
    pub fn write_signed_int(&mut self, value: i32, bit_count: u32) {
        let bias = 1i64 << (bit_count - 1);
        self.write_int((i64::from(value) + bias) as u32, bit_count);
    }

    #[inline]
    pub fn read_signed_int(&mut self, bit_count: u32) -> i32 {
        let bias = 1i64 << (bit_count - 1);
        (i64::from(self.read_int(bit_count)) - bias) as i32
    }

    /// Writes a value in `[range_start, range_end]` using the minimum number of bits.
    pub fn write_ranged_u32(&mut self, value: u32, range_start: u32, range_end: u32) {
        debug_assert!(range_start <= value && value <= range_end);
        let range_size = range_end - range_start + 1;
        let bits = next_binary_log2(range_size);
        self.write_int(value.saturating_sub(range_start), bits);
    }

    pub fn read_ranged_u32(&mut self, range_start: u32, range_end: u32) -> u32 {
        let range_size = range_end - range_start + 1;
        let bits = next_binary_log2(range_size);
        let value = range_start.wrapping_add(self.read_int(bits));
        if value > range_end {
            self.error = true;
            return range_start;
        }
        value
    }

    /// Quantizes a float in `[0, 1]` to `bit_count` bits.
    #[inline]
    pub fn write_float(&mut self, value: f32, bit_count: u32) {
        let max = ((1u64 << bit_count) - 1) as f32;
        let clamped = value.max(0.0).min(1.0);
        self.write_int((clamped * max + 0.5) as u32, bit_count);
    }

    #[inline]
    pub fn read_float(&mut self, bit_count: u32) -> f32 {
        let max = ((1u64 << bit_count) - 1) as f32;
        self.read_int(bit_count) as f32 / max
    }

    /// Quantizes a float in `[-1, 1]` to `bit_count` bits.
    #[inline]
    pub fn write_signed_float(&mut self, value: f32, bit_count: u32) {
        self.write_float(value * 0.5 + 0.5, bit_count);
    }

    #[inline]
    pub fn read_signed_float(&mut self, bit_count: u32) -> f32 {
        self.read_float(bit_count) * 2.0 - 1.0
    }

    /// Writes raw bytes. Byte-aligned streams take the slice copy fast path.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if !self.check_space(bytes.len() * 8) {
            return;
        }
        if self.bit_num & 7 == 0 {
            let start = self.bit_num >> 3;
            self.data[start..start + bytes.len()].copy_from_slice(bytes);
            self.bit_num += bytes.len() * 8;
        } else {
            for &byte in bytes {
                self.write_int(u32::from(byte), 8);
            }
        }
    }

    pub fn read_bytes(&mut self, out: &mut [u8]) {
        if !self.check_space(out.len() * 8) {
            for slot in out.iter_mut() {
                *slot = 0;
            }
            return;
        }
        if self.bit_num & 7 == 0 {
            let start = self.bit_num >> 3;
            out.copy_from_slice(&self.data[start..start + out.len()]);
            self.bit_num += out.len() * 8;
        } else {
            for slot in out.iter_mut() {
                *slot = self.read_int(8) as u8;
            }
        }
    }

    /// Length-prefixed string, capped at 255 bytes.
    pub fn write_string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        let len = bytes.len().min(255);
        self.write_int(len as u32, 8);
        self.write_bytes(&bytes[..len]);
    }

    pub fn read_string(&mut self) -> String {
        let len = self.read_int(8) as usize;
        let mut bytes = vec![0u8; len];
        self.read_bytes(&mut bytes);
        if self.error {
            return String::new();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Appends the message signature to the stream and encrypts everything from
/// `encrypt_start` to the end with the connection cipher. The plaintext prefix is bound
/// into the signature as additional data, so header tampering invalidates the packet.
pub fn hash_and_encrypt(
    stream: &mut BitStream,
    encrypt_start: usize,
    nonce: u64,
    key: &[u8; crypto::KEY_SIZE],
) -> bool {
    stream.align_byte();
    let total = stream.byte_position();
    if stream.data.len() < total + crypto::MAC_SIZE {
        return false;
    }
    let plain = stream.data[encrypt_start..total].to_vec();
    let prefix = stream.data[..encrypt_start].to_vec();
    if !crypto::encrypt(
        &mut stream.data[encrypt_start..total + crypto::MAC_SIZE],
        &plain,
        &prefix,
        nonce,
        key,
    ) {
        return false;
    }
    let end = (total + crypto::MAC_SIZE) * 8;
    stream.bit_num = end;
    stream.bit_end = stream.bit_end.max(end);
    true
}

/// Decrypts the stream tail in place and validates the trailing message signature,
/// trimming it from the readable region. Returns false (and leaves the stream alone)
/// when validation fails; callers drop the packet silently.
pub fn decrypt_and_check_hash(
    stream: &mut BitStream,
    decrypt_start: usize,
    nonce: u64,
    key: &[u8; crypto::KEY_SIZE],
) -> bool {
    let total = stream.stream_byte_size();
    if total < decrypt_start + crypto::MAC_SIZE {
        return false;
    }
    let cipher = stream.data[decrypt_start..total].to_vec();
    let prefix = stream.data[..decrypt_start].to_vec();
    let mut plain = vec![0u8; cipher.len() - crypto::MAC_SIZE];
    if !crypto::decrypt(&mut plain, &cipher, &prefix, nonce, key) {
        return false;
    }
    stream.data[decrypt_start..decrypt_start + plain.len()].copy_from_slice(&plain);
    stream.bit_end = (decrypt_start + plain.len()) * 8;
    true
}
