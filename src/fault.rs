//! Bit-level fault injection for negative ("bad bit") testing.

/// Applies a 32-bit flip mask to a packet, MSB-first across the bytes.
///
/// Mask bit 31 targets the most-significant bit of byte 0 (the address
/// byte of a 4-byte packet); mask bit 0 targets the least-significant
/// bit of byte 3 (the checksum byte). Set bits are XOR-ed into the
/// packet, so the result usually violates the checksum invariant --
/// that is the point. Applying the same mask twice restores the
/// original packet.
///
/// Mask bits that map past the end of a shorter packet terminate the
/// walk; the remaining (lower) mask bits are ignored.
pub fn apply_flip_mask(packet: &[u8], mask: u32) -> Vec<u8> {
    let mut flipped = packet.to_vec();
    for bit_index in (0..32).rev() {
        if (mask >> bit_index) & 0x1 != 0 {
            let byte_index = (31 - bit_index) / 8;
            if byte_index >= flipped.len() {
                break;
            }
            let bit_in_byte = bit_index % 8;
            flipped[byte_index] ^= 1 << bit_in_byte;
        }
    }
    flipped
}
