//! Payload masking, RFC 6455 section 5.3.

/// A fresh masking key for an outgoing client frame.
pub fn generate_mask() -> [u8; 4] {
    rand::random()
}

/// Masks or unmasks `buf` in place. Applying the same key twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);
    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        let masked = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) ^ mask_u32;
        word.copy_from_slice(&masked.to_ne_bytes());
    }
    // the tail starts on a multiple of four, so the key lines up again
    apply_mask_fallback(words.into_remainder(), mask);
}

#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}
