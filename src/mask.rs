//! WebSocket frame masking utilities
//!
//! The masking key is always handled as four independent bytes in the order
//! they appear on the wire. Payload byte `i` is XORed with key byte `i % 4`.
//!
//! RNG backends:
//! - `getrandom` (default): OS CSPRNG, falls back to `fastrand` if the OS
//!   source reports an error
//! - without `getrandom`: `fastrand` only

/// XOR `data` in place with `mask`, starting at key byte 0
///
/// Applying the same key twice restores the original payload.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    apply_mask_offset(data, mask, 0);
}

/// XOR `data` in place with `mask`, starting at key byte `offset % 4`
///
/// Used when a payload is unmasked in several pieces.
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    let rotated = [
        mask[offset % 4],
        mask[(offset + 1) % 4],
        mask[(offset + 2) % 4],
        mask[(offset + 3) % 4],
    ];

    let mut chunks = data.chunks_exact_mut(4);
    for chunk in &mut chunks {
        chunk[0] ^= rotated[0];
        chunk[1] ^= rotated[1];
        chunk[2] ^= rotated[2];
        chunk[3] ^= rotated[3];
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= rotated[i];
    }
}

/// Generate a fresh masking key for one client frame
#[inline]
pub fn generate_mask() -> [u8; 4] {
    random_bytes::<4>()
}

/// Fill an array with random bytes
///
/// Also used for the 16-byte handshake nonce.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    fill_random(&mut buf);
    buf
}

#[cfg(feature = "getrandom")]
fn fill_random(buf: &mut [u8]) {
    if let Err(e) = getrandom::getrandom(buf) {
        tracing::warn!(error = %e, "OS random source failed, using fastrand");
        fill_fastrand(buf);
    }
}

#[cfg(not(feature = "getrandom"))]
fn fill_random(buf: &mut [u8]) {
    fill_fastrand(buf);
}

fn fill_fastrand(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        *byte = fastrand::u8(..);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mask_wire_order() {
        let mut data = [0u8; 6];
        apply_mask(&mut data, [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(data, [0x01, 0x02, 0x03, 0x04, 0x01, 0x02]);
    }

    #[test]
    fn test_mask_rfc_example() {
        // RFC 6455 section 5.7: masked "Hello"
        let mut data = [0x7f, 0x9f, 0x4d, 0x51, 0x58];
        apply_mask(&mut data, [0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(&data, b"Hello");
    }

    #[test]
    fn test_mask_offset_matches_whole() {
        let mask = [0xAA, 0xBB, 0xCC, 0xDD];
        let original: Vec<u8> = (0..37).collect();

        let mut whole = original.clone();
        apply_mask(&mut whole, mask);

        let mut split = original.clone();
        let (a, b) = split.split_at_mut(7);
        apply_mask_offset(a, mask, 0);
        apply_mask_offset(b, mask, 7);

        assert_eq!(whole, split);
    }

    #[test]
    fn test_random_masks_differ() {
        let masks: Vec<[u8; 4]> = (0..8).map(|_| generate_mask()).collect();
        assert!(masks.windows(2).any(|w| w[0] != w[1]));
    }

    proptest! {
        #[test]
        fn mask_is_self_inverse(payload in proptest::collection::vec(any::<u8>(), 0..512), key in any::<[u8; 4]>()) {
            let mut data = payload.clone();
            apply_mask(&mut data, key);
            apply_mask(&mut data, key);
            prop_assert_eq!(data, payload);
        }
    }
}
