/// XORs `buf` against `mask`, cycling through the key every four bytes.
///
/// The operation is its own inverse: masking twice with the same key restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        for (byte, key) in word.iter_mut().zip(mask) {
            *byte ^= key;
        }
    }

    // the tail is shorter than a word but still starts at a multiple of four
    for (byte, key) in words.into_remainder().iter_mut().zip(mask) {
        *byte ^= key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_mask(buf: &mut [u8], mask: [u8; 4]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    #[test]
    fn test_mask_matches_bytewise_xor() {
        let mask = [0x6d, 0xb6, 0xb2, 0x80];
        for len in 0..=33 {
            let data: Vec<u8> = (0..len).map(|i| (i * 31 + 7) as u8).collect();

            let mut expected = data.clone();
            reference_mask(&mut expected, mask);

            let mut actual = data.clone();
            apply_mask(&mut actual, mask);

            assert_eq!(expected, actual, "length {len}");
        }
    }

    #[test]
    fn test_mask_is_involution() {
        let mask = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"Hello, World! This is a test message with various lengths.";

        let mut data = original.to_vec();
        apply_mask(&mut data, mask);
        assert_ne!(&data[..], &original[..]);

        apply_mask(&mut data, mask);
        assert_eq!(&data[..], &original[..]);
    }

    #[test]
    fn test_mask_short_tails() {
        let mask = [0x12, 0x34, 0x56, 0x78];

        let mut empty: Vec<u8> = vec![];
        apply_mask(&mut empty, mask);
        assert!(empty.is_empty());

        let mut five = vec![0xAB; 5];
        apply_mask(&mut five, mask);
        assert_eq!(five, vec![0xAB ^ 0x12, 0xAB ^ 0x34, 0xAB ^ 0x56, 0xAB ^ 0x78, 0xAB ^ 0x12]);
    }

    #[test]
    fn test_zero_mask_is_identity() {
        let mut data = b"unchanged".to_vec();
        apply_mask(&mut data, [0; 4]);
        assert_eq!(&data, b"unchanged");
    }
}
