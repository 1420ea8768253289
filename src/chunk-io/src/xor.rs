/// XOR `source` into `destination` in place. Both slices must be the same
/// length (block-sized in all callers).
pub fn block_xor(destination: &mut [u8], source: &[u8]) {
    debug_assert_eq!(destination.len(), source.len());
    // Word-at-a-time main loop, byte tail.
    let words = destination.len() / 8;
    for i in 0..words {
        let offset = i * 8;
        let a = u64::from_ne_bytes(destination[offset..offset + 8].try_into().unwrap());
        let b = u64::from_ne_bytes(source[offset..offset + 8].try_into().unwrap());
        destination[offset..offset + 8].copy_from_slice(&(a ^ b).to_ne_bytes());
    }
    for i in words * 8..destination.len() {
        destination[i] ^= source[i];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_involutive() {
        let mut data: Vec<u8> = (0..100u8).collect();
        let mask: Vec<u8> = (0..100u8).map(|b| b.wrapping_mul(37)).collect();
        let original = data.clone();
        block_xor(&mut data, &mask);
        assert_ne!(data, original);
        block_xor(&mut data, &mask);
        assert_eq!(data, original);
    }
}
