//! XOR distance metric over node coordinates.

use std::cmp::Ordering;

use shardnet_common::crypto::{Hash, HASH_SIZE};

use crate::config::HASH_BITS;

/// XOR of two coordinates, the raw Kademlia distance.
pub fn xor_distance(a: &Hash, b: &Hash) -> [u8; HASH_SIZE] {
    let mut result = [0u8; HASH_SIZE];
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    for i in 0..HASH_SIZE {
        result[i] = a_bytes[i] ^ b_bytes[i];
    }
    result
}

/// Log2 distance between two coordinates, the bucket index.
///
/// Returns 0 iff the coordinates are identical, otherwise
/// `HASH_BITS - leading_zero_bits(xor)`, i.e. a value in `1..=HASH_BITS`.
/// Symmetric by construction.
pub fn log_dist(a: &Hash, b: &Hash) -> usize {
    let distance = xor_distance(a, b);

    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let leading = i * 8 + byte.leading_zeros() as usize;
            return HASH_BITS - leading;
        }
    }

    0
}

/// Compare the distances of `a` and `b` to `target`.
///
/// `Ordering::Less` means `a` is strictly closer to the target.
pub fn dist_cmp(target: &Hash, a: &Hash, b: &Hash) -> Ordering {
    let dist_a = xor_distance(target, a);
    let dist_b = xor_distance(target, b);
    dist_a.cmp(&dist_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardnet_common::crypto::hash;

    #[test]
    fn test_log_dist_self_is_zero() {
        let a = hash(b"some node");
        assert_eq!(log_dist(&a, &a), 0);
    }

    #[test]
    fn test_log_dist_symmetric() {
        let a = hash(b"node a");
        let b = hash(b"node b");
        assert_eq!(log_dist(&a, &b), log_dist(&b, &a));
    }

    #[test]
    fn test_log_dist_known_values() {
        let zero = Hash::zero();

        // differ only in the least significant bit
        let mut bytes = [0u8; HASH_SIZE];
        bytes[HASH_SIZE - 1] = 0b0000_0001;
        assert_eq!(log_dist(&zero, &Hash::new(bytes)), 1);

        // differ in the most significant bit
        let mut bytes = [0u8; HASH_SIZE];
        bytes[0] = 0b1000_0000;
        assert_eq!(log_dist(&zero, &Hash::new(bytes)), HASH_BITS);
    }

    #[test]
    fn test_log_dist_in_bucket_range() {
        let a = hash(b"left");
        for i in 0..64u32 {
            let b = hash(&i.to_be_bytes());
            let d = log_dist(&a, &b);
            assert!(d <= HASH_BITS);
        }
    }

    #[test]
    fn test_dist_cmp() {
        let target = Hash::zero();
        let mut near = [0u8; HASH_SIZE];
        near[HASH_SIZE - 1] = 1;
        let mut far = [0u8; HASH_SIZE];
        far[0] = 1;

        assert_eq!(
            dist_cmp(&target, &Hash::new(near), &Hash::new(far)),
            Ordering::Less
        );
        assert_eq!(
            dist_cmp(&target, &Hash::new(far), &Hash::new(near)),
            Ordering::Greater
        );
        assert_eq!(
            dist_cmp(&target, &Hash::new(near), &Hash::new(near)),
            Ordering::Equal
        );
    }
}
