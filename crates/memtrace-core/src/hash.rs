//! SipHash-2-4 over byte slices for callsite-record identity.
//!
//! A callsite record is hashed over its exact serialized byte span; two
//! genuinely different records colliding on this hash is treated as a fatal
//! consistency violation by the record table, so the hash has to be strong
//! enough that this never happens in practice.
//!
//! Uses a fixed secret key. This is NOT a cryptographic application; the
//! goal is collision resistance for record identity.

/// Fixed key (chosen by fair dice roll, guaranteed to be random).
const K0: u64 = 0x0706_0504_0302_0100;
const K1: u64 = 0x0F0E_0D0C_0B0A_0908;

/// Hash an arbitrary byte slice with SipHash-2-4.
#[must_use]
pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut v0: u64 = K0 ^ 0x736f_6d65_7073_6575;
    let mut v1: u64 = K1 ^ 0x646f_7261_6e64_6f6d;
    let mut v2: u64 = K0 ^ 0x6c79_6765_6e65_7261;
    let mut v3: u64 = K1 ^ 0x7465_6462_7974_6573;

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let m = u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
        v3 ^= m;
        sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
        sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
        v0 ^= m;
    }

    // Final block: remaining bytes plus the total length in the top byte.
    let mut last = [0u8; 8];
    let rem = chunks.remainder();
    last[..rem.len()].copy_from_slice(rem);
    last[7] = data.len() as u8;
    let m = u64::from_le_bytes(last);
    v3 ^= m;
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    v0 ^= m;

    v2 ^= 0xFF;
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);

    v0 ^ v1 ^ v2 ^ v3
}

#[inline(always)]
fn sip_round(v0: &mut u64, v1: &mut u64, v2: &mut u64, v3: &mut u64) {
    *v0 = v0.wrapping_add(*v1);
    *v1 = v1.rotate_left(13);
    *v1 ^= *v0;
    *v0 = v0.rotate_left(32);
    *v2 = v2.wrapping_add(*v3);
    *v3 = v3.rotate_left(16);
    *v3 ^= *v2;
    *v0 = v0.wrapping_add(*v3);
    *v3 = v3.rotate_left(21);
    *v3 ^= *v0;
    *v2 = v2.wrapping_add(*v1);
    *v1 = v1.rotate_left(17);
    *v1 ^= *v2;
    *v2 = v2.rotate_left(32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_nonempty_differ() {
        assert_ne!(hash_bytes(&[]), hash_bytes(&[0]));
    }

    #[test]
    fn same_input_same_hash() {
        let data = b"callsite record bytes";
        assert_eq!(hash_bytes(data), hash_bytes(data));
    }

    #[test]
    fn length_is_part_of_identity() {
        // Trailing zeros must not collide with a shorter input.
        assert_ne!(hash_bytes(&[1, 2, 3]), hash_bytes(&[1, 2, 3, 0]));
        assert_ne!(hash_bytes(&[0; 8]), hash_bytes(&[0; 16]));
    }

    #[test]
    fn single_bit_flip_changes_hash() {
        let mut data = [0u8; 24];
        let base = hash_bytes(&data);
        for i in 0..data.len() {
            data[i] ^= 1;
            assert_ne!(hash_bytes(&data), base, "flip at byte {i}");
            data[i] ^= 1;
        }
    }

    #[test]
    fn no_collisions_in_small_sweep() {
        let mut seen = std::collections::HashSet::new();
        for i in 0u32..10_000 {
            assert!(seen.insert(hash_bytes(&i.to_le_bytes())));
        }
    }
}
