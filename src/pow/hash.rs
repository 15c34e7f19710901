//! DeepSeekHashV1: a Keccak-f[1600] sponge at rate 136 with SHA3-style
//! padding, except that the permutation runs rounds 1..=23 only — the
//! round-0 constant is never applied. The upstream verifier computes the
//! same deviant digest, so a standard SHA3-256 implementation will not
//! produce accepted answers.

const RATE: usize = 136;

const ROUND_CONSTANTS: [u64; 24] = [
    0x0000000000000001,
    0x0000000000008082,
    0x800000000000808A,
    0x8000000080008000,
    0x000000000000808B,
    0x0000000080000001,
    0x8000000080008081,
    0x8000000000008009,
    0x000000000000008A,
    0x0000000000000088,
    0x0000000080008009,
    0x000000008000000A,
    0x000000008000808B,
    0x800000000000008B,
    0x8000000000008089,
    0x8000000000008003,
    0x8000000000008002,
    0x8000000000000080,
    0x000000000000800A,
    0x800000008000000A,
    0x8000000080008081,
    0x8000000000008080,
    0x0000000080000001,
    0x8000000080008008,
];

// Rotation offsets indexed [x][y].
const RHO: [[u32; 5]; 5] = [
    [0, 36, 3, 41, 18],
    [1, 44, 10, 45, 2],
    [62, 6, 43, 15, 61],
    [28, 55, 25, 21, 56],
    [27, 20, 39, 8, 14],
];

fn keccak_f1600_rounds_1_to_23(a: &mut [u64; 25]) {
    for round in 1..24 {
        // Theta
        let mut c = [0u64; 5];
        for x in 0..5 {
            c[x] = a[x] ^ a[x + 5] ^ a[x + 10] ^ a[x + 15] ^ a[x + 20];
        }
        let mut d = [0u64; 5];
        for x in 0..5 {
            d[x] = c[(x + 4) % 5] ^ c[(x + 1) % 5].rotate_left(1);
        }
        for x in 0..5 {
            let dx = d[x];
            a[x] ^= dx;
            a[x + 5] ^= dx;
            a[x + 10] ^= dx;
            a[x + 15] ^= dx;
            a[x + 20] ^= dx;
        }

        // Rho + Pi
        let mut b = [0u64; 25];
        for x in 0..5 {
            for y in 0..5 {
                b[y + 5 * ((2 * x + 3 * y) % 5)] = a[x + 5 * y].rotate_left(RHO[x][y]);
            }
        }

        // Chi
        for y in 0..5 {
            let y5 = 5 * y;
            for x in 0..5 {
                a[x + y5] = b[x + y5] ^ (!b[(x + 1) % 5 + y5] & b[(x + 2) % 5 + y5]);
            }
        }

        // Iota
        a[0] ^= ROUND_CONSTANTS[round];
    }
}

fn absorb_block(state: &mut [u64; 25], block: &[u8]) {
    for (i, lane) in block.chunks_exact(8).enumerate() {
        state[i] ^= u64::from_le_bytes(lane.try_into().unwrap());
    }
    keccak_f1600_rounds_1_to_23(state);
}

/// Digest an arbitrary byte string into 32 bytes (state lanes 0..4,
/// serialized little-endian).
pub fn deepseek_hash_v1(data: &[u8]) -> [u8; 32] {
    let mut state = [0u64; 25];

    let mut chunks = data.chunks_exact(RATE);
    for block in &mut chunks {
        absorb_block(&mut state, block);
    }

    let rem = chunks.remainder();
    let mut last = [0u8; RATE];
    last[..rem.len()].copy_from_slice(rem);
    last[rem.len()] = 0x06;
    last[RATE - 1] |= 0x80;
    absorb_block(&mut state, &last);

    let mut out = [0u8; 32];
    for i in 0..4 {
        out[i * 8..(i + 1) * 8].copy_from_slice(&state[i].to_le_bytes());
    }
    out
}

/// Cache fingerprint: hex digest of the `|`-joined parts.
pub fn hash_key(parts: &[&str]) -> String {
    hex::encode(deepseek_hash_v1(parts.join("|").as_bytes()))
}

/// Digest bytes as little-endian limbs, least significant first.
pub fn le_limbs(digest: &[u8; 32]) -> [u64; 4] {
    let mut limbs = [0u64; 4];
    for (i, lane) in digest.chunks_exact(8).enumerate() {
        limbs[i] = u64::from_le_bytes(lane.try_into().unwrap());
    }
    limbs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_empty_input() {
        assert_eq!(
            hex::encode(deepseek_hash_v1(b"")),
            "e594808bc5b7151ac160c6d39a02e0a8e261ed588578403099e3561dc40c26b3"
        );
    }

    #[test]
    fn digest_of_short_input() {
        assert_eq!(
            hex::encode(deepseek_hash_v1(b"hello")),
            "50605e468e6d6ead913d7d7ccc4687b83ded157cf0a0c5e011eefece12712fa5"
        );
    }

    #[test]
    fn digest_spanning_multiple_blocks() {
        let data = vec![b'a'; 200];
        assert_eq!(
            hex::encode(deepseek_hash_v1(&data)),
            "c396d2681a0d7a5498f39922282034b164b3494c243d4c4d2e277a13686704fd"
        );
    }

    #[test]
    fn fingerprint_joins_with_pipe() {
        let key = hash_key(&[
            "DeepSeekHashV1",
            "abc",
            "xyz",
            "sig",
            "/api/v0/chat/completion",
        ]);
        assert_eq!(
            key,
            "2bc2732fec1e78dd85c4c8b35c29fe49dc1a2f3898ca0fbcb01611caaf02710e"
        );
    }

    #[test]
    fn le_limbs_little_endian_order() {
        let mut digest = [0u8; 32];
        digest[0] = 1;
        digest[31] = 2;
        let limbs = le_limbs(&digest);
        assert_eq!(limbs[0], 1);
        assert_eq!(limbs[3], 2u64 << 56);
    }
}
