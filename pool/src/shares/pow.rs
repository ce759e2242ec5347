//! Proof-of-work verification seam.
//!
//! Production pools verify with [`super::ethash_light::EthashVerifier`].
//! [`KeccakSealVerifier`] is a cheap seal for development networks.

use sha3::{Digest, Keccak256};

/// A solution checked against one difficulty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub number: u64,
    /// Header hash without nonce, `0x`-prefixed.
    pub header_hash: String,
    pub nonce: u64,
    pub mix_digest: String,
    pub difficulty: u64,
}

impl Candidate {
    pub fn with_difficulty(&self, difficulty: u64) -> Self {
        Self { difficulty, ..self.clone() }
    }
}

pub trait PowVerifier: Send + Sync {
    /// True when the candidate meets its difficulty.
    fn verify(&self, candidate: &Candidate) -> bool;

    /// Mix digest for a header/nonce pair. Stratum miners do not send one.
    fn mix_digest(&self, number: u64, header_hash: &str, nonce: u64) -> Option<String>;
}

/// `mix = keccak256(header || nonce_be)`, `result = keccak256(mix || header)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeccakSealVerifier;

impl KeccakSealVerifier {
    pub fn seal(header: &[u8; 32], nonce: u64) -> ([u8; 32], [u8; 32]) {
        let mut mix = [0u8; 32];
        mix.copy_from_slice(
            &Keccak256::new()
                .chain_update(header)
                .chain_update(nonce.to_be_bytes())
                .finalize(),
        );
        let mut result = [0u8; 32];
        result.copy_from_slice(&Keccak256::new().chain_update(mix).chain_update(header).finalize());
        (mix, result)
    }
}

impl PowVerifier for KeccakSealVerifier {
    fn verify(&self, candidate: &Candidate) -> bool {
        let (Some(header), Some(mix)) = (
            decode_hash(&candidate.header_hash),
            decode_hash(&candidate.mix_digest),
        ) else {
            return false;
        };
        if candidate.difficulty == 0 {
            return false;
        }

        let (expected_mix, result) = Self::seal(&header, candidate.nonce);
        if mix != expected_mix {
            return false;
        }
        result <= target_from_difficulty(candidate.difficulty)
    }

    fn mix_digest(&self, _number: u64, header_hash: &str, nonce: u64) -> Option<String> {
        let header = decode_hash(header_hash)?;
        let (mix, _) = Self::seal(&header, nonce);
        Some(format!("0x{}", hex::encode(mix)))
    }
}

/// Decode a `0x`-prefixed 32 byte hash.
pub fn decode_hash(s: &str) -> Option<[u8; 32]> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let mut out = [0u8; 32];
    hex::decode_to_slice(digits, &mut out).ok()?;
    Some(out)
}

/// Boundary `2^256 / diff` as big-endian bytes. Difficulty 0 and 1 saturate.
pub fn target_from_difficulty(diff: u64) -> [u8; 32] {
    if diff <= 1 {
        return [0xff; 32];
    }
    // Long division of 2^256 (a one followed by 32 zero bytes).
    let d = diff as u128;
    let mut rem: u128 = 1;
    let mut out = [0u8; 32];
    for b in out.iter_mut() {
        let acc = rem << 8;
        *b = (acc / d) as u8;
        rem = acc % d;
    }
    out
}

pub fn target_hex(diff: u64) -> String {
    format!("0x{}", hex::encode(target_from_difficulty(diff)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "0x1f2e3d4c5b6a79881f2e3d4c5b6a79881f2e3d4c5b6a79881f2e3d4c5b6a7988";

    #[test]
    fn test_target_from_difficulty() {
        assert_eq!(
            target_hex(2),
            "0x8000000000000000000000000000000000000000000000000000000000000000"
        );
        assert_eq!(
            target_hex(256),
            "0x0100000000000000000000000000000000000000000000000000000000000000"
        );
        assert_eq!(target_from_difficulty(1), [0xff; 32]);

        // 2^256 / 3 = 0x5555...55
        assert!(target_from_difficulty(3).iter().all(|b| *b == 0x55));
    }

    #[test]
    fn test_higher_difficulty_lowers_target() {
        assert!(target_from_difficulty(2_000_000_000) < target_from_difficulty(1_000));
    }

    #[test]
    fn test_keccak_seal_round() {
        let v = KeccakSealVerifier;
        let mix = v.mix_digest(1, HEADER, 42).unwrap();
        let c = Candidate {
            number: 1,
            header_hash: HEADER.to_string(),
            nonce: 42,
            mix_digest: mix.clone(),
            difficulty: 1,
        };
        assert!(v.verify(&c));

        let mut wrong_mix = c.clone();
        wrong_mix.mix_digest = format!("0x{}", "00".repeat(32));
        assert!(!v.verify(&wrong_mix));

        let mut wrong_nonce = c.clone();
        wrong_nonce.nonce = 43;
        assert!(!v.verify(&wrong_nonce));
    }

    #[test]
    fn test_keccak_seal_difficulty() {
        let v = KeccakSealVerifier;
        let header = decode_hash(HEADER).unwrap();
        let nonce = (0u64..)
            .find(|n| KeccakSealVerifier::seal(&header, *n).1[0] < 0x80)
            .unwrap();
        let c = Candidate {
            number: 1,
            header_hash: HEADER.to_string(),
            nonce,
            mix_digest: v.mix_digest(1, HEADER, nonce).unwrap(),
            difficulty: 2,
        };
        assert!(v.verify(&c));
        assert!(!v.verify(&c.with_difficulty(u64::MAX)));
    }

    #[test]
    fn test_decode_hash() {
        assert!(decode_hash(HEADER).is_some());
        assert!(decode_hash("0x1234").is_none());
        assert!(decode_hash("0xzz").is_none());
    }
}
