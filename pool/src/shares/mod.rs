/// Mining shares module
///
/// Proof-of-work verification, share/block validation and the share ledger

pub mod ethash_light;
pub mod pow;
pub mod storage;
pub mod validator;

pub use ethash_light::EthashVerifier;
pub use pow::{Candidate, KeccakSealVerifier, PowVerifier};
pub use storage::{Backend, RedisBackend, ShareRecord};
pub use validator::{ShareOutcome, ShareValidator};
