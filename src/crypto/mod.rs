pub mod canonical;
pub mod signatures;

pub use canonical::{canonicalize, to_canonical_string};
pub use signatures::{sha256_hex, LedgerKeys, SigningKey};
