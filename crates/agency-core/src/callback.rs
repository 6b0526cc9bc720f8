//! Callback token generation: the short-lived credential a batch's container
//! presents on inbound callbacks. Only the PBKDF2 derivation of the token is
//! ever persisted; the raw token is handed to the container once and never
//! stored.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

const TOKEN_BYTES: usize = 24;
const SALT_BYTES: usize = 16;
const KDF_ITERATIONS: u32 = 100_000;
const KDF_OUTPUT_BYTES: usize = 32;

/// A freshly minted callback token: the raw hex value to hand to the
/// container, and the salted hash to persist.
pub struct GeneratedToken {
    pub raw: String,
    pub salt: Vec<u8>,
    pub hash: Vec<u8>,
}

pub fn generate_secret() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn create_kdf(salt: &[u8], token: &str) -> Vec<u8> {
    let mut out = vec![0u8; KDF_OUTPUT_BYTES];
    pbkdf2_hmac::<Sha256>(token.as_bytes(), salt, KDF_ITERATIONS, &mut out);
    out
}

pub fn generate_token() -> GeneratedToken {
    let raw = generate_secret();
    let mut salt = vec![0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = create_kdf(&salt, &raw);
    GeneratedToken { raw, salt, hash }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_hex_of_expected_length() {
        let token = generate_secret();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(hex::decode(&token).is_ok());
    }

    #[test]
    fn kdf_is_deterministic_given_salt_and_token() {
        let salt = b"fixed-salt-value";
        let a = create_kdf(salt, "token-value");
        let b = create_kdf(salt, "token-value");
        assert_eq!(a, b);
        assert_eq!(a.len(), KDF_OUTPUT_BYTES);
    }

    #[test]
    fn different_salts_yield_different_hashes() {
        let a = create_kdf(b"salt-a", "token-value");
        let b = create_kdf(b"salt-b", "token-value");
        assert_ne!(a, b);
    }
}
