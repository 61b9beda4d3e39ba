//! Password hashing and verification: Argon2id with a memory-hard cost
//! (64 MiB, 2 passes, 1 lane), 32-byte digest, random per-user salt.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;

use crate::error::AuthError;

fn argon2() -> Result<Argon2<'static>, AuthError> {
    let params = Params::new(65536, 2, 1, Some(32)).map_err(|e| AuthError::Kdf(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hashes a password with a freshly drawn random salt.
/// Returns the PHC-formatted hash string (which embeds the salt and
/// parameters) and the raw salt bytes, matching the `(hash, salt)` pair
/// the Persistence Gateway stores.
pub fn hash(password: &str) -> Result<(String, Vec<u8>), AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = argon2()?;
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AuthError::Kdf(e.to_string()))?;
    Ok((hash.to_string(), salt.as_str().as_bytes().to_vec()))
}

/// Recomputes the hash for `password` against the stored PHC hash string and
/// compares in constant time.
pub fn verify(password: &str, stored_hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(stored_hash).map_err(|e| AuthError::Kdf(e.to_string()))?;
    let argon2 = argon2()?;
    Ok(argon2
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_roundtrip() {
        let (hashed, salt) = hash("hunter2").unwrap();
        assert!(!salt.is_empty());
        assert!(verify("hunter2", &hashed).unwrap());
    }

    #[test]
    fn wrong_password_fails_verify() {
        let (hashed, _) = hash("hunter2").unwrap();
        assert!(!verify("wrong-password", &hashed).unwrap());
    }

    #[test]
    fn two_hashes_of_same_password_differ() {
        let (a, _) = hash("hunter2").unwrap();
        let (b, _) = hash("hunter2").unwrap();
        assert_ne!(a, b, "salts must be drawn fresh each time");
    }
}
