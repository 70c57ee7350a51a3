//! The password-scramble algorithm used by the two-message auth handshake.
//!
//! The server's greeting carries a 44-character base64 salt. The client
//! proves knowledge of the password without sending it in the clear:
//!
//! ```text
//! scramble = sha1(password) XOR sha1(salt || sha1(sha1(password)))
//! ```

use sha1::{Digest, Sha1};

use crate::error::TransportError;

/// Decode the 44-character base64 salt carried in the second line of the
/// server's greeting and compute the scramble for `password`.
pub fn scramble(salt_b64: &str, password: &str) -> Result<[u8; 20], TransportError> {
    let salt = base64::decode(salt_b64.trim())
        .map_err(|e| TransportError::Protocol(format!("invalid greeting salt: {}", e)))?;
    Ok(scramble_with_salt(&salt, password))
}

fn sha1(input: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(input);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

fn xor(a: [u8; 20], b: [u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn scramble_with_salt(salt: &[u8], password: &str) -> [u8; 20] {
    let hash1 = sha1(password.as_bytes());
    let hash2 = sha1(&hash1);
    let mut salted = Vec::with_capacity(salt.len() + hash2.len());
    salted.extend_from_slice(salt);
    salted.extend_from_slice(&hash2);
    let hash3 = sha1(&salted);
    xor(hash1, hash3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scramble_is_deterministic() {
        let salt = base64::encode("0123456789012345678901234567890");
        let a = scramble(&salt, "hunter2").unwrap();
        let b = scramble(&salt, "hunter2").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_passwords_scramble_differently() {
        let salt = base64::encode("0123456789012345678901234567890");
        let a = scramble(&salt, "hunter2").unwrap();
        let b = scramble(&salt, "hunter3").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_invalid_base64_salt() {
        assert!(scramble("not base64!!", "hunter2").is_err());
    }
}
