use rand::Rng;
use sha1::{Digest, Sha1};

use crate::protocol::database::mysql::constant::{SCRAMBLE_LENGTH, SEED};

/// Generate random challenge bytes from the printable seed alphabet.
///
/// @param len length for generated bytes.
/// @return generated bytes
///
pub fn generate_random_bytes(len: usize, seed: &mut Vec<u8>) -> Vec<u8> {
    let mut random = rand::thread_rng();
    for _i in 0..len {
        seed.push(SEED[random.gen_range(0..SEED.len())]);
    }
    seed.to_vec()
}

/// The 4.1 password scramble:
/// `SHA1(challenge ++ SHA1(SHA1(password))) XOR SHA1(password)`, 20 bytes.
///
/// @see <a href="https://dev.mysql.com/doc/internals/en/secure-password-authentication.html">Secure Password Authentication</a>
pub fn scramble_password(password: &str, challenge: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(challenge);
    hasher.update(stage2);
    let result = hasher.finalize();

    stage1
        .iter()
        .zip(result.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Check a client's scrambled response against the cleartext password the
/// challenge was issued for.
pub fn verify_scramble(password: &str, challenge: &[u8], response: &[u8]) -> bool {
    let expected = scramble_password(password, challenge);
    expected.len() == response.len() && expected == response
}

/// A fresh 20-byte challenge, split 8 + 12 the way the handshake carries it.
pub fn generate_challenge() -> (Vec<u8>, Vec<u8>) {
    let mut seed1: Vec<u8> = Vec::new();
    let mut seed2: Vec<u8> = Vec::new();
    let seed1 = generate_random_bytes(8, seed1.as_mut());
    let seed2 = generate_random_bytes(SCRAMBLE_LENGTH - 8, seed2.as_mut());
    (seed1, seed2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scramble_is_twenty_bytes() {
        let (seed1, seed2) = generate_challenge();
        let challenge = [seed1, seed2].concat();
        assert_eq!(challenge.len(), SCRAMBLE_LENGTH);
        let token = scramble_password("secret", &challenge);
        assert_eq!(token.len(), SCRAMBLE_LENGTH);
    }

    #[test]
    fn test_verify_round_trip() {
        let challenge = b"01234567890123456789";
        let token = scramble_password("secret", challenge);
        assert!(verify_scramble("secret", challenge, &token));
        assert!(!verify_scramble("not-secret", challenge, &token));
    }

    #[test]
    fn test_verify_rejects_any_mutated_byte() {
        let challenge = b"abcdefghijklmnopqrst";
        let token = scramble_password("p4ssw0rd", challenge);
        for i in 0..token.len() {
            let mut mutated = token.clone();
            mutated[i] ^= 0x01;
            assert!(!verify_scramble("p4ssw0rd", challenge, &mutated));
        }
    }

    #[test]
    fn test_empty_password_scrambles_to_nothing() {
        let challenge = b"abcdefghijklmnopqrst";
        assert!(scramble_password("", challenge).is_empty());
        assert!(verify_scramble("", challenge, b""));
    }

    #[test]
    fn test_challenge_is_printable() {
        let (seed1, seed2) = generate_challenge();
        for b in seed1.iter().chain(seed2.iter()) {
            assert!(SEED.contains(b));
        }
    }
}
