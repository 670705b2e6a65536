//! Key hashing and bucket sizing.
//!
//! Keys are hashed as base-256 numbers modulo a large prime, and bucket counts are always prime,
//! which spreads the residues of this hash well.

/// The modulus of the key hash.
pub const BIG_PRIME: u64 = 2_147_483_647;

/// Hash a key.
///
/// The bytes of the key are read as the digits of a base-256 number, which is then reduced modulo
/// `BIG_PRIME` through Horner's rule. Every intermediate value is below `BIG_PRIME * 256 + 256`,
/// so 64-bit arithmetic never overflows.
pub fn hash(key: &str) -> u64 {
    key.bytes().fold(0, |p, byte| (p * 256 + byte as u64) % BIG_PRIME)
}

/// Check if `n` is prime.
///
/// This is simple trial division by odd numbers up to the square root, which is fine for the
/// bucket counts we deal with.
pub fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 {
        return false;
    }

    let mut i = 3;
    while i <= n / i {
        if n % i == 0 {
            return false;
        }
        i += 2;
    }

    true
}

/// Get the smallest prime strictly greater than `min`.
///
/// Returns `None` if there is no such prime representable as `usize`.
pub fn next_prime(min: usize) -> Option<usize> {
    let mut n = min.checked_add(1)?;
    while !is_prime(n) {
        n = n.checked_add(1)?;
    }

    Some(n)
}
