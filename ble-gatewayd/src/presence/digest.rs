use sha2::{Digest, Sha256};

/// SHA-256 over the present (address, identifier) pairs, sorted by address.
///
/// Only the pairing is hashed; liveness refreshes move timestamps on every
/// cycle without changing who is present.
pub fn compute_digest<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut pairs: Vec<(&str, &str)> = entries.into_iter().collect();
    pairs.sort_unstable();

    let mut hasher = Sha256::new();
    for (address, identifier) in pairs {
        // Length-prefixed so ("ab", "c") and ("a", "bc") hash differently
        for field in [address, identifier] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}
