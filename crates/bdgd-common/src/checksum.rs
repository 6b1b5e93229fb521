//! Content digests
//!
//! Identities in the import pipeline are derived from record content rather than
//! assigned by the database. Everything here is a pure function of its input.

use sha2::{Digest, Sha256};

/// SHA-256 over `parts`, as lowercase hex.
///
/// Each part is preceded by its byte length (u64, little endian), so distinct tuples never
/// share an encoding even when a part contains what would otherwise be a separator.
pub fn digest_parts<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_parts_sha256() {
        assert_eq!(
            digest_parts(&["hello", "world"]),
            "306a0d104017a29193be6c7464b1fd5ee65495353a7ccad7dd2928e5fb9731fd"
        );
    }

    #[test]
    fn test_digest_parts_boundaries_matter() {
        assert_ne!(digest_parts(&["ab", ""]), digest_parts(&["a", "b"]));
        assert_ne!(
            digest_parts(&["", "", "belo", "cemig-d"]),
            digest_parts(&["", "", "belo-cemig", "d"])
        );
        assert_ne!(digest_parts(&["a|b", "c"]), digest_parts(&["a", "b|c"]));
        assert_ne!(digest_parts::<&str>(&[]), digest_parts(&[""]));
    }

    #[test]
    fn test_digest_parts_is_stable() {
        let parts = vec!["X1".to_string(), "2023".to_string()];
        assert_eq!(digest_parts(&parts), digest_parts(&parts));
        assert_eq!(digest_parts(&parts).len(), 64);
    }
}
