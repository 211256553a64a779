use sha2::{Digest as _, Sha256};

use crate::types::{SubjectKind, WILDCARD_CLIENT};

const STORAGE_KEY_BYTES: usize = 12;

/// Shortens a subject id into a fixed-width storage row key.
///
/// Not a security boundary: it only bounds key width and keeps raw ids out of table rows.
/// The subject kind is hashed in, so a user and a wallet sharing an id get distinct rows.
/// The wildcard id is kept verbatim so its pre-aggregated row stays addressable.
pub fn storage_subject_key(kind: SubjectKind, id: &str) -> String {
    if id == WILDCARD_CLIENT {
        return WILDCARD_CLIENT.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..STORAGE_KEY_BYTES])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_and_fixed_width() {
        let a = storage_subject_key(SubjectKind::User, "user-1");
        assert_eq!(a, storage_subject_key(SubjectKind::User, "user-1"));
        assert_eq!(a.len(), STORAGE_KEY_BYTES * 2);
        assert_ne!(a, storage_subject_key(SubjectKind::User, "user-2"));
    }

    #[test]
    fn user_and_wallet_with_same_id_differ() {
        assert_ne!(
            storage_subject_key(SubjectKind::User, "x"),
            storage_subject_key(SubjectKind::Wallet, "x")
        );
    }

    #[test]
    fn wildcard_is_not_hashed() {
        assert_eq!(
            storage_subject_key(SubjectKind::User, WILDCARD_CLIENT),
            WILDCARD_CLIENT
        );
    }
}
