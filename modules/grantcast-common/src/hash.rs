use sha2::{Digest, Sha256};

use crate::types::ContentType;

/// Version counter for the embedding/dedup scheme. Bumping this prefixes
/// every dedup key with a new namespace, invalidating all prior dedup
/// history and forcing recomputation — the designed cache-bust after a
/// change to what gets embedded.
pub const EMBEDDING_VERSION: u32 = 21;

/// Compute the dedup fingerprint for a content submission.
///
/// Pure and deterministic: identical (type, content, suffix, urls) always
/// hash identically. `urls` are joined in caller order — no sorting — so
/// the caller must supply a stable order to get stable hashes.
pub fn compute_content_hash(
    content_type: ContentType,
    content: &str,
    hash_suffix: Option<&str>,
    urls: Option<&[String]>,
) -> String {
    let input = format!(
        "{}-{}-{}-{}",
        content_type.as_str(),
        content,
        hash_suffix.unwrap_or(""),
        urls.map(|u| u.join(",")).unwrap_or_default(),
    );
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Dedup cache key for a content hash, namespaced by scheme version.
pub fn job_id_key(content_hash: &str) -> String {
    format!("v{EMBEDDING_VERSION}-job-id-{content_hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = compute_content_hash(ContentType::Cast, "Shipped v2 today", None, None);
        let b = compute_content_hash(ContentType::Cast, "Shipped v2 today", None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_matches_known_digest() {
        // sha256("cast-Shipped v2 today--")
        let got = compute_content_hash(ContentType::Cast, "Shipped v2 today", None, None);
        let expected = hex::encode(Sha256::digest(b"cast-Shipped v2 today--"));
        assert_eq!(got, expected);
    }

    #[test]
    fn hash_differs_on_any_field() {
        let base = compute_content_hash(ContentType::Cast, "gm", None, None);
        assert_ne!(
            base,
            compute_content_hash(ContentType::Grant, "gm", None, None)
        );
        assert_ne!(
            base,
            compute_content_hash(ContentType::Cast, "gn", None, None)
        );
        assert_ne!(
            base,
            compute_content_hash(ContentType::Cast, "gm", Some("x"), None)
        );
        assert_ne!(
            base,
            compute_content_hash(ContentType::Cast, "gm", None, Some(&["u".to_string()]))
        );
    }

    #[test]
    fn hash_is_order_sensitive_on_urls() {
        let ab = vec!["a".to_string(), "b".to_string()];
        let ba = vec!["b".to_string(), "a".to_string()];
        assert_ne!(
            compute_content_hash(ContentType::Cast, "gm", None, Some(&ab)),
            compute_content_hash(ContentType::Cast, "gm", None, Some(&ba)),
        );
    }

    #[test]
    fn job_id_key_carries_version_prefix() {
        let key = job_id_key("abc123");
        assert_eq!(key, format!("v{EMBEDDING_VERSION}-job-id-abc123"));
    }
}
