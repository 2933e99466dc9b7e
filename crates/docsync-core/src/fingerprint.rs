//! Content fingerprints and stored identifiers.
//!
//! The fingerprint covers exactly what is sent to the embedding model: the
//! model id and the (possibly truncated) input text. Volatile metadata such
//! as modification times or download URLs never enters it, so touching a
//! file without changing its content is a no-op.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Namespace for deriving point ids. Changing it orphans every stored point.
const POINT_NAMESPACE: Uuid = Uuid::from_u128(0x5f1c_2a7e_93d4_4b0e_8c61_0d2f_7a9b_e3c4);

/// Prefix a domain key with its document class.
///
/// Two classes may legitimately produce the same raw key (`"A1"`); the
/// namespaced form keeps their stored points apart.
pub fn namespaced_key(class: &str, domain_key: &str) -> String {
    format!("{}:{}", class, domain_key)
}

/// Deterministic vector-store point id (UUID v5) for a namespaced key.
pub fn point_id(namespaced_key: &str) -> String {
    Uuid::new_v5(&POINT_NAMESPACE, namespaced_key.as_bytes()).to_string()
}

/// SHA-256 over the embedding model id and the embedded text.
pub fn content_fingerprint(model: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
