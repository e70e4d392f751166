//! Prepare-proof signing and verification.
//!
//! Proofs carry an HMAC-SHA256 tag over `shard_id || commit_index || tx_id`
//! under a key shared between the shard replicas and the endorsers. This is
//! an interface-contract MAC, not a transferable signature: anyone holding
//! the key can mint tags, which is acceptable because every holder is a
//! component of the same peer process.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::prepare::PrepareProof;

type HmacSha256 = Hmac<Sha256>;

/// Deterministic keyed signer for prepare proofs.
#[derive(Clone)]
pub struct ProofSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for ProofSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofSigner").finish_non_exhaustive()
    }
}

impl ProofSigner {
    /// Creates a signer from the shared key material.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Computes the MAC tag for a proof tuple.
    pub fn sign(&self, shard_id: &str, commit_index: u64, tx_id: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC accepts keys of any length");
        mac.update(shard_id.as_bytes());
        mac.update(&commit_index.to_be_bytes());
        mac.update(tx_id.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Verifies a proof's shape and MAC tag.
    ///
    /// A proof is valid when it names a transaction and a shard, and its
    /// signature matches the tuple under the shared key.
    pub fn verify(&self, proof: &PrepareProof) -> bool {
        if proof.tx_id.is_empty() || proof.shard_id.is_empty() {
            return false;
        }
        let mut mac = match HmacSha256::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(proof.shard_id.as_bytes());
        mac.update(&proof.commit_index.to_be_bytes());
        mac.update(proof.tx_id.as_bytes());
        mac.verify_slice(&proof.signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proof(signer: &ProofSigner) -> PrepareProof {
        PrepareProof {
            tx_id: "tx1".to_string(),
            shard_id: "alpha".to_string(),
            commit_index: 3,
            leader_id: 1,
            term: 1,
            signature: signer.sign("alpha", 3, "tx1"),
            dependent_tx_id: String::new(),
        }
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let signer = ProofSigner::new(b"shared-key".to_vec());
        assert!(signer.verify(&proof(&signer)));
    }

    #[test]
    fn test_sign_is_deterministic() {
        let signer = ProofSigner::new(b"shared-key".to_vec());
        assert_eq!(signer.sign("alpha", 3, "tx1"), signer.sign("alpha", 3, "tx1"));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let signer = ProofSigner::new(b"shared-key".to_vec());
        let other = ProofSigner::new(b"other-key".to_vec());
        assert!(!other.verify(&proof(&signer)));
    }

    #[test]
    fn test_verify_rejects_tampered_index() {
        let signer = ProofSigner::new(b"shared-key".to_vec());
        let mut p = proof(&signer);
        p.commit_index = 4;
        assert!(!signer.verify(&p));
    }

    #[test]
    fn test_verify_rejects_empty_shape() {
        let signer = ProofSigner::new(b"shared-key".to_vec());
        let mut p = proof(&signer);
        p.tx_id.clear();
        assert!(!signer.verify(&p));
    }
}
