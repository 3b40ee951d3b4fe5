//! Inclusion-proof generation and verification.
//!
//! A proof is the ordered list of sibling hashes along the path from a leaf
//! to the root. `position` records which side the *sibling* sits on relative
//! to the running hash, so the verifier concatenates sibling-then-current
//! when `position == "left"` and current-then-sibling otherwise.
//!
//! Verification is a pure function over hex strings; it never touches
//! storage or the tree that produced the proof.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hasher::hash_bytes;
use crate::tree::MerkleTree;

/// Which side of the running hash the sibling occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Right,
}

/// One step of an inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// The sibling's hash at this level.
    pub hash: String,
    pub position: Position,
}

impl MerkleTree {
    /// Inclusion proof for the first leaf whose hash equals `target_hash`.
    ///
    /// Returns `NotFound` when no leaf carries that hash. The proof has one
    /// step per level below the root; a single-leaf tree proves with an
    /// empty sequence.
    pub fn prove_hash(&self, target_hash: &str) -> Result<Vec<ProofStep>> {
        let levels = self.levels();
        let leaves = levels
            .first()
            .ok_or_else(|| Error::NotFound("tree has no leaves".to_string()))?;

        let mut index = leaves
            .iter()
            .position(|&id| self.node(id).hash == target_hash)
            .ok_or_else(|| Error::NotFound(format!("{target_hash} is not among the leaves")))?;

        let mut steps = Vec::with_capacity(levels.len().saturating_sub(1));
        for level in &levels[..levels.len() - 1] {
            let is_right = index % 2 == 1;
            let sibling = if is_right { index - 1 } else { index + 1 };

            // Odd tail: the sibling of the final node is the node itself.
            let sibling_id = if sibling < level.len() { level[sibling] } else { level[index] };

            steps.push(ProofStep {
                hash: self.node(sibling_id).hash.clone(),
                position: if is_right { Position::Left } else { Position::Right },
            });
            index /= 2;
        }

        Ok(steps)
    }

    /// Inclusion proof for a raw data block (hashes it first).
    pub fn prove_data(&self, block: &str) -> Result<Vec<ProofStep>> {
        self.prove_hash(&hash_bytes(block))
    }
}

/// Recompute the root from `target_hash` and `proof`, compare with
/// `expected_root`.
#[must_use]
pub fn verify_hash(target_hash: &str, proof: &[ProofStep], expected_root: &str) -> bool {
    let mut current = target_hash.to_string();
    for step in proof {
        current = match step.position {
            Position::Left => hash_bytes(&format!("{}{}", step.hash, current)),
            Position::Right => hash_bytes(&format!("{}{}", current, step.hash)),
        };
    }
    current == expected_root
}

/// Verify a raw data block against a known root.
#[must_use]
pub fn verify_data(block: &str, proof: &[ProofStep], expected_root: &str) -> bool {
    verify_hash(&hash_bytes(block), proof, expected_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(s: &str) -> String {
        hash_bytes(s)
    }

    #[test]
    fn test_two_blocks_proof_of_a() {
        // Proof of "a" in ["a", "b"] is a single right-side sibling hb.
        let tree = MerkleTree::from_data(&["a", "b"]);
        let proof = tree.prove_data("a").unwrap();

        assert_eq!(proof.len(), 1);
        assert_eq!(proof[0].hash, sha("b"));
        assert_eq!(proof[0].position, Position::Right);

        assert!(verify_data("a", &proof, tree.root_hash().unwrap()));
    }

    #[test]
    fn test_verify_rejects_altered_root() {
        let tree = MerkleTree::from_data(&["a", "b"]);
        let proof = tree.prove_data("a").unwrap();

        let mut altered = tree.root_hash().unwrap().to_string();
        altered.replace_range(0..1, if altered.starts_with('0') { "1" } else { "0" });

        assert!(!verify_data("a", &proof, &altered));
    }

    #[test]
    fn test_three_blocks_proof_of_c() {
        // ["a", "b", "c"]: proof of "c" is [{hc, right}, {sha(ha+hb), left}].
        let tree = MerkleTree::from_data(&["a", "b", "c"]);
        let proof = tree.prove_data("c").unwrap();

        let l1_left = sha(&format!("{}{}", sha("a"), sha("b")));
        assert_eq!(proof.len(), 2);
        assert_eq!(proof[0].hash, sha("c"));
        assert_eq!(proof[0].position, Position::Right);
        assert_eq!(proof[1].hash, l1_left);
        assert_eq!(proof[1].position, Position::Left);

        assert!(verify_data("c", &proof, tree.root_hash().unwrap()));
    }

    #[test]
    fn test_single_leaf_empty_proof() {
        let tree = MerkleTree::from_data(&["only"]);
        let proof = tree.prove_data("only").unwrap();

        assert!(proof.is_empty());
        assert!(verify_data("only", &proof, tree.root_hash().unwrap()));
    }

    #[test]
    fn test_unknown_target_is_not_found() {
        let tree = MerkleTree::from_data(&["a", "b"]);
        let err = tree.prove_data("nope").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_empty_tree_is_not_found() {
        let tree = MerkleTree::from_data::<&str>(&[]);
        let err = tree.prove_data("a").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_every_leaf_proves_against_root() {
        let items: Vec<String> = (0..9).map(|i| format!("item-{i}")).collect();
        let tree = MerkleTree::from_data(&items);
        let root = tree.root_hash().unwrap();

        for item in &items {
            let proof = tree.prove_data(item).unwrap();
            assert_eq!(proof.len(), tree.levels().len() - 1);
            assert!(verify_data(item, &proof, root), "proof failed for {item}");
        }
    }

    #[test]
    fn test_proof_of_wrong_block_fails_verification() {
        let tree = MerkleTree::from_data(&["a", "b", "c", "d"]);
        let proof = tree.prove_data("a").unwrap();
        assert!(!verify_data("b", &proof, tree.root_hash().unwrap()));
    }

    #[test]
    fn test_proof_step_serialization() {
        let step = ProofStep {
            hash: sha("b"),
            position: Position::Right,
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["position"], "right");
        assert_eq!(json["hash"], sha("b"));

        let back: ProofStep = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }
}
