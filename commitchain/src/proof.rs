use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, NodeId, PublicKey, Signature, TypedSignature};
use crate::error::ProofFailed;
use crate::reserved::{ReservedState, ValidatorSet};

/// A fraction of the total voting power
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[display("{numerator}/{denominator}")]
pub struct Ratio {
    pub numerator: u64,
    pub denominator: u64,
}

impl Ratio {
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Is `part` strictly more than this fraction of `total`?
    pub fn is_exceeded_by(&self, part: u64, total: u64) -> bool {
        if total == 0 || self.denominator == 0 {
            return false;
        }

        (part as u128) * (self.denominator as u128) > (total as u128) * (self.numerator as u128)
    }
}

impl Default for Ratio {
    fn default() -> Self {
        Self::new(2, 3)
    }
}

/// A consensus vote as signed by a validator
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsensusVote {
    pub height: u64,
    pub round: u64,
    pub block: NodeId,
}

/// A block proposal as signed by a round leader
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsensusProposal {
    pub height: u64,
    pub round: u64,
    pub block: NodeId,
}

impl ConsensusVote {
    pub fn signing_bytes(&self) -> Vec<u8> {
        signing_bytes(b"vote", self.height, self.round, &self.block)
    }
}

impl ConsensusProposal {
    pub fn signing_bytes(&self) -> Vec<u8> {
        signing_bytes(b"proposal", self.height, self.round, &self.block)
    }
}

fn signing_bytes(domain: &[u8], height: u64, round: u64, block: &NodeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(domain.len() + 8 + 8 + 32);
    out.extend_from_slice(domain);
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&round.to_le_bytes());
    out.extend_from_slice(block.as_bytes());
    out
}

/// Cryptographic evidence that a validator equivocated
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Misbehavior {
    /// Two votes for different blocks in the same round
    DoubleVote {
        offender: PublicKey,
        first: (ConsensusVote, Signature),
        second: (ConsensusVote, Signature),
    },
    /// Two proposals for different blocks in the same round
    DoubleProposal {
        offender: PublicKey,
        first: (ConsensusProposal, Signature),
        second: (ConsensusProposal, Signature),
    },
}

impl Misbehavior {
    pub fn offender(&self) -> &PublicKey {
        match self {
            Self::DoubleVote { offender, .. } | Self::DoubleProposal { offender, .. } => offender,
        }
    }
}

/// The state change a verified misbehavior entails
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlashingEffect {
    pub offender: PublicKey,
}

impl SlashingEffect {
    /// The deterministic slashing function
    pub fn apply(&self, state: &ReservedState, node: NodeId) -> Result<ReservedState, ProofFailed> {
        state.expel(&self.offender).ok_or(ProofFailed::UnknownOffender {
            node,
            offender: self.offender,
        })
    }
}

/// Stateless checks of the cryptographic attachments carried by commits and tags
#[derive(Clone, Debug)]
pub struct ProofVerifier {
    governance_threshold: Ratio,
    consensus_threshold: Ratio,
}

impl ProofVerifier {
    pub fn new(governance_threshold: Ratio, consensus_threshold: Ratio) -> Self {
        Self {
            governance_threshold,
            consensus_threshold,
        }
    }

    pub fn get_governance_threshold(&self) -> Ratio {
        self.governance_threshold
    }

    pub fn get_consensus_threshold(&self) -> Ratio {
        self.consensus_threshold
    }

    /// What a voter signs when tagging a node (vote or veto)
    pub fn tag_message(target: &NodeId, voter: &PublicKey) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(target.as_bytes());
        out.extend_from_slice(voter.as_bytes());
        out
    }

    pub fn verify_signature(&self, public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
        crypto::verify(public_key, message, signature)
    }

    /// Checks a governance approval proof for `agenda`
    ///
    /// Every signature has to be valid; the distinct signers together must
    /// hold more than the governance threshold of `validator_set`.
    pub fn check_governance_approval(
        &self,
        agenda: &NodeId,
        proof: &[TypedSignature],
        validator_set: &ValidatorSet,
    ) -> Result<(), ProofFailed> {
        let mut signers = BTreeSet::new();

        for entry in proof.iter() {
            let message = Self::tag_message(agenda, &entry.signer);
            if !entry.verify(&message) {
                return Err(ProofFailed::InvalidSignature {
                    node: *agenda,
                    signer: entry.signer,
                });
            }
            signers.insert(entry.signer);
        }

        let approved = validator_set.power_of_all(signers.iter());
        let total = validator_set.total_power();

        if self.governance_threshold.is_exceeded_by(approved, total) {
            Ok(())
        } else {
            Err(ProofFailed::InsufficientQuorum {
                node: *agenda,
                approved,
                total,
                threshold: self.governance_threshold,
            })
        }
    }

    pub fn verify_governance_approval(
        &self,
        agenda: &NodeId,
        proof: &[TypedSignature],
        validator_set: &ValidatorSet,
    ) -> bool {
        self.check_governance_approval(agenda, proof, validator_set)
            .is_ok()
    }

    /// Do the given vetoes hold more than the consensus threshold?
    pub fn is_vetoed<'a>(
        &self,
        vetoes: impl IntoIterator<Item = &'a PublicKey>,
        validator_set: &ValidatorSet,
    ) -> bool {
        validator_set.reaches(vetoes, self.consensus_threshold)
    }

    /// Returns the slashing effect if `evidence` proves equivocation
    pub fn verify_misbehavior(&self, evidence: &Misbehavior) -> Option<SlashingEffect> {
        let valid = match evidence {
            Misbehavior::DoubleVote {
                offender,
                first,
                second,
            } => {
                first.0.height == second.0.height
                    && first.0.round == second.0.round
                    && first.0.block != second.0.block
                    && crypto::verify(offender, &first.0.signing_bytes(), &first.1)
                    && crypto::verify(offender, &second.0.signing_bytes(), &second.1)
            }
            Misbehavior::DoubleProposal {
                offender,
                first,
                second,
            } => {
                first.0.height == second.0.height
                    && first.0.round == second.0.round
                    && first.0.block != second.0.block
                    && crypto::verify(offender, &first.0.signing_bytes(), &first.1)
                    && crypto::verify(offender, &second.0.signing_bytes(), &second.1)
            }
        };

        if valid {
            Some(SlashingEffect {
                offender: *evidence.offender(),
            })
        } else {
            log::trace!("Rejected misbehavior evidence against {}", evidence.offender());
            None
        }
    }
}

impl Default for ProofVerifier {
    fn default() -> Self {
        Self::new(Ratio::default(), Ratio::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{hash, PrivateKey};
    use crate::reserved::Member;

    fn keys() -> Vec<PrivateKey> {
        (1..=4).map(|i| PrivateKey::from_seed([i; 32])).collect()
    }

    fn validator_set(keys: &[PrivateKey]) -> ValidatorSet {
        let members = keys
            .iter()
            .enumerate()
            .map(|(i, k)| Member::new(format!("member-{i}"), k.public_key(), 1, 1))
            .collect();
        ReservedState::new(members).governance_set()
    }

    fn approve(agenda: &NodeId, key: &PrivateKey) -> TypedSignature {
        TypedSignature::sign(&ProofVerifier::tag_message(agenda, &key.public_key()), key)
    }

    #[test]
    fn governance_approval() {
        let keys = keys();
        let set = validator_set(&keys);
        let verifier = ProofVerifier::default();
        let agenda = hash(b"agenda");

        let proof: Vec<_> = keys[..3].iter().map(|k| approve(&agenda, k)).collect();
        assert!(verifier.verify_governance_approval(&agenda, &proof, &set));

        // Approval is bound to the exact agenda
        let other = hash(b"other agenda");
        assert!(!verifier.verify_governance_approval(&other, &proof, &set));

        let proof: Vec<_> = keys[..2].iter().map(|k| approve(&agenda, k)).collect();
        assert!(matches!(
            verifier.check_governance_approval(&agenda, &proof, &set),
            Err(ProofFailed::InsufficientQuorum { approved: 2, total: 4, .. })
        ));
    }

    #[test]
    fn duplicate_signers_count_once() {
        let keys = keys();
        let set = validator_set(&keys);
        let verifier = ProofVerifier::default();
        let agenda = hash(b"agenda");

        let proof = vec![
            approve(&agenda, &keys[0]),
            approve(&agenda, &keys[0]),
            approve(&agenda, &keys[1]),
        ];
        assert!(!verifier.verify_governance_approval(&agenda, &proof, &set));
    }

    #[test]
    fn double_vote() {
        let key = PrivateKey::from_seed([3; 32]);
        let verifier = ProofVerifier::default();

        let vote1 = ConsensusVote {
            height: 5,
            round: 0,
            block: hash(b"a"),
        };
        let vote2 = ConsensusVote {
            block: hash(b"b"),
            ..vote1.clone()
        };

        let evidence = Misbehavior::DoubleVote {
            offender: key.public_key(),
            first: (vote1.clone(), key.sign(&vote1.signing_bytes())),
            second: (vote2.clone(), key.sign(&vote2.signing_bytes())),
        };
        let effect = verifier.verify_misbehavior(&evidence).unwrap();
        assert_eq!(effect.offender, key.public_key());

        // Voting twice for the same block is not equivocation
        let evidence = Misbehavior::DoubleVote {
            offender: key.public_key(),
            first: (vote1.clone(), key.sign(&vote1.signing_bytes())),
            second: (vote1.clone(), key.sign(&vote1.signing_bytes())),
        };
        assert!(verifier.verify_misbehavior(&evidence).is_none());
    }

    #[test]
    fn forged_evidence() {
        let key = PrivateKey::from_seed([3; 32]);
        let other = PrivateKey::from_seed([4; 32]);
        let verifier = ProofVerifier::default();

        let vote1 = ConsensusProposal {
            height: 5,
            round: 1,
            block: hash(b"a"),
        };
        let vote2 = ConsensusProposal {
            block: hash(b"b"),
            ..vote1.clone()
        };

        let evidence = Misbehavior::DoubleProposal {
            offender: key.public_key(),
            first: (vote1.clone(), key.sign(&vote1.signing_bytes())),
            second: (vote2.clone(), other.sign(&vote2.signing_bytes())),
        };
        assert!(verifier.verify_misbehavior(&evidence).is_none());
    }
}
