use crate::commit::{
    AgendaBody, AgendaProofBody, BlockHeader, CommitKind, DelegationTx, GenesisInfo, Node,
    ReportTx, UndelegationTx,
};
use crate::crypto::NodeId;
use crate::error::{BranchRejected, Error, InvalidCommit, ProofFailed};
use crate::graph::NodeLookup;
use crate::proof::ProofVerifier;
use crate::reserved::ReservedState;

/// What a single node is checked against
#[derive(Clone, Copy, Debug)]
pub struct ValidationContext<'a> {
    /// Reserved state in effect at the parent (None only while bootstrapping)
    pub reserved_state: Option<&'a ReservedState>,
    /// The finalized height the node builds on
    pub height: u64,
}

/// Outcome of validating one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validated {
    pub kind: CommitKind,
    /// The reserved state after this node, if it changed it
    pub reserved_state: Option<ReservedState>,
}

impl Validated {
    fn plain(kind: CommitKind) -> Self {
        Self {
            kind,
            reserved_state: None,
        }
    }
}

/// Classifies nodes and checks their per-kind rules
///
/// Validation is a pure function of the node, its parent and the context.
#[derive(Clone, Debug, Default)]
pub struct CommitValidator {
    verifier: ProofVerifier,
}

impl CommitValidator {
    pub fn new(verifier: ProofVerifier) -> Self {
        Self { verifier }
    }

    pub fn get_verifier(&self) -> &ProofVerifier {
        &self.verifier
    }

    pub fn validate(
        &self,
        node: &Node,
        parent: Option<&Node>,
        ctx: ValidationContext<'_>,
    ) -> Result<Validated, InvalidCommit> {
        let id = *node.get_identifier();

        let Some(kind) = node.claimed_kind() else {
            return Err(InvalidCommit::malformed(
                id,
                format!("unknown commit header `{}`", node.get_title()),
            ));
        };

        let expected_parents = if kind == CommitKind::Initial { 0 } else { 1 };
        let found = node.get_parent_ids().len();
        if found != expected_parents {
            return Err(InvalidCommit::WrongParentCount {
                node: id,
                kind,
                expected: expected_parents,
                found,
            });
        }

        if kind == CommitKind::Initial {
            let payload = node.get_payload();
            if !payload.body.is_empty() || !payload.diff.is_empty() {
                return Err(InvalidCommit::malformed(id, "initial node must be empty"));
            }
            return Ok(Validated::plain(kind));
        }

        let parent_id = node.get_parent_ids()[0];
        let Some(parent) = parent else {
            return Err(InvalidCommit::UnknownParent {
                node: id,
                parent: parent_id,
            });
        };
        if *parent.get_identifier() != parent_id {
            return Err(InvalidCommit::UnknownParent {
                node: id,
                parent: parent_id,
            });
        }

        let parent_kind = parent.claimed_kind().ok_or_else(|| {
            InvalidCommit::malformed(id, format!("parent {parent_id} has an unknown kind"))
        })?;

        let allowed: &[CommitKind] = match kind {
            CommitKind::Initial => &[],
            CommitKind::Genesis => &[CommitKind::Initial],
            CommitKind::Block => &[CommitKind::Chat, CommitKind::Genesis],
            CommitKind::Transaction | CommitKind::Agenda => {
                &[CommitKind::Block, CommitKind::Transaction]
            }
            CommitKind::Delegate
            | CommitKind::Undelegate
            | CommitKind::Report
            | CommitKind::Chat => &[
                CommitKind::AgendaProof,
                CommitKind::Delegate,
                CommitKind::Undelegate,
                CommitKind::Report,
            ],
            CommitKind::AgendaProof => &[CommitKind::Agenda],
        };

        if !allowed.contains(&parent_kind) {
            return Err(InvalidCommit::WrongParentKind {
                node: id,
                kind,
                parent: parent_id,
                parent_kind,
            });
        }

        match kind {
            CommitKind::Initial => Ok(Validated::plain(kind)),
            CommitKind::Genesis => self.validate_genesis(node),
            CommitKind::Block => self.validate_block(node, parent_kind, ctx),
            CommitKind::Transaction => {
                if node.get_payload().diff.touches_reserved() {
                    Err(InvalidCommit::ReservedStateViolation { node: id, kind })
                } else {
                    Ok(Validated::plain(kind))
                }
            }
            CommitKind::Delegate | CommitKind::Undelegate => {
                self.validate_delegation(node, kind, ctx)
            }
            CommitKind::Report => self.validate_report(node, ctx),
            CommitKind::Chat => {
                require_empty_diff(node, kind)?;
                Ok(Validated::plain(kind))
            }
            CommitKind::Agenda => {
                require_empty_diff(node, kind)?;
                let body: AgendaBody = decode(node)?;
                require_height(node, body.height, ctx.height + 1)?;
                Ok(Validated::plain(kind))
            }
            CommitKind::AgendaProof => self.validate_agenda_proof(node, parent, ctx),
        }
    }

    fn validate_genesis(&self, node: &Node) -> Result<Validated, InvalidCommit> {
        let id = *node.get_identifier();
        let diff = &node.get_payload().diff;

        let _info: GenesisInfo = decode(node)?;

        if !diff.ordinary.is_empty() {
            return Err(InvalidCommit::malformed(
                id,
                "genesis may only carry the reserved state",
            ));
        }

        let Some(state) = &diff.reserved else {
            return Err(InvalidCommit::malformed(id, "genesis lacks the initial state"));
        };

        state
            .check_consistency()
            .map_err(|reason| InvalidCommit::malformed(id, reason))?;

        Ok(Validated {
            kind: CommitKind::Genesis,
            reserved_state: Some(state.clone()),
        })
    }

    fn validate_block(
        &self,
        node: &Node,
        parent_kind: CommitKind,
        ctx: ValidationContext<'_>,
    ) -> Result<Validated, InvalidCommit> {
        require_empty_diff(node, CommitKind::Block)?;
        let header: BlockHeader = decode(node)?;

        // The block right after genesis is height zero
        let expected = if parent_kind == CommitKind::Genesis {
            0
        } else {
            ctx.height + 1
        };
        require_height(node, header.height, expected)?;

        Ok(Validated::plain(CommitKind::Block))
    }

    fn validate_delegation(
        &self,
        node: &Node,
        kind: CommitKind,
        ctx: ValidationContext<'_>,
    ) -> Result<Validated, InvalidCommit> {
        let id = *node.get_identifier();
        let state = require_state(node, ctx)?;
        let diff = &node.get_payload().diff;

        if !diff.ordinary.is_empty() {
            return Err(InvalidCommit::malformed(
                id,
                "delegation changes may only touch the reserved state",
            ));
        }

        let (delegator, proof_ok, signer, block_height, expected) = if kind == CommitKind::Delegate
        {
            let tx: DelegationTx = decode(node)?;
            let expected = state.delegate(&tx.delegator, &tx.delegatee, tx.governance);
            (
                tx.delegator.clone(),
                tx.verify_proof(),
                tx.proof.signer,
                tx.block_height,
                expected,
            )
        } else {
            let tx: UndelegationTx = decode(node)?;
            let expected = state.undelegate(&tx.delegator);
            (
                tx.delegator.clone(),
                tx.verify_proof(),
                tx.proof.signer,
                tx.block_height,
                expected,
            )
        };

        let Some(member) = state.member(&delegator) else {
            return Err(InvalidCommit::malformed(
                id,
                format!("unknown delegator `{delegator}`"),
            ));
        };

        if !proof_ok || member.public_key != signer {
            return Err(InvalidCommit::ProofFailed(ProofFailed::InvalidSignature {
                node: id,
                signer,
            }));
        }

        if block_height != ctx.height {
            return Err(InvalidCommit::malformed(
                id,
                format!(
                    "signed for height {block_height}, but the chain is at {}",
                    ctx.height
                ),
            ));
        }

        let expected = expected.map_err(|reason| InvalidCommit::malformed(id, reason))?;
        if diff.reserved.as_ref() != Some(&expected) {
            return Err(InvalidCommit::ReservedStateViolation { node: id, kind });
        }

        Ok(Validated {
            kind,
            reserved_state: Some(expected),
        })
    }

    fn validate_report(
        &self,
        node: &Node,
        ctx: ValidationContext<'_>,
    ) -> Result<Validated, InvalidCommit> {
        let id = *node.get_identifier();
        let kind = CommitKind::Report;
        let state = require_state(node, ctx)?;
        let diff = &node.get_payload().diff;

        let tx: ReportTx = decode(node)?;

        let Some(effect) = self.verifier.verify_misbehavior(&tx.evidence) else {
            return Err(InvalidCommit::ProofFailed(ProofFailed::InvalidEvidence {
                node: id,
            }));
        };

        let expected = effect.apply(state, id).map_err(InvalidCommit::ProofFailed)?;
        if !diff.ordinary.is_empty() || diff.reserved.as_ref() != Some(&expected) {
            return Err(InvalidCommit::ReservedStateViolation { node: id, kind });
        }

        Ok(Validated {
            kind,
            reserved_state: Some(expected),
        })
    }

    fn validate_agenda_proof(
        &self,
        node: &Node,
        parent: &Node,
        ctx: ValidationContext<'_>,
    ) -> Result<Validated, InvalidCommit> {
        let id = *node.get_identifier();
        let state = require_state(node, ctx)?;

        require_empty_diff(node, CommitKind::AgendaProof)?;
        let body: AgendaProofBody = decode(node)?;

        if body.agenda != *parent.get_identifier() {
            return Err(InvalidCommit::malformed(
                id,
                format!("proof is for agenda {}, not its parent", body.agenda),
            ));
        }
        require_height(node, body.height, ctx.height + 1)?;

        self.verifier
            .check_governance_approval(&body.agenda, &body.signatures, &state.governance_set())
            .map_err(|err| {
                // Report the proof node rather than the agenda
                match err {
                    ProofFailed::InsufficientQuorum {
                        approved,
                        total,
                        threshold,
                        ..
                    } => ProofFailed::InsufficientQuorum {
                        node: id,
                        approved,
                        total,
                        threshold,
                    },
                    ProofFailed::InvalidSignature { signer, .. } => {
                        ProofFailed::InvalidSignature { node: id, signer }
                    }
                    other => other,
                }
            })
            .map_err(InvalidCommit::ProofFailed)?;

        Ok(Validated::plain(CommitKind::AgendaProof))
    }
}

fn decode<T: serde::de::DeserializeOwned>(node: &Node) -> Result<T, InvalidCommit> {
    node.get_payload()
        .decode_body()
        .map_err(|reason| InvalidCommit::malformed(*node.get_identifier(), reason))
}

fn require_empty_diff(node: &Node, kind: CommitKind) -> Result<(), InvalidCommit> {
    let diff = &node.get_payload().diff;
    let id = *node.get_identifier();

    if diff.touches_reserved() {
        Err(InvalidCommit::ReservedStateViolation { node: id, kind })
    } else if !diff.is_empty() {
        Err(InvalidCommit::malformed(
            id,
            format!("a {kind} commit may not change state"),
        ))
    } else {
        Ok(())
    }
}

fn require_height(node: &Node, found: u64, expected: u64) -> Result<(), InvalidCommit> {
    if found == expected {
        Ok(())
    } else {
        Err(InvalidCommit::malformed(
            *node.get_identifier(),
            format!("claims height {found}, expected {expected}"),
        ))
    }
}

fn require_state<'a>(
    node: &Node,
    ctx: ValidationContext<'a>,
) -> Result<&'a ReservedState, InvalidCommit> {
    ctx.reserved_state.ok_or_else(|| {
        InvalidCommit::malformed(*node.get_identifier(), "no reserved state to check against")
    })
}

/// The current end of `main`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizedTip {
    pub block: NodeId,
    pub height: u64,
    pub reserved_state: ReservedState,
}

/// How far a height sequence has progressed
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
pub enum Phase {
    /// Nothing beyond the finalized block
    #[display("finalized")]
    Finalized,
    #[display("transactions")]
    Transactions,
    #[display("agenda")]
    Agenda,
    /// The agenda proof and any extra-agenda transactions after it
    #[display("agenda-proof")]
    AgendaProof,
    #[display("chat")]
    Chat,
    #[display("block")]
    Block,
}

/// A validated chain from the finalized block towards the next one
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeightSequence {
    pub tip: NodeId,
    pub phase: Phase,
    pub agenda: Option<NodeId>,
    pub agenda_proof: Option<NodeId>,
    pub block: Option<NodeId>,
    /// All nodes after the finalized block, oldest first
    pub kinds: Vec<(NodeId, CommitKind)>,
    /// Reserved state at the tip
    pub reserved_state: ReservedState,
}

impl Phase {
    fn advance(self, kind: CommitKind) -> Option<Phase> {
        use CommitKind as K;

        match (self, kind) {
            (Phase::Finalized | Phase::Transactions, K::Transaction) => Some(Phase::Transactions),
            (Phase::Finalized | Phase::Transactions, K::Agenda) => Some(Phase::Agenda),
            (Phase::Agenda, K::AgendaProof) => Some(Phase::AgendaProof),
            (Phase::AgendaProof, K::Delegate | K::Undelegate | K::Report) => {
                Some(Phase::AgendaProof)
            }
            (Phase::AgendaProof, K::Chat) => Some(Phase::Chat),
            (Phase::Chat, K::Block) => Some(Phase::Block),
            _ => None,
        }
    }
}

/// Validates the chain from `base.block` (exclusive) to `tip` as one height
///
/// Fails fast if `tip` does not descend from the finalized block or the walk
/// exceeds `max_len` nodes.
pub fn validate_sequence<L: NodeLookup + ?Sized>(
    lookup: &L,
    validator: &CommitValidator,
    base: &FinalizedTip,
    name: &str,
    tip: &NodeId,
    max_len: usize,
) -> Result<HeightSequence, Error> {
    let not_descendant = || BranchRejected::NotDescendant {
        node: *tip,
        finalized: base.block,
    };

    let base_node = lookup
        .lookup(&base.block)
        .ok_or(BranchRejected::UnknownNode { node: base.block })?;
    let base_depth = lookup
        .lookup_depth(&base.block)
        .ok_or(BranchRejected::UnknownNode { node: base.block })?;

    // Walk back to the finalized block
    let mut path = vec![];
    let mut current = *tip;

    while current != base.block {
        let node = lookup
            .lookup(&current)
            .ok_or(BranchRejected::UnknownNode { node: current })?;

        match lookup.lookup_depth(&current) {
            Some(depth) if depth > base_depth => {}
            _ => return Err(not_descendant().into()),
        }

        if path.len() >= max_len {
            return Err(BranchRejected::IllegalSequence {
                name: name.to_string(),
                node: *tip,
                reason: format!("more than {max_len} nodes above the finalized block"),
            }
            .into());
        }

        let Some(parent) = node.get_parent_ids().first().copied() else {
            return Err(not_descendant().into());
        };

        path.push(node);
        current = parent;
    }

    let mut sequence = HeightSequence {
        tip: *tip,
        phase: Phase::Finalized,
        agenda: None,
        agenda_proof: None,
        block: None,
        kinds: Vec::with_capacity(path.len()),
        reserved_state: base.reserved_state.clone(),
    };

    let mut transactions = vec![];
    let mut parent = base_node;

    for node in path.into_iter().rev() {
        let id = *node.get_identifier();
        let ctx = ValidationContext {
            reserved_state: Some(&sequence.reserved_state),
            height: base.height,
        };

        let validated = validator.validate(&node, Some(parent.as_ref()), ctx)?;
        let kind = validated.kind;

        let Some(next) = sequence.phase.advance(kind) else {
            return Err(InvalidCommit::OutOfSequence {
                node: id,
                kind,
                reason: format!("cannot follow the {} phase", sequence.phase),
            }
            .into());
        };

        match kind {
            CommitKind::Transaction => transactions.push(id),
            CommitKind::Agenda => {
                let body: AgendaBody = decode(&node)?;
                if body.transactions != transactions {
                    return Err(InvalidCommit::malformed(
                        id,
                        "agenda does not list the transactions it covers",
                    )
                    .into());
                }
                sequence.agenda = Some(id);
            }
            CommitKind::AgendaProof => sequence.agenda_proof = Some(id),
            CommitKind::Block => {
                let header: BlockHeader = decode(&node)?;
                if header.previous_block != Some(base.block) {
                    return Err(InvalidCommit::malformed(
                        id,
                        format!("block does not build on finalized block {}", base.block),
                    )
                    .into());
                }
                sequence.block = Some(id);
            }
            _ => {}
        }

        if let Some(state) = validated.reserved_state {
            sequence.reserved_state = state;
        }

        log::trace!("Node {id:?} is a valid {kind} commit");

        sequence.phase = next;
        sequence.kinds.push((id, kind));
        parent = node;
    }

    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{Diff, Payload};
    use crate::crypto::{hash, PrivateKey, TypedSignature};
    use crate::proof::{ConsensusVote, Misbehavior};
    use crate::reserved::Member;

    fn keys() -> Vec<PrivateKey> {
        (1..=4).map(|i| PrivateKey::from_seed([i; 32])).collect()
    }

    fn state(keys: &[PrivateKey]) -> ReservedState {
        ReservedState::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| Member::new(format!("member-{i}"), k.public_key(), 1, 1))
                .collect(),
        )
    }

    fn block(parent: NodeId, height: u64, previous: Option<NodeId>, key: &PrivateKey) -> Node {
        let header = BlockHeader {
            height,
            author: key.public_key(),
            previous_block: previous,
            timestamp: 0,
        };
        Node::child_of(parent, Payload::block(&header), Some(key.public_key()))
    }

    #[test]
    fn tx_touching_reserved_state() {
        let keys = keys();
        let state = state(&keys);
        let validator = CommitValidator::default();
        let ctx = ValidationContext {
            reserved_state: Some(&state),
            height: 0,
        };

        let parent = block(hash(b"chat"), 0, None, &keys[0]);

        let mut diff = Diff::default();
        diff.ordinary
            .insert("reserved/members".to_string(), Some("me".to_string()));
        let tx = Node::child_of(
            *parent.get_identifier(),
            Payload::transaction("grab power", "", diff),
            None,
        );

        assert_eq!(
            validator.validate(&tx, Some(&parent), ctx),
            Err(InvalidCommit::ReservedStateViolation {
                node: *tx.get_identifier(),
                kind: CommitKind::Transaction,
            })
        );

        let tx = Node::child_of(
            *parent.get_identifier(),
            Payload::transaction("also grab power", "", Diff::reserved_only(state.clone())),
            None,
        );
        assert!(matches!(
            validator.validate(&tx, Some(&parent), ctx),
            Err(InvalidCommit::ReservedStateViolation { .. })
        ));
    }

    #[test]
    fn parent_rules() {
        let keys = keys();
        let state = state(&keys);
        let validator = CommitValidator::default();
        let ctx = ValidationContext {
            reserved_state: Some(&state),
            height: 0,
        };

        let parent = block(hash(b"chat"), 0, None, &keys[0]);
        let chat = Node::child_of(*parent.get_identifier(), Payload::chat("hi"), None);

        assert!(matches!(
            validator.validate(&chat, Some(&parent), ctx),
            Err(InvalidCommit::WrongParentKind {
                kind: CommitKind::Chat,
                parent_kind: CommitKind::Block,
                ..
            })
        ));

        let merge = Node::new(
            vec![*parent.get_identifier(), hash(b"other")],
            Payload::transaction("merge", "", Default::default()),
            None,
        );
        assert!(matches!(
            validator.validate(&merge, Some(&parent), ctx),
            Err(InvalidCommit::WrongParentCount {
                expected: 1,
                found: 2,
                ..
            })
        ));

        let bogus = Node::child_of(
            *parent.get_identifier(),
            Payload::transaction(">bogus", "", Default::default()),
            None,
        );
        assert!(matches!(
            validator.validate(&bogus, Some(&parent), ctx),
            Err(InvalidCommit::MalformedPayload { .. })
        ));
    }

    #[test]
    fn agenda_proof_acceptance() {
        let keys = keys();
        let state = state(&keys);
        let validator = CommitValidator::default();
        let ctx = ValidationContext {
            reserved_state: Some(&state),
            height: 0,
        };

        let parent = block(hash(b"chat"), 0, None, &keys[0]);
        let agenda = Node::child_of(
            *parent.get_identifier(),
            Payload::agenda(&AgendaBody {
                height: 1,
                author: keys[0].public_key(),
                timestamp: 0,
                transactions: vec![],
            }),
            Some(keys[0].public_key()),
        );
        let agenda_id = *agenda.get_identifier();

        let proof_node = |signers: &[PrivateKey], target: NodeId, parent: NodeId| {
            let signatures = signers
                .iter()
                .map(|k| {
                    TypedSignature::sign(&ProofVerifier::tag_message(&target, &k.public_key()), k)
                })
                .collect();
            Node::child_of(
                parent,
                Payload::agenda_proof(&AgendaProofBody {
                    height: 1,
                    agenda: target,
                    signatures,
                }),
                None,
            )
        };

        let good = proof_node(&keys[..3], agenda_id, agenda_id);
        assert_eq!(
            validator.validate(&good, Some(&agenda), ctx).map(|v| v.kind),
            Ok(CommitKind::AgendaProof)
        );

        // Not enough voting power
        let weak = proof_node(&keys[..2], agenda_id, agenda_id);
        assert!(matches!(
            validator.validate(&weak, Some(&agenda), ctx),
            Err(InvalidCommit::ProofFailed(ProofFailed::InsufficientQuorum { .. }))
        ));

        // Valid proof, but the parent is not an agenda
        let tx = Node::child_of(
            *parent.get_identifier(),
            Payload::transaction("tx", "", Default::default()),
            None,
        );
        let misplaced = proof_node(&keys[..3], agenda_id, *tx.get_identifier());
        assert!(matches!(
            validator.validate(&misplaced, Some(&tx), ctx),
            Err(InvalidCommit::WrongParentKind { .. })
        ));
    }

    #[test]
    fn delegation_requires_delegator_signature() {
        let keys = keys();
        let state = state(&keys);
        let validator = CommitValidator::default();
        let ctx = ValidationContext {
            reserved_state: Some(&state),
            height: 3,
        };

        let proof_parent = Node::child_of(
            hash(b"agenda"),
            Payload::agenda_proof(&AgendaProofBody {
                height: 4,
                agenda: hash(b"agenda"),
                signatures: vec![],
            }),
            None,
        );
        let parent_id = *proof_parent.get_identifier();
        let next = state.delegate("member-0", "member-1", true).unwrap();

        let signed = DelegationTx::new("member-0", "member-1", true, 3, &keys[0]);
        let node = Node::child_of(parent_id, Payload::delegate(&signed, next.clone()), None);
        let validated = validator.validate(&node, Some(&proof_parent), ctx).unwrap();
        assert_eq!(validated.reserved_state, Some(next.clone()));

        let forged = DelegationTx::new("member-0", "member-1", true, 3, &keys[2]);
        let node = Node::child_of(parent_id, Payload::delegate(&forged, next.clone()), None);
        assert!(matches!(
            validator.validate(&node, Some(&proof_parent), ctx),
            Err(InvalidCommit::ProofFailed(ProofFailed::InvalidSignature { .. }))
        ));

        // The declared state must be the one the delegation produces
        let node = Node::child_of(parent_id, Payload::delegate(&signed, state.clone()), None);
        assert!(matches!(
            validator.validate(&node, Some(&proof_parent), ctx),
            Err(InvalidCommit::ReservedStateViolation { .. })
        ));
    }

    /// An (unchecked) agenda proof that extra-agenda transactions can follow
    fn proof_parent() -> Node {
        Node::child_of(
            hash(b"agenda"),
            Payload::agenda_proof(&AgendaProofBody {
                height: 4,
                agenda: hash(b"agenda"),
                signatures: vec![],
            }),
            None,
        )
    }

    /// `offender` voting for two blocks; the second vote is signed by `second_signer`
    fn double_vote(offender: &PrivateKey, second_signer: &PrivateKey) -> Misbehavior {
        let vote = |block: &[u8]| ConsensusVote {
            height: 3,
            round: 1,
            block: hash(block),
        };
        let (first, second) = (vote(b"left"), vote(b"right"));

        Misbehavior::DoubleVote {
            offender: offender.public_key(),
            first: (first.clone(), offender.sign(&first.signing_bytes())),
            second: (second.clone(), second_signer.sign(&second.signing_bytes())),
        }
    }

    #[test]
    fn undelegation() {
        let keys = keys();
        let original = state(&keys);
        let delegated = original.delegate("member-0", "member-1", true).unwrap();
        let validator = CommitValidator::default();
        let ctx = ValidationContext {
            reserved_state: Some(&delegated),
            height: 3,
        };

        let parent = proof_parent();
        let parent_id = *parent.get_identifier();

        let signed = UndelegationTx::new("member-0", 3, &keys[0]);
        let node = Node::child_of(parent_id, Payload::undelegate(&signed, original.clone()), None);
        let validated = validator.validate(&node, Some(&parent), ctx).unwrap();
        assert_eq!(validated.kind, CommitKind::Undelegate);
        assert_eq!(validated.reserved_state, Some(original.clone()));

        let forged = UndelegationTx::new("member-0", 3, &keys[1]);
        let node = Node::child_of(parent_id, Payload::undelegate(&forged, original.clone()), None);
        assert!(matches!(
            validator.validate(&node, Some(&parent), ctx),
            Err(InvalidCommit::ProofFailed(ProofFailed::InvalidSignature { .. }))
        ));

        // Signed for another height
        let stale = UndelegationTx::new("member-0", 2, &keys[0]);
        let node = Node::child_of(parent_id, Payload::undelegate(&stale, original.clone()), None);
        assert!(matches!(
            validator.validate(&node, Some(&parent), ctx),
            Err(InvalidCommit::MalformedPayload { .. })
        ));

        // member-2 never delegated
        let pointless = UndelegationTx::new("member-2", 3, &keys[2]);
        let node = Node::child_of(parent_id, Payload::undelegate(&pointless, delegated.clone()), None);
        assert!(matches!(
            validator.validate(&node, Some(&parent), ctx),
            Err(InvalidCommit::MalformedPayload { .. })
        ));

        // The declared state must be the undelegated one
        let node = Node::child_of(parent_id, Payload::undelegate(&signed, delegated.clone()), None);
        assert!(matches!(
            validator.validate(&node, Some(&parent), ctx),
            Err(InvalidCommit::ReservedStateViolation {
                kind: CommitKind::Undelegate,
                ..
            })
        ));
    }

    #[test]
    fn report_rejections() {
        let keys = keys();
        let state = state(&keys);
        let validator = CommitValidator::default();
        let ctx = ValidationContext {
            reserved_state: Some(&state),
            height: 3,
        };

        let parent = proof_parent();
        let parent_id = *parent.get_identifier();
        let offender = &keys[3];
        let slashed = state.expel(&offender.public_key()).unwrap();

        let report = |evidence: Misbehavior, next: &ReservedState| {
            Node::child_of(
                parent_id,
                Payload::report(&ReportTx { evidence }, next.clone()),
                None,
            )
        };

        let node = report(double_vote(offender, offender), &slashed);
        let validated = validator.validate(&node, Some(&parent), ctx).unwrap();
        assert_eq!(validated.reserved_state, Some(slashed.clone()));

        // The second vote was not signed by the accused
        let node = report(double_vote(offender, &keys[2]), &slashed);
        assert_eq!(
            validator.validate(&node, Some(&parent), ctx),
            Err(InvalidCommit::ProofFailed(ProofFailed::InvalidEvidence {
                node: *node.get_identifier(),
            }))
        );

        // Valid evidence, but the diff is not the slashing result
        let node = report(double_vote(offender, offender), &state);
        assert_eq!(
            validator.validate(&node, Some(&parent), ctx),
            Err(InvalidCommit::ReservedStateViolation {
                node: *node.get_identifier(),
                kind: CommitKind::Report,
            })
        );

        let outsider = PrivateKey::from_seed([99; 32]);
        let node = report(double_vote(&outsider, &outsider), &state);
        assert_eq!(
            validator.validate(&node, Some(&parent), ctx),
            Err(InvalidCommit::ProofFailed(ProofFailed::UnknownOffender {
                node: *node.get_identifier(),
                offender: outsider.public_key(),
            }))
        );
    }
}
