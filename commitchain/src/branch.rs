use std::collections::HashMap;

use crate::commit::CommitKind;
use crate::crypto::NodeId;
use crate::error::{BranchRejected, Error, InvalidCommit};
use crate::graph::NodeLookup;
use crate::refs::BranchName;
use crate::reserved::ReservedState;
use crate::validator::{
    validate_sequence, CommitValidator, FinalizedTip, HeightSequence, Phase, ValidationContext,
};

/// Who is asking to move a branch
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum Actor {
    /// The local node's operator
    #[display("the operator")]
    Operator,
    /// A remote node propagating its branches
    #[display("a peer")]
    Peer,
    /// The finalization transition
    #[display("finalization")]
    Finalization,
}

#[derive(Clone, Debug)]
pub struct UpdateRequest {
    pub actor: Actor,
    pub branch: BranchName,
    pub old_tip: Option<NodeId>,
    pub new_tip: NodeId,
    /// Nodes introduced by this update, parents first
    pub new_nodes: Vec<NodeId>,
}

/// Admission rules per branch class
#[derive(Clone, Debug)]
pub struct BranchManager {
    validator: CommitValidator,
    max_sequence_length: usize,
}

impl BranchManager {
    pub fn new(validator: CommitValidator, max_sequence_length: usize) -> Self {
        Self {
            validator,
            max_sequence_length,
        }
    }

    pub fn get_validator(&self) -> &CommitValidator {
        &self.validator
    }

    fn may_move(actor: Actor, branch: &BranchName) -> bool {
        match branch {
            BranchName::Main => actor == Actor::Finalization,
            BranchName::Work | BranchName::Proposal => actor == Actor::Operator,
            BranchName::Agenda(_) | BranchName::Block(_) => actor == Actor::Peer,
        }
    }

    /// Decides whether `request` may be applied on top of `base`
    ///
    /// Returns the validated height sequence for every branch but `work`.
    pub fn can_update<L: NodeLookup + ?Sized>(
        &self,
        lookup: &L,
        request: &UpdateRequest,
        base: &FinalizedTip,
    ) -> Result<Option<HeightSequence>, Error> {
        let name = request.branch.to_string();

        if !Self::may_move(request.actor, &request.branch) {
            return Err(BranchRejected::PermissionDenied {
                name,
                actor: request.actor.to_string(),
            }
            .into());
        }

        if lookup.lookup(&request.new_tip).is_none() {
            return Err(BranchRejected::UnknownNode {
                node: request.new_tip,
            }
            .into());
        }

        if request.branch == BranchName::Work {
            self.check_work(lookup, request, base)?;
            return Ok(None);
        }

        // Peer branches only ever move forward. `p` belongs to the operator and
        // may be re-pointed, e.g. after a competing block won its height.
        if let Some(old) = request.old_tip.filter(|_| request.branch != BranchName::Proposal) {
            if !lookup.descends_from(&request.new_tip, &old) {
                return Err(BranchRejected::NonFastForward {
                    name,
                    old,
                    new: request.new_tip,
                }
                .into());
            }
        }

        let sequence = validate_sequence(
            lookup,
            &self.validator,
            base,
            &name,
            &request.new_tip,
            self.max_sequence_length,
        )?;

        let legal = match request.branch {
            BranchName::Main | BranchName::Proposal | BranchName::Block(_) => {
                sequence.phase == Phase::Block
            }
            BranchName::Agenda(_) => {
                matches!(sequence.phase, Phase::Agenda | Phase::AgendaProof)
            }
            BranchName::Work => true,
        };

        if !legal {
            return Err(BranchRejected::IllegalSequence {
                name,
                node: request.new_tip,
                reason: format!("sequence ends in the {} phase", sequence.phase),
            }
            .into());
        }

        log::trace!(
            "{} may move `{name}` to {:?} ({} new nodes)",
            request.actor,
            request.new_tip,
            sequence.kinds.len()
        );

        Ok(Some(sequence))
    }

    /// `work` accepts anything whose new nodes are individually valid
    fn check_work<L: NodeLookup + ?Sized>(
        &self,
        lookup: &L,
        request: &UpdateRequest,
        base: &FinalizedTip,
    ) -> Result<(), Error> {
        let mut states: HashMap<NodeId, ReservedState> = HashMap::new();

        for id in request.new_nodes.iter() {
            let node = lookup
                .lookup(id)
                .ok_or(BranchRejected::UnknownNode { node: *id })?;

            if node.claimed_kind() == Some(CommitKind::Initial) {
                return Err(InvalidCommit::OutOfSequence {
                    node: *id,
                    kind: CommitKind::Initial,
                    reason: "only the first node of the repository may be initial".to_string(),
                }
                .into());
            }

            let parent_id = node.get_parent_ids().first().copied();
            let parent = parent_id.and_then(|parent| lookup.lookup(&parent));
            let state = parent_id
                .and_then(|parent| states.get(&parent))
                .unwrap_or(&base.reserved_state);

            let ctx = ValidationContext {
                reserved_state: Some(state),
                height: base.height,
            };
            let validated = self.validator.validate(&node, parent.as_deref(), ctx)?;

            if let Some(state) = validated.reserved_state {
                states.insert(*id, state);
            } else if let Some(state) = parent_id.and_then(|parent| states.get(&parent)).cloned() {
                states.insert(*id, state);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{BlockHeader, GenesisInfo, Node, Payload};
    use crate::crypto::PrivateKey;
    use crate::graph::{CommitGraph, MemoryGraph};
    use crate::reserved::Member;

    use test_log::test;

    struct Fixture {
        graph: MemoryGraph,
        base: FinalizedTip,
        key: PrivateKey,
    }

    fn fixture() -> Fixture {
        let key = PrivateKey::from_seed([7; 32]);
        let state = ReservedState::new(vec![Member::new("solo", key.public_key(), 1, 1)]);
        let graph = MemoryGraph::new();

        let initial = graph
            .create_node(Node::new(vec![], Payload::initial(), None))
            .unwrap();
        let info = GenesisInfo {
            chain_name: "test".to_string(),
            timestamp: 0,
        };
        let genesis = graph
            .create_node(Node::child_of(initial, Payload::genesis(&info, state.clone()), None))
            .unwrap();
        let header = BlockHeader {
            height: 0,
            author: key.public_key(),
            previous_block: None,
            timestamp: 0,
        };
        let block = graph
            .create_node(Node::child_of(genesis, Payload::block(&header), None))
            .unwrap();

        Fixture {
            graph,
            base: FinalizedTip {
                block,
                height: 0,
                reserved_state: state,
            },
            key,
        }
    }

    fn request(actor: Actor, branch: BranchName, new_tip: NodeId) -> UpdateRequest {
        UpdateRequest {
            actor,
            branch,
            old_tip: None,
            new_tip,
            new_nodes: vec![new_tip],
        }
    }

    #[test]
    fn permissions() {
        let fixture = fixture();
        let manager = BranchManager::new(CommitValidator::default(), 64);
        let tip = fixture.base.block;

        for (actor, branch) in [
            (Actor::Operator, BranchName::Main),
            (Actor::Peer, BranchName::Main),
            (Actor::Operator, BranchName::Agenda(1)),
            (Actor::Peer, BranchName::Proposal),
            (Actor::Finalization, BranchName::Block(2)),
        ] {
            assert!(matches!(
                manager.can_update(&fixture.graph, &request(actor, branch, tip), &fixture.base),
                Err(Error::BranchRejected(BranchRejected::PermissionDenied { .. }))
            ));
        }
    }

    #[test]
    fn work_accepts_loose_nodes() {
        let fixture = fixture();
        let manager = BranchManager::new(CommitValidator::default(), 64);

        let tx = fixture
            .graph
            .create_node(Node::child_of(
                fixture.base.block,
                Payload::transaction("note", "anything", Default::default()),
                Some(fixture.key.public_key()),
            ))
            .unwrap();

        let result = manager.can_update(
            &fixture.graph,
            &request(Actor::Operator, BranchName::Work, tx),
            &fixture.base,
        );
        assert!(matches!(result, Ok(None)));

        // A lone transaction is not a proposed block
        assert!(matches!(
            manager.can_update(
                &fixture.graph,
                &request(Actor::Operator, BranchName::Proposal, tx),
                &fixture.base,
            ),
            Err(Error::BranchRejected(BranchRejected::IllegalSequence { .. }))
        ));
    }

    #[test]
    fn no_rewrites() {
        let fixture = fixture();
        let manager = BranchManager::new(CommitValidator::default(), 64);

        let make_tx = |title: &str| {
            fixture
                .graph
                .create_node(Node::child_of(
                    fixture.base.block,
                    Payload::transaction(title, "", Default::default()),
                    None,
                ))
                .unwrap()
        };
        let first = make_tx("first");
        let second = make_tx("second");

        let mut req = request(Actor::Peer, BranchName::Agenda(1), second);
        req.old_tip = Some(first);

        assert!(matches!(
            manager.can_update(&fixture.graph, &req, &fixture.base),
            Err(Error::BranchRejected(BranchRejected::NonFastForward { .. }))
        ));
    }

    #[test]
    fn proposal_may_be_repointed() {
        let fixture = fixture();
        let manager = BranchManager::new(CommitValidator::default(), 64);

        let stale = fixture
            .graph
            .create_node(Node::child_of(
                fixture.base.block,
                Payload::transaction("abandoned", "", Default::default()),
                None,
            ))
            .unwrap();

        let mut req = request(Actor::Operator, BranchName::Proposal, fixture.base.block);
        req.old_tip = Some(stale);

        // Not a fast-forward, so only the sequence check applies
        assert!(matches!(
            manager.can_update(&fixture.graph, &req, &fixture.base),
            Err(Error::BranchRejected(BranchRejected::IllegalSequence { .. }))
        ));
    }
}
