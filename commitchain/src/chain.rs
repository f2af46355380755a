use std::collections::{BTreeMap, HashMap};

use crate::branch::{Actor, BranchManager, UpdateRequest};
use crate::commit::{BlockHeader, CommitKind};
use crate::crypto::NodeId;
use crate::error::{BranchRejected, Error};
use crate::graph::CommitGraph;
use crate::refs::BranchName;
use crate::reserved::ReservedState;
use crate::validator::FinalizedTip;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainState {
    Idle { height: u64 },
}

/// Result of a successful finalization
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finalization {
    pub height: u64,
    pub block: NodeId,
    /// Branches deleted because they no longer extend `main`, with their last tip
    pub pruned: Vec<(BranchName, NodeId)>,
}

/// Drives height progression of `main`
pub struct ChainStateMachine {
    finalized: FinalizedTip,
    /// Tips of the proposal branches this node accepted
    pending: BTreeMap<BranchName, NodeId>,
    /// Height of every block that was finalized
    block_heights: HashMap<NodeId, u64>,
    prune_local_proposal: bool,
}

impl ChainStateMachine {
    pub fn new(finalized: FinalizedTip, prune_local_proposal: bool) -> Self {
        let mut block_heights = HashMap::new();
        block_heights.insert(finalized.block, finalized.height);

        Self {
            finalized,
            pending: Default::default(),
            block_heights,
            prune_local_proposal,
        }
    }

    pub fn get_state(&self) -> ChainState {
        ChainState::Idle {
            height: self.finalized.height,
        }
    }

    pub fn get_finalized(&self) -> &FinalizedTip {
        &self.finalized
    }

    pub fn height(&self) -> u64 {
        self.finalized.height
    }

    pub fn main_tip(&self) -> NodeId {
        self.finalized.block
    }

    pub fn reserved_state(&self) -> &ReservedState {
        &self.finalized.reserved_state
    }

    /// Height a finalized block was finalized at
    pub fn finalized_height_of(&self, block: &NodeId) -> Option<u64> {
        self.block_heights.get(block).copied()
    }

    pub fn track(&mut self, branch: BranchName, tip: NodeId) {
        if branch.is_pending() {
            self.pending.insert(branch, tip);
        }
    }

    pub fn untrack(&mut self, branch: &BranchName) -> Option<NodeId> {
        self.pending.remove(branch)
    }

    pub fn tracked_tip(&self, branch: &BranchName) -> Option<NodeId> {
        self.pending.get(branch).copied()
    }

    pub fn pending_branches(&self) -> Vec<(BranchName, NodeId)> {
        self.pending.iter().map(|(name, tip)| (*name, *tip)).collect()
    }

    /// Records finalized blocks found while recovering from storage
    pub(crate) fn remember_block(&mut self, block: NodeId, height: u64) {
        self.block_heights.insert(block, height);
    }

    /// Advances `main` to `block` once external consensus declared it final
    ///
    /// Only blocks carried by a tracked `b-<n>` or `p` branch are eligible.
    pub fn finalize<G: CommitGraph + ?Sized>(
        &mut self,
        graph: &G,
        branches: &BranchManager,
        block: &NodeId,
    ) -> Result<Finalization, Error> {
        if let Some(height) = self.block_heights.get(block) {
            return Err(BranchRejected::SupersededHeight {
                block: *block,
                height: *height,
            }
            .into());
        }

        let node = graph
            .get_node(block)
            .ok_or(BranchRejected::UnknownNode { node: *block })?;

        if node.claimed_kind() == Some(CommitKind::Block) {
            if let Ok(header) = node.get_payload().decode_body::<BlockHeader>() {
                if header.height <= self.finalized.height {
                    return Err(BranchRejected::SupersededHeight {
                        block: *block,
                        height: header.height,
                    }
                    .into());
                }
            }
        }

        let carried = self.pending.iter().any(|(name, tip)| {
            tip == block && matches!(name, BranchName::Block(_) | BranchName::Proposal)
        });
        if !carried {
            return Err(BranchRejected::UnknownBlock { block: *block }.into());
        }

        let old = self.finalized.block;
        let request = UpdateRequest {
            actor: Actor::Finalization,
            branch: BranchName::Main,
            old_tip: Some(old),
            new_tip: *block,
            new_nodes: vec![],
        };

        let Some(sequence) = branches.can_update(graph, &request, &self.finalized)? else {
            return Err(BranchRejected::IllegalSequence {
                name: BranchName::Main.to_string(),
                node: *block,
                reason: "no height sequence".to_string(),
            }
            .into());
        };

        graph.update_ref(&BranchName::Main.to_string(), Some(old), Some(*block))?;

        let height = self.finalized.height + 1;
        self.finalized = FinalizedTip {
            block: *block,
            height,
            reserved_state: sequence.reserved_state,
        };
        self.block_heights.insert(*block, height);

        log::info!("Finalized block {block:?} at height {height}");

        let pruned = self.prune(graph, block);

        Ok(Finalization {
            height,
            block: *block,
            pruned,
        })
    }

    /// Deletes tracked branches that do not strictly extend the new `main`
    pub(crate) fn prune<G: CommitGraph + ?Sized>(
        &mut self,
        graph: &G,
        main: &NodeId,
    ) -> Vec<(BranchName, NodeId)> {
        let mut pruned = vec![];

        let stale: Vec<(BranchName, NodeId)> = self
            .pending
            .iter()
            .filter(|(_, tip)| *tip == main || !graph.is_ancestor(main, tip))
            .map(|(name, tip)| (*name, *tip))
            .collect();

        for (name, tip) in stale {
            self.pending.remove(&name);

            if name == BranchName::Proposal && !self.prune_local_proposal {
                log::debug!("Keeping stale local proposal at {tip:?}");
                continue;
            }

            match graph.update_ref(&name.to_string(), Some(tip), None) {
                Ok(()) => {
                    log::debug!("Pruned branch `{name}` at {tip:?}");
                    pruned.push((name, tip));
                }
                Err(err) => {
                    log::warn!("Failed to prune branch `{name}`: {err}");
                }
            }
        }

        pruned
    }
}
