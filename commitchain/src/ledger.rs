use std::sync::OnceLock;

use dashmap::DashMap;

use parking_lot::Mutex;

use crate::branch::{Actor, BranchManager, UpdateRequest};
use crate::chain::{ChainStateMachine, Finalization};
use crate::commit::{AgendaProofBody, BlockHeader, CommitKind, GenesisInfo, Node, Payload};
use crate::config::LedgerConfig;
use crate::crypto::{NodeId, PublicKey, Signature, TypedSignature};
use crate::error::{BranchRejected, Error, InvalidCommit, RefConflict, StorageError};
use crate::events::{Event, EventCallback};
use crate::graph::{CommitGraph, MemoryGraph, NodeLookup, Overlay};
use crate::proof::ProofVerifier;
use crate::refs::{allocate_number, BranchName, RefName, TagName};
use crate::reserved::ReservedState;
use crate::tags::{TagManager, TagOutcome, TagRecord, TagRequest};
use crate::validator::{CommitValidator, FinalizedTip, ValidationContext};

/// What a ref update carries
#[derive(Clone, Debug)]
pub enum Push {
    /// New nodes, parents first; the branch moves to the last one
    Chain(Vec<Node>),
    /// Move the branch to a node that is already stored
    Move(NodeId),
    /// Create a vote or veto tag
    Tag {
        target: NodeId,
        voter: PublicKey,
        signature: Signature,
    },
}

/// A ref update that was applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accepted {
    /// The ref that was written; may differ in number from the requested one
    pub name: String,
    pub tip: NodeId,
}

struct LedgerState {
    chain: ChainStateMachine,
    tags: TagManager,
}

/// The ledger core as seen by the consensus and networking collaborators
///
/// Validation runs against a snapshot of the finalized tip without holding
/// any lock. Applying an update is serialized by a single mutex that also
/// re-checks the snapshot is still current.
pub struct Ledger<G: CommitGraph = MemoryGraph> {
    graph: G,
    config: LedgerConfig,
    branches: BranchManager,
    state: Mutex<LedgerState>,
    /// Kind of every node this ledger accepted
    kinds: DashMap<NodeId, CommitKind>,
    event_callback: OnceLock<EventCallback>,
}

impl<G: CommitGraph> Ledger<G> {
    fn with_state(graph: G, config: LedgerConfig, finalized: FinalizedTip) -> Self {
        let verifier = ProofVerifier::new(config.governance_threshold, config.consensus_threshold);
        let branches = BranchManager::new(CommitValidator::new(verifier), config.max_sequence_length);
        let chain = ChainStateMachine::new(finalized, config.prune_local_proposal);

        Self {
            graph,
            branches,
            state: Mutex::new(LedgerState {
                chain,
                tags: TagManager::new(),
            }),
            kinds: DashMap::new(),
            event_callback: OnceLock::new(),
            config,
        }
    }

    /// Creates a new chain: initial, genesis and block zero, with `main` on the block
    pub fn genesis(
        graph: G,
        config: LedgerConfig,
        timestamp: i64,
        state: ReservedState,
        author: PublicKey,
    ) -> Result<Self, Error> {
        if graph.locate_ref(&BranchName::Main.to_string()).is_some() {
            return Err(StorageError::InvalidRepository {
                reason: "a chain already exists".to_string(),
            }
            .into());
        }

        let info = GenesisInfo {
            chain_name: config.chain_name.clone(),
            timestamp,
        };

        let initial = Node::new(vec![], Payload::initial(), None);
        let genesis = Node::child_of(
            *initial.get_identifier(),
            Payload::genesis(&info, state.clone()),
            Some(author),
        );
        let header = BlockHeader {
            height: 0,
            author,
            previous_block: None,
            timestamp,
        };
        let block = Node::child_of(*genesis.get_identifier(), Payload::block(&header), Some(author));
        let block_id = *block.get_identifier();

        let validator = CommitValidator::default();
        let mut ctx = ValidationContext {
            reserved_state: None,
            height: 0,
        };
        validator.validate(&initial, None, ctx)?;
        validator.validate(&genesis, Some(&initial), ctx)?;
        ctx.reserved_state = Some(&state);
        validator.validate(&block, Some(&genesis), ctx)?;

        let finalized = FinalizedTip {
            block: block_id,
            height: 0,
            reserved_state: state.clone(),
        };
        let ledger = Self::with_state(graph, config, finalized);

        for (node, kind) in [
            (initial, CommitKind::Initial),
            (genesis, CommitKind::Genesis),
            (block, CommitKind::Block),
        ] {
            ledger.store(node, kind)?;
        }

        ledger
            .graph
            .update_ref(&BranchName::Main.to_string(), None, Some(block_id))?;

        log::info!(
            "Created chain `{}` with {} members; block zero is {block_id:?}",
            ledger.config.chain_name,
            state.members.len()
        );

        Ok(ledger)
    }

    /// Recovers the ledger from a graph that already holds a chain
    pub fn open(graph: G, config: LedgerConfig) -> Result<Self, Error> {
        let main_name = BranchName::Main.to_string();
        let Some(main) = graph.locate_ref(&main_name) else {
            return Err(StorageError::InvalidRepository {
                reason: "there is no `main` branch".to_string(),
            }
            .into());
        };

        let mut history = graph.list_ancestors(&main, None)?;
        history.reverse();
        history.push(main);

        let mut reserved_state: Option<ReservedState> = None;
        let mut blocks = vec![];
        let mut kinds = vec![];

        for id in history {
            let node = graph
                .get_node(&id)
                .ok_or(BranchRejected::UnknownNode { node: id })?;
            let kind = node.claimed_kind().ok_or_else(|| {
                InvalidCommit::malformed(id, format!("unknown header `{}`", node.get_title()))
            })?;

            if let Some(state) = &node.get_payload().diff.reserved {
                reserved_state = Some(state.clone());
            }
            if kind == CommitKind::Block {
                let header: BlockHeader = node
                    .get_payload()
                    .decode_body()
                    .map_err(|reason| InvalidCommit::malformed(id, reason))?;
                blocks.push((id, header.height));
            }
            kinds.push((id, kind));
        }

        let (Some(state), Some((_, height))) = (reserved_state, blocks.last().copied()) else {
            return Err(StorageError::InvalidRepository {
                reason: "`main` does not contain a genesis block".to_string(),
            }
            .into());
        };

        let finalized = FinalizedTip {
            block: main,
            height,
            reserved_state: state,
        };
        let ledger = Self::with_state(graph, config, finalized);

        for (id, kind) in kinds {
            ledger.kinds.insert(id, kind);
        }

        {
            let mut state = ledger.state.lock();
            for (block, height) in blocks {
                state.chain.remember_block(block, height);
            }

            state.tags = TagManager::recover(&ledger.graph)?;

            // Proposals that still extend `main` stay pending, the others are
            // pruned as if their height had just been finalized
            for name in ledger.graph.list_refs("") {
                let Ok(RefName::Branch(branch)) = name.parse::<RefName>() else {
                    continue;
                };
                let Some(tip) = ledger.graph.locate_ref(&name) else {
                    continue;
                };
                state.chain.track(branch, tip);
            }

            let pruned = state.chain.prune(&ledger.graph, &main);
            if !pruned.is_empty() {
                log::info!("Pruned {} stale branches while opening", pruned.len());
            }
        }

        log::info!("Opened chain at height {height} with tip {main:?}");
        Ok(ledger)
    }

    /// Installs the event callback; it is never invoked while the ledger is locked
    pub fn set_event_callback(&self, callback: EventCallback) {
        self.event_callback
            .set(callback)
            .unwrap_or_else(|_| panic!("Event callback already set"));
    }

    fn emit(&self, event: Event) {
        if let Some(handler) = self.event_callback.get() {
            handler(event);
        }
    }

    /// Persists a validated node; returns the creation event if it is new
    fn store(&self, node: Node, kind: CommitKind) -> Result<Option<Event>, Error> {
        let existed = self.graph.has_node(node.get_identifier());
        let identifier = self.graph.create_node(node)?;
        self.kinds.insert(identifier, kind);

        if existed {
            Ok(None)
        } else {
            Ok(Some(Event::NodeCreated { identifier, kind }))
        }
    }

    /// Handles a ref update received from a peer
    #[tracing::instrument(skip(self, push))]
    pub fn on_push(&self, name: &str, push: Push) -> Result<Accepted, Error> {
        let result = match name.parse::<RefName>() {
            Ok(RefName::Branch(branch)) => self.update_branch(Actor::Peer, branch, push),
            Ok(RefName::Tag(tag)) => self.push_tag(tag, push),
            Err(err) => Err(err.into()),
        };

        self.report(name, result)
    }

    /// Moves `work` or `p` on behalf of the local operator
    #[tracing::instrument(skip(self, push))]
    pub fn operator_update(&self, name: &str, push: Push) -> Result<Accepted, Error> {
        let result = name
            .parse::<BranchName>()
            .map_err(Error::from)
            .and_then(|branch| self.update_branch(Actor::Operator, branch, push));

        self.report(name, result)
    }

    fn report(&self, name: &str, result: Result<Accepted, Error>) -> Result<Accepted, Error> {
        if let Err(err) = &result {
            if err.is_conflict() {
                log::warn!("Lost race while updating `{name}`: {err}");
            } else {
                log::warn!("Rejected update of `{name}`: {err}");
            }
            self.emit(Event::PushRejected {
                name: name.to_string(),
                reason: err.to_string(),
            });
        }
        result
    }

    fn push_tag(&self, tag: TagName, push: Push) -> Result<Accepted, Error> {
        let Push::Tag {
            target,
            voter,
            signature,
        } = push
        else {
            return Err(BranchRejected::EmptyPush {
                name: tag.to_string(),
            }
            .into());
        };

        let outcome = match tag {
            TagName::Vote(num) => self.register_vote(target, voter, signature, Some(num))?,
            TagName::Veto(num) => self.register_veto(target, voter, signature, Some(num))?,
        };

        Ok(Accepted {
            name: outcome.name().to_string(),
            tip: target,
        })
    }

    fn update_branch(&self, actor: Actor, branch: BranchName, push: Push) -> Result<Accepted, Error> {
        let (nodes, tip) = match push {
            Push::Chain(nodes) => {
                let Some(last) = nodes.last() else {
                    return Err(BranchRejected::EmptyPush {
                        name: branch.to_string(),
                    }
                    .into());
                };
                let tip = *last.get_identifier();
                (nodes, tip)
            }
            Push::Move(tip) => (vec![], tip),
            Push::Tag { .. } => {
                return Err(BranchRejected::UnknownNamespace {
                    name: branch.to_string(),
                }
                .into());
            }
        };

        let base = self.state.lock().chain.get_finalized().clone();

        let overlay = Overlay::new(&self.graph, nodes)
            .map_err(|(node, parent)| InvalidCommit::UnknownParent { node, parent })?;

        let (branch, old_tip) = self.resolve_branch(&overlay, branch, &tip);
        let name = branch.to_string();

        let request = UpdateRequest {
            actor,
            branch,
            old_tip,
            new_tip: tip,
            new_nodes: overlay.new_nodes().map(|n| *n.get_identifier()).collect(),
        };

        let sequence = self.branches.can_update(&overlay, &request, &base)?;

        let mut state = self.state.lock();

        let current = state.chain.main_tip();
        if current != base.block {
            return Err(RefConflict {
                name: BranchName::Main.to_string(),
                expected: Some(base.block),
                found: Some(current),
            }
            .into());
        }

        let known_kinds: Vec<(NodeId, CommitKind)> = match &sequence {
            Some(sequence) => sequence.kinds.clone(),
            None => overlay
                .new_nodes()
                .filter_map(|n| n.claimed_kind().map(|kind| (*n.get_identifier(), kind)))
                .collect(),
        };

        let mut events = vec![];
        for node in overlay.new_nodes() {
            let id = *node.get_identifier();
            let kind = known_kinds
                .iter()
                .find(|(known, _)| *known == id)
                .map(|(_, kind)| *kind)
                .or_else(|| node.claimed_kind())
                .unwrap_or(CommitKind::Transaction);
            events.extend(self.store(node.as_ref().clone(), kind)?);
        }

        self.graph.update_ref(&name, old_tip, Some(tip))?;
        state.chain.track(branch, tip);
        drop(state);

        log::debug!("Moved `{name}` from {old_tip:?} to {tip:?}");

        events.push(Event::RefUpdated {
            name: name.clone(),
            old: old_tip,
            new: tip,
        });
        for event in events {
            self.emit(event);
        }

        Ok(Accepted { name, tip })
    }

    /// Picks the ref an update is written to
    ///
    /// A peer's `a-<n>`/`b-<n>` that would collide with an unrelated branch
    /// gets the next free number instead.
    fn resolve_branch<L: NodeLookup + ?Sized>(
        &self,
        lookup: &L,
        branch: BranchName,
        tip: &NodeId,
    ) -> (BranchName, Option<NodeId>) {
        let old = self.graph.locate_ref(&branch.to_string());

        let Some(requested) = branch.number() else {
            return (branch, old);
        };

        match old {
            Some(old) if !lookup.descends_from(tip, &old) => {
                let taken = self.graph.list_refs(branch.prefix());
                let num = allocate_number(branch.prefix(), &taken, requested);
                let renamed = branch.with_number(num);
                log::debug!("`{branch}` is taken, using `{renamed}`");
                (renamed, None)
            }
            old => (branch, old),
        }
    }

    /// Appends an agenda proof to the branch carrying `agenda`
    ///
    /// Invoked when external consensus reports the agenda as approved.
    #[tracing::instrument(skip(self, signatures))]
    pub fn on_agenda_approved(
        &self,
        agenda: NodeId,
        signatures: Vec<TypedSignature>,
    ) -> Result<Accepted, Error> {
        let (branch, height) = {
            let state = self.state.lock();
            let branch = state
                .chain
                .pending_branches()
                .into_iter()
                .find(|(name, tip)| matches!(name, BranchName::Agenda(_)) && *tip == agenda)
                .map(|(name, _)| name)
                .unwrap_or(BranchName::Agenda(1));
            (branch, state.chain.height() + 1)
        };

        let proof = Node::child_of(
            agenda,
            Payload::agenda_proof(&AgendaProofBody {
                height,
                agenda,
                signatures,
            }),
            None,
        );

        let result = self.update_branch(Actor::Peer, branch, Push::Chain(vec![proof]));
        self.report(&branch.to_string(), result)
    }

    /// Builds the agenda proof from the votes recorded for `agenda`
    pub fn approve_agenda(&self, agenda: NodeId) -> Result<Accepted, Error> {
        let signatures = self
            .state
            .lock()
            .tags
            .votes_for(&agenda)
            .into_iter()
            .map(TagRecord::as_typed_signature)
            .collect();

        self.on_agenda_approved(agenda, signatures)
    }

    pub fn register_vote(
        &self,
        agenda: NodeId,
        voter: PublicKey,
        signature: Signature,
        requested: Option<u64>,
    ) -> Result<TagOutcome, Error> {
        let mut state = self.state.lock();
        let validator_set = state.chain.reserved_state().governance_set();
        let request = TagRequest {
            target: agenda,
            voter,
            signature,
            finalized: state.chain.main_tip(),
            validator_set: &validator_set,
            requested,
        };

        let verifier = self.branches.get_validator().get_verifier();
        let outcome = state.tags.register_vote(&self.graph, verifier, request)?;
        drop(state);

        self.tag_created(&outcome, agenda, voter);
        Ok(outcome)
    }

    pub fn register_veto(
        &self,
        block: NodeId,
        voter: PublicKey,
        signature: Signature,
        requested: Option<u64>,
    ) -> Result<TagOutcome, Error> {
        let mut state = self.state.lock();
        let validator_set = state.chain.reserved_state().consensus_set();
        let request = TagRequest {
            target: block,
            voter,
            signature,
            finalized: state.chain.main_tip(),
            validator_set: &validator_set,
            requested,
        };

        let verifier = self.branches.get_validator().get_verifier();
        let outcome = state.tags.register_veto(&self.graph, verifier, request)?;
        drop(state);

        self.tag_created(&outcome, block, voter);
        Ok(outcome)
    }

    fn tag_created(&self, outcome: &TagOutcome, target: NodeId, voter: PublicKey) {
        if let TagOutcome::Created(name) = outcome {
            self.emit(Event::TagCreated {
                name: name.to_string(),
                target,
                voter,
            });
        }
    }

    /// Finalizes `block` after external consensus declared it final
    #[tracing::instrument(skip(self))]
    pub fn on_finality_signal(&self, block: NodeId) -> Result<Finalization, Error> {
        let result = {
            let mut state = self.state.lock();
            let old = state.chain.main_tip();
            state
                .chain
                .finalize(&self.graph, &self.branches, &block)
                .map(|finalization| (old, finalization))
        };

        match result {
            Ok((old, finalization)) => {
                self.emit(Event::RefUpdated {
                    name: BranchName::Main.to_string(),
                    old: Some(old),
                    new: block,
                });
                for (name, tip) in finalization.pruned.iter() {
                    self.emit(Event::RefDeleted {
                        name: name.to_string(),
                        old: *tip,
                    });
                }
                self.emit(Event::Finalized {
                    height: finalization.height,
                    block,
                });
                Ok(finalization)
            }
            Err(err) => {
                log::warn!("Rejected finality signal for {block:?}: {err}");
                Err(err)
            }
        }
    }

    pub fn current_height(&self) -> u64 {
        self.state.lock().chain.height()
    }

    pub fn current_main_tip(&self) -> NodeId {
        self.state.lock().chain.main_tip()
    }

    /// Reserved state as of the finalized tip
    pub fn reserved_state(&self) -> ReservedState {
        self.state.lock().chain.reserved_state().clone()
    }

    pub fn pending_branches(&self) -> Vec<(BranchName, NodeId)> {
        self.state.lock().chain.pending_branches()
    }

    pub fn kind_of(&self, id: &NodeId) -> Option<CommitKind> {
        self.kinds.get(id).map(|entry| *entry)
    }

    pub fn votes_for(&self, agenda: &NodeId) -> Vec<TagRecord> {
        self.state
            .lock()
            .tags
            .votes_for(agenda)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn vetoes_for(&self, block: &NodeId) -> Vec<TagRecord> {
        self.state
            .lock()
            .tags
            .vetoes_for(block)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Do the recorded vetoes on `block` exceed the consensus threshold?
    pub fn is_vetoed(&self, block: &NodeId) -> bool {
        let state = self.state.lock();
        let vetoes = state.tags.vetoes_for(block);
        self.branches.get_validator().get_verifier().is_vetoed(
            vetoes.iter().map(|record| &record.voter),
            &state.chain.reserved_state().consensus_set(),
        )
    }

    pub fn get_graph(&self) -> &G {
        &self.graph
    }

    /// Gives back the underlying graph, e.g. to reopen it later
    pub fn into_graph(self) -> G {
        self.graph
    }

    pub fn get_config(&self) -> &LedgerConfig {
        &self.config
    }
}
