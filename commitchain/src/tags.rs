use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::commit::{encode, CommitKind};
use crate::crypto::{NodeId, PublicKey, Signature, TypedSignature};
use crate::error::{BranchRejected, Error, ProofFailed, StorageError};
use crate::graph::CommitGraph;
use crate::proof::ProofVerifier;
use crate::refs::{allocate_number, TagName};
use crate::reserved::ValidatorSet;

/// A recorded vote or veto
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagRecord {
    pub name: TagName,
    pub target: NodeId,
    pub voter: PublicKey,
    pub signature: Signature,
}

impl TagRecord {
    /// The record as an entry of an approval proof
    pub fn as_typed_signature(&self) -> TypedSignature {
        TypedSignature {
            signer: self.voter,
            signature: self.signature.clone(),
        }
    }
}

/// What a tag ref carries besides its target
#[derive(Serialize, Deserialize)]
struct TagAnnotation {
    voter: PublicKey,
    signature: Signature,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagOutcome {
    Created(TagName),
    /// The voter had already tagged this node; nothing changed
    AlreadyRecorded(TagName),
}

impl TagOutcome {
    pub fn name(&self) -> TagName {
        match self {
            Self::Created(name) | Self::AlreadyRecorded(name) => *name,
        }
    }
}

/// A vote or veto as submitted
pub struct TagRequest<'a> {
    pub target: NodeId,
    pub voter: PublicKey,
    pub signature: Signature,
    /// The target must extend this node, usually the tip of `main`
    pub finalized: NodeId,
    /// The validator set the voter must belong to
    pub validator_set: &'a ValidatorSet,
    /// Preferred tag number; the next free one is used if it is taken
    pub requested: Option<u64>,
}

/// Keeps vote and veto tags; tags are never moved or removed
#[derive(Default)]
pub struct TagManager {
    records: BTreeMap<TagName, TagRecord>,
    by_voter: HashMap<(NodeId, PublicKey), TagName>,
}

impl TagManager {
    pub fn new() -> Self {
        Default::default()
    }

    /// Rebuilds the records from the annotated tags stored in `graph`
    pub fn recover<G: CommitGraph + ?Sized>(graph: &G) -> Result<Self, StorageError> {
        let mut tags = Self::new();

        for name in graph.list_refs("") {
            let Ok(tag) = name.parse::<TagName>() else {
                continue;
            };
            let Some(target) = graph.locate_ref(&name) else {
                continue;
            };
            let Some(message) = graph.get_tag_message(&name) else {
                log::warn!("Tag `{name}` does not name its voter; ignoring it");
                continue;
            };

            let annotation: TagAnnotation =
                ron::from_str(&message).map_err(|err| StorageError::InvalidRepository {
                    reason: format!("tag `{name}` is malformed: {err}"),
                })?;

            tags.insert(TagRecord {
                name: tag,
                target,
                voter: annotation.voter,
                signature: annotation.signature,
            });
        }

        log::debug!("Recovered {} tags", tags.num_records());
        Ok(tags)
    }

    fn insert(&mut self, record: TagRecord) {
        self.by_voter
            .insert((record.target, record.voter), record.name);
        self.records.insert(record.name, record);
    }

    pub fn register_vote<G: CommitGraph + ?Sized>(
        &mut self,
        graph: &G,
        verifier: &ProofVerifier,
        request: TagRequest<'_>,
    ) -> Result<TagOutcome, Error> {
        let name = TagName::Vote(request.requested.unwrap_or(1));
        self.register(graph, verifier, name, CommitKind::Agenda, request)
    }

    pub fn register_veto<G: CommitGraph + ?Sized>(
        &mut self,
        graph: &G,
        verifier: &ProofVerifier,
        request: TagRequest<'_>,
    ) -> Result<TagOutcome, Error> {
        let name = TagName::Veto(request.requested.unwrap_or(1));
        self.register(graph, verifier, name, CommitKind::Block, request)
    }

    fn register<G: CommitGraph + ?Sized>(
        &mut self,
        graph: &G,
        verifier: &ProofVerifier,
        name: TagName,
        expected: CommitKind,
        request: TagRequest<'_>,
    ) -> Result<TagOutcome, Error> {
        let target = request.target;

        let node = graph
            .get_node(&target)
            .ok_or(BranchRejected::UnknownNode { node: target })?;

        let found = node.claimed_kind();
        if found != Some(expected) {
            return Err(BranchRejected::WrongTargetKind {
                tag: name.prefix().trim_end_matches('-').to_string(),
                node: target,
                expected,
                found: found.unwrap_or(CommitKind::Transaction),
            }
            .into());
        }

        // Tags on nodes of an already finalized height are meaningless
        if !graph.is_ancestor(&request.finalized, &target) {
            return Err(BranchRejected::NotDescendant {
                node: target,
                finalized: request.finalized,
            }
            .into());
        }

        if !request.validator_set.contains(&request.voter) {
            return Err(BranchRejected::NotAMember {
                voter: request.voter,
            }
            .into());
        }

        let message = ProofVerifier::tag_message(&target, &request.voter);
        if !verifier.verify_signature(&request.voter, &message, &request.signature) {
            return Err(ProofFailed::InvalidSignature {
                node: target,
                signer: request.voter,
            }
            .into());
        }

        if let Some(existing) = self.by_voter.get(&(target, request.voter)) {
            log::trace!("{} already tagged {target:?} as `{existing}`", request.voter);
            return Ok(TagOutcome::AlreadyRecorded(*existing));
        }

        let taken = graph.list_refs(name.prefix());
        let name = name.with_number(allocate_number(name.prefix(), &taken, name.number()));

        let annotation = TagAnnotation {
            voter: request.voter,
            signature: request.signature.clone(),
        };
        graph.create_tag(&name.to_string(), target, encode(&annotation))?;

        log::debug!("Created tag `{name}` on {target:?} for {}", request.voter);

        self.insert(TagRecord {
            name,
            target,
            voter: request.voter,
            signature: request.signature,
        });

        Ok(TagOutcome::Created(name))
    }

    pub fn get_record(&self, name: &TagName) -> Option<&TagRecord> {
        self.records.get(name)
    }

    fn records_for(&self, target: &NodeId, veto: bool) -> impl Iterator<Item = &TagRecord> {
        let target = *target;
        self.records.values().filter(move |record| {
            record.target == target && matches!(record.name, TagName::Veto(_)) == veto
        })
    }

    pub fn votes_for(&self, agenda: &NodeId) -> Vec<&TagRecord> {
        self.records_for(agenda, false).collect()
    }

    pub fn vetoes_for(&self, block: &NodeId) -> Vec<&TagRecord> {
        self.records_for(block, true).collect()
    }

    pub fn num_records(&self) -> usize {
        self.records.len()
    }
}
