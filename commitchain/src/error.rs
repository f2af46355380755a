use crate::commit::CommitKind;
use crate::crypto::{NodeId, PublicKey};
use crate::proof::Ratio;

/// A cryptographic attachment did not check out
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum ProofFailed {
    #[display("invalid signature by {signer} on node {node}")]
    InvalidSignature { node: NodeId, signer: PublicKey },
    #[display("approval of {node} holds {approved} of {total} voting power, needs more than {threshold}")]
    InsufficientQuorum {
        node: NodeId,
        approved: u64,
        total: u64,
        threshold: Ratio,
    },
    #[display("misbehavior evidence in {node} does not verify")]
    InvalidEvidence { node: NodeId },
    #[display("misbehavior evidence in {node} names {offender}, who is not a member")]
    UnknownOffender { node: NodeId, offender: PublicKey },
}

/// A node is structurally defective or its content breaks the commit rules
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum InvalidCommit {
    #[display("{kind} node {node} has {found} parents, expected {expected}")]
    WrongParentCount {
        node: NodeId,
        kind: CommitKind,
        expected: usize,
        found: usize,
    },
    #[display("{kind} node {node} cannot follow {parent_kind} node {parent}")]
    WrongParentKind {
        node: NodeId,
        kind: CommitKind,
        parent: NodeId,
        parent_kind: CommitKind,
    },
    #[display("node {node} alters the reserved state in a way a {kind} commit may not")]
    ReservedStateViolation { node: NodeId, kind: CommitKind },
    #[display("{_0}")]
    ProofFailed(ProofFailed),
    #[display("malformed payload in node {node}: {reason}")]
    MalformedPayload { node: NodeId, reason: String },
    #[display("parent {parent} of node {node} is unknown")]
    UnknownParent { node: NodeId, parent: NodeId },
    #[display("{kind} node {node} is out of sequence: {reason}")]
    OutOfSequence {
        node: NodeId,
        kind: CommitKind,
        reason: String,
    },
}

impl InvalidCommit {
    pub fn malformed(node: NodeId, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            node,
            reason: reason.into(),
        }
    }

    /// The node that caused the rejection
    pub fn get_node(&self) -> NodeId {
        match self {
            Self::WrongParentCount { node, .. }
            | Self::WrongParentKind { node, .. }
            | Self::ReservedStateViolation { node, .. }
            | Self::MalformedPayload { node, .. }
            | Self::UnknownParent { node, .. }
            | Self::OutOfSequence { node, .. } => *node,
            Self::ProofFailed(err) => err.get_node(),
        }
    }
}

impl ProofFailed {
    pub fn get_node(&self) -> NodeId {
        match self {
            Self::InvalidSignature { node, .. }
            | Self::InsufficientQuorum { node, .. }
            | Self::InvalidEvidence { node }
            | Self::UnknownOffender { node, .. } => *node,
        }
    }
}

/// A ref update was refused by policy
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum BranchRejected {
    #[display("`{name}` is not a known branch or tag name")]
    UnknownNamespace { name: String },
    #[display("{actor} may not update `{name}`")]
    PermissionDenied { name: String, actor: String },
    #[display("node {node} does not descend from the finalized tip {finalized}")]
    NotDescendant { node: NodeId, finalized: NodeId },
    #[display("`{name}` cannot move from {old} to {new}, which does not extend it")]
    NonFastForward { name: String, old: NodeId, new: NodeId },
    #[display("`{name}` cannot point at {node}: {reason}")]
    IllegalSequence {
        name: String,
        node: NodeId,
        reason: String,
    },
    #[display("block {block} is at height {height}, which is already finalized")]
    SupersededHeight { block: NodeId, height: u64 },
    #[display("node {node} is unknown")]
    UnknownNode { node: NodeId },
    #[display("no pending branch carries block {block}")]
    UnknownBlock { block: NodeId },
    #[display("`{tag}` must point at a {expected} node, but {node} is a {found} node")]
    WrongTargetKind {
        tag: String,
        node: NodeId,
        expected: CommitKind,
        found: CommitKind,
    },
    #[display("{voter} is not a member of the validator set")]
    NotAMember { voter: PublicKey },
    #[display("push to `{name}` carries nothing to apply")]
    EmptyPush { name: String },
}

/// Another writer changed the ref first
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[display("ref `{name}` was expected at {expected:?} but is at {found:?}")]
pub struct RefConflict {
    pub name: String,
    pub expected: Option<NodeId>,
    pub found: Option<NodeId>,
}

/// Failure of the underlying graph storage
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum StorageError {
    #[display("cannot store node {node}: parent {parent} does not exist")]
    MissingParent { node: NodeId, parent: NodeId },
    #[display("the repository is invalid: {reason}")]
    InvalidRepository { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display, derive_more::Error, derive_more::From)]
pub enum Error {
    #[display("invalid commit: {_0}")]
    InvalidCommit(InvalidCommit),
    #[display("branch rejected: {_0}")]
    BranchRejected(BranchRejected),
    #[display("proof failed: {_0}")]
    ProofFailed(ProofFailed),
    #[display("ref conflict: {_0}")]
    RefConflict(RefConflict),
    #[display("storage error: {_0}")]
    Storage(StorageError),
}

impl Error {
    /// Is this an expected outcome of a lost race rather than a defect of the request?
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::RefConflict(_))
    }
}
