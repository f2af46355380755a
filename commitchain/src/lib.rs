//! A blockchain ledger core that keeps all consensus data in a content-addressed commit graph
//!
//! Nodes are immutable. Branches and tags are the only mutable state, and
//! the [`Ledger`] decides which moves of them are admissible.

pub mod branch;
pub mod chain;
pub mod commit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod graph;
pub mod ledger;
pub mod proof;
pub mod refs;
pub mod reserved;
pub mod tags;
pub mod validator;

pub use branch::{Actor, BranchManager, UpdateRequest};
pub use chain::{ChainState, ChainStateMachine, Finalization};
pub use commit::{
    AgendaBody, AgendaProofBody, BlockHeader, CommitKind, DelegationTx, Diff, GenesisInfo, Node,
    Payload, ReportTx, UndelegationTx,
};
pub use config::LedgerConfig;
pub use crypto::{hash, Hash256, NodeId, PrivateKey, PublicKey, Signature, TypedSignature};
pub use error::{BranchRejected, Error, InvalidCommit, ProofFailed, RefConflict, StorageError};
pub use events::{Event, EventCallback};
pub use graph::{CommitGraph, MemoryGraph, NodeLookup, Overlay};
pub use ledger::{Accepted, Ledger, Push};
pub use proof::{
    ConsensusProposal, ConsensusVote, Misbehavior, ProofVerifier, Ratio, SlashingEffect,
};
pub use refs::{BranchName, RefName, TagName};
pub use reserved::{Member, MemberName, ReservedState, ValidatorSet, VotingPower};
pub use tags::{TagManager, TagOutcome, TagRecord, TagRequest};
pub use validator::{
    validate_sequence, CommitValidator, FinalizedTip, HeightSequence, Phase, ValidationContext,
    Validated,
};
