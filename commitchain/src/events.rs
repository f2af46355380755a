use crate::commit::CommitKind;
use crate::crypto::{NodeId, PublicKey};

/// Notifications about changes to the ledger
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Event {
    NodeCreated {
        identifier: NodeId,
        kind: CommitKind,
    },
    RefUpdated {
        name: String,
        old: Option<NodeId>,
        new: NodeId,
    },
    RefDeleted {
        name: String,
        old: NodeId,
    },
    TagCreated {
        name: String,
        target: NodeId,
        voter: PublicKey,
    },
    Finalized {
        height: u64,
        block: NodeId,
    },
    PushRejected {
        name: String,
        reason: String,
    },
}

pub type EventCallback = Box<dyn Fn(Event) + Send + Sync>;
