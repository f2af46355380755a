use std::collections::BTreeMap;

use derivative::Derivative;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::{hash, NodeId, PrivateKey, PublicKey, TypedSignature};
use crate::proof::Misbehavior;
use crate::reserved::{MemberName, ReservedState};

/// Paths below this prefix belong to the reserved state
pub const RESERVED_PREFIX: &str = "reserved/";

/// Commit titles starting with this are reserved for non-transaction commits
pub const HEADER_MARKER: char = '>';

/// The closed set of commit kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub enum CommitKind {
    #[display("initial")]
    Initial,
    #[display("genesis")]
    Genesis,
    #[display("block")]
    Block,
    #[display("tx")]
    Transaction,
    #[display("tx-delegate")]
    Delegate,
    #[display("tx-undelegate")]
    Undelegate,
    #[display("tx-report")]
    Report,
    #[display("chat")]
    Chat,
    #[display("agenda")]
    Agenda,
    #[display("agenda-proof")]
    AgendaProof,
}

impl CommitKind {
    const HEADERS: [(CommitKind, &'static str); 9] = [
        (CommitKind::Initial, ">initial"),
        (CommitKind::Genesis, ">genesis"),
        (CommitKind::Block, ">block"),
        (CommitKind::Delegate, ">tx-delegate"),
        (CommitKind::Undelegate, ">tx-undelegate"),
        (CommitKind::Report, ">tx-report"),
        (CommitKind::Chat, ">chat"),
        (CommitKind::Agenda, ">agenda"),
        (CommitKind::AgendaProof, ">agenda-proof"),
    ];

    /// The title header for this kind (ordinary transactions have none)
    pub fn header(&self) -> Option<&'static str> {
        Self::HEADERS
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, header)| *header)
    }

    /// The kind a title claims; validation decides whether the claim holds
    ///
    /// Returns None for titles that use the reserved marker without naming a kind.
    pub fn claimed_by(title: &str) -> Option<CommitKind> {
        if !title.starts_with(HEADER_MARKER) {
            return Some(CommitKind::Transaction);
        }

        Self::HEADERS
            .iter()
            .find(|(_, header)| *header == title)
            .map(|(kind, _)| *kind)
    }

    /// Transactions that may only appear between an agenda proof and the chat
    pub fn is_extra_agenda_transaction(&self) -> bool {
        matches!(self, Self::Delegate | Self::Undelegate | Self::Report)
    }

    pub fn is_transaction(&self) -> bool {
        *self == Self::Transaction || self.is_extra_agenda_transaction()
    }
}

/// The state change a commit makes
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diff {
    /// New content per path; None deletes the path
    pub ordinary: BTreeMap<String, Option<String>>,
    /// The full reserved state after this commit, if it changed
    pub reserved: Option<ReservedState>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.ordinary.is_empty() && self.reserved.is_none()
    }

    pub fn touches_reserved(&self) -> bool {
        self.reserved.is_some()
            || self
                .ordinary
                .keys()
                .any(|path| path.starts_with(RESERVED_PREFIX))
    }

    pub fn reserved_only(state: ReservedState) -> Self {
        Self {
            ordinary: Default::default(),
            reserved: Some(state),
        }
    }
}

/// Everything a node carries apart from its linkage
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payload {
    pub title: String,
    /// Free text for transactions and chats, RON for all other kinds
    pub body: String,
    pub diff: Diff,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> String {
    ron::to_string(value).expect("commit bodies only contain plain data")
}

impl Payload {
    fn with_header<T: Serialize>(kind: CommitKind, body: &T, diff: Diff) -> Self {
        Self {
            title: kind.header().unwrap_or_default().to_string(),
            body: encode(body),
            diff,
        }
    }

    pub fn initial() -> Self {
        Self {
            title: CommitKind::Initial.header().unwrap_or_default().to_string(),
            body: String::new(),
            diff: Diff::default(),
        }
    }

    pub fn genesis(info: &GenesisInfo, state: ReservedState) -> Self {
        Self::with_header(CommitKind::Genesis, info, Diff::reserved_only(state))
    }

    pub fn block(header: &BlockHeader) -> Self {
        Self::with_header(CommitKind::Block, header, Diff::default())
    }

    pub fn transaction(title: impl Into<String>, body: impl Into<String>, diff: Diff) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            diff,
        }
    }

    pub fn chat(message: impl Into<String>) -> Self {
        Self {
            title: CommitKind::Chat.header().unwrap_or_default().to_string(),
            body: message.into(),
            diff: Diff::default(),
        }
    }

    pub fn agenda(body: &AgendaBody) -> Self {
        Self::with_header(CommitKind::Agenda, body, Diff::default())
    }

    pub fn agenda_proof(body: &AgendaProofBody) -> Self {
        Self::with_header(CommitKind::AgendaProof, body, Diff::default())
    }

    pub fn delegate(tx: &DelegationTx, state: ReservedState) -> Self {
        Self::with_header(CommitKind::Delegate, tx, Diff::reserved_only(state))
    }

    pub fn undelegate(tx: &UndelegationTx, state: ReservedState) -> Self {
        Self::with_header(CommitKind::Undelegate, tx, Diff::reserved_only(state))
    }

    pub fn report(tx: &ReportTx, state: ReservedState) -> Self {
        Self::with_header(CommitKind::Report, tx, Diff::reserved_only(state))
    }

    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, String> {
        ron::from_str(&self.body).map_err(|err| format!("cannot decode body: {err}"))
    }
}

/// An immutable, content-addressed element of the commit graph
#[derive(Derivative, Clone)]
#[derivative(Debug, PartialEq, Eq)]
pub struct Node {
    identifier: NodeId,
    #[derivative(PartialEq = "ignore")]
    parents: Vec<NodeId>,
    #[derivative(Debug = "ignore", PartialEq = "ignore")]
    payload: Payload,
    #[derivative(PartialEq = "ignore")]
    author: Option<PublicKey>,
}

#[derive(Serialize)]
struct NodeContent<'a> {
    parents: &'a [NodeId],
    payload: &'a Payload,
    author: &'a Option<PublicKey>,
}

impl Node {
    pub fn new(parents: Vec<NodeId>, payload: Payload, author: Option<PublicKey>) -> Self {
        let identifier = Self::compute_identifier(&parents, &payload, &author);

        Self {
            identifier,
            parents,
            payload,
            author,
        }
    }

    /// Shorthand for the common single-parent case
    pub fn child_of(parent: NodeId, payload: Payload, author: Option<PublicKey>) -> Self {
        Self::new(vec![parent], payload, author)
    }

    fn compute_identifier(
        parents: &[NodeId],
        payload: &Payload,
        author: &Option<PublicKey>,
    ) -> NodeId {
        let content = NodeContent {
            parents,
            payload,
            author,
        };
        hash(encode(&content).as_bytes())
    }

    pub fn get_identifier(&self) -> &NodeId {
        &self.identifier
    }

    pub fn get_parent_ids(&self) -> &[NodeId] {
        &self.parents
    }

    /// The only parent, if there is exactly one
    pub fn get_parent_id(&self) -> Option<&NodeId> {
        match self.parents.as_slice() {
            [parent] => Some(parent),
            _ => None,
        }
    }

    pub fn get_payload(&self) -> &Payload {
        &self.payload
    }

    pub fn get_author(&self) -> Option<&PublicKey> {
        self.author.as_ref()
    }

    pub fn get_title(&self) -> &str {
        &self.payload.title
    }

    /// The kind this node's title claims
    pub fn claimed_kind(&self) -> Option<CommitKind> {
        CommitKind::claimed_by(&self.payload.title)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenesisInfo {
    pub chain_name: String,
    pub timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub author: PublicKey,
    /// None only for the block directly after genesis
    pub previous_block: Option<NodeId>,
    pub timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgendaBody {
    pub height: u64,
    pub author: PublicKey,
    pub timestamp: i64,
    /// The ordinary transactions this agenda covers, in order
    pub transactions: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgendaProofBody {
    pub height: u64,
    pub agenda: NodeId,
    pub signatures: Vec<TypedSignature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegationTx {
    pub delegator: MemberName,
    pub delegatee: MemberName,
    /// Also hand over governance voting power?
    pub governance: bool,
    /// The finalized height the delegator signed for
    pub block_height: u64,
    pub proof: TypedSignature,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UndelegationTx {
    pub delegator: MemberName,
    pub block_height: u64,
    pub proof: TypedSignature,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportTx {
    pub evidence: Misbehavior,
}

impl DelegationTx {
    pub fn signing_bytes(
        delegator: &str,
        delegatee: &str,
        governance: bool,
        block_height: u64,
    ) -> Vec<u8> {
        encode(&("delegate", delegator, delegatee, governance, block_height)).into_bytes()
    }

    pub fn new(
        delegator: impl Into<MemberName>,
        delegatee: impl Into<MemberName>,
        governance: bool,
        block_height: u64,
        key: &PrivateKey,
    ) -> Self {
        let delegator = delegator.into();
        let delegatee = delegatee.into();
        let message = Self::signing_bytes(&delegator, &delegatee, governance, block_height);

        Self {
            proof: TypedSignature::sign(&message, key),
            delegator,
            delegatee,
            governance,
            block_height,
        }
    }

    pub fn verify_proof(&self) -> bool {
        let message = Self::signing_bytes(
            &self.delegator,
            &self.delegatee,
            self.governance,
            self.block_height,
        );
        self.proof.verify(&message)
    }
}

impl UndelegationTx {
    pub fn signing_bytes(delegator: &str, block_height: u64) -> Vec<u8> {
        encode(&("undelegate", delegator, block_height)).into_bytes()
    }

    pub fn new(delegator: impl Into<MemberName>, block_height: u64, key: &PrivateKey) -> Self {
        let delegator = delegator.into();
        let message = Self::signing_bytes(&delegator, block_height);

        Self {
            proof: TypedSignature::sign(&message, key),
            delegator,
            block_height,
        }
    }

    pub fn verify_proof(&self) -> bool {
        self.proof
            .verify(&Self::signing_bytes(&self.delegator, self.block_height))
    }
}
