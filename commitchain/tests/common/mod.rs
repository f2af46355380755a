#![allow(dead_code)]

use commitchain::{
    AgendaBody, BlockHeader, Diff, Ledger, LedgerConfig, MemoryGraph, Member, Node, NodeId,
    Payload, PrivateKey, ProofVerifier, PublicKey, ReservedState, Signature,
};

pub struct Harness {
    pub ledger: Ledger,
    pub keys: Vec<PrivateKey>,
}

pub fn make_keys(num: usize) -> Vec<PrivateKey> {
    (0..num)
        .map(|_| PrivateKey::from_seed(rand::random()))
        .collect()
}

pub fn make_state(keys: &[PrivateKey]) -> ReservedState {
    ReservedState::new(
        keys.iter()
            .enumerate()
            .map(|(idx, key)| Member::new(format!("m{idx}"), key.public_key(), 1, 1))
            .collect(),
    )
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        let keys = make_keys(4);
        let state = make_state(&keys);
        let ledger = Ledger::genesis(MemoryGraph::new(), config, 0, state, keys[0].public_key())
            .expect("genesis is valid");

        Self { ledger, keys }
    }

    pub fn public_key(&self, idx: usize) -> PublicKey {
        self.keys[idx].public_key()
    }

    /// Signature of member `idx` over a tag on `target`
    pub fn tag_signature(&self, idx: usize, target: &NodeId) -> Signature {
        let key = &self.keys[idx];
        key.sign(&ProofVerifier::tag_message(target, &key.public_key()))
    }

    /// Ordinary transactions, the agenda covering them and nothing else
    pub fn agenda_chain(&self, base: NodeId, num_txs: usize, salt: &str) -> Vec<Node> {
        let height = self.ledger.current_height() + 1;
        let mut nodes = vec![];
        let mut parent = base;

        for idx in 0..num_txs {
            let mut diff = Diff::default();
            diff.ordinary.insert(
                format!("accounts/{salt}-{idx}"),
                Some(format!("balance {idx}")),
            );
            let tx = Node::child_of(
                parent,
                Payload::transaction(format!("transfer {salt} {idx}"), "", diff),
                Some(self.public_key(1)),
            );
            parent = *tx.get_identifier();
            nodes.push(tx);
        }

        let transactions = nodes.iter().map(|n| *n.get_identifier()).collect();
        let agenda = Node::child_of(
            parent,
            Payload::agenda(&AgendaBody {
                height,
                author: self.public_key(0),
                timestamp: 10,
                transactions,
            }),
            Some(self.public_key(0)),
        );
        nodes.push(agenda);

        nodes
    }

    /// Pushes an agenda to `a-1`, votes with the first `voters` members and
    /// appends the proof; returns the proof node id
    pub fn approved_agenda(&self, num_txs: usize, voters: usize) -> (NodeId, NodeId) {
        let chain = self.agenda_chain(self.ledger.current_main_tip(), num_txs, "x");
        let agenda = *chain.last().unwrap().get_identifier();

        self.ledger
            .on_push("a-1", commitchain::Push::Chain(chain))
            .expect("agenda chain is valid");

        for idx in 0..voters {
            self.ledger
                .register_vote(agenda, self.public_key(idx), self.tag_signature(idx, &agenda), None)
                .expect("vote is valid");
        }

        let accepted = self
            .ledger
            .approve_agenda(agenda)
            .expect("agenda has a quorum");
        (agenda, accepted.tip)
    }

    pub fn chat(&self, parent: NodeId, message: &str) -> Node {
        Node::child_of(parent, Payload::chat(message), Some(self.public_key(2)))
    }

    pub fn block(&self, parent: NodeId, author: usize) -> Node {
        let header = BlockHeader {
            height: self.ledger.current_height() + 1,
            author: self.public_key(author),
            previous_block: Some(self.ledger.current_main_tip()),
            timestamp: 20,
        };
        Node::child_of(parent, Payload::block(&header), Some(self.public_key(author)))
    }
}
