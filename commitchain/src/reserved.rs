use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::proof::Ratio;

pub type MemberName = String;
pub type VotingPower = u64;

/// A participant of the chain
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub name: MemberName,
    pub public_key: PublicKey,
    pub governance_voting_power: VotingPower,
    pub consensus_voting_power: VotingPower,
    /// The member that votes on governance agendas for this one
    pub governance_delegatee: Option<MemberName>,
    /// The member that participates in consensus for this one
    pub consensus_delegatee: Option<MemberName>,
    /// Set once the member was slashed for misbehaving
    pub expelled: bool,
}

impl Member {
    pub fn new(
        name: impl Into<MemberName>,
        public_key: PublicKey,
        governance_voting_power: VotingPower,
        consensus_voting_power: VotingPower,
    ) -> Self {
        Self {
            name: name.into(),
            public_key,
            governance_voting_power,
            consensus_voting_power,
            governance_delegatee: None,
            consensus_delegatee: None,
            expelled: false,
        }
    }
}

/// The part of the chain state that only governance-level commits may change
///
/// Ordinary transactions are never allowed to touch it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservedState {
    pub version: u32,
    pub members: Vec<Member>,
}

/// Voting power per key, after delegation has been resolved
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidatorSet {
    powers: BTreeMap<PublicKey, VotingPower>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Domain {
    Governance,
    Consensus,
}

impl ValidatorSet {
    pub fn total_power(&self) -> VotingPower {
        self.powers
            .values()
            .fold(0, |total, power| total.saturating_add(*power))
    }

    pub fn power_of(&self, key: &PublicKey) -> VotingPower {
        self.powers.get(key).copied().unwrap_or(0)
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.power_of(key) > 0
    }

    pub fn len(&self) -> usize {
        self.powers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.powers.is_empty()
    }

    /// Combined power of the given (distinct) voters
    pub fn power_of_all<'a>(&self, voters: impl IntoIterator<Item = &'a PublicKey>) -> VotingPower {
        let unique: BTreeSet<&PublicKey> = voters.into_iter().collect();
        unique
            .into_iter()
            .fold(0, |total, key| total.saturating_add(self.power_of(key)))
    }

    /// Do the voters together hold more than `threshold` of the total power?
    pub fn reaches<'a>(
        &self,
        voters: impl IntoIterator<Item = &'a PublicKey>,
        threshold: Ratio,
    ) -> bool {
        threshold.is_exceeded_by(self.power_of_all(voters), self.total_power())
    }
}

impl ReservedState {
    pub fn new(members: Vec<Member>) -> Self {
        Self {
            version: 1,
            members,
        }
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn member_by_key(&self, key: &PublicKey) -> Option<&Member> {
        self.members.iter().find(|m| &m.public_key == key)
    }

    fn member_mut(&mut self, name: &str) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.name == name)
    }

    /// Checks that the state is well-formed
    pub fn check_consistency(&self) -> Result<(), String> {
        if self.members.is_empty() {
            return Err("reserved state has no members".to_string());
        }

        let mut names = HashSet::new();
        let mut keys = HashSet::new();

        for member in self.members.iter() {
            if member.name.is_empty() {
                return Err("member with empty name".to_string());
            }
            if !names.insert(member.name.as_str()) {
                return Err(format!("duplicate member name `{}`", member.name));
            }
            if !keys.insert(member.public_key) {
                return Err(format!("duplicate public key for `{}`", member.name));
            }
        }

        for member in self.members.iter() {
            for delegatee in [&member.governance_delegatee, &member.consensus_delegatee]
                .into_iter()
                .flatten()
            {
                let Some(target) = self.member(delegatee) else {
                    return Err(format!(
                        "`{}` delegates to unknown member `{delegatee}`",
                        member.name
                    ));
                };

                if target.name == member.name {
                    return Err(format!("`{}` delegates to itself", member.name));
                }
                if target.expelled {
                    return Err(format!(
                        "`{}` delegates to expelled member `{delegatee}`",
                        member.name
                    ));
                }
            }

            // Delegation is a single hop
            if let Some(delegatee) = &member.governance_delegatee {
                if self.member(delegatee).and_then(|m| m.governance_delegatee.as_ref()).is_some() {
                    return Err(format!("`{delegatee}` both delegates and is a delegatee"));
                }
            }
            if let Some(delegatee) = &member.consensus_delegatee {
                if self.member(delegatee).and_then(|m| m.consensus_delegatee.as_ref()).is_some() {
                    return Err(format!("`{delegatee}` both delegates and is a delegatee"));
                }
            }
        }

        let total = |power: fn(&Member) -> VotingPower| {
            self.members
                .iter()
                .try_fold(0 as VotingPower, |total, member| total.checked_add(power(member)))
        };
        if total(|m| m.governance_voting_power).is_none() {
            return Err("total governance voting power overflows".to_string());
        }
        if total(|m| m.consensus_voting_power).is_none() {
            return Err("total consensus voting power overflows".to_string());
        }

        if self.governance_set().total_power() == 0 {
            return Err("no governance voting power".to_string());
        }
        if self.consensus_set().total_power() == 0 {
            return Err("no consensus voting power".to_string());
        }

        Ok(())
    }

    fn validator_set(&self, domain: Domain) -> ValidatorSet {
        let mut powers: BTreeMap<PublicKey, VotingPower> = BTreeMap::new();

        for member in self.members.iter().filter(|m| !m.expelled) {
            let (power, delegatee) = match domain {
                Domain::Governance => (member.governance_voting_power, &member.governance_delegatee),
                Domain::Consensus => (member.consensus_voting_power, &member.consensus_delegatee),
            };

            if power == 0 {
                continue;
            }

            let holder = delegatee
                .as_deref()
                .and_then(|name| self.member(name))
                .unwrap_or(member);

            let held = powers.entry(holder.public_key).or_default();
            *held = held.saturating_add(power);
        }

        ValidatorSet { powers }
    }

    /// Who may approve agendas, weighted by delegation-aware power
    pub fn governance_set(&self) -> ValidatorSet {
        self.validator_set(Domain::Governance)
    }

    /// Who may vote on (or veto) blocks, weighted by delegation-aware power
    pub fn consensus_set(&self) -> ValidatorSet {
        self.validator_set(Domain::Consensus)
    }

    /// The state after `delegator` handed its power to `delegatee`
    ///
    /// Consensus power is always delegated; governance power only if requested.
    pub fn delegate(
        &self,
        delegator: &str,
        delegatee: &str,
        governance: bool,
    ) -> Result<ReservedState, String> {
        let Some(target) = self.member(delegatee) else {
            return Err(format!("unknown delegatee `{delegatee}`"));
        };
        if target.expelled {
            return Err(format!("delegatee `{delegatee}` was expelled"));
        }

        let mut next = self.clone();
        let Some(member) = next.member_mut(delegator) else {
            return Err(format!("unknown delegator `{delegator}`"));
        };
        if member.expelled {
            return Err(format!("delegator `{delegator}` was expelled"));
        }

        member.consensus_delegatee = Some(delegatee.to_string());
        if governance {
            member.governance_delegatee = Some(delegatee.to_string());
        }

        next.check_consistency()?;
        Ok(next)
    }

    /// The state after `delegator` took back all of its voting power
    pub fn undelegate(&self, delegator: &str) -> Result<ReservedState, String> {
        let mut next = self.clone();
        let Some(member) = next.member_mut(delegator) else {
            return Err(format!("unknown delegator `{delegator}`"));
        };

        if member.consensus_delegatee.is_none() && member.governance_delegatee.is_none() {
            return Err(format!("`{delegator}` has not delegated"));
        }

        member.consensus_delegatee = None;
        member.governance_delegatee = None;

        next.check_consistency()?;
        Ok(next)
    }

    /// The state after the member holding `offender` was slashed
    ///
    /// Returns None if no member holds that key.
    pub fn expel(&self, offender: &PublicKey) -> Option<ReservedState> {
        let name = self.member_by_key(offender)?.name.clone();
        let mut next = self.clone();

        for member in next.members.iter_mut() {
            if member.name == name {
                member.expelled = true;
                member.governance_voting_power = 0;
                member.consensus_voting_power = 0;
                member.governance_delegatee = None;
                member.consensus_delegatee = None;
            } else {
                if member.governance_delegatee.as_deref() == Some(name.as_str()) {
                    member.governance_delegatee = None;
                }
                if member.consensus_delegatee.as_deref() == Some(name.as_str()) {
                    member.consensus_delegatee = None;
                }
            }
        }

        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    fn key(seed: u8) -> PublicKey {
        PrivateKey::from_seed([seed; 32]).public_key()
    }

    fn state() -> ReservedState {
        ReservedState::new(vec![
            Member::new("alice", key(1), 1, 1),
            Member::new("bob", key(2), 1, 1),
            Member::new("carol", key(3), 1, 1),
            Member::new("dave", key(4), 1, 1),
        ])
    }

    #[test]
    fn consistent() {
        assert!(state().check_consistency().is_ok());
        assert!(ReservedState::new(vec![]).check_consistency().is_err());

        let mut dup = state();
        dup.members[1].name = "alice".to_string();
        assert!(dup.check_consistency().is_err());
    }

    #[test]
    fn power_overflow() {
        let mut huge = state();
        huge.members[0].governance_voting_power = VotingPower::MAX;
        huge.members[1].governance_voting_power = VotingPower::MAX;
        assert_eq!(
            huge.check_consistency(),
            Err("total governance voting power overflows".to_string())
        );

        // Sets of such a state saturate instead of wrapping
        let set = huge.governance_set();
        assert_eq!(set.total_power(), VotingPower::MAX);
        assert_eq!(set.power_of_all([&key(1), &key(2)]), VotingPower::MAX);

        let mut huge = state();
        huge.members[2].consensus_voting_power = VotingPower::MAX;
        assert!(huge.check_consistency().is_err());
    }

    #[test]
    fn delegation_moves_power() {
        let state = state().delegate("alice", "bob", false).unwrap();

        let consensus = state.consensus_set();
        assert_eq!(consensus.power_of(&key(2)), 2);
        assert_eq!(consensus.power_of(&key(1)), 0);

        // Governance power stays with alice
        let governance = state.governance_set();
        assert_eq!(governance.power_of(&key(1)), 1);
        assert_eq!(governance.total_power(), 4);

        let state = state.undelegate("alice").unwrap();
        assert_eq!(state.consensus_set().power_of(&key(2)), 1);
        assert!(state.undelegate("alice").is_err());
    }

    #[test]
    fn delegation_is_single_hop() {
        let state = state().delegate("alice", "bob", true).unwrap();
        assert!(state.delegate("bob", "carol", true).is_err());
    }

    #[test]
    fn expel_clears_delegations() {
        let state = state().delegate("alice", "bob", true).unwrap();
        let state = state.expel(&key(2)).unwrap();

        let bob = state.member("bob").unwrap();
        assert!(bob.expelled);
        assert_eq!(bob.consensus_voting_power, 0);
        assert_eq!(state.member("alice").unwrap().consensus_delegatee, None);
        assert_eq!(state.governance_set().total_power(), 3);

        assert!(state.expel(&key(9)).is_none());
    }

    #[test]
    fn quorum_is_strict() {
        let set = state().governance_set();
        let two_thirds = Ratio::new(2, 3);

        assert!(!set.reaches([&key(1), &key(2)], two_thirds));
        assert!(set.reaches([&key(1), &key(2), &key(3)], two_thirds));
        // Repeated voters only count once
        assert!(!set.reaches([&key(1), &key(1), &key(1), &key(2)], two_thirds));
    }
}
