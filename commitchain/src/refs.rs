use std::str::FromStr;

use crate::error::BranchRejected;

/// The branch namespace, parsed from a ref name before any rule applies
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub enum BranchName {
    #[display("main")]
    Main,
    #[display("work")]
    Work,
    /// The local proposal
    #[display("p")]
    Proposal,
    #[display("a-{_0}")]
    Agenda(u64),
    #[display("b-{_0}")]
    Block(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub enum TagName {
    #[display("vote-{_0}")]
    Vote(u64),
    #[display("veto-{_0}")]
    Veto(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub enum RefName {
    #[display("{_0}")]
    Branch(BranchName),
    #[display("{_0}")]
    Tag(TagName),
}

/// Parses `<uint>` without sign or leading zeros, so every number has one spelling
fn parse_uint(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

fn unknown(name: &str) -> BranchRejected {
    BranchRejected::UnknownNamespace {
        name: name.to_string(),
    }
}

impl FromStr for BranchName {
    type Err = BranchRejected;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "main" => Ok(Self::Main),
            "work" => Ok(Self::Work),
            "p" => Ok(Self::Proposal),
            _ => {
                if let Some(num) = name.strip_prefix("a-").and_then(parse_uint) {
                    Ok(Self::Agenda(num))
                } else if let Some(num) = name.strip_prefix("b-").and_then(parse_uint) {
                    Ok(Self::Block(num))
                } else {
                    Err(unknown(name))
                }
            }
        }
    }
}

impl FromStr for TagName {
    type Err = BranchRejected;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if let Some(num) = name.strip_prefix("vote-").and_then(parse_uint) {
            Ok(Self::Vote(num))
        } else if let Some(num) = name.strip_prefix("veto-").and_then(parse_uint) {
            Ok(Self::Veto(num))
        } else {
            Err(unknown(name))
        }
    }
}

impl FromStr for RefName {
    type Err = BranchRejected;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if let Ok(branch) = name.parse() {
            Ok(Self::Branch(branch))
        } else if let Ok(tag) = name.parse() {
            Ok(Self::Tag(tag))
        } else {
            Err(unknown(name))
        }
    }
}

impl BranchName {
    /// Branches holding not-yet-finalized proposals
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Proposal | Self::Agenda(_) | Self::Block(_))
    }

    /// The same namespace with a different number
    pub fn with_number(&self, num: u64) -> Self {
        match self {
            Self::Agenda(_) => Self::Agenda(num),
            Self::Block(_) => Self::Block(num),
            other => *other,
        }
    }

    pub fn number(&self) -> Option<u64> {
        match self {
            Self::Agenda(num) | Self::Block(num) => Some(*num),
            _ => None,
        }
    }

    /// Ref prefix shared by all branches of this namespace
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Work => "work",
            Self::Proposal => "p",
            Self::Agenda(_) => "a-",
            Self::Block(_) => "b-",
        }
    }
}

impl TagName {
    pub fn number(&self) -> u64 {
        match self {
            Self::Vote(num) | Self::Veto(num) => *num,
        }
    }

    pub fn with_number(&self, num: u64) -> Self {
        match self {
            Self::Vote(_) => Self::Vote(num),
            Self::Veto(_) => Self::Veto(num),
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Vote(_) => "vote-",
            Self::Veto(_) => "veto-",
        }
    }
}

/// The lowest number not used by any of `taken` (names with the given prefix),
/// preferring `requested` if it is free
pub(crate) fn allocate_number<'a>(
    prefix: &str,
    taken: impl IntoIterator<Item = &'a String>,
    requested: u64,
) -> u64 {
    let used: std::collections::BTreeSet<u64> = taken
        .into_iter()
        .filter_map(|name| name.strip_prefix(prefix).and_then(parse_uint))
        .collect();

    if !used.contains(&requested) {
        return requested;
    }

    // Numbering starts at one
    (1..).find(|num| !used.contains(num)).unwrap_or(requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_branches() {
        assert_eq!("main".parse::<BranchName>(), Ok(BranchName::Main));
        assert_eq!("p".parse::<BranchName>(), Ok(BranchName::Proposal));
        assert_eq!("a-12".parse::<BranchName>(), Ok(BranchName::Agenda(12)));
        assert_eq!("b-0".parse::<BranchName>(), Ok(BranchName::Block(0)));

        for name in ["master", "a-", "a-01", "b--1", "b-1x", "A-1", "work2"] {
            assert!(
                matches!(
                    name.parse::<BranchName>(),
                    Err(BranchRejected::UnknownNamespace { .. })
                ),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn parse_refs() {
        assert_eq!(
            "vote-3".parse::<RefName>(),
            Ok(RefName::Tag(TagName::Vote(3)))
        );
        assert_eq!(
            "b-7".parse::<RefName>(),
            Ok(RefName::Branch(BranchName::Block(7)))
        );
        assert!("veto".parse::<RefName>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for name in ["main", "work", "p", "a-4", "b-10", "vote-1", "veto-2"] {
            assert_eq!(name.parse::<RefName>().unwrap().to_string(), name);
        }
    }

    #[test]
    fn allocation() {
        let taken = vec!["a-1".to_string(), "a-2".to_string(), "b-3".to_string()];

        assert_eq!(allocate_number("a-", &taken, 5), 5);
        assert_eq!(allocate_number("a-", &taken, 2), 3);
        assert_eq!(allocate_number("b-", &taken, 3), 1);
    }
}
