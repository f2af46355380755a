use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::proof::Ratio;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub chain_name: String,
    /// Share of governance power an agenda proof must exceed
    pub governance_threshold: Ratio,
    /// Share of consensus power the vetoes on a block must exceed
    pub consensus_threshold: Ratio,
    /// Longest chain above the finalized block that is walked before giving up
    pub max_sequence_length: usize,
    /// Delete the local proposal `p` once it falls behind `main`
    pub prune_local_proposal: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            chain_name: "commitchain".to_string(),
            governance_threshold: Ratio::default(),
            consensus_threshold: Ratio::default(),
            max_sequence_length: 4096,
            prune_local_proposal: true,
        }
    }
}

impl LedgerConfig {
    pub fn from_ron(text: &str) -> anyhow::Result<Self> {
        let config: Self = match ron::from_str(text) {
            Ok(config) => config,
            Err(err) => anyhow::bail!("Failed to parse ledger configuration: {err}"),
        };
        config.check()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        log::info!("Loading ledger configuration from {path:?}");

        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => anyhow::bail!("Failed to open file {path:?}: {err}"),
        };

        let config: Self = match ron::de::from_reader(file) {
            Ok(config) => config,
            Err(err) => anyhow::bail!("Failed to parse RON file at {path:?}: {err}"),
        };
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> anyhow::Result<()> {
        for (name, ratio) in [
            ("governance_threshold", self.governance_threshold),
            ("consensus_threshold", self.consensus_threshold),
        ] {
            if ratio.denominator == 0 || ratio.numerator >= ratio.denominator {
                anyhow::bail!("{name} must be a fraction below one, got {ratio}");
            }
        }

        if self.max_sequence_length == 0 {
            anyhow::bail!("max_sequence_length must be positive");
        }

        Ok(())
    }
}
