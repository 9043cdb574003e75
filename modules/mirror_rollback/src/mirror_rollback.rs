//! Mirror rollback: drives a dedicated mirror replica to make an arbitrary
//! block its active tip, and audits coin supply along the way.

mod controller;
mod inflation;

pub use controller::{MirrorRollbackController, RollbackError, RollbackSession};
pub use inflation::{
    AuditError, AuditOutcome, InflationAuditor, InflationSnapshot, SnapshotStore,
};

use anyhow::Result;
use config::Config;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MirrorConfig {
    /// Upper bound on invalidate/verify cycles in one rollback.
    pub max_iterations: u32,
    /// Pause between rollback iterations, giving the mirror time to settle.
    pub iteration_delay_ms: u64,
    /// Pause after each reconsiderblock call.
    pub reconsider_delay_ms: u64,
    /// Maximum blocks one inflation audit will roll the mirror through.
    pub audit_max_blocks: usize,
    /// Pause before the mirror is used again after an audit.
    pub rest_secs: u64,
    /// Slack when comparing supply deltas against the subsidy ceiling.
    pub inflation_tolerance: u64,
}

impl MirrorConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> MirrorConfig {
    MirrorConfig {
        max_iterations: 2,
        iteration_delay_ms: 0,
        reconsider_delay_ms: 0,
        audit_max_blocks: 2,
        rest_secs: 0,
        inflation_tolerance: 0,
    }
}
