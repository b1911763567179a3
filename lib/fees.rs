//! Fee level sampling.
//!
//! Levels map human names to confirmation targets. Estimates come from the
//! explorer; targets the explorer has no estimate for fall back to the
//! level's default so clients always get a complete table.

use serde::{Deserialize, Serialize};

use crate::explorer::{self, Explorer};

/// (name, confirmation target, default sat/kB).
pub const FEE_LEVELS: &[(&str, u32, u64)] = &[
    ("urgent", 1, 10_000),
    ("priority", 2, 5_000),
    ("normal", 3, 2_000),
    ("economy", 6, 1_000),
    ("superEconomy", 24, 500),
];

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FeeLevelEstimate {
    pub level: String,
    pub nb_blocks: u32,
    pub fee_per_kb: u64,
    /// False when the explorer had no estimate and the default was used.
    pub from_estimate: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FeeLevelsCacheEntry {
    pub levels: Vec<FeeLevelEstimate>,
    pub computed_on: u64,
}

pub async fn sample_levels(
    explorer: &dyn Explorer,
    max_fee_per_kb: u64,
) -> Result<Vec<FeeLevelEstimate>, explorer::Error> {
    let targets: Vec<u32> = FEE_LEVELS.iter().map(|(_, nb, _)| *nb).collect();
    let estimates = explorer.estimate_fee(&targets).await?;
    let levels = FEE_LEVELS
        .iter()
        .map(|(name, nb_blocks, default_value)| {
            let estimate = estimates.get(nb_blocks).copied().flatten();
            FeeLevelEstimate {
                level: (*name).to_owned(),
                nb_blocks: *nb_blocks,
                fee_per_kb: estimate
                    .unwrap_or(*default_value)
                    .min(max_fee_per_kb),
                from_estimate: estimate.is_some(),
            }
        })
        .collect();
    Ok(levels)
}
