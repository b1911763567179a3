//! Deterministic input selection for tx proposals.
//!
//! Candidates are walked in confirmation groups; within a group they are
//! split into "big" inputs (each alone covers the target comfortably) and
//! "small" ones that are accumulated greedily with fee-awareness. Small
//! accumulation gives up when the transaction grows too large, when the
//! marginal input is tiny relative to the target while a big input is
//! available, or when the running fee becomes disproportionate; the
//! fallback is the smallest single big input.

use rand::{Rng, seq::SliceRandom as _};

use crate::{defaults, defaults::Tunables, types::WalletUtxo};

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("insufficient funds for fee")]
    InsufficientFundsForFee,
    #[error("transaction would exceed the maximum size")]
    TxMaxSizeExceeded,
}

/// Size and fee accounting for a transaction skeleton with a variable
/// number of inputs. Sizes are vbytes; fees are satoshis.
#[derive(Clone, Copy, Debug)]
pub struct CostModel {
    /// Size with zero inputs: overhead plus all outputs plus change.
    pub base_size: u64,
    pub size_per_input: u64,
    pub fee_per_kb: u64,
}

impl CostModel {
    pub fn size_for(&self, n_inputs: usize) -> u64 {
        self.base_size + self.size_per_input * n_inputs as u64
    }

    pub fn fee_for(&self, n_inputs: usize) -> u64 {
        Self::fee_for_size(self.size_for(n_inputs), self.fee_per_kb)
    }

    pub fn fee_per_input(&self) -> u64 {
        Self::fee_for_size(self.size_per_input, self.fee_per_kb)
    }

    pub fn fee_for_size(size: u64, fee_per_kb: u64) -> u64 {
        (size * fee_per_kb).div_ceil(1000)
    }
}

#[derive(Clone, Debug)]
pub struct Selection {
    pub inputs: Vec<WalletUtxo>,
    pub fee: u64,
}

impl Selection {
    pub fn total(&self) -> u64 {
        self.inputs.iter().map(|i| i.satoshis).sum()
    }
}

/// Summary of the maximum spendable amount given a fee rate.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SendMaxInfo {
    pub amount: u64,
    #[serde(skip)]
    pub inputs: Vec<WalletUtxo>,
    pub fee: u64,
    pub utxos_below_fee: usize,
    pub amount_below_fee: u64,
    pub utxos_above_max_size: usize,
    pub amount_above_max_size: u64,
}

fn dust_threshold() -> u64 {
    defaults::MIN_OUTPUT_AMOUNT.max(defaults::DUST_AMOUNT)
}

/// Absorbs a dust change into the fee so no unspendable output is created.
fn finalize<R: Rng>(
    mut inputs: Vec<WalletUtxo>,
    amount: u64,
    mut fee: u64,
    rng: &mut R,
) -> Selection {
    let total: u64 = inputs.iter().map(|i| i.satoshis).sum();
    let change = total.saturating_sub(amount).saturating_sub(fee);
    if change > 0 && change <= dust_threshold() {
        fee += change;
    }
    inputs.shuffle(rng);
    Selection { inputs, fee }
}

/// Selects inputs covering `amount` plus fees. `utxos` must already be
/// filtered down to spendable coins: not locked, not unsafe, not excluded.
pub fn select_inputs<R: Rng>(
    utxos: &[WalletUtxo],
    amount: u64,
    cost: &CostModel,
    exclude_unconfirmed: bool,
    tunables: &Tunables,
    rng: &mut R,
) -> Result<Selection, Error> {
    let max_size_bytes = tunables.max_tx_size_in_kb * 1000;

    let total_value: u64 = utxos.iter().map(|u| u.satoshis).sum();
    if total_value < amount {
        return Err(Error::InsufficientFunds);
    }
    let net_value = total_value.saturating_sub(cost.fee_for(utxos.len()));
    if net_value < amount {
        return Err(Error::InsufficientFundsForFee);
    }

    let groups: &[u32] = if exclude_unconfirmed { &[6, 1] } else { &[6, 1, 0] };

    let mut size_exceeded = false;
    for &group in groups {
        let candidates: Vec<&WalletUtxo> = utxos
            .iter()
            .filter(|u| u.confirmations >= group)
            .collect();
        if candidates.is_empty() {
            continue;
        }

        let big_threshold = (amount as f64 * tunables.max_single_utxo_factor)
            as u64
            + cost.fee_for(1);
        let (mut bigs, mut smalls): (Vec<&WalletUtxo>, Vec<&WalletUtxo>) =
            candidates
                .into_iter()
                .partition(|u| u.satoshis >= big_threshold);
        bigs.sort_by_key(|u| u.satoshis);
        smalls.sort_by_key(|u| std::cmp::Reverse(u.satoshis));

        let mut selected: Vec<WalletUtxo> = vec![];
        let mut total: u64 = 0;
        for input in smalls {
            if cost.size_for(selected.len() + 1) > max_size_bytes {
                size_exceeded = true;
                break;
            }
            if !bigs.is_empty()
                && (input.satoshis as f64 / amount as f64)
                    < tunables.min_tx_amount_vs_utxo_factor
            {
                break;
            }
            let fee = cost.fee_for(selected.len() + 1);
            if (fee as f64 / amount as f64)
                > tunables.max_fee_vs_tx_amount_factor
                && fee as f64
                    > cost.fee_for(1) as f64
                        * tunables.max_fee_vs_single_utxo_fee_factor
            {
                break;
            }
            selected.push(input.clone());
            total += input.satoshis;
            if total.saturating_sub(fee) >= amount {
                return Ok(finalize(selected, amount, fee, rng));
            }
        }

        // Small accumulation did not reach the target in this group; try
        // the smallest big input on its own.
        if let Some(big) = bigs.first() {
            let fee = cost.fee_for(1);
            if cost.size_for(1) <= max_size_bytes
                && big.satoshis.saturating_sub(fee) >= amount
            {
                return Ok(finalize(vec![(*big).clone()], amount, fee, rng));
            }
        }
    }

    if size_exceeded {
        Err(Error::TxMaxSizeExceeded)
    } else {
        Err(Error::InsufficientFundsForFee)
    }
}

/// Computes the maximum spendable amount: every spendable input that pays
/// for itself, up to the size cap, minus the resulting fee.
pub fn send_max<R: Rng>(
    utxos: &[WalletUtxo],
    cost: &CostModel,
    tunables: &Tunables,
    rng: &mut R,
) -> SendMaxInfo {
    let max_size_bytes = tunables.max_tx_size_in_kb * 1000;
    let fee_per_input = cost.fee_per_input();

    let mut candidates: Vec<&WalletUtxo> = utxos.iter().collect();
    candidates.sort_by_key(|u| std::cmp::Reverse(u.satoshis));

    let mut inputs: Vec<WalletUtxo> = vec![];
    let mut utxos_below_fee = 0;
    let mut amount_below_fee = 0;
    let mut utxos_above_max_size = 0;
    let mut amount_above_max_size = 0;
    for utxo in candidates {
        if utxo.satoshis <= fee_per_input {
            utxos_below_fee += 1;
            amount_below_fee += utxo.satoshis;
            continue;
        }
        if cost.size_for(inputs.len() + 1) > max_size_bytes {
            utxos_above_max_size += 1;
            amount_above_max_size += utxo.satoshis;
            continue;
        }
        inputs.push(utxo.clone());
    }

    let fee = if inputs.is_empty() {
        0
    } else {
        cost.fee_for(inputs.len())
    };
    let total: u64 = inputs.iter().map(|i| i.satoshis).sum();
    inputs.shuffle(rng);
    SendMaxInfo {
        amount: total.saturating_sub(fee),
        inputs,
        fee,
        utxos_below_fee,
        amount_below_fee,
        utxos_above_max_size,
        amount_above_max_size,
    }
}
