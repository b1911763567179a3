//! Tunable operating parameters and their defaults.

use std::time::Duration;

/// Outputs below the network dust threshold are unrelayable.
pub const DUST_AMOUNT: u64 = 546;
/// Service-imposed floor on output amounts, above dust.
pub const MIN_OUTPUT_AMOUNT: u64 = 5_000;
/// Hard ceiling on the fee of any proposal, in satoshis (0.05 BTC).
pub const MAX_TX_FEE: u64 = 5_000_000;

/// Every operating knob of the service with its default value. Constructed
/// once at startup and shared by the whole service container.
#[derive(Clone, Debug)]
pub struct Tunables {
    /// A creator may delete a pending proposal with no other approvals only
    /// after this much time.
    pub delete_locktime: Duration,
    /// Consecutive rejections tolerated before creation back-off kicks in.
    pub backoff_offset: usize,
    /// Back-off expires this long after the last rejection.
    pub backoff_time: Duration,
    /// Unused-address window inspected by the scan derivators.
    pub scan_address_gap: u32,
    /// Maximum request keys per copayer.
    pub max_keys: usize,
    /// Consecutive inactive main addresses tolerated before derivation of
    /// further main addresses is denied.
    pub max_main_address_gap: u32,
    pub max_tx_size_in_kb: u64,
    pub min_fee_per_kb: u64,
    pub max_fee_per_kb: u64,
    /// Ancestor window retained per network for re-org recovery.
    pub max_reorg_depth: usize,
    /// Unconfirmed ancestry deeper than this marks a UTXO unsafe.
    pub max_ancestors_per_input_to_verify: usize,
    pub history_limit: usize,
    /// Coin selection: inputs larger than `amount * this` are "big".
    pub max_single_utxo_factor: f64,
    pub max_fee_vs_tx_amount_factor: f64,
    pub min_tx_amount_vs_utxo_factor: f64,
    pub max_fee_vs_single_utxo_fee_factor: f64,
    /// Wallets with more addresses than this get the two-step balance.
    pub two_step_balance_threshold: usize,
    /// Monitor grace period before claiming an accepted proposal was
    /// broadcast by a third party.
    pub broadcast_confirm_delay: Duration,
    pub fee_levels_cache_duration: Duration,
    pub lock_acquire_timeout: Duration,
    /// A crashed lock holder frees the wallet after this long.
    pub lock_ttl: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            delete_locktime: Duration::from_secs(24 * 3600),
            backoff_offset: 3,
            backoff_time: Duration::from_secs(120),
            scan_address_gap: 20,
            max_keys: 100,
            max_main_address_gap: 20,
            max_tx_size_in_kb: 100,
            min_fee_per_kb: 0,
            max_fee_per_kb: 10_000,
            max_reorg_depth: 100,
            max_ancestors_per_input_to_verify: 5,
            history_limit: 1_000,
            max_single_utxo_factor: 2.0,
            max_fee_vs_tx_amount_factor: 0.05,
            min_tx_amount_vs_utxo_factor: 0.5,
            max_fee_vs_single_utxo_fee_factor: 5.0,
            two_step_balance_threshold: 100,
            broadcast_confirm_delay: Duration::from_secs(20),
            fee_levels_cache_duration: Duration::from_secs(6 * 3600),
            lock_acquire_timeout: Duration::from_secs(5),
            lock_ttl: Duration::from_secs(120),
        }
    }
}
