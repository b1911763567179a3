//! UTXO composition, safety tagging and balance queries.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::{
    coin_select::{self, SendMaxInfo},
    error::{ServiceError, ServiceResult},
    explorer::Explorer,
    service::{AuthedRequest, Service},
    storage::ActiveAddressesCache,
    txbuilder,
    types::{
        Address, NotificationType, TxProposal, Wallet, WalletUtxo, epoch_ms,
    },
};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AddressAmount {
    pub address: String,
    pub path: String,
    pub amount: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Balance {
    /// Sum of safe UTXOs, reserved or not.
    pub total_amount: u64,
    /// Reserved by open proposals.
    pub locked_amount: u64,
    pub available_amount: u64,
    pub total_confirmed_amount: u64,
    pub locked_confirmed_amount: u64,
    pub available_confirmed_amount: u64,
    /// Unconfirmed coins disqualified from spending.
    pub total_unsafe_amount: u64,
    pub by_address: Vec<AddressAmount>,
    /// Estimated size of a transaction draining every spendable coin.
    pub total_bytes_to_send_max: u64,
}

impl Service {
    /// The wallet's UTXO set decorated with derivation info, reservation
    /// state and safety tags.
    pub async fn get_utxos(
        &self,
        authed: &AuthedRequest,
    ) -> ServiceResult<Vec<WalletUtxo>> {
        let addresses = self.storage.fetch_addresses(&authed.wallet.id)?;
        self.utxos_for_addresses(&authed.wallet, &addresses).await
    }

    pub(crate) async fn utxos_for_addresses(
        &self,
        wallet: &Wallet,
        addresses: &[Address],
    ) -> ServiceResult<Vec<WalletUtxo>> {
        if addresses.is_empty() {
            return Ok(vec![]);
        }
        let explorer = self.explorer(wallet.network)?;
        let by_address: HashMap<&str, &Address> = addresses
            .iter()
            .map(|a| (a.address.as_str(), a))
            .collect();
        let address_strings: Vec<String> =
            addresses.iter().map(|a| a.address.clone()).collect();
        let raw = explorer.get_utxos(&address_strings).await?;

        let reserved = self.reserved_outpoints(&wallet.id)?;
        let mut utxos = vec![];
        for utxo in raw {
            let Some(address) = by_address.get(utxo.address.as_str()) else {
                continue;
            };
            let locked =
                reserved.contains(&(utxo.txid.clone(), utxo.vout));
            let unsafe_to_spend = if utxo.confirmations > 0 {
                false
            } else {
                self.is_unsafe_unconfirmed(explorer.as_ref(), &utxo.txid)
                    .await?
            };
            utxos.push(WalletUtxo {
                txid: utxo.txid,
                vout: utxo.vout,
                address: utxo.address,
                script_pub_key: utxo.script_pub_key,
                satoshis: utxo.satoshis,
                confirmations: utxo.confirmations,
                path: address.path.clone(),
                public_keys: address.public_keys.clone(),
                locked,
                unsafe_to_spend,
            });
        }
        Ok(utxos)
    }

    /// Outpoints reserved by open proposals of a wallet.
    fn reserved_outpoints(
        &self,
        wallet_id: &str,
    ) -> ServiceResult<HashSet<(String, u32)>> {
        let txps = self.storage.fetch_tx_proposals(wallet_id)?;
        Ok(reserved_outpoints_of(&txps, None))
    }

    /// An unconfirmed UTXO is unsafe when its transaction signals RBF, has
    /// too deep an unconfirmed ancestry, or any unconfirmed ancestor
    /// signals RBF. Transactions that originated from this service are
    /// always safe.
    async fn is_unsafe_unconfirmed(
        &self,
        explorer: &dyn Explorer,
        txid: &str,
    ) -> ServiceResult<bool> {
        if self.storage.fetch_tx_proposal_by_txid(txid)?.is_some() {
            return Ok(false);
        }
        let max_ancestors = self.tunables.max_ancestors_per_input_to_verify;
        let mut queue = vec![txid.to_owned()];
        let mut seen: HashSet<String> = HashSet::new();
        let mut unconfirmed_ancestors = 0usize;
        while let Some(txid) = queue.pop() {
            if !seen.insert(txid.clone()) {
                continue;
            }
            let Some(tx) = explorer.get_transaction(&txid).await? else {
                // Vanished from the mempool: treat as replaceable.
                return Ok(true);
            };
            if tx.confirmations > 0 {
                continue;
            }
            if tx.signals_rbf() {
                return Ok(true);
            }
            if seen.len() > 1 {
                unconfirmed_ancestors += 1;
                if unconfirmed_ancestors > max_ancestors {
                    return Ok(true);
                }
            }
            for input in &tx.inputs {
                if let Some(parent) = &input.txid {
                    queue.push(parent.clone());
                }
            }
        }
        Ok(false)
    }

    /// Balance over the whole address set, or over the cached active set
    /// with an asynchronous full recomputation when `two_step` applies.
    pub async fn get_balance(
        &self,
        authed: &AuthedRequest,
        two_step: bool,
    ) -> ServiceResult<Balance> {
        let wallet = &authed.wallet;
        let addresses = self.storage.fetch_addresses(&wallet.id)?;

        let use_two_step = two_step
            && addresses.len() > self.tunables.two_step_balance_threshold;
        if use_two_step {
            if let Some(cache) =
                self.storage.fetch_active_addresses(&wallet.id)?
            {
                let active: HashSet<&str> =
                    cache.addresses.iter().map(String::as_str).collect();
                let subset: Vec<Address> = addresses
                    .iter()
                    .filter(|a| active.contains(a.address.as_str()))
                    .cloned()
                    .collect();
                let quick = self.compute_balance(wallet, &subset).await?;
                self.spawn_full_balance_check(wallet.clone(), quick.clone());
                return Ok(quick);
            }
        }
        let balance = self.compute_balance(wallet, &addresses).await?;
        self.store_active_addresses_from(&wallet.id, &balance)?;
        Ok(balance)
    }

    async fn compute_balance(
        &self,
        wallet: &Wallet,
        addresses: &[Address],
    ) -> ServiceResult<Balance> {
        let utxos = self.utxos_for_addresses(wallet, addresses).await?;
        Ok(self.balance_from_utxos(wallet, &utxos))
    }

    fn balance_from_utxos(
        &self,
        wallet: &Wallet,
        utxos: &[WalletUtxo],
    ) -> Balance {
        let mut balance = Balance::default();
        let mut by_address: HashMap<(String, String), u64> = HashMap::new();
        let mut spendable_inputs = 0usize;
        for utxo in utxos {
            if utxo.unsafe_to_spend {
                balance.total_unsafe_amount += utxo.satoshis;
                continue;
            }
            balance.total_amount += utxo.satoshis;
            if utxo.locked {
                balance.locked_amount += utxo.satoshis;
            } else {
                spendable_inputs += 1;
            }
            if utxo.confirmations > 0 {
                balance.total_confirmed_amount += utxo.satoshis;
                if utxo.locked {
                    balance.locked_confirmed_amount += utxo.satoshis;
                }
            }
            *by_address
                .entry((utxo.address.clone(), utxo.path.clone()))
                .or_default() += utxo.satoshis;
        }
        balance.available_amount =
            balance.total_amount - balance.locked_amount;
        balance.available_confirmed_amount = balance.total_confirmed_amount
            - balance.locked_confirmed_amount;
        let mut by_address: Vec<AddressAmount> = by_address
            .into_iter()
            .map(|((address, path), amount)| AddressAmount {
                address,
                path,
                amount,
            })
            .collect();
        by_address.sort_by(|a, b| a.address.cmp(&b.address));
        balance.by_address = by_address;

        let model = txbuilder::cost_model(wallet, 1, 0);
        let max_size = self.tunables.max_tx_size_in_kb * 1000;
        balance.total_bytes_to_send_max =
            model.size_for(spendable_inputs).min(max_size);
        balance
    }

    fn store_active_addresses_from(
        &self,
        wallet_id: &str,
        balance: &Balance,
    ) -> ServiceResult<()> {
        let cache = ActiveAddressesCache {
            addresses: balance
                .by_address
                .iter()
                .filter(|a| a.amount > 0)
                .map(|a| a.address.clone())
                .collect(),
            updated_on: epoch_ms(),
        };
        self.storage.store_active_addresses(wallet_id, &cache)?;
        Ok(())
    }

    /// Second step of the two-step balance: recompute over everything and
    /// publish a correction when the quick answer was off.
    fn spawn_full_balance_check(&self, wallet: Wallet, quick: Balance) {
        let service = self.clone();
        tokio::spawn(async move {
            let result: ServiceResult<()> = async {
                let addresses =
                    service.storage.fetch_addresses(&wallet.id)?;
                let full =
                    service.compute_balance(&wallet, &addresses).await?;
                service.store_active_addresses_from(&wallet.id, &full)?;
                if full != quick {
                    let data = serde_json::to_value(&full)
                        .unwrap_or(serde_json::Value::Null);
                    service.notify(
                        &wallet.id,
                        None,
                        NotificationType::BalanceUpdated,
                        data,
                        false,
                    )?;
                }
                Ok(())
            }
            .await;
            if let Err(err) = result {
                tracing::warn!(wallet_id = %wallet.id, %err,
                    "two-step balance recomputation failed");
            }
        });
    }

    /// Maximum spendable amount at a fee rate, with a breakdown of what
    /// was excluded and why.
    pub async fn get_send_max_info(
        &self,
        authed: &AuthedRequest,
        fee_per_kb: u64,
        exclude_unconfirmed_utxos: bool,
    ) -> ServiceResult<SendMaxInfo> {
        if fee_per_kb < self.tunables.min_fee_per_kb
            || fee_per_kb > self.tunables.max_fee_per_kb
        {
            return Err(ServiceError::BadRequest(
                "invalid fee per KB".to_owned(),
            ));
        }
        let utxos = self.get_utxos(authed).await?;
        let spendable: Vec<WalletUtxo> = utxos
            .into_iter()
            .filter(|u| !u.locked && !u.unsafe_to_spend)
            .filter(|u| !exclude_unconfirmed_utxos || u.confirmations > 0)
            .collect();
        let model = txbuilder::cost_model(&authed.wallet, 1, fee_per_kb);
        Ok(coin_select::send_max(
            &spendable,
            &model,
            &self.tunables,
            &mut rand::thread_rng(),
        ))
    }
}

/// Outpoints reserved by open proposals, optionally excluding one
/// proposal (used when re-checking availability at publish time).
pub(crate) fn reserved_outpoints_of(
    txps: &[TxProposal],
    exclude_txp: Option<&str>,
) -> HashSet<(String, u32)> {
    txps.iter()
        .filter(|t| t.reserves_inputs())
        .filter(|t| Some(t.id.as_str()) != exclude_txp)
        .flat_map(|t| {
            t.inputs.iter().map(|i| (i.txid.clone(), i.vout))
        })
        .collect()
}
