//! Decorated transaction history, served from a soft-resettable cache.
//!
//! History merges the explorer's view of on-chain transactions with the
//! wallet's own proposal metadata. The cache is rebuilt lazily; the
//! blockchain monitor marks it dirty on any relevant event.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    error::{ServiceError, ServiceResult},
    explorer::ExplorerTx,
    service::{AuthedRequest, Service},
    types::{TxProposal, epoch_ms},
};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HistoryOutput {
    pub address: Option<String>,
    pub amount: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HistoryAction {
    pub copayer_name: String,
    #[serde(rename = "type")]
    pub action_type: String,
    pub comment: Option<String>,
    pub created_on: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HistoryItem {
    pub txid: String,
    /// `sent`, `received` or `moved`.
    pub action: String,
    pub amount: u64,
    pub fees: Option<u64>,
    pub time: Option<u64>,
    pub confirmations: u32,
    pub outputs: Vec<HistoryOutput>,
    /// Present when the transaction originated from a proposal of this
    /// wallet.
    pub proposal_id: Option<String>,
    pub creator_name: Option<String>,
    pub message: Option<String>,
    pub actions: Vec<HistoryAction>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TxHistoryCache {
    /// Soft-reset flag: stale contents kept around until the next rebuild.
    pub dirty: bool,
    pub updated_on: u64,
    pub items: Vec<HistoryItem>,
}

/// Classifies a transaction from the wallet's point of view and produces
/// the decorated item.
fn decorate(
    tx: &ExplorerTx,
    own_addresses: &HashSet<&str>,
    proposal: Option<&TxProposal>,
) -> HistoryItem {
    let inputs_ours: u64 = tx
        .inputs
        .iter()
        .filter(|i| {
            i.address
                .as_deref()
                .is_some_and(|a| own_addresses.contains(a))
        })
        .filter_map(|i| i.satoshis)
        .sum();
    let outputs_ours: u64 = tx
        .outputs
        .iter()
        .filter(|o| {
            o.address
                .as_deref()
                .is_some_and(|a| own_addresses.contains(a))
        })
        .map(|o| o.satoshis)
        .sum();
    let outputs_external: u64 = tx
        .outputs
        .iter()
        .filter(|o| {
            !o.address
                .as_deref()
                .is_some_and(|a| own_addresses.contains(a))
        })
        .map(|o| o.satoshis)
        .sum();

    let (action, amount) = if inputs_ours == 0 {
        ("received", outputs_ours)
    } else if outputs_external > 0 {
        ("sent", outputs_external)
    } else {
        ("moved", outputs_ours)
    };

    HistoryItem {
        txid: tx.txid.clone(),
        action: action.to_owned(),
        amount,
        fees: tx.fees,
        time: tx.time,
        confirmations: tx.confirmations,
        outputs: tx
            .outputs
            .iter()
            .map(|o| HistoryOutput {
                address: o.address.clone(),
                amount: o.satoshis,
            })
            .collect(),
        proposal_id: proposal.map(|p| p.id.clone()),
        creator_name: proposal.map(|p| p.creator_name.clone()),
        message: proposal.and_then(|p| p.message.clone()),
        actions: proposal
            .map(|p| {
                p.actions
                    .iter()
                    .map(|a| HistoryAction {
                        copayer_name: a.copayer_name.clone(),
                        action_type: match a.action_type {
                            crate::types::TxProposalActionType::Accept => {
                                "accept".to_owned()
                            }
                            crate::types::TxProposalActionType::Reject => {
                                "reject".to_owned()
                            }
                        },
                        comment: a.comment.clone(),
                        created_on: a.created_on,
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

impl Service {
    pub async fn get_tx_history(
        &self,
        authed: &AuthedRequest,
        skip: usize,
        limit: usize,
    ) -> ServiceResult<Vec<HistoryItem>> {
        let history_limit = self.tunables.history_limit;
        if limit > history_limit {
            return Err(ServiceError::HistoryLimitExceeded);
        }
        let wallet_id = &authed.wallet.id;

        let cached = self.storage.fetch_history_cache(wallet_id)?;
        let items = match cached {
            Some(cache) if !cache.dirty => cache.items,
            _ => self.rebuild_history(authed).await?,
        };
        Ok(items.into_iter().skip(skip).take(limit).collect())
    }

    async fn rebuild_history(
        &self,
        authed: &AuthedRequest,
    ) -> ServiceResult<Vec<HistoryItem>> {
        let wallet = &authed.wallet;
        let addresses = self.storage.fetch_addresses(&wallet.id)?;
        let own: HashSet<&str> =
            addresses.iter().map(|a| a.address.as_str()).collect();
        let address_strings: Vec<String> =
            addresses.iter().map(|a| a.address.clone()).collect();

        let explorer = self.explorer(wallet.network)?;
        let txs = if address_strings.is_empty() {
            vec![]
        } else {
            explorer
                .get_transactions(
                    &address_strings,
                    0,
                    self.tunables.history_limit,
                )
                .await?
        };

        let mut items = Vec::with_capacity(txs.len());
        for tx in &txs {
            let proposal = self
                .storage
                .fetch_tx_proposal_by_txid(&tx.txid)?
                .filter(|p| p.wallet_id == wallet.id);
            items.push(decorate(tx, &own, proposal.as_ref()));
        }
        self.storage.store_history_cache(
            &wallet.id,
            &TxHistoryCache {
                dirty: false,
                updated_on: epoch_ms(),
                items: items.clone(),
            },
        )?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::decorate;
    use crate::explorer::{ExplorerTx, ExplorerTxInput, ExplorerTxOutput};

    fn tx(
        inputs: Vec<(Option<&str>, u64)>,
        outputs: Vec<(Option<&str>, u64)>,
    ) -> ExplorerTx {
        ExplorerTx {
            txid: "ab".repeat(32),
            inputs: inputs
                .into_iter()
                .map(|(address, satoshis)| ExplorerTxInput {
                    txid: Some("cd".repeat(32)),
                    vout: 0,
                    sequence: u32::MAX,
                    address: address.map(str::to_owned),
                    satoshis: Some(satoshis),
                })
                .collect(),
            outputs: outputs
                .into_iter()
                .map(|(address, satoshis)| ExplorerTxOutput {
                    address: address.map(str::to_owned),
                    satoshis,
                })
                .collect(),
            confirmations: 1,
            block_hash: None,
            time: Some(1_000),
            fees: Some(500),
        }
    }

    fn own() -> HashSet<&'static str> {
        HashSet::from(["mine-1", "mine-2"])
    }

    #[test]
    fn classifies_received() {
        let item = tx(
            vec![(Some("theirs"), 100_000)],
            vec![(Some("mine-1"), 60_000), (Some("theirs"), 39_500)],
        );
        let decorated = decorate(&item, &own(), None);
        assert_eq!(decorated.action, "received");
        assert_eq!(decorated.amount, 60_000);
    }

    #[test]
    fn classifies_sent() {
        let item = tx(
            vec![(Some("mine-1"), 100_000)],
            vec![(Some("theirs"), 70_000), (Some("mine-2"), 29_500)],
        );
        let decorated = decorate(&item, &own(), None);
        assert_eq!(decorated.action, "sent");
        assert_eq!(decorated.amount, 70_000);
    }

    #[test]
    fn classifies_moved() {
        let item = tx(
            vec![(Some("mine-1"), 100_000)],
            vec![(Some("mine-2"), 99_500)],
        );
        let decorated = decorate(&item, &own(), None);
        assert_eq!(decorated.action, "moved");
        assert_eq!(decorated.amount, 99_500);
    }
}
