//! Blockchain monitor: turns raw explorer events into wallet-scoped
//! notifications and cache invalidation.
//!
//! One pipeline per network. Failures on an individual tx or block are
//! logged and dropped so a malformed event can never stall the feed.
//! Exactly-once delivery is enforced by the dedup hash stored alongside
//! every notification, which makes both handler retries and the
//! mempool-then-block double observation of a transaction idempotent.

use tokio::sync::broadcast::error::RecvError;

use crate::{
    error::ServiceResult,
    explorer::{ExplorerBlock, ExplorerEvent, ExplorerTx},
    service::Service,
    types::{Network, NotificationType, TxProposalStatus, epoch_ms},
};

#[derive(Clone)]
pub struct BlockchainMonitor {
    service: Service,
    networks: Vec<Network>,
}

impl BlockchainMonitor {
    pub fn new(service: Service, networks: Vec<Network>) -> Self {
        Self { service, networks }
    }

    /// Spawns one event loop per configured network.
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.networks
            .iter()
            .map(|network| {
                let monitor = self.clone();
                let network = *network;
                tokio::spawn(async move { monitor.run(network).await })
            })
            .collect()
    }

    async fn run(&self, network: Network) {
        let explorer = match self.service.explorer(network) {
            Ok(explorer) => explorer,
            Err(err) => {
                tracing::error!(%network, %err, "monitor cannot start");
                return;
            }
        };
        let mut events = explorer.subscribe();
        tracing::info!(%network, "blockchain monitor started");
        loop {
            match events.recv().await {
                Ok(ExplorerEvent::Tx(tx)) => {
                    if let Err(err) = self.handle_tx(network, &tx).await {
                        tracing::warn!(%network, txid = %tx.txid, %err,
                            "failed to process incoming tx");
                    }
                }
                Ok(ExplorerEvent::Block(hash)) => {
                    if let Err(err) =
                        self.handle_block(network, &hash).await
                    {
                        tracing::warn!(%network, %hash, %err,
                            "failed to process block");
                    }
                }
                Ok(ExplorerEvent::Connect) => {
                    tracing::info!(%network, "explorer connected");
                }
                Ok(ExplorerEvent::ConnectError(reason)) => {
                    tracing::warn!(%network, %reason, "explorer connection error");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(%network, skipped,
                        "monitor lagged behind explorer events");
                }
                Err(RecvError::Closed) => {
                    tracing::info!(%network, "explorer event feed closed");
                    return;
                }
            }
        }
    }

    /// Mempool arrival: outgoing recognition plus block-gated incoming
    /// recognition.
    pub async fn handle_tx(
        &self,
        network: Network,
        tx: &ExplorerTx,
    ) -> ServiceResult<()> {
        self.spawn_outgoing_recognition(tx.txid.clone());
        // Replaceable unconfirmed transactions are only announced once
        // mined; the block pipeline picks them up.
        let gated = tx.confirmations == 0 && tx.signals_rbf();
        if !gated {
            self.recognize_incoming(network, tx).await?;
        }
        Ok(())
    }

    /// Path A: a transaction we assembled shows up on the network without
    /// `broadcastTx` having completed. Wait out the grace period so the
    /// normal broadcast path can win, then claim it.
    fn spawn_outgoing_recognition(&self, txid: String) {
        let service = self.service.clone();
        let delay = service.tunables.broadcast_confirm_delay;
        tokio::spawn(async move {
            let result: ServiceResult<()> = async {
                let Some(txp) =
                    service.storage.fetch_tx_proposal_by_txid(&txid)?
                else {
                    return Ok(());
                };
                if txp.status != TxProposalStatus::Accepted {
                    return Ok(());
                }
                tokio::time::sleep(delay).await;
                let Some(mut txp) = service
                    .storage
                    .fetch_tx_proposal(&txp.wallet_id, &txp.id)?
                else {
                    return Ok(());
                };
                if txp.status != TxProposalStatus::Accepted {
                    return Ok(());
                }
                txp.status = TxProposalStatus::Broadcasted;
                txp.broadcasted_on = Some(epoch_ms());
                service.storage.update_tx_proposal(&txp)?;
                service
                    .storage
                    .soft_reset_history_cache(&txp.wallet_id)?;
                service.notify(
                    &txp.wallet_id,
                    None,
                    NotificationType::NewOutgoingTxByThirdParty,
                    serde_json::json!({
                        "txProposalId": txp.id,
                        "txid": txid,
                        "amount": txp.amount(),
                    }),
                    true,
                )?;
                Ok(())
            }
            .await;
            if let Err(err) = result {
                tracing::warn!(%err, "outgoing recognition failed");
            }
        });
    }

    /// Path B: credit wallet-owned destination addresses.
    async fn recognize_incoming(
        &self,
        _network: Network,
        tx: &ExplorerTx,
    ) -> ServiceResult<()> {
        for output in &tx.outputs {
            let Some(address_str) = &output.address else {
                continue;
            };
            let Some(mut address) =
                self.service.storage.fetch_address(address_str)?
            else {
                continue;
            };
            address.last_used_on = Some(epoch_ms());
            address.has_activity = true;
            self.service.storage.update_address(&address)?;
            if address.is_change {
                continue;
            }
            self.service
                .storage
                .soft_reset_history_cache(&address.wallet_id)?;
            self.service.notify(
                &address.wallet_id,
                None,
                NotificationType::NewIncomingTx,
                serde_json::json!({
                    "txid": tx.txid,
                    "address": address.address,
                    "amount": output.satoshis,
                }),
                true,
            )?;
        }
        Ok(())
    }

    /// New tip: recover any missed ancestors inside the re-org window,
    /// process block contents, advance the tip and fan out `NewBlock`.
    pub async fn handle_block(
        &self,
        network: Network,
        hash: &str,
    ) -> ServiceResult<()> {
        let explorer = self.service.explorer(network)?;
        let block = explorer.get_block(hash).await?;
        let mut tip = self
            .service
            .storage
            .fetch_tip(network)?
            .unwrap_or_default();
        let max_depth = self.service.tunables.max_reorg_depth;

        // Walk back through unknown ancestors, bounded by the window.
        let mut missed: Vec<ExplorerBlock> = vec![];
        if !tip.hashes.is_empty() {
            let mut cursor = block.prev_hash.clone();
            while let Some(prev_hash) = cursor {
                if tip.contains(&prev_hash) || missed.len() >= max_depth {
                    break;
                }
                let ancestor = explorer.get_block(&prev_hash).await?;
                cursor = ancestor.prev_hash.clone();
                missed.push(ancestor);
            }
        }
        for ancestor in missed.iter().rev() {
            tracing::info!(%network, hash = %ancestor.hash,
                "processing missed ancestor block");
            self.process_block(network, ancestor).await?;
            tip.push(ancestor.hash.clone(), max_depth, epoch_ms());
        }

        self.process_block(network, &block).await?;
        tip.push(block.hash.clone(), max_depth, epoch_ms());
        self.service.storage.store_tip(network, &tip)?;

        self.service.storage.soft_reset_all_history_caches()?;
        self.service.notify(
            &network.to_string(),
            None,
            NotificationType::NewBlock,
            serde_json::json!({ "hash": block.hash }),
            true,
        )?;
        Ok(())
    }

    async fn process_block(
        &self,
        network: Network,
        block: &ExplorerBlock,
    ) -> ServiceResult<()> {
        for tx in &block.txs {
            self.spawn_outgoing_recognition(tx.txid.clone());
            // Confirmed now, so the RBF gate no longer applies; the dedup
            // hash drops anything already announced from the mempool.
            if let Err(err) = self.recognize_incoming(network, tx).await {
                tracing::warn!(txid = %tx.txid, %err,
                    "failed incoming recognition in block");
            }
        }
        Ok(())
    }
}
