//! Tx proposal lifecycle: create, publish, sign, reject, broadcast,
//! remove. Everything here runs under the wallet lock.

use serde::{Deserialize, Serialize};

use crate::{
    coin_select,
    error::{ServiceError, ServiceResult},
    service::{AuthedRequest, Service, balance::reserved_outpoints_of},
    txbuilder,
    types::{
        NotificationType, TxInput, TxOutput, TxProposal, TxProposalAction,
        TxProposalActionType, TxProposalStatus, TxProposalVersion, Wallet,
        WalletUtxo, epoch_ms,
    },
};

/// How many recent proposals are inspected for rejection back-off, on top
/// of the configured offset.
const BACKOFF_WINDOW_BASE: usize = 5;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OutputOptions {
    pub to_address: String,
    pub amount: u64,
    pub message: Option<String>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub struct OutPointRef {
    pub txid: String,
    pub vout: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CreateTxOptions {
    /// Client-supplied proposal id for idempotent retries.
    pub txp_id: Option<String>,
    pub outputs: Vec<OutputOptions>,
    pub fee_per_kb: Option<u64>,
    /// Client-selected inputs; requires `fee`.
    pub inputs: Option<Vec<OutPointRef>>,
    pub fee: Option<u64>,
    pub send_max: bool,
    pub change_address: Option<String>,
    pub message: Option<String>,
    pub pay_pro_url: Option<String>,
    pub custom_data: Option<String>,
    pub exclude_unconfirmed_utxos: bool,
    pub utxos_to_exclude: Vec<OutPointRef>,
    pub dry_run: bool,
    pub no_shuffle_outputs: bool,
    pub version: Option<u8>,
}

/// True when the copayer's recent proposals end in a streak of more than
/// `offset` rejections and the latest rejection is younger than the
/// back-off window. `recent` is newest-first and already filtered to the
/// copayer's published proposals.
fn backoff_applies(
    recent: &[&TxProposal],
    offset: usize,
    backoff_ms: u64,
    now: u64,
) -> bool {
    let window = &recent[..recent.len().min(BACKOFF_WINDOW_BASE + offset)];
    let mut consecutive = 0usize;
    let mut last_rejection_on = None;
    for txp in window {
        if txp.status != TxProposalStatus::Rejected {
            break;
        }
        consecutive += 1;
        if last_rejection_on.is_none() {
            last_rejection_on = txp
                .rejectors()
                .iter()
                .map(|a| a.created_on)
                .max()
                .or(Some(txp.created_on));
        }
    }
    if consecutive <= offset {
        return false;
    }
    let Some(last) = last_rejection_on else {
        return false;
    };
    now.saturating_sub(last) <= backoff_ms
}

impl Service {
    fn validate_outputs(
        &self,
        wallet: &Wallet,
        outputs: &[OutputOptions],
        send_max: bool,
    ) -> ServiceResult<()> {
        if outputs.is_empty() {
            return Err(ServiceError::BadRequest(
                "at least one output is required".to_owned(),
            ));
        }
        if send_max && outputs.len() != 1 {
            return Err(ServiceError::BadRequest(
                "sendMax requires exactly one output".to_owned(),
            ));
        }
        let dust = crate::defaults::MIN_OUTPUT_AMOUNT
            .max(crate::defaults::DUST_AMOUNT);
        for output in outputs {
            let parsed = output
                .to_address
                .parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()
                .map_err(|_| {
                    ServiceError::InvalidAddress(output.to_address.clone())
                })?;
            if !parsed.is_valid_for_network(wallet.network.to_bitcoin()) {
                return Err(ServiceError::IncorrectAddressNetwork);
            }
            if !send_max && output.amount < dust {
                return Err(ServiceError::DustAmount);
            }
        }
        Ok(())
    }

    fn check_backoff(
        &self,
        wallet_id: &str,
        copayer_id: &str,
        now: u64,
    ) -> ServiceResult<()> {
        let txps = self.storage.fetch_tx_proposals(wallet_id)?;
        let recent: Vec<&TxProposal> = txps
            .iter()
            .filter(|t| t.creator_id == copayer_id)
            .filter(|t| t.status != TxProposalStatus::Temporary)
            .collect();
        if backoff_applies(
            &recent,
            self.tunables.backoff_offset,
            self.tunables.backoff_time.as_millis() as u64,
            now,
        ) {
            return Err(ServiceError::TxCannotCreate(
                "too many consecutive rejections, try again later"
                    .to_owned(),
            ));
        }
        Ok(())
    }

    fn map_selection_error(
        err: coin_select::Error,
        locked_amount: u64,
        amount: u64,
        available_with_locked: u64,
    ) -> ServiceError {
        match err {
            coin_select::Error::InsufficientFunds => {
                if locked_amount > 0 && available_with_locked >= amount {
                    ServiceError::LockedFunds
                } else {
                    ServiceError::InsufficientFunds
                }
            }
            coin_select::Error::InsufficientFundsForFee => {
                ServiceError::InsufficientFundsForFee
            }
            coin_select::Error::TxMaxSizeExceeded => {
                ServiceError::TxMaxSizeExceeded
            }
        }
    }

    pub async fn create_tx(
        &self,
        authed: &AuthedRequest,
        mut opts: CreateTxOptions,
    ) -> ServiceResult<TxProposal> {
        let _guard = self
            .locks
            .acquire(&authed.wallet.id)
            .await
            .map_err(|_| ServiceError::WalletBusy)?;
        let mut wallet = self
            .storage
            .fetch_wallet(&authed.wallet.id)?
            .ok_or(ServiceError::WalletNotFound)?;
        if !wallet.is_complete() {
            return Err(ServiceError::WalletNotComplete);
        }
        let now = epoch_ms();

        let version = match opts.version {
            None => TxProposalVersion::V3,
            Some(v) => TxProposalVersion::try_from(v)
                .map_err(ServiceError::BadRequest)?,
        };
        self.validate_outputs(&wallet, &opts.outputs, opts.send_max)?;
        self.check_backoff(&wallet.id, &authed.copayer_id, now)?;

        let manual_inputs = opts.inputs.is_some();
        if manual_inputs && opts.fee.is_none() {
            return Err(ServiceError::BadRequest(
                "explicit inputs require an explicit fee".to_owned(),
            ));
        }
        let fee_per_kb = match opts.fee_per_kb {
            Some(rate) => {
                if rate < self.tunables.min_fee_per_kb
                    || rate > self.tunables.max_fee_per_kb
                {
                    return Err(ServiceError::BadRequest(
                        "invalid fee per KB".to_owned(),
                    ));
                }
                Some(rate)
            }
            None if !manual_inputs => {
                return Err(ServiceError::BadRequest(
                    "either feePerKb or inputs+fee is required".to_owned(),
                ));
            }
            None => None,
        };

        // Change address. Deriving advances the change chain, so this is
        // done before input selection only for wallets that get one.
        if wallet.single_address && opts.change_address.is_some() {
            return Err(ServiceError::TxCannotCreate(
                "change address cannot be specified on a single-address \
                 wallet"
                    .to_owned(),
            ));
        }
        let change_address = if opts.send_max {
            None
        } else if let Some(requested) = &opts.change_address {
            let address = self
                .storage
                .fetch_address(requested)?
                .filter(|a| a.wallet_id == wallet.id)
                .ok_or_else(|| {
                    ServiceError::InvalidAddress(requested.clone())
                })?;
            Some(address)
        } else {
            Some(
                self.derive_change_address(&mut wallet, opts.dry_run)
                    .await?,
            )
        };

        // Spendable coins.
        let all_utxos = {
            let addresses = self.storage.fetch_addresses(&wallet.id)?;
            self.utxos_for_addresses(&wallet, &addresses).await?
        };
        let excluded: std::collections::HashSet<&OutPointRef> =
            opts.utxos_to_exclude.iter().collect();
        let spendable: Vec<WalletUtxo> = all_utxos
            .iter()
            .filter(|u| !u.locked && !u.unsafe_to_spend)
            .filter(|u| {
                !excluded.contains(&OutPointRef {
                    txid: u.txid.clone(),
                    vout: u.vout,
                })
            })
            .filter(|u| {
                !opts.exclude_unconfirmed_utxos || u.confirmations > 0
            })
            .cloned()
            .collect();
        let locked_amount: u64 = all_utxos
            .iter()
            .filter(|u| u.locked && !u.unsafe_to_spend)
            .map(|u| u.satoshis)
            .sum();

        // Inputs and fee.
        let (inputs, fee): (Vec<TxInput>, u64) = if opts.send_max {
            let model = txbuilder::cost_model(
                &wallet,
                opts.outputs.len(),
                fee_per_kb.unwrap_or_default(),
            );
            let info = coin_select::send_max(
                &spendable,
                &model,
                &self.tunables,
                &mut rand::thread_rng(),
            );
            if info.amount == 0 {
                return Err(ServiceError::InsufficientFunds);
            }
            opts.outputs[0].amount = info.amount;
            (
                info.inputs.into_iter().map(TxInput::from).collect(),
                info.fee,
            )
        } else if let Some(refs) = &opts.inputs {
            let mut selected = vec![];
            for outpoint in refs {
                let utxo = spendable
                    .iter()
                    .find(|u| {
                        u.txid == outpoint.txid && u.vout == outpoint.vout
                    })
                    .ok_or(ServiceError::UnavailableUtxos)?;
                selected.push(TxInput::from(utxo.clone()));
            }
            let fee = opts.fee.unwrap_or_default();
            let amount: u64 = opts.outputs.iter().map(|o| o.amount).sum();
            let total: u64 = selected.iter().map(|i| i.satoshis).sum();
            if total < amount + fee {
                return Err(ServiceError::InsufficientFunds);
            }
            (selected, fee)
        } else {
            let amount: u64 = opts.outputs.iter().map(|o| o.amount).sum();
            let model = txbuilder::cost_model(
                &wallet,
                opts.outputs.len(),
                fee_per_kb.unwrap_or_default(),
            );
            let available_with_locked =
                spendable.iter().map(|u| u.satoshis).sum::<u64>()
                    + locked_amount;
            let selection = coin_select::select_inputs(
                &spendable,
                amount,
                &model,
                opts.exclude_unconfirmed_utxos,
                &self.tunables,
                &mut rand::thread_rng(),
            )
            .map_err(|err| {
                Self::map_selection_error(
                    err,
                    locked_amount,
                    amount,
                    available_with_locked,
                )
            })?;
            let fee = selection.fee;
            (
                selection.inputs.into_iter().map(TxInput::from).collect(),
                fee,
            )
        };

        if fee > crate::defaults::MAX_TX_FEE {
            return Err(ServiceError::TxCannotCreate(
                "fee exceeds the maximum allowed".to_owned(),
            ));
        }

        // outputs ++ [change]
        let slots = opts.outputs.len() + 1;
        let mut output_order: Vec<usize> = (0..slots).collect();
        if version.shuffles_outputs() && !opts.no_shuffle_outputs {
            use rand::seq::SliceRandom as _;
            output_order.shuffle(&mut rand::thread_rng());
        }

        let txp = TxProposal {
            id: opts
                .txp_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            wallet_id: wallet.id.clone(),
            creator_id: authed.copayer_id.clone(),
            creator_name: authed.copayer_name.clone(),
            version,
            network: wallet.network,
            outputs: opts
                .outputs
                .iter()
                .map(|o| TxOutput {
                    to_address: o.to_address.clone(),
                    amount: o.amount,
                    message: o.message.clone(),
                    script: None,
                })
                .collect(),
            output_order,
            change_address,
            inputs,
            fee,
            fee_per_kb,
            required_signatures: wallet.m,
            required_rejections: wallet.required_rejections(),
            status: TxProposalStatus::Temporary,
            actions: vec![],
            txid: None,
            broadcasted_on: None,
            message: opts.message.clone(),
            pay_pro_url: opts.pay_pro_url.clone(),
            custom_data: opts.custom_data.clone(),
            exclude_unconfirmed_utxos: opts.exclude_unconfirmed_utxos,
            created_on: now,
        };
        // A proposal that cannot be rendered to a raw transaction must
        // never be stored.
        let _raw = txbuilder::raw_tx_hex(&txp)?;

        if !opts.dry_run {
            self.storage.store_tx_proposal_new(&txp).map_err(|err| {
                if matches!(
                    err,
                    crate::storage::Error::DuplicateTxProposal { .. }
                ) {
                    ServiceError::TxCannotCreate(
                        "a proposal with this id already exists".to_owned(),
                    )
                } else {
                    err.into()
                }
            })?;
        }
        tracing::info!(wallet_id = %wallet.id, txp_id = %txp.id,
            amount = txp.amount(), fee = txp.fee, dry_run = opts.dry_run,
            "tx proposal created");
        Ok(txp)
    }

    /// Moves a temporary proposal to pending after verifying the creator's
    /// proposal signature and that its inputs are still free.
    pub async fn publish_tx(
        &self,
        authed: &AuthedRequest,
        txp_id: &str,
        proposal_signature: &str,
    ) -> ServiceResult<TxProposal> {
        let _guard = self
            .locks
            .acquire(&authed.wallet.id)
            .await
            .map_err(|_| ServiceError::WalletBusy)?;
        let mut txp = self
            .storage
            .fetch_tx_proposal(&authed.wallet.id, txp_id)?
            .ok_or(ServiceError::TxNotFound)?;
        if txp.creator_id != authed.copayer_id {
            return Err(ServiceError::NotAuthorized);
        }
        if txp.status != TxProposalStatus::Temporary {
            return Err(ServiceError::BadRequest(
                "tx proposal is already published".to_owned(),
            ));
        }

        let raw_hex = txbuilder::raw_tx_hex(&txp)?;
        let payload = txp.proposal_signing_payload(&raw_hex);
        let copayer = crate::service::auth::copayer_of(
            &authed.wallet,
            &authed.copayer_id,
        )?;
        let signed = copayer.request_pub_keys.iter().any(|k| {
            crate::service::auth::verify_message(
                &payload,
                proposal_signature,
                &k.key,
            )
        });
        if !signed {
            return Err(ServiceError::NotAuthorized);
        }

        // Another proposal may have reserved these coins since creation.
        let txps = self.storage.fetch_tx_proposals(&authed.wallet.id)?;
        let reserved = reserved_outpoints_of(&txps, Some(&txp.id));
        if txp
            .inputs
            .iter()
            .any(|i| reserved.contains(&(i.txid.clone(), i.vout)))
        {
            return Err(ServiceError::UnavailableUtxos);
        }

        txp.status = TxProposalStatus::Pending;
        self.storage.update_tx_proposal(&txp)?;
        self.notify(
            &txp.wallet_id,
            Some(&authed.copayer_id),
            NotificationType::NewTxProposal,
            serde_json::json!({
                "txProposalId": txp.id,
                "creatorId": txp.creator_id,
                "amount": txp.amount(),
                "message": txp.message,
            }),
            false,
        )?;
        Ok(txp)
    }

    /// Records an accept vote carrying one signature per input; assembles
    /// the final transaction when the threshold is reached.
    pub async fn sign_tx(
        &self,
        authed: &AuthedRequest,
        txp_id: &str,
        signatures: Vec<String>,
        xpub: Option<String>,
    ) -> ServiceResult<TxProposal> {
        let _guard = self
            .locks
            .acquire(&authed.wallet.id)
            .await
            .map_err(|_| ServiceError::WalletBusy)?;
        let mut txp = self
            .storage
            .fetch_tx_proposal(&authed.wallet.id, txp_id)?
            .ok_or(ServiceError::TxNotFound)?;
        if txp.action_by(&authed.copayer_id).is_some() {
            return Err(ServiceError::CopayerVoted);
        }
        if txp.status != TxProposalStatus::Pending {
            return Err(ServiceError::TxNotPending);
        }
        let copayer = crate::service::auth::copayer_of(
            &authed.wallet,
            &authed.copayer_id,
        )?;
        if let Some(xpub) = &xpub {
            if *xpub != copayer.xpub {
                return Err(ServiceError::BadSignatures);
            }
        }
        txbuilder::check_signatures(&txp, &signatures, &copayer.xpub)
            .map_err(|err| match err {
                crate::txbuilder::Error::SignatureCount
                | crate::txbuilder::Error::BadSignature { .. }
                | crate::txbuilder::Error::BadScript => {
                    ServiceError::BadSignatures
                }
                other => other.into(),
            })?;

        txp.push_action(TxProposalAction {
            copayer_id: authed.copayer_id.clone(),
            copayer_name: authed.copayer_name.clone(),
            action_type: TxProposalActionType::Accept,
            signatures: Some(signatures),
            xpub: Some(copayer.xpub.clone()),
            comment: None,
            created_on: epoch_ms(),
        });
        if txp.status == TxProposalStatus::Accepted {
            let (_tx, _hex, txid) = txbuilder::assemble_signed_tx(&txp)?;
            txp.txid = Some(txid);
        }
        self.storage.update_tx_proposal(&txp)?;

        self.notify(
            &txp.wallet_id,
            Some(&authed.copayer_id),
            NotificationType::TxProposalAcceptedBy,
            serde_json::json!({
                "txProposalId": txp.id,
                "copayerId": authed.copayer_id,
            }),
            false,
        )?;
        if txp.status == TxProposalStatus::Accepted {
            self.notify(
                &txp.wallet_id,
                None,
                NotificationType::TxProposalFinallyAccepted,
                serde_json::json!({
                    "txProposalId": txp.id,
                    "txid": txp.txid,
                }),
                true,
            )?;
        }
        Ok(txp)
    }

    pub async fn reject_tx(
        &self,
        authed: &AuthedRequest,
        txp_id: &str,
        comment: Option<String>,
    ) -> ServiceResult<TxProposal> {
        let _guard = self
            .locks
            .acquire(&authed.wallet.id)
            .await
            .map_err(|_| ServiceError::WalletBusy)?;
        let mut txp = self
            .storage
            .fetch_tx_proposal(&authed.wallet.id, txp_id)?
            .ok_or(ServiceError::TxNotFound)?;
        if txp.action_by(&authed.copayer_id).is_some() {
            return Err(ServiceError::CopayerVoted);
        }
        match txp.status {
            TxProposalStatus::Pending => {}
            // Votes on an already-accepted proposal are moot; the wallet
            // as a whole has spoken.
            TxProposalStatus::Accepted => {
                return Err(ServiceError::CopayerVoted);
            }
            _ => return Err(ServiceError::TxNotPending),
        }

        txp.push_action(TxProposalAction {
            copayer_id: authed.copayer_id.clone(),
            copayer_name: authed.copayer_name.clone(),
            action_type: TxProposalActionType::Reject,
            signatures: None,
            xpub: None,
            comment,
            created_on: epoch_ms(),
        });
        self.storage.update_tx_proposal(&txp)?;

        self.notify(
            &txp.wallet_id,
            Some(&authed.copayer_id),
            NotificationType::TxProposalRejectedBy,
            serde_json::json!({
                "txProposalId": txp.id,
                "copayerId": authed.copayer_id,
            }),
            false,
        )?;
        if txp.status == TxProposalStatus::Rejected {
            let rejected_by: Vec<serde_json::Value> = txp
                .rejectors()
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "copayerId": a.copayer_id,
                        "copayerName": a.copayer_name,
                    })
                })
                .collect();
            self.notify(
                &txp.wallet_id,
                None,
                NotificationType::TxProposalFinallyRejected,
                serde_json::json!({
                    "txProposalId": txp.id,
                    "rejectedBy": rejected_by,
                }),
                true,
            )?;
        }
        Ok(txp)
    }

    /// Pushes the assembled transaction to the explorer. If the explorer
    /// errors but already knows the transaction, someone else broadcast it
    /// first and that still counts.
    pub async fn broadcast_tx(
        &self,
        authed: &AuthedRequest,
        txp_id: &str,
    ) -> ServiceResult<TxProposal> {
        let _guard = self
            .locks
            .acquire(&authed.wallet.id)
            .await
            .map_err(|_| ServiceError::WalletBusy)?;
        let mut txp = self
            .storage
            .fetch_tx_proposal(&authed.wallet.id, txp_id)?
            .ok_or(ServiceError::TxNotFound)?;
        match txp.status {
            TxProposalStatus::Broadcasted => {
                return Err(ServiceError::TxAlreadyBroadcasted);
            }
            TxProposalStatus::Accepted => {}
            _ => return Err(ServiceError::TxNotAccepted),
        }

        let (_tx, raw_hex, txid) = txbuilder::assemble_signed_tx(&txp)?;
        let explorer = self.explorer(txp.network)?;
        let (notification_type, broadcast_err) =
            match explorer.broadcast(&raw_hex).await {
                Ok(_) => (NotificationType::NewOutgoingTx, None),
                Err(err) => {
                    match explorer.get_transaction(&txid).await? {
                        Some(_) => (
                            NotificationType::NewOutgoingTxByThirdParty,
                            None,
                        ),
                        None => (NotificationType::NewOutgoingTx, Some(err)),
                    }
                }
            };
        if let Some(err) = broadcast_err {
            return Err(err.into());
        }

        txp.status = TxProposalStatus::Broadcasted;
        txp.broadcasted_on = Some(epoch_ms());
        txp.txid = Some(txid.clone());
        self.storage.update_tx_proposal(&txp)?;
        self.notify(
            &txp.wallet_id,
            Some(&authed.copayer_id),
            notification_type,
            serde_json::json!({
                "txProposalId": txp.id,
                "txid": txid,
                "amount": txp.amount(),
            }),
            true,
        )?;
        Ok(txp)
    }

    /// Deletes a proposal. Unpublished drafts can be discarded by their
    /// creator freely; a published proposal only after the delete-lock
    /// window, and only while nobody else has acted on it.
    pub async fn remove_pending_tx(
        &self,
        authed: &AuthedRequest,
        txp_id: &str,
    ) -> ServiceResult<()> {
        let _guard = self
            .locks
            .acquire(&authed.wallet.id)
            .await
            .map_err(|_| ServiceError::WalletBusy)?;
        let txp = self
            .storage
            .fetch_tx_proposal(&authed.wallet.id, txp_id)?
            .ok_or(ServiceError::TxNotFound)?;
        if txp.creator_id != authed.copayer_id {
            return Err(ServiceError::TxCannotRemove(
                "only the creator can remove a tx proposal".to_owned(),
            ));
        }
        match txp.status {
            TxProposalStatus::Temporary => {}
            TxProposalStatus::Pending => {
                let others_acted = txp
                    .actions
                    .iter()
                    .any(|a| a.copayer_id != authed.copayer_id);
                if others_acted {
                    return Err(ServiceError::TxCannotRemove(
                        "other copayers have already acted on this \
                         proposal"
                            .to_owned(),
                    ));
                }
                let elapsed = epoch_ms().saturating_sub(txp.created_on);
                if elapsed
                    <= self.tunables.delete_locktime.as_millis() as u64
                {
                    return Err(ServiceError::TxCannotRemove(
                        "the delete lock time has not elapsed yet"
                            .to_owned(),
                    ));
                }
            }
            _ => {
                return Err(ServiceError::TxCannotRemove(
                    "tx proposal is finalized".to_owned(),
                ));
            }
        }
        self.storage.remove_tx_proposal(&txp.wallet_id, &txp.id)?;
        self.notify(
            &txp.wallet_id,
            Some(&authed.copayer_id),
            NotificationType::TxProposalRemoved,
            serde_json::json!({ "txProposalId": txp.id }),
            false,
        )?;
        Ok(())
    }

    pub fn get_tx(
        &self,
        authed: &AuthedRequest,
        txp_id: &str,
    ) -> ServiceResult<TxProposal> {
        self.storage
            .fetch_tx_proposal(&authed.wallet.id, txp_id)?
            .ok_or(ServiceError::TxNotFound)
    }

    /// Open proposals (pending or accepted), oldest first.
    pub fn get_pending_txs(
        &self,
        authed: &AuthedRequest,
    ) -> ServiceResult<Vec<TxProposal>> {
        let mut txps =
            self.storage.fetch_tx_proposals(&authed.wallet.id)?;
        txps.retain(TxProposal::reserves_inputs);
        txps.sort_by_key(|t| t.created_on);
        Ok(txps)
    }
}
