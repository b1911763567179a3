//! The wallet service: authenticated operations over wallets, copayers,
//! addresses, balances and tx proposals.
//!
//! [`Service`] is the explicit container for every collaborator handle;
//! it is constructed once at startup and cloned into request handlers and
//! background tasks. All wallet-mutating operations acquire the per-wallet
//! lock before touching storage.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    broker::MessageBroker,
    defaults::Tunables,
    error::{ServiceError, ServiceResult},
    explorer::Explorer,
    fees::{self, FeeLevelEstimate, FeeLevelsCacheEntry},
    locks::Locks,
    storage::Storage,
    types::{
        AddressManager, AddressType, AmountUnit, Copayer,
        DerivationStrategy, Network, Notification, NotificationIdSource,
        NotificationType, Preferences, TxProposal, TxProposalStatus, Wallet,
        epoch_ms,
    },
};

pub mod addresses;
pub mod auth;
pub mod balance;
pub mod history;
pub mod txproposals;

pub use addresses::CreateAddressOptions;
pub use auth::AuthedRequest;
pub use balance::Balance;
pub use txproposals::{CreateTxOptions, OutputOptions};

#[derive(Clone)]
pub struct Service {
    pub storage: Storage,
    pub locks: Locks,
    pub broker: MessageBroker,
    explorers: HashMap<Network, Arc<dyn Explorer>>,
    id_source: Arc<NotificationIdSource>,
    pub tunables: Arc<Tunables>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreateWalletOptions {
    /// Client-supplied id for idempotent retries; generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub m: usize,
    pub n: usize,
    /// Hex compressed public key of the wallet secret.
    pub pub_key: String,
    pub network: Network,
    pub single_address: bool,
    pub derivation_strategy: Option<DerivationStrategy>,
    pub address_type: Option<AddressType>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JoinWalletOptions {
    pub name: String,
    pub xpub: String,
    pub request_pub_key: String,
    /// Signature of `name|xpub|requestPubKey` by the wallet secret key.
    pub copayer_signature: String,
    pub custom_data: Option<String>,
    pub dry_run: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AddAccessOptions {
    pub copayer_id: String,
    pub request_pub_key: String,
    /// Signature of the new key by the copayer's request-key-auth key.
    pub signature: String,
    pub name: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct JoinWalletResult {
    pub copayer_id: String,
    pub wallet: Wallet,
}

#[derive(Clone, Debug, Serialize)]
pub struct WalletStatus {
    pub wallet: Wallet,
    pub balance: Balance,
    pub pending_tx_proposals: Vec<TxProposal>,
    pub preferences: Option<Preferences>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ServiceStats {
    pub wallets_total: usize,
    pub wallets_complete: usize,
    pub wallets_by_network: HashMap<String, usize>,
    pub txps_by_status: HashMap<String, usize>,
    pub amount_broadcasted: u64,
}

impl Service {
    pub fn new(
        storage: Storage,
        locks: Locks,
        broker: MessageBroker,
        explorers: HashMap<Network, Arc<dyn Explorer>>,
        tunables: Arc<Tunables>,
    ) -> Self {
        Self {
            storage,
            locks,
            broker,
            explorers,
            id_source: Arc::new(NotificationIdSource::new()),
            tunables,
        }
    }

    pub(crate) fn explorer(
        &self,
        network: Network,
    ) -> ServiceResult<Arc<dyn Explorer>> {
        self.explorers.get(&network).cloned().ok_or_else(|| {
            ServiceError::BadRequest(format!(
                "no explorer configured for {network}"
            ))
        })
    }

    /// Persists and publishes a notification. With `dedup`, a retried
    /// producer emitting the same event is silently dropped.
    pub(crate) fn notify(
        &self,
        wallet_id: &str,
        creator_id: Option<&str>,
        notification_type: NotificationType,
        data: serde_json::Value,
        dedup: bool,
    ) -> ServiceResult<()> {
        let hash = dedup
            .then(|| Notification::data_hash(notification_type, &data, wallet_id));
        let notification = Notification {
            id: self.id_source.next(epoch_ms()),
            notification_type,
            data,
            wallet_id: wallet_id.to_owned(),
            creator_id: creator_id.map(str::to_owned),
            created_on: epoch_ms(),
        };
        if self
            .storage
            .store_notification(&notification, hash.as_deref())?
        {
            self.broker.publish(&notification);
        }
        Ok(())
    }

    // Wallets

    pub async fn create_wallet(
        &self,
        opts: CreateWalletOptions,
    ) -> ServiceResult<String> {
        if opts.name.trim().is_empty() {
            return Err(ServiceError::BadRequest(
                "wallet name is required".to_owned(),
            ));
        }
        if !Wallet::valid_m_n(opts.m, opts.n) {
            return Err(ServiceError::InvalidMN);
        }
        if !is_valid_pub_key(&opts.pub_key) {
            return Err(ServiceError::BadRequest(
                "invalid wallet public key".to_owned(),
            ));
        }
        let derivation_strategy =
            opts.derivation_strategy.unwrap_or(DerivationStrategy::Bip45);
        let address_type = opts.address_type.unwrap_or(if opts.n == 1 {
            AddressType::P2pkh
        } else {
            AddressType::P2sh
        });
        if address_type == AddressType::P2pkh && opts.n > 1 {
            return Err(ServiceError::BadRequest(
                "P2PKH is only valid for 1-of-1 wallets".to_owned(),
            ));
        }

        let wallet_id = opts
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.storage.fetch_wallet(&wallet_id)?.is_some() {
            return Err(ServiceError::WalletAlreadyExists);
        }
        let wallet = Wallet {
            id: wallet_id.clone(),
            name: opts.name,
            m: opts.m,
            n: opts.n,
            network: opts.network,
            pub_key: opts.pub_key,
            derivation_strategy,
            address_type,
            single_address: opts.single_address,
            copayers: vec![],
            address_manager: AddressManager::new(derivation_strategy, None),
            scan_status: None,
            created_on: epoch_ms(),
        };
        self.storage.store_wallet(&wallet)?;
        tracing::info!(wallet_id = %wallet.id, m = wallet.m, n = wallet.n,
            network = %wallet.network, "wallet created");
        Ok(wallet_id)
    }

    pub async fn join_wallet(
        &self,
        wallet_id: &str,
        opts: JoinWalletOptions,
    ) -> ServiceResult<JoinWalletResult> {
        let _guard = self
            .locks
            .acquire(wallet_id)
            .await
            .map_err(|_| ServiceError::WalletBusy)?;
        let mut wallet = self
            .storage
            .fetch_wallet(wallet_id)?
            .ok_or(ServiceError::WalletNotFound)?;

        let message =
            auth::join_message(&opts.name, &opts.xpub, &opts.request_pub_key);
        if !auth::verify_message(
            &message,
            &opts.copayer_signature,
            &wallet.pub_key,
        ) {
            return Err(ServiceError::NotAuthorized);
        }
        if !is_valid_xpub(&opts.xpub) {
            return Err(ServiceError::BadRequest(
                "invalid extended public key".to_owned(),
            ));
        }
        let copayer_id = Copayer::id_from_xpub(&opts.xpub);
        if wallet.copayers.iter().any(|c| c.xpub == opts.xpub) {
            return Err(ServiceError::CopayerInWallet);
        }
        if self.storage.fetch_wallet_by_copayer(&copayer_id)?.is_some() {
            return Err(ServiceError::CopayerRegistered);
        }
        if wallet.copayers.len() >= wallet.n {
            return Err(ServiceError::WalletFull);
        }

        let copayer_index = wallet.copayers.len() as u32;
        let copayer = Copayer {
            id: copayer_id.clone(),
            copayer_index,
            name: opts.name,
            xpub: opts.xpub,
            request_pub_keys: vec![auth::primary_request_key(
                &opts.request_pub_key,
                &opts.copayer_signature,
            )],
            custom_data: opts.custom_data,
            // Cosigner branches only exist where the derivation scheme has
            // a per-copayer path component.
            address_manager: (wallet.derivation_strategy
                == DerivationStrategy::Bip45)
                .then(|| {
                    AddressManager::new(
                        wallet.derivation_strategy,
                        Some(copayer_index),
                    )
                }),
            created_on: epoch_ms(),
        };
        if opts.dry_run {
            return Ok(JoinWalletResult { copayer_id, wallet });
        }
        wallet.copayers.push(copayer);
        self.storage.store_wallet(&wallet)?;

        self.notify(
            &wallet.id,
            Some(&copayer_id),
            NotificationType::NewCopayer,
            serde_json::json!({
                "walletId": wallet.id,
                "copayerId": copayer_id,
                "copayerName": wallet.copayers.last().map(|c| c.name.clone()),
            }),
            false,
        )?;
        if wallet.is_complete() {
            self.notify(
                &wallet.id,
                None,
                NotificationType::WalletComplete,
                serde_json::json!({ "walletId": wallet.id }),
                true,
            )?;
        }
        tracing::info!(wallet_id = %wallet.id, %copayer_id,
            complete = wallet.is_complete(), "copayer joined");
        Ok(JoinWalletResult { copayer_id, wallet })
    }

    /// Registers an additional request key for a copayer. The request is
    /// authorized by the chain signature alone: a client that lost its
    /// request key must still be able to restore access.
    pub async fn add_access(
        &self,
        opts: AddAccessOptions,
    ) -> ServiceResult<()> {
        let wallet = self
            .storage
            .fetch_wallet_by_copayer(&opts.copayer_id)?
            .ok_or(ServiceError::NotAuthorized)?;
        let _guard = self
            .locks
            .acquire(&wallet.id)
            .await
            .map_err(|_| ServiceError::WalletBusy)?;
        let mut wallet = self
            .storage
            .fetch_wallet(&wallet.id)?
            .ok_or(ServiceError::WalletNotFound)?;
        let copayer = wallet
            .copayers
            .iter_mut()
            .find(|c| c.id == opts.copayer_id)
            .ok_or(ServiceError::NotAuthorized)?;
        if !auth::verify_request_pub_key(
            &opts.request_pub_key,
            &opts.signature,
            &copayer.xpub,
        ) {
            return Err(ServiceError::NotAuthorized);
        }
        if copayer.request_pub_keys.len() >= self.tunables.max_keys {
            return Err(ServiceError::TooManyKeys);
        }
        copayer.request_pub_keys.push(crate::types::RequestPubKey {
            key: opts.request_pub_key,
            signature: opts.signature,
            name: opts.name,
        });
        self.storage.store_wallet(&wallet)?;
        Ok(())
    }

    // Preferences

    pub fn get_preferences(
        &self,
        authed: &AuthedRequest,
    ) -> ServiceResult<Option<Preferences>> {
        Ok(self
            .storage
            .fetch_preferences(&authed.wallet.id, &authed.copayer_id)?)
    }

    pub fn save_preferences(
        &self,
        authed: &AuthedRequest,
        email: Option<String>,
        language: Option<String>,
        unit: Option<AmountUnit>,
    ) -> ServiceResult<Preferences> {
        if let Some(email) = &email {
            if !email.contains('@') {
                return Err(ServiceError::BadRequest(
                    "invalid email address".to_owned(),
                ));
            }
        }
        if let Some(language) = &language {
            if language.len() != 2 {
                return Err(ServiceError::BadRequest(
                    "language must be a two-letter code".to_owned(),
                ));
            }
        }
        let preferences = Preferences {
            wallet_id: authed.wallet.id.clone(),
            copayer_id: authed.copayer_id.clone(),
            email,
            language,
            unit,
        };
        self.storage.store_preferences(&preferences)?;
        Ok(preferences)
    }

    // Status & notifications

    pub async fn get_status(
        &self,
        authed: &AuthedRequest,
    ) -> ServiceResult<WalletStatus> {
        let balance = self.get_balance(authed, false).await?;
        let pending_tx_proposals = self.get_pending_txs(authed)?;
        let preferences = self.get_preferences(authed)?;
        Ok(WalletStatus {
            wallet: authed.wallet.clone(),
            balance,
            pending_tx_proposals,
            preferences,
        })
    }

    /// Wallet-scoped plus network-global notifications after a cursor, in
    /// strict id order.
    pub fn get_notifications(
        &self,
        authed: &AuthedRequest,
        after: Option<&str>,
        limit: usize,
    ) -> ServiceResult<Vec<Notification>> {
        let mut notifications = self.storage.fetch_notifications(
            &authed.wallet.id,
            after,
            limit,
        )?;
        let global = self.storage.fetch_notifications(
            &authed.wallet.network.to_string(),
            after,
            limit,
        )?;
        notifications.extend(global);
        notifications.sort_by(|a, b| a.id.cmp(&b.id));
        notifications.truncate(limit);
        Ok(notifications)
    }

    // Fee levels

    pub async fn get_fee_levels(
        &self,
        network: Network,
    ) -> ServiceResult<Vec<FeeLevelEstimate>> {
        let now = epoch_ms();
        let cached = self.storage.fetch_fee_levels(network)?;
        if let Some(entry) = &cached {
            let age = now.saturating_sub(entry.computed_on);
            if age < self.tunables.fee_levels_cache_duration.as_millis() as u64
            {
                return Ok(entry.levels.clone());
            }
        }
        let explorer = self.explorer(network)?;
        match fees::sample_levels(
            explorer.as_ref(),
            self.tunables.max_fee_per_kb,
        )
        .await
        {
            Ok(levels) => {
                let entry = FeeLevelsCacheEntry {
                    levels: levels.clone(),
                    computed_on: now,
                };
                self.storage.store_fee_levels(network, &entry)?;
                Ok(levels)
            }
            Err(err) => {
                // A stale sample beats no answer.
                if let Some(entry) = cached {
                    tracing::warn!(%network, %err,
                        "fee estimation failed, serving stale levels");
                    return Ok(entry.levels);
                }
                Err(err.into())
            }
        }
    }

    // Stats

    pub fn get_stats(&self) -> ServiceResult<ServiceStats> {
        let mut stats = ServiceStats::default();
        for wallet in self.storage.fetch_all_wallets()? {
            stats.wallets_total += 1;
            if wallet.is_complete() {
                stats.wallets_complete += 1;
            }
            *stats
                .wallets_by_network
                .entry(wallet.network.to_string())
                .or_default() += 1;
            for txp in self.storage.fetch_tx_proposals(&wallet.id)? {
                let status = match txp.status {
                    TxProposalStatus::Temporary => "temporary",
                    TxProposalStatus::Pending => "pending",
                    TxProposalStatus::Accepted => "accepted",
                    TxProposalStatus::Rejected => "rejected",
                    TxProposalStatus::Broadcasted => "broadcasted",
                };
                *stats.txps_by_status.entry(status.to_owned()).or_default() +=
                    1;
                if txp.status == TxProposalStatus::Broadcasted {
                    stats.amount_broadcasted += txp.amount();
                }
            }
        }
        Ok(stats)
    }
}

fn is_valid_pub_key(pub_key: &str) -> bool {
    use std::str::FromStr as _;
    bitcoin::secp256k1::PublicKey::from_str(pub_key).is_ok()
}

fn is_valid_xpub(xpub: &str) -> bool {
    use std::str::FromStr as _;
    bitcoin::bip32::Xpub::from_str(xpub).is_ok()
}
