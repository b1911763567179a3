//! Address derivation, the gap policy, and the branch scanner.

use serde::{Deserialize, Serialize};

use crate::{
    error::{ServiceError, ServiceResult},
    service::{AuthedRequest, Service},
    txbuilder,
    types::{
        Address, AddressManager, NotificationType, ScanStatus, Wallet,
        epoch_ms,
    },
};

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct CreateAddressOptions {
    /// Skip the main-address gap check (explicitly requested by clients
    /// that manage their own gap accounting).
    pub ignore_max_gap: bool,
}

/// Index of a path suffix like `m/0/7` or `m/2147483647/1/3`.
fn path_index(path: &str) -> u32 {
    path.rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn is_active(address: &Address) -> bool {
    address.has_activity || address.last_used_on.is_some()
}

impl Service {
    /// Derives the joint address at the next index of a chain, advancing
    /// the wallet's address manager.
    pub(crate) fn derive_address_entity(
        &self,
        wallet: &mut Wallet,
        is_change: bool,
    ) -> ServiceResult<Address> {
        let path = wallet.address_manager.next_path(is_change);
        self.derive_address_entity_at(wallet, &path, is_change)
    }

    pub(crate) fn derive_address_entity_at(
        &self,
        wallet: &Wallet,
        path: &str,
        is_change: bool,
    ) -> ServiceResult<Address> {
        let (address, public_keys) = txbuilder::derive_address(
            wallet.network,
            wallet.address_type,
            wallet.m,
            &wallet.xpubs(),
            path,
        )?;
        Ok(Address {
            address,
            wallet_id: wallet.id.clone(),
            path: path.to_owned(),
            public_keys,
            is_change,
            network: wallet.network,
            has_activity: false,
            last_used_on: None,
            created_on: epoch_ms(),
        })
    }

    /// Creates a new main (receive) address, enforcing the gap policy.
    pub async fn create_address(
        &self,
        authed: &AuthedRequest,
        opts: CreateAddressOptions,
    ) -> ServiceResult<Address> {
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

        let existing = self.storage.fetch_addresses(&wallet.id)?;
        let mut main: Vec<&Address> =
            existing.iter().filter(|a| !a.is_change).collect();
        main.sort_by_key(|a| path_index(&a.path));

        if wallet.single_address {
            if let Some(first) = main.first() {
                return Ok((*first).clone());
            }
        } else if !opts.ignore_max_gap {
            self.check_main_gap(&main).await?;
        }

        let address = self.derive_address_entity(&mut wallet, false)?;
        self.storage.store_addresses_with_wallet(
            &wallet,
            std::slice::from_ref(&address),
        )?;
        self.notify(
            &wallet.id,
            Some(&authed.copayer_id),
            NotificationType::NewAddress,
            serde_json::json!({ "address": address.address }),
            false,
        )?;
        Ok(address)
    }

    /// Denies derivation while the trailing gap window is all-inactive,
    /// unless the explorer reveals the latest address became active.
    async fn check_main_gap(&self, main: &[&Address]) -> ServiceResult<()> {
        let gap = self.tunables.max_main_address_gap as usize;
        if main.len() < gap {
            return Ok(());
        }
        let window = &main[main.len() - gap..];
        if window.iter().any(|a| is_active(a)) {
            return Ok(());
        }
        // Last chance: the newest window address may have received coins
        // the service has not observed yet.
        let latest = window[window.len() - 1];
        let explorer = self.explorer(latest.network)?;
        if explorer.get_address_activity(&latest.address).await? {
            let mut refreshed = latest.clone();
            refreshed.has_activity = true;
            self.storage.update_address(&refreshed)?;
            return Ok(());
        }
        Err(ServiceError::MainAddressGapReached)
    }

    pub fn list_addresses(
        &self,
        authed: &AuthedRequest,
        limit: Option<usize>,
        newest_first: bool,
    ) -> ServiceResult<Vec<Address>> {
        let mut addresses =
            self.storage.fetch_addresses(&authed.wallet.id)?;
        addresses.sort_by_key(|a| (a.is_change, path_index(&a.path)));
        if newest_first {
            addresses.reverse();
        }
        if let Some(limit) = limit {
            addresses.truncate(limit);
        }
        Ok(addresses)
    }

    /// Change address for a new proposal. Single-address wallets reuse
    /// their only main address; everyone else gets a fresh change chain
    /// index, persisted immediately so concurrent proposals never share a
    /// change path.
    pub(crate) async fn derive_change_address(
        &self,
        wallet: &mut Wallet,
        dry_run: bool,
    ) -> ServiceResult<Address> {
        if wallet.single_address {
            let existing = self.storage.fetch_addresses(&wallet.id)?;
            let mut main: Vec<Address> =
                existing.into_iter().filter(|a| !a.is_change).collect();
            main.sort_by_key(|a| path_index(&a.path));
            if let Some(first) = main.into_iter().next() {
                return Ok(first);
            }
        }
        let address = self.derive_address_entity(wallet, true)?;
        if !dry_run {
            self.storage.store_addresses_with_wallet(
                wallet,
                std::slice::from_ref(&address),
            )?;
        }
        Ok(address)
    }

    /// Starts the asynchronous branch scan. Progress is reported through
    /// the wallet's `scan_status` and a final `ScanFinished` notification.
    pub async fn start_scan(
        &self,
        authed: &AuthedRequest,
        include_copayer_branches: bool,
    ) -> ServiceResult<()> {
        {
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
            wallet.scan_status = Some(ScanStatus::Running);
            self.storage.store_wallet(&wallet)?;
        }
        let service = self.clone();
        let wallet_id = authed.wallet.id.clone();
        tokio::spawn(async move {
            let result =
                service.run_scan(&wallet_id, include_copayer_branches).await;
            let status = match &result {
                Ok(()) => ScanStatus::Success,
                Err(err) => {
                    tracing::error!(%wallet_id, %err, "wallet scan failed");
                    ScanStatus::Error
                }
            };
            if let Err(err) = service.finish_scan(&wallet_id, status) {
                tracing::error!(%wallet_id, %err, "failed to finalize scan");
            }
        });
        Ok(())
    }

    fn finish_scan(
        &self,
        wallet_id: &str,
        status: ScanStatus,
    ) -> ServiceResult<()> {
        if let Some(mut wallet) = self.storage.fetch_wallet(wallet_id)? {
            wallet.scan_status = Some(status);
            self.storage.store_wallet(&wallet)?;
        }
        self.storage.soft_reset_history_cache(wallet_id)?;
        self.notify(
            wallet_id,
            None,
            NotificationType::ScanFinished,
            serde_json::json!({
                "result": match status {
                    ScanStatus::Success => "success",
                    _ => "error",
                },
            }),
            false,
        )
    }

    async fn run_scan(
        &self,
        wallet_id: &str,
        include_copayer_branches: bool,
    ) -> ServiceResult<()> {
        let _guard = self
            .locks
            .acquire(wallet_id)
            .await
            .map_err(|_| ServiceError::WalletBusy)?;
        let mut wallet = self
            .storage
            .fetch_wallet(wallet_id)?
            .ok_or(ServiceError::WalletNotFound)?;

        let mut shared = wallet.address_manager.clone();
        for is_change in [false, true] {
            self.scan_branch(&wallet, &mut shared, is_change).await?;
        }
        wallet.address_manager = shared;

        if include_copayer_branches {
            let mut managers: Vec<(usize, AddressManager)> = wallet
                .copayers
                .iter()
                .enumerate()
                .filter_map(|(i, c)| {
                    c.address_manager.clone().map(|am| (i, am))
                })
                .collect();
            for (index, manager) in &mut managers {
                for is_change in [false, true] {
                    self.scan_branch(&wallet, manager, is_change).await?;
                }
                wallet.copayers[*index].address_manager =
                    Some(manager.clone());
            }
        }
        self.storage.store_wallet(&wallet)?;
        Ok(())
    }

    /// Derives ahead on one chain until a full gap window shows no
    /// activity, stores everything up to the last active index, and
    /// rewinds the unused tail.
    async fn scan_branch(
        &self,
        wallet: &Wallet,
        manager: &mut AddressManager,
        is_change: bool,
    ) -> ServiceResult<()> {
        let gap = self.tunables.scan_address_gap;
        let explorer = self.explorer(wallet.network)?;
        let mut derived: Vec<Address> = vec![];
        let mut inactive_streak: u32 = 0;
        while inactive_streak < gap {
            let path = manager.next_path(is_change);
            let mut address =
                self.derive_address_entity_at(wallet, &path, is_change)?;
            let active =
                explorer.get_address_activity(&address.address).await?;
            address.has_activity = active;
            derived.push(address);
            inactive_streak =
                if active { 0 } else { inactive_streak + 1 };
        }
        // Drop the trailing all-inactive window.
        manager.rewind(is_change, inactive_streak);
        derived.truncate(derived.len() - inactive_streak as usize);
        if !derived.is_empty() {
            self.storage.store_addresses_with_wallet(wallet, &derived)?;
        }
        Ok(())
    }
}
