//! Durable storage for every entity the service coordinates.
//!
//! One LMDB environment with typed databases. Compound writes (wallet plus
//! copayer lookup, address plus advanced wallet indexes) happen inside a
//! single write transaction so either everything persists or nothing does.

use std::{ops::Bound, path::Path};

use heed::{
    Database, RoTxn,
    types::{SerdeBincode, SerdeJson},
};
use serde::{Deserialize, Serialize};

use crate::{
    fees::FeeLevelsCacheEntry,
    service::history::TxHistoryCache,
    types::{
        Address, BlockchainTip, Network, Notification, Preferences,
        TxProposal, Wallet,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("heed error")]
    Heed(#[from] heed::Error),
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("tx proposal {txp_id} already exists in wallet {wallet_id}")]
    DuplicateTxProposal { wallet_id: String, txp_id: String },
    #[error("notification id {id} already exists in wallet {wallet_id}")]
    DuplicateNotificationId { wallet_id: String, id: String },
}

/// TTL lease backing the per-wallet lock.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LockLease {
    pub holder: String,
    pub expires_at: u64,
}

/// Addresses recently observed with activity, used by the two-step balance.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ActiveAddressesCache {
    pub addresses: Vec<String>,
    pub updated_on: u64,
}

#[derive(Clone)]
pub struct Storage {
    env: heed::Env,
    wallets: Database<SerdeBincode<String>, SerdeBincode<Wallet>>,
    /// copayer id -> wallet id
    copayer_lookup: Database<SerdeBincode<String>, SerdeBincode<String>>,
    /// (wallet id, address) -> address entity
    addresses: Database<SerdeBincode<(String, String)>, SerdeBincode<Address>>,
    /// address -> address entity, for monitor-side ownership lookups
    address_lookup: Database<SerdeBincode<String>, SerdeBincode<Address>>,
    /// (wallet id, proposal id) -> proposal
    txps: Database<SerdeBincode<(String, String)>, SerdeBincode<TxProposal>>,
    /// network txid -> (wallet id, proposal id), indexed once accepted
    txp_by_txid:
        Database<SerdeBincode<String>, SerdeBincode<(String, String)>>,
    /// (wallet id, notification id) -> notification; ids are fixed-width so
    /// iteration order within a wallet is chronological
    notifications:
        Database<SerdeBincode<(String, String)>, SerdeJson<Notification>>,
    /// dedup hash -> created_on
    notification_keys: Database<SerdeBincode<String>, SerdeBincode<u64>>,
    /// (wallet id, copayer id) -> preferences
    preferences:
        Database<SerdeBincode<(String, String)>, SerdeBincode<Preferences>>,
    tips: Database<SerdeBincode<Network>, SerdeBincode<BlockchainTip>>,
    history_cache: Database<SerdeBincode<String>, SerdeJson<TxHistoryCache>>,
    fee_levels:
        Database<SerdeBincode<Network>, SerdeBincode<FeeLevelsCacheEntry>>,
    active_addresses:
        Database<SerdeBincode<String>, SerdeBincode<ActiveAddressesCache>>,
    locks: Database<SerdeBincode<String>, SerdeBincode<LockLease>>,
}

impl Storage {
    pub const NUM_DBS: u32 = 14;

    const MAP_SIZE: usize = 1024 * 1024 * 1024; // 1GB

    pub fn new(path: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(path)?;
        let env = unsafe {
            heed::EnvOpenOptions::new()
                .map_size(Self::MAP_SIZE)
                .max_dbs(Self::NUM_DBS)
                .open(path)?
        };
        let mut rwtxn = env.write_txn()?;
        let wallets = env.create_database(&mut rwtxn, Some("wallets"))?;
        let copayer_lookup =
            env.create_database(&mut rwtxn, Some("copayer_lookup"))?;
        let addresses = env.create_database(&mut rwtxn, Some("addresses"))?;
        let address_lookup =
            env.create_database(&mut rwtxn, Some("address_lookup"))?;
        let txps = env.create_database(&mut rwtxn, Some("txps"))?;
        let txp_by_txid =
            env.create_database(&mut rwtxn, Some("txp_by_txid"))?;
        let notifications =
            env.create_database(&mut rwtxn, Some("notifications"))?;
        let notification_keys =
            env.create_database(&mut rwtxn, Some("notification_keys"))?;
        let preferences =
            env.create_database(&mut rwtxn, Some("preferences"))?;
        let tips = env.create_database(&mut rwtxn, Some("tips"))?;
        let history_cache =
            env.create_database(&mut rwtxn, Some("history_cache"))?;
        let fee_levels = env.create_database(&mut rwtxn, Some("fee_levels"))?;
        let active_addresses =
            env.create_database(&mut rwtxn, Some("active_addresses"))?;
        let locks = env.create_database(&mut rwtxn, Some("locks"))?;
        rwtxn.commit()?;
        Ok(Self {
            env,
            wallets,
            copayer_lookup,
            addresses,
            address_lookup,
            txps,
            txp_by_txid,
            notifications,
            notification_keys,
            preferences,
            tips,
            history_cache,
            fee_levels,
            active_addresses,
            locks,
        })
    }

    /// Collects every `(wallet_id, *)` entry of a composite-keyed database.
    fn collect_wallet_entries<V>(
        &self,
        rotxn: &RoTxn,
        db: Database<SerdeBincode<(String, String)>, SerdeBincode<V>>,
        wallet_id: &str,
    ) -> Result<Vec<V>, Error>
    where
        V: serde::de::DeserializeOwned + 'static,
    {
        let start = (wallet_id.to_owned(), String::new());
        let range = (Bound::Included(start), Bound::Unbounded);
        let mut res = vec![];
        for item in db.range(rotxn, &range)? {
            let ((wid, _), value) = item?;
            if wid != wallet_id {
                break;
            }
            res.push(value);
        }
        Ok(res)
    }

    // Wallets & copayers

    /// Stores the wallet and refreshes the copayer lookup index in one
    /// transaction.
    pub fn store_wallet(&self, wallet: &Wallet) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        self.wallets.put(&mut rwtxn, &wallet.id, wallet)?;
        for copayer in &wallet.copayers {
            self.copayer_lookup.put(&mut rwtxn, &copayer.id, &wallet.id)?;
        }
        rwtxn.commit()?;
        Ok(())
    }

    pub fn fetch_wallet(&self, wallet_id: &str) -> Result<Option<Wallet>, Error> {
        let rotxn = self.env.read_txn()?;
        Ok(self.wallets.get(&rotxn, &wallet_id.to_owned())?)
    }

    pub fn fetch_wallet_by_copayer(
        &self,
        copayer_id: &str,
    ) -> Result<Option<Wallet>, Error> {
        let rotxn = self.env.read_txn()?;
        let Some(wallet_id) =
            self.copayer_lookup.get(&rotxn, &copayer_id.to_owned())?
        else {
            return Ok(None);
        };
        Ok(self.wallets.get(&rotxn, &wallet_id)?)
    }

    pub fn fetch_all_wallets(&self) -> Result<Vec<Wallet>, Error> {
        let rotxn = self.env.read_txn()?;
        let mut res = vec![];
        for item in self.wallets.iter(&rotxn)? {
            let (_, wallet) = item?;
            res.push(wallet);
        }
        Ok(res)
    }

    // Addresses

    /// Persists a batch of freshly derived addresses together with the
    /// wallet whose address manager advanced to produce them.
    pub fn store_addresses_with_wallet(
        &self,
        wallet: &Wallet,
        addresses: &[Address],
    ) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        self.wallets.put(&mut rwtxn, &wallet.id, wallet)?;
        for address in addresses {
            let key = (wallet.id.clone(), address.address.clone());
            self.addresses.put(&mut rwtxn, &key, address)?;
            self.address_lookup
                .put(&mut rwtxn, &address.address, address)?;
        }
        rwtxn.commit()?;
        Ok(())
    }

    pub fn update_address(&self, address: &Address) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        let key = (address.wallet_id.clone(), address.address.clone());
        self.addresses.put(&mut rwtxn, &key, address)?;
        self.address_lookup
            .put(&mut rwtxn, &address.address, address)?;
        rwtxn.commit()?;
        Ok(())
    }

    pub fn fetch_addresses(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<Address>, Error> {
        let rotxn = self.env.read_txn()?;
        self.collect_wallet_entries(&rotxn, self.addresses, wallet_id)
    }

    /// Global ownership lookup used by the blockchain monitor.
    pub fn fetch_address(
        &self,
        address: &str,
    ) -> Result<Option<Address>, Error> {
        let rotxn = self.env.read_txn()?;
        Ok(self.address_lookup.get(&rotxn, &address.to_owned())?)
    }

    // Tx proposals

    /// First insert of a proposal. A client retrying a signed creation
    /// request must not silently produce a second proposal.
    pub fn store_tx_proposal_new(&self, txp: &TxProposal) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        let key = (txp.wallet_id.clone(), txp.id.clone());
        if self.txps.get(&rwtxn, &key)?.is_some() {
            return Err(Error::DuplicateTxProposal {
                wallet_id: txp.wallet_id.clone(),
                txp_id: txp.id.clone(),
            });
        }
        self.txps.put(&mut rwtxn, &key, txp)?;
        rwtxn.commit()?;
        Ok(())
    }

    pub fn update_tx_proposal(&self, txp: &TxProposal) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        let key = (txp.wallet_id.clone(), txp.id.clone());
        self.txps.put(&mut rwtxn, &key, txp)?;
        if let Some(txid) = &txp.txid {
            self.txp_by_txid.put(&mut rwtxn, txid, &key)?;
        }
        rwtxn.commit()?;
        Ok(())
    }

    pub fn remove_tx_proposal(
        &self,
        wallet_id: &str,
        txp_id: &str,
    ) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        let key = (wallet_id.to_owned(), txp_id.to_owned());
        if let Some(txp) = self.txps.get(&rwtxn, &key)? {
            if let Some(txid) = &txp.txid {
                self.txp_by_txid.delete(&mut rwtxn, txid)?;
            }
        }
        self.txps.delete(&mut rwtxn, &key)?;
        rwtxn.commit()?;
        Ok(())
    }

    pub fn fetch_tx_proposal(
        &self,
        wallet_id: &str,
        txp_id: &str,
    ) -> Result<Option<TxProposal>, Error> {
        let rotxn = self.env.read_txn()?;
        let key = (wallet_id.to_owned(), txp_id.to_owned());
        Ok(self.txps.get(&rotxn, &key)?)
    }

    pub fn fetch_tx_proposals(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<TxProposal>, Error> {
        let rotxn = self.env.read_txn()?;
        let mut txps =
            self.collect_wallet_entries(&rotxn, self.txps, wallet_id)?;
        // Newest first, the order every consumer wants.
        txps.sort_by(|a, b| b.created_on.cmp(&a.created_on));
        Ok(txps)
    }

    pub fn fetch_tx_proposal_by_txid(
        &self,
        txid: &str,
    ) -> Result<Option<TxProposal>, Error> {
        let rotxn = self.env.read_txn()?;
        let Some(key) = self.txp_by_txid.get(&rotxn, &txid.to_owned())? else {
            return Ok(None);
        };
        Ok(self.txps.get(&rotxn, &key)?)
    }

    // Notifications

    /// Stores a notification, enforcing id uniqueness within the wallet and
    /// dropping duplicates of an already-processed event when a dedup hash
    /// is supplied. Returns whether the notification was stored.
    pub fn store_notification(
        &self,
        notification: &Notification,
        dedup_hash: Option<&str>,
    ) -> Result<bool, Error> {
        let mut rwtxn = self.env.write_txn()?;
        if let Some(hash) = dedup_hash {
            let hash = hash.to_owned();
            if self.notification_keys.get(&rwtxn, &hash)?.is_some() {
                return Ok(false);
            }
            self.notification_keys
                .put(&mut rwtxn, &hash, &notification.created_on)?;
        }
        let key = (notification.wallet_id.clone(), notification.id.clone());
        if self.notifications.get(&rwtxn, &key)?.is_some() {
            return Err(Error::DuplicateNotificationId {
                wallet_id: notification.wallet_id.clone(),
                id: notification.id.clone(),
            });
        }
        self.notifications.put(&mut rwtxn, &key, notification)?;
        rwtxn.commit()?;
        Ok(true)
    }

    /// Notifications with `id > after`, in strict id order.
    pub fn fetch_notifications(
        &self,
        wallet_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Notification>, Error> {
        let rotxn = self.env.read_txn()?;
        let start = (wallet_id.to_owned(), String::new());
        let range = (Bound::Included(start), Bound::Unbounded);
        let mut res = vec![];
        for item in self.notifications.range(&rotxn, &range)? {
            let ((wid, id), notification) = item?;
            if wid != wallet_id {
                break;
            }
            if let Some(after) = after {
                if id.as_str() <= after {
                    continue;
                }
            }
            res.push(notification);
            if res.len() >= limit {
                break;
            }
        }
        Ok(res)
    }

    // Preferences

    pub fn store_preferences(
        &self,
        preferences: &Preferences,
    ) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        let key = (
            preferences.wallet_id.clone(),
            preferences.copayer_id.clone(),
        );
        self.preferences.put(&mut rwtxn, &key, preferences)?;
        rwtxn.commit()?;
        Ok(())
    }

    pub fn fetch_preferences(
        &self,
        wallet_id: &str,
        copayer_id: &str,
    ) -> Result<Option<Preferences>, Error> {
        let rotxn = self.env.read_txn()?;
        let key = (wallet_id.to_owned(), copayer_id.to_owned());
        Ok(self.preferences.get(&rotxn, &key)?)
    }

    // Blockchain tips

    pub fn fetch_tip(
        &self,
        network: Network,
    ) -> Result<Option<BlockchainTip>, Error> {
        let rotxn = self.env.read_txn()?;
        Ok(self.tips.get(&rotxn, &network)?)
    }

    pub fn store_tip(
        &self,
        network: Network,
        tip: &BlockchainTip,
    ) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        self.tips.put(&mut rwtxn, &network, tip)?;
        rwtxn.commit()?;
        Ok(())
    }

    // Tx history cache

    pub fn fetch_history_cache(
        &self,
        wallet_id: &str,
    ) -> Result<Option<TxHistoryCache>, Error> {
        let rotxn = self.env.read_txn()?;
        Ok(self.history_cache.get(&rotxn, &wallet_id.to_owned())?)
    }

    pub fn store_history_cache(
        &self,
        wallet_id: &str,
        cache: &TxHistoryCache,
    ) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        self.history_cache
            .put(&mut rwtxn, &wallet_id.to_owned(), cache)?;
        rwtxn.commit()?;
        Ok(())
    }

    /// Marks a wallet's history cache stale without dropping its contents.
    pub fn soft_reset_history_cache(
        &self,
        wallet_id: &str,
    ) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        let key = wallet_id.to_owned();
        if let Some(mut cache) = self.history_cache.get(&rwtxn, &key)? {
            cache.dirty = true;
            self.history_cache.put(&mut rwtxn, &key, &cache)?;
        }
        rwtxn.commit()?;
        Ok(())
    }

    pub fn soft_reset_all_history_caches(&self) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        let wallet_ids: Vec<String> = {
            let mut ids = vec![];
            for item in self.history_cache.iter(&rwtxn)? {
                let (wallet_id, _) = item?;
                ids.push(wallet_id);
            }
            ids
        };
        for wallet_id in wallet_ids {
            if let Some(mut cache) = self.history_cache.get(&rwtxn, &wallet_id)?
            {
                cache.dirty = true;
                self.history_cache.put(&mut rwtxn, &wallet_id, &cache)?;
            }
        }
        rwtxn.commit()?;
        Ok(())
    }

    // Fee levels cache

    pub fn fetch_fee_levels(
        &self,
        network: Network,
    ) -> Result<Option<FeeLevelsCacheEntry>, Error> {
        let rotxn = self.env.read_txn()?;
        Ok(self.fee_levels.get(&rotxn, &network)?)
    }

    pub fn store_fee_levels(
        &self,
        network: Network,
        entry: &FeeLevelsCacheEntry,
    ) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        self.fee_levels.put(&mut rwtxn, &network, entry)?;
        rwtxn.commit()?;
        Ok(())
    }

    // Active addresses cache

    pub fn fetch_active_addresses(
        &self,
        wallet_id: &str,
    ) -> Result<Option<ActiveAddressesCache>, Error> {
        let rotxn = self.env.read_txn()?;
        Ok(self.active_addresses.get(&rotxn, &wallet_id.to_owned())?)
    }

    pub fn store_active_addresses(
        &self,
        wallet_id: &str,
        cache: &ActiveAddressesCache,
    ) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        self.active_addresses
            .put(&mut rwtxn, &wallet_id.to_owned(), cache)?;
        rwtxn.commit()?;
        Ok(())
    }

    // Lock leases

    /// Check-and-set acquisition of the wallet lease. Succeeds when the
    /// wallet is unleased, the lease expired, or the caller already holds
    /// it (re-entrant renewal).
    pub fn try_acquire_lease(
        &self,
        wallet_id: &str,
        holder: &str,
        now: u64,
        ttl_ms: u64,
    ) -> Result<bool, Error> {
        let mut rwtxn = self.env.write_txn()?;
        let key = wallet_id.to_owned();
        if let Some(lease) = self.locks.get(&rwtxn, &key)? {
            if lease.holder != holder && lease.expires_at > now {
                return Ok(false);
            }
        }
        let lease = LockLease {
            holder: holder.to_owned(),
            expires_at: now + ttl_ms,
        };
        self.locks.put(&mut rwtxn, &key, &lease)?;
        rwtxn.commit()?;
        Ok(true)
    }

    pub fn release_lease(
        &self,
        wallet_id: &str,
        holder: &str,
    ) -> Result<(), Error> {
        let mut rwtxn = self.env.write_txn()?;
        let key = wallet_id.to_owned();
        if let Some(lease) = self.locks.get(&rwtxn, &key)? {
            if lease.holder == holder {
                self.locks.delete(&mut rwtxn, &key)?;
            }
        }
        rwtxn.commit()?;
        Ok(())
    }
}
