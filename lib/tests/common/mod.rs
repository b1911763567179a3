//! Shared fixture: an in-memory explorer fake and a service wired to a
//! temporary store, plus client-side signing helpers.

use std::{
    collections::{HashMap, HashSet},
    str::FromStr as _,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bitcoin::{
    bip32::{DerivationPath, Xpriv, Xpub},
    hashes::Hash as _,
    secp256k1::{Message, Secp256k1},
    sighash::{EcdsaSighashType, SighashCache},
};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use mws::{
    Locks, MessageBroker, Service, Storage,
    defaults::Tunables,
    explorer::{
        Error as ExplorerError, Explorer, ExplorerBlock, ExplorerEvent,
        ExplorerTx, ExplorerUtxo,
    },
    service::{
        AuthedRequest, CreateWalletOptions, JoinWalletOptions, auth,
    },
    txbuilder,
    types::{Network, TxProposal},
};

pub struct MockExplorer {
    pub utxos: Mutex<Vec<ExplorerUtxo>>,
    pub txs: Mutex<HashMap<String, ExplorerTx>>,
    pub blocks: Mutex<HashMap<String, ExplorerBlock>>,
    pub active_addresses: Mutex<HashSet<String>>,
    /// When set, `broadcast` fails with this message.
    pub broadcast_failure: Mutex<Option<String>>,
    pub broadcasts: Mutex<Vec<String>>,
    events: broadcast::Sender<ExplorerEvent>,
}

impl Default for MockExplorer {
    fn default() -> Self {
        let (events, _rx) = broadcast::channel(64);
        Self {
            utxos: Mutex::new(vec![]),
            txs: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
            active_addresses: Mutex::new(HashSet::new()),
            broadcast_failure: Mutex::new(None),
            broadcasts: Mutex::new(vec![]),
            events,
        }
    }
}

impl MockExplorer {
    pub fn fund(&self, address: &str, script_hex: &str, satoshis: u64, confirmations: u32) -> String {
        let txid = random_txid();
        self.utxos.lock().push(ExplorerUtxo {
            txid: txid.clone(),
            vout: 0,
            address: address.to_owned(),
            script_pub_key: script_hex.to_owned(),
            satoshis,
            confirmations,
        });
        txid
    }
}

#[async_trait]
impl Explorer for MockExplorer {
    async fn get_utxos(
        &self,
        addresses: &[String],
    ) -> Result<Vec<ExplorerUtxo>, ExplorerError> {
        let addresses: HashSet<&String> = addresses.iter().collect();
        Ok(self
            .utxos
            .lock()
            .iter()
            .filter(|u| addresses.contains(&u.address))
            .cloned()
            .collect())
    }

    async fn get_transaction(
        &self,
        txid: &str,
    ) -> Result<Option<ExplorerTx>, ExplorerError> {
        Ok(self.txs.lock().get(txid).cloned())
    }

    async fn get_transactions(
        &self,
        addresses: &[String],
        from: usize,
        to: usize,
    ) -> Result<Vec<ExplorerTx>, ExplorerError> {
        let addresses: HashSet<&str> =
            addresses.iter().map(String::as_str).collect();
        let txs: Vec<ExplorerTx> = self
            .txs
            .lock()
            .values()
            .filter(|tx| {
                tx.outputs.iter().any(|o| {
                    o.address
                        .as_deref()
                        .is_some_and(|a| addresses.contains(a))
                }) || tx.inputs.iter().any(|i| {
                    i.address
                        .as_deref()
                        .is_some_and(|a| addresses.contains(a))
                })
            })
            .cloned()
            .collect();
        Ok(txs.into_iter().skip(from).take(to - from).collect())
    }

    async fn get_address_activity(
        &self,
        address: &str,
    ) -> Result<bool, ExplorerError> {
        Ok(self.active_addresses.lock().contains(address))
    }

    async fn get_block(
        &self,
        hash: &str,
    ) -> Result<ExplorerBlock, ExplorerError> {
        self.blocks
            .lock()
            .get(hash)
            .cloned()
            .ok_or_else(|| ExplorerError::Status(404, "no block".to_owned()))
    }

    async fn estimate_fee(
        &self,
        nb_blocks: &[u32],
    ) -> Result<HashMap<u32, Option<u64>>, ExplorerError> {
        Ok(nb_blocks
            .iter()
            .map(|nb| (*nb, Some(10_000 / u64::from(*nb).max(1))))
            .collect())
    }

    async fn broadcast(
        &self,
        raw_tx_hex: &str,
    ) -> Result<String, ExplorerError> {
        if let Some(failure) = self.broadcast_failure.lock().clone() {
            return Err(ExplorerError::Rejected(failure));
        }
        self.broadcasts.lock().push(raw_tx_hex.to_owned());
        let tx: bitcoin::Transaction = bitcoin::consensus::encode::deserialize(
            &hex::decode(raw_tx_hex).expect("raw tx hex"),
        )
        .expect("raw tx decodes");
        Ok(tx.compute_txid().to_string())
    }

    fn subscribe(&self) -> broadcast::Receiver<ExplorerEvent> {
        self.events.subscribe()
    }
}

pub fn random_txid() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

pub struct TestCopayer {
    pub name: String,
    pub xpriv: Xpriv,
    pub request_priv: bitcoin::PrivateKey,
    pub request_pub: String,
}

impl TestCopayer {
    pub fn new(name: &str, seed: u8) -> Self {
        let secp = Secp256k1::new();
        let xpriv =
            Xpriv::new_master(bitcoin::Network::Testnet, &[seed; 32])
                .unwrap();
        let (request_secret, request_public) =
            secp.generate_keypair(&mut bitcoin::secp256k1::rand::thread_rng());
        Self {
            name: name.to_owned(),
            xpriv,
            request_priv: bitcoin::PrivateKey::new(
                request_secret,
                bitcoin::Network::Testnet,
            ),
            request_pub: request_public.to_string(),
        }
    }

    pub fn xpub(&self) -> String {
        let secp = Secp256k1::new();
        Xpub::from_priv(&secp, &self.xpriv).to_string()
    }

    /// One legacy SIGHASH_ALL signature per proposal input.
    pub fn sign_proposal_inputs(&self, txp: &TxProposal) -> Vec<String> {
        let secp = Secp256k1::new();
        let tx = txbuilder::build_unsigned_tx(txp).unwrap();
        let cache = SighashCache::new(&tx);
        txp.inputs
            .iter()
            .enumerate()
            .map(|(index, input)| {
                let path =
                    DerivationPath::from_str(&input.path).unwrap();
                let child = self.xpriv.derive_priv(&secp, &path).unwrap();
                let script = if input.public_keys.len() > 1 {
                    let keys: Vec<bitcoin::PublicKey> = input
                        .public_keys
                        .iter()
                        .map(|k| bitcoin::PublicKey::from_str(k).unwrap())
                        .collect();
                    txbuilder::multisig_redeem_script(
                        txp.required_signatures,
                        &keys,
                    )
                } else {
                    let public = bitcoin::PublicKey::new(
                        child.private_key.public_key(&secp),
                    );
                    bitcoin::ScriptBuf::new_p2pkh(&public.pubkey_hash())
                };
                let sighash = cache
                    .legacy_signature_hash(
                        index,
                        &script,
                        EcdsaSighashType::All.to_u32(),
                    )
                    .unwrap();
                let message =
                    Message::from_digest(sighash.to_byte_array());
                let signature =
                    secp.sign_ecdsa(&message, &child.private_key);
                hex::encode(signature.serialize_der())
            })
            .collect()
    }
}

pub struct Fixture {
    pub service: Service,
    pub explorer: Arc<MockExplorer>,
    pub wallet_id: String,
    pub copayers: Vec<TestCopayer>,
    pub copayer_ids: Vec<String>,
    pub wallet_priv: bitcoin::PrivateKey,
    _dir: tempfile::TempDir,
}

impl Fixture {
    /// A service with a complete m-of-n testnet wallet.
    pub async fn with_wallet(m: usize, n: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        // Keep lock waits short so failure tests stay fast.
        let tunables = Arc::new(Tunables {
            lock_acquire_timeout: Duration::from_secs(2),
            ..Tunables::default()
        });
        let locks = Locks::new(
            storage.clone(),
            tunables.lock_acquire_timeout,
            tunables.lock_ttl,
        );
        let broker = MessageBroker::default();
        let explorer = Arc::new(MockExplorer::default());
        let mut explorers: HashMap<Network, Arc<dyn Explorer>> =
            HashMap::new();
        explorers.insert(Network::Testnet, explorer.clone());
        let service = Service::new(
            storage,
            locks,
            broker,
            explorers,
            tunables,
        );

        let secp = Secp256k1::new();
        let (wallet_secret, wallet_public) =
            secp.generate_keypair(&mut bitcoin::secp256k1::rand::thread_rng());
        let wallet_priv = bitcoin::PrivateKey::new(
            wallet_secret,
            bitcoin::Network::Testnet,
        );
        let wallet_id = service
            .create_wallet(CreateWalletOptions {
                id: None,
                name: "shared".to_owned(),
                m,
                n,
                pub_key: wallet_public.to_string(),
                network: Network::Testnet,
                single_address: false,
                derivation_strategy: None,
                address_type: None,
            })
            .await
            .unwrap();

        let copayers: Vec<TestCopayer> = (0..n)
            .map(|i| TestCopayer::new(&format!("copayer-{i}"), 10 + i as u8))
            .collect();
        let mut copayer_ids = vec![];
        for copayer in &copayers {
            let xpub = copayer.xpub();
            let message = auth::join_message(
                &copayer.name,
                &xpub,
                &copayer.request_pub,
            );
            let result = service
                .join_wallet(
                    &wallet_id,
                    JoinWalletOptions {
                        name: copayer.name.clone(),
                        xpub,
                        request_pub_key: copayer.request_pub.clone(),
                        copayer_signature: auth::sign_message(
                            &message,
                            &wallet_priv,
                        ),
                        custom_data: None,
                        dry_run: false,
                    },
                )
                .await
                .unwrap();
            copayer_ids.push(result.copayer_id);
        }

        Self {
            service,
            explorer,
            wallet_id,
            copayers,
            copayer_ids,
            wallet_priv,
            _dir: dir,
        }
    }

    /// Fresh authenticated context for copayer `index`, against the
    /// current wallet state.
    pub fn authed(&self, index: usize) -> AuthedRequest {
        let wallet = self
            .service
            .storage
            .fetch_wallet(&self.wallet_id)
            .unwrap()
            .unwrap();
        AuthedRequest {
            copayer_id: self.copayer_ids[index].clone(),
            copayer_name: self.copayers[index].name.clone(),
            wallet,
        }
    }

    /// Derives a receive address and funds it with one UTXO.
    pub async fn fund(&self, satoshis: u64, confirmations: u32) -> String {
        let address = self
            .service
            .create_address(&self.authed(0), Default::default())
            .await
            .unwrap();
        let script_hex = address_script_hex(&address.address);
        self.explorer.fund(
            &address.address,
            &script_hex,
            satoshis,
            confirmations,
        )
    }
}

pub fn address_script_hex(address: &str) -> String {
    let parsed = address
        .parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()
        .unwrap()
        .assume_checked();
    hex::encode(parsed.script_pubkey().as_bytes())
}
