use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod notification;
pub mod txproposal;

pub use notification::{Notification, NotificationIdSource, NotificationType};
pub use txproposal::{
    TxInput, TxOutput, TxProposal, TxProposalAction, TxProposalActionType,
    TxProposalStatus, TxProposalVersion,
};

/// Cosigner branch used for shared address derivation under BIP45.
pub const SHARED_COSIGNER_INDEX: u32 = 0x7FFF_FFFF;

/// Seconds-precision timestamps are not enough to order notifications, so
/// everything in this crate carries epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Network {
    Livenet,
    Testnet,
}

impl Network {
    pub fn to_bitcoin(self) -> bitcoin::Network {
        match self {
            Self::Livenet => bitcoin::Network::Bitcoin,
            Self::Testnet => bitcoin::Network::Testnet,
        }
    }

    /// Single-character tag used in the shareable wallet secret.
    pub fn secret_char(self) -> char {
        match self {
            Self::Livenet => 'L',
            Self::Testnet => 'T',
        }
    }

    pub fn from_secret_char(c: char) -> Option<Self> {
        match c {
            'L' => Some(Self::Livenet),
            'T' => Some(Self::Testnet),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum DerivationStrategy {
    #[serde(rename = "BIP44")]
    Bip44,
    #[serde(rename = "BIP45")]
    Bip45,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum AddressType {
    #[serde(rename = "P2PKH")]
    P2pkh,
    #[serde(rename = "P2SH")]
    P2sh,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Success,
    Error,
}

/// Tracks the next unused index on the receive and change chains of a
/// derivation branch, and renders derivation path suffixes.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct AddressManager {
    pub derivation_strategy: DerivationStrategy,
    /// Cosigner branch for BIP45 paths. `None` renders BIP44-style
    /// two-component suffixes.
    pub copayer_index: Option<u32>,
    pub receive_index: u32,
    pub change_index: u32,
}

impl AddressManager {
    pub fn new(
        derivation_strategy: DerivationStrategy,
        copayer_index: Option<u32>,
    ) -> Self {
        Self {
            derivation_strategy,
            copayer_index,
            receive_index: 0,
            change_index: 0,
        }
    }

    pub fn path(&self, is_change: bool, index: u32) -> String {
        let chain = u32::from(is_change);
        match self.derivation_strategy {
            DerivationStrategy::Bip44 => format!("m/{chain}/{index}"),
            DerivationStrategy::Bip45 => {
                let cosigner =
                    self.copayer_index.unwrap_or(SHARED_COSIGNER_INDEX);
                format!("m/{cosigner}/{chain}/{index}")
            }
        }
    }

    /// Path at the next unused index, advancing the chain.
    pub fn next_path(&mut self, is_change: bool) -> String {
        let index = if is_change {
            let index = self.change_index;
            self.change_index += 1;
            index
        } else {
            let index = self.receive_index;
            self.receive_index += 1;
            index
        };
        self.path(is_change, index)
    }

    /// Path at the most recently derived index, without advancing.
    pub fn current_path(&self, is_change: bool) -> String {
        let index = if is_change {
            self.change_index.saturating_sub(1)
        } else {
            self.receive_index.saturating_sub(1)
        };
        self.path(is_change, index)
    }

    /// Drops the last `n` derived indexes of a chain, used to discard the
    /// unused tail after an address scan.
    pub fn rewind(&mut self, is_change: bool, n: u32) {
        if is_change {
            self.change_index = self.change_index.saturating_sub(n);
        } else {
            self.receive_index = self.receive_index.saturating_sub(n);
        }
    }
}

/// A request key a copayer may sign API calls with. The signature chains the
/// key back to the copayer's xpub via the request-key-auth derivation path.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct RequestPubKey {
    /// Hex-encoded compressed public key.
    pub key: String,
    /// Hex DER signature of `key` by the key derived from the copayer xpub
    /// at [`crate::service::auth::REQUEST_KEY_AUTH_PATH`].
    pub signature: String,
    pub name: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Copayer {
    /// sha256 of the xpub string, hex encoded.
    pub id: String,
    pub copayer_index: u32,
    pub name: String,
    pub xpub: String,
    pub request_pub_keys: Vec<RequestPubKey>,
    pub custom_data: Option<String>,
    /// Per-copayer receive/change chains, only under BIP44.
    pub address_manager: Option<AddressManager>,
    pub created_on: u64,
}

impl Copayer {
    pub fn id_from_xpub(xpub: &str) -> String {
        use bitcoin::hashes::{Hash as _, sha256};
        let digest = sha256::Hash::hash(xpub.as_bytes());
        hex::encode(digest.to_byte_array())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Wallet {
    pub id: String,
    pub name: String,
    pub m: usize,
    pub n: usize,
    pub network: Network,
    /// Hex compressed public key of the wallet secret. Join requests prove
    /// knowledge of the secret by signing with the matching private key.
    pub pub_key: String,
    pub derivation_strategy: DerivationStrategy,
    pub address_type: AddressType,
    pub single_address: bool,
    pub copayers: Vec<Copayer>,
    pub address_manager: AddressManager,
    pub scan_status: Option<ScanStatus>,
    pub created_on: u64,
}

impl Wallet {
    pub const MAX_COPAYERS: usize = 15;

    pub fn is_complete(&self) -> bool {
        self.copayers.len() == self.n
    }

    pub fn copayer(&self, copayer_id: &str) -> Option<&Copayer> {
        self.copayers.iter().find(|c| c.id == copayer_id)
    }

    /// Checks an m-of-n pair for structural validity.
    pub fn valid_m_n(m: usize, n: usize) -> bool {
        m >= 1 && m <= n && n <= Self::MAX_COPAYERS
    }

    /// Required reject votes for a proposal to become unboardcastable:
    /// enough that the remaining copayers can no longer reach `m` accepts.
    pub fn required_rejections(&self) -> usize {
        self.m.min(self.n - self.m + 1)
    }

    pub fn xpubs(&self) -> Vec<String> {
        self.copayers.iter().map(|c| c.xpub.clone()).collect()
    }
}

/// A derived wallet address, persisted so that ownership lookups and gap
/// accounting survive restarts.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Address {
    pub address: String,
    pub wallet_id: String,
    /// Derivation suffix relative to the copayer xpubs, e.g. `m/0/7`.
    pub path: String,
    /// Hex compressed public keys at `path`, one per copayer for P2SH.
    pub public_keys: Vec<String>,
    pub is_change: bool,
    pub network: Network,
    pub has_activity: bool,
    pub last_used_on: Option<u64>,
    pub created_on: u64,
}

/// A spendable coin as the wallet service sees it: the explorer's view
/// augmented with the wallet-side derivation info and reservation state.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WalletUtxo {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub script_pub_key: String,
    pub satoshis: u64,
    pub confirmations: u32,
    pub path: String,
    pub public_keys: Vec<String>,
    /// Reserved by a pending or accepted proposal.
    pub locked: bool,
    /// Unconfirmed and disqualified from selection (RBF taint or deep
    /// unconfirmed ancestry).
    pub unsafe_to_spend: bool,
}

impl WalletUtxo {
    pub fn outpoint(&self) -> (String, u32) {
        (self.txid.clone(), self.vout)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountUnit {
    Btc,
    Bit,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Preferences {
    pub wallet_id: String,
    pub copayer_id: String,
    pub email: Option<String>,
    /// ISO 639-1 two-letter code.
    pub language: Option<String>,
    pub unit: Option<AmountUnit>,
}

/// Most recently processed block hashes for one network, newest first.
/// Bounded by the re-org window.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BlockchainTip {
    pub hashes: Vec<String>,
    pub updated_on: u64,
}

impl BlockchainTip {
    pub fn push(&mut self, hash: String, max_depth: usize, now: u64) {
        self.hashes.insert(0, hash);
        self.hashes.truncate(max_depth);
        self.updated_on = now;
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.iter().any(|h| h == hash)
    }
}

#[derive(Debug, Error)]
pub enum WalletSecretError {
    #[error("malformed wallet secret")]
    Malformed,
    #[error("unknown network tag {0:?}")]
    UnknownNetwork(char),
    #[error("invalid private key: {0}")]
    InvalidKey(#[from] bitcoin::key::FromWifError),
}

/// The shareable string a wallet creator hands to prospective copayers:
/// `<walletId>:<walletPrivKeyWIF>:<networkChar>`.
#[derive(Clone, Debug, PartialEq)]
pub struct WalletSecret {
    pub wallet_id: String,
    pub wallet_priv_key: bitcoin::PrivateKey,
    pub network: Network,
}

impl fmt::Display for WalletSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.wallet_id,
            self.wallet_priv_key.to_wif(),
            self.network.secret_char()
        )
    }
}

impl FromStr for WalletSecret {
    type Err = WalletSecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let wallet_id = parts.next().ok_or(WalletSecretError::Malformed)?;
        let wif = parts.next().ok_or(WalletSecretError::Malformed)?;
        let network = parts.next().ok_or(WalletSecretError::Malformed)?;
        if parts.next().is_some() || wallet_id.is_empty() {
            return Err(WalletSecretError::Malformed);
        }
        let mut network_chars = network.chars();
        let (Some(network_char), None) =
            (network_chars.next(), network_chars.next())
        else {
            return Err(WalletSecretError::Malformed);
        };
        let network = Network::from_secret_char(network_char)
            .ok_or(WalletSecretError::UnknownNetwork(network_char))?;
        let wallet_priv_key = bitcoin::PrivateKey::from_wif(wif)?;
        Ok(Self {
            wallet_id: wallet_id.to_owned(),
            wallet_priv_key,
            network,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::{
        AddressManager, BlockchainTip, DerivationStrategy, Network, Wallet,
        WalletSecret,
    };

    #[test]
    fn address_manager_paths() {
        let mut bip44 = AddressManager::new(DerivationStrategy::Bip44, None);
        assert_eq!(bip44.next_path(false), "m/0/0");
        assert_eq!(bip44.next_path(false), "m/0/1");
        assert_eq!(bip44.next_path(true), "m/1/0");
        assert_eq!(bip44.current_path(false), "m/0/1");
        bip44.rewind(false, 1);
        assert_eq!(bip44.next_path(false), "m/0/1");

        let mut bip45 = AddressManager::new(DerivationStrategy::Bip45, None);
        assert_eq!(bip45.next_path(false), "m/2147483647/0/0");
        assert_eq!(bip45.next_path(true), "m/2147483647/1/0");
    }

    #[test]
    fn m_of_n_validity() {
        assert!(Wallet::valid_m_n(1, 1));
        assert!(Wallet::valid_m_n(2, 3));
        assert!(Wallet::valid_m_n(15, 15));
        assert!(!Wallet::valid_m_n(0, 1));
        assert!(!Wallet::valid_m_n(3, 2));
        assert!(!Wallet::valid_m_n(1, 16));
    }

    fn test_priv_key() -> bitcoin::PrivateKey {
        let secret =
            bitcoin::secp256k1::SecretKey::from_slice(&[0x11; 32]).unwrap();
        bitcoin::PrivateKey::new(secret, bitcoin::Network::Testnet)
    }

    #[test]
    fn wallet_secret_round_trip() {
        let secret = WalletSecret {
            wallet_id: "7bf24e30-4f9f-4b8c-b8d6-3c5b9f0e2a11".to_owned(),
            wallet_priv_key: test_priv_key(),
            network: Network::Testnet,
        };
        let encoded = secret.to_string();
        let decoded = WalletSecret::from_str(&encoded).unwrap();
        assert_eq!(decoded, secret);
        assert!(encoded.ends_with(":T"));
    }

    #[test]
    fn wallet_secret_rejects_garbage() {
        assert!(WalletSecret::from_str("nope").is_err());
        assert!(WalletSecret::from_str("id:notawif:L").is_err());
        let wif = test_priv_key().to_wif();
        assert!(WalletSecret::from_str(&format!("id:{wif}:X")).is_err());
        assert!(WalletSecret::from_str(&format!(":{wif}:L")).is_err());
    }

    #[test]
    fn tip_window_is_bounded() {
        let mut tip = BlockchainTip::default();
        for i in 0..10 {
            tip.push(format!("hash-{i}"), 5, i);
        }
        assert_eq!(tip.hashes.len(), 5);
        assert_eq!(tip.hashes[0], "hash-9");
        assert!(tip.contains("hash-5"));
        assert!(!tip.contains("hash-4"));
    }
}
