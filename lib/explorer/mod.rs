//! The blockchain-explorer collaborator.
//!
//! The service never speaks the Bitcoin wire protocol; everything on-chain
//! comes through this trait. The production implementation is the HTTP
//! client in [`http`]; tests drive the service with an in-memory fake.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub mod http;

pub use http::HttpExplorer;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected status {0}: {1}")]
    Status(u16, String),
    #[error("malformed response: {0}")]
    Parse(String),
    #[error("explorer rejected the request: {0}")]
    Rejected(String),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExplorerUtxo {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub script_pub_key: String,
    pub satoshis: u64,
    pub confirmations: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExplorerTxInput {
    /// Absent on coinbase inputs.
    pub txid: Option<String>,
    pub vout: u32,
    pub sequence: u32,
    /// Address of the spent output, when the explorer can decode it.
    pub address: Option<String>,
    pub satoshis: Option<u64>,
}

impl ExplorerTxInput {
    /// BIP125: any sequence below 0xFFFFFFFE signals replaceability.
    pub fn signals_rbf(&self) -> bool {
        self.sequence < 0xFFFF_FFFE
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExplorerTxOutput {
    /// Absent for non-standard scripts the explorer cannot decode.
    pub address: Option<String>,
    pub satoshis: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExplorerTx {
    pub txid: String,
    pub inputs: Vec<ExplorerTxInput>,
    pub outputs: Vec<ExplorerTxOutput>,
    pub confirmations: u32,
    pub block_hash: Option<String>,
    pub time: Option<u64>,
    pub fees: Option<u64>,
}

impl ExplorerTx {
    pub fn signals_rbf(&self) -> bool {
        self.inputs.iter().any(ExplorerTxInput::signals_rbf)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExplorerBlock {
    pub hash: String,
    pub prev_hash: Option<String>,
    pub height: u32,
    pub txs: Vec<ExplorerTx>,
}

/// Events from the explorer's live feed.
#[derive(Clone, Debug)]
pub enum ExplorerEvent {
    Connect,
    ConnectError(String),
    /// Mempool arrival.
    Tx(ExplorerTx),
    /// New tip, by block hash.
    Block(String),
}

#[async_trait::async_trait]
pub trait Explorer: Send + Sync {
    async fn get_utxos(
        &self,
        addresses: &[String],
    ) -> Result<Vec<ExplorerUtxo>, Error>;

    async fn get_transaction(
        &self,
        txid: &str,
    ) -> Result<Option<ExplorerTx>, Error>;

    /// Transactions involving any of `addresses`, newest first, paginated
    /// by the half-open item range `[from, to)`.
    async fn get_transactions(
        &self,
        addresses: &[String],
        from: usize,
        to: usize,
    ) -> Result<Vec<ExplorerTx>, Error>;

    async fn get_address_activity(&self, address: &str)
    -> Result<bool, Error>;

    async fn get_block(&self, hash: &str) -> Result<ExplorerBlock, Error>;

    /// sat/kB per confirmation target; `None` when the explorer has no
    /// estimate for a target.
    async fn estimate_fee(
        &self,
        nb_blocks: &[u32],
    ) -> Result<HashMap<u32, Option<u64>>, Error>;

    /// Returns the txid of the broadcast transaction.
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<String, Error>;

    /// Live feed of mempool and tip events.
    fn subscribe(&self) -> broadcast::Receiver<ExplorerEvent>;
}
