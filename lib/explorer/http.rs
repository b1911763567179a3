//! Insight-style HTTP explorer client.
//!
//! Reads go through `reqwest` with bounded retries on transport errors.
//! The live feed is a tip poller: it emits `Connect` once reachable and a
//! `Block` event per new tip. Mempool `Tx` events come from the explorer's
//! push socket, which this poller does not consume; incoming transactions
//! are therefore recognized at confirmation time, which is also the
//! canonical behavior for replaceable transactions.

use std::{collections::HashMap, time::Duration};

use futures::StreamExt as _;
use serde::Deserialize;
use tokio::sync::broadcast;

use super::{
    Error, Explorer, ExplorerBlock, ExplorerEvent, ExplorerTx,
    ExplorerTxInput, ExplorerTxOutput,
};

const DEFAULT_MAX_RETRIES: u8 = 3;
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1_000);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Concurrent tx fetches when expanding a block.
const BLOCK_TX_FETCH_PARALLELISM: usize = 8;

#[derive(Clone, Debug)]
pub struct HttpExplorerConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub max_retries: u8,
    pub retry_interval: Duration,
}

impl HttpExplorerConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

#[derive(Clone)]
pub struct HttpExplorer {
    base_url: String,
    client: reqwest::Client,
    max_retries: u8,
    retry_interval: Duration,
    poll_interval: Duration,
    events: broadcast::Sender<ExplorerEvent>,
}

// Wire DTOs. Field names follow the insight REST API.

#[derive(Debug, Deserialize)]
struct WireUtxo {
    txid: String,
    vout: u32,
    address: String,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: String,
    satoshis: u64,
    #[serde(default)]
    confirmations: u32,
}

#[derive(Debug, Deserialize)]
struct WireTxInput {
    txid: Option<String>,
    #[serde(default)]
    vout: u32,
    #[serde(default = "max_sequence")]
    sequence: u32,
    addr: Option<String>,
    #[serde(rename = "valueSat")]
    value_sat: Option<u64>,
}

fn max_sequence() -> u32 {
    u32::MAX
}

#[derive(Debug, Deserialize)]
struct WireScriptPubKey {
    #[serde(default)]
    addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireTxOutput {
    #[serde(rename = "valueSat")]
    value_sat: u64,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: Option<WireScriptPubKey>,
}

#[derive(Debug, Deserialize)]
struct WireTx {
    txid: String,
    #[serde(default)]
    vin: Vec<WireTxInput>,
    #[serde(default)]
    vout: Vec<WireTxOutput>,
    #[serde(default)]
    confirmations: u32,
    #[serde(rename = "blockhash")]
    block_hash: Option<String>,
    time: Option<u64>,
    /// BTC, as insight reports it.
    fees: Option<f64>,
}

impl From<WireTx> for ExplorerTx {
    fn from(tx: WireTx) -> Self {
        Self {
            txid: tx.txid,
            inputs: tx
                .vin
                .into_iter()
                .map(|i| ExplorerTxInput {
                    txid: i.txid,
                    vout: i.vout,
                    sequence: i.sequence,
                    address: i.addr,
                    satoshis: i.value_sat,
                })
                .collect(),
            outputs: tx
                .vout
                .into_iter()
                .map(|o| ExplorerTxOutput {
                    address: o
                        .script_pub_key
                        .and_then(|s| s.addresses.into_iter().next()),
                    satoshis: o.value_sat,
                })
                .collect(),
            confirmations: tx.confirmations,
            block_hash: tx.block_hash,
            time: tx.time,
            fees: tx.fees.map(btc_to_sats),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireTxPage {
    #[serde(default)]
    items: Vec<WireTx>,
}

#[derive(Debug, Deserialize)]
struct WireAddressInfo {
    #[serde(rename = "txApperances", default)]
    tx_appearances: u64,
    #[serde(rename = "unconfirmedTxApperances", default)]
    unconfirmed_tx_appearances: u64,
}

#[derive(Debug, Deserialize)]
struct WireBlock {
    hash: String,
    #[serde(rename = "previousblockhash")]
    previous_block_hash: Option<String>,
    height: u32,
    #[serde(default)]
    tx: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    #[serde(rename = "lastblockhash")]
    last_block_hash: String,
}

#[derive(Debug, Deserialize)]
struct WireBroadcastResult {
    txid: String,
}

fn btc_to_sats(btc: f64) -> u64 {
    (btc * 100_000_000.0).round().max(0.0) as u64
}

impl HttpExplorer {
    pub fn new(config: HttpExplorerConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| Error::Connection(err.to_string()))?;
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            client,
            max_retries: config.max_retries,
            retry_interval: config.retry_interval,
            poll_interval: config.poll_interval,
            events,
        })
    }

    fn classify(err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout
        } else if err.is_connect() {
            Error::Connection(err.to_string())
        } else if err.is_decode() {
            Error::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            Error::Status(status.as_u16(), err.to_string())
        } else {
            Error::Connection(err.to_string())
        }
    }

    fn retryable(err: &Error) -> bool {
        matches!(err, Error::Connection(_) | Error::Timeout)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, Error> {
        let url = format!("{}{path}", self.base_url);
        let mut retries = 0;
        loop {
            let attempt = async {
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(Self::classify)?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(Error::Status(status.as_u16(), body));
                }
                response.json::<T>().await.map_err(Self::classify)
            };
            match attempt.await {
                Ok(value) => return Ok(value),
                Err(err)
                    if Self::retryable(&err) && retries < self.max_retries =>
                {
                    retries += 1;
                    tracing::warn!(%url, %err, retries, "retrying explorer request");
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Spawns the tip poller feeding [`Explorer::subscribe`] receivers.
    /// The caller owns the handle; aborting it stops the feed.
    pub fn start_polling(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut last_hash: Option<String> = None;
            let mut connected = false;
            loop {
                match this
                    .get_json::<WireStatus>("/status?q=getLastBlockHash")
                    .await
                {
                    Ok(status) => {
                        if !connected {
                            connected = true;
                            drop(this.events.send(ExplorerEvent::Connect));
                        }
                        if last_hash.as_deref()
                            != Some(status.last_block_hash.as_str())
                        {
                            if last_hash.is_some() {
                                drop(this.events.send(ExplorerEvent::Block(
                                    status.last_block_hash.clone(),
                                )));
                            }
                            last_hash = Some(status.last_block_hash);
                        }
                    }
                    Err(err) => {
                        connected = false;
                        drop(
                            this.events
                                .send(ExplorerEvent::ConnectError(err.to_string())),
                        );
                        tracing::warn!(%err, "explorer tip poll failed");
                    }
                }
                tokio::time::sleep(this.poll_interval).await;
            }
        })
    }
}

#[async_trait::async_trait]
impl Explorer for HttpExplorer {
    async fn get_utxos(
        &self,
        addresses: &[String],
    ) -> Result<Vec<super::ExplorerUtxo>, Error> {
        if addresses.is_empty() {
            return Ok(vec![]);
        }
        let joined = addresses.join(",");
        let utxos: Vec<WireUtxo> =
            self.get_json(&format!("/addrs/{joined}/utxo")).await?;
        Ok(utxos
            .into_iter()
            .map(|u| super::ExplorerUtxo {
                txid: u.txid,
                vout: u.vout,
                address: u.address,
                script_pub_key: u.script_pub_key,
                satoshis: u.satoshis,
                confirmations: u.confirmations,
            })
            .collect())
    }

    async fn get_transaction(
        &self,
        txid: &str,
    ) -> Result<Option<ExplorerTx>, Error> {
        match self.get_json::<WireTx>(&format!("/tx/{txid}")).await {
            Ok(tx) => Ok(Some(tx.into())),
            Err(Error::Status(404, _)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn get_transactions(
        &self,
        addresses: &[String],
        from: usize,
        to: usize,
    ) -> Result<Vec<ExplorerTx>, Error> {
        if addresses.is_empty() {
            return Ok(vec![]);
        }
        let joined = addresses.join(",");
        let page: WireTxPage = self
            .get_json(&format!("/addrs/{joined}/txs?from={from}&to={to}"))
            .await?;
        Ok(page.items.into_iter().map(ExplorerTx::from).collect())
    }

    async fn get_address_activity(
        &self,
        address: &str,
    ) -> Result<bool, Error> {
        let info: WireAddressInfo = self
            .get_json(&format!("/addr/{address}?noTxList=1"))
            .await?;
        Ok(info.tx_appearances + info.unconfirmed_tx_appearances > 0)
    }

    async fn get_block(&self, hash: &str) -> Result<ExplorerBlock, Error> {
        let block: WireBlock =
            self.get_json(&format!("/block/{hash}")).await?;
        let txs: Vec<ExplorerTx> = futures::stream::iter(block.tx.clone())
            .map(|txid| async move { self.get_transaction(&txid).await })
            .buffered(BLOCK_TX_FETCH_PARALLELISM)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<Option<ExplorerTx>>, Error>>()?
            .into_iter()
            .flatten()
            .collect();
        Ok(ExplorerBlock {
            hash: block.hash,
            prev_hash: block.previous_block_hash,
            height: block.height,
            txs,
        })
    }

    async fn estimate_fee(
        &self,
        nb_blocks: &[u32],
    ) -> Result<HashMap<u32, Option<u64>>, Error> {
        let targets = nb_blocks
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        // Insight reports BTC/kB; a negative value means "no estimate".
        let estimates: HashMap<String, f64> = self
            .get_json(&format!("/utils/estimatefee?nbBlocks={targets}"))
            .await?;
        let mut res = HashMap::new();
        for nb in nb_blocks {
            let estimate = estimates.get(&nb.to_string()).copied();
            res.insert(
                *nb,
                estimate.filter(|v| *v >= 0.0).map(btc_to_sats),
            );
        }
        Ok(res)
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> Result<String, Error> {
        let url = format!("{}/tx/send", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "rawtx": raw_tx_hex }))
            .send()
            .await
            .map_err(Self::classify)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Rejected(body));
        }
        let result: WireBroadcastResult =
            response.json().await.map_err(Self::classify)?;
        Ok(result.txid)
    }

    fn subscribe(&self) -> broadcast::Receiver<ExplorerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::btc_to_sats;

    #[test]
    fn btc_conversion() {
        assert_eq!(btc_to_sats(0.0001), 10_000);
        assert_eq!(btc_to_sats(1.0), 100_000_000);
        assert_eq!(btc_to_sats(-0.1), 0);
    }
}
