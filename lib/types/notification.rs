use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Format version mixed into notification dedup hashes.
const NOTIFICATION_VERSION: &str = "1.0.0";

/// Millisecond timestamps are zero-padded to this width in notification ids.
const EPOCH_WIDTH: usize = 14;
/// Per-process ticker suffix width; the ticker wraps at 10^4.
const TICKER_WIDTH: usize = 4;
const TICKER_MODULO: u64 = 10_000;

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
pub enum NotificationType {
    NewCopayer,
    WalletComplete,
    NewAddress,
    NewTxProposal,
    TxProposalAcceptedBy,
    TxProposalRejectedBy,
    TxProposalFinallyAccepted,
    TxProposalFinallyRejected,
    TxProposalRemoved,
    NewOutgoingTx,
    NewOutgoingTxByThirdParty,
    NewIncomingTx,
    NewBlock,
    BalanceUpdated,
    ScanFinished,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Notification {
    /// `zfill(epochMs, 14) ++ zfill(ticker, 4)`; sortable, strictly
    /// increasing per process.
    pub id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub data: serde_json::Value,
    /// The network name stands in as wallet id for global events.
    pub wallet_id: String,
    /// Absent on global notifications.
    pub creator_id: Option<String>,
    pub created_on: u64,
}

impl Notification {
    /// Dedup key component: retried producers hash to the same value for
    /// the same event. serde_json renders object keys sorted, so the JSON
    /// here is canonical.
    pub fn data_hash(
        notification_type: NotificationType,
        data: &serde_json::Value,
        wallet_id: &str,
    ) -> String {
        use bitcoin::hashes::{Hash as _, sha256d};
        let payload = format!(
            "{NOTIFICATION_VERSION}{notification_type}{}{wallet_id}",
            serde_json::to_string(data)
                .expect("json value serialization cannot fail"),
        );
        let digest = sha256d::Hash::hash(payload.as_bytes());
        hex::encode(digest.to_byte_array())
    }
}

/// Per-process monotonic notification id source. Ids embed the epoch-ms
/// timestamp plus a wrapping ticker; a stalled or rewound clock never
/// produces a non-increasing id because the last timestamp is sticky and
/// ticker wraparound advances it.
#[derive(Debug, Default)]
pub struct NotificationIdSource {
    state: Mutex<IdState>,
}

#[derive(Debug, Default)]
struct IdState {
    last_ms: u64,
    ticker: u64,
}

impl NotificationIdSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, now_ms: u64) -> String {
        let mut state = self.state.lock();
        if now_ms > state.last_ms {
            state.last_ms = now_ms;
        }
        let ticker = state.ticker;
        state.ticker = (state.ticker + 1) % TICKER_MODULO;
        if state.ticker == 0 {
            // Wrapped within one millisecond; move time forward instead of
            // reissuing a smaller id.
            state.last_ms += 1;
        }
        format!(
            "{:0epoch$}{:0ticker$}",
            state.last_ms,
            ticker,
            epoch = EPOCH_WIDTH,
            ticker = TICKER_WIDTH,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Notification, NotificationIdSource, NotificationType};

    #[test]
    fn ids_are_strictly_increasing() {
        let source = NotificationIdSource::new();
        let mut prev = source.next(1_000);
        for now in [1_000, 999, 1_001, 1_001, 2_000] {
            let next = source.next(now);
            assert!(next > prev, "{next} should sort after {prev}");
            prev = next;
        }
    }

    #[test]
    fn id_layout() {
        let source = NotificationIdSource::new();
        let id = source.next(1_234_567);
        assert_eq!(id.len(), 18);
        assert_eq!(&id[..14], "00000001234567");
        assert_eq!(&id[14..], "0000");
    }

    #[test]
    fn data_hash_is_stable_and_input_sensitive() {
        let data = serde_json::json!({"txid": "ab", "amount": 1});
        let h1 = Notification::data_hash(
            NotificationType::NewIncomingTx,
            &data,
            "w-1",
        );
        let h2 = Notification::data_hash(
            NotificationType::NewIncomingTx,
            &data,
            "w-1",
        );
        assert_eq!(h1, h2);
        let h3 = Notification::data_hash(
            NotificationType::NewIncomingTx,
            &data,
            "w-2",
        );
        assert_ne!(h1, h3);
        let h4 = Notification::data_hash(
            NotificationType::NewBlock,
            &data,
            "w-1",
        );
        assert_ne!(h1, h4);
    }
}
