//! Wire types of the HTTP API.
//!
//! Request envelopes, query parameters and the error body shared between
//! the server and external clients. Entity payloads reuse the library
//! types directly; everything here is the thin layer around them.

use mws::{
    service::{
        AddAccessOptions, CreateTxOptions, CreateWalletOptions,
        JoinWalletOptions,
    },
    types::{AmountUnit, Network},
};
use serde::{Deserialize, Serialize};

/// Copayer identity header.
pub const HEADER_IDENTITY: &str = "x-identity";
/// Hex ECDSA signature over `method|url|bodyJson`.
pub const HEADER_SIGNATURE: &str = "x-signature";
/// Free-form client version, `bwc-MAJOR.MINOR.PATCH` is recognized.
pub const HEADER_CLIENT_VERSION: &str = "x-client-version";

/// Error envelope returned with every non-2xx response.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

pub type CreateWalletRequest = CreateWalletOptions;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateWalletResponse {
    pub wallet_id: String,
}

pub type JoinWalletRequest = JoinWalletOptions;

pub type AddAccessRequest = AddAccessOptions;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SavePreferencesRequest {
    pub email: Option<String>,
    pub language: Option<String>,
    pub unit: Option<AmountUnit>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CreateAddressRequest {
    pub ignore_max_gap: bool,
}

pub type CreateTxRequest = CreateTxOptions;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PublishTxRequest {
    pub proposal_signature: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignTxRequest {
    /// One hex DER signature per proposal input, in input order.
    pub signatures: Vec<String>,
    pub xpub: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RejectTxRequest {
    pub comment: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanRequest {
    pub include_copayer_branches: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FeeLevelsQuery {
    pub network: Network,
}

impl Default for FeeLevelsQuery {
    fn default() -> Self {
        Self {
            network: Network::Livenet,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BalanceQuery {
    pub two_step: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HistoryQuery {
    pub skip: usize,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationsQuery {
    /// Return notifications with id strictly greater than this cursor.
    pub notification_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SendMaxInfoQuery {
    pub fee_per_kb: u64,
    #[serde(default)]
    pub exclude_unconfirmed_utxos: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ListAddressesQuery {
    pub limit: Option<usize>,
    pub newest_first: bool,
}
