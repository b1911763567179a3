//! Coordination service for shared m-of-n multisig Bitcoin wallets.
//!
//! The server holds no private keys. It coordinates wallet creation,
//! copayer enrollment, address derivation, UTXO discovery, the tx-proposal
//! voting lifecycle, broadcast, and real-time notifications of on-chain
//! events. Every state-mutating request is authenticated against stored
//! copayer public keys.

pub mod broker;
pub mod coin_select;
pub mod defaults;
pub mod error;
pub mod explorer;
pub mod fees;
pub mod locks;
pub mod monitor;
pub mod push;
pub mod service;
pub mod storage;
pub mod txbuilder;
pub mod types;

pub use broker::MessageBroker;
pub use error::{ServiceError, ServiceResult};
pub use locks::Locks;
pub use monitor::BlockchainMonitor;
pub use push::{PushDispatcher, PushDispatcherConfig};
pub use service::Service;
pub use storage::Storage;
