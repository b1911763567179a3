use serde::{Deserialize, Serialize};

use crate::types::{Network, WalletUtxo};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxProposalStatus {
    Temporary,
    Pending,
    Accepted,
    Rejected,
    Broadcasted,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxProposalActionType {
    Accept,
    Reject,
}

/// Wire format of proposals has evolved; the variant decides what the
/// proposal signature covers and how the raw transaction orders its outputs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TxProposalVersion {
    /// Legacy: creation and publication bundled, signature over raw tx.
    V1,
    /// Two-step create/publish, signature over raw tx.
    V2,
    /// Two-step, shuffled outputs, signature over the canonical proposal
    /// header rather than the serialized transaction.
    V3,
}

impl From<TxProposalVersion> for u8 {
    fn from(v: TxProposalVersion) -> Self {
        match v {
            TxProposalVersion::V1 => 1,
            TxProposalVersion::V2 => 2,
            TxProposalVersion::V3 => 3,
        }
    }
}

impl TryFrom<u8> for TxProposalVersion {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            other => Err(format!("unknown tx proposal version {other}")),
        }
    }
}

impl TxProposalVersion {
    /// Only v3 shuffles the output order at creation.
    pub fn shuffles_outputs(self) -> bool {
        matches!(self, Self::V3)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TxOutput {
    pub to_address: String,
    pub amount: u64,
    pub message: Option<String>,
    /// Raw output script overriding the address, hex encoded.
    pub script: Option<String>,
}

/// A UTXO reservation. While the owning proposal is pending or accepted no
/// other proposal in the wallet may reference the same outpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TxInput {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub script_pub_key: String,
    pub satoshis: u64,
    pub confirmations: u32,
    pub path: String,
    pub public_keys: Vec<String>,
}

impl From<WalletUtxo> for TxInput {
    fn from(utxo: WalletUtxo) -> Self {
        Self {
            txid: utxo.txid,
            vout: utxo.vout,
            address: utxo.address,
            script_pub_key: utxo.script_pub_key,
            satoshis: utxo.satoshis,
            confirmations: utxo.confirmations,
            path: utxo.path,
            public_keys: utxo.public_keys,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TxProposalAction {
    pub copayer_id: String,
    pub copayer_name: String,
    #[serde(rename = "type")]
    pub action_type: TxProposalActionType,
    /// One DER signature per proposal input, present on accepts.
    pub signatures: Option<Vec<String>>,
    /// Extended public key the signatures derive from.
    pub xpub: Option<String>,
    pub comment: Option<String>,
    pub created_on: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TxProposal {
    pub id: String,
    pub wallet_id: String,
    pub creator_id: String,
    pub creator_name: String,
    pub version: TxProposalVersion,
    pub network: Network,
    pub outputs: Vec<TxOutput>,
    /// Stored permutation applied to `outputs ++ [change]` when the raw
    /// transaction is built, so rebuilding is deterministic.
    pub output_order: Vec<usize>,
    pub change_address: Option<crate::types::Address>,
    pub inputs: Vec<TxInput>,
    pub fee: u64,
    pub fee_per_kb: Option<u64>,
    pub required_signatures: usize,
    pub required_rejections: usize,
    pub status: TxProposalStatus,
    pub actions: Vec<TxProposalAction>,
    pub txid: Option<String>,
    pub broadcasted_on: Option<u64>,
    pub message: Option<String>,
    pub pay_pro_url: Option<String>,
    pub custom_data: Option<String>,
    pub exclude_unconfirmed_utxos: bool,
    pub created_on: u64,
}

impl TxProposal {
    /// Requested amount, change excluded.
    pub fn amount(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    pub fn input_amount(&self) -> u64 {
        self.inputs.iter().map(|i| i.satoshis).sum()
    }

    /// What flows back to the wallet after outputs and fee.
    pub fn change_amount(&self) -> u64 {
        self.input_amount()
            .saturating_sub(self.amount())
            .saturating_sub(self.fee)
    }

    /// Open proposals hold UTXO reservations.
    pub fn reserves_inputs(&self) -> bool {
        matches!(
            self.status,
            TxProposalStatus::Pending | TxProposalStatus::Accepted
        )
    }

    pub fn action_by(&self, copayer_id: &str) -> Option<&TxProposalAction> {
        self.actions.iter().find(|a| a.copayer_id == copayer_id)
    }

    pub fn count_actions(&self, action_type: TxProposalActionType) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .count()
    }

    pub fn rejectors(&self) -> Vec<&TxProposalAction> {
        self.actions
            .iter()
            .filter(|a| a.action_type == TxProposalActionType::Reject)
            .collect()
    }

    /// Records a vote and recomputes the status. The caller must have
    /// checked that the copayer has not voted yet.
    pub fn push_action(&mut self, action: TxProposalAction) {
        debug_assert!(self.action_by(&action.copayer_id).is_none());
        self.actions.push(action);
        if self.count_actions(TxProposalActionType::Accept)
            >= self.required_signatures
        {
            self.status = TxProposalStatus::Accepted;
        } else if self.count_actions(TxProposalActionType::Reject)
            >= self.required_rejections
        {
            self.status = TxProposalStatus::Rejected;
        }
    }

    /// The payload the creator's proposal signature must cover. For v1/v2
    /// this is the raw unsigned transaction hex; v3 clients sign the
    /// canonical proposal header instead, which is independent of input
    /// selection.
    pub fn proposal_signing_payload(&self, raw_tx_hex: &str) -> String {
        match self.version {
            TxProposalVersion::V1 | TxProposalVersion::V2 => {
                raw_tx_hex.to_owned()
            }
            TxProposalVersion::V3 => self.header_json(),
        }
    }

    /// Canonical header for v3 proposal signatures.
    pub fn header_json(&self) -> String {
        #[derive(Serialize)]
        struct HeaderOutput<'a> {
            #[serde(rename = "toAddress")]
            to_address: &'a str,
            amount: u64,
            #[serde(skip_serializing_if = "Option::is_none")]
            message: Option<&'a str>,
        }
        #[derive(Serialize)]
        struct Header<'a> {
            outputs: Vec<HeaderOutput<'a>>,
            #[serde(rename = "feePerKb", skip_serializing_if = "Option::is_none")]
            fee_per_kb: Option<u64>,
            #[serde(skip_serializing_if = "Option::is_none")]
            message: Option<&'a str>,
        }
        let header = Header {
            outputs: self
                .outputs
                .iter()
                .map(|o| HeaderOutput {
                    to_address: &o.to_address,
                    amount: o.amount,
                    message: o.message.as_deref(),
                })
                .collect(),
            fee_per_kb: self.fee_per_kb,
            message: self.message.as_deref(),
        };
        serde_json::to_string(&header)
            .expect("proposal header serialization cannot fail")
    }
}

/// Fixture constructors shared by unit tests across the crate.
#[cfg(test)]
pub mod tests_support {
    use super::{TxInput, TxOutput, TxProposal, TxProposalStatus, TxProposalVersion};
    use crate::types::Network;

    pub fn minimal_txp(
        wallet_id: &str,
        txp_id: &str,
        status: TxProposalStatus,
    ) -> TxProposal {
        TxProposal {
            id: txp_id.to_owned(),
            wallet_id: wallet_id.to_owned(),
            creator_id: "c-0".to_owned(),
            creator_name: "creator".to_owned(),
            version: TxProposalVersion::V3,
            network: Network::Testnet,
            outputs: vec![TxOutput {
                to_address: "addr".to_owned(),
                amount: 10_000,
                message: None,
                script: None,
            }],
            output_order: vec![0, 1],
            change_address: None,
            inputs: vec![TxInput {
                txid: "cc".repeat(32),
                vout: 1,
                address: "addr".to_owned(),
                script_pub_key: String::new(),
                satoshis: 20_000,
                confirmations: 10,
                path: "m/0/0".to_owned(),
                public_keys: vec![],
            }],
            fee: 1_000,
            fee_per_kb: Some(10_000),
            required_signatures: 2,
            required_rejections: 2,
            status,
            actions: vec![],
            txid: None,
            broadcasted_on: None,
            message: None,
            pay_pro_url: None,
            custom_data: None,
            exclude_unconfirmed_utxos: false,
            created_on: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        TxInput, TxOutput, TxProposal, TxProposalAction, TxProposalActionType,
        TxProposalStatus, TxProposalVersion,
    };
    use crate::types::Network;

    fn action(
        copayer: &str,
        action_type: TxProposalActionType,
    ) -> TxProposalAction {
        TxProposalAction {
            copayer_id: copayer.to_owned(),
            copayer_name: copayer.to_owned(),
            action_type,
            signatures: None,
            xpub: None,
            comment: None,
            created_on: 0,
        }
    }

    fn proposal(m: usize, n: usize) -> TxProposal {
        TxProposal {
            id: "txp-1".to_owned(),
            wallet_id: "w-1".to_owned(),
            creator_id: "c-0".to_owned(),
            creator_name: "c-0".to_owned(),
            version: TxProposalVersion::V3,
            network: Network::Testnet,
            outputs: vec![TxOutput {
                to_address: "addr".to_owned(),
                amount: 50_000,
                message: None,
                script: None,
            }],
            output_order: vec![0, 1],
            change_address: None,
            inputs: vec![TxInput {
                txid: "aa".repeat(32),
                vout: 0,
                address: "addr".to_owned(),
                script_pub_key: String::new(),
                satoshis: 60_000,
                confirmations: 6,
                path: "m/0/0".to_owned(),
                public_keys: vec![],
            }],
            fee: 3_000,
            fee_per_kb: Some(10_000),
            required_signatures: m,
            required_rejections: m.min(n - m + 1),
            status: TxProposalStatus::Pending,
            actions: vec![],
            txid: None,
            broadcasted_on: None,
            message: None,
            pay_pro_url: None,
            custom_data: None,
            exclude_unconfirmed_utxos: false,
            created_on: 0,
        }
    }

    #[test]
    fn accepts_reach_threshold() {
        let mut txp = proposal(2, 3);
        txp.push_action(action("a", TxProposalActionType::Accept));
        assert_eq!(txp.status, TxProposalStatus::Pending);
        txp.push_action(action("b", TxProposalActionType::Accept));
        assert_eq!(txp.status, TxProposalStatus::Accepted);
        assert_eq!(txp.count_actions(TxProposalActionType::Accept), 2);
    }

    #[test]
    fn rejects_reach_threshold() {
        // 2-of-3: a single reject cannot block, two can.
        let mut txp = proposal(2, 3);
        txp.push_action(action("a", TxProposalActionType::Reject));
        assert_eq!(txp.status, TxProposalStatus::Pending);
        txp.push_action(action("b", TxProposalActionType::Reject));
        assert_eq!(txp.status, TxProposalStatus::Rejected);
    }

    #[test]
    fn one_of_one_needs_single_vote() {
        let mut txp = proposal(1, 1);
        txp.push_action(action("a", TxProposalActionType::Accept));
        assert_eq!(txp.status, TxProposalStatus::Accepted);

        let mut txp = proposal(1, 1);
        txp.push_action(action("a", TxProposalActionType::Reject));
        assert_eq!(txp.status, TxProposalStatus::Rejected);
    }

    #[test]
    fn change_accounting() {
        let txp = proposal(2, 3);
        assert_eq!(txp.amount(), 50_000);
        assert_eq!(txp.input_amount(), 60_000);
        assert_eq!(txp.change_amount(), 7_000);
    }

    #[test]
    fn version_round_trip() {
        for v in [
            TxProposalVersion::V1,
            TxProposalVersion::V2,
            TxProposalVersion::V3,
        ] {
            let json = serde_json::to_string(&v).unwrap();
            let back: TxProposalVersion = serde_json::from_str(&json).unwrap();
            assert_eq!(back, v);
        }
        assert!(serde_json::from_str::<TxProposalVersion>("9").is_err());
        assert!(TxProposalVersion::V3.shuffles_outputs());
        assert!(!TxProposalVersion::V2.shuffles_outputs());
    }

    #[test]
    fn v3_signs_header_not_raw_tx() {
        let txp = proposal(2, 3);
        let payload = txp.proposal_signing_payload("deadbeef");
        assert!(payload.contains("\"toAddress\""));
        let mut v2 = proposal(2, 3);
        v2.version = TxProposalVersion::V2;
        assert_eq!(v2.proposal_signing_payload("deadbeef"), "deadbeef");
    }
}
