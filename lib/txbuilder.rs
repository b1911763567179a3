//! Transaction construction and signature plumbing.
//!
//! Everything that touches `bitcoin` script/key machinery lives here: joint
//! address derivation from the copayer xpub ring, size estimation, unsigned
//! transaction construction from a proposal, per-input signature
//! verification, and final scriptSig assembly once a proposal reaches its
//! signing threshold.

use std::str::FromStr as _;

use bitcoin::{
    ScriptBuf, Sequence,
    absolute::LockTime,
    bip32::{DerivationPath, Xpub},
    hashes::Hash as _,
    script::PushBytesBuf,
    secp256k1::{self, Message, Secp256k1, ecdsa},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
};

use crate::{
    coin_select::CostModel,
    types::{
        AddressType, Network, TxProposal, TxProposalActionType, Wallet,
    },
};

/// Conservative scriptSig size for a single P2PKH input.
const P2PKH_INPUT_SIZE: u64 = 147;
/// Fixed per-output accounting.
const OUTPUT_SIZE: u64 = 34;
/// Version, locktime and worst-case varints.
const TX_OVERHEAD: u64 = 26;
/// Estimates are padded by 2% so a real transaction never outgrows the fee
/// computed from them.
const SIZE_SAFETY_MARGIN: f64 = 0.02;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid address {0:?}")]
    BadAddress(String),
    #[error("invalid xpub {0:?}")]
    BadXpub(String),
    #[error("invalid derivation path {0:?}")]
    BadPath(String),
    #[error("invalid public key")]
    BadPublicKey,
    #[error("invalid script hex")]
    BadScript,
    #[error("invalid txid {0:?}")]
    BadTxid(String),
    #[error("signature count does not match input count")]
    SignatureCount,
    #[error("invalid signature for input {input}")]
    BadSignature { input: usize },
    #[error("proposal has fewer accepts than required signatures")]
    NotEnoughAccepts,
    #[error("script error: p2sh redeem script too large")]
    RedeemScriptSize,
    #[error("sighash error: {0}")]
    Sighash(String),
}

fn pad(size: u64) -> u64 {
    (size as f64 * (1.0 + SIZE_SAFETY_MARGIN)).ceil() as u64
}

pub fn estimated_input_size(
    address_type: AddressType,
    m: usize,
    n: usize,
) -> u64 {
    let raw = match address_type {
        AddressType::P2pkh => P2PKH_INPUT_SIZE,
        AddressType::P2sh => 46 + 73 * m as u64 + 34 * n as u64,
    };
    pad(raw)
}

/// Skeleton size with no inputs; `n_outputs` excludes the change output,
/// which is always accounted for.
pub fn estimated_base_size(n_outputs: usize) -> u64 {
    pad(TX_OVERHEAD + OUTPUT_SIZE * (n_outputs as u64 + 1))
}

pub fn cost_model(
    wallet: &Wallet,
    n_outputs: usize,
    fee_per_kb: u64,
) -> CostModel {
    CostModel {
        base_size: estimated_base_size(n_outputs),
        size_per_input: estimated_input_size(
            wallet.address_type,
            wallet.m,
            wallet.n,
        ),
        fee_per_kb,
    }
}

fn parse_xpub(xpub: &str) -> Result<Xpub, Error> {
    Xpub::from_str(xpub).map_err(|_| Error::BadXpub(xpub.to_owned()))
}

fn parse_path(path: &str) -> Result<DerivationPath, Error> {
    DerivationPath::from_str(path).map_err(|_| Error::BadPath(path.to_owned()))
}

/// Derives the public key of each copayer xpub at `path` and sorts the
/// result lexicographically, the canonical multisig ordering.
pub fn derive_public_keys(
    xpubs: &[String],
    path: &str,
) -> Result<Vec<bitcoin::PublicKey>, Error> {
    let secp = Secp256k1::verification_only();
    let path = parse_path(path)?;
    let mut keys = xpubs
        .iter()
        .map(|xpub| {
            let xpub = parse_xpub(xpub)?;
            let child = xpub
                .derive_pub(&secp, &path)
                .map_err(|_| Error::BadXpub(xpub.to_string()))?;
            Ok(bitcoin::PublicKey::new(child.public_key))
        })
        .collect::<Result<Vec<_>, Error>>()?;
    keys.sort_by_key(|k| k.to_bytes());
    Ok(keys)
}

pub fn multisig_redeem_script(
    m: usize,
    public_keys: &[bitcoin::PublicKey],
) -> ScriptBuf {
    let mut builder = bitcoin::script::Builder::new().push_int(m as i64);
    for key in public_keys {
        builder = builder.push_key(key);
    }
    builder
        .push_int(public_keys.len() as i64)
        .push_opcode(bitcoin::opcodes::all::OP_CHECKMULTISIG)
        .into_script()
}

/// Derives the joint address of a wallet at a path suffix. Returns the
/// rendered address and the (sorted) hex public keys behind it.
pub fn derive_address(
    network: Network,
    address_type: AddressType,
    m: usize,
    xpubs: &[String],
    path: &str,
) -> Result<(String, Vec<String>), Error> {
    let public_keys = derive_public_keys(xpubs, path)?;
    let address = match address_type {
        AddressType::P2pkh => {
            let key = public_keys.first().ok_or(Error::BadPublicKey)?;
            bitcoin::Address::p2pkh(key.pubkey_hash(), network.to_bitcoin())
        }
        AddressType::P2sh => {
            let redeem = multisig_redeem_script(m, &public_keys);
            bitcoin::Address::p2sh(&redeem, network.to_bitcoin())
                .map_err(|_| Error::RedeemScriptSize)?
        }
    };
    let hex_keys = public_keys.iter().map(|k| k.to_string()).collect();
    Ok((address.to_string(), hex_keys))
}

fn output_script(
    network: Network,
    address: &str,
    script: Option<&str>,
) -> Result<ScriptBuf, Error> {
    if let Some(script) = script {
        return ScriptBuf::from_hex(script).map_err(|_| Error::BadScript);
    }
    let parsed = address
        .parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()
        .map_err(|_| Error::BadAddress(address.to_owned()))?
        .require_network(network.to_bitcoin())
        .map_err(|_| Error::BadAddress(address.to_owned()))?;
    Ok(parsed.script_pubkey())
}

/// Builds the unsigned transaction a proposal describes: inputs in
/// reservation order, requested outputs plus change permuted by the stored
/// output order.
pub fn build_unsigned_tx(
    txp: &TxProposal,
) -> Result<bitcoin::Transaction, Error> {
    let input = txp
        .inputs
        .iter()
        .map(|i| {
            let txid = bitcoin::Txid::from_str(&i.txid)
                .map_err(|_| Error::BadTxid(i.txid.clone()))?;
            Ok(bitcoin::TxIn {
                previous_output: bitcoin::OutPoint::new(txid, i.vout),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: bitcoin::Witness::default(),
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let mut output_slots: Vec<bitcoin::TxOut> = txp
        .outputs
        .iter()
        .map(|o| {
            Ok(bitcoin::TxOut {
                value: bitcoin::Amount::from_sat(o.amount),
                script_pubkey: output_script(
                    txp.network,
                    &o.to_address,
                    o.script.as_deref(),
                )?,
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;
    let change_amount = txp.change_amount();
    if change_amount > 0 {
        if let Some(change) = &txp.change_address {
            output_slots.push(bitcoin::TxOut {
                value: bitcoin::Amount::from_sat(change_amount),
                script_pubkey: output_script(
                    txp.network,
                    &change.address,
                    None,
                )?,
            });
        }
    }
    // The stored permutation covers `outputs ++ [change]`; when there is no
    // change slot the missing index is skipped.
    let mut output = Vec::with_capacity(output_slots.len());
    let mut taken = vec![false; output_slots.len()];
    for &slot in &txp.output_order {
        if slot < output_slots.len() && !taken[slot] {
            taken[slot] = true;
            output.push(output_slots[slot].clone());
        }
    }
    for (slot, taken) in taken.iter().enumerate() {
        if !taken {
            output.push(output_slots[slot].clone());
        }
    }

    Ok(bitcoin::Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input,
        output,
    })
}

pub fn raw_tx_hex(txp: &TxProposal) -> Result<String, Error> {
    let tx = build_unsigned_tx(txp)?;
    Ok(bitcoin::consensus::encode::serialize_hex(&tx))
}

/// Script the legacy sighash commits to for one proposal input.
fn script_code(
    txp: &TxProposal,
    input_index: usize,
    signer_key: &bitcoin::PublicKey,
) -> Result<ScriptBuf, Error> {
    let input = &txp.inputs[input_index];
    let public_keys = input
        .public_keys
        .iter()
        .map(|k| {
            bitcoin::PublicKey::from_str(k).map_err(|_| Error::BadPublicKey)
        })
        .collect::<Result<Vec<_>, Error>>()?;
    if public_keys.len() > 1 {
        Ok(multisig_redeem_script(txp.required_signatures, &public_keys))
    } else {
        Ok(ScriptBuf::new_p2pkh(&signer_key.pubkey_hash()))
    }
}

fn parse_der_signature(hex_sig: &str) -> Result<ecdsa::Signature, Error> {
    let bytes = hex::decode(hex_sig).map_err(|_| Error::BadScript)?;
    match ecdsa::Signature::from_der(&bytes) {
        Ok(sig) => Ok(sig),
        // Tolerate a trailing sighash byte.
        Err(_) if bytes.len() > 1 => {
            ecdsa::Signature::from_der(&bytes[..bytes.len() - 1])
                .map_err(|_| Error::BadScript)
        }
        Err(_) => Err(Error::BadScript),
    }
}

fn sighash_message(
    tx: &bitcoin::Transaction,
    input_index: usize,
    script_code: &ScriptBuf,
) -> Result<Message, Error> {
    let cache = SighashCache::new(tx);
    let sighash = cache
        .legacy_signature_hash(
            input_index,
            script_code,
            EcdsaSighashType::All.to_u32(),
        )
        .map_err(|err| Error::Sighash(err.to_string()))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Verifies one signature per input, in input order, against the public
/// key derived from `xpub` at each input's path.
pub fn check_signatures(
    txp: &TxProposal,
    signatures: &[String],
    xpub: &str,
) -> Result<(), Error> {
    if signatures.len() != txp.inputs.len() {
        return Err(Error::SignatureCount);
    }
    let secp = Secp256k1::verification_only();
    let tx = build_unsigned_tx(txp)?;
    let xpub = parse_xpub(xpub)?;
    for (index, (input, hex_sig)) in
        txp.inputs.iter().zip(signatures).enumerate()
    {
        let path = parse_path(&input.path)?;
        let child = xpub
            .derive_pub(&secp, &path)
            .map_err(|_| Error::BadPath(input.path.clone()))?;
        let signer_key = bitcoin::PublicKey::new(child.public_key);
        let script = script_code(txp, index, &signer_key)?;
        let message = sighash_message(&tx, index, &script)?;
        let signature = parse_der_signature(hex_sig)
            .map_err(|_| Error::BadSignature { input: index })?;
        secp.verify_ecdsa(&message, &signature, &child.public_key)
            .map_err(|_| Error::BadSignature { input: index })?;
    }
    Ok(())
}

fn push_signature(
    builder: bitcoin::script::Builder,
    signature: &ecdsa::Signature,
) -> bitcoin::script::Builder {
    let mut with_sighash = signature.serialize_der().to_vec();
    with_sighash.push(EcdsaSighashType::All.to_u32() as u8);
    let bytes = PushBytesBuf::try_from(with_sighash)
        .expect("a DER signature always fits a push");
    builder.push_slice(bytes)
}

/// Assembles the fully signed transaction from the first `m` accept
/// actions. Returns the transaction, its hex serialization and its txid.
pub fn assemble_signed_tx(
    txp: &TxProposal,
) -> Result<(bitcoin::Transaction, String, String), Error> {
    let secp = Secp256k1::verification_only();
    let mut tx = build_unsigned_tx(txp)?;

    // (derived pubkey per input, signatures) per accepting copayer.
    let accepts: Vec<_> = txp
        .actions
        .iter()
        .filter(|a| {
            a.action_type == TxProposalActionType::Accept
                && a.signatures.is_some()
                && a.xpub.is_some()
        })
        .take(txp.required_signatures)
        .collect();
    if accepts.len() < txp.required_signatures {
        return Err(Error::NotEnoughAccepts);
    }

    for (index, input) in txp.inputs.iter().enumerate() {
        let path = parse_path(&input.path)?;
        let mut entries: Vec<(Vec<u8>, ecdsa::Signature)> = vec![];
        for action in &accepts {
            let xpub = parse_xpub(action.xpub.as_deref().unwrap_or_default())?;
            let child = xpub
                .derive_pub(&secp, &path)
                .map_err(|_| Error::BadPath(input.path.clone()))?;
            let signatures = action.signatures.as_deref().unwrap_or_default();
            let hex_sig =
                signatures.get(index).ok_or(Error::SignatureCount)?;
            let signature = parse_der_signature(hex_sig)
                .map_err(|_| Error::BadSignature { input: index })?;
            entries.push((child.public_key.serialize().to_vec(), signature));
        }

        let script_sig = if input.public_keys.len() > 1 {
            let public_keys = input
                .public_keys
                .iter()
                .map(|k| {
                    bitcoin::PublicKey::from_str(k)
                        .map_err(|_| Error::BadPublicKey)
                })
                .collect::<Result<Vec<_>, Error>>()?;
            let redeem =
                multisig_redeem_script(txp.required_signatures, &public_keys);
            // CHECKMULTISIG pops signatures in key order.
            entries.sort_by_key(|(key, _)| {
                public_keys
                    .iter()
                    .position(|k| k.to_bytes() == *key)
                    .unwrap_or(usize::MAX)
            });
            let mut builder = bitcoin::script::Builder::new()
                .push_opcode(bitcoin::opcodes::all::OP_PUSHBYTES_0);
            for (_, signature) in &entries {
                builder = push_signature(builder, signature);
            }
            let redeem_bytes =
                PushBytesBuf::try_from(redeem.to_bytes())
                    .map_err(|_| Error::RedeemScriptSize)?;
            builder.push_slice(redeem_bytes).into_script()
        } else {
            let (key, signature) =
                entries.first().ok_or(Error::NotEnoughAccepts)?;
            let key_bytes = PushBytesBuf::try_from(key.clone())
                .map_err(|_| Error::BadPublicKey)?;
            push_signature(bitcoin::script::Builder::new(), signature)
                .push_slice(key_bytes)
                .into_script()
        };
        tx.input[index].script_sig = script_sig;
    }

    let hex = bitcoin::consensus::encode::serialize_hex(&tx);
    let txid = tx.compute_txid().to_string();
    Ok((tx, hex, txid))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use bitcoin::{
        bip32::{DerivationPath, Xpriv, Xpub},
        secp256k1::Secp256k1,
    };

    use super::{
        assemble_signed_tx, build_unsigned_tx, check_signatures, cost_model,
        derive_address, estimated_input_size, sighash_message,
    };
    use crate::types::{
        Address, AddressManager, AddressType, DerivationStrategy, Network,
        TxInput, TxOutput, TxProposal, TxProposalAction,
        TxProposalActionType, TxProposalStatus, TxProposalVersion, Wallet,
    };

    fn xpriv(seed: u8) -> Xpriv {
        Xpriv::new_master(bitcoin::Network::Testnet, &[seed; 32]).unwrap()
    }

    fn xpub_of(xpriv: &Xpriv) -> String {
        let secp = Secp256k1::new();
        Xpub::from_priv(&secp, xpriv).to_string()
    }

    fn wallet_2of3() -> (Wallet, Vec<Xpriv>) {
        let xprivs: Vec<Xpriv> = (1..=3).map(xpriv).collect();
        let wallet = Wallet {
            id: "w-1".to_owned(),
            name: "w".to_owned(),
            m: 2,
            n: 3,
            network: Network::Testnet,
            pub_key: String::new(),
            derivation_strategy: DerivationStrategy::Bip45,
            address_type: AddressType::P2sh,
            single_address: false,
            copayers: vec![],
            address_manager: AddressManager::new(
                DerivationStrategy::Bip45,
                None,
            ),
            scan_status: None,
            created_on: 0,
        };
        (wallet, xprivs)
    }

    fn proposal_for(
        wallet: &Wallet,
        xprivs: &[Xpriv],
        path: &str,
    ) -> TxProposal {
        let xpubs: Vec<String> = xprivs.iter().map(xpub_of).collect();
        let (address, public_keys) = derive_address(
            wallet.network,
            wallet.address_type,
            wallet.m,
            &xpubs,
            path,
        )
        .unwrap();
        let (dest, _) = derive_address(
            wallet.network,
            wallet.address_type,
            wallet.m,
            &xpubs,
            "m/2147483647/0/9",
        )
        .unwrap();
        TxProposal {
            id: "txp-1".to_owned(),
            wallet_id: wallet.id.clone(),
            creator_id: "c-1".to_owned(),
            creator_name: "c".to_owned(),
            version: TxProposalVersion::V3,
            network: wallet.network,
            outputs: vec![TxOutput {
                to_address: dest,
                amount: 100_000,
                message: None,
                script: None,
            }],
            output_order: vec![1, 0],
            change_address: Some(Address {
                address: address.clone(),
                wallet_id: wallet.id.clone(),
                path: path.to_owned(),
                public_keys: public_keys.clone(),
                is_change: true,
                network: wallet.network,
                has_activity: false,
                last_used_on: None,
                created_on: 0,
            }),
            inputs: vec![TxInput {
                txid: "11".repeat(32),
                vout: 0,
                address,
                script_pub_key: String::new(),
                satoshis: 200_000,
                confirmations: 6,
                path: path.to_owned(),
                public_keys,
            }],
            fee: 4_000,
            fee_per_kb: Some(10_000),
            required_signatures: wallet.m,
            required_rejections: 2,
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

    fn sign_all_inputs(txp: &TxProposal, xpriv: &Xpriv) -> Vec<String> {
        let secp = Secp256k1::new();
        let tx = build_unsigned_tx(txp).unwrap();
        txp.inputs
            .iter()
            .enumerate()
            .map(|(index, input)| {
                let path = DerivationPath::from_str(&input.path).unwrap();
                let child = xpriv.derive_priv(&secp, &path).unwrap();
                let public =
                    bitcoin::PublicKey::new(child.private_key.public_key(&secp));
                let script =
                    super::script_code(txp, index, &public).unwrap();
                let message =
                    sighash_message(&tx, index, &script).unwrap();
                let signature =
                    secp.sign_ecdsa(&message, &child.private_key);
                hex::encode(signature.serialize_der())
            })
            .collect()
    }

    #[test]
    fn derive_address_is_deterministic_and_sorted() {
        let (wallet, xprivs) = wallet_2of3();
        let xpubs: Vec<String> = xprivs.iter().map(xpub_of).collect();
        let (a1, keys1) = derive_address(
            wallet.network,
            wallet.address_type,
            wallet.m,
            &xpubs,
            "m/2147483647/0/0",
        )
        .unwrap();
        // Shuffled xpub order must not change the joint address.
        let mut shuffled = xpubs.clone();
        shuffled.rotate_left(1);
        let (a2, keys2) = derive_address(
            wallet.network,
            wallet.address_type,
            wallet.m,
            &shuffled,
            "m/2147483647/0/0",
        )
        .unwrap();
        assert_eq!(a1, a2);
        assert_eq!(keys1, keys2);
        assert_eq!(keys1.len(), 3);
        let mut sorted = keys1.clone();
        sorted.sort();
        assert_eq!(keys1, sorted);
        // Different index, different address.
        let (a3, _) = derive_address(
            wallet.network,
            wallet.address_type,
            wallet.m,
            &xpubs,
            "m/2147483647/0/1",
        )
        .unwrap();
        assert_ne!(a1, a3);
    }

    #[test]
    fn unsigned_tx_applies_output_order() {
        let (wallet, xprivs) = wallet_2of3();
        let txp = proposal_for(&wallet, &xprivs, "m/2147483647/0/0");
        let tx = build_unsigned_tx(&txp).unwrap();
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.output.len(), 2);
        // output_order [1, 0]: change (96_000) first, then the payment.
        assert_eq!(tx.output[0].value.to_sat(), 96_000);
        assert_eq!(tx.output[1].value.to_sat(), 100_000);
    }

    #[test]
    fn signatures_verify_and_reject() {
        let (wallet, xprivs) = wallet_2of3();
        let txp = proposal_for(&wallet, &xprivs, "m/2147483647/0/0");
        let signatures = sign_all_inputs(&txp, &xprivs[0]);
        check_signatures(&txp, &signatures, &xpub_of(&xprivs[0])).unwrap();
        // Same signatures attributed to another copayer's xpub must fail.
        assert!(
            check_signatures(&txp, &signatures, &xpub_of(&xprivs[1]))
                .is_err()
        );
        // Truncated signature list must fail.
        assert!(
            check_signatures(&txp, &[], &xpub_of(&xprivs[0])).is_err()
        );
    }

    #[test]
    fn assembles_two_of_three() {
        let (wallet, xprivs) = wallet_2of3();
        let mut txp = proposal_for(&wallet, &xprivs, "m/2147483647/0/0");
        for signer in 0..2 {
            let signatures = sign_all_inputs(&txp, &xprivs[signer]);
            txp.actions.push(TxProposalAction {
                copayer_id: format!("c-{signer}"),
                copayer_name: format!("c-{signer}"),
                action_type: TxProposalActionType::Accept,
                signatures: Some(signatures),
                xpub: Some(xpub_of(&xprivs[signer])),
                comment: None,
                created_on: 0,
            });
        }
        let (tx, hex, txid) = assemble_signed_tx(&txp).unwrap();
        assert!(!tx.input[0].script_sig.is_empty());
        assert_eq!(txid.len(), 64);
        assert!(hex.len() > 200);
        // Assembly is deterministic.
        let (_, hex2, txid2) = assemble_signed_tx(&txp).unwrap();
        assert_eq!(hex, hex2);
        assert_eq!(txid, txid2);
    }

    #[test]
    fn cost_model_matches_formulas() {
        let (wallet, _) = wallet_2of3();
        let model = cost_model(&wallet, 1, 10_000);
        // 2-of-3 p2sh input: 46 + 146 + 102 = 294, padded to 300.
        assert_eq!(model.size_per_input, 300);
        assert_eq!(
            model.size_per_input,
            estimated_input_size(AddressType::P2sh, 2, 3)
        );
        // base: 26 + 34 * 2 = 94, padded to 96.
        assert_eq!(model.base_size, 96);
        // one input: 396 bytes at 10 sat/B
        assert_eq!(model.fee_for(1), 3_960);
    }
}
