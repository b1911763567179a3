//! Request authentication.
//!
//! The server holds no secrets: every claim a client makes is checked
//! against public keys already on record. API requests are signed with a
//! copayer request key (ECDSA over the double-sha256 of
//! `lowercase(method)|url|bodyJson`); join requests are signed with the
//! wallet secret key; added request keys chain back to the copayer xpub
//! through a fixed derivation path.

use std::str::FromStr as _;

use bitcoin::{
    bip32::{DerivationPath, Xpub},
    hashes::{Hash as _, sha256d},
    secp256k1::{Message, Secp256k1, ecdsa},
};

use crate::{
    error::{ServiceError, ServiceResult},
    service::Service,
    types::{AddressType, Copayer, DerivationStrategy, Wallet},
};

/// Non-hardened path under the copayer xpub whose key authorizes the
/// registration of additional request keys.
pub const REQUEST_KEY_AUTH_PATH: &str = "m/1/0";

/// `bwc` clients older than this predate the BIP44/P2PKH wallet scheme
/// and cannot derive addresses for wallets that use it.
const MIN_BIP44_CLIENT_VERSION: semver::Version =
    semver::Version::new(1, 2, 0);

fn message_digest(message: &str) -> Message {
    let digest = sha256d::Hash::hash(message.as_bytes());
    Message::from_digest(digest.to_byte_array())
}

/// Verifies a hex DER ECDSA signature over `message` against a hex
/// compressed public key. Malformed keys or signatures simply fail.
pub fn verify_message(
    message: &str,
    signature_hex: &str,
    pub_key_hex: &str,
) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = ecdsa::Signature::from_der(&bytes) else {
        return false;
    };
    let Ok(pub_key) =
        bitcoin::secp256k1::PublicKey::from_str(pub_key_hex)
    else {
        return false;
    };
    secp.verify_ecdsa(&message_digest(message), &signature, &pub_key)
        .is_ok()
}

/// Signs `message` the way clients do. The server itself never signs; this
/// lives here so the wallet-secret join flow and the test suite agree with
/// the verification side bit for bit.
pub fn sign_message(
    message: &str,
    priv_key: &bitcoin::PrivateKey,
) -> String {
    let secp = Secp256k1::new();
    let signature =
        secp.sign_ecdsa(&message_digest(message), &priv_key.inner);
    hex::encode(signature.serialize_der())
}

/// The payload a joining copayer signs with the wallet secret key.
pub fn join_message(name: &str, xpub: &str, request_pub_key: &str) -> String {
    format!("{name}|{xpub}|{request_pub_key}")
}

/// The payload an API request signature covers.
pub fn request_message(method: &str, url: &str, body_json: &str) -> String {
    let body = if body_json.is_empty() { "{}" } else { body_json };
    format!("{}|{url}|{body}", method.to_lowercase())
}

/// Checks that a new request key was authorized by the copayer: the
/// signature over the key must verify against the key derived from the
/// copayer xpub at [`REQUEST_KEY_AUTH_PATH`].
pub fn verify_request_pub_key(
    request_pub_key: &str,
    signature_hex: &str,
    xpub: &str,
) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(xpub) = Xpub::from_str(xpub) else {
        return false;
    };
    let Ok(path) = DerivationPath::from_str(REQUEST_KEY_AUTH_PATH) else {
        return false;
    };
    let Ok(auth_key) = xpub.derive_pub(&secp, &path) else {
        return false;
    };
    verify_message(
        request_pub_key,
        signature_hex,
        &auth_key.public_key.to_string(),
    )
}

/// Parses an `x-client-version` header of the form `bwc-1.2.3`. Unknown
/// agents pass through ungated.
pub fn parse_client_version(
    header: &str,
) -> Option<(String, semver::Version)> {
    let (agent, version) = header.split_once('-')?;
    let version = semver::Version::parse(version).ok()?;
    Some((agent.to_owned(), version))
}

/// Credentials attached to an authenticated request.
#[derive(Clone, Debug)]
pub struct AuthedRequest {
    pub wallet: Wallet,
    pub copayer_id: String,
    pub copayer_name: String,
}

impl Service {
    /// Authenticates `(copayer_id, message, signature)`: the signature must
    /// verify against one of the copayer's registered request keys.
    pub fn authenticate(
        &self,
        copayer_id: &str,
        message: &str,
        signature_hex: &str,
    ) -> ServiceResult<AuthedRequest> {
        let wallet = self
            .storage
            .fetch_wallet_by_copayer(copayer_id)?
            .ok_or(ServiceError::NotAuthorized)?;
        let copayer = wallet
            .copayer(copayer_id)
            .ok_or(ServiceError::NotAuthorized)?;
        let authorized = copayer
            .request_pub_keys
            .iter()
            .any(|k| verify_message(message, signature_hex, &k.key));
        if !authorized {
            return Err(ServiceError::NotAuthorized);
        }
        Ok(AuthedRequest {
            copayer_id: copayer.id.clone(),
            copayer_name: copayer.name.clone(),
            wallet,
        })
    }

    /// Gates obsolete clients per wallet. The BIP44 derivation strategy
    /// and P2PKH addresses shipped with bwc 1.2; older clients cannot
    /// operate wallets using either, so they are told to upgrade. Legacy
    /// BIP45 P2SH wallets stay accessible to any client version, and
    /// unrecognized user agents pass through ungated.
    pub fn check_client_version(
        &self,
        header: Option<&str>,
        wallet: &Wallet,
    ) -> ServiceResult<()> {
        let Some(header) = header else {
            return Ok(());
        };
        let Some((agent, version)) = parse_client_version(header) else {
            return Ok(());
        };
        let modern_scheme = wallet.derivation_strategy
            == DerivationStrategy::Bip44
            || wallet.address_type == AddressType::P2pkh;
        if agent == "bwc"
            && modern_scheme
            && version < MIN_BIP44_CLIENT_VERSION
        {
            return Err(ServiceError::UpgradeNeeded(format!(
                "this wallet requires client version \
                 {MIN_BIP44_CLIENT_VERSION} or newer, got {version}"
            )));
        }
        Ok(())
    }
}

/// Registers the primary request key of a joining copayer.
pub fn primary_request_key(
    request_pub_key: &str,
    copayer_signature: &str,
) -> crate::types::RequestPubKey {
    crate::types::RequestPubKey {
        key: request_pub_key.to_owned(),
        signature: copayer_signature.to_owned(),
        name: None,
    }
}

/// Convenience for places that only have a wallet and a copayer id.
pub fn copayer_of<'a>(
    wallet: &'a Wallet,
    copayer_id: &str,
) -> ServiceResult<&'a Copayer> {
    wallet
        .copayer(copayer_id)
        .ok_or(ServiceError::NotAuthorized)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use bitcoin::{
        bip32::{DerivationPath, Xpriv, Xpub},
        secp256k1::Secp256k1,
    };

    use super::{
        REQUEST_KEY_AUTH_PATH, parse_client_version, request_message,
        sign_message, verify_message, verify_request_pub_key,
    };

    fn key_pair() -> (bitcoin::PrivateKey, String) {
        let secp = Secp256k1::new();
        let (secret, public) =
            secp.generate_keypair(&mut bitcoin::secp256k1::rand::thread_rng());
        let priv_key =
            bitcoin::PrivateKey::new(secret, bitcoin::Network::Testnet);
        (priv_key, public.to_string())
    }

    #[test]
    fn message_signature_round_trip() {
        let (priv_key, pub_key) = key_pair();
        let message = request_message(
            "POST",
            "/v1/txproposals/",
            r#"{"outputs":[]}"#,
        );
        assert_eq!(message, r#"post|/v1/txproposals/|{"outputs":[]}"#);
        let signature = sign_message(&message, &priv_key);
        assert!(verify_message(&message, &signature, &pub_key));
        assert!(!verify_message("other", &signature, &pub_key));
        assert!(!verify_message(&message, "zz", &pub_key));
    }

    #[test]
    fn empty_body_normalizes_to_braces() {
        assert_eq!(request_message("GET", "/v1/balance/", ""), "get|/v1/balance/|{}");
    }

    #[test]
    fn request_key_chains_to_xpub() {
        let secp = Secp256k1::new();
        let xpriv =
            Xpriv::new_master(bitcoin::Network::Testnet, &[7u8; 32]).unwrap();
        let xpub = Xpub::from_priv(&secp, &xpriv).to_string();
        let auth_priv = xpriv
            .derive_priv(
                &secp,
                &DerivationPath::from_str(REQUEST_KEY_AUTH_PATH).unwrap(),
            )
            .unwrap();
        let auth_key = bitcoin::PrivateKey::new(
            auth_priv.private_key,
            bitcoin::Network::Testnet,
        );
        let (_, request_pub_key) = key_pair();
        let signature = sign_message(&request_pub_key, &auth_key);
        assert!(verify_request_pub_key(&request_pub_key, &signature, &xpub));
        // A signature by an unrelated key must not chain.
        let (other_priv, _) = key_pair();
        let bad = sign_message(&request_pub_key, &other_priv);
        assert!(!verify_request_pub_key(&request_pub_key, &bad, &xpub));
    }

    #[test]
    fn client_version_parsing() {
        let (agent, version) = parse_client_version("bwc-1.2.3").unwrap();
        assert_eq!(agent, "bwc");
        assert_eq!(version, semver::Version::new(1, 2, 3));
        assert!(parse_client_version("garbage").is_none());
    }
}
