//! Push dispatcher: delivers a subset of notifications to an external push
//! server, templated per recipient.
//!
//! Runs as a broker subscriber. Per-recipient failures (missing template,
//! unreachable push server) are logged and never block other recipients.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::{
    broker::MessageBroker,
    storage::Storage,
    types::{AmountUnit, Copayer, Notification, NotificationType, Wallet},
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Notification types that reach copayer devices.
const DELIVERED_TYPES: &[NotificationType] = &[
    NotificationType::NewCopayer,
    NotificationType::WalletComplete,
    NotificationType::NewTxProposal,
    NotificationType::NewOutgoingTx,
    NotificationType::NewIncomingTx,
    NotificationType::TxProposalFinallyRejected,
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage error")]
    Storage(#[from] crate::storage::Error),
    #[error("template {0:?} could not be read")]
    Template(PathBuf),
    #[error("push server error: {0}")]
    PushServer(String),
    #[error("http client error: {0}")]
    Http(String),
}

#[derive(Clone, Debug)]
pub struct PushDispatcherConfig {
    pub push_server_url: String,
    pub templates_dir: PathBuf,
    pub default_language: String,
    pub default_unit: AmountUnit,
    pub request_timeout: Duration,
}

impl PushDispatcherConfig {
    pub fn new(
        push_server_url: impl Into<String>,
        templates_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            push_server_url: push_server_url.into(),
            templates_dir: templates_dir.into(),
            default_language: "en".to_owned(),
            default_unit: AmountUnit::Btc,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct PushDispatcher {
    storage: Storage,
    broker: MessageBroker,
    client: reqwest::Client,
    config: PushDispatcherConfig,
}

/// Template file stem per delivered type.
fn template_stem(notification_type: NotificationType) -> &'static str {
    match notification_type {
        NotificationType::NewCopayer => "new_copayer",
        NotificationType::WalletComplete => "wallet_complete",
        NotificationType::NewTxProposal => "new_tx_proposal",
        NotificationType::NewOutgoingTx => "new_outgoing_tx",
        NotificationType::NewIncomingTx => "new_incoming_tx",
        NotificationType::TxProposalFinallyRejected => {
            "txp_finally_rejected"
        }
        _ => "unknown",
    }
}

/// Mustache-style `{{var}}` substitution.
fn render(template: &str, data: &HashMap<String, String>) -> String {
    let mut out = template.to_owned();
    for (key, value) in data {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// First template line is the subject, the remainder the body.
fn split_subject(rendered: &str) -> (String, String) {
    match rendered.split_once('\n') {
        Some((subject, body)) => {
            (subject.trim().to_owned(), body.trim().to_owned())
        }
        None => (rendered.trim().to_owned(), String::new()),
    }
}

pub fn format_amount(satoshis: u64, unit: AmountUnit) -> String {
    match unit {
        AmountUnit::Btc => {
            let btc = satoshis as f64 / 100_000_000.0;
            let formatted = format!("{btc:.8}");
            let trimmed =
                formatted.trim_end_matches('0').trim_end_matches('.');
            format!("{trimmed}btc")
        }
        AmountUnit::Bit => {
            format!("{:.2}bits", satoshis as f64 / 100.0)
        }
    }
}

fn should_deliver(notification: &Notification, wallet: &Wallet) -> bool {
    if !DELIVERED_TYPES.contains(&notification.notification_type) {
        return false;
    }
    // A 1-of-m proposal needs no co-signer coordination.
    if notification.notification_type == NotificationType::NewTxProposal
        && wallet.m == 1
    {
        return false;
    }
    true
}

fn recipients_of<'a>(
    wallet: &'a Wallet,
    creator_id: Option<&str>,
) -> Vec<&'a Copayer> {
    wallet
        .copayers
        .iter()
        .filter(|c| Some(c.id.as_str()) != creator_id)
        .collect()
}

impl PushDispatcher {
    pub fn new(
        storage: Storage,
        broker: MessageBroker,
        config: PushDispatcherConfig,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| Error::Http(err.to_string()))?;
        Ok(Self {
            storage,
            broker,
            client,
            config,
        })
    }

    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut events = dispatcher.broker.subscribe();
            tracing::info!("push dispatcher started");
            loop {
                match events.recv().await {
                    Ok(notification) => {
                        if let Err(err) = dispatcher
                            .handle_notification(&notification)
                            .await
                        {
                            tracing::warn!(
                                id = %notification.id,
                                %err,
                                "push delivery failed"
                            );
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(
                        skipped,
                    )) => {
                        tracing::warn!(skipped, "push dispatcher lagged");
                    }
                    Err(
                        tokio::sync::broadcast::error::RecvError::Closed,
                    ) => return,
                }
            }
        })
    }

    async fn handle_notification(
        &self,
        notification: &Notification,
    ) -> Result<(), Error> {
        let Some(wallet) =
            self.storage.fetch_wallet(&notification.wallet_id)?
        else {
            // Global notifications are not pushed.
            return Ok(());
        };
        if !should_deliver(notification, &wallet) {
            return Ok(());
        }
        for recipient in
            recipients_of(&wallet, notification.creator_id.as_deref())
        {
            if let Err(err) = self
                .deliver_to(notification, &wallet, recipient)
                .await
            {
                tracing::warn!(
                    copayer_id = %recipient.id,
                    wallet_id = %wallet.id,
                    %err,
                    "push delivery to recipient failed"
                );
            }
        }
        Ok(())
    }

    async fn deliver_to(
        &self,
        notification: &Notification,
        wallet: &Wallet,
        recipient: &Copayer,
    ) -> Result<(), Error> {
        let preferences = self
            .storage
            .fetch_preferences(&wallet.id, &recipient.id)?;
        let language = preferences
            .as_ref()
            .and_then(|p| p.language.clone())
            .unwrap_or_else(|| self.config.default_language.clone());
        let unit = preferences
            .as_ref()
            .and_then(|p| p.unit)
            .unwrap_or(self.config.default_unit);

        let stem = template_stem(notification.notification_type);
        let plain = self.load_template(&language, stem, "plain")?;
        let html = self.load_template(&language, stem, "html")?;
        let data = self.data_bag(notification, wallet, unit);
        let (title, message) = split_subject(&render(&plain, &data));
        let (html_title, html_body) = split_subject(&render(&html, &data));

        let payload = serde_json::json!({
            "user": format!("{}${}", wallet.id, recipient.id),
            "android": { "data": { "title": title, "message": message } },
            "ios": { "alert": title },
            "html": { "subject": html_title, "body": html_body },
        });
        let url = format!(
            "{}/send",
            self.config.push_server_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| Error::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::PushServer(format!(
                "status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Reads `templates/<language>/<stem>.<extension>` (each notification
    /// has a `.plain` and an `.html` variant), falling back to the default
    /// language with a warning when the localized file is absent.
    fn load_template(
        &self,
        language: &str,
        stem: &str,
        extension: &str,
    ) -> Result<String, Error> {
        let path = self
            .config
            .templates_dir
            .join(language)
            .join(format!("{stem}.{extension}"));
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(contents),
            Err(_) if language != self.config.default_language => {
                tracing::warn!(%language, %stem, %extension,
                    "missing localized template, falling back");
                self.load_template(
                    &self.config.default_language,
                    stem,
                    extension,
                )
            }
            Err(_) => Err(Error::Template(path)),
        }
    }

    fn data_bag(
        &self,
        notification: &Notification,
        wallet: &Wallet,
        unit: AmountUnit,
    ) -> HashMap<String, String> {
        let mut data = HashMap::new();
        data.insert("walletId".to_owned(), wallet.id.clone());
        data.insert("walletName".to_owned(), wallet.name.clone());
        data.insert("walletM".to_owned(), wallet.m.to_string());
        data.insert("walletN".to_owned(), wallet.n.to_string());
        if let Some(creator_id) = &notification.creator_id {
            if let Some(creator) = wallet.copayer(creator_id) {
                data.insert(
                    "copayerName".to_owned(),
                    creator.name.clone(),
                );
            }
        }
        if let Some(object) = notification.data.as_object() {
            for (key, value) in object {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                data.insert(key.clone(), rendered);
            }
            if let Some(amount) =
                object.get("amount").and_then(serde_json::Value::as_u64)
            {
                data.insert(
                    "amount".to_owned(),
                    format_amount(amount, unit),
                );
            }
            if let Some(rejected_by) =
                object.get("rejectedBy").and_then(|v| v.as_array())
            {
                let names: Vec<&str> = rejected_by
                    .iter()
                    .filter_map(|r| {
                        r.get("copayerName").and_then(|n| n.as_str())
                    })
                    .collect();
                data.insert(
                    "rejectorsNames".to_owned(),
                    names.join(", "),
                );
            }
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::{format_amount, recipients_of, render, should_deliver, split_subject};
    use crate::types::{
        AddressManager, AddressType, AmountUnit, Copayer,
        DerivationStrategy, Network, Notification, NotificationType,
        Wallet,
    };
    use std::collections::HashMap;

    fn wallet(m: usize, copayers: &[&str]) -> Wallet {
        Wallet {
            id: "w-1".to_owned(),
            name: "family".to_owned(),
            m,
            n: copayers.len(),
            network: Network::Livenet,
            pub_key: String::new(),
            derivation_strategy: DerivationStrategy::Bip45,
            address_type: AddressType::P2sh,
            single_address: false,
            copayers: copayers
                .iter()
                .enumerate()
                .map(|(i, name)| Copayer {
                    id: format!("c-{name}"),
                    copayer_index: i as u32,
                    name: (*name).to_owned(),
                    xpub: format!("xpub-{name}"),
                    request_pub_keys: vec![],
                    custom_data: None,
                    address_manager: None,
                    created_on: 0,
                })
                .collect(),
            address_manager: AddressManager::new(
                DerivationStrategy::Bip45,
                None,
            ),
            scan_status: None,
            created_on: 0,
        }
    }

    fn notification(
        notification_type: NotificationType,
        creator: Option<&str>,
    ) -> Notification {
        Notification {
            id: "0".repeat(18),
            notification_type,
            data: serde_json::json!({ "amount": 123_456_700u64 }),
            wallet_id: "w-1".to_owned(),
            creator_id: creator.map(str::to_owned),
            created_on: 0,
        }
    }

    #[test]
    fn renders_substitutions() {
        let mut data = HashMap::new();
        data.insert("walletName".to_owned(), "family".to_owned());
        data.insert("amount".to_owned(), "1.2btc".to_owned());
        let rendered = render(
            "Payment in {{walletName}}\nYou received {{amount}}.",
            &data,
        );
        let (subject, body) = split_subject(&rendered);
        assert_eq!(subject, "Payment in family");
        assert_eq!(body, "You received 1.2btc.");
    }

    #[test]
    fn amount_formatting() {
        assert_eq!(format_amount(123_456_700, AmountUnit::Btc), "1.234567btc");
        assert_eq!(format_amount(100_000_000, AmountUnit::Btc), "1btc");
        assert_eq!(format_amount(150, AmountUnit::Bit), "1.50bits");
    }

    #[test]
    fn delivery_set_and_singlesig_skip() {
        let multi = wallet(2, &["alice", "bob", "carol"]);
        assert!(should_deliver(
            &notification(NotificationType::NewTxProposal, Some("c-alice")),
            &multi,
        ));
        let single = wallet(1, &["alice"]);
        assert!(!should_deliver(
            &notification(NotificationType::NewTxProposal, Some("c-alice")),
            &single,
        ));
        assert!(!should_deliver(
            &notification(NotificationType::NewBlock, None),
            &multi,
        ));
        assert!(should_deliver(
            &notification(NotificationType::NewIncomingTx, None),
            &multi,
        ));
    }

    #[test]
    fn creator_is_excluded_from_recipients() {
        let wallet = wallet(2, &["alice", "bob", "carol"]);
        let recipients = recipients_of(&wallet, Some("c-bob"));
        let names: Vec<&str> =
            recipients.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "carol"]);
        assert_eq!(recipients_of(&wallet, None).len(), 3);
    }
}
