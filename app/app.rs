use std::{collections::HashMap, sync::Arc};

use mws::{
    BlockchainMonitor, Locks, MessageBroker, PushDispatcher,
    PushDispatcherConfig, Service, Storage,
    defaults::Tunables,
    explorer::{Explorer, HttpExplorer, http::HttpExplorerConfig},
    types::Network,
};
use tokio::task::JoinHandle;

use crate::cli::Config;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage error")]
    Storage(#[from] mws::storage::Error),
    #[error("explorer error")]
    Explorer(#[from] mws::explorer::Error),
    #[error("push dispatcher error")]
    Push(#[from] mws::push::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct App {
    pub service: Service,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let datadir = config.datadir()?;
        let storage = Storage::new(&datadir.join("data.mdb"))?;
        let tunables = Arc::new(Tunables::default());
        let locks = Locks::new(
            storage.clone(),
            tunables.lock_acquire_timeout,
            tunables.lock_ttl,
        );
        let broker = MessageBroker::default();

        let mut tasks = vec![];
        let mut explorers: HashMap<Network, Arc<dyn Explorer>> =
            HashMap::new();
        let configured = [
            (Network::Livenet, &config.livenet_explorer_url),
            (Network::Testnet, &config.testnet_explorer_url),
        ];
        for (network, explorer_url) in configured {
            let Some(explorer_url) = explorer_url else {
                continue;
            };
            let explorer = HttpExplorer::new(HttpExplorerConfig::new(
                explorer_url.as_str(),
            ))?;
            tasks.push(explorer.start_polling());
            explorers.insert(network, Arc::new(explorer));
            tracing::info!(%network, url = %explorer_url, "explorer configured");
        }
        let networks: Vec<Network> = explorers.keys().copied().collect();

        let service = Service::new(
            storage.clone(),
            locks,
            broker.clone(),
            explorers,
            tunables,
        );

        let monitor =
            BlockchainMonitor::new(service.clone(), networks.clone());
        tasks.extend(monitor.start());

        if let Some(push_server_url) = &config.push_server_url {
            let dispatcher = PushDispatcher::new(
                storage,
                broker,
                PushDispatcherConfig::new(
                    push_server_url.as_str(),
                    config.push_templates_dir.clone(),
                ),
            )?;
            tasks.push(dispatcher.start());
            tracing::info!(url = %push_server_url, "push dispatcher started");
        }

        Ok(Self { service, tasks })
    }
}

impl Drop for App {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
