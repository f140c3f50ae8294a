use crate::api::create_router;
use crate::config::NodeConfig;
use crate::server::{spawn_node, ConfigServer, NodeHandle, SettingsApplicator};
use crate::types::*;
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

pub struct NodeDaemon {
    node_name: String,
    node: NodeHandle,
    live: watch::Receiver<Option<Configuration>>,
    config: NodeConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl NodeDaemon {
    /// Opens the ledger and starts the node actor. Fails if another process
    /// already holds the ledger.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let node_name = config.effective_node_name();
        let ledger_dir = config.ledger_dir();

        info!("Initializing node {} with ledger at {:?}", node_name, ledger_dir);

        std::fs::create_dir_all(&config.data_dir)?;

        let applicator = SettingsApplicator::new(config.applicator.to_policy());
        let live = applicator.subscribe();

        let server = ConfigServer::open(&ledger_dir, applicator)
            .with_context(|| format!("failed to open ledger at {:?}", ledger_dir))?;

        if server.has_incomplete_change()? {
            info!("Node holds a prepared change awaiting commit or rollback");
        }

        let node = spawn_node(server);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            node_name,
            node,
            live,
            config,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr()).await?;
        info!("Node {} listening on {}", self.node_name, self.config.listen_addr());

        let router = create_router(self.node.clone());
        let mut shutdown_rx = self.shutdown_rx.clone();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        });

        let watcher = self.spawn_config_watcher();

        let result = server.await;
        watcher.abort();

        if let Err(e) = &result {
            error!("API server error: {}", e);
        }
        Ok(result?)
    }

    fn spawn_config_watcher(&self) -> tokio::task::JoinHandle<()> {
        let mut live = self.live.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = live.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let settings = live.borrow().as_ref().map(Configuration::len).unwrap_or(0);
                        info!("Live configuration swapped ({} settings)", settings);
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn live_config(&self) -> Option<Configuration> {
        self.live.borrow().clone()
    }
}
