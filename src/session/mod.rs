//! Round-based benchmark sessions layered on the protocol engine.

pub mod client;
pub mod server;
pub mod state;

pub use client::{ClientRounds, ClientSession};
pub use server::{ServerRounds, ServerSession};
pub use state::{Outcome, SessionState};

use crate::backend::{AddressBuilder, Backend, BackendError, BackendResult, OneShotResourceCreator};
use crate::network::ProtocolResult;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Lifecycle the watchdog drives
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    fn state(&self) -> &Arc<SessionState>;

    async fn set_up(&self) -> BackendResult<()>;

    /// Serve connections until the engine stops
    async fn run(&self) -> ProtocolResult<()>;

    async fn tear_down(&self);
}

/// Settings shared by client and server sessions
#[derive(Debug, Clone)]
pub struct ResourceSettings {
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Size of each generated file in bytes
    pub file_size: usize,
    /// Backend addresses connected to at set-up
    pub peers: Vec<String>,
    /// Connect backends directly after address discovery
    pub direct_connections: bool,
}

/// Backend, resource generation and accounting common to both roles
pub struct ResourceSession {
    backend: Arc<dyn Backend>,
    builder: Arc<dyn AddressBuilder>,
    state: Arc<SessionState>,
    settings: ResourceSettings,
    creator: OneShotResourceCreator,
    resource_dir: PathBuf,
    result_dir: PathBuf,
    manage_daemon: AtomicBool,
}

impl ResourceSession {
    pub fn new(
        backend: Arc<dyn Backend>,
        builder: Arc<dyn AddressBuilder>,
        state: Arc<SessionState>,
        settings: ResourceSettings,
        role: &str,
    ) -> Self {
        let resource_dir = settings.output_dir.join(format!("resources_{}", role));
        let result_dir = settings.output_dir.join(format!("results_{}", role));
        Self {
            backend,
            builder,
            state,
            creator: OneShotResourceCreator::new(settings.file_size),
            settings,
            resource_dir,
            result_dir,
            manage_daemon: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn builder(&self) -> &dyn AddressBuilder {
        self.builder.as_ref()
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn settings(&self) -> &ResourceSettings {
        &self.settings
    }

    pub fn creator(&self) -> &OneShotResourceCreator {
        &self.creator
    }

    pub fn resource_dir(&self) -> &Path {
        &self.resource_dir
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    /// Where a fetched hash is stored
    pub fn download_dir(base: &Path, hash: &str) -> PathBuf {
        base.join(format!("d_{}", hash))
    }

    /// Create directories, start a daemon if nobody runs one yet and connect configured peers
    pub async fn set_up(&self) -> BackendResult<()> {
        tokio::fs::create_dir_all(&self.settings.output_dir).await?;
        tokio::fs::create_dir_all(&self.settings.log_dir).await?;

        let manage = self.backend.is_daemon() && self.backend.running_process().await.is_none();
        self.manage_daemon.store(manage, Ordering::SeqCst);
        if manage {
            self.backend.start_daemon(&self.settings.log_dir).await?;
            if self.backend.running_process().await.is_none() {
                return Err(BackendError::CommandFailed {
                    command: format!("{} daemon", self.backend.name()),
                    status: "not running after start".to_string(),
                });
            }
            self.backend.set_log_level().await?;
        }

        if self.settings.direct_connections && !self.settings.peers.is_empty() {
            for peer in &self.settings.peers {
                if let Err(e) = self.backend.connect(peer).await {
                    warn!("Error connecting to {}: {}", peer, e);
                }
            }
            self.check_peers().await;
        }
        Ok(())
    }

    /// Warn about configured peers missing from the backend's peer list
    async fn check_peers(&self) {
        let connected = match self.backend.peers().await {
            Ok(connected) => connected,
            Err(e) => {
                warn!("Could not list {} peers: {}", self.backend.name(), e);
                return;
            }
        };
        let missing = missing_peers(&self.settings.peers, &connected);
        if missing.is_empty() {
            info!("Connected to all {} configured peers", self.settings.peers.len());
        } else {
            warn!("Not connected to all of the peers, missing: {:?}", missing);
        }
    }

    /// Stop the daemon if this session started it
    pub async fn tear_down(&self) {
        if self.manage_daemon.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.backend.stop_daemon().await {
                warn!("Failed to stop {} daemon: {}", self.backend.name(), e);
            }
        }
    }
}

/// Configured peer addresses whose identity (last path segment) no listed peer mentions
pub fn missing_peers(configured: &[String], connected: &[String]) -> Vec<String> {
    configured
        .iter()
        .filter(|address| {
            let identity = address.rsplit('/').next().unwrap_or(address.as_str());
            !connected.iter().any(|line| line.contains(identity))
        })
        .cloned()
        .collect()
}
