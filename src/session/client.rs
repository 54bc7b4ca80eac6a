use super::{ResourceSession, Session, SessionState};
use crate::backend::{BackendError, BackendResult};
use crate::network::{ClientHandler, ClientRole, Connection, Message, MessageWrapper, ProtocolEngine, ProtocolResult};
use std::sync::Arc;
use tracing::{info, warn};

/// Client side of a benchmark round: fetch what the server published, publish a result back.
pub struct ClientRounds {
    resources: Arc<ResourceSession>,
    n_tasks: u32,
}

impl ClientRounds {
    pub fn new(resources: Arc<ResourceSession>, n_tasks: u32) -> Self {
        Self { resources, n_tasks }
    }

    fn finish(&self, engine: &ProtocolEngine) {
        info!(
            "Finished {} of {} rounds",
            self.resources.state().rounds(),
            self.n_tasks
        );
        self.resources.state().mark_done();
        engine.stop();
    }
}

#[async_trait::async_trait]
impl ClientHandler for ClientRounds {
    async fn on_connect(&self, engine: &ProtocolEngine, conn: &Arc<Connection>) -> ProtocolResult<()> {
        engine.send(conn, Message::GetAddress, engine.proxy_peer()).await?;
        Ok(())
    }

    async fn on_address(
        &self,
        engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()> {
        if self.resources.state().rounds() >= self.n_tasks {
            self.finish(engine);
            return Ok(());
        }

        if let Message::Address { address } = &wrapper.msg {
            if self.resources.settings().direct_connections {
                let target = self
                    .resources
                    .builder()
                    .build_connect_address(engine.address().ip(), address);
                if let Err(e) = self.resources.backend().connect(&target).await {
                    warn!("Error connecting to {}: {}", target, e);
                }
            }
        }

        engine.send(conn, Message::GetResources, Some(wrapper.src.as_str())).await?;
        Ok(())
    }

    async fn on_resources(
        &self,
        engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()> {
        let hashes: &[String] = match &wrapper.msg {
            Message::Resources { hashes } => hashes,
            _ => &[],
        };
        let backend = self.resources.backend();
        let state = self.resources.state();

        // One sample per round covers fetching everything that was offered
        let fetch_all = async {
            for hash in hashes {
                let dir = ResourceSession::download_dir(self.resources.resource_dir(), hash);
                backend.fetch(hash, &dir).await?;
            }
            Ok::<(), BackendError>(())
        };
        state.timed(conn.address(), fetch_all).await?;
        backend.pre_publish().await?;

        let path = self
            .resources
            .creator()
            .create(&wrapper.src, self.resources.result_dir())?;
        let hash = backend.publish(&path).await?;
        engine.send(conn, Message::Result { hash }, Some(wrapper.src.as_str())).await?;

        let rounds = state.new_round();
        info!("Round {} of {} done", rounds, self.n_tasks);
        if rounds >= self.n_tasks {
            self.finish(engine);
        } else {
            engine.send(conn, Message::GetResources, Some(wrapper.src.as_str())).await?;
        }
        Ok(())
    }

    fn heartbeat(&self) {
        self.resources.state().heartbeat();
    }
}

/// Connects to a server (directly or through a proxy) and runs `n_tasks` rounds
pub struct ClientSession {
    engine: Arc<ProtocolEngine>,
    resources: Arc<ResourceSession>,
    role: Arc<ClientRole<ClientRounds>>,
}

impl ClientSession {
    pub fn new(engine: Arc<ProtocolEngine>, resources: ResourceSession, n_tasks: u32) -> Self {
        let resources = Arc::new(resources);
        let role = Arc::new(ClientRole(ClientRounds::new(Arc::clone(&resources), n_tasks)));
        Self {
            engine,
            resources,
            role,
        }
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }
}

#[async_trait::async_trait]
impl Session for ClientSession {
    fn state(&self) -> &Arc<SessionState> {
        self.resources.state()
    }

    async fn set_up(&self) -> BackendResult<()> {
        self.resources.set_up().await
    }

    async fn run(&self) -> ProtocolResult<()> {
        self.engine.run_client(Arc::clone(&self.role)).await
    }

    async fn tear_down(&self) {
        self.engine.stop();
        self.resources.tear_down().await;
    }
}
