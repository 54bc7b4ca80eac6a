use super::{ResourceSession, Session, SessionState};
use crate::backend::BackendResult;
use crate::network::{Connection, Message, MessageWrapper, ProtocolEngine, ProtocolResult, ServerHandler, ServerRole};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Resources published per GetResources request
pub const DEFAULT_RESOURCES_PER_ROUND: usize = 3;

/// Server side of a benchmark round: publish resources on request, fetch the client's result.
pub struct ServerRounds {
    resources: Arc<ResourceSession>,
    per_round: usize,
}

impl ServerRounds {
    pub fn new(resources: Arc<ResourceSession>, per_round: usize) -> Self {
        Self { resources, per_round }
    }
}

#[async_trait::async_trait]
impl ServerHandler for ServerRounds {
    async fn on_get_address(
        &self,
        engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()> {
        let address = match self.resources.backend().own_address().await {
            Ok(address) => address,
            Err(e) => {
                warn!("Could not read own {} address: {}", self.resources.backend().name(), e);
                String::new()
            }
        };
        engine
            .send(conn, Message::Address { address }, Some(wrapper.src.as_str()))
            .await?;
        Ok(())
    }

    async fn on_get_resources(
        &self,
        engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()> {
        let backend = self.resources.backend();
        backend.pre_publish().await?;

        let mut hashes = Vec::with_capacity(self.per_round);
        for slot in 0..self.per_round {
            // Each slot only replaces its own file from the previous round
            let identifier = format!("{}#{}", wrapper.src, slot);
            let path = self
                .resources
                .creator()
                .create(&identifier, self.resources.resource_dir())?;
            let hash = backend.publish(&path).await?;
            debug!("Published {} as {}", path.display(), hash);
            hashes.push(hash);
        }

        engine
            .send(conn, Message::Resources { hashes }, Some(wrapper.src.as_str()))
            .await?;
        Ok(())
    }

    async fn on_result(
        &self,
        _engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()> {
        if let Message::Result { hash } = &wrapper.msg {
            let dir = ResourceSession::download_dir(self.resources.result_dir(), hash);
            self.resources
                .state()
                .timed(conn.address(), self.resources.backend().fetch(hash, &dir))
                .await?;
        }
        self.resources.state().new_round();
        Ok(())
    }

    fn heartbeat(&self) {
        self.resources.state().heartbeat();
    }
}

/// Serves any number of clients, or a single proxy connection, without a round limit
pub struct ServerSession {
    engine: Arc<ProtocolEngine>,
    resources: Arc<ResourceSession>,
    role: Arc<ServerRole<ServerRounds>>,
}

impl ServerSession {
    pub fn new(engine: Arc<ProtocolEngine>, resources: ResourceSession, per_round: usize) -> Self {
        let resources = Arc::new(resources);
        let role = Arc::new(ServerRole(ServerRounds::new(Arc::clone(&resources), per_round)));
        Self {
            engine,
            resources,
            role,
        }
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Serve clients on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> ProtocolResult<()> {
        self.engine.serve(listener, Arc::clone(&self.role)).await
    }
}

#[async_trait::async_trait]
impl Session for ServerSession {
    fn state(&self) -> &Arc<SessionState> {
        self.resources.state()
    }

    async fn set_up(&self) -> BackendResult<()> {
        self.resources.set_up().await?;
        self.resources.state().set_timeout(None);
        Ok(())
    }

    async fn run(&self) -> ProtocolResult<()> {
        self.engine.run_server(Arc::clone(&self.role)).await
    }

    async fn tear_down(&self) {
        self.resources.tear_down().await;
        self.engine.stop();
    }
}
