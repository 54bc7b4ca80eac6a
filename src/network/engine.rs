use crate::network::error::{ProtocolError, ProtocolResult};
use crate::network::peer::{Connection, PeerDirectory};
use crate::network::protocol::{Message, MessageKind, MessageWrapper};
use crate::network::state::{ConnectionContext, ConnectionState};
use crate::network::wire;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where to connect when traffic goes through an intermediary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    pub address: SocketAddr,
    /// Logical name of the peer behind the proxy, used as the default destination
    pub peer: Option<String>,
}

/// Role-specific half of the engine: what to do once a connection is up and which
/// messages it accepts.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    fn role(&self) -> &'static str;

    /// Called right after our Hello went out
    async fn on_connect(&self, _engine: &ProtocolEngine, _conn: &Arc<Connection>) -> ProtocolResult<()> {
        Ok(())
    }

    /// Handle a message addressed to this node
    async fn dispatch(
        &self,
        engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()>;

    /// Called after each successfully handled message
    fn heartbeat(&self) {}
}

/// Server side hooks: answers address and resource requests and collects results
#[async_trait::async_trait]
pub trait ServerHandler: Send + Sync {
    async fn on_get_address(
        &self,
        engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()>;

    async fn on_get_resources(
        &self,
        engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()>;

    async fn on_result(
        &self,
        engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()>;

    fn heartbeat(&self) {}
}

/// Client side hooks: drives rounds by requesting addresses and resources
#[async_trait::async_trait]
pub trait ClientHandler: Send + Sync {
    async fn on_connect(&self, _engine: &ProtocolEngine, _conn: &Arc<Connection>) -> ProtocolResult<()> {
        Ok(())
    }

    async fn on_address(
        &self,
        engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()>;

    async fn on_resources(
        &self,
        engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()>;

    fn heartbeat(&self) {}
}

/// Dispatch table of the server role
pub struct ServerRole<H>(pub H);

/// Dispatch table of the client role
pub struct ClientRole<H>(pub H);

#[async_trait::async_trait]
impl<H: ServerHandler> Dispatcher for ServerRole<H> {
    fn role(&self) -> &'static str {
        "server"
    }

    async fn dispatch(
        &self,
        engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()> {
        match wrapper.msg.kind() {
            MessageKind::GetResources => self.0.on_get_resources(engine, conn, wrapper).await,
            MessageKind::GetAddress => self.0.on_get_address(engine, conn, wrapper).await,
            MessageKind::Result => self.0.on_result(engine, conn, wrapper).await,
            kind => Err(ProtocolError::UnexpectedMessage {
                role: self.role(),
                kind: kind.name(),
            }),
        }
    }

    fn heartbeat(&self) {
        self.0.heartbeat()
    }
}

#[async_trait::async_trait]
impl<H: ClientHandler> Dispatcher for ClientRole<H> {
    fn role(&self) -> &'static str {
        "client"
    }

    async fn on_connect(&self, engine: &ProtocolEngine, conn: &Arc<Connection>) -> ProtocolResult<()> {
        self.0.on_connect(engine, conn).await
    }

    async fn dispatch(
        &self,
        engine: &ProtocolEngine,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
    ) -> ProtocolResult<()> {
        match wrapper.msg.kind() {
            MessageKind::Resources => self.0.on_resources(engine, conn, wrapper).await,
            MessageKind::Address => self.0.on_address(engine, conn, wrapper).await,
            kind => Err(ProtocolError::UnexpectedMessage {
                role: self.role(),
                kind: kind.name(),
            }),
        }
    }

    fn heartbeat(&self) {
        self.0.heartbeat()
    }
}

/// Resolve `host:port` to the first matching socket address
pub async fn resolve(address: &str) -> ProtocolResult<SocketAddr> {
    if let Ok(addr) = address.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(address)
        .await
        .map_err(|e| ProtocolError::InvalidAddress(format!("{}: {}", address, e)))?
        .next()
        .ok_or_else(|| ProtocolError::InvalidAddress(address.to_string()))
}

/// Unregisters a peer when its handling task ends, however it ends.
struct DisconnectGuard<'a> {
    peers: &'a PeerDirectory,
    address: SocketAddr,
}

impl Drop for DisconnectGuard<'_> {
    fn drop(&mut self) {
        self.peers.unregister(self.address);
    }
}

/// Connection lifecycle, handshake, relay and framed I/O shared by both roles
pub struct ProtocolEngine {
    name: String,
    address: SocketAddr,
    proxy: Option<ProxyConfig>,
    peers: PeerDirectory,
    working: CancellationToken,
}

impl ProtocolEngine {
    pub fn new(name: impl Into<String>, address: SocketAddr, proxy: Option<ProxyConfig>) -> Self {
        Self {
            name: name.into(),
            address,
            proxy,
            peers: PeerDirectory::new(),
            working: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind address (server) or target address (client)
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn proxy_peer(&self) -> Option<&str> {
        self.proxy.as_ref().and_then(|p| p.peer.as_deref())
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn is_working(&self) -> bool {
        !self.working.is_cancelled()
    }

    /// Ask every accept, connect, send and receive loop to exit
    pub fn stop(&self) {
        if self.is_working() {
            info!("Stopping {}", self.name);
        }
        self.working.cancel();
    }

    /// Listen for clients, or in proxy mode serve the single outbound connection to the proxy.
    pub async fn run_server<D>(self: &Arc<Self>, dispatcher: Arc<D>) -> ProtocolResult<()>
    where
        D: Dispatcher + 'static,
    {
        if let Some(proxy) = &self.proxy {
            let stream = self.connect(proxy.address).await?;
            self.handle_stream(stream, dispatcher.as_ref()).await;
            return Ok(());
        }

        let listener = TcpListener::bind(self.address).await?;
        self.serve(listener, dispatcher).await
    }

    /// Accept connections on `listener` until stopped, one task per connection
    pub async fn serve<D>(self: &Arc<Self>, listener: TcpListener, dispatcher: Arc<D>) -> ProtocolResult<()>
    where
        D: Dispatcher + 'static,
    {
        let local = listener.local_addr()?;
        info!("Listening on {}", local);

        while self.is_working() {
            let accepted = tokio::select! {
                _ = self.working.cancelled() => break,
                r = listener.accept() => r,
            };
            match accepted {
                Ok((stream, addr)) => {
                    info!("Incoming connection from {}", addr);
                    let engine = Arc::clone(self);
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        engine.handle_stream(stream, dispatcher.as_ref()).await;
                    });
                }
                Err(e) => {
                    if let Err(e) = wire::retry_or_fail(e, &self.working).await {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(wire::RETRY_INTERVAL).await;
                    }
                }
            }
        }
        info!("Stopped listening on {}", local);
        Ok(())
    }

    /// Connect to the target (or the proxy) and serve that one connection until it closes.
    pub async fn run_client<D>(self: &Arc<Self>, dispatcher: Arc<D>) -> ProtocolResult<()>
    where
        D: Dispatcher + 'static,
    {
        let target = self.proxy.as_ref().map(|p| p.address).unwrap_or(self.address);
        let stream = self.connect(target).await?;
        self.handle_stream(stream, dispatcher.as_ref()).await;
        Ok(())
    }

    async fn connect(&self, address: SocketAddr) -> ProtocolResult<TcpStream> {
        info!("Connecting to {}", address);
        loop {
            if !self.is_working() {
                return Err(ProtocolError::Stopped);
            }
            let result = tokio::select! {
                _ = self.working.cancelled() => return Err(ProtocolError::Stopped),
                r = TcpStream::connect(address) => r,
            };
            match result {
                Ok(stream) => return Ok(stream),
                Err(e) => wire::retry_or_fail(e, &self.working).await?,
            }
        }
    }

    async fn handle_stream<D: Dispatcher + ?Sized>(&self, stream: TcpStream, dispatcher: &D) {
        let address = match stream.peer_addr() {
            Ok(address) => address,
            Err(e) => {
                warn!("Dropping connection without peer address: {}", e);
                return;
            }
        };
        let (reader, writer) = stream.into_split();
        let conn = Connection::new(address, writer);
        self.handle_connection(reader, conn, dispatcher).await;
    }

    /// Run one connection from handshake to teardown.
    ///
    /// Errors end this connection only. The peer is unregistered and the transport closed on
    /// every exit path.
    pub async fn handle_connection<R, D>(&self, mut reader: R, conn: Arc<Connection>, dispatcher: &D)
    where
        R: AsyncRead + Unpin + Send,
        D: Dispatcher + ?Sized,
    {
        let address = conn.address();
        let mut ctx = ConnectionContext::new(address);
        let guard = DisconnectGuard {
            peers: &self.peers,
            address,
        };
        ctx.transition_to(ConnectionState::Handshaking);

        let result = self.work(&mut reader, &conn, dispatcher, &mut ctx).await;
        ctx.transition_to(ConnectionState::Closing);
        match result {
            Ok(()) | Err(ProtocolError::Stopped) => {}
            Err(ProtocolError::ConnectionTerminated) => {
                info!("Connection [{}] terminated by other side", address)
            }
            Err(e) => warn!("Protocol error [{}]: {}", address, e),
        }

        info!(
            "Closing {} ({} frames received, {} relayed)",
            address, ctx.received, ctx.relayed
        );
        drop(guard);
        conn.close().await;
        ctx.transition_to(ConnectionState::Closed);
    }

    async fn work<R, D>(
        &self,
        reader: &mut R,
        conn: &Arc<Connection>,
        dispatcher: &D,
        ctx: &mut ConnectionContext,
    ) -> ProtocolResult<()>
    where
        R: AsyncRead + Unpin + Send,
        D: Dispatcher + ?Sized,
    {
        self.send(conn, Message::Hello { name: self.name.clone() }, None)
            .await?;
        dispatcher.on_connect(self, conn).await?;

        while self.is_working() {
            let wrapper = wire::read_frame(reader, &self.working).await?;
            ctx.received += 1;
            debug!(
                ">> receive {} from {} to {}",
                wrapper.msg.kind(),
                wrapper.src,
                wrapper.dst
            );
            self.on_message(conn, &wrapper, dispatcher, ctx).await?;
        }
        Ok(())
    }

    /// Handshake, relay or dispatch a single received message
    pub(crate) async fn on_message<D>(
        &self,
        conn: &Arc<Connection>,
        wrapper: &MessageWrapper,
        dispatcher: &D,
        ctx: &mut ConnectionContext,
    ) -> ProtocolResult<()>
    where
        D: Dispatcher + ?Sized,
    {
        let sender = conn.address();

        if let Message::Hello { name } = &wrapper.msg {
            self.on_hello(conn, name, ctx);
        } else if !self.peers.contains_address(sender) {
            return Err(ProtocolError::UnknownPeer(sender.to_string()));
        }

        if self.should_relay(sender, wrapper) {
            self.relay(wrapper).await?;
            ctx.relayed += 1;
        } else if !matches!(wrapper.msg, Message::Hello { .. }) {
            dispatcher.dispatch(self, conn, wrapper).await?;
        }

        dispatcher.heartbeat();
        Ok(())
    }

    fn on_hello(&self, conn: &Arc<Connection>, name: &str, ctx: &mut ConnectionContext) {
        let address = conn.address();

        // A second connection claiming the proxy peer's name must not take over its binding
        if self.proxy_peer() == Some(name) && self.peers.contains_name(name) {
            debug!("Ignoring Hello from proxy peer {} at {}: already registered", name, address);
            return;
        }
        if self.peers.name_of(address).as_deref() == Some(name) {
            ctx.transition_to(ConnectionState::Active);
            return;
        }

        // Bound entries belong to live connections; teardown removes them
        if let Some((bound, _)) = self.peers.lookup_by_name(name) {
            if bound != address {
                warn!(
                    "Ignoring Hello from {}: name {} is held by live connection {}",
                    address, name, bound
                );
                return;
            }
        }

        // This connection now speaks for another name (a relayed peer behind a proxy)
        if !self.peers.register(address, name, Arc::clone(conn)) {
            self.peers.rebind(address, name, Arc::clone(conn));
        }
        ctx.transition_to(ConnectionState::Active);
    }

    /// Whether `wrapper` is meant for some other peer reachable through us
    pub fn should_relay(&self, sender: SocketAddr, wrapper: &MessageWrapper) -> bool {
        if wrapper.dst.is_empty() || wrapper.dst == self.name || wrapper.src == self.name {
            return false;
        }
        self.peers.name_of(sender).as_deref() != Some(wrapper.dst.as_str())
    }

    /// Forward a message, with its original source and destination, to the destination's connection
    pub async fn relay(&self, wrapper: &MessageWrapper) -> ProtocolResult<usize> {
        let (_, target) = self
            .peers
            .lookup_by_name(&wrapper.dst)
            .ok_or_else(|| ProtocolError::UnknownPeer(wrapper.dst.clone()))?;

        debug!(
            ">> relay {} from {} to {}",
            wrapper.msg.kind(),
            wrapper.src,
            wrapper.dst
        );
        let frame = wire::encode(&wrapper.msg, &wrapper.src, &wrapper.dst)?;
        target.send_frame(&frame, &self.working).await
    }

    /// Send `msg` over `conn`, stamped with our name as source.
    ///
    /// Without an explicit destination the proxy peer is used, then the name registered for
    /// `conn`, then no destination at all.
    pub async fn send(&self, conn: &Connection, msg: Message, dst: Option<&str>) -> ProtocolResult<usize> {
        let dst = match dst.filter(|d| !d.is_empty()) {
            Some(dst) => dst.to_string(),
            None => self
                .proxy_peer()
                .map(str::to_string)
                .or_else(|| self.peers.name_of(conn.address()))
                .unwrap_or_default(),
        };

        debug!(">> send {} to {}", msg.kind(), dst);
        let frame = wire::encode(&msg, &self.name, &dst)?;
        conn.send_frame(&frame, &self.working).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    #[derive(Default)]
    struct Recorder {
        dispatched: Mutex<Vec<MessageWrapper>>,
        heartbeats: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl Dispatcher for Recorder {
        fn role(&self) -> &'static str {
            "recorder"
        }

        async fn dispatch(
            &self,
            _engine: &ProtocolEngine,
            _conn: &Arc<Connection>,
            wrapper: &MessageWrapper,
        ) -> ProtocolResult<()> {
            self.dispatched.lock().push(wrapper.clone());
            Ok(())
        }

        fn heartbeat(&self) {
            *self.heartbeats.lock() += 1;
        }
    }

    fn engine(name: &str, proxy: Option<ProxyConfig>) -> ProtocolEngine {
        ProtocolEngine::new(name, "127.0.0.1:7000".parse().unwrap(), proxy)
    }

    /// A connection whose written bytes can be read back from the returned stream
    fn pipe(address: &str) -> (Arc<Connection>, DuplexStream) {
        let (ours, theirs) = duplex(64 * 1024);
        (Connection::new(address.parse().unwrap(), ours), theirs)
    }

    async fn read_all(mut stream: DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    fn ctx(conn: &Connection) -> ConnectionContext {
        ConnectionContext::new(conn.address())
    }

    #[tokio::test]
    async fn test_hello_registers_peer() {
        let engine = engine("hub", None);
        let recorder = Recorder::default();
        let (conn, _rx) = pipe("10.0.0.1:1000");
        let mut ctx = ctx(&conn);

        let hello = MessageWrapper::new(Message::Hello { name: "a".into() }, "a", "");
        engine.on_message(&conn, &hello, &recorder, &mut ctx).await.unwrap();

        assert_eq!(ctx.state, ConnectionState::Active);
        assert_eq!(engine.peers().name_of(conn.address()).as_deref(), Some("a"));
        assert!(recorder.dispatched.lock().is_empty());
        assert_eq!(*recorder.heartbeats.lock(), 1);
    }

    #[tokio::test]
    async fn test_message_before_hello_is_unknown_peer() {
        let engine = engine("srv", None);
        let recorder = Recorder::default();
        let (conn, _rx) = pipe("10.0.0.1:1001");
        let mut ctx = ctx(&conn);

        let msg = MessageWrapper::new(Message::GetAddress, "c", "");
        let result = engine.on_message(&conn, &msg, &recorder, &mut ctx).await;
        assert!(matches!(result, Err(ProtocolError::UnknownPeer(_))));
        assert!(recorder.dispatched.lock().is_empty());
    }

    #[tokio::test]
    async fn test_relay_to_unknown_peer_writes_nothing() {
        let engine = engine("hub", None);
        let recorder = Recorder::default();
        let (sender, sender_rx) = pipe("10.0.0.1:1002");
        let (other, other_rx) = pipe("10.0.0.2:1002");
        engine.peers().register(sender.address(), "client", Arc::clone(&sender));
        engine.peers().register(other.address(), "other", Arc::clone(&other));
        let mut ctx = ctx(&sender);

        let msg = MessageWrapper::new(Message::GetAddress, "client", "ghost");
        let result = engine.on_message(&sender, &msg, &recorder, &mut ctx).await;
        assert!(matches!(result, Err(ProtocolError::UnknownPeer(ref name)) if name == "ghost"));
        assert!(recorder.dispatched.lock().is_empty());

        drop(engine);
        drop(sender);
        drop(other);
        assert!(read_all(sender_rx).await.is_empty());
        assert!(read_all(other_rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_relay_keeps_original_addressing() {
        let engine = engine("hub", None);
        let recorder = Recorder::default();
        let (client, _client_rx) = pipe("10.0.0.1:1003");
        let (server, server_rx) = pipe("10.0.0.2:1003");
        engine.peers().register(client.address(), "client", Arc::clone(&client));
        engine.peers().register(server.address(), "srv", Arc::clone(&server));
        let mut ctx = ctx(&client);

        let msg = MessageWrapper::new(Message::GetAddress, "client", "srv");
        engine.on_message(&client, &msg, &recorder, &mut ctx).await.unwrap();
        assert_eq!(ctx.relayed, 1);
        assert!(recorder.dispatched.lock().is_empty());

        drop(engine);
        drop(server);
        let bytes = read_all(server_rx).await;
        assert_eq!(wire::decode(&bytes).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_local_and_unaddressed_messages_are_not_relayed() {
        let engine = engine("srv", None);
        let recorder = Recorder::default();
        let (client, client_rx) = pipe("10.0.0.1:1004");
        engine.peers().register(client.address(), "client", Arc::clone(&client));
        let mut ctx = ctx(&client);

        let to_us = MessageWrapper::new(Message::GetAddress, "client", "srv");
        let unaddressed = MessageWrapper::new(Message::GetResources, "client", "");
        assert!(!engine.should_relay(client.address(), &to_us));
        assert!(!engine.should_relay(client.address(), &unaddressed));

        engine.on_message(&client, &to_us, &recorder, &mut ctx).await.unwrap();
        engine.on_message(&client, &unaddressed, &recorder, &mut ctx).await.unwrap();
        assert_eq!(ctx.relayed, 0);
        assert_eq!(*recorder.dispatched.lock(), vec![to_us, unaddressed]);

        drop(engine);
        drop(client);
        assert!(read_all(client_rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_message_addressed_to_sender_is_not_relayed() {
        let engine = engine("hub", None);
        let recorder = Recorder::default();
        let (client, _rx) = pipe("10.0.0.1:1005");
        engine.peers().register(client.address(), "client", Arc::clone(&client));

        let echo = MessageWrapper::new(Message::GetAddress, "x", "client");
        assert!(!engine.should_relay(client.address(), &echo));
    }

    #[tokio::test]
    async fn test_proxy_peer_hello_not_registered_twice() {
        let proxy = ProxyConfig {
            address: "127.0.0.1:7001".parse().unwrap(),
            peer: Some("srv".to_string()),
        };
        let engine = engine("client", Some(proxy));
        let recorder = Recorder::default();
        let (first, _rx1) = pipe("10.0.0.1:1006");
        let (second, _rx2) = pipe("10.0.0.2:1006");
        let hello = MessageWrapper::new(Message::Hello { name: "srv".into() }, "srv", "client");

        let mut first_ctx = ctx(&first);
        engine.on_message(&first, &hello, &recorder, &mut first_ctx).await.unwrap();
        let mut second_ctx = ctx(&second);
        engine.on_message(&second, &hello, &recorder, &mut second_ctx).await.unwrap();

        assert_eq!(engine.peers().lookup_by_name("srv").unwrap().0, first.address());
        assert!(!engine.peers().contains_address(second.address()));
        assert_eq!(second_ctx.state, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_second_hello_on_connection_rebinds() {
        let engine = engine("srv", None);
        let recorder = Recorder::default();
        let (hub, _rx) = pipe("10.0.0.1:1007");
        let mut ctx = ctx(&hub);

        let hub_hello = MessageWrapper::new(Message::Hello { name: "hub".into() }, "hub", "");
        let relayed_hello = MessageWrapper::new(Message::Hello { name: "client".into() }, "client", "srv");
        engine.on_message(&hub, &hub_hello, &recorder, &mut ctx).await.unwrap();
        engine.on_message(&hub, &relayed_hello, &recorder, &mut ctx).await.unwrap();

        assert!(!engine.peers().contains_name("hub"));
        assert_eq!(engine.peers().name_of(hub.address()).as_deref(), Some("client"));
    }

    #[tokio::test]
    async fn test_duplicate_name_keeps_live_binding() {
        let engine = engine("srv", None);
        let recorder = Recorder::default();
        let (first, _rx1) = pipe("10.0.0.1:1");
        let (second, _rx2) = pipe("10.0.0.2:1");
        let hello = MessageWrapper::new(Message::Hello { name: "c".into() }, "c", "");

        let mut first_ctx = ctx(&first);
        engine.on_message(&first, &hello, &recorder, &mut first_ctx).await.unwrap();
        let mut second_ctx = ctx(&second);
        engine.on_message(&second, &hello, &recorder, &mut second_ctx).await.unwrap();

        assert_eq!(engine.peers().lookup_by_name("c").unwrap().0, first.address());
        assert!(!engine.peers().contains_address(second.address()));
        assert_eq!(second_ctx.state, ConnectionState::Connecting);

        // The first connection keeps working
        let request = MessageWrapper::new(Message::GetAddress, "c", "srv");
        engine.on_message(&first, &request, &recorder, &mut first_ctx).await.unwrap();
        assert_eq!(*recorder.dispatched.lock(), vec![request.clone()]);

        // The second one never registered
        let result = engine.on_message(&second, &request, &recorder, &mut second_ctx).await;
        assert!(matches!(result, Err(ProtocolError::UnknownPeer(_))));
    }

    #[tokio::test]
    async fn test_send_default_destination() {
        let engine = engine("client", None);
        let (conn, rx) = pipe("10.0.0.1:1008");
        engine.send(&conn, Message::GetAddress, None).await.unwrap();
        engine.peers().register(conn.address(), "srv", Arc::clone(&conn));
        engine.send(&conn, Message::GetResources, None).await.unwrap();
        engine.send(&conn, Message::GetResources, Some("other")).await.unwrap();

        drop(engine);
        drop(conn);
        let bytes = read_all(rx).await;
        let first = wire::decode(&bytes).unwrap();
        let first_len = wire::encode(&first.msg, &first.src, &first.dst).unwrap().len();
        let second = wire::decode(&bytes[first_len..]).unwrap();
        let second_len = wire::encode(&second.msg, &second.src, &second.dst).unwrap().len();
        let third = wire::decode(&bytes[first_len + second_len..]).unwrap();

        assert_eq!((first.src.as_str(), first.dst.as_str()), ("client", ""));
        assert_eq!(second.dst, "srv");
        assert_eq!(third.dst, "other");
    }

    #[tokio::test]
    async fn test_send_prefers_proxy_peer() {
        let proxy = ProxyConfig {
            address: "127.0.0.1:7002".parse().unwrap(),
            peer: Some("srv".to_string()),
        };
        let engine = engine("client", Some(proxy));
        let (conn, rx) = pipe("10.0.0.1:1009");
        engine.peers().register(conn.address(), "hub", Arc::clone(&conn));
        engine.send(&conn, Message::GetAddress, None).await.unwrap();

        drop(engine);
        drop(conn);
        assert_eq!(wire::decode(&read_all(rx).await).unwrap().dst, "srv");
    }

    #[tokio::test]
    async fn test_connection_teardown_unregisters() {
        let engine = engine("srv", None);
        let recorder = Recorder::default();
        let (conn, _peer_side) = pipe("10.0.0.1:1010");

        let hello = wire::encode(&Message::Hello { name: "c".into() }, "c", "").unwrap();
        let garbage = [b'9', 0, 1, 0, 0, 0, 0, 0, 0];
        let reader = tokio_test::io::Builder::new().read(&hello).read(&garbage).build();

        engine.handle_connection(reader, Arc::clone(&conn), &recorder).await;
        assert!(engine.peers().is_empty());
    }

    #[tokio::test]
    async fn test_resolve() {
        assert_eq!(resolve("127.0.0.1:4000").await.unwrap(), "127.0.0.1:4000".parse().unwrap());
        assert!(matches!(
            resolve("not an address").await,
            Err(ProtocolError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_server_role_rejects_client_messages() {
        struct NoopServer;

        #[async_trait::async_trait]
        impl ServerHandler for NoopServer {
            async fn on_get_address(&self, _: &ProtocolEngine, _: &Arc<Connection>, _: &MessageWrapper) -> ProtocolResult<()> {
                Ok(())
            }
            async fn on_get_resources(&self, _: &ProtocolEngine, _: &Arc<Connection>, _: &MessageWrapper) -> ProtocolResult<()> {
                Ok(())
            }
            async fn on_result(&self, _: &ProtocolEngine, _: &Arc<Connection>, _: &MessageWrapper) -> ProtocolResult<()> {
                Ok(())
            }
        }

        let engine = engine("srv", None);
        let role = ServerRole(NoopServer);
        let (conn, _rx) = pipe("10.0.0.1:1011");
        let wrapper = MessageWrapper::new(Message::Resources { hashes: vec![] }, "c", "");
        let result = role.dispatch(&engine, &conn, &wrapper).await;
        assert!(matches!(
            result,
            Err(ProtocolError::UnexpectedMessage { role: "server", kind: "Resources" })
        ));
    }
}
