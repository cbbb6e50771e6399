//! Obfuscation pipe
//!
//! Sits between the browser-side peer connection and the network:
//!
//! ```text
//!  browser socket  <-->  mirror socket  --transform-->  public socket  <-->  remote peer
//!                        (per remote)   <--restore---   (per interface)
//! ```
//!
//! The browser is told that each remote endpoint lives at a mirror socket.
//! Whatever it sends there is transformed and leaves through the public
//! socket; whatever arrives on the public socket is restored and handed back
//! to the browser from the mirror standing in for the sender.
//!
//! The pipe runs as a single task. `Pipe` is a cheap handle that sends it
//! commands, so all socket tables and the transformer are owned by one place.

use super::{
    any_interface, bind_with_backoff, is_transient_recv_error, Backoff, Endpoint, TransportError,
};
use crate::obfuscation::{PassThrough, Transformer, TransformerConfig};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A mirror socket was announced for a remote endpoint.
///
/// `local` is where the browser should send traffic meant for `remote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorMapping {
    pub local: Endpoint,
    pub remote: Endpoint,
}

enum PipeCommand {
    SetTransformer {
        config: TransformerConfig,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    BindLocal {
        endpoint: Endpoint,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    BindRemote {
        endpoint: Endpoint,
        reply: oneshot::Sender<Result<Vec<Endpoint>, TransportError>>,
    },
    AddBrowserEndpoint {
        endpoint: Endpoint,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Shutdown,
}

/// Datagram read by one of the pipe's sockets
enum Inbound {
    /// From the network, on public socket `index` of interface `iface`
    Public {
        iface: IpAddr,
        index: usize,
        from: SocketAddr,
        data: Bytes,
    },
    /// From the browser, on the mirror for `remote` at replication `index`
    Mirror {
        remote: SocketAddr,
        index: usize,
        from: SocketAddr,
        data: Bytes,
    },
}

/// Handle to a running pipe
#[derive(Clone)]
pub struct Pipe {
    name: String,
    cmd_tx: mpsc::Sender<PipeCommand>,
}

impl Pipe {
    /// Start a pipe with the default bind backoff.
    ///
    /// Returns the handle and the stream of mirror announcements.
    pub fn new(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<MirrorMapping>) {
        Self::with_backoff(name, Backoff::default())
    }

    pub fn with_backoff(
        name: impl Into<String>,
        backoff: Backoff,
    ) -> (Self, mpsc::UnboundedReceiver<MirrorMapping>) {
        let name = name.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (mapping_tx, mapping_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let driver = PipeDriver {
            name: name.clone(),
            backoff,
            transformer: Box::new(PassThrough),
            public_sockets: HashMap::new(),
            bound: HashSet::new(),
            max_sockets_per_interface: 0,
            last_v4: None,
            last_v6: None,
            mirrors: HashMap::new(),
            browser_endpoints: HashMap::new(),
            browser_ports: HashSet::new(),
            cmd_rx,
            inbound_tx,
            inbound_rx,
            mapping_tx,
            readers: Vec::new(),
        };
        tokio::spawn(driver.run());

        (Self { name, cmd_tx }, mapping_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, TransportError>>) -> PipeCommand,
    ) -> Result<T, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Replace the pass-through transformer
    pub async fn set_transformer(&self, config: TransformerConfig) -> Result<(), TransportError> {
        self.request(|reply| PipeCommand::SetTransformer { config, reply })
            .await
    }

    /// Bind a public socket, retrying while the port is still being released
    pub async fn bind_local(&self, endpoint: Endpoint) -> Result<(), TransportError> {
        self.request(|reply| PipeCommand::BindLocal { endpoint, reply })
            .await
    }

    /// Ensure mirrors exist for a remote endpoint; returns their local endpoints
    pub async fn bind_remote(&self, endpoint: Endpoint) -> Result<Vec<Endpoint>, TransportError> {
        self.request(|reply| PipeCommand::BindRemote { endpoint, reply })
            .await
    }

    /// Record where the browser listens on one interface
    pub async fn add_browser_endpoint(&self, endpoint: Endpoint) -> Result<(), TransportError> {
        self.request(|reply| PipeCommand::AddBrowserEndpoint { endpoint, reply })
            .await
    }

    /// Stop the pipe and release every socket
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(PipeCommand::Shutdown).await;
    }
}

struct Mirror {
    socket: Arc<UdpSocket>,
    announced: bool,
}

struct PipeDriver {
    name: String,
    backoff: Backoff,
    transformer: Box<dyn Transformer>,
    /// Public sockets per interface, in bind order
    public_sockets: HashMap<IpAddr, Vec<Arc<UdpSocket>>>,
    /// Endpoints already bound by `bind_local`
    bound: HashSet<SocketAddr>,
    max_sockets_per_interface: usize,
    last_v4: Option<IpAddr>,
    last_v6: Option<IpAddr>,
    /// Mirrors per remote endpoint, by replication index
    mirrors: HashMap<SocketAddr, HashMap<usize, Mirror>>,
    /// Browser listening port per interface
    browser_endpoints: HashMap<IpAddr, u16>,
    browser_ports: HashSet<u16>,
    cmd_rx: mpsc::Receiver<PipeCommand>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    mapping_tx: mpsc::UnboundedSender<MirrorMapping>,
    readers: Vec<JoinHandle<()>>,
}

impl PipeDriver {
    async fn run(mut self) {
        debug!("{}: pipe started", self.name);
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(PipeCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(inbound) = self.inbound_rx.recv() => self.handle_inbound(inbound).await,
            }
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        info!("{}: pipe shut down", self.name);
    }

    async fn handle_command(&mut self, cmd: PipeCommand) {
        match cmd {
            PipeCommand::SetTransformer { config, reply } => {
                let _ = reply.send(self.set_transformer(config));
            }
            PipeCommand::BindLocal { endpoint, reply } => {
                let _ = reply.send(self.bind_local(endpoint).await);
            }
            PipeCommand::BindRemote { endpoint, reply } => {
                let _ = reply.send(self.bind_remote(endpoint).await);
            }
            PipeCommand::AddBrowserEndpoint { endpoint, reply } => {
                let _ = reply.send(self.add_browser_endpoint(endpoint));
            }
            PipeCommand::Shutdown => {}
        }
    }

    fn set_transformer(&mut self, config: TransformerConfig) -> Result<(), TransportError> {
        self.transformer = config.build()?;
        info!("{}: using transformer {}", self.name, config.name());
        Ok(())
    }

    async fn bind_local(&mut self, endpoint: Endpoint) -> Result<(), TransportError> {
        let addr = endpoint.socket_addr()?;
        if self.bound.contains(&addr) {
            debug!("{}: {} already bound", self.name, endpoint);
            return Ok(());
        }

        let socket = Arc::new(bind_with_backoff(addr, self.backoff.clone(), &self.name).await?);
        let iface = addr.ip();
        self.bound.insert(addr);

        let sockets = self.public_sockets.entry(iface).or_default();
        let index = sockets.len();
        sockets.push(socket.clone());
        let count = sockets.len();

        match iface {
            IpAddr::V4(_) => self.last_v4 = Some(iface),
            IpAddr::V6(_) => self.last_v6 = Some(iface),
        }
        self.spawn_reader(socket, move |from, data| Inbound::Public {
            iface,
            index,
            from,
            data,
        });
        info!("{}: bound public socket {} (index {})", self.name, addr, index);

        if count > self.max_sockets_per_interface {
            self.max_sockets_per_interface = count;
            // every signalled remote gets a mirror at the new index
            let signalled: Vec<SocketAddr> = self
                .mirrors
                .iter()
                .filter(|(_, set)| set.values().any(|m| m.announced))
                .map(|(remote, _)| *remote)
                .collect();
            for remote in signalled {
                if let Err(e) = self.announce_mirror(remote, count - 1).await {
                    warn!("{}: failed to replicate mirror for {}: {}", self.name, remote, e);
                }
            }
        }
        Ok(())
    }

    async fn bind_remote(&mut self, endpoint: Endpoint) -> Result<Vec<Endpoint>, TransportError> {
        let remote = endpoint.socket_addr()?;
        self.local_interface(&remote.ip())?;

        let mut locals = Vec::with_capacity(self.max_sockets_per_interface);
        for index in 0..self.max_sockets_per_interface {
            locals.push(self.announce_mirror(remote, index).await?);
        }
        Ok(locals)
    }

    fn add_browser_endpoint(&mut self, endpoint: Endpoint) -> Result<(), TransportError> {
        let ip = endpoint.ip()?;
        if let Some(previous) = self.browser_endpoints.insert(ip, endpoint.port) {
            warn!(
                "{}: browser endpoint for {} changed from port {} to {}",
                self.name, ip, previous, endpoint.port
            );
        }
        self.browser_ports.insert(endpoint.port);
        debug!("{}: browser endpoint {}", self.name, endpoint);
        Ok(())
    }

    /// Most recently bound interface of the same family as `ip`
    fn local_interface(&self, ip: &IpAddr) -> Result<IpAddr, TransportError> {
        let last = match ip {
            IpAddr::V4(_) => self.last_v4,
            IpAddr::V6(_) => self.last_v6,
        };
        last.ok_or_else(|| TransportError::NoLocalInterface(ip.to_string()))
    }

    /// Create the mirror if needed and emit its mapping the first time
    async fn announce_mirror(
        &mut self,
        remote: SocketAddr,
        index: usize,
    ) -> Result<Endpoint, TransportError> {
        let socket = self.get_or_create_mirror(remote, index).await?;
        let local = Endpoint::new(
            self.local_interface(&remote.ip())?.to_string(),
            socket.local_addr()?.port(),
        );

        let mirror = self
            .mirrors
            .get_mut(&remote)
            .and_then(|set| set.get_mut(&index))
            .ok_or(TransportError::Closed)?;
        if !mirror.announced {
            mirror.announced = true;
            debug!("{}: mirror {} stands in for {}", self.name, local, remote);
            let _ = self.mapping_tx.send(MirrorMapping {
                local: local.clone(),
                remote: Endpoint::from(remote),
            });
        }
        Ok(local)
    }

    async fn get_or_create_mirror(
        &mut self,
        remote: SocketAddr,
        index: usize,
    ) -> Result<Arc<UdpSocket>, TransportError> {
        if let Some(mirror) = self.mirrors.get(&remote).and_then(|set| set.get(&index)) {
            return Ok(mirror.socket.clone());
        }

        let socket = Arc::new(UdpSocket::bind(SocketAddr::new(any_interface(&remote.ip()), 0)).await?);
        trace!(
            "{}: new mirror {} for {} (index {})",
            self.name,
            socket.local_addr()?,
            remote,
            index
        );
        self.spawn_reader(socket.clone(), move |from, data| Inbound::Mirror {
            remote,
            index,
            from,
            data,
        });
        self.mirrors.entry(remote).or_default().insert(
            index,
            Mirror {
                socket: socket.clone(),
                announced: false,
            },
        );
        Ok(socket)
    }

    fn spawn_reader<F>(&mut self, socket: Arc<UdpSocket>, tag: F)
    where
        F: Fn(SocketAddr, Bytes) -> Inbound + Send + 'static,
    {
        let tx = self.inbound_tx.clone();
        let name = self.name.clone();
        self.readers.push(tokio::spawn(async move {
            let mut buf = vec![0u8; crate::MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        if tx.send(tag(from, Bytes::copy_from_slice(&buf[..n]))).is_err() {
                            break;
                        }
                    }
                    Err(e) if is_transient_recv_error(&e) => {
                        debug!("{}: recv error: {}", name, e);
                    }
                    Err(e) => {
                        warn!("{}: socket reader stopped: {}", name, e);
                        break;
                    }
                }
            }
        }));
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Mirror {
                remote,
                index,
                from,
                data,
            } => self.on_mirror_data(remote, index, from, data).await,
            Inbound::Public {
                iface,
                index,
                from,
                data,
            } => self.on_public_data(iface, index, from, data).await,
        }
    }

    /// Browser to network
    async fn on_mirror_data(&mut self, remote: SocketAddr, index: usize, from: SocketAddr, data: Bytes) {
        if !self.browser_endpoints.contains_key(&from.ip()) || !self.browser_ports.contains(&from.port()) {
            warn!("{}: dropping mirror traffic from unknown source {}", self.name, from);
            return;
        }
        let Some(public) = self
            .public_sockets
            .get(&from.ip())
            .and_then(|sockets| sockets.get(index))
            .cloned()
        else {
            warn!("{}: no public socket {} on {}", self.name, index, from.ip());
            return;
        };

        let packets = match self.transformer.transform(&data) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("{}: transform failed: {}", self.name, e);
                return;
            }
        };
        for packet in packets {
            if let Err(e) = public.send_to(&packet, remote).await {
                warn!("{}: send to {} failed: {}", self.name, remote, e);
            }
        }
    }

    /// Network to browser
    async fn on_public_data(&mut self, iface: IpAddr, index: usize, from: SocketAddr, data: Bytes) {
        let Some(&browser_port) = self.browser_endpoints.get(&iface) else {
            debug!("{}: no browser endpoint on {}, dropping", self.name, iface);
            return;
        };

        let packets = match self.transformer.restore(&data) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("{}: restore from {} failed: {}", self.name, from, e);
                return;
            }
        };
        if packets.is_empty() {
            return;
        }

        // unsignalled senders get a mirror too, it is just never announced
        let mirror = match self.get_or_create_mirror(from, index).await {
            Ok(mirror) => mirror,
            Err(e) => {
                warn!("{}: no mirror for {}: {}", self.name, from, e);
                return;
            }
        };
        let browser = SocketAddr::new(iface, browser_port);
        for packet in packets {
            if let Err(e) = mirror.send_to(&packet, browser).await {
                warn!("{}: delivery to browser {} failed: {}", self.name, browser, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::CaesarConfig;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn free_port() -> u16 {
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    }

    async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = vec![0u8; 2048];
        let (n, from) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf.truncate(n);
        (buf, from)
    }

    #[tokio::test]
    async fn test_bind_remote_without_interface() {
        let (pipe, _mappings) = Pipe::new("test");
        let err = pipe
            .bind_remote(Endpoint::new("127.0.0.1", 9))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoLocalInterface(_)));
        pipe.shutdown().await;
    }

    #[tokio::test]
    async fn test_redundant_bind_local() {
        let (pipe, _mappings) = Pipe::new("test");
        let local = Endpoint::new("127.0.0.1", free_port().await);
        pipe.bind_local(local.clone()).await.unwrap();
        pipe.bind_local(local).await.unwrap();
        pipe.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_transformer_config_rejected() {
        let (pipe, _mappings) = Pipe::new("test");
        let bad = TransformerConfig::Encryption(crate::obfuscation::EncryptionConfig {
            key: "00".into(),
        });
        assert!(pipe.set_transformer(bad).await.is_err());
        pipe.shutdown().await;
    }

    #[tokio::test]
    async fn test_mapping_emitted_once() {
        let (pipe, mut mappings) = Pipe::new("test");
        pipe.bind_local(Endpoint::new("127.0.0.1", free_port().await))
            .await
            .unwrap();

        let remote = Endpoint::new("127.0.0.1", 40000);
        let first = pipe.bind_remote(remote.clone()).await.unwrap();
        let second = pipe.bind_remote(remote.clone()).await.unwrap();
        assert_eq!(first, second);

        let mapping = mappings.recv().await.unwrap();
        assert_eq!(mapping.remote, remote);
        assert_eq!(mapping.local, first[0]);
        assert!(mappings.try_recv().is_err());
        pipe.shutdown().await;
    }

    #[tokio::test]
    async fn test_replication_announces_new_index() {
        let (pipe, mut mappings) = Pipe::new("test");
        pipe.bind_local(Endpoint::new("127.0.0.1", free_port().await))
            .await
            .unwrap();
        let remote = Endpoint::new("127.0.0.1", 40001);
        pipe.bind_remote(remote.clone()).await.unwrap();
        let first = mappings.recv().await.unwrap();

        pipe.bind_local(Endpoint::new("127.0.0.1", free_port().await))
            .await
            .unwrap();
        let second = mappings.recv().await.unwrap();
        assert_eq!(second.remote, remote);
        assert_ne!(second.local, first.local);
        assert_eq!(pipe.bind_remote(remote).await.unwrap().len(), 2);
        pipe.shutdown().await;
    }

    #[tokio::test]
    async fn test_traffic_is_transformed_both_ways() {
        let (pipe, mut mappings) = Pipe::new("test");
        pipe.set_transformer(TransformerConfig::Caesar(CaesarConfig { key: 3 }))
            .await
            .unwrap();

        let public_port = free_port().await;
        pipe.bind_local(Endpoint::new("127.0.0.1", public_port))
            .await
            .unwrap();

        let browser = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        pipe.add_browser_endpoint(browser.local_addr().unwrap().into())
            .await
            .unwrap();
        pipe.bind_remote(remote.local_addr().unwrap().into())
            .await
            .unwrap();
        let mapping = mappings.recv().await.unwrap();
        let mirror = mapping.local.socket_addr().unwrap();

        // browser -> mirror -> transform -> public -> remote
        browser.send_to(b"abc", mirror).await.unwrap();
        let (wire, from) = recv(&remote).await;
        assert_eq!(wire, b"def");
        assert_eq!(from.port(), public_port);

        // remote -> public -> restore -> mirror -> browser
        remote.send_to(b"xyz", from).await.unwrap();
        let (plain, from) = recv(&browser).await;
        assert_eq!(plain, b"uvw");
        assert_eq!(from.port(), mirror.port());

        pipe.shutdown().await;
    }

    #[tokio::test]
    async fn test_mirror_drops_unknown_sources() {
        let (pipe, mut mappings) = Pipe::new("test");
        pipe.bind_local(Endpoint::new("127.0.0.1", free_port().await))
            .await
            .unwrap();
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        pipe.bind_remote(remote.local_addr().unwrap().into())
            .await
            .unwrap();
        let mirror = mappings.recv().await.unwrap().local.socket_addr().unwrap();

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"hello", mirror).await.unwrap();

        let mut buf = [0u8; 16];
        let got = timeout(Duration::from_millis(200), remote.recv_from(&mut buf)).await;
        assert!(got.is_err());
        pipe.shutdown().await;
    }
}
