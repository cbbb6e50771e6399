//! Datagram peer connection
//!
//! A minimal stand-in for a WebRTC peer connection: one UDP socket, one
//! host candidate, an offer/answer exchange carrying the ICE username
//! fragment, and a ping/pong connectivity check. Datagram format:
//!
//! ```text
//! +--------+------------------------------------------+
//! |  Type  |  Body                                    |
//! +--------+------------------------------------------+
//! PING  0x01  ufrag of the receiver
//! PONG  0x02  ufrag echoed back
//! DATA  0x03  label length (1B) | label | payload
//! BYE   0x04  (empty)
//! ```

use super::{
    ConnectionState, DataChannel, PeerConnection, PeerError, PeerFactory, PeerSignal,
    RtcConfig, SessionDescription, StateSender, StateWatch,
};
use crate::candidate::{Candidate, CandidateType};
use crate::crypto::random_vec;
use crate::transport::is_transient_recv_error;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

/// Interval between connectivity checks while unconnected
pub const PING_INTERVAL: Duration = Duration::from_millis(50);

/// How long negotiation may take before the connection gives up
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Media id advertised in every session description
pub const DATA_MID: &str = "data";

const HOST_PRIORITY: u32 = 2122260223;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Datagram {
    Ping(String),
    Pong(String),
    Data { label: String, payload: Bytes },
    Bye,
}

impl Datagram {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Datagram::Ping(ufrag) => {
                buf.put_u8(0x01);
                buf.put_slice(ufrag.as_bytes());
            }
            Datagram::Pong(ufrag) => {
                buf.put_u8(0x02);
                buf.put_slice(ufrag.as_bytes());
            }
            Datagram::Data { label, payload } => {
                buf.put_u8(0x03);
                buf.put_u8(label.len() as u8);
                buf.put_slice(label.as_bytes());
                buf.put_slice(payload);
            }
            Datagram::Bye => buf.put_u8(0x04),
        }
        buf.freeze()
    }

    fn decode(data: &[u8]) -> Option<Self> {
        let mut buf = data;
        if !buf.has_remaining() {
            return None;
        }
        let text = |b: &[u8]| String::from_utf8(b.to_vec()).ok();
        match buf.get_u8() {
            0x01 => text(buf).map(Datagram::Ping),
            0x02 => text(buf).map(Datagram::Pong),
            0x03 => {
                if !buf.has_remaining() {
                    return None;
                }
                let len = buf.get_u8() as usize;
                if buf.remaining() < len {
                    return None;
                }
                let label = text(&buf[..len])?;
                Some(Datagram::Data {
                    label,
                    payload: Bytes::copy_from_slice(&buf[len..]),
                })
            }
            0x04 => Some(Datagram::Bye),
            _ => None,
        }
    }
}

fn build_sdp(ufrag: &str, candidate: &Candidate) -> String {
    format!(
        "v=0\r\n\
         o=- {} 2 IN IP4 127.0.0.1\r\n\
         s=-\r\n\
         t=0 0\r\n\
         m=application 9 UDP/DATA webrtc-datachannel\r\n\
         c=IN IP4 0.0.0.0\r\n\
         a=ice-ufrag:{}\r\n\
         a={}\r\n\
         a=mid:{}\r\n",
        crate::crypto::random_u32(),
        ufrag,
        candidate.to_line(),
        DATA_MID
    )
}

fn ufrag_from_sdp(sdp: &str) -> Result<String, PeerError> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("a=ice-ufrag:"))
        .map(|ufrag| ufrag.trim().to_string())
        .ok_or_else(|| PeerError::InvalidSignal("description has no ice-ufrag".to_string()))
}

enum PeerCommand {
    Negotiate(oneshot::Sender<Result<(), PeerError>>),
    Signal(PeerSignal, oneshot::Sender<Result<(), PeerError>>),
    OpenChannel(String, oneshot::Sender<Result<DataChannel, PeerError>>),
    Close(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

/// Datagram peer connection handle
pub struct UdpPeerConnection {
    name: String,
    local: SocketAddr,
    cmd_tx: mpsc::Sender<PeerCommand>,
    signal_rx: Option<mpsc::UnboundedReceiver<PeerSignal>>,
    channel_rx: Option<mpsc::UnboundedReceiver<DataChannel>>,
    state: StateWatch,
}

impl UdpPeerConnection {
    /// Bind the connection's socket and start its task
    pub async fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        config: &RtcConfig,
    ) -> Result<Self, PeerError> {
        let name = name.into();
        let socket = UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        if !config.ice_servers.is_empty() {
            debug!(
                "{}: {} ice servers configured, advertising host candidate only",
                name,
                config.ice_servers.len()
            );
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = StateWatch::channel();

        let driver = PeerDriver {
            name: name.clone(),
            socket,
            local,
            ufrag: hex::encode(random_vec(4)),
            role: None,
            remote_ufrag: None,
            remote_candidates: Vec::new(),
            selected: None,
            channels: HashMap::new(),
            outbound_tx,
            outbound_rx,
            pending_out: Vec::new(),
            signal_tx,
            channel_tx,
            state: state_tx,
            cmd_rx,
            deadline: None,
        };
        tokio::spawn(driver.run());
        info!("{}: listening on {}", name, local);

        Ok(Self {
            name,
            local,
            cmd_tx,
            signal_rx: Some(signal_rx),
            channel_rx: Some(channel_rx),
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, PeerError>>) -> PeerCommand,
    ) -> Result<T, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| PeerError::Closed)?;
        rx.await.map_err(|_| PeerError::Closed)?
    }
}

#[async_trait]
impl PeerConnection for UdpPeerConnection {
    type Signal = PeerSignal;

    async fn negotiate_connection(&self) -> Result<(), PeerError> {
        self.request(PeerCommand::Negotiate).await
    }

    async fn handle_signal_message(&self, signal: PeerSignal) -> Result<(), PeerError> {
        self.request(|reply| PeerCommand::Signal(signal, reply)).await
    }

    async fn open_data_channel(&self, label: &str) -> Result<DataChannel, PeerError> {
        let label = label.to_string();
        self.request(|reply| PeerCommand::OpenChannel(label, reply))
            .await
    }

    async fn close(&self) -> Result<(), PeerError> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(PeerCommand::Close(reply)).await.is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }

    fn take_signal_queue(&mut self) -> Option<mpsc::UnboundedReceiver<PeerSignal>> {
        self.signal_rx.take()
    }

    fn take_channel_queue(&mut self) -> Option<mpsc::UnboundedReceiver<DataChannel>> {
        self.channel_rx.take()
    }

    fn state(&self) -> StateWatch {
        self.state.clone()
    }
}

struct PeerDriver {
    name: String,
    socket: UdpSocket,
    local: SocketAddr,
    ufrag: String,
    role: Option<Role>,
    remote_ufrag: Option<String>,
    remote_candidates: Vec<SocketAddr>,
    /// Address that answered our connectivity check
    selected: Option<SocketAddr>,
    channels: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    outbound_tx: mpsc::UnboundedSender<(String, Bytes)>,
    outbound_rx: mpsc::UnboundedReceiver<(String, Bytes)>,
    /// Data queued before the connection came up
    pending_out: Vec<(String, Bytes)>,
    signal_tx: mpsc::UnboundedSender<PeerSignal>,
    channel_tx: mpsc::UnboundedSender<DataChannel>,
    state: StateSender,
    cmd_rx: mpsc::Receiver<PeerCommand>,
    deadline: Option<Instant>,
}

impl PeerDriver {
    async fn run(mut self) {
        let closer = self.event_loop().await;

        if let Some(remote) = self.selected {
            let _ = self.socket.send_to(&Datagram::Bye.encode(), remote).await;
        }
        self.state.set(ConnectionState::Closed);
        info!("{}: closed", self.name);

        // release the port before acknowledging the close
        drop(self);
        if let Some(reply) = closer {
            let _ = reply.send(());
        }
    }

    async fn event_loop(&mut self) -> Option<oneshot::Sender<()>> {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        let mut buf = vec![0u8; crate::MAX_DATAGRAM_SIZE];
        loop {
            let deadline = self
                .deadline
                .unwrap_or_else(|| Instant::now() + CONNECT_TIMEOUT);
            let waiting = self.deadline.is_some() && self.selected.is_none();
            let should_ping = self.should_ping();

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(PeerCommand::Close(reply)) => return Some(reply),
                    None => return None,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, from)) => {
                        if !self.handle_datagram(&buf[..n], from).await {
                            return None;
                        }
                    }
                    Err(e) if is_transient_recv_error(&e) => {
                        debug!("{}: recv error: {}", self.name, e)
                    }
                    Err(e) => {
                        warn!("{}: socket failed: {}", self.name, e);
                        return None;
                    }
                },
                Some((label, data)) = self.outbound_rx.recv() => self.send_data(label, data).await,
                _ = ping.tick(), if should_ping => self.send_pings().await,
                _ = sleep_until(deadline), if waiting => {
                    warn!("{}: no connectivity after {:?}", self.name, CONNECT_TIMEOUT);
                    return None;
                }
            }
        }
    }

    fn should_ping(&self) -> bool {
        self.selected.is_none()
            && self.remote_ufrag.is_some()
            && !self.remote_candidates.is_empty()
    }

    async fn handle_command(&mut self, cmd: PeerCommand) {
        match cmd {
            PeerCommand::Negotiate(reply) => {
                let _ = reply.send(self.negotiate());
            }
            PeerCommand::Signal(signal, reply) => {
                let _ = reply.send(self.handle_signal(signal));
            }
            PeerCommand::OpenChannel(label, reply) => {
                let _ = reply.send(Ok(self.open_channel(label)));
            }
            PeerCommand::Close(_) => {}
        }
    }

    fn local_candidate(&self) -> Candidate {
        Candidate {
            foundation: "1".to_string(),
            component: 1,
            protocol: "udp".to_string(),
            priority: HOST_PRIORITY,
            ip: self.local.ip().to_string(),
            port: self.local.port(),
            candidate_type: CandidateType::Host,
            related_address: None,
            related_port: None,
            extensions: vec![("generation".to_string(), "0".to_string())],
            sdp_mid: Some(DATA_MID.to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn start(&mut self, role: Role) {
        self.role = Some(role);
        self.deadline = Some(Instant::now() + CONNECT_TIMEOUT);
        self.state.set(ConnectionState::Connecting);
    }

    /// Emit a description followed by our candidates
    fn emit_description(&self, description: SessionDescription, role: Role) {
        let signal = match role {
            Role::Offerer => PeerSignal::Offer { description },
            Role::Answerer => PeerSignal::Answer { description },
        };
        let _ = self.signal_tx.send(signal);
        let _ = self.signal_tx.send(PeerSignal::Candidate {
            candidate: self.local_candidate().to_ice_candidate(),
        });
        let _ = self.signal_tx.send(PeerSignal::NoMoreCandidates);
    }

    fn negotiate(&mut self) -> Result<(), PeerError> {
        if self.role.is_some() {
            return Err(PeerError::InvalidState("already negotiating".to_string()));
        }
        self.start(Role::Offerer);
        let sdp = build_sdp(&self.ufrag, &self.local_candidate());
        self.emit_description(SessionDescription::offer(sdp), Role::Offerer);
        debug!("{}: sent offer", self.name);
        Ok(())
    }

    fn handle_signal(&mut self, signal: PeerSignal) -> Result<(), PeerError> {
        match signal {
            PeerSignal::Offer { description } => {
                if self.role.is_some() {
                    return Err(PeerError::InvalidState("unexpected offer".to_string()));
                }
                self.remote_ufrag = Some(ufrag_from_sdp(&description.sdp)?);
                self.start(Role::Answerer);
                let sdp = build_sdp(&self.ufrag, &self.local_candidate());
                self.emit_description(SessionDescription::answer(sdp), Role::Answerer);
                debug!("{}: answered offer", self.name);
            }
            PeerSignal::Answer { description } => {
                if self.role != Some(Role::Offerer) || self.remote_ufrag.is_some() {
                    return Err(PeerError::InvalidState("unexpected answer".to_string()));
                }
                self.remote_ufrag = Some(ufrag_from_sdp(&description.sdp)?);
                debug!("{}: got answer", self.name);
            }
            PeerSignal::Candidate { candidate } => {
                let candidate = Candidate::from_ice_candidate(&candidate)?;
                if !candidate.is_udp() {
                    trace!("{}: ignoring {} candidate", self.name, candidate.protocol);
                    return Ok(());
                }
                let addr = candidate.endpoint().socket_addr()?;
                if !self.remote_candidates.contains(&addr) {
                    debug!("{}: remote candidate {}", self.name, addr);
                    self.remote_candidates.push(addr);
                }
            }
            PeerSignal::NoMoreCandidates => {
                debug!("{}: remote finished gathering", self.name);
            }
        }
        Ok(())
    }

    fn open_channel(&mut self, label: String) -> DataChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(label.clone(), tx);
        DataChannel::new(label, self.outbound_tx.clone(), rx)
    }

    async fn send_to(&self, datagram: &Datagram, addr: SocketAddr) {
        if let Err(e) = self.socket.send_to(&datagram.encode(), addr).await {
            debug!("{}: send to {} failed: {}", self.name, addr, e);
        }
    }

    async fn send_pings(&self) {
        let Some(ufrag) = &self.remote_ufrag else {
            return;
        };
        let ping = Datagram::Ping(ufrag.clone());
        for addr in &self.remote_candidates {
            self.send_to(&ping, *addr).await;
        }
    }

    async fn send_data(&mut self, label: String, payload: Bytes) {
        if label.len() > u8::MAX as usize {
            warn!("{}: channel label too long, dropping message", self.name);
            return;
        }
        match self.selected {
            Some(remote) => {
                self.send_to(&Datagram::Data { label, payload }, remote)
                    .await
            }
            None => self.pending_out.push((label, payload)),
        }
    }

    /// Returns false once the remote side has said goodbye
    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> bool {
        let Some(datagram) = Datagram::decode(data) else {
            trace!("{}: undecodable datagram from {}", self.name, from);
            return true;
        };
        match datagram {
            Datagram::Ping(ufrag) => {
                if ufrag == self.ufrag {
                    self.send_to(&Datagram::Pong(ufrag), from).await;
                } else {
                    trace!("{}: ping for another session from {}", self.name, from);
                }
            }
            Datagram::Pong(ufrag) => {
                if self.selected.is_none() && self.remote_ufrag.as_deref() == Some(ufrag.as_str()) {
                    info!("{}: connected via {}", self.name, from);
                    self.selected = Some(from);
                    self.state.set(ConnectionState::Connected);
                    for (label, payload) in std::mem::take(&mut self.pending_out) {
                        self.send_data(label, payload).await;
                    }
                }
            }
            Datagram::Data { label, payload } => {
                if self.state.get() != ConnectionState::Connected {
                    trace!("{}: data before connectivity, dropping", self.name);
                    return true;
                }
                self.deliver(label, payload);
            }
            Datagram::Bye => {
                info!("{}: remote closed", self.name);
                return false;
            }
        }
        true
    }

    fn deliver(&mut self, label: String, payload: Bytes) {
        if !self.channels.contains_key(&label) {
            debug!("{}: remote opened channel {}", self.name, label);
            let (tx, rx) = mpsc::unbounded_channel();
            self.channels.insert(label.clone(), tx);
            let _ = self
                .channel_tx
                .send(DataChannel::new(label.clone(), self.outbound_tx.clone(), rx));
        }
        if let Some(tx) = self.channels.get(&label) {
            let _ = tx.send(payload);
        }
    }
}

/// Creates `UdpPeerConnection`s bound to one interface
#[derive(Debug, Clone)]
pub struct UdpPeerFactory {
    bind_ip: IpAddr,
}

impl UdpPeerFactory {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }
}

impl Default for UdpPeerFactory {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

#[async_trait]
impl PeerFactory for UdpPeerFactory {
    type Connection = UdpPeerConnection;

    async fn create(&self, name: &str, config: &RtcConfig) -> Result<UdpPeerConnection, PeerError> {
        UdpPeerConnection::bind(name, SocketAddr::new(self.bind_ip, 0), config).await
    }
}
