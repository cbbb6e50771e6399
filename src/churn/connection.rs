//! Churn connection state machine
//!
//! One task owns the probe, the obfuscated connection and the pipe. Every
//! event (a command, a signal from either connection, a mirror mapping, the
//! probe timer) is handled to completion, then `advance` re-checks the gates:
//!
//! ```text
//! probe complete + transformer known  ->  build pipe, bind probe ports
//! pipe built                          ->  flush browser endpoints, remote
//!                                         binds and held descriptions
//! local description sent             ->  send probe candidates to the peer,
//!                                         under the obfuscated mid if known
//! ```

use super::{ChurnError, ChurnSignal, PUBLIC_ENDPOINT_CANDIDATE};
use crate::candidate::{
    filter_candidates_from_sdp, get_mid_from_sdp, select_public_address, Candidate,
};
use crate::config::{ChurnConfig, PipeConfig};
use crate::obfuscation::{CaesarConfig, TransformerConfig};
use crate::peer::{
    DataChannel, PeerConnection, PeerError, PeerFactory, PeerSignal, RtcConfig,
    SessionDescription, StateWatch,
};
use crate::transport::{Backoff, Endpoint, MirrorMapping, Pipe};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

/// Grace period between closing the obfuscated connection and the pipe
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

enum ChurnCommand {
    Negotiate(oneshot::Sender<Result<(), PeerError>>),
    Signal(ChurnSignal, oneshot::Sender<Result<(), PeerError>>),
    OpenChannel(String, oneshot::Sender<Result<DataChannel, PeerError>>),
    Close(oneshot::Sender<()>),
}

/// An obfuscated peer connection
pub struct ChurnConnection {
    name: String,
    cmd_tx: mpsc::Sender<ChurnCommand>,
    signal_rx: Option<mpsc::UnboundedReceiver<ChurnSignal>>,
    channel_rx: Option<mpsc::UnboundedReceiver<DataChannel>>,
    state: StateWatch,
}

impl ChurnConnection {
    /// Create the probe and obfuscated connections and start probing
    pub async fn new<F: PeerFactory>(
        name: impl Into<String>,
        factory: &F,
        config: ChurnConfig,
    ) -> Result<Self, ChurnError> {
        Self::with_pipe_config(name, factory, config, &PipeConfig::default()).await
    }

    pub async fn with_pipe_config<F: PeerFactory>(
        name: impl Into<String>,
        factory: &F,
        config: ChurnConfig,
        pipe_config: &PipeConfig,
    ) -> Result<Self, ChurnError> {
        let name = name.into();

        let mut probe = factory
            .create(
                &format!("{}-probe", name),
                &RtcConfig::with_ice_servers(config.stun_servers.clone()),
            )
            .await?;
        // no STUN: connectivity comes from the addresses the probe found
        let mut obfuscated = factory
            .create(&format!("{}-obfuscated", name), &RtcConfig::default())
            .await?;

        let taken = || PeerError::InvalidState("signal queue already taken".to_string());
        let probe_signals = probe.take_signal_queue().ok_or_else(taken)?;
        let obfuscated_signals = obfuscated.take_signal_queue().ok_or_else(taken)?;
        let channel_rx = obfuscated.take_channel_queue();
        let state = obfuscated.state();

        probe.negotiate_connection().await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let driver = ChurnDriver {
            name: name.clone(),
            probe_deadline: Instant::now() + config.probe_timeout(),
            config,
            backoff: pipe_config.backoff(),
            probe: Some(probe),
            probe_signals: Some(probe_signals),
            obfuscated,
            obfuscated_signals,
            signal_tx,
            cmd_rx,
            negotiated: false,
            probe_complete: false,
            probe_candidates: Vec::new(),
            unsent_probe_candidates: Vec::new(),
            transformer: None,
            pipe: None,
            mappings: None,
            mid: None,
            local_description_sent: false,
            remote_candidates: HashMap::new(),
            pending_browser_endpoints: Vec::new(),
            pending_remote_binds: Vec::new(),
            pending_descriptions: Vec::new(),
        };
        tokio::spawn(driver.run());

        Ok(Self {
            name,
            cmd_tx,
            signal_rx: Some(signal_rx),
            channel_rx,
            state,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, PeerError>>) -> ChurnCommand,
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
impl PeerConnection for ChurnConnection {
    type Signal = ChurnSignal;

    async fn negotiate_connection(&self) -> Result<(), PeerError> {
        self.request(ChurnCommand::Negotiate).await
    }

    async fn handle_signal_message(&self, signal: ChurnSignal) -> Result<(), PeerError> {
        self.request(|reply| ChurnCommand::Signal(signal, reply))
            .await
    }

    async fn open_data_channel(&self, label: &str) -> Result<DataChannel, PeerError> {
        let label = label.to_string();
        self.request(|reply| ChurnCommand::OpenChannel(label, reply))
            .await
    }

    async fn close(&self) -> Result<(), PeerError> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ChurnCommand::Close(reply)).await.is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }

    fn take_signal_queue(&mut self) -> Option<mpsc::UnboundedReceiver<ChurnSignal>> {
        self.signal_rx.take()
    }

    fn take_channel_queue(&mut self) -> Option<mpsc::UnboundedReceiver<DataChannel>> {
        self.channel_rx.take()
    }

    fn state(&self) -> StateWatch {
        self.state.clone()
    }
}

struct RemoteCandidate {
    candidate: Candidate,
    /// Derived from a `publicEndpoint` hint rather than received as a candidate
    synthetic: bool,
}

struct ChurnDriver<C> {
    name: String,
    config: ChurnConfig,
    backoff: Backoff,

    probe: Option<C>,
    probe_signals: Option<mpsc::UnboundedReceiver<PeerSignal>>,
    probe_deadline: Instant,
    obfuscated: C,
    obfuscated_signals: mpsc::UnboundedReceiver<PeerSignal>,
    signal_tx: mpsc::UnboundedSender<ChurnSignal>,
    cmd_rx: mpsc::Receiver<ChurnCommand>,

    negotiated: bool,
    probe_complete: bool,
    /// UDP candidates found by the probe, bound on the pipe once it exists
    probe_candidates: Vec<Candidate>,
    /// Probe candidates not yet sent to the peer
    unsent_probe_candidates: Vec<Candidate>,
    transformer: Option<TransformerConfig>,
    pipe: Option<Pipe>,
    mappings: Option<mpsc::UnboundedReceiver<MirrorMapping>>,
    /// Media id of the obfuscated connection
    mid: Option<String>,
    /// A local description has gone out, with or without a usable mid
    local_description_sent: bool,
    /// Remote candidates by endpoint key
    remote_candidates: HashMap<String, RemoteCandidate>,

    pending_browser_endpoints: Vec<Endpoint>,
    pending_remote_binds: Vec<Endpoint>,
    pending_descriptions: Vec<PeerSignal>,
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl<C> ChurnDriver<C>
where
    C: PeerConnection<Signal = PeerSignal>,
{
    async fn run(mut self) {
        let obfuscated_state = self.obfuscated.state();
        let obfuscated_closed = obfuscated_state.once_closed();
        tokio::pin!(obfuscated_closed);
        let probe_timer = sleep_until(self.probe_deadline);
        tokio::pin!(probe_timer);

        let closer = loop {
            let probing = !self.probe_complete;
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ChurnCommand::Close(reply)) => break Some(reply),
                    None => break None,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(signal) = recv_opt(&mut self.probe_signals) => self.on_probe_signal(signal).await,
                Some(signal) = self.obfuscated_signals.recv() => self.on_obfuscated_signal(signal).await,
                Some(mapping) = recv_opt(&mut self.mappings) => self.on_mapping(mapping).await,
                _ = &mut probe_timer, if probing => {
                    warn!("{}: probing timed out, closing probe connection", self.name);
                    self.complete_probe().await;
                }
                _ = &mut obfuscated_closed => {
                    info!("{}: obfuscated connection closed", self.name);
                    break None;
                }
            }
            self.advance().await;
        };

        self.shutdown().await;
        if let Some(reply) = closer {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, cmd: ChurnCommand) {
        match cmd {
            ChurnCommand::Negotiate(reply) => {
                let _ = reply.send(self.negotiate().await);
            }
            ChurnCommand::Signal(signal, reply) => {
                let result = self
                    .on_peer_signal(signal)
                    .await
                    .map_err(|e| PeerError::InvalidSignal(e.to_string()));
                let _ = reply.send(result);
            }
            ChurnCommand::OpenChannel(label, reply) => {
                let _ = reply.send(self.obfuscated.open_data_channel(&label).await);
            }
            ChurnCommand::Close(_) => {}
        }
    }

    fn send(&self, signal: ChurnSignal) {
        let _ = self.signal_tx.send(signal);
    }

    /// Signal the transformer first so the peer can build a matching pipe
    async fn negotiate(&mut self) -> Result<(), PeerError> {
        if self.negotiated {
            return Err(PeerError::InvalidState("already negotiating".to_string()));
        }
        self.negotiated = true;

        match self.config.transformer.clone() {
            Some(config) => {
                self.send(ChurnSignal::transformer(config.clone()));
                self.set_transformer(config, "local");
            }
            None => {
                let caesar = CaesarConfig::random();
                self.send(ChurnSignal::caesar(caesar.key));
                self.set_transformer(TransformerConfig::Caesar(caesar), "local");
            }
        }
        self.obfuscated.negotiate_connection().await
    }

    fn set_transformer(&mut self, config: TransformerConfig, source: &str) {
        if let Some(current) = &self.transformer {
            debug!(
                "{}: already using {}, ignoring {} {} config",
                self.name,
                current.name(),
                source,
                config.name()
            );
            return;
        }
        info!("{}: {} transformer config: {}", self.name, source, config.name());
        self.transformer = Some(config);
    }

    async fn on_probe_signal(&mut self, signal: PeerSignal) {
        match signal {
            PeerSignal::Candidate { candidate } => match Candidate::from_ice_candidate(&candidate) {
                Ok(c) if c.is_udp() => {
                    debug!("{}: probe found {}", self.name, c.endpoint());
                    self.probe_candidates.push(c.clone());
                    self.unsent_probe_candidates.push(c);
                }
                Ok(c) => trace!("{}: skipping {} probe candidate", self.name, c.protocol),
                Err(e) => debug!("{}: unparseable probe candidate: {}", self.name, e),
            },
            PeerSignal::NoMoreCandidates => self.complete_probe().await,
            other => trace!("{}: ignoring probe signal {:?}", self.name, other),
        }
    }

    async fn complete_probe(&mut self) {
        if self.probe_complete {
            return;
        }
        self.probe_complete = true;
        self.probe_signals = None;
        if let Some(probe) = self.probe.take() {
            // releases the probe's ports so the pipe can take them over
            if let Err(e) = probe.close().await {
                debug!("{}: closing probe: {}", self.name, e);
            }
        }
        info!(
            "{}: probing complete with {} candidates",
            self.name,
            self.probe_candidates.len()
        );
    }

    async fn on_obfuscated_signal(&mut self, signal: PeerSignal) {
        match signal {
            PeerSignal::Offer { description } => {
                let description = self.scrub_local_description(description);
                self.send(ChurnSignal::webrtc(PeerSignal::Offer { description }));
            }
            PeerSignal::Answer { description } => {
                let description = self.scrub_local_description(description);
                self.send(ChurnSignal::webrtc(PeerSignal::Answer { description }));
            }
            PeerSignal::Candidate { candidate } => {
                // tells us where the browser listens; the peer never sees it
                let candidate = match Candidate::from_ice_candidate(&candidate) {
                    Ok(c) if c.is_udp() => c,
                    Ok(c) => {
                        trace!("{}: skipping {} obfuscated candidate", self.name, c.protocol);
                        return;
                    }
                    Err(e) => {
                        debug!("{}: unparseable obfuscated candidate: {}", self.name, e);
                        return;
                    }
                };
                match candidate.local_endpoint() {
                    Ok(endpoint) if self.pipe.is_some() => self.add_browser_endpoint(endpoint).await,
                    Ok(endpoint) => self.pending_browser_endpoints.push(endpoint),
                    Err(e) => debug!("{}: ignoring obfuscated candidate: {}", self.name, e),
                }
            }
            PeerSignal::NoMoreCandidates => {
                self.send(ChurnSignal::webrtc(PeerSignal::NoMoreCandidates));
            }
        }
    }

    /// Strip candidates from an outgoing description and learn its mid
    fn scrub_local_description(&mut self, mut description: SessionDescription) -> SessionDescription {
        description.sdp = filter_candidates_from_sdp(&description.sdp);
        match get_mid_from_sdp(&description.sdp) {
            Ok(mid) => self.mid = Some(mid),
            Err(e) => warn!("{}: {}, keeping probe candidate mids", self.name, e),
        }
        self.local_description_sent = true;
        description
    }

    async fn on_peer_signal(&mut self, signal: ChurnSignal) -> Result<(), ChurnError> {
        if let Some(key) = signal.caesar {
            if key == 0 {
                return Err(ChurnError::InvalidKey(key));
            }
        }
        if let Some(config) = &signal.transformer {
            // reject configs we could not build before they gate anything
            config.build()?;
        }

        if let Some(endpoint) = signal.public_endpoint {
            let mut candidate = Candidate::parse(PUBLIC_ENDPOINT_CANDIDATE)?.with_endpoint(&endpoint);
            candidate.sdp_mline_index = Some(0);
            self.add_remote_candidate(candidate, true).await;
        }
        if let Some(config) = signal.transformer {
            self.set_transformer(config, "remote");
        }
        if let Some(key) = signal.caesar {
            debug!("{}: received legacy caesar cipher config", self.name);
            self.set_transformer(TransformerConfig::Caesar(CaesarConfig { key }), "remote");
        }

        match signal.webrtc_message {
            Some(message @ (PeerSignal::Offer { .. } | PeerSignal::Answer { .. })) => {
                // held until the pipe exists, so the obfuscated connection
                // never starts checks against unmapped addresses
                if self.pipe.is_some() {
                    self.forward_description(message).await;
                } else {
                    self.pending_descriptions.push(message);
                }
            }
            Some(PeerSignal::Candidate { candidate }) => {
                let candidate = Candidate::from_ice_candidate(&candidate)?;
                if candidate.is_udp() {
                    self.add_remote_candidate(candidate, false).await;
                } else {
                    debug!("{}: ignoring {} remote candidate", self.name, candidate.protocol);
                }
            }
            Some(PeerSignal::NoMoreCandidates) => {
                debug!("{}: peer finished signalling candidates", self.name);
            }
            None => {}
        }
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: Candidate, synthetic: bool) {
        let endpoint = candidate.endpoint();
        let key = endpoint.key();
        if let Some(existing) = self.remote_candidates.get(&key) {
            if synthetic && !existing.synthetic {
                debug!("{}: keeping received candidate for {}", self.name, key);
                return;
            }
        }

        let is_new = self
            .remote_candidates
            .insert(key, RemoteCandidate { candidate, synthetic })
            .is_none();
        if !is_new {
            return;
        }
        if self.pipe.is_some() {
            self.bind_remote(endpoint).await;
        } else {
            self.pending_remote_binds.push(endpoint);
        }
    }

    async fn bind_remote(&self, endpoint: Endpoint) {
        let Some(pipe) = &self.pipe else {
            return;
        };
        if let Err(e) = pipe.bind_remote(endpoint.clone()).await {
            warn!("{}: bind_remote {} failed: {}", self.name, endpoint, e);
        }
    }

    async fn add_browser_endpoint(&self, endpoint: Endpoint) {
        let Some(pipe) = &self.pipe else {
            return;
        };
        if let Err(e) = pipe.add_browser_endpoint(endpoint.clone()).await {
            warn!("{}: add_browser_endpoint {} failed: {}", self.name, endpoint, e);
        }
    }

    async fn forward_description(&self, message: PeerSignal) {
        let message = match message {
            PeerSignal::Offer { mut description } => {
                description.sdp = filter_candidates_from_sdp(&description.sdp);
                PeerSignal::Offer { description }
            }
            PeerSignal::Answer { mut description } => {
                description.sdp = filter_candidates_from_sdp(&description.sdp);
                PeerSignal::Answer { description }
            }
            other => other,
        };
        if let Err(e) = self.obfuscated.handle_signal_message(message).await {
            warn!("{}: obfuscated connection rejected description: {}", self.name, e);
        }
    }

    /// Present a mirror to the obfuscated connection as the remote candidate
    async fn on_mapping(&mut self, mapping: MirrorMapping) {
        let Some(remote) = self.remote_candidates.get(&mapping.remote.key()) else {
            error!("{}: got mapping for unknown candidate {}", self.name, mapping.remote);
            return;
        };
        let mut fake = remote.candidate.with_endpoint(&mapping.local);
        if fake.sdp_mid.is_none() {
            fake.sdp_mid = self.mid.clone();
        }
        debug!(
            "{}: {} now reachable through {}",
            self.name, mapping.remote, mapping.local
        );
        let signal = PeerSignal::Candidate {
            candidate: fake.to_ice_candidate(),
        };
        if let Err(e) = self.obfuscated.handle_signal_message(signal).await {
            warn!("{}: failed to inject mirror candidate: {}", self.name, e);
        }
    }

    async fn advance(&mut self) {
        if self.pipe.is_none() && self.probe_complete {
            if let Some(config) = self.transformer.clone() {
                self.configure_pipe(config).await;
            }
        }

        if self.local_description_sent {
            for mut candidate in std::mem::take(&mut self.unsent_probe_candidates) {
                // the probe's mid may differ from the obfuscated connection's
                if let Some(mid) = &self.mid {
                    candidate.sdp_mid = Some(mid.clone());
                }
                self.send(ChurnSignal::webrtc(PeerSignal::Candidate {
                    candidate: candidate.to_ice_candidate(),
                }));
            }
        }
    }

    async fn configure_pipe(&mut self, config: TransformerConfig) {
        let (pipe, mappings) = Pipe::with_backoff(format!("{}-pipe", self.name), self.backoff.clone());
        if let Err(e) = pipe.set_transformer(config).await {
            error!("{}: cannot configure transformer: {}", self.name, e);
            pipe.shutdown().await;
            // leave the gate closed rather than run unobfuscated
            self.transformer = None;
            return;
        }

        for candidate in &self.probe_candidates {
            match candidate.local_endpoint() {
                Ok(endpoint) => {
                    if let Err(e) = pipe.bind_local(endpoint.clone()).await {
                        warn!("{}: bind_local {} failed: {}", self.name, endpoint, e);
                    }
                }
                Err(e) => debug!("{}: no local endpoint for probe candidate: {}", self.name, e),
            }
        }

        if !self.config.skip_public_endpoint {
            match select_public_address(&self.probe_candidates) {
                Ok(pair) => self.send(ChurnSignal::public_endpoint(pair.external)),
                Err(e) => warn!("{}: no public endpoint to advertise: {}", self.name, e),
            }
        }

        self.pipe = Some(pipe);
        self.mappings = Some(mappings);
        info!("{}: pipe configured", self.name);

        for endpoint in std::mem::take(&mut self.pending_browser_endpoints) {
            self.add_browser_endpoint(endpoint).await;
        }
        for endpoint in std::mem::take(&mut self.pending_remote_binds) {
            self.bind_remote(endpoint).await;
        }
        for message in std::mem::take(&mut self.pending_descriptions) {
            self.forward_description(message).await;
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.obfuscated.close().await {
            debug!("{}: closing obfuscated connection: {}", self.name, e);
        }
        if let Some(pipe) = self.pipe.take() {
            // let the closing datagrams through before the sockets go away
            tokio::time::sleep(PIPE_DRAIN_TIMEOUT).await;
            pipe.shutdown().await;
        }
        if let Some(probe) = self.probe.take() {
            let _ = probe.close().await;
        }
        info!("{}: closed", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{ConnectionState, StateSender};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    /// Test side of a scripted peer connection
    struct MockHandle {
        emit: mpsc::UnboundedSender<PeerSignal>,
        received: mpsc::UnboundedReceiver<PeerSignal>,
        state: StateWatch,
        negotiated: Arc<AtomicBool>,
    }

    struct MockPeer {
        signal_rx: Option<mpsc::UnboundedReceiver<PeerSignal>>,
        received: mpsc::UnboundedSender<PeerSignal>,
        state_tx: StateSender,
        state: StateWatch,
        negotiated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PeerConnection for MockPeer {
        type Signal = PeerSignal;

        async fn negotiate_connection(&self) -> Result<(), PeerError> {
            self.negotiated.store(true, Ordering::SeqCst);
            self.state_tx.set(ConnectionState::Connecting);
            Ok(())
        }

        async fn handle_signal_message(&self, signal: PeerSignal) -> Result<(), PeerError> {
            let _ = self.received.send(signal);
            Ok(())
        }

        async fn open_data_channel(&self, _label: &str) -> Result<DataChannel, PeerError> {
            Err(PeerError::Closed)
        }

        async fn close(&self) -> Result<(), PeerError> {
            self.state_tx.set(ConnectionState::Closed);
            Ok(())
        }

        fn take_signal_queue(&mut self) -> Option<mpsc::UnboundedReceiver<PeerSignal>> {
            self.signal_rx.take()
        }

        fn take_channel_queue(&mut self) -> Option<mpsc::UnboundedReceiver<DataChannel>> {
            None
        }

        fn state(&self) -> StateWatch {
            self.state.clone()
        }
    }

    #[derive(Default)]
    struct MockFactory {
        handles: Mutex<Vec<MockHandle>>,
    }

    impl MockFactory {
        /// Probe and obfuscated handles, in creation order
        fn take(&self) -> (MockHandle, MockHandle) {
            let mut handles = self.handles.lock().unwrap();
            let obfuscated = handles.pop().unwrap();
            let probe = handles.pop().unwrap();
            (probe, obfuscated)
        }
    }

    #[async_trait]
    impl PeerFactory for MockFactory {
        type Connection = MockPeer;

        async fn create(&self, _name: &str, _config: &RtcConfig) -> Result<MockPeer, PeerError> {
            let (emit, signal_rx) = mpsc::unbounded_channel();
            let (received_tx, received) = mpsc::unbounded_channel();
            let (state_tx, state) = StateWatch::channel();
            let negotiated = Arc::new(AtomicBool::new(false));
            self.handles.lock().unwrap().push(MockHandle {
                emit,
                received,
                state: state.clone(),
                negotiated: negotiated.clone(),
            });
            Ok(MockPeer {
                signal_rx: Some(signal_rx),
                received: received_tx,
                state_tx,
                state,
                negotiated,
            })
        }
    }

    fn quiet_config() -> ChurnConfig {
        ChurnConfig::default()
            .with_stun_servers(vec![])
            .with_skip_public_endpoint(true)
    }

    fn candidate_signal(line: &str, mid: &str) -> PeerSignal {
        PeerSignal::Candidate {
            candidate: crate::candidate::IceCandidate {
                candidate: line.to_string(),
                sdp_mid: Some(mid.to_string()),
                sdp_mline_index: Some(0),
            },
        }
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("queue closed")
    }

    async fn free_port() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_negotiate_sends_caesar_key() {
        let factory = MockFactory::default();
        let mut churn = ChurnConnection::new("test", &factory, quiet_config())
            .await
            .unwrap();
        let (probe, obfuscated) = factory.take();
        assert!(probe.negotiated.load(Ordering::SeqCst));

        let mut signals = churn.take_signal_queue().unwrap();
        churn.negotiate_connection().await.unwrap();

        let key = next(&mut signals).await.caesar.unwrap();
        assert!(key >= 1);
        assert!(obfuscated.negotiated.load(Ordering::SeqCst));
        assert!(matches!(
            churn.negotiate_connection().await,
            Err(PeerError::InvalidState(_))
        ));
        churn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_preferred_transformer_is_signalled() {
        let factory = MockFactory::default();
        let config = quiet_config().with_transformer(TransformerConfig::sample("rc4").unwrap());
        let mut churn = ChurnConnection::new("test", &factory, config).await.unwrap();
        let mut signals = churn.take_signal_queue().unwrap();
        churn.negotiate_connection().await.unwrap();

        let signal = next(&mut signals).await;
        assert!(signal.caesar.is_none());
        assert_eq!(signal.transformer.unwrap().name(), "rc4");
        churn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_candidates_forwarded_with_obfuscated_mid() {
        let factory = MockFactory::default();
        let mut churn = ChurnConnection::new("test", &factory, quiet_config())
            .await
            .unwrap();
        let (probe, obfuscated) = factory.take();
        let mut signals = churn.take_signal_queue().unwrap();

        probe
            .emit
            .send(candidate_signal(
                "candidate:1 1 udp 2122260223 127.0.0.1 50001 typ host generation 0",
                "probe-mid",
            ))
            .unwrap();
        probe
            .emit
            .send(candidate_signal(
                "candidate:2 1 tcp 1518280447 127.0.0.1 9 typ host tcptype active",
                "probe-mid",
            ))
            .unwrap();

        let sdp = "v=0\r\na=candidate:1 1 udp 1 10.0.0.1 4000 typ host\r\na=mid:obf\r\n";
        obfuscated
            .emit
            .send(PeerSignal::Offer {
                description: SessionDescription::offer(sdp),
            })
            .unwrap();

        let offer = next(&mut signals).await.webrtc_message.unwrap();
        let description = offer.description().unwrap();
        assert!(!description.sdp.contains("a=candidate"));
        assert!(description.sdp.contains("a=mid:obf"));

        match next(&mut signals).await.webrtc_message.unwrap() {
            PeerSignal::Candidate { candidate } => {
                assert!(candidate.candidate.contains("50001"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("obf"));
            }
            other => panic!("unexpected {:?}", other),
        }
        // the tcp candidate is never sent
        assert!(timeout(Duration::from_millis(100), signals.recv()).await.is_err());
        churn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_candidates_sent_without_obfuscated_mid() {
        let factory = MockFactory::default();
        let mut churn = ChurnConnection::new("test", &factory, quiet_config())
            .await
            .unwrap();
        let (probe, obfuscated) = factory.take();
        let mut signals = churn.take_signal_queue().unwrap();

        probe
            .emit
            .send(candidate_signal(
                "candidate:1 1 udp 2122260223 127.0.0.1 50002 typ host generation 0",
                "probe-mid",
            ))
            .unwrap();
        // no a=mid line to learn from
        obfuscated
            .emit
            .send(PeerSignal::Offer {
                description: SessionDescription::offer("v=0\r\n"),
            })
            .unwrap();

        assert!(next(&mut signals).await.webrtc_message.unwrap().description().is_some());
        match next(&mut signals).await.webrtc_message.unwrap() {
            PeerSignal::Candidate { candidate } => {
                assert!(candidate.candidate.contains("50002"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("probe-mid"));
            }
            other => panic!("unexpected {:?}", other),
        }
        churn.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_closes_probe() {
        let factory = MockFactory::default();
        let churn = ChurnConnection::new("test", &factory, quiet_config())
            .await
            .unwrap();
        let (probe, _obfuscated) = factory.take();

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(probe.state.current(), ConnectionState::Connecting);

        timeout(Duration::from_secs(1), probe.state.once_closed())
            .await
            .unwrap();
        churn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_offer_held_until_pipe_exists() {
        let factory = MockFactory::default();
        let churn = ChurnConnection::new("test", &factory, quiet_config())
            .await
            .unwrap();
        let (probe, mut obfuscated) = factory.take();

        let offer = PeerSignal::Offer {
            description: SessionDescription::offer(
                "v=0\r\na=candidate:1 1 udp 1 10.0.0.1 4000 typ host\r\na=mid:data\r\n",
            ),
        };
        churn.handle_signal_message(ChurnSignal::caesar(9)).await.unwrap();
        churn
            .handle_signal_message(ChurnSignal::webrtc(offer))
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(100), obfuscated.received.recv())
            .await
            .is_err());

        probe.emit.send(PeerSignal::NoMoreCandidates).unwrap();
        let forwarded = next(&mut obfuscated.received).await;
        let description = forwarded.description().unwrap();
        assert_eq!(description.kind, "offer");
        assert!(!description.sdp.contains("a=candidate"));
        assert_eq!(probe.state.current(), ConnectionState::Closed);
        churn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_public_endpoint_injected_once() {
        let factory = MockFactory::default();
        let churn = ChurnConnection::new("test", &factory, quiet_config())
            .await
            .unwrap();
        let (probe, mut obfuscated) = factory.take();

        let port = free_port().await;
        probe
            .emit
            .send(candidate_signal(
                &format!("candidate:1 1 udp 2122260223 127.0.0.1 {} typ host", port),
                "0",
            ))
            .unwrap();
        probe.emit.send(PeerSignal::NoMoreCandidates).unwrap();
        churn.handle_signal_message(ChurnSignal::caesar(1)).await.unwrap();

        churn
            .handle_signal_message(ChurnSignal::public_endpoint(Endpoint::new("127.0.0.1", 40123)))
            .await
            .unwrap();

        let injected = match next(&mut obfuscated.received).await {
            PeerSignal::Candidate { candidate } => Candidate::from_ice_candidate(&candidate).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(injected.foundation, "0");
        assert_eq!(injected.priority, 2130379007);
        assert_eq!(injected.ip, "127.0.0.1");
        assert_ne!(injected.port, 40123);

        // a received candidate for the same endpoint maps to the same mirror
        churn
            .handle_signal_message(ChurnSignal::webrtc(candidate_signal(
                "candidate:5 1 udp 100 127.0.0.1 40123 typ host",
                "0",
            )))
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(200), obfuscated.received.recv())
            .await
            .is_err());
        churn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_signals_rejected() {
        let factory = MockFactory::default();
        let churn = ChurnConnection::new("test", &factory, quiet_config())
            .await
            .unwrap();

        assert!(churn.handle_signal_message(ChurnSignal::caesar(0)).await.is_err());

        let bad_key = TransformerConfig::Encryption(crate::obfuscation::EncryptionConfig {
            key: "zz".into(),
        });
        assert!(churn
            .handle_signal_message(ChurnSignal::transformer(bad_key))
            .await
            .is_err());

        let garbage = candidate_signal("candidate:1 1 udp x 1.2.3.4 5 typ host", "0");
        assert!(churn
            .handle_signal_message(ChurnSignal::webrtc(garbage))
            .await
            .is_err());
        churn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_tears_down_both_connections() {
        let factory = MockFactory::default();
        let churn = ChurnConnection::new("test", &factory, quiet_config())
            .await
            .unwrap();
        let (probe, obfuscated) = factory.take();

        churn.close().await.unwrap();
        assert_eq!(obfuscated.state.current(), ConnectionState::Closed);
        assert_eq!(probe.state.current(), ConnectionState::Closed);
        assert!(matches!(
            churn.state().once_connected().await,
            Err(PeerError::ClosedBeforeConnected)
        ));
    }
}
