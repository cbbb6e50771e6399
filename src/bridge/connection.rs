//! Bridging peer connection

use super::{
    make_single_provider_message, pick_best_provider_type, BridgeError, ProviderType,
    SignallingMessage,
};
use crate::churn::{ChurnConnection, ChurnSignal};
use crate::config::{ChurnConfig, PipeConfig};
use crate::peer::{
    ConnectionState, DataChannel, PeerConnection, PeerError, PeerFactory, PeerSignal, RtcConfig,
    StateSender, StateWatch,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

enum Provider<C> {
    Plain(C),
    Churn(ChurnConnection),
}

impl<C> Provider<C>
where
    C: PeerConnection<Signal = PeerSignal>,
{
    async fn negotiate_connection(&self) -> Result<(), PeerError> {
        match self {
            Provider::Plain(pc) => pc.negotiate_connection().await,
            Provider::Churn(churn) => churn.negotiate_connection().await,
        }
    }

    async fn handle_signal(&self, signal: Value) -> Result<(), BridgeError> {
        match self {
            Provider::Plain(pc) => {
                let signal: PeerSignal = serde_json::from_value(signal)?;
                pc.handle_signal_message(signal).await?;
            }
            Provider::Churn(churn) => {
                let signal: ChurnSignal = serde_json::from_value(signal)?;
                churn.handle_signal_message(signal).await?;
            }
        }
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<DataChannel, PeerError> {
        match self {
            Provider::Plain(pc) => pc.open_data_channel(label).await,
            Provider::Churn(churn) => churn.open_data_channel(label).await,
        }
    }

    async fn close(&self) -> Result<(), PeerError> {
        match self {
            Provider::Plain(pc) => pc.close().await,
            Provider::Churn(churn) => churn.close().await,
        }
    }
}

/// A peer connection that settles on one concrete provider
pub struct BridgingPeerConnection<F: PeerFactory> {
    name: String,
    preferred: ProviderType,
    factory: F,
    churn_config: ChurnConfig,
    pipe_config: PipeConfig,
    /// Chosen provider, created on negotiate or on the first inbound message
    provider: Mutex<Option<(ProviderType, Provider<F::Connection>)>>,
    /// True until a signal has been sent
    first: Arc<AtomicBool>,
    signal_tx: mpsc::UnboundedSender<SignallingMessage>,
    signal_rx: Option<mpsc::UnboundedReceiver<SignallingMessage>>,
    channel_tx: mpsc::UnboundedSender<DataChannel>,
    channel_rx: Option<mpsc::UnboundedReceiver<DataChannel>>,
    state_tx: Arc<StateSender>,
    state: StateWatch,
}

impl<F: PeerFactory> BridgingPeerConnection<F> {
    pub fn new(
        preferred: ProviderType,
        name: impl Into<String>,
        factory: F,
        churn_config: ChurnConfig,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = StateWatch::channel();
        Self {
            name: name.into(),
            preferred,
            factory,
            churn_config,
            pipe_config: PipeConfig::default(),
            provider: Mutex::new(None),
            first: Arc::new(AtomicBool::new(true)),
            signal_tx,
            signal_rx: Some(signal_rx),
            channel_tx,
            channel_rx: Some(channel_rx),
            state_tx: Arc::new(state_tx),
            state,
        }
    }

    /// For peers that support bridging but should not obfuscate
    pub fn pre_obfuscation(name: impl Into<String>, factory: F, config: ChurnConfig) -> Self {
        Self::new(ProviderType::Plain, name, factory, config)
    }

    /// For peers that support churn
    pub fn basic_obfuscation(name: impl Into<String>, factory: F, config: ChurnConfig) -> Self {
        Self::new(ProviderType::Churn, name, factory, config)
    }

    /// For peers that support churn without the public endpoint hint
    pub fn holographic_ice_only(name: impl Into<String>, factory: F, config: ChurnConfig) -> Self {
        Self::new(ProviderType::HoloIce, name, factory, config)
    }

    /// Offers the best provider and answers any known one
    pub fn best(name: impl Into<String>, factory: F, config: ChurnConfig) -> Self {
        Self::holographic_ice_only(name, factory, config)
    }

    pub fn with_pipe_config(mut self, pipe_config: PipeConfig) -> Self {
        self.pipe_config = pipe_config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn preferred_provider(&self) -> ProviderType {
        self.preferred
    }

    /// The negotiated provider, if any
    pub async fn provider_type(&self) -> Option<ProviderType> {
        self.provider.lock().await.as_ref().map(|(kind, _)| *kind)
    }

    async fn make_provider(&self, kind: ProviderType) -> Result<Provider<F::Connection>, BridgeError> {
        let provider = match kind {
            ProviderType::Plain => {
                debug!("{}: constructing plain peer connection", self.name);
                let rtc = RtcConfig::with_ice_servers(self.churn_config.stun_servers.clone());
                Provider::Plain(self.factory.create(&self.name, &rtc).await?)
            }
            ProviderType::Churn => {
                debug!("{}: constructing churn peer connection", self.name);
                Provider::Churn(
                    ChurnConnection::with_pipe_config(
                        self.name.clone(),
                        &self.factory,
                        self.churn_config.clone(),
                        &self.pipe_config,
                    )
                    .await?,
                )
            }
            ProviderType::HoloIce => {
                debug!("{}: constructing holographic ICE peer connection", self.name);
                let config = self.churn_config.clone().with_skip_public_endpoint(true);
                Provider::Churn(
                    ChurnConnection::with_pipe_config(
                        self.name.clone(),
                        &self.factory,
                        config,
                        &self.pipe_config,
                    )
                    .await?,
                )
            }
        };
        Ok(provider)
    }

    /// Wire the provider's queues and state into ours
    fn bridge_with(&self, kind: ProviderType, provider: &mut Provider<F::Connection>) {
        let (signals, channels, state) = match provider {
            Provider::Plain(pc) => (
                pc.take_signal_queue().map(|rx| self.forward_signals(kind, rx)),
                pc.take_channel_queue(),
                pc.state(),
            ),
            Provider::Churn(churn) => (
                churn.take_signal_queue().map(|rx| self.forward_signals(kind, rx)),
                churn.take_channel_queue(),
                churn.state(),
            ),
        };
        if signals.is_none() {
            warn!("{}: provider signal queue already taken", self.name);
        }

        if let Some(mut channels) = channels {
            let channel_tx = self.channel_tx.clone();
            tokio::spawn(async move {
                while let Some(channel) = channels.recv().await {
                    if channel_tx.send(channel).is_err() {
                        break;
                    }
                }
            });
        }

        let state_tx = self.state_tx.clone();
        tokio::spawn(async move {
            state_tx.set(ConnectionState::Connecting);
            if state.once_connected().await.is_ok() {
                state_tx.set(ConnectionState::Connected);
            }
            state.once_closed().await;
            state_tx.set(ConnectionState::Closed);
        });

        info!("{}: now bridging with {} provider", self.name, kind);
    }

    fn forward_signals<S>(&self, kind: ProviderType, mut rx: mpsc::UnboundedReceiver<S>)
    where
        S: Serialize + Send + 'static,
    {
        let name = self.name.clone();
        let first = self.first.clone();
        let signal_tx = self.signal_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let value = match serde_json::to_value(&signal) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("{}: cannot serialize signal: {}", name, e);
                        continue;
                    }
                };
                let mut message = make_single_provider_message(kind, vec![value]);
                if first.swap(false, Ordering::SeqCst) {
                    message.first = Some(true);
                }
                if signal_tx.send(message).is_err() {
                    break;
                }
            }
        });
    }

    async fn try_handle(&self, message: SignallingMessage) -> Result<(), BridgeError> {
        let signals = message.signals.ok_or(BridgeError::MissingSignals)?;

        let mut guard = self.provider.lock().await;
        if guard.is_none() {
            let kind = pick_best_provider_type(&signals)?;
            info!("{}: received offer, responding with {} provider", self.name, kind);
            let mut provider = self.make_provider(kind).await?;
            self.bridge_with(kind, &mut provider);
            *guard = Some((kind, provider));
        }
        let Some((kind, provider)) = guard.as_ref() else {
            return Err(BridgeError::NoProvider);
        };

        let batch = signals
            .get(kind.as_str())
            .ok_or(BridgeError::ProviderMismatch(*kind))?;
        let mut last_error = None;
        for signal in batch {
            if let Err(e) = provider.handle_signal(signal.clone()).await {
                warn!("{}: skipping signal: {}", self.name, e);
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<F: PeerFactory> PeerConnection for BridgingPeerConnection<F> {
    type Signal = SignallingMessage;

    async fn negotiate_connection(&self) -> Result<(), PeerError> {
        let mut guard = self.provider.lock().await;
        if guard.is_some() {
            return Err(PeerError::InvalidState("provider already chosen".to_string()));
        }
        info!("{}: negotiating, offering {} provider", self.name, self.preferred);
        let mut provider = self
            .make_provider(self.preferred)
            .await
            .map_err(|e| PeerError::InvalidState(e.to_string()))?;
        self.bridge_with(self.preferred, &mut provider);
        provider.negotiate_connection().await?;
        *guard = Some((self.preferred, provider));
        Ok(())
    }

    /// Problems are reported to the peer as `errorOnLastMessage`, not returned
    async fn handle_signal_message(&self, message: SignallingMessage) -> Result<(), PeerError> {
        if message.signals.is_none() && message.is_error() {
            warn!("{}: peer could not handle our last message", self.name);
            return Ok(());
        }
        if let Err(e) = self.try_handle(message).await {
            warn!("{}: rejecting signalling message: {}", self.name, e);
            let _ = self.signal_tx.send(SignallingMessage::error());
        }
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<DataChannel, PeerError> {
        match self.provider.lock().await.as_ref() {
            Some((_, provider)) => provider.open_data_channel(label).await,
            None => Err(PeerError::InvalidState(BridgeError::NoProvider.to_string())),
        }
    }

    async fn close(&self) -> Result<(), PeerError> {
        match self.provider.lock().await.as_ref() {
            Some((_, provider)) => {
                provider.close().await?;
                self.state.once_closed().await;
            }
            None => {
                debug!("{}: closed before negotiation", self.name);
                self.state_tx.set(ConnectionState::Closed);
            }
        }
        Ok(())
    }

    fn take_signal_queue(&mut self) -> Option<mpsc::UnboundedReceiver<SignallingMessage>> {
        self.signal_rx.take()
    }

    fn take_channel_queue(&mut self) -> Option<mpsc::UnboundedReceiver<DataChannel>> {
        self.channel_rx.take()
    }

    fn state(&self) -> StateWatch {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::UdpPeerFactory;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    type Bridge = BridgingPeerConnection<UdpPeerFactory>;

    fn quiet_config() -> ChurnConfig {
        ChurnConfig::default().with_stun_servers(vec![])
    }

    fn relay(mut signals: mpsc::UnboundedReceiver<SignallingMessage>, to: Arc<Bridge>) {
        tokio::spawn(async move {
            while let Some(message) = signals.recv().await {
                let _ = to.handle_signal_message(message).await;
            }
        });
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<SignallingMessage>) -> SignallingMessage {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("queue closed")
    }

    #[tokio::test]
    async fn test_negotiate_wraps_signals() {
        let mut bridge = Bridge::pre_obfuscation("offerer", UdpPeerFactory::default(), quiet_config());
        let mut signals = bridge.take_signal_queue().unwrap();
        bridge.negotiate_connection().await.unwrap();
        assert_eq!(bridge.provider_type().await, Some(ProviderType::Plain));

        let offer = next(&mut signals).await;
        assert!(offer.is_first());
        let batch = &offer.signals.as_ref().unwrap()["PLAIN"];
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["type"], "OFFER");

        let candidate = next(&mut signals).await;
        assert!(!candidate.is_first());
        assert!(matches!(
            bridge.negotiate_connection().await,
            Err(PeerError::InvalidState(_))
        ));
        bridge.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_bridges_connect() {
        let mut a = Bridge::pre_obfuscation("a", UdpPeerFactory::default(), quiet_config());
        let mut b = Bridge::best("b", UdpPeerFactory::default(), quiet_config());
        let a_signals = a.take_signal_queue().unwrap();
        let b_signals = b.take_signal_queue().unwrap();
        let mut b_channels = b.take_channel_queue().unwrap();
        let a = Arc::new(a);
        let b = Arc::new(b);
        relay(a_signals, b.clone());
        relay(b_signals, a.clone());

        a.negotiate_connection().await.unwrap();
        timeout(Duration::from_secs(5), b.state().once_connected())
            .await
            .unwrap()
            .unwrap();
        // the answering side follows the offer rather than its own preference
        assert_eq!(b.provider_type().await, Some(ProviderType::Plain));

        let chat = a.open_data_channel("chat").await.unwrap();
        chat.send(&b"hello"[..]).unwrap();
        let mut remote = timeout(Duration::from_secs(2), b_channels.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(remote.recv().await.unwrap(), Bytes::from_static(b"hello"));

        a.close().await.unwrap();
        timeout(Duration::from_secs(2), b.state().once_closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_offer_replies_error() {
        let mut bridge = Bridge::best("answerer", UdpPeerFactory::default(), quiet_config());
        let mut signals = bridge.take_signal_queue().unwrap();

        let offer = SignallingMessage {
            signals: Some([("LEGACY".to_string(), vec![json!({})])].into_iter().collect()),
            ..Default::default()
        };
        bridge.handle_signal_message(offer).await.unwrap();
        assert!(next(&mut signals).await.is_error());
        assert_eq!(bridge.provider_type().await, None);
    }

    #[tokio::test]
    async fn test_provider_mismatch_replies_error() {
        let mut bridge = Bridge::pre_obfuscation("offerer", UdpPeerFactory::default(), quiet_config());
        let mut signals = bridge.take_signal_queue().unwrap();
        bridge.negotiate_connection().await.unwrap();
        // offer, candidate, end of candidates
        for _ in 0..3 {
            assert!(!next(&mut signals).await.is_error());
        }

        let answer = make_single_provider_message(ProviderType::Churn, vec![json!({"caesar": 4})]);
        bridge.handle_signal_message(answer).await.unwrap();
        assert!(next(&mut signals).await.is_error());
        bridge.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_is_not_echoed() {
        let mut bridge = Bridge::best("quiet", UdpPeerFactory::default(), quiet_config());
        let mut signals = bridge.take_signal_queue().unwrap();
        bridge
            .handle_signal_message(SignallingMessage::error())
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(100), signals.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_before_provider() {
        let bridge = Bridge::best("idle", UdpPeerFactory::default(), quiet_config());
        assert!(bridge.open_data_channel("chat").await.is_err());
        bridge.close().await.unwrap();
        assert!(matches!(
            bridge.state().once_connected().await,
            Err(PeerError::ClosedBeforeConnected)
        ));
        assert_eq!(bridge.state().current(), ConnectionState::Closed);
    }
}
