// =============================================================================
// Price Feed Manager — one multiplexed ticker stream per exchange
// =============================================================================
//
// Any number of trackers subscribe to symbols; the manager keeps exactly one
// websocket connection and exactly one wire subscription per symbol, and fans
// each price out to every consumer's private `TickBuffer`.
//
// Connection lifecycle:
//
//   Disconnected -> Connecting -> Open -> (Error | Closed) -> Disconnected ...
//
// Every entry into Open re-subscribes all tracked symbols. Failed or dropped
// connections are retried with exponential backoff until `shutdown`. A session
// that receives nothing for one keep-alive period plus `ping_timeout` is
// treated as dead.
//
// The routing table and connection state sit behind one mutex that is never
// held across an await.
// =============================================================================

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::protocol::{decode_frame, normalize_symbol, FeedProtocol, WireMessage};
use super::tick_buffer::TickBuffer;
use crate::types::Exchange;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Error,
    Closed,
}

/// Connection transitions worth telling an operator about.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// First message ever received on this feed.
    Connected,
    /// First message after a reconnect.
    Reconnected,
    Disconnected { reason: String },
    Retrying { delay: Duration },
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Per-consumer tick buffer capacity.
    pub buffer_capacity: usize,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Keep-alive period for protocols without their own client ping.
    pub ping_interval: Duration,
    /// Extra silence tolerated after a keep-alive before the link counts as dead.
    pub ping_timeout: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
            reconnect_base: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(120),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
        }
    }
}

/// A consumer's handle on one symbol. Hand it back to `unsubscribe`.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    symbol: String,
    buffer: Arc<TickBuffer>,
}

impl Subscription {
    #[cfg(test)]
    pub fn buffer(&self) -> &TickBuffer {
        &self.buffer
    }

    /// Newest price since the last call, discarding older ticks.
    pub fn take_latest(&self) -> Option<f64> {
        self.buffer.take_latest()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub exchange: Exchange,
    pub state: ConnectionState,
    pub symbols: Vec<String>,
    pub consumers: usize,
    pub dropped_ticks: u64,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Route {
    consumers: BTreeMap<u64, Arc<TickBuffer>>,
    /// Drops counted by consumers that have since left.
    retired_drops: u64,
}

struct FeedShared {
    routes: BTreeMap<String, Route>,
    /// Symbols added while connected that still need a wire subscribe.
    pending_wire: Vec<String>,
    state: ConnectionState,
    ever_connected: bool,
    awaiting_first_message: bool,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq)]
enum SessionEnd {
    Shutdown,
    Closed(String),
    Failed(String),
}

pub struct PriceFeedManager {
    protocol: Arc<dyn FeedProtocol>,
    settings: FeedSettings,
    shared: Mutex<FeedShared>,
    wire_wakeup: Notify,
    events: broadcast::Sender<FeedEvent>,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
}

impl PriceFeedManager {
    pub fn new(protocol: Arc<dyn FeedProtocol>, settings: FeedSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        Self {
            protocol,
            settings,
            shared: Mutex::new(FeedShared {
                routes: BTreeMap::new(),
                pending_wire: Vec::new(),
                state: ConnectionState::Disconnected,
                ever_connected: false,
                awaiting_first_message: false,
            }),
            wire_wakeup: Notify::new(),
            events,
            shutdown,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.protocol.exchange()
    }

    pub fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Attach a new consumer to `symbol`.
    ///
    /// Only the first consumer of a symbol causes a wire subscribe; when the
    /// connection is down the symbol is picked up by the next Open.
    pub fn subscribe(&self, symbol: &str) -> Subscription {
        let symbol = normalize_symbol(symbol);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let buffer = Arc::new(TickBuffer::new(self.settings.buffer_capacity));

        let new_symbol = {
            let mut shared = self.shared.lock();
            let new_symbol = !shared.routes.contains_key(&symbol);
            shared
                .routes
                .entry(symbol.clone())
                .or_default()
                .consumers
                .insert(id, buffer.clone());
            if new_symbol && shared.state == ConnectionState::Open {
                shared.pending_wire.push(symbol.clone());
            }
            new_symbol
        };

        if new_symbol {
            self.wire_wakeup.notify_one();
        }
        debug!(exchange = %self.exchange(), symbol = %symbol, consumer = id, new_symbol, "feed subscription added");

        Subscription { id, symbol, buffer }
    }

    /// Detach a consumer. The symbol stays tracked on the wire.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut shared = self.shared.lock();
        if let Some(route) = shared.routes.get_mut(&subscription.symbol) {
            if let Some(buffer) = route.consumers.remove(&subscription.id) {
                route.retired_drops += buffer.dropped();
            }
        }
        debug!(exchange = %self.exchange(), symbol = %subscription.symbol, consumer = subscription.id, "feed subscription removed");
    }

    /// Push a price to every consumer of `symbol`, in arrival order.
    pub fn route_price(&self, symbol: &str, price: f64) -> usize {
        let shared = self.shared.lock();
        match shared.routes.get(symbol) {
            Some(route) => {
                for buffer in route.consumers.values() {
                    buffer.push(price);
                }
                route.consumers.len()
            }
            None => 0,
        }
    }

    pub fn status(&self) -> FeedStatus {
        let shared = self.shared.lock();
        let dropped_ticks: u64 = shared
            .routes
            .values()
            .map(|r| r.retired_drops + r.consumers.values().map(|b| b.dropped()).sum::<u64>())
            .sum();
        FeedStatus {
            exchange: self.exchange(),
            state: shared.state,
            symbols: shared.routes.keys().cloned().collect(),
            consumers: shared.routes.values().map(|r| r.consumers.len()).sum(),
            dropped_ticks,
        }
    }

    /// Stop the reconnect loop and close the current connection.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.lock().state = state;
    }

    fn emit(&self, event: FeedEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // -------------------------------------------------------------------------
    // Connection loop
    // -------------------------------------------------------------------------

    /// Keep the feed connected until `shutdown` is called.
    pub async fn run(self: Arc<Self>) {
        let exchange = self.exchange();
        let mut backoff = Backoff::new(self.settings.reconnect_base, self.settings.reconnect_max);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            info!(exchange = %exchange, url = %self.protocol.endpoint(), "connecting to price feed");

            let end = match self.connect().await {
                Ok(ws) => {
                    backoff.reset();
                    let (write, read) = ws.split();
                    self.run_session(write, read).await
                }
                Err(e) => SessionEnd::Failed(format!("{e:#}")),
            };

            let reason = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Closed(reason) => {
                    self.set_state(ConnectionState::Closed);
                    warn!(exchange = %exchange, reason = %reason, "price feed closed");
                    reason
                }
                SessionEnd::Failed(reason) => {
                    self.set_state(ConnectionState::Error);
                    error!(exchange = %exchange, reason = %reason, "price feed error");
                    reason
                }
            };
            self.emit(FeedEvent::Disconnected { reason });

            let delay = backoff.next_delay();
            self.set_state(ConnectionState::Disconnected);
            self.emit(FeedEvent::Retrying { delay });
            info!(exchange = %exchange, delay_secs = delay.as_secs(), "reconnecting after delay");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.set_state(ConnectionState::Closed);
        info!(exchange = %exchange, "price feed stopped");
    }

    async fn connect(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let mut request = self
            .protocol
            .endpoint()
            .into_client_request()
            .context("invalid feed endpoint")?;
        for (name, value) in self.protocol.handshake_headers() {
            request.headers_mut().insert(*name, HeaderValue::from_static(*value));
        }

        let (ws, _response) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect to {} feed", self.exchange()))?;
        Ok(ws)
    }

    /// Drive one open connection until it ends.
    async fn run_session<S, R, E>(&self, mut write: S, mut read: R) -> SessionEnd
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
        R: Stream<Item = std::result::Result<Message, E>> + Unpin,
        E: Display,
    {
        let exchange = self.exchange();
        let mut shutdown = self.shutdown.subscribe();

        let symbols: Vec<String> = {
            let mut shared = self.shared.lock();
            shared.state = ConnectionState::Open;
            shared.awaiting_first_message = true;
            shared.pending_wire.clear();
            shared.routes.keys().cloned().collect()
        };
        info!(exchange = %exchange, symbols = symbols.len(), "price feed open");

        if let Err(e) = self.send_subscribes(&mut write, &symbols).await {
            return SessionEnd::Failed(e);
        }

        // Exchanges with an app-level ping get it; the rest get websocket pings.
        let (keepalive_period, app_ping) = match self.protocol.client_ping() {
            Some((period, payload)) => (period, Some(payload)),
            None => (self.settings.ping_interval, None),
        };
        let mut keepalive = tokio::time::interval_at(Instant::now() + keepalive_period, keepalive_period);
        let silence_limit = keepalive_period + self.settings.ping_timeout;
        let mut last_inbound = Instant::now();

        loop {
            if *shutdown.borrow() {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }

                _ = self.wire_wakeup.notified() => {
                    let pending = std::mem::take(&mut self.shared.lock().pending_wire);
                    if let Err(e) = self.send_subscribes(&mut write, &pending).await {
                        return SessionEnd::Failed(e);
                    }
                }

                _ = keepalive.tick() => {
                    let frame = match &app_ping {
                        Some(payload) => Message::Text(payload.clone()),
                        None => Message::Ping(Vec::new()),
                    };
                    if let Err(e) = write.send(frame).await {
                        return SessionEnd::Failed(format!("keep-alive send failed: {e}"));
                    }
                }

                _ = tokio::time::sleep_until(last_inbound + silence_limit) => {
                    warn!(exchange = %exchange, limit = ?silence_limit, "price feed went silent");
                    return SessionEnd::Failed(format!("no traffic for {silence_limit:?}"));
                }

                frame = read.next() => {
                    if matches!(frame, Some(Ok(_))) {
                        last_inbound = Instant::now();
                    }
                    let reply = match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Binary(bytes))) => match decode_frame(&bytes) {
                            Ok(text) => self.handle_text(&text),
                            Err(e) => {
                                warn!(exchange = %exchange, error = %e, len = bytes.len(), "dropping binary frame");
                                None
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("{} {}", f.code, f.reason))
                                .unwrap_or_else(|| "close frame".to_string());
                            return SessionEnd::Closed(reason);
                        }
                        Some(Ok(_)) => None,
                        Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                        None => return SessionEnd::Closed("stream ended".to_string()),
                    };

                    if let Some(reply) = reply {
                        if let Err(e) = write.send(Message::Text(reply)).await {
                            return SessionEnd::Failed(format!("heartbeat reply failed: {e}"));
                        }
                    }
                }
            }
        }
    }

    async fn send_subscribes<S>(&self, write: &mut S, symbols: &[String]) -> std::result::Result<(), String>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        for symbol in symbols {
            let request = self.protocol.subscribe_request(symbol);
            write
                .send(Message::Text(request))
                .await
                .map_err(|e| format!("subscribe for {symbol} failed: {e}"))?;
            info!(exchange = %self.exchange(), symbol = %symbol, "wire subscribe sent");
        }
        Ok(())
    }

    /// Classify one text frame, route prices, and return any heartbeat reply.
    fn handle_text(&self, text: &str) -> Option<String> {
        self.note_message();
        match self.protocol.classify(text) {
            Ok(WireMessage::Price { symbol, price }) => {
                if self.route_price(&symbol, price) == 0 {
                    debug!(exchange = %self.exchange(), symbol = %symbol, "price for symbol without consumers");
                }
                None
            }
            Ok(WireMessage::Heartbeat(reply)) => reply,
            Ok(WireMessage::Ignored(reason)) => {
                debug!(exchange = %self.exchange(), reason, "frame ignored");
                None
            }
            Err(e) => {
                warn!(exchange = %self.exchange(), error = %e, frame = %truncate(text, 200), "dropping unparseable frame");
                None
            }
        }
    }

    fn note_message(&self) {
        let event = {
            let mut shared = self.shared.lock();
            if !shared.awaiting_first_message {
                return;
            }
            shared.awaiting_first_message = false;
            let event = if shared.ever_connected {
                FeedEvent::Reconnected
            } else {
                FeedEvent::Connected
            };
            shared.ever_connected = true;
            event
        };
        info!(exchange = %self.exchange(), event = ?event, "price feed streaming");
        self.emit(event);
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use futures_util::{sink, stream};
    use tokio::sync::mpsc;

    use crate::feed::protocol::{BingxProtocol, BybitProtocol};

    type Sent = Arc<Mutex<Vec<String>>>;

    /// Start a session over an in-memory transport.
    fn spawn_session(
        manager: Arc<PriceFeedManager>,
    ) -> (
        Sent,
        mpsc::UnboundedSender<Message>,
        tokio::task::JoinHandle<SessionEnd>,
    ) {
        let sent: Sent = Arc::default();
        let sink_log = sent.clone();
        let write = Box::pin(sink::unfold(sink_log, |log, msg: Message| async move {
            if let Message::Text(text) = msg {
                log.lock().push(text);
            }
            Ok::<_, Infallible>(log)
        }));

        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let read = Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (Ok::<_, String>(msg), rx))
        }));

        let task = tokio::spawn(async move { manager.run_session(write, read).await });
        (sent, tx, task)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn subscribes(sent: &Sent) -> Vec<String> {
        sent.lock()
            .iter()
            .filter(|m| m.contains("subscribe") || m.contains("\"sub\""))
            .cloned()
            .collect()
    }

    fn bybit_ticker(symbol: &str, price: &str) -> Message {
        Message::Text(format!(
            r#"{{"topic":"tickers.{symbol}","type":"snapshot","data":{{"symbol":"{symbol}","lastPrice":"{price}"}}}}"#
        ))
    }

    #[tokio::test]
    async fn two_consumers_share_one_wire_subscription() {
        let manager = Arc::new(PriceFeedManager::new(
            Arc::new(BybitProtocol::default()),
            FeedSettings::default(),
        ));
        let first = manager.subscribe("BTCUSDT");
        let second = manager.subscribe("btc/usdt");

        let (sent, frames, task) = spawn_session(manager.clone());
        wait_for(|| subscribes(&sent).len() == 1).await;

        frames.send(bybit_ticker("BTCUSDT", "100.5")).unwrap();
        frames.send(bybit_ticker("BTCUSDT", "101.0")).unwrap();
        wait_for(|| first.buffer().len() == 2 && second.buffer().len() == 2).await;

        assert_eq!(first.buffer().drain(), vec![100.5, 101.0]);
        assert_eq!(second.buffer().drain(), vec![100.5, 101.0]);
        assert_eq!(subscribes(&sent).len(), 1);

        manager.shutdown();
        assert_eq!(task.await.unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn late_symbol_is_subscribed_on_open_connection() {
        let manager = Arc::new(PriceFeedManager::new(
            Arc::new(BybitProtocol::default()),
            FeedSettings::default(),
        ));
        let _btc = manager.subscribe("BTCUSDT");
        let (sent, _frames, task) = spawn_session(manager.clone());
        wait_for(|| manager.state() == ConnectionState::Open).await;

        let eth = manager.subscribe("ETHUSDT");
        let _eth_again = manager.subscribe("ETHUSDT");
        wait_for(|| subscribes(&sent).len() == 2).await;
        assert!(subscribes(&sent)[1].contains("tickers.ETHUSDT"));

        // Leaving does not unsubscribe at the wire level.
        manager.unsubscribe(eth);
        let status = manager.status();
        assert_eq!(status.symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert_eq!(status.consumers, 2);

        manager.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn bingx_heartbeats_and_gzip_frames() {
        let manager = Arc::new(PriceFeedManager::new(
            Arc::new(BingxProtocol::default()),
            FeedSettings::default(),
        ));
        let sol = manager.subscribe("SOLUSDT");
        let mut events = manager.events();
        let (sent, frames, task) = spawn_session(manager.clone());

        frames.send(Message::Text("Ping".into())).unwrap();
        wait_for(|| sent.lock().iter().any(|m| m == "Pong")).await;
        assert_eq!(events.recv().await.unwrap(), FeedEvent::Connected);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(br#"{"dataType":"SOL-USDT@ticker","data":{"s":"SOL-USDT","c":"150.25"}}"#)
            .unwrap();
        frames.send(Message::Binary(encoder.finish().unwrap())).unwrap();

        // Garbage is dropped without ending the session.
        frames.send(Message::Text("{broken".into())).unwrap();
        wait_for(|| !sol.buffer().is_empty()).await;
        assert_eq!(sol.take_latest(), Some(150.25));
        assert!(!task.is_finished());

        manager.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn close_frame_ends_session_and_reconnect_is_reported() {
        let manager = Arc::new(PriceFeedManager::new(
            Arc::new(BybitProtocol::default()),
            FeedSettings::default(),
        ));
        let _btc = manager.subscribe("BTCUSDT");
        let mut events = manager.events();

        let (_sent, frames, task) = spawn_session(manager.clone());
        frames.send(bybit_ticker("BTCUSDT", "1")).unwrap();
        frames.send(Message::Close(None)).unwrap();
        assert!(matches!(task.await.unwrap(), SessionEnd::Closed(_)));
        assert_eq!(events.recv().await.unwrap(), FeedEvent::Connected);

        // The next session re-subscribes and reports a reconnect.
        let (sent, frames, task) = spawn_session(manager.clone());
        wait_for(|| subscribes(&sent).len() == 1).await;
        frames.send(bybit_ticker("BTCUSDT", "2")).unwrap();
        assert_eq!(events.recv().await.unwrap(), FeedEvent::Reconnected);

        manager.shutdown();
        task.await.unwrap();
    }

    fn quick_keepalive() -> FeedSettings {
        FeedSettings {
            ping_interval: Duration::from_millis(20),
            ping_timeout: Duration::from_millis(60),
            ..FeedSettings::default()
        }
    }

    #[tokio::test]
    async fn silent_connection_is_pinged_then_dropped() {
        let manager = Arc::new(PriceFeedManager::new(
            Arc::new(BingxProtocol::default()),
            quick_keepalive(),
        ));
        let _sol = manager.subscribe("SOLUSDT");

        let pings = Arc::new(AtomicU64::new(0));
        let counter = pings.clone();
        let write = Box::pin(sink::unfold(counter, |counter, msg: Message| async move {
            if matches!(msg, Message::Ping(_)) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Ok::<_, Infallible>(counter)
        }));
        let read = stream::pending::<std::result::Result<Message, String>>();

        let end = tokio::time::timeout(Duration::from_secs(2), manager.run_session(write, read))
            .await
            .expect("silent session was never torn down");
        assert!(matches!(end, SessionEnd::Failed(ref reason) if reason.contains("no traffic")));
        assert!(pings.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn inbound_traffic_keeps_session_alive() {
        let manager = Arc::new(PriceFeedManager::new(
            Arc::new(BingxProtocol::default()),
            quick_keepalive(),
        ));
        let (_sent, frames, task) = spawn_session(manager.clone());

        // Well past the 80 ms silence limit, but never silent for that long.
        for _ in 0..20 {
            frames.send(Message::Pong(Vec::new())).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!task.is_finished());
        assert_eq!(manager.state(), ConnectionState::Open);

        manager.shutdown();
        assert_eq!(task.await.unwrap(), SessionEnd::Shutdown);
    }

    /// Bybit wire format pointed at a port nothing listens on.
    struct UnreachableProtocol(BybitProtocol);

    impl FeedProtocol for UnreachableProtocol {
        fn exchange(&self) -> Exchange {
            self.0.exchange()
        }

        fn endpoint(&self) -> &str {
            "ws://127.0.0.1:1"
        }

        fn subscribe_request(&self, symbol: &str) -> String {
            self.0.subscribe_request(symbol)
        }

        fn classify(&self, text: &str) -> std::result::Result<WireMessage, crate::feed::protocol::FeedParseError> {
            self.0.classify(text)
        }
    }

    #[tokio::test]
    async fn failed_connects_back_off_until_shutdown() {
        let settings = FeedSettings {
            reconnect_base: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(40),
            ..FeedSettings::default()
        };
        let manager = Arc::new(PriceFeedManager::new(
            Arc::new(UnreachableProtocol(BybitProtocol::default())),
            settings,
        ));
        let mut events = manager.events();
        let task = tokio::spawn(manager.clone().run());

        let mut delays = Vec::new();
        let mut disconnects = 0;
        while delays.len() < 5 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("no feed event")
                .unwrap();
            match event {
                FeedEvent::Retrying { delay } => delays.push(delay.as_millis()),
                FeedEvent::Disconnected { .. } => disconnects += 1,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(delays, vec![10, 20, 40, 40, 40]);
        assert_eq!(disconnects, 5);

        manager.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("run loop ignored shutdown")
            .unwrap();
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[test]
    fn prices_for_unknown_symbols_are_not_routed() {
        let manager = PriceFeedManager::new(Arc::new(BybitProtocol::default()), FeedSettings::default());
        assert_eq!(manager.route_price("XRPUSDT", 1.0), 0);
        let sub = manager.subscribe("XRPUSDT");
        assert_eq!(manager.route_price("XRPUSDT", 1.0), 1);
        assert_eq!(sub.take_latest(), Some(1.0));
    }
}
