//! Live price feed over WebSocket.
//!
//! The transport lives in one spawned connection task that walks an explicit
//! state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (lost) -> BackingOff{n} -> Connecting ...
//!                                                   \-> Failed (n > max attempts)
//! ```
//!
//! The heartbeat interval, the acknowledgment deadline and the backoff sleep
//! are all owned by that task. `disconnect()` signals it and waits for it to
//! exit, so no timer can fire a reconnect after a deliberate shutdown.
//!
//! Every inbound trade updates the last-price cache first, then runs the
//! per-asset callbacks, then goes out on the global `FeedEvent` stream.
//! The broadcast stream is best-effort and may lag. Consumers that must see
//! every tick take `price_stream()` instead: a bounded channel whose full
//! buffer stalls the connection task until the consumer catches up.

use crate::application::actors::feed_protocol::{
    parse_message, subscribe_message, unsubscribe_message, InboundMessage, PriceTick, TradeTick,
};
use crate::config::FeedConfig;
use crate::domain::errors::FeedError;
use crate::domain::repositories::{LivePriceSource, PriceObservation, PriceSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;
use zeroize::Zeroizing;

const DISCONNECT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_BUFFER: usize = 256;

pub type PriceCallback = Arc<dyn Fn(&PriceTick) + Send + Sync>;
pub type TradeCallback = Arc<dyn Fn(&TradeTick) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    BackingOff { attempt: u32, delay_ms: u64 },
    /// Reconnect attempts exhausted; `connect()` must be called again.
    Failed { attempts: u32 },
}

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Price(PriceTick),
    Trade(TradeTick),
    StateChanged(ConnectionState),
    ReconnectFailed { attempts: u32 },
    MessageDropped { reason: String },
}

#[derive(Debug)]
enum FeedCommand {
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(String),
}

#[derive(Clone, Default)]
struct Subscriber {
    on_price: Option<PriceCallback>,
    on_trade: Option<TradeCallback>,
}

struct FeedShared {
    config: FeedConfig,
    subscriptions: RwLock<HashMap<String, Vec<Subscriber>>>,
    last_prices: RwLock<HashMap<String, PriceObservation>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<FeedEvent>,
    price_sink: RwLock<Option<mpsc::Sender<PriceTick>>>,
}

struct FeedRuntime {
    command_tx: mpsc::Sender<FeedCommand>,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct PriceFeed {
    shared: Arc<FeedShared>,
    endpoint: Option<Url>,
    runtime: Mutex<Option<FeedRuntime>>,
}

impl PriceFeed {
    /// Builds a feed for `config.url`, appending `api_key` as the `api-key`
    /// query parameter when present. No connection is made until `connect()`.
    pub fn new(config: FeedConfig, api_key: Option<Zeroizing<String>>) -> Result<Self, FeedError> {
        let endpoint = match config.url.as_deref() {
            Some(raw) => {
                let mut url =
                    Url::parse(raw).map_err(|e| FeedError::InvalidEndpoint(e.to_string()))?;
                if !matches!(url.scheme(), "ws" | "wss") {
                    return Err(FeedError::InvalidEndpoint(format!(
                        "unsupported scheme '{}'",
                        url.scheme()
                    )));
                }
                if let Some(key) = api_key.as_ref() {
                    url.query_pairs_mut().append_pair("api-key", key.as_str());
                }
                Some(url)
            }
            None => None,
        };

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_buffer.max(16));

        Ok(Self {
            shared: Arc::new(FeedShared {
                config,
                subscriptions: RwLock::new(HashMap::new()),
                last_prices: RwLock::new(HashMap::new()),
                state,
                events,
                price_sink: RwLock::new(None),
            }),
            endpoint,
            runtime: Mutex::new(None),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Global observer stream. Slow receivers lag rather than block the feed.
    pub fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.shared.events.subscribe()
    }

    /// Lossless, ordered price stream for a single consumer. Publishing
    /// waits for buffer space, so a slow consumer slows the feed down rather
    /// than missing ticks. A later call replaces the previous stream.
    pub async fn price_stream(&self, capacity: usize) -> mpsc::Receiver<PriceTick> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.shared.price_sink.write().await = Some(tx);
        rx
    }

    /// Starts the connection task. Calling it while the task is alive is a
    /// no-op; after `Failed` it starts a fresh attempt cycle.
    pub async fn connect(&self) -> Result<(), FeedError> {
        let endpoint = self.endpoint.clone().ok_or(FeedError::NotConfigured)?;
        let mut runtime = self.runtime.lock().await;

        if let Some(rt) = runtime.as_ref() {
            if !rt.handle.is_finished() {
                debug!("Live feed already running");
                return Ok(());
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            run_connection(shared, endpoint, command_rx, shutdown_rx).await;
        });

        *runtime = Some(FeedRuntime {
            command_tx,
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stops the connection task, cancelling its heartbeat and any pending
    /// reconnect before the transport is closed.
    pub async fn disconnect(&self) {
        let runtime = self.runtime.lock().await.take();
        if let Some(rt) = runtime {
            let _ = rt.shutdown_tx.send(());
            let mut handle = rt.handle;
            if timeout(DISCONNECT_JOIN_TIMEOUT, &mut handle).await.is_err() {
                warn!("Live feed task did not stop in time, aborting");
                handle.abort();
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Registers interest in `asset`. Subscriptions survive reconnects.
    pub async fn subscribe(
        &self,
        asset: &str,
        on_price: Option<PriceCallback>,
        on_trade: Option<TradeCallback>,
    ) {
        let newly_added = {
            let mut subs = self.shared.subscriptions.write().await;
            let entry = subs.entry(asset.to_string()).or_default();
            let was_empty = entry.is_empty();
            entry.push(Subscriber { on_price, on_trade });
            was_empty
        };
        if newly_added {
            info!("Subscribed to live prices for {}", asset);
            self.send_command(FeedCommand::Subscribe(asset.to_string())).await;
        }
    }

    /// Removes every subscriber of `asset`. Returns false if there were none.
    pub async fn unsubscribe(&self, asset: &str) -> bool {
        let removed = self.shared.subscriptions.write().await.remove(asset).is_some();
        if removed {
            info!("Unsubscribed from live prices for {}", asset);
            self.send_command(FeedCommand::Unsubscribe(asset.to_string())).await;
        }
        removed
    }

    pub async fn subscribed_assets(&self) -> Vec<String> {
        self.shared.subscribed_assets().await
    }

    pub async fn get_last(&self, asset: &str) -> Option<PriceObservation> {
        self.shared.last_prices.read().await.get(asset).copied()
    }

    async fn send_command(&self, command: FeedCommand) {
        let runtime = self.runtime.lock().await;
        if let Some(rt) = runtime.as_ref() {
            if let Err(e) = rt.command_tx.send(command).await {
                debug!("Live feed task not running, command deferred to next connect: {}", e);
            }
        }
    }
}

#[async_trait]
impl LivePriceSource for PriceFeed {
    async fn last_price(&self, asset: &str) -> Option<PriceObservation> {
        self.get_last(asset).await
    }

    async fn record_polled(&self, asset: &str, price: f64, observed_at: DateTime<Utc>) {
        let mut prices = self.shared.last_prices.write().await;
        let newer = prices
            .get(asset)
            .map_or(true, |existing| existing.observed_at <= observed_at);
        if newer {
            prices.insert(
                asset.to_string(),
                PriceObservation {
                    price,
                    source: PriceSource::Polled,
                    observed_at,
                },
            );
        }
    }

    async fn track(&self, asset: &str) {
        let already = self.shared.subscriptions.read().await.contains_key(asset);
        if !already {
            self.subscribe(asset, None, None).await;
        }
    }

    async fn untrack(&self, asset: &str) {
        self.unsubscribe(asset).await;
    }
}

impl FeedShared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state.clone());
        if previous != state {
            match &state {
                ConnectionState::Failed { .. } => error!("Live feed state: {:?}", state),
                ConnectionState::BackingOff { .. } => warn!("Live feed state: {:?}", state),
                _ => info!("Live feed state: {:?}", state),
            }
            self.emit(FeedEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: FeedEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    async fn subscribed_assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = self.subscriptions.read().await.keys().cloned().collect();
        assets.sort();
        assets
    }

    /// Returns true if the message acknowledged liveness.
    async fn handle_text(&self, text: &str) -> bool {
        match parse_message(text, Utc::now()) {
            Ok(InboundMessage::Trade(trade)) => {
                self.publish_trade(trade).await;
                false
            }
            Ok(InboundMessage::Pong) => true,
            Ok(InboundMessage::Ack(message)) => {
                debug!("Live feed ack: {}", message);
                false
            }
            Ok(InboundMessage::ServerError(message)) => {
                warn!("Live feed server error: {}", message);
                false
            }
            Err(e) => {
                let preview: String = text.chars().take(120).collect();
                warn!("Dropping malformed feed message: {} ({})", e, preview);
                self.emit(FeedEvent::MessageDropped {
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    async fn publish_trade(&self, trade: TradeTick) {
        let tick = PriceTick::from(&trade);

        self.last_prices.write().await.insert(
            trade.asset.clone(),
            PriceObservation {
                price: tick.price,
                source: PriceSource::Live,
                observed_at: tick.observed_at,
            },
        );

        {
            let subs = self.subscriptions.read().await;
            if let Some(subscribers) = subs.get(&trade.asset) {
                for subscriber in subscribers {
                    if let Some(cb) = &subscriber.on_price {
                        invoke_guarded("price", &trade.asset, || cb(&tick));
                    }
                    if let Some(cb) = &subscriber.on_trade {
                        invoke_guarded("trade", &trade.asset, || cb(&trade));
                    }
                }
            }
        }

        self.emit(FeedEvent::Trade(trade));
        self.emit(FeedEvent::Price(tick.clone()));

        let sink = self.price_sink.read().await.clone();
        if let Some(sink) = sink {
            if sink.send(tick).await.is_err() {
                debug!("Price stream receiver dropped");
                let mut slot = self.price_sink.write().await;
                if slot.as_ref().map_or(false, |current| current.same_channel(&sink)) {
                    *slot = None;
                }
            }
        }
    }
}

/// Runs a subscriber callback; a panic is logged and contained.
fn invoke_guarded(kind: &str, asset: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("{} callback for {} panicked: {}", kind, asset, message);
    }
}

fn redacted(url: &Url) -> String {
    format!(
        "{}://{}{}",
        url.scheme(),
        url.host_str().unwrap_or(""),
        url.path()
    )
}

async fn run_connection(
    shared: Arc<FeedShared>,
    endpoint: Url,
    mut command_rx: mpsc::Receiver<FeedCommand>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let config = shared.config.clone();
    let mut attempt: u32 = 0;

    loop {
        shared.set_state(ConnectionState::Connecting {
            attempt: attempt + 1,
        });

        let outcome = tokio::select! {
            _ = shutdown_rx.recv() => {
                shared.set_state(ConnectionState::Disconnected);
                return;
            }
            result = timeout(config.connect_timeout, connect_async(endpoint.as_str())) => result,
        };

        match outcome {
            Ok(Ok((ws, _))) => {
                info!("Live feed connected to {}", redacted(&endpoint));
                attempt = 0;
                shared.set_state(ConnectionState::Connected);
                match run_session(&shared, ws, &mut command_rx, &mut shutdown_rx).await {
                    SessionEnd::Shutdown => {
                        shared.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    SessionEnd::Lost(reason) => {
                        warn!("Live feed connection lost: {}", reason);
                    }
                }
            }
            Ok(Err(e)) => warn!("Live feed connection failed: {}", e),
            Err(_) => warn!(
                "Live feed connection timed out after {:?}",
                config.connect_timeout
            ),
        }

        attempt += 1;
        if attempt > config.max_reconnect_attempts {
            let attempts = attempt - 1;
            error!(
                "Live feed gave up after {} reconnect attempts; falling back to polling",
                attempts
            );
            shared.set_state(ConnectionState::Failed { attempts });
            shared.emit(FeedEvent::ReconnectFailed { attempts });
            return;
        }

        let delay = config.reconnect_base_delay * attempt;
        shared.set_state(ConnectionState::BackingOff {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        let backoff = sleep(delay);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                _ = &mut backoff => break,
                _ = shutdown_rx.recv() => {
                    shared.set_state(ConnectionState::Disconnected);
                    return;
                }
                command = command_rx.recv() => {
                    // the subscription set is already updated; the next
                    // connect resubscribes everything
                    if command.is_none() {
                        shared.set_state(ConnectionState::Disconnected);
                        return;
                    }
                }
            }
        }
    }
}

async fn run_session(
    shared: &FeedShared,
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    command_rx: &mut mpsc::Receiver<FeedCommand>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> SessionEnd {
    let config = &shared.config;
    let (mut write, mut read) = ws.split();

    let assets = shared.subscribed_assets().await;
    if !assets.is_empty() {
        if let Err(e) = write.send(Message::Text(subscribe_message(&assets))).await {
            return SessionEnd::Lost(format!("resubscribe failed: {}", e));
        }
        info!("Resubscribed to {} asset(s)", assets.len());
    }

    let period = config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    let ack_deadline = sleep(config.heartbeat_timeout);
    tokio::pin!(ack_deadline);

    loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if shared.handle_text(&text).await {
                        ack_deadline.as_mut().reset(Instant::now() + config.heartbeat_timeout);
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    ack_deadline.as_mut().reset(Instant::now() + config.heartbeat_timeout);
                }
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite queues the pong reply itself
                    debug!("Live feed ping received");
                }
                Some(Ok(Message::Close(frame))) => {
                    return SessionEnd::Lost(format!("closed by server: {:?}", frame));
                }
                Some(Ok(_)) => debug!("Ignoring non-text frame"),
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                None => return SessionEnd::Lost("stream ended".to_string()),
            },
            _ = heartbeat.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    return SessionEnd::Lost(format!("heartbeat send failed: {}", e));
                }
            }
            _ = &mut ack_deadline => {
                return SessionEnd::Lost(format!(
                    "no heartbeat acknowledgment within {:?}",
                    config.heartbeat_timeout
                ));
            }
            command = command_rx.recv() => {
                let frame = match command {
                    Some(FeedCommand::Subscribe(asset)) => subscribe_message(&[asset]),
                    Some(FeedCommand::Unsubscribe(asset)) => unsubscribe_message(&[asset]),
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                };
                if let Err(e) = write.send(Message::Text(frame)).await {
                    return SessionEnd::Lost(format!("subscription update failed: {}", e));
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
        }
    }
}
