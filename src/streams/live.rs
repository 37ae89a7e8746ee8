//! WebSocket tick feed
//!
//! Frames are JSON. Outbound:
//! `{"action": "subscribe", "symbols": ["NSE:SBIN-EQ"], "data_type": "SymbolUpdate"}`.
//! Inbound ticks are single objects or arrays of objects carrying at least
//! `symbol` and `ltp`; subscription acks look like
//! `{"type": "sub", "s": "ok", "symbols": [...]}`.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::adapter::{MarketDataAdapter, SubscriptionTable};
use super::consumer::ConsumerRef;
use crate::broker::BrokerError;
use crate::types::Tick;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum WsCommand {
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

/// Venue feed over a single auto-reconnecting WebSocket
pub struct WsMarketDataAdapter {
    table: Arc<SubscriptionTable>,
    ready: Arc<AtomicBool>,
    command_tx: mpsc::UnboundedSender<WsCommand>,
}

impl WsMarketDataAdapter {
    /// Connect using `BROKER_FEED_URL`, `BROKER_APP_ID` and `BROKER_ACCESS_TOKEN`
    pub fn from_env() -> Result<Arc<Self>> {
        let url =
            std::env::var("BROKER_FEED_URL").context("BROKER_FEED_URL environment variable not set")?;
        let app_id =
            std::env::var("BROKER_APP_ID").context("BROKER_APP_ID environment variable not set")?;
        let token = std::env::var("BROKER_ACCESS_TOKEN")
            .context("BROKER_ACCESS_TOKEN environment variable not set")?;
        Ok(Self::connect(url, format!("{}:{}", app_id, token)))
    }

    /// Spawn the connection task. Must be called inside a tokio runtime.
    pub fn connect(url: String, authorization: String) -> Arc<Self> {
        let table = Arc::new(SubscriptionTable::new());
        let ready = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_connection(
            url,
            authorization,
            table.clone(),
            ready.clone(),
            command_rx,
        ));

        Arc::new(Self {
            table,
            ready,
            command_tx,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(WsCommand::Shutdown);
    }
}

impl MarketDataAdapter for WsMarketDataAdapter {
    fn name(&self) -> &str {
        "websocket"
    }

    fn subscribe(&self, instrument: &str, sink: ConsumerRef) -> Result<(), BrokerError> {
        if self.table.add(instrument, sink) {
            self.command_tx
                .send(WsCommand::Subscribe(instrument.to_string()))
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    fn unsubscribe(&self, instrument: &str, sink: &ConsumerRef) {
        if self.table.remove(instrument, sink) {
            let _ = self
                .command_tx
                .send(WsCommand::Unsubscribe(instrument.to_string()));
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Indices and equities use different update channels
fn data_type(instrument: &str) -> &'static str {
    if instrument.to_lowercase().contains("index") {
        "IndexUpdate"
    } else {
        "SymbolUpdate"
    }
}

fn subscription_frame(action: &str, instrument: &str) -> String {
    json!({
        "action": action,
        "symbols": [instrument],
        "data_type": data_type(instrument),
    })
    .to_string()
}

async fn run_connection(
    url: String,
    authorization: String,
    table: Arc<SubscriptionTable>,
    ready: Arc<AtomicBool>,
    mut commands: mpsc::UnboundedReceiver<WsCommand>,
) {
    let mut delay = Duration::from_secs(1);

    loop {
        match open_socket(&url, &authorization).await {
            Ok(mut socket) => {
                ready.store(true, Ordering::SeqCst);
                delay = Duration::from_secs(1);
                info!("Tick feed connected to {}", url);

                let mut resubscribed = true;
                for instrument in table.instruments() {
                    let frame = subscription_frame("subscribe", &instrument);
                    if let Err(e) = socket.send(Message::Text(frame)).await {
                        warn!("Failed to resubscribe {}: {}", instrument, e);
                        resubscribed = false;
                        break;
                    }
                }

                if resubscribed {
                    match run_socket(&mut socket, &table, &mut commands).await {
                        Ok(true) => {
                            ready.store(false, Ordering::SeqCst);
                            info!("Tick feed shut down");
                            return;
                        }
                        Ok(false) => warn!("Tick feed closed by venue"),
                        Err(e) => error!("Tick feed error: {}", e),
                    }
                }
                ready.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                ready.store(false, Ordering::SeqCst);
                warn!("Tick feed connection failed: {}", e);
            }
        }

        // Drain commands queued while disconnected; the table is replayed on
        // reconnect.
        loop {
            match commands.try_recv() {
                Ok(WsCommand::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => return,
                Ok(_) => continue,
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }

        info!("Reconnecting tick feed in {:?}", delay);
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

async fn open_socket(url: &str, authorization: &str) -> Result<WsStream, BrokerError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| BrokerError::Transport(e.to_string()))?;
    let header = HeaderValue::from_str(authorization)
        .map_err(|e| BrokerError::Authentication(e.to_string()))?;
    request.headers_mut().insert("Authorization", header);

    let (socket, _) = connect_async(request)
        .await
        .map_err(|e| BrokerError::Transport(e.to_string()))?;
    Ok(socket)
}

/// Pump one connection. Returns `Ok(true)` on requested shutdown and
/// `Ok(false)` when the venue closed the stream.
async fn run_socket(
    socket: &mut WsStream,
    table: &SubscriptionTable,
    commands: &mut mpsc::UnboundedReceiver<WsCommand>,
) -> Result<bool, BrokerError> {
    let mut heartbeat = interval(Duration::from_secs(20));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let frame = match cmd {
                    Some(WsCommand::Subscribe(instrument)) => subscription_frame("subscribe", &instrument),
                    Some(WsCommand::Unsubscribe(instrument)) => subscription_frame("unsubscribe", &instrument),
                    Some(WsCommand::Shutdown) | None => {
                        let _ = socket.send(Message::Close(None)).await;
                        return Ok(true);
                    }
                };
                socket
                    .send(Message::Text(frame))
                    .await
                    .map_err(|e| BrokerError::Transport(e.to_string()))?;
            }
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_text(&text, table),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => handle_text(&text, table),
                        Err(_) => warn!("Received non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        socket
                            .send(Message::Pong(payload))
                            .await
                            .map_err(|e| BrokerError::Transport(e.to_string()))?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "Close frame received");
                        return Ok(false);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(BrokerError::Transport(e.to_string())),
                    None => return Ok(false),
                }
            }
            _ = heartbeat.tick() => {
                socket
                    .send(Message::Ping(Vec::new()))
                    .await
                    .map_err(|e| BrokerError::Transport(e.to_string()))?;
            }
        }
    }
}

/// What an inbound text frame contained
#[derive(Debug, PartialEq)]
enum FeedMessage {
    Ticks(Vec<Tick>),
    SubscriptionAck {
        ok: bool,
        instruments: Vec<String>,
        message: String,
    },
    Other,
}

fn parse_feed_text(text: &str) -> FeedMessage {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        warn!(payload = text, "Failed to parse feed payload");
        return FeedMessage::Other;
    };

    if value.get("type").and_then(Value::as_str) == Some("sub") {
        let instruments = value
            .get("symbols")
            .and_then(Value::as_array)
            .map(|symbols| {
                symbols
                    .iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        return FeedMessage::SubscriptionAck {
            ok: value.get("s").and_then(Value::as_str) == Some("ok"),
            instruments,
            message: value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
    }

    let ticks: Vec<Tick> = match &value {
        Value::Array(items) => items.iter().filter_map(Tick::from_feed_message).collect(),
        other => Tick::from_feed_message(other).into_iter().collect(),
    };

    if ticks.is_empty() {
        FeedMessage::Other
    } else {
        FeedMessage::Ticks(ticks)
    }
}

fn handle_text(text: &str, table: &SubscriptionTable) {
    match parse_feed_text(text) {
        FeedMessage::Ticks(ticks) => {
            for tick in &ticks {
                table.dispatch(tick);
            }
        }
        FeedMessage::SubscriptionAck {
            ok,
            instruments,
            message,
        } => {
            for instrument in &instruments {
                if ok {
                    table.notify_success(instrument);
                } else {
                    table.notify_failure(instrument, &message);
                }
            }
        }
        FeedMessage::Other => debug!(payload = text, "Ignoring feed message"),
    }
}
