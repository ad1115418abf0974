// src/feed.rs
//! Live market feed bridge.
//!
//! Each user gets at most one WebSocket to the broker's streaming endpoint.
//! Binary ticks for instruments the connection is subscribed to are
//! republished on the user's channel in the [`ChannelHub`].
//!
//! Frame layout (little endian): an 8-byte header of response code (u8),
//! payload length (u16), exchange segment (u8) and security id (u32),
//! followed by a payload selected by the response code.

use crate::error::{GatewayError, Result};
use crate::models::{Credential, Envelope};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const HEADER_LEN: usize = 8;
pub const MAX_INSTRUMENTS_PER_FRAME: usize = 100;

const CODE_TICKER: u8 = 2;
const CODE_QUOTE: u8 = 4;
const CODE_PREV_CLOSE: u8 = 6;
const CODE_DEPTH: u8 = 8;
const CODE_DISCONNECT: u8 = 50;

const TICKER_LEN: usize = 16;
const QUOTE_LEN: usize = 50;
const PREV_CLOSE_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub code: u8,
    pub payload_len: u16,
    pub segment: u8,
    pub security_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedPacket {
    #[serde(rename_all = "camelCase")]
    Ticker {
        security_id: u32,
        segment: u8,
        ltp: f64,
        ltt: i64,
    },
    #[serde(rename_all = "camelCase")]
    Quote {
        security_id: u32,
        segment: u8,
        ltp: f64,
        ltq: i64,
        ltt: i64,
        atp: f64,
        volume: i64,
        total_sell_qty: i64,
        total_buy_qty: i64,
        open: f64,
        close: f64,
        high: f64,
        low: f64,
    },
    #[serde(rename_all = "camelCase")]
    PrevClose {
        security_id: u32,
        segment: u8,
        prev_close: f64,
        open_interest: i64,
    },
    #[serde(rename_all = "camelCase")]
    Depth {
        security_id: u32,
        segment: u8,
        payload_len: usize,
    },
    Disconnect {
        reason: u16,
    },
    #[serde(rename_all = "camelCase")]
    Unknown {
        code: u8,
        security_id: u32,
    },
}

impl FeedPacket {
    pub fn security_id(&self) -> Option<u32> {
        match self {
            FeedPacket::Ticker { security_id, .. }
            | FeedPacket::Quote { security_id, .. }
            | FeedPacket::PrevClose { security_id, .. }
            | FeedPacket::Depth { security_id, .. }
            | FeedPacket::Unknown { security_id, .. } => Some(*security_id),
            FeedPacket::Disconnect { .. } => None,
        }
    }
}

fn u16_at(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn i16_at(b: &[u8], at: usize) -> i64 {
    i16::from_le_bytes([b[at], b[at + 1]]) as i64
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn i32_at(b: &[u8], at: usize) -> i64 {
    i32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]) as i64
}

fn f32_at(b: &[u8], at: usize) -> f64 {
    f32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]) as f64
}

fn require(frame: &[u8], len: usize, what: &str) -> Result<()> {
    if frame.len() < len {
        return Err(GatewayError::MalformedPayload(format!(
            "{} frame needs {} bytes, got {}",
            what,
            len,
            frame.len()
        )));
    }
    Ok(())
}

pub fn parse_header(frame: &[u8]) -> Result<FrameHeader> {
    require(frame, HEADER_LEN, "header")?;
    Ok(FrameHeader {
        code: frame[0],
        payload_len: u16_at(frame, 1),
        segment: frame[3],
        security_id: u32_at(frame, 4),
    })
}

pub fn parse_packet(frame: &[u8]) -> Result<FeedPacket> {
    let header = parse_header(frame)?;
    let (security_id, segment) = (header.security_id, header.segment);
    let packet = match header.code {
        CODE_TICKER => {
            require(frame, TICKER_LEN, "ticker")?;
            FeedPacket::Ticker {
                security_id,
                segment,
                ltp: f32_at(frame, 8),
                ltt: i32_at(frame, 12),
            }
        }
        CODE_QUOTE => {
            require(frame, QUOTE_LEN, "quote")?;
            FeedPacket::Quote {
                security_id,
                segment,
                ltp: f32_at(frame, 8),
                ltq: i16_at(frame, 12),
                ltt: i32_at(frame, 14),
                atp: f32_at(frame, 18),
                volume: i32_at(frame, 22),
                total_sell_qty: i32_at(frame, 26),
                total_buy_qty: i32_at(frame, 30),
                open: f32_at(frame, 34),
                close: f32_at(frame, 38),
                high: f32_at(frame, 42),
                low: f32_at(frame, 46),
            }
        }
        CODE_PREV_CLOSE => {
            require(frame, PREV_CLOSE_LEN, "previous close")?;
            FeedPacket::PrevClose {
                security_id,
                segment,
                prev_close: f32_at(frame, 8),
                open_interest: i32_at(frame, 12),
            }
        }
        CODE_DEPTH => FeedPacket::Depth {
            security_id,
            segment,
            payload_len: frame.len() - HEADER_LEN,
        },
        CODE_DISCONNECT => FeedPacket::Disconnect {
            reason: if frame.len() >= HEADER_LEN + 2 {
                u16_at(frame, 8)
            } else {
                0
            },
        },
        code => FeedPacket::Unknown { code, security_id },
    };
    Ok(packet)
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameAction {
    Publish(Envelope),
    Disconnect(u16),
    Skip,
}

/// Decides what a binary frame means for a connection subscribed to
/// `subscribed`.
pub fn route_frame(subscribed: &HashSet<u32>, frame: &[u8]) -> FrameAction {
    match parse_packet(frame) {
        Ok(FeedPacket::Disconnect { reason }) => FrameAction::Disconnect(reason),
        Ok(packet) => match packet.security_id() {
            Some(id) if subscribed.contains(&id) => match serde_json::to_value(&packet) {
                Ok(data) => FrameAction::Publish(Envelope::new("tick", data)),
                Err(e) => {
                    warn!("Could not encode tick for {}: {}", id, e);
                    FrameAction::Skip
                }
            },
            _ => FrameAction::Skip,
        },
        Err(e) => {
            debug!("Dropping feed frame: {}", e);
            FrameAction::Skip
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlKind {
    Subscribe,
    Unsubscribe,
}

impl ControlKind {
    fn as_str(self) -> &'static str {
        match self {
            ControlKind::Subscribe => "SUBSCRIBE",
            ControlKind::Unsubscribe => "UNSUBSCRIBE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: ControlKind,
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Control frames for `ids`, at most [`MAX_INSTRUMENTS_PER_FRAME`] each.
pub fn subscription_frames(kind: ControlKind, ids: &[String]) -> Vec<String> {
    ids.chunks(MAX_INSTRUMENTS_PER_FRAME)
        .map(|chunk| json!({"type": kind.as_str(), "symbols": chunk}).to_string())
        .collect()
}

/// Numeric security id of `"1333"` or `"NSE_EQ:1333"`.
pub fn parse_security_id(instrument: &str) -> Option<u32> {
    let id = instrument.rsplit(':').next().unwrap_or(instrument);
    id.trim().parse().ok()
}

async fn apply_control(subscribed: &RwLock<HashSet<u32>>, kind: ControlKind, symbols: &[String]) {
    let ids = symbols.iter().filter_map(|s| {
        let id = parse_security_id(s);
        if id.is_none() {
            warn!("Ignoring non-numeric instrument id {:?}", s);
        }
        id
    });
    let mut set = subscribed.write().await;
    match kind {
        ControlKind::Subscribe => set.extend(ids),
        ControlKind::Unsubscribe => {
            for id in ids {
                set.remove(&id);
            }
        }
    }
}

/// Per-user broadcast channels for real-time envelopes.
pub struct ChannelHub {
    channels: RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
    capacity: usize,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn subscribe(&self, user_id: &str) -> broadcast::Receiver<Envelope> {
        let mut channels = self.channels.write().await;
        channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Returns the number of listeners reached; zero when nobody is
    /// listening. A channel whose listeners have all gone is dropped.
    pub async fn publish(&self, user_id: &str, envelope: Envelope) -> usize {
        let delivered = match self.channels.read().await.get(user_id) {
            Some(tx) => tx.send(envelope).ok(),
            None => return 0,
        };
        match delivered {
            Some(count) => count,
            None => {
                let mut channels = self.channels.write().await;
                if channels
                    .get(user_id)
                    .map_or(false, |tx| tx.receiver_count() == 0)
                {
                    channels.remove(user_id);
                    debug!("Dropped idle channel for user {}", user_id);
                }
                0
            }
        }
    }
}

type BrokerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct FeedConnection {
    id: u64,
    outbound: mpsc::Sender<Message>,
    subscribed: Arc<RwLock<HashSet<u32>>>,
    reader: JoinHandle<()>,
}

type Connections = Arc<RwLock<HashMap<String, FeedConnection>>>;

/// Live broker connections keyed by user id. Owned by the application
/// state; [`FeedRegistry::shutdown`] closes everything on exit.
pub struct FeedRegistry {
    connections: Connections,
    hub: Arc<ChannelHub>,
    ws_url: String,
    next_id: AtomicU64,
}

pub fn feed_url(ws_url: &str, credential: &Credential) -> Result<String> {
    let token = credential
        .access_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| GatewayError::MissingCredentials(credential.user_id.clone()))?;
    let mut url = Url::parse(ws_url)
        .map_err(|e| GatewayError::Config(format!("invalid feed url {}: {}", ws_url, e)))?;
    if url.path().is_empty() {
        url.set_path("/");
    }
    url.query_pairs_mut()
        .append_pair("version", "2")
        .append_pair("token", token)
        .append_pair("clientId", &credential.client_id)
        .append_pair("authType", "2");
    Ok(url.to_string())
}

impl FeedRegistry {
    pub fn new(hub: Arc<ChannelHub>, ws_url: &str) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            hub,
            ws_url: ws_url.to_string(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.hub
    }

    pub async fn is_running(&self, user_id: &str) -> bool {
        self.connections.read().await.contains_key(user_id)
    }

    /// Opens the user's broker connection. Returns `false` when one is
    /// already running.
    pub async fn start(&self, credential: &Credential) -> Result<bool> {
        let user_id = credential.user_id.clone();
        if self.is_running(&user_id).await {
            return Ok(false);
        }

        let url = feed_url(&self.ws_url, credential)?;
        let (socket, _) = connect_async(url.as_str()).await?;
        let (sink, stream) = socket.split();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, rx) = mpsc::channel::<Message>(256);
        let subscribed = Arc::new(RwLock::new(HashSet::new()));

        let mut connections = self.connections.write().await;
        if connections.contains_key(&user_id) {
            // Lost a race with a concurrent start; the new socket closes on drop.
            return Ok(false);
        }

        tokio::spawn(write_loop(sink, rx));
        let reader = tokio::spawn(read_loop(
            user_id.clone(),
            id,
            stream,
            subscribed.clone(),
            self.hub.clone(),
            self.connections.clone(),
        ));
        connections.insert(
            user_id.clone(),
            FeedConnection {
                id,
                outbound,
                subscribed,
                reader,
            },
        );
        drop(connections);

        info!("Live feed connected for user {}", user_id);
        self.hub
            .publish(&user_id, Envelope::new("feed_connected", json!({})))
            .await;
        Ok(true)
    }

    /// Closes the user's connection. Returns `false` when none was running.
    pub async fn stop(&self, user_id: &str) -> bool {
        let removed = self.connections.write().await.remove(user_id);
        match removed {
            Some(connection) => {
                close_connection(connection);
                info!("Live feed stopped for user {}", user_id);
                self.hub
                    .publish(user_id, Envelope::new("feed_closed", json!({})))
                    .await;
                true
            }
            None => false,
        }
    }

    pub async fn subscribe(&self, user_id: &str, instruments: &[String]) -> Result<usize> {
        self.send_control(user_id, ControlKind::Subscribe, instruments)
            .await
    }

    pub async fn unsubscribe(&self, user_id: &str, instruments: &[String]) -> Result<usize> {
        self.send_control(user_id, ControlKind::Unsubscribe, instruments)
            .await
    }

    async fn send_control(
        &self,
        user_id: &str,
        kind: ControlKind,
        instruments: &[String],
    ) -> Result<usize> {
        let (outbound, subscribed) = {
            let connections = self.connections.read().await;
            let connection = connections.get(user_id).ok_or_else(|| {
                GatewayError::Feed(format!("no live feed running for user {}", user_id))
            })?;
            (connection.outbound.clone(), connection.subscribed.clone())
        };

        // Track before sending so ticks that race the broker's ack still match.
        apply_control(&subscribed, kind, instruments).await;

        let frames = subscription_frames(kind, instruments);
        for frame in &frames {
            outbound
                .send(Message::Text(frame.clone()))
                .await
                .map_err(|_| GatewayError::Feed(format!("live feed for {} closed", user_id)))?;
        }
        debug!(
            "Sent {} {} frame(s) for user {}",
            frames.len(),
            kind.as_str(),
            user_id
        );
        Ok(frames.len())
    }

    pub async fn subscriptions(&self, user_id: &str) -> Vec<u32> {
        let subscribed = match self.connections.read().await.get(user_id) {
            Some(connection) => connection.subscribed.clone(),
            None => return Vec::new(),
        };
        let mut ids: Vec<u32> = subscribed.read().await.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Closes every connection. Called once the HTTP server has stopped.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, FeedConnection)> =
            self.connections.write().await.drain().collect();
        let count = drained.len();
        for (user_id, connection) in drained {
            close_connection(connection);
            self.hub
                .publish(&user_id, Envelope::new("feed_closed", json!({})))
                .await;
        }
        info!("Closed {} live feed connection(s)", count);
    }
}

fn close_connection(connection: FeedConnection) {
    if connection.outbound.try_send(Message::Close(None)).is_err() {
        debug!("Close frame not queued for feed connection {}", connection.id);
    }
    connection.reader.abort();
}

async fn write_loop(
    mut sink: futures::stream::SplitSink<BrokerSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            warn!("Live feed write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    user_id: String,
    connection_id: u64,
    mut stream: futures::stream::SplitStream<BrokerSocket>,
    subscribed: Arc<RwLock<HashSet<u32>>>,
    hub: Arc<ChannelHub>,
    connections: Connections,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(bytes)) => {
                let action = {
                    let subscribed = subscribed.read().await;
                    route_frame(&subscribed, &bytes)
                };
                match action {
                    FrameAction::Publish(envelope) => {
                        hub.publish(&user_id, envelope).await;
                    }
                    FrameAction::Disconnect(reason) => {
                        warn!("Broker closed live feed for {} (reason {})", user_id, reason);
                        hub.publish(
                            &user_id,
                            Envelope::new("feed_disconnected", json!({ "reason": reason })),
                        )
                        .await;
                        break;
                    }
                    FrameAction::Skip => {}
                }
            }
            Ok(Message::Text(text)) => match serde_json::from_str::<ControlMessage>(&text) {
                Ok(control) => apply_control(&subscribed, control.kind, &control.symbols).await,
                Err(_) => debug!("Ignoring text frame on feed for {}: {}", user_id, text),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Live feed for {} failed: {}", user_id, e);
                break;
            }
        }
    }

    let removed = {
        let mut connections = connections.write().await;
        let current = connections
            .get(&user_id)
            .map_or(false, |connection| connection.id == connection_id);
        if current {
            connections.remove(&user_id)
        } else {
            None
        }
    };
    if removed.is_some() {
        info!("Live feed closed for user {}", user_id);
        hub.publish(&user_id, Envelope::new("feed_closed", json!({})))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::credential;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn header(code: u8, segment: u8, security_id: u32, total_len: usize) -> Vec<u8> {
        let mut frame = vec![code];
        frame.extend_from_slice(&((total_len - HEADER_LEN) as u16).to_le_bytes());
        frame.push(segment);
        frame.extend_from_slice(&security_id.to_le_bytes());
        frame
    }

    fn ticker_frame(security_id: u32, ltp: f32, ltt: i32) -> Vec<u8> {
        let mut frame = header(CODE_TICKER, 1, security_id, TICKER_LEN);
        frame.extend_from_slice(&ltp.to_le_bytes());
        frame.extend_from_slice(&ltt.to_le_bytes());
        frame
    }

    fn disconnect_frame(reason: u16) -> Vec<u8> {
        let mut frame = header(CODE_DISCONNECT, 0, 0, HEADER_LEN + 2);
        frame.extend_from_slice(&reason.to_le_bytes());
        frame
    }

    #[test]
    fn parses_header_fields() {
        let frame = ticker_frame(1333, 1650.5, 1_700_000_000);
        let header = parse_header(&frame).unwrap();
        assert_eq!(header.code, CODE_TICKER);
        assert_eq!(header.payload_len, 8);
        assert_eq!(header.segment, 1);
        assert_eq!(header.security_id, 1333);
    }

    #[test]
    fn parses_ticker() {
        let packet = parse_packet(&ticker_frame(1333, 1650.5, 1_700_000_000)).unwrap();
        assert_eq!(
            packet,
            FeedPacket::Ticker {
                security_id: 1333,
                segment: 1,
                ltp: 1650.5,
                ltt: 1_700_000_000,
            }
        );
    }

    #[test]
    fn parses_full_quote() {
        let mut frame = header(CODE_QUOTE, 1, 11536, QUOTE_LEN);
        frame.extend_from_slice(&3500.25f32.to_le_bytes());
        frame.extend_from_slice(&15i16.to_le_bytes());
        frame.extend_from_slice(&1_700_000_100i32.to_le_bytes());
        frame.extend_from_slice(&3490.5f32.to_le_bytes());
        frame.extend_from_slice(&120_000i32.to_le_bytes());
        frame.extend_from_slice(&4_000i32.to_le_bytes());
        frame.extend_from_slice(&5_000i32.to_le_bytes());
        for price in [3450.0f32, 3440.0, 3510.0, 3430.0] {
            frame.extend_from_slice(&price.to_le_bytes());
        }
        assert_eq!(frame.len(), QUOTE_LEN);

        match parse_packet(&frame).unwrap() {
            FeedPacket::Quote {
                security_id,
                ltp,
                ltq,
                volume,
                total_buy_qty,
                open,
                close,
                high,
                low,
                ..
            } => {
                assert_eq!(security_id, 11536);
                assert_eq!(ltp, 3500.25);
                assert_eq!(ltq, 15);
                assert_eq!(volume, 120_000);
                assert_eq!(total_buy_qty, 5_000);
                assert_eq!((open, close, high, low), (3450.0, 3440.0, 3510.0, 3430.0));
            }
            other => panic!("expected quote, got {:?}", other),
        }
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(parse_packet(&[2, 0, 0]).is_err());
        let mut truncated = ticker_frame(1, 1.0, 1);
        truncated.truncate(12);
        assert!(matches!(
            parse_packet(&truncated),
            Err(GatewayError::MalformedPayload(_))
        ));
    }

    #[test]
    fn depth_and_disconnect_frames() {
        let mut depth = header(CODE_DEPTH, 1, 7, HEADER_LEN + 100);
        depth.resize(HEADER_LEN + 100, 0);
        assert_eq!(
            parse_packet(&depth).unwrap(),
            FeedPacket::Depth {
                security_id: 7,
                segment: 1,
                payload_len: 100
            }
        );
        assert_eq!(
            parse_packet(&disconnect_frame(805)).unwrap(),
            FeedPacket::Disconnect { reason: 805 }
        );
    }

    #[test]
    fn only_subscribed_instruments_are_published() {
        let subscribed: HashSet<u32> = [1333].into_iter().collect();

        match route_frame(&subscribed, &ticker_frame(1333, 10.0, 1)) {
            FrameAction::Publish(envelope) => {
                assert_eq!(envelope.kind, "tick");
                assert_eq!(envelope.data["kind"], "ticker");
                assert_eq!(envelope.data["securityId"], 1333);
            }
            other => panic!("expected publish, got {:?}", other),
        }
        assert_eq!(
            route_frame(&subscribed, &ticker_frame(999, 10.0, 1)),
            FrameAction::Skip
        );
        assert_eq!(
            route_frame(&subscribed, &disconnect_frame(807)),
            FrameAction::Disconnect(807)
        );
    }

    #[test]
    fn subscriptions_are_batched_by_hundred() {
        let ids: Vec<String> = (0..250).map(|i| i.to_string()).collect();
        let frames = subscription_frames(ControlKind::Subscribe, &ids);

        assert_eq!(frames.len(), 3);
        let sizes: Vec<usize> = frames
            .iter()
            .map(|f| {
                let control: ControlMessage = serde_json::from_str(f).unwrap();
                assert_eq!(control.kind, ControlKind::Subscribe);
                control.symbols.len()
            })
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[test]
    fn security_ids_accept_segment_prefix() {
        assert_eq!(parse_security_id("1333"), Some(1333));
        assert_eq!(parse_security_id("NSE_EQ:1333"), Some(1333));
        assert_eq!(parse_security_id("TCS"), None);
    }

    #[tokio::test]
    async fn text_control_frames_update_subscriptions() {
        let subscribed = RwLock::new(HashSet::new());
        apply_control(
            &subscribed,
            ControlKind::Subscribe,
            &["1".to_string(), "NSE_EQ:2".to_string(), "bad".to_string()],
        )
        .await;
        apply_control(&subscribed, ControlKind::Unsubscribe, &["1".to_string()]).await;
        let set = subscribed.read().await;
        assert_eq!(set.len(), 1);
        assert!(set.contains(&2));
    }

    #[tokio::test]
    async fn hub_delivers_to_the_right_user_only() {
        let hub = ChannelHub::new(16);
        let mut alice = hub.subscribe("alice").await;
        let mut bob = hub.subscribe("bob").await;

        assert_eq!(hub.publish("alice", Envelope::new("tick", json!(1))).await, 1);
        assert_eq!(hub.publish("nobody", Envelope::new("tick", json!(2))).await, 0);

        assert_eq!(alice.recv().await.unwrap().data, json!(1));
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn hub_drops_channels_nobody_listens_to() {
        let hub = ChannelHub::new(4);
        let rx = hub.subscribe("carol").await;
        assert_eq!(hub.channels.read().await.len(), 1);

        drop(rx);
        assert_eq!(hub.publish("carol", Envelope::new("tick", json!(1))).await, 0);
        assert!(hub.channels.read().await.is_empty());

        // A later listener gets a fresh channel.
        let mut rx = hub.subscribe("carol").await;
        assert_eq!(hub.publish("carol", Envelope::new("tick", json!(2))).await, 1);
        assert_eq!(rx.recv().await.unwrap().data, json!(2));
    }

    #[test]
    fn feed_url_carries_token_and_client() {
        let cred = credential("u1", Some("tok"));
        assert_eq!(
            feed_url("wss://feed.example", &cred).unwrap(),
            "wss://feed.example/?version=2&token=tok&clientId=1000000001&authType=2"
        );
        assert_eq!(
            feed_url("ws://127.0.0.1:9000/feed?region=in", &credential("u1", Some("a+b/c="))).unwrap(),
            "ws://127.0.0.1:9000/feed?region=in&version=2&token=a%2Bb%2Fc%3D&clientId=1000000001&authType=2"
        );
        assert!(feed_url("wss://feed.example", &credential("u1", None)).is_err());
    }

    async fn next_envelope(rx: &mut broadcast::Receiver<Envelope>) -> Envelope {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("envelope in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn bridges_broker_ticks_to_user_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let broker = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let subscribe = match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => text,
                other => panic!("expected subscribe text, got {:?}", other),
            };
            ws.send(Message::Binary(ticker_frame(999, 5.0, 1)))
                .await
                .unwrap();
            ws.send(Message::Binary(ticker_frame(1333, 1650.5, 2)))
                .await
                .unwrap();
            ws.send(Message::Binary(disconnect_frame(805))).await.unwrap();
            subscribe
        });

        let hub = Arc::new(ChannelHub::new(16));
        let registry = FeedRegistry::new(hub.clone(), &format!("ws://{}", addr));
        let mut rx = hub.subscribe("u1").await;

        assert!(registry.start(&credential("u1", Some("tok"))).await.unwrap());
        assert!(!registry.start(&credential("u1", Some("tok"))).await.unwrap());
        assert_eq!(next_envelope(&mut rx).await.kind, "feed_connected");

        let frames = registry
            .subscribe("u1", &["1333".to_string()])
            .await
            .unwrap();
        assert_eq!(frames, 1);
        assert_eq!(registry.subscriptions("u1").await, vec![1333]);

        let tick = next_envelope(&mut rx).await;
        assert_eq!(tick.kind, "tick");
        assert_eq!(tick.data["securityId"], 1333);

        let disconnected = next_envelope(&mut rx).await;
        assert_eq!(disconnected.kind, "feed_disconnected");
        assert_eq!(disconnected.data["reason"], 805);
        assert_eq!(next_envelope(&mut rx).await.kind, "feed_closed");

        let subscribe_frame: ControlMessage =
            serde_json::from_str(&broker.await.unwrap()).unwrap();
        assert_eq!(subscribe_frame.symbols, vec!["1333".to_string()]);
        assert!(!registry.is_running("u1").await);
    }

    #[tokio::test]
    async fn control_without_connection_is_an_error() {
        let registry = FeedRegistry::new(Arc::new(ChannelHub::new(4)), "ws://127.0.0.1:1");
        assert!(matches!(
            registry.subscribe("u1", &["1".to_string()]).await,
            Err(GatewayError::Feed(_))
        ));
        assert!(!registry.stop("u1").await);
        registry.shutdown().await;
    }
}
