use crate::krpc::{Body, Message, QueryArguments, ResponseValues};
use crate::token::TokenSecret;
use crate::transport::{SendError, Transport, TransportHandler};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddrV4};
use std::sync::{Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior, interval};

const TOKEN_ROTATE_EVERY: Duration = Duration::from_secs(10 * 60);
const STATS_EVERY: Duration = Duration::from_secs(10);

// "Server Error"; noisy and carries nothing actionable.
const SERVER_ERROR: i64 = 202;

/// Upcalls from the protocol layer. Every method runs on the receive task and
/// must not block. Services implement only what they care about.
pub trait ProtocolHandler: Send + Sync {
    fn on_ping_query(&self, _t: &[u8], _args: &QueryArguments, _from: SocketAddrV4) {}
    fn on_find_node_query(&self, _t: &[u8], _args: &QueryArguments, _from: SocketAddrV4) {}
    fn on_get_peers_query(&self, _t: &[u8], _args: &QueryArguments, _from: SocketAddrV4) {}
    fn on_announce_peer_query(&self, _t: &[u8], _args: &QueryArguments, _from: SocketAddrV4) {}
    fn on_sample_infohashes_query(&self, _t: &[u8], _args: &QueryArguments, _from: SocketAddrV4) {
    }

    fn on_get_peers_response(&self, _t: &[u8], _values: &ResponseValues, _from: SocketAddrV4) {}
    fn on_find_node_response(&self, _t: &[u8], _values: &ResponseValues, _from: SocketAddrV4) {}
    fn on_ping_or_announce_peer_response(
        &self,
        _t: &[u8],
        _values: &ResponseValues,
        _from: SocketAddrV4,
    ) {
    }
    fn on_sample_infohashes_response(
        &self,
        _t: &[u8],
        _values: &ResponseValues,
        _from: SocketAddrV4,
    ) {
    }

    fn on_congestion(&self) {}
}

/// KRPC semantics on top of one [`Transport`]: validates and dispatches
/// incoming messages, issues write tokens and forwards outgoing messages.
pub struct Protocol {
    transport: Transport,
    handler: Weak<dyn ProtocolHandler>,
    tokens: Mutex<TokenSecret>,
    stats: Mutex<BTreeMap<&'static str, u64>>,
}

impl Protocol {
    /// `handler` is weak because the handler (a DHT service) owns the protocol.
    pub fn new(transport: Transport, handler: Weak<dyn ProtocolHandler>) -> Self {
        Self {
            transport,
            handler,
            tokens: Mutex::new(TokenSecret::new()),
            stats: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.transport.local_addr()
    }

    pub fn send_message(&self, msg: &Message, to: SocketAddrV4) {
        match self.transport.send(msg, to) {
            Ok(()) => {}
            Err(SendError::Congested) => {
                if let Some(handler) = self.handler.upgrade() {
                    handler.on_congestion();
                }
            }
            Err(SendError::Io(err)) => {
                tracing::debug!(%err, to = %to, "protocol: send failed");
            }
        }
    }

    pub fn calculate_token(&self, ip: IpAddr) -> [u8; 20] {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .calculate(ip)
    }

    pub fn verify_token(&self, ip: IpAddr, token: &[u8]) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .verify(ip, token)
    }

    /// Drives the receive loop, token rotation and stats reporting until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tokio::join!(
            self.transport.run(self, shutdown.clone()),
            self.rotate_tokens(shutdown.clone()),
            self.print_stats(shutdown),
        );
    }

    async fn rotate_tokens(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(TOKEN_ROTATE_EVERY);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.tokens.lock().unwrap_or_else(PoisonError::into_inner).rotate();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn print_stats(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(STATS_EVERY);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let counts = std::mem::take(
                        &mut *self.stats.lock().unwrap_or_else(PoisonError::into_inner),
                    );
                    if counts.is_empty() {
                        continue;
                    }
                    let total: u64 = counts.values().sum();
                    let summary = counts
                        .iter()
                        .map(|(kind, n)| format!("{kind}={n}"))
                        .collect::<Vec<_>>()
                        .join(" ");
                    tracing::info!(local = %self.local_addr(), total, %summary, "protocol: message stats");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn count(&self, kind: &'static str) {
        *self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default() += 1;
    }

    fn dispatch(&self, handler: &dyn ProtocolHandler, msg: &Message, from: SocketAddrV4) {
        let t = msg.t.as_slice();
        match &msg.body {
            Body::Query { method, args } => match method.as_slice() {
                b"ping" => {
                    self.count("q:ping");
                    if validate_ping_query(args) {
                        handler.on_ping_query(t, args, from);
                    }
                }
                b"find_node" => {
                    self.count("q:find_node");
                    if validate_find_node_query(args) {
                        handler.on_find_node_query(t, args, from);
                    }
                }
                b"get_peers" => {
                    self.count("q:get_peers");
                    if validate_get_peers_query(args) {
                        handler.on_get_peers_query(t, args, from);
                    }
                }
                b"announce_peer" => {
                    self.count("q:announce_peer");
                    if validate_announce_peer_query(args) {
                        handler.on_announce_peer_query(t, args, from);
                    }
                }
                b"sample_infohashes" => {
                    self.count("q:sample_infohashes");
                    if validate_sample_infohashes_query(args) {
                        handler.on_sample_infohashes_query(t, args, from);
                    }
                }
                // vote and friends
                _ => self.count("q:other"),
            },
            // Responses carry no method, so the kind is inferred from which
            // fields are present: samples, then token, then nodes.
            Body::Response(values) => {
                if values.samples.as_ref().is_some_and(|s| !s.is_empty()) {
                    self.count("r:sample_infohashes");
                    if validate_sample_infohashes_response(values) {
                        handler.on_sample_infohashes_response(t, values, from);
                    }
                } else if values.token.as_ref().is_some_and(|tok| !tok.is_empty()) {
                    self.count("r:get_peers");
                    if validate_get_peers_response(values) {
                        handler.on_get_peers_response(t, values, from);
                    }
                } else if values.nodes.as_ref().is_some_and(|n| !n.is_empty()) {
                    self.count("r:find_node");
                    if validate_find_node_response(values) {
                        handler.on_find_node_response(t, values, from);
                    }
                } else {
                    self.count("r:ping_or_announce");
                    if validate_ping_or_announce_peer_response(values) {
                        handler.on_ping_or_announce_peer_response(t, values, from);
                    }
                }
            }
            Body::Error(err) => {
                self.count("e");
                if err.code != SERVER_ERROR {
                    tracing::debug!(
                        code = err.code,
                        message = %String::from_utf8_lossy(&err.message),
                        from = %from,
                        "protocol: error received"
                    );
                }
            }
        }
    }
}

impl TransportHandler for Protocol {
    fn on_message(&self, msg: Message, from: SocketAddrV4) {
        let Some(handler) = self.handler.upgrade() else {
            return;
        };
        self.dispatch(handler.as_ref(), &msg, from);
    }

    fn on_congestion(&self) {
        if let Some(handler) = self.handler.upgrade() {
            handler.on_congestion();
        }
    }
}

pub fn validate_ping_query(args: &QueryArguments) -> bool {
    args.id.len() == 20
}

pub fn validate_find_node_query(args: &QueryArguments) -> bool {
    args.id.len() == 20 && args.target.len() == 20
}

pub fn validate_get_peers_query(args: &QueryArguments) -> bool {
    args.id.len() == 20 && args.info_hash.len() == 20
}

pub fn validate_announce_peer_query(args: &QueryArguments) -> bool {
    validate_get_peers_query(args)
        && args.port.is_some_and(|p| p > 0 && p <= i64::from(u16::MAX))
        && !args.token.is_empty()
}

pub fn validate_sample_infohashes_query(args: &QueryArguments) -> bool {
    args.id.len() == 20 && args.target.len() == 20
}

pub fn validate_ping_or_announce_peer_response(values: &ResponseValues) -> bool {
    values.id.len() == 20
}

pub fn validate_find_node_response(values: &ResponseValues) -> bool {
    values.id.len() == 20
}

pub fn validate_get_peers_response(values: &ResponseValues) -> bool {
    values.id.len() == 20 && values.token.as_ref().is_some_and(|t| !t.is_empty())
}

pub fn validate_sample_infohashes_response(values: &ResponseValues) -> bool {
    values.id.len() == 20 && values.samples.as_ref().is_some_and(|s| s.len() % 20 == 0)
}
