use crate::dht::{Discovery, ServiceSettings, resolve_bootstrap};
use crate::id::{InfoHash, NodeId};
use crate::krpc::{Message, QueryArguments, ResponseValues};
use crate::protocol::{Protocol, ProtocolHandler};
use crate::routing::{NeighbourBudget, RoutingTable};
use crate::transport::Transport;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior, interval};

/// Passive harvester: answers every query with an id that mirrors the
/// asker's, so large parts of the DHT treat us as a close neighbour and send
/// their announce_peer traffic our way.
pub struct TrawlingService {
    protocol: Protocol,
    true_id: NodeId,
    routing: Mutex<RoutingTable>,
    budget: NeighbourBudget,
    spoof_prefix_len: usize,
    interval: Duration,
    bootstrap: Vec<String>,
    discoveries: mpsc::Sender<Discovery>,
}

impl TrawlingService {
    pub fn new(
        transport: Transport,
        settings: &ServiceSettings,
        discoveries: mpsc::Sender<Discovery>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            protocol: Protocol::new(transport, weak.clone()),
            true_id: NodeId::random(),
            routing: Mutex::new(RoutingTable::new()),
            budget: NeighbourBudget::new(settings.max_neighbours),
            spoof_prefix_len: settings.spoof_prefix_len,
            interval: settings.interval,
            bootstrap: settings.bootstrap.clone(),
            discoveries,
        })
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        tracing::info!(local = %self.protocol.local_addr(), id = %self.true_id, "trawler: started");
        tokio::join!(self.protocol.run(shutdown.clone()), self.trawl(shutdown));
    }

    async fn trawl(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        self.budget.grow();

        let neighbours = {
            let mut table = self.routing.lock().unwrap_or_else(PoisonError::into_inner);
            if table.is_empty() {
                None
            } else {
                tracing::info!(
                    n = table.len(),
                    max_neighbours = self.budget.get(),
                    "trawler: latest status"
                );
                Some(table.drain())
            }
        };

        match neighbours {
            // Resolution is async, so it runs with the table unlocked.
            None => self.bootstrap().await,
            Some(neighbours) => {
                for (id, addr) in neighbours {
                    let msg = Message::find_node_query(&self.spoofed_for(id.as_bytes()), &NodeId::random());
                    self.protocol.send_message(&msg, addr);
                }
            }
        }
    }

    async fn bootstrap(&self) {
        tracing::info!("trawler: bootstrapping as routing table is empty");
        for addr in resolve_bootstrap(&self.bootstrap).await {
            let msg = Message::find_node_query(&self.true_id, &NodeId::random());
            self.protocol.send_message(&msg, addr);
        }
    }

    fn spoofed_for(&self, remote_id: &[u8]) -> NodeId {
        self.true_id.neighbour_of(remote_id, self.spoof_prefix_len)
    }
}

impl ProtocolHandler for TrawlingService {
    fn on_get_peers_query(&self, t: &[u8], args: &QueryArguments, from: SocketAddrV4) {
        let token = self.protocol.calculate_token(IpAddr::V4(*from.ip()));
        let msg = Message::get_peers_response_with_nodes(
            t,
            &self.spoofed_for(&args.id),
            &token,
            Vec::new(),
        );
        self.protocol.send_message(&msg, from);
    }

    fn on_announce_peer_query(&self, t: &[u8], args: &QueryArguments, from: SocketAddrV4) {
        let Some(info_hash) = InfoHash::from_slice(&args.info_hash) else {
            return;
        };
        let port = if args.implied_port.is_some_and(|p| p != 0) {
            from.port()
        } else {
            match args.port.and_then(|p| u16::try_from(p).ok()) {
                Some(p) => p,
                None => return,
            }
        };

        // Announces are harvested regardless; a stale token only gets noted.
        if !self.protocol.verify_token(IpAddr::V4(*from.ip()), &args.token) {
            tracing::trace!(hash = %info_hash, from = %from, "trawler: announce with unknown token");
        }

        let discovery = Discovery {
            info_hash,
            peer: SocketAddr::V4(SocketAddrV4::new(*from.ip(), port)),
        };
        match self.discoveries.try_send(discovery) {
            Ok(()) => {
                tracing::info!(hash = %info_hash, peer = %discovery.peer, "trawler: trawled");
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!(hash = %info_hash, "trawler: discovery channel full; dropping");
            }
            Err(TrySendError::Closed(_)) => {}
        }

        let ack = Message::announce_peer_response(t, &self.spoofed_for(&args.id));
        self.protocol.send_message(&ack, from);
    }

    fn on_find_node_response(&self, _t: &[u8], values: &ResponseValues, _from: SocketAddrV4) {
        let Some(nodes) = &values.nodes else {
            return;
        };
        let max = self.budget.get();
        let mut table = self.routing.lock().unwrap_or_else(PoisonError::into_inner);
        for node in nodes {
            if table.len() >= max {
                break;
            }
            table.insert_bounded(node, max);
        }
    }

    fn on_congestion(&self) {
        self.budget.on_congestion();
    }
}
