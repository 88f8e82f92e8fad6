use crate::dht::{Discovery, ServiceSettings, resolve_bootstrap};
use crate::id::{ID_LEN, InfoHash, NodeId};
use crate::krpc::{Message, ResponseValues};
use crate::protocol::{Protocol, ProtocolHandler};
use crate::routing::{NeighbourBudget, RoutingTable};
use crate::transport::Transport;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior, interval};

/// Outstanding get_peers lookups kept at once. A lookup still unanswered after
/// this many newer ones is forgotten.
pub const SAMPLE_INFOHASH_STORAGE_CAP: usize = 8000;

/// Active harvester: asks neighbours for samples of the infohashes they store
/// (BEP 51), then asks the same node for peers of each sample.
pub struct IndexingService {
    protocol: Protocol,
    node_id: NodeId,
    routing: Mutex<RoutingTable>,
    budget: NeighbourBudget,
    interval: Duration,
    bootstrap: Vec<String>,
    lookups: Mutex<PendingLookups>,
    discoveries: mpsc::Sender<Discovery>,
}

/// get_peers transaction id -> the infohash it asked about.
#[derive(Default)]
struct PendingLookups {
    counter: u16,
    by_t: HashMap<[u8; 2], InfoHash>,
}

impl PendingLookups {
    fn register(&mut self, info_hash: InfoHash) -> [u8; 2] {
        let stale = self.counter.wrapping_sub(SAMPLE_INFOHASH_STORAGE_CAP as u16);
        self.by_t.remove(&stale.to_be_bytes());
        let t = self.counter.to_be_bytes();
        self.counter = self.counter.wrapping_add(1);
        self.by_t.insert(t, info_hash);
        t
    }

    fn resolve(&mut self, t: &[u8]) -> Option<InfoHash> {
        let t: [u8; 2] = t.try_into().ok()?;
        self.by_t.remove(&t)
    }
}

impl IndexingService {
    pub fn new(
        transport: Transport,
        settings: &ServiceSettings,
        discoveries: mpsc::Sender<Discovery>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            protocol: Protocol::new(transport, weak.clone()),
            node_id: NodeId::random(),
            routing: Mutex::new(RoutingTable::new()),
            budget: NeighbourBudget::new(settings.max_neighbours),
            interval: settings.interval,
            bootstrap: settings.bootstrap.clone(),
            lookups: Mutex::new(PendingLookups::default()),
            discoveries,
        })
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        tracing::info!(local = %self.protocol.local_addr(), id = %self.node_id, "indexer: started");
        tokio::join!(self.protocol.run(shutdown.clone()), self.index(shutdown));
    }

    async fn index(&self, mut shutdown: watch::Receiver<bool>) {
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
                    "indexer: latest status"
                );
                Some(table.drain())
            }
        };

        match neighbours {
            None => {
                tracing::info!("indexer: bootstrapping as routing table is empty");
                for addr in resolve_bootstrap(&self.bootstrap).await {
                    let msg = Message::find_node_query(&self.node_id, &NodeId::random());
                    self.protocol.send_message(&msg, addr);
                }
            }
            Some(neighbours) => {
                for addr in neighbours.into_values() {
                    self.sample(addr);
                }
            }
        }
    }

    fn sample(&self, addr: SocketAddrV4) {
        let msg = Message::sample_infohashes_query(b"aa", &self.node_id, &NodeId::random());
        self.protocol.send_message(&msg, addr);
    }

    fn learn_nodes(&self, values: &ResponseValues, and_sample: bool) {
        let Some(nodes) = &values.nodes else {
            return;
        };
        let max = self.budget.get();
        let mut fresh = Vec::new();
        {
            let mut table = self.routing.lock().unwrap_or_else(PoisonError::into_inner);
            for node in nodes {
                if table.len() >= max {
                    break;
                }
                if table.insert_bounded(node, max) {
                    fresh.push(node.addr);
                }
            }
        }
        if and_sample {
            for addr in fresh {
                self.sample(addr);
            }
        }
    }
}

impl ProtocolHandler for IndexingService {
    fn on_find_node_response(&self, _t: &[u8], values: &ResponseValues, _from: SocketAddrV4) {
        self.learn_nodes(values, true);
    }

    fn on_sample_infohashes_response(&self, _t: &[u8], values: &ResponseValues, from: SocketAddrV4) {
        let samples = values.samples.as_deref().unwrap_or_default();
        for chunk in samples.chunks_exact(ID_LEN) {
            let Some(info_hash) = InfoHash::from_slice(chunk) else {
                continue;
            };
            let t = self
                .lookups
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .register(info_hash);
            let msg = Message::get_peers_query(&t, &self.node_id, &info_hash);
            self.protocol.send_message(&msg, from);
        }
        self.learn_nodes(values, false);
    }

    fn on_get_peers_response(&self, t: &[u8], values: &ResponseValues, _from: SocketAddrV4) {
        let resolved = self
            .lookups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(t);
        let Some(info_hash) = resolved else {
            return;
        };
        let Some(peers) = &values.values else {
            return;
        };

        for peer in peers.iter().filter(|p| p.0.port() != 0) {
            let discovery = Discovery {
                info_hash,
                peer: peer.0,
            };
            match self.discoveries.try_send(discovery) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(hash = %info_hash, "indexer: discovery channel full; dropping");
                    return;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
        tracing::info!(hash = %info_hash, peers = peers.len(), "indexer: sampled");
    }

    fn on_congestion(&self) {
        self.budget.on_congestion();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact::{CompactNodeInfo, CompactPeer};
    use crate::krpc::Body;
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    fn service() -> (Arc<IndexingService>, mpsc::Receiver<Discovery>) {
        let transport = Transport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let settings = ServiceSettings {
            interval: Duration::from_secs(1),
            max_neighbours: 10,
            spoof_prefix_len: 15,
            bootstrap: Vec::new(),
        };
        let (tx, rx) = mpsc::channel(16);
        (IndexingService::new(transport, &settings, tx), rx)
    }

    async fn peer() -> (UdpSocket, SocketAddrV4) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(addr) = sock.local_addr().unwrap() else {
            unreachable!()
        };
        (sock, addr)
    }

    async fn recv_message(sock: &UdpSocket) -> Message {
        let mut buf = vec![0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        Message::decode(&buf[..n]).unwrap()
    }

    #[test]
    fn pending_lookups_are_resolved_once() {
        let mut pending = PendingLookups::default();
        assert_eq!(pending.register(InfoHash([1u8; 20])), [0, 0]);
        assert_eq!(pending.register(InfoHash([2u8; 20])), [0, 1]);

        assert_eq!(pending.resolve(&[0, 0]), Some(InfoHash([1u8; 20])));
        assert_eq!(pending.resolve(&[0, 0]), None);
        assert_eq!(pending.resolve(b"abc"), None);
        assert_eq!(pending.resolve(&[0, 1]), Some(InfoHash([2u8; 20])));
    }

    #[test]
    fn unanswered_lookups_age_out_instead_of_blocking_registration() {
        let mut pending = PendingLookups::default();
        for i in 0..SAMPLE_INFOHASH_STORAGE_CAP {
            assert_eq!(pending.register(InfoHash([1u8; 20])), (i as u16).to_be_bytes());
        }
        assert_eq!(pending.by_t.len(), SAMPLE_INFOHASH_STORAGE_CAP);

        // No responses at all: registration keeps working, the oldest lookup goes.
        let t = pending.register(InfoHash([2u8; 20]));
        assert_eq!(t, (SAMPLE_INFOHASH_STORAGE_CAP as u16).to_be_bytes());
        assert_eq!(pending.by_t.len(), SAMPLE_INFOHASH_STORAGE_CAP);
        assert_eq!(pending.resolve(&[0, 0]), None);
        assert_eq!(pending.resolve(&t), Some(InfoHash([2u8; 20])));

        // Across the u16 wraparound the map stays bounded.
        for _ in 0..70_000 {
            pending.register(InfoHash([3u8; 20]));
        }
        assert!(pending.by_t.len() <= SAMPLE_INFOHASH_STORAGE_CAP);
        let t = pending.register(InfoHash([4u8; 20]));
        assert_eq!(pending.resolve(&t), Some(InfoHash([4u8; 20])));
    }

    #[tokio::test]
    async fn samples_turn_into_get_peers_and_peers_into_discoveries() {
        let (svc, mut rx) = service();
        let (sock, addr) = peer().await;

        let mut samples = vec![0x11u8; 20];
        samples.extend_from_slice(&[0x22u8; 20]);
        let values = ResponseValues {
            id: vec![5u8; 20],
            samples: Some(samples),
            ..Default::default()
        };
        svc.on_sample_infohashes_response(b"aa", &values, addr);

        let mut asked = HashMap::new();
        for _ in 0..2 {
            let msg = recv_message(&sock).await;
            assert_eq!(msg.method(), Some(&b"get_peers"[..]));
            let Body::Query { args, .. } = msg.body else {
                unreachable!()
            };
            assert_eq!(args.id, svc.node_id.0.to_vec());
            asked.insert(args.info_hash.clone(), msg.t.clone());
        }
        let t = asked[&vec![0x22u8; 20]].clone();
        assert_eq!(t.len(), 2);

        let reply = ResponseValues {
            id: vec![5u8; 20],
            token: Some(b"tk".to_vec()),
            values: Some(vec![
                CompactPeer("9.9.9.9:6881".parse().unwrap()),
                CompactPeer("8.8.8.8:0".parse().unwrap()),
            ]),
            ..Default::default()
        };
        svc.on_get_peers_response(&t, &reply, addr);
        let found = rx.try_recv().unwrap();
        assert_eq!(found.info_hash, InfoHash([0x22; 20]));
        assert_eq!(found.peer, "9.9.9.9:6881".parse().unwrap());
        assert!(rx.try_recv().is_err());

        // The transaction is consumed by the first answer.
        svc.on_get_peers_response(&t, &reply, addr);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn find_node_response_samples_new_neighbours() {
        let (svc, _rx) = service();
        let (sock, addr) = peer().await;
        let values = ResponseValues {
            id: vec![5u8; 20],
            nodes: Some(vec![CompactNodeInfo {
                id: NodeId([7u8; 20]),
                addr,
            }]),
            ..Default::default()
        };
        svc.on_find_node_response(b"aa", &values, addr);

        let msg = recv_message(&sock).await;
        assert_eq!(msg.method(), Some(&b"sample_infohashes"[..]));
        assert_eq!(svc.routing.lock().unwrap().len(), 1);

        svc.tick().await;
        let msg = recv_message(&sock).await;
        assert_eq!(msg.method(), Some(&b"sample_infohashes"[..]));
        assert!(svc.routing.lock().unwrap().is_empty());
    }
}
