use crate::id::InfoHash;
use crate::indexer::IndexingService;
use crate::transport::Transport;
use crate::trawler::TrawlingService;
use std::net::{SocketAddr, SocketAddrV4};
use std::str::FromStr;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

pub const DEFAULT_BOOTSTRAP: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "dht.libtorrent.org:25401",
];

// Discoveries are dropped at the source while the coordinator is behind.
const DISCOVERY_BUFFER: usize = 64;

/// An infohash together with a TCP address of a peer that should have it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovery {
    pub info_hash: InfoHash,
    pub peer: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtMode {
    /// Harvest announce_peer traffic by posing as everyone's neighbour.
    Trawl,
    /// Actively sample infohashes (BEP 51) and look up their peers.
    Index,
}

impl FromStr for DhtMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trawl" | "trawling" => Ok(Self::Trawl),
            "index" | "indexing" => Ok(Self::Index),
            other => anyhow::bail!("unknown DHT mode {other:?} (expected trawl or index)"),
        }
    }
}

/// Knobs shared by both kinds of DHT service.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub interval: Duration,
    pub max_neighbours: usize,
    pub spoof_prefix_len: usize,
    pub bootstrap: Vec<String>,
}

/// Resolves bootstrap `host:port` entries, keeping IPv4 results only.
pub async fn resolve_bootstrap(hosts: &[String]) -> Vec<SocketAddrV4> {
    let mut out = Vec::new();
    for host in hosts {
        match tokio::net::lookup_host(host.as_str()).await {
            Ok(iter) => out.extend(iter.filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })),
            Err(err) => {
                tracing::error!(%err, host = %host, "dht: could not resolve bootstrap node");
            }
        }
    }
    out
}

/// Runs one DHT service per bind address and merges their discoveries.
pub struct DhtManager {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DhtManager {
    pub fn start(
        addrs: &[SocketAddr],
        mode: DhtMode,
        settings: &ServiceSettings,
    ) -> anyhow::Result<(Self, mpsc::Receiver<Discovery>)> {
        let (tx, rx) = mpsc::channel(DISCOVERY_BUFFER);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let transport = Transport::bind(*addr)?;
            tracing::info!(bind = %transport.local_addr(), ?mode, "dht: listening");
            let task = match mode {
                DhtMode::Trawl => {
                    let service = TrawlingService::new(transport, settings, tx.clone());
                    tokio::spawn(service.run(shutdown_rx.clone()))
                }
                DhtMode::Index => {
                    let service = IndexingService::new(transport, settings, tx.clone());
                    tokio::spawn(service.run(shutdown_rx.clone()))
                }
            };
            tasks.push(task);
        }

        Ok((Self { shutdown, tasks }, rx))
    }

    /// Stops every service and waits for their sockets to close. The
    /// discovery channel ends once all of them are gone.
    pub async fn terminate(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(%err, "dht: service task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes() {
        assert_eq!("trawl".parse::<DhtMode>().unwrap(), DhtMode::Trawl);
        assert_eq!(" Index ".parse::<DhtMode>().unwrap(), DhtMode::Index);
        assert!("crawl".parse::<DhtMode>().is_err());
    }

    #[tokio::test]
    async fn resolves_literal_bootstrap_addresses() {
        let hosts = vec!["127.0.0.1:6881".to_string(), "[::1]:6881".to_string()];
        let resolved = resolve_bootstrap(&hosts).await;
        assert_eq!(resolved, vec!["127.0.0.1:6881".parse::<SocketAddrV4>().unwrap()]);
    }

    #[tokio::test]
    async fn terminate_closes_the_discovery_channel() {
        let settings = ServiceSettings {
            interval: Duration::from_millis(50),
            max_neighbours: 100,
            spoof_prefix_len: 15,
            bootstrap: Vec::new(),
        };
        let addrs: Vec<SocketAddr> = vec![
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
        ];
        for mode in [DhtMode::Trawl, DhtMode::Index] {
            let (manager, mut rx) = DhtManager::start(&addrs, mode, &settings).unwrap();
            tokio::time::sleep(Duration::from_millis(120)).await;
            tokio::time::timeout(Duration::from_secs(5), manager.terminate())
                .await
                .unwrap();
            assert!(rx.recv().await.is_none());
        }
    }
}
