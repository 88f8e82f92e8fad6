use crate::dht::{DEFAULT_BOOTSTRAP, DhtMode, ServiceSettings};
use crate::id::ID_LEN;
use anyhow::Context;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

type Lookup<'a> = dyn Fn(&str) -> Option<String> + 'a;

#[derive(Clone, Debug)]
pub struct Config {
    // DHT
    pub indexer_addrs: Vec<SocketAddr>,
    pub indexer_interval: Duration,
    pub indexer_max_neighbors: usize,
    pub dht_mode: DhtMode,
    pub spoof_prefix_len: usize,
    pub bootstrap_nodes: Vec<String>,

    // Leech
    pub leech_max_n: usize,
    pub leech_deadline: Duration,

    // Persistence
    pub database: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Self::from_lookup(&|name: &str| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: &Lookup<'_>) -> anyhow::Result<Self> {
        let indexer_addrs = env_csv_strings(lookup, "TRAWLER_INDEXER_ADDRS", &["0.0.0.0:0"])
            .iter()
            .map(|s| SocketAddr::from_str(s).with_context(|| format!("parse TRAWLER_INDEXER_ADDRS entry {s:?}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let indexer_interval =
            Duration::from_millis(env_u64(lookup, "TRAWLER_INDEXER_INTERVAL_MS", 1_000).max(1));
        let indexer_max_neighbors = env_usize(lookup, "TRAWLER_INDEXER_MAX_NEIGHBORS", 10_000);
        let dht_mode = DhtMode::from_str(&env_string(lookup, "TRAWLER_DHT_MODE", "trawl"))
            .context("parse TRAWLER_DHT_MODE")?;
        let spoof_prefix_len = env_usize(lookup, "TRAWLER_SPOOF_PREFIX_LEN", 15).min(ID_LEN);
        let bootstrap_nodes = env_csv_strings(lookup, "TRAWLER_BOOTSTRAP_NODES", DEFAULT_BOOTSTRAP);

        let leech_max_n = env_usize(lookup, "TRAWLER_LEECH_MAX_N", 200);
        let leech_deadline = Duration::from_secs(env_u64(lookup, "TRAWLER_LEECH_DEADLINE_SECS", 5));

        let database = env_string(lookup, "TRAWLER_DATABASE", "sled:data/trawler.sled");

        Ok(Self {
            indexer_addrs,
            indexer_interval,
            indexer_max_neighbors,
            dht_mode,
            spoof_prefix_len,
            bootstrap_nodes,

            leech_max_n,
            leech_deadline,

            database,
        })
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            interval: self.indexer_interval,
            max_neighbours: self.indexer_max_neighbors,
            spoof_prefix_len: self.spoof_prefix_len,
            bootstrap: self.bootstrap_nodes.clone(),
        }
    }
}

fn env_opt_string(lookup: &Lookup<'_>, name: &str) -> Option<String> {
    lookup(name)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_string(lookup: &Lookup<'_>, name: &str, default: &str) -> String {
    env_opt_string(lookup, name).unwrap_or_else(|| default.to_string())
}

fn env_u64(lookup: &Lookup<'_>, name: &str, default: u64) -> u64 {
    env_opt_string(lookup, name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(lookup: &Lookup<'_>, name: &str, default: usize) -> usize {
    env_opt_string(lookup, name)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_csv_strings(lookup: &Lookup<'_>, name: &str, defaults: &[&str]) -> Vec<String> {
    if let Some(s) = env_opt_string(lookup, name) {
        let v: Vec<String> = s
            .split(',')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect();
        if !v.is_empty() {
            return v;
        }
    }
    defaults.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(&move |name: &str| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.indexer_addrs, vec!["0.0.0.0:0".parse::<SocketAddr>().unwrap()]);
        assert_eq!(cfg.indexer_interval, Duration::from_secs(1));
        assert_eq!(cfg.indexer_max_neighbors, 10_000);
        assert_eq!(cfg.dht_mode, DhtMode::Trawl);
        assert_eq!(cfg.spoof_prefix_len, 15);
        assert_eq!(cfg.bootstrap_nodes.len(), DEFAULT_BOOTSTRAP.len());
        assert_eq!(cfg.leech_max_n, 200);
        assert_eq!(cfg.leech_deadline, Duration::from_secs(5));
        assert_eq!(cfg.database, "sled:data/trawler.sled");
    }

    #[test]
    fn reads_overrides_and_ignores_garbage_numbers() {
        let cfg = config(&[
            ("TRAWLER_INDEXER_ADDRS", " 0.0.0.0:6881, 127.0.0.1:6882 ,"),
            ("TRAWLER_INDEXER_INTERVAL_MS", "250"),
            ("TRAWLER_INDEXER_MAX_NEIGHBORS", "lots"),
            ("TRAWLER_DHT_MODE", "index"),
            ("TRAWLER_SPOOF_PREFIX_LEN", "99"),
            ("TRAWLER_BOOTSTRAP_NODES", "10.0.0.1:6881"),
            ("TRAWLER_DATABASE", "stdout:"),
        ])
        .unwrap();
        assert_eq!(cfg.indexer_addrs.len(), 2);
        assert_eq!(cfg.indexer_addrs[1].port(), 6882);
        assert_eq!(cfg.indexer_interval, Duration::from_millis(250));
        assert_eq!(cfg.indexer_max_neighbors, 10_000);
        assert_eq!(cfg.dht_mode, DhtMode::Index);
        assert_eq!(cfg.spoof_prefix_len, ID_LEN);
        assert_eq!(cfg.bootstrap_nodes, vec!["10.0.0.1:6881".to_string()]);
        assert_eq!(cfg.database, "stdout:");

        let settings = cfg.service_settings();
        assert_eq!(settings.interval, Duration::from_millis(250));
        assert_eq!(settings.bootstrap, cfg.bootstrap_nodes);
    }

    #[test]
    fn bad_addresses_and_modes_are_errors() {
        assert!(config(&[("TRAWLER_INDEXER_ADDRS", "not-an-addr")]).is_err());
        assert!(config(&[("TRAWLER_DHT_MODE", "crawl")]).is_err());
    }
}
