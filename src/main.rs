mod bencode;
mod compact;
mod config;
mod dht;
mod id;
mod indexer;
mod krpc;
mod leech;
mod persistence;
mod protocol;
mod routing;
mod sink;
mod token;
mod transport;
mod trawler;

use anyhow::Context;

// Each leech holds a socket; beyond this, default fd limits start to bite.
const LEECH_MAX_N_WARN: usize = 1000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::Config::load().context("load config")?;
    if cfg.leech_max_n > LEECH_MAX_N_WARN {
        tracing::warn!(
            leech_max_n = cfg.leech_max_n,
            "main: more than {LEECH_MAX_N_WARN} concurrent leeches may exhaust file descriptors"
        );
    }

    let mut database = persistence::make_database(&cfg.database).context("open database")?;

    let (manager, mut discoveries) =
        dht::DhtManager::start(&cfg.indexer_addrs, cfg.dht_mode, &cfg.service_settings())
            .context("start DHT services")?;
    let (mut sink, mut drain) = sink::MetadataSink::new(cfg.leech_max_n, cfg.leech_deadline);

    tracing::info!(mode = ?cfg.dht_mode, database = %cfg.database, "main: crawler started");

    let mut ctrl_c = true;
    let outcome = loop {
        tokio::select! {
            Some(discovery) = discoveries.recv() => {
                match database.does_torrent_exist(&discovery.info_hash) {
                    Ok(true) => {}
                    Ok(false) => sink.sink(discovery),
                    Err(err) => break Err(err.context("check torrent existence")),
                }
            }
            // The infohash stays in flight until `metadata` drops at the end of this arm.
            Some(metadata) = drain.recv() => {
                if let Err(err) = database.add_new_torrent(&metadata.info_hash, &metadata.name, &metadata.files) {
                    break Err(err.context("add new torrent"));
                }
                tracing::info!(
                    hash = %metadata.info_hash,
                    name = %metadata.name,
                    files = metadata.files.len(),
                    size = metadata.total_size,
                    "main: fetched"
                );
            }
            signal = tokio::signal::ctrl_c(), if ctrl_c => {
                if shutdown_requested(signal, &mut ctrl_c) {
                    break Ok(());
                }
            }
        }
    };

    manager.terminate().await;
    sink.terminate();
    if let Err(err) = database.close() {
        tracing::error!(%err, "main: could not close database");
    }

    if let Err(err) = &outcome {
        tracing::error!("main: persistence failed: {err:#}");
    }
    outcome
}

/// Interprets one ctrl-c wait. A failed listener turns `listening` off so the
/// loop keeps running without that branch.
fn shutdown_requested(signal: std::io::Result<()>, listening: &mut bool) -> bool {
    match signal {
        Ok(()) => {
            tracing::info!("main: shutting down");
            true
        }
        Err(err) => {
            tracing::warn!(%err, "main: could not listen for ctrl-c; running until killed");
            *listening = false;
            false
        }
    }
}
