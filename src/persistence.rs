use crate::id::InfoHash;
use crate::leech::File;
use anyhow::Context;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const TORRENT_RECORD_MAGIC: [u8; 4] = *b"TRW1";

// 4 MiB per window. With a million hashes stored per window, a few in ten
// thousand lookups wrongly report a torrent as already stored.
const SEEN_BITS_POW2: u32 = 25;
const SEEN_K: u8 = 10;
const SEEN_ROTATE_EVERY: Duration = Duration::from_secs(15 * 60);

/// Where fetched torrents end up.
pub trait Database: Send {
    fn does_torrent_exist(&self, info_hash: &InfoHash) -> anyhow::Result<bool>;

    /// Safe to call twice for the same infohash; the first record wins.
    fn add_new_torrent(&mut self, info_hash: &InfoHash, name: &str, files: &[File]) -> anyhow::Result<()>;

    fn close(&mut self) -> anyhow::Result<()>;
}

/// Opens the engine named by the URL scheme: `sled:<path>` or `stdout:`.
pub fn make_database(raw: &str) -> anyhow::Result<Box<dyn Database>> {
    let url = url::Url::parse(raw).with_context(|| format!("parse database URL {raw:?}"))?;
    match url.scheme() {
        "sled" => {
            let path = url.path();
            anyhow::ensure!(!path.is_empty(), "sled database URL needs a path, e.g. sled:data/trawler.sled");
            Ok(Box::new(SledDatabase::open(path)?))
        }
        "stdout" => Ok(Box::new(StdoutDatabase::new(std::io::stdout()))),
        other => anyhow::bail!("unknown database engine {other:?} (expected sled or stdout)"),
    }
}

fn bincode_opts() -> impl bincode::Options {
    // Limit guards against huge allocations on corrupted data.
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_limit(16 * 1024 * 1024)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentRecord {
    pub info_hash_hex: String,
    pub name: String,
    pub total_size: u64,
    pub discovered_on: i64,
    pub files: Vec<File>,
}

fn encode_torrent_record(record: &TorrentRecord) -> anyhow::Result<Vec<u8>> {
    let payload = bincode_opts().serialize(record)?;
    let mut out = Vec::with_capacity(TORRENT_RECORD_MAGIC.len() + payload.len());
    out.extend_from_slice(&TORRENT_RECORD_MAGIC);
    out.extend_from_slice(&payload);
    Ok(out)
}

#[cfg(test)]
fn decode_torrent_record(bytes: &[u8]) -> anyhow::Result<TorrentRecord> {
    let payload = bytes
        .strip_prefix(&TORRENT_RECORD_MAGIC)
        .context("torrent record without magic")?;
    Ok(bincode_opts().deserialize(payload)?)
}

fn key_for_hash(info_hash: &InfoHash) -> Vec<u8> {
    let mut key = b"torrent:".to_vec();
    key.extend_from_slice(info_hash.to_hex().as_bytes());
    key
}

fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub struct SledDatabase {
    db: sled::Db,
}

impl SledDatabase {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("create database dir")?;
        }
        let db = sled::open(path).with_context(|| format!("open sled db at {}", path.display()))?;
        Ok(Self { db })
    }

    #[cfg(test)]
    fn get(&self, info_hash: &InfoHash) -> anyhow::Result<Option<TorrentRecord>> {
        let Some(bytes) = self.db.get(key_for_hash(info_hash))? else {
            return Ok(None);
        };
        Ok(Some(decode_torrent_record(&bytes)?))
    }
}

impl Database for SledDatabase {
    fn does_torrent_exist(&self, info_hash: &InfoHash) -> anyhow::Result<bool> {
        Ok(self.db.contains_key(key_for_hash(info_hash))?)
    }

    fn add_new_torrent(&mut self, info_hash: &InfoHash, name: &str, files: &[File]) -> anyhow::Result<()> {
        let record = TorrentRecord {
            info_hash_hex: info_hash.to_hex(),
            name: name.to_string(),
            total_size: files.iter().map(|f| f.size.max(0) as u64).sum(),
            discovered_on: now_unix_secs(),
            files: files.to_vec(),
        };
        let swapped = self.db.compare_and_swap(
            key_for_hash(info_hash),
            None as Option<&[u8]>,
            Some(encode_torrent_record(&record)?),
        )?;
        if swapped.is_err() {
            tracing::debug!(hash = %info_hash, "persistence: torrent already stored");
        }
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.db.flush().context("flush sled db")?;
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StdoutRecord<'a> {
    info_hash: String,
    name: &'a str,
    files: &'a [File],
}

/// Write-only engine: one JSON object per line. Stdout cannot be queried, so
/// `does_torrent_exist` is answered from `StoredHashes`.
pub struct StdoutDatabase<W: Write + Send> {
    out: W,
    seen: StoredHashes,
}

impl<W: Write + Send> StdoutDatabase<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            seen: StoredHashes::new(SEEN_BITS_POW2, SEEN_K, SEEN_ROTATE_EVERY),
        }
    }
}

impl<W: Write + Send> Database for StdoutDatabase<W> {
    fn does_torrent_exist(&self, info_hash: &InfoHash) -> anyhow::Result<bool> {
        Ok(self.seen.probably_contains(info_hash.as_bytes()))
    }

    fn add_new_torrent(&mut self, info_hash: &InfoHash, name: &str, files: &[File]) -> anyhow::Result<()> {
        if !self.seen.remember(info_hash.as_bytes()) {
            return Ok(());
        }
        let record = StdoutRecord {
            info_hash: info_hash.to_hex(),
            name,
            files,
        };
        serde_json::to_writer(&mut self.out, &record)?;
        self.out.write_all(b"\n")?;
        self.out.flush().context("flush stdout")?;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.out.flush().context("flush stdout")?;
        Ok(())
    }
}

/// Approximate record of which infohashes this engine has written.
///
/// A hash written since the last rotation always reports as present; an
/// unwritten one occasionally does too. Every `rotate_every` the older window
/// is dropped, so a torrent written two windows ago can be fetched and printed
/// again.
struct StoredHashes {
    current: BloomFilter,
    previous: BloomFilter,
    rotate_every: Duration,
    last_rotate: Instant,
}

impl StoredHashes {
    fn new(bits_pow2: u32, k: u8, rotate_every: Duration) -> Self {
        Self {
            current: BloomFilter::new_pow2(bits_pow2, k),
            previous: BloomFilter::new_pow2(bits_pow2, k),
            rotate_every,
            last_rotate: Instant::now(),
        }
    }

    fn maybe_rotate(&mut self) {
        if self.last_rotate.elapsed() < self.rotate_every {
            return;
        }
        let fresh = BloomFilter::new_pow2(self.current.bits_pow2, self.current.k);
        self.previous = std::mem::replace(&mut self.current, fresh);
        self.last_rotate = Instant::now();
    }

    fn probably_contains(&self, item: &[u8; 20]) -> bool {
        self.current.probably_contains(item) || self.previous.probably_contains(item)
    }

    /// Records `item` as written. False means it was (probably) written
    /// already and the caller should skip the output.
    fn remember(&mut self, item: &[u8; 20]) -> bool {
        self.maybe_rotate();
        if self.probably_contains(item) {
            return false;
        }
        self.current.insert(item);
        true
    }
}

/// Fixed-size bit set over infohashes; `k` bits per stored hash.
struct BloomFilter {
    bits: Vec<u64>,
    bits_pow2: u32,
    mask: u64,
    k: u8,
}

impl BloomFilter {
    fn new_pow2(bits_pow2: u32, k: u8) -> Self {
        let bits_pow2 = bits_pow2.clamp(6, 36);
        let m_bits = 1u64 << bits_pow2;
        Self {
            bits: vec![0u64; (m_bits / 64) as usize],
            bits_pow2,
            mask: m_bits - 1,
            k: k.max(1),
        }
    }

    fn bit_positions(&self, item: &[u8; 20]) -> impl Iterator<Item = (usize, u64)> + use<> {
        let (h1, h2) = hash_pair(item);
        let mask = self.mask;
        (0..self.k as u64).map(move |i| {
            let bit_index = h1.wrapping_add(i.wrapping_mul(h2)) & mask;
            ((bit_index >> 6) as usize, 1u64 << (bit_index & 63))
        })
    }

    fn probably_contains(&self, item: &[u8; 20]) -> bool {
        self.bit_positions(item)
            .all(|(word, bit)| self.bits[word] & bit != 0)
    }

    fn insert(&mut self, item: &[u8; 20]) {
        for (word, bit) in self.bit_positions(item) {
            self.bits[word] |= bit;
        }
    }
}

#[inline]
fn hash_pair(item: &[u8; 20]) -> (u64, u64) {
    // Bit i of k is h1 + i*h2. h2 is odd, hence coprime with the table size.
    let h1 = xxhash_rust::xxh3::xxh3_64(item);
    let h2 = xxhash_rust::xxh3::xxh3_64_with_seed(item, 0x9E37_79B9_7F4A_7C15) | 1;
    (h1, h2)
}
