use crate::bencode::{self, Value};
use crate::id::{ID_LEN, InfoHash};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::io;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};

pub const METADATA_PIECE_SIZE: usize = 16 * 1024;
pub const MAX_METADATA_SIZE: usize = 10 * 1024 * 1024;
pub const HANDSHAKE_LEN: usize = 68;

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const PROTOCOL_PREFIX: &[u8; 20] = b"\x13BitTorrent protocol";
// LTEP (byte 5, 0x10) and DHT (byte 7, 0x01)
const RESERVED: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x01];
const MSG_EXTENDED: u8 = 20;
const EXT_HANDSHAKE_ID: u8 = 0;
/// Extension id we advertise for ut_metadata; peers tag their data with it.
const LOCAL_UT_METADATA: u8 = 1;
const EXT_HANDSHAKE: &[u8] = b"\x00\x00\x00\x1a\x14\x00d1:md11:ut_metadatai1eee";

const MSG_TYPE_REQUEST: i64 = 0;
const MSG_TYPE_DATA: i64 = 1;
const MSG_TYPE_REJECT: i64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum LeechError {
    #[error("peer unreachable: {0}")]
    PeerUnreachable(#[source] io::Error),
    #[error("peer did not finish within the deadline")]
    PeerTimedOut,
    #[error("connection to peer broke: {0}")]
    PeerReset(#[source] io::Error),
    #[error("peer does not support the extension protocol")]
    PeerNotExtensionCapable,
    #[error("peer rejected the metadata request")]
    PeerRejected,
    #[error("piece {piece} is {len} bytes but metadata is still incomplete")]
    ShortPiece { piece: usize, len: usize },
    #[error("peer sent more metadata than announced")]
    Overrun,
    #[error("metadata does not hash to the infohash")]
    InfohashMismatch,
    #[error("invalid info dictionary: {0}")]
    InvalidInfoDict(&'static str),
    #[error("malformed peer message: {0}")]
    MalformedMessage(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeechState {
    Dialing,
    BtHandshaked,
    ExtHandshaked,
    Requesting,
    Receiving,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub size: i64,
    pub path: String,
}

/// A verified torrent, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub total_size: u64,
    pub discovered_on: i64,
    pub files: Vec<File>,
}

/// Azureus-style: `-MC0007-` followed by 12 random ASCII digits.
pub fn make_peer_id() -> [u8; ID_LEN] {
    use rand::Rng;

    let mut id = [0u8; ID_LEN];
    id[..8].copy_from_slice(b"-MC0007-");
    let mut rng = rand::rng();
    for b in &mut id[8..] {
        *b = b'0' + rng.random_range(0..10u8);
    }
    id
}

/// Fetches the info dictionary of one torrent from one peer over BEP 9.
pub struct Leech {
    info_hash: InfoHash,
    peer: SocketAddr,
    peer_id: [u8; ID_LEN],
    state: LeechState,
    ut_metadata: u8,
    metadata_size: usize,
    metadata: Vec<u8>,
    bytes_received: usize,
}

impl Leech {
    pub fn new(info_hash: InfoHash, peer: SocketAddr, peer_id: [u8; ID_LEN]) -> Self {
        Self {
            info_hash,
            peer,
            peer_id,
            state: LeechState::Dialing,
            ut_metadata: 0,
            metadata_size: 0,
            metadata: Vec::new(),
            bytes_received: 0,
        }
    }

    pub fn state(&self) -> LeechState {
        self.state
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// Dials the peer and runs the whole session; `deadline` covers everything
    /// after the connection is up.
    pub async fn run(&mut self, deadline: Duration) -> Result<Metadata, LeechError> {
        self.state = LeechState::Dialing;
        let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(self.peer)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return self.fail(LeechError::PeerUnreachable(err)),
            Err(_) => {
                return self.fail(LeechError::PeerUnreachable(io::ErrorKind::TimedOut.into()));
            }
        };

        // An aborted session must not linger in TIME_WAIT with unacked data.
        if let Err(err) = socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
            return self.fail(LeechError::PeerReset(err));
        }
        if let Err(err) = stream.set_nodelay(true) {
            return self.fail(LeechError::PeerReset(err));
        }

        self.fetch_over(stream, deadline).await
    }

    /// Runs the session over an already connected stream, closes it, then
    /// verifies what was received.
    pub async fn fetch_over<S>(&mut self, mut stream: S, deadline: Duration) -> Result<Metadata, LeechError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exchanged = timeout(deadline, self.exchange(&mut stream)).await;
        drop(stream);

        let result = match exchanged {
            Err(_) => Err(LeechError::PeerTimedOut),
            Ok(Err(err)) => Err(err),
            Ok(Ok(())) => self.finish(),
        };
        match result {
            Ok(metadata) => {
                self.state = LeechState::Done;
                Ok(metadata)
            }
            Err(err) => self.fail(err),
        }
    }

    fn fail<T>(&mut self, err: LeechError) -> Result<T, LeechError> {
        self.state = LeechState::Failed;
        Err(err)
    }

    async fn exchange<S>(&mut self, stream: &mut S) -> Result<(), LeechError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.bt_handshake(stream).await?;
        self.state = LeechState::BtHandshaked;

        self.ext_handshake(stream).await?;
        self.state = LeechState::ExtHandshaked;

        self.state = LeechState::Requesting;
        self.request_all_pieces(stream).await?;

        self.state = LeechState::Receiving;
        while self.bytes_received < self.metadata_size {
            let msg = read_ut_metadata_message(stream).await?;
            let (header, data) = bencode::decode_prefix(&msg[2..])
                .map_err(|_| LeechError::MalformedMessage("undecodable ut_metadata header"))?;
            let msg_type = header
                .get(b"msg_type")
                .and_then(Value::as_int)
                .ok_or(LeechError::MalformedMessage("ut_metadata message without msg_type"))?;

            match msg_type {
                MSG_TYPE_REJECT => return Err(LeechError::PeerRejected),
                MSG_TYPE_DATA => self.store_piece(&header, data)?,
                // We serve nothing, so requests from the peer go unanswered.
                _ => {}
            }
        }
        Ok(())
    }

    async fn bt_handshake<S>(&self, stream: &mut S) -> Result<(), LeechError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ours = BytesMut::with_capacity(HANDSHAKE_LEN);
        ours.put_slice(PROTOCOL_PREFIX);
        ours.put_slice(&RESERVED);
        ours.put_slice(self.info_hash.as_bytes());
        ours.put_slice(&self.peer_id);
        stream.write_all(&ours).await.map_err(LeechError::PeerReset)?;

        let mut theirs = [0u8; HANDSHAKE_LEN];
        stream
            .read_exact(&mut theirs)
            .await
            .map_err(LeechError::PeerReset)?;
        if !theirs.starts_with(PROTOCOL_PREFIX) || theirs[25] & 0x10 == 0 {
            return Err(LeechError::PeerNotExtensionCapable);
        }
        Ok(())
    }

    async fn ext_handshake<S>(&mut self, stream: &mut S) -> Result<(), LeechError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(EXT_HANDSHAKE)
            .await
            .map_err(LeechError::PeerReset)?;

        let msg = loop {
            let msg = read_extension_message(stream).await?;
            if msg[1] == EXT_HANDSHAKE_ID {
                break msg;
            }
        };

        let (dict, _) = bencode::decode_prefix(&msg[2..])
            .map_err(|_| LeechError::MalformedMessage("undecodable extension handshake"))?;
        let ut_metadata = dict
            .get(b"m")
            .and_then(|m| m.get(b"ut_metadata"))
            .and_then(Value::as_int)
            .ok_or(LeechError::PeerNotExtensionCapable)?;
        let metadata_size = dict
            .get(b"metadata_size")
            .and_then(Value::as_int)
            .ok_or(LeechError::MalformedMessage("extension handshake without metadata_size"))?;

        if !(0 < metadata_size && metadata_size < MAX_METADATA_SIZE as i64) {
            return Err(LeechError::MalformedMessage("metadata_size out of range"));
        }
        if !(0 < ut_metadata && ut_metadata < 255) {
            return Err(LeechError::MalformedMessage("ut_metadata id out of range"));
        }

        self.ut_metadata = ut_metadata as u8;
        self.metadata_size = metadata_size as usize;
        self.metadata = vec![0u8; self.metadata_size];
        Ok(())
    }

    async fn request_all_pieces<S>(&self, stream: &mut S) -> Result<(), LeechError>
    where
        S: AsyncWrite + Unpin,
    {
        let n_pieces = self.metadata_size.div_ceil(METADATA_PIECE_SIZE);
        let mut out = BytesMut::with_capacity(n_pieces * 40);
        for piece in 0..n_pieces {
            let header = Value::dict([
                ("msg_type", Value::Int(MSG_TYPE_REQUEST)),
                ("piece", Value::Int(piece as i64)),
            ])
            .encode();
            out.put_u32((2 + header.len()) as u32);
            out.put_u8(MSG_EXTENDED);
            out.put_u8(self.ut_metadata);
            out.put_slice(&header);
        }
        stream.write_all(&out).await.map_err(LeechError::PeerReset)
    }

    fn store_piece(&mut self, header: &Value, data: &[u8]) -> Result<(), LeechError> {
        let piece = header
            .get(b"piece")
            .and_then(Value::as_int)
            .and_then(|p| usize::try_from(p).ok())
            .ok_or(LeechError::MalformedMessage("bad piece index"))?;
        if data.len() > METADATA_PIECE_SIZE {
            return Err(LeechError::Overrun);
        }

        if piece >= self.metadata_size.div_ceil(METADATA_PIECE_SIZE) {
            return Err(LeechError::Overrun);
        }
        let offset = piece * METADATA_PIECE_SIZE;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.metadata_size)
            .ok_or(LeechError::Overrun)?;
        self.metadata[offset..end].copy_from_slice(data);
        self.bytes_received += data.len();

        if self.bytes_received > self.metadata_size {
            return Err(LeechError::Overrun);
        }
        if data.len() < METADATA_PIECE_SIZE && self.bytes_received != self.metadata_size {
            return Err(LeechError::ShortPiece {
                piece,
                len: data.len(),
            });
        }
        Ok(())
    }

    fn finish(&self) -> Result<Metadata, LeechError> {
        let digest: [u8; ID_LEN] = Sha1::digest(&self.metadata).into();
        if digest != self.info_hash.0 {
            return Err(LeechError::InfohashMismatch);
        }

        let info = bencode::decode(&self.metadata)
            .map_err(|_| LeechError::InvalidInfoDict("not a bencoded value"))?;
        let (name, files) = parse_info(&info)?;
        let total_size = files.iter().map(|f| f.size as u64).sum();
        let discovered_on = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        Ok(Metadata {
            info_hash: self.info_hash,
            name,
            total_size,
            discovered_on,
            files,
        })
    }
}

/// Validates an info dictionary and flattens it into `(name, files)`.
pub fn parse_info(info: &Value) -> Result<(String, Vec<File>), LeechError> {
    if info.as_dict().is_none() {
        return Err(LeechError::InvalidInfoDict("info is not a dict"));
    }
    let name = utf8_preferred(info, b"name.utf-8", b"name")
        .and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or(LeechError::InvalidInfoDict("missing name"))?;

    let pieces = match info.get(b"pieces") {
        None => &[][..],
        Some(v) => v
            .as_bytes()
            .ok_or(LeechError::InvalidInfoDict("pieces is not a string"))?,
    };
    if pieces.len() % ID_LEN != 0 {
        return Err(LeechError::InvalidInfoDict("pieces has invalid length"));
    }
    let piece_length = int_or_zero(info, b"piece length")?;

    let files = match info.get(b"files").and_then(Value::as_list) {
        Some(list) if !list.is_empty() => {
            let mut files = Vec::with_capacity(list.len());
            for entry in list {
                let path = utf8_preferred(entry, b"path.utf-8", b"path")
                    .and_then(Value::as_list)
                    .ok_or(LeechError::InvalidInfoDict("file without path"))?
                    .iter()
                    .map(|c| c.as_bytes().map(String::from_utf8_lossy))
                    .collect::<Option<Vec<_>>>()
                    .ok_or(LeechError::InvalidInfoDict("path component is not a string"))?
                    .join("/");
                files.push(File {
                    size: int_or_zero(entry, b"length")?,
                    path,
                });
            }
            files
        }
        _ => vec![File {
            size: int_or_zero(info, b"length")?,
            path: name.clone(),
        }],
    };

    if files.iter().any(|f| f.size < 0) {
        return Err(LeechError::InvalidInfoDict("file size less than zero"));
    }
    let total = files
        .iter()
        .try_fold(0i64, |acc, f| acc.checked_add(f.size))
        .ok_or(LeechError::InvalidInfoDict("total size overflows"))?;

    let n_pieces = (pieces.len() / ID_LEN) as i64;
    if piece_length < 0 {
        return Err(LeechError::InvalidInfoDict("negative piece length"));
    }
    if piece_length == 0 {
        if total != 0 {
            return Err(LeechError::InvalidInfoDict("zero piece length"));
        }
    } else if (total as u64).div_ceil(piece_length as u64) != n_pieces as u64 {
        return Err(LeechError::InvalidInfoDict("piece count and file lengths are at odds"));
    }

    Ok((name, files))
}

fn utf8_preferred<'a>(dict: &'a Value, utf8_key: &[u8], key: &[u8]) -> Option<&'a Value> {
    dict.get(utf8_key).or_else(|| dict.get(key))
}

fn int_or_zero(dict: &Value, key: &[u8]) -> Result<i64, LeechError> {
    match dict.get(key) {
        None => Ok(0),
        Some(v) => v
            .as_int()
            .ok_or(LeechError::InvalidInfoDict("expected an integer")),
    }
}

/// Reads one length-prefixed peer message, keep-alives included.
async fn read_message<S>(stream: &mut S) -> Result<Vec<u8>, LeechError>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    stream
        .read_exact(&mut len)
        .await
        .map_err(LeechError::PeerReset)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_METADATA_SIZE {
        return Err(LeechError::MalformedMessage("message longer than 10 MiB"));
    }
    let mut msg = vec![0u8; len];
    stream
        .read_exact(&mut msg)
        .await
        .map_err(LeechError::PeerReset)?;
    Ok(msg)
}

/// Skips everything but LTEP messages. The result is at least two bytes:
/// the message id and the extension id.
async fn read_extension_message<S>(stream: &mut S) -> Result<Vec<u8>, LeechError>
where
    S: AsyncRead + Unpin,
{
    loop {
        let msg = read_message(stream).await?;
        if msg.len() >= 2 && msg[0] == MSG_EXTENDED {
            return Ok(msg);
        }
    }
}

async fn read_ut_metadata_message<S>(stream: &mut S) -> Result<Vec<u8>, LeechError>
where
    S: AsyncRead + Unpin,
{
    loop {
        let msg = read_extension_message(stream).await?;
        if msg[1] == LOCAL_UT_METADATA {
            return Ok(msg);
        }
    }
}
