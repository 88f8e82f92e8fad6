use crate::id::{ID_LEN, NodeId};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

pub const COMPACT_NODE_LEN: usize = ID_LEN + 6;
pub const COMPACT_PEER_V4_LEN: usize = 6;
pub const COMPACT_PEER_V6_LEN: usize = 18;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CompactError {
    #[error("compact node info length {0} is not a multiple of 26")]
    NodesLength(usize),
    #[error("compact peer must be 6 or 18 bytes, got {0}")]
    PeerLength(usize),
}

/// Compact node info: 20-byte node id + 4-byte IPv4 + 2-byte big-endian port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNodeInfo {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

impl CompactNodeInfo {
    pub fn parse(b: &[u8; COMPACT_NODE_LEN]) -> Self {
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&b[..ID_LEN]);
        let ip = Ipv4Addr::new(b[20], b[21], b[22], b[23]);
        let port = u16::from_be_bytes([b[24], b[25]]);
        Self {
            id: NodeId(id),
            addr: SocketAddrV4::new(ip, port),
        }
    }

    pub fn parse_many(b: &[u8]) -> Result<Vec<Self>, CompactError> {
        if b.len() % COMPACT_NODE_LEN != 0 {
            return Err(CompactError::NodesLength(b.len()));
        }
        Ok(b
            .chunks_exact(COMPACT_NODE_LEN)
            .filter_map(|chunk| chunk.try_into().ok())
            .map(Self::parse)
            .collect())
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(&self.addr.ip().octets());
        out.extend_from_slice(&self.addr.port().to_be_bytes());
    }

    pub fn encode_many(nodes: &[Self]) -> Vec<u8> {
        let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
        for node in nodes {
            node.write_to(&mut out);
        }
        out
    }
}

/// Compact peer: 4-byte IPv4 or 16-byte IPv6 followed by a 2-byte big-endian port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactPeer(pub SocketAddr);

impl CompactPeer {
    pub fn parse(b: &[u8]) -> Result<Self, CompactError> {
        let addr = match b.len() {
            COMPACT_PEER_V4_LEN => {
                let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([b[4], b[5]]))
            }
            COMPACT_PEER_V6_LEN => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[..16]);
                SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    u16::from_be_bytes([b[16], b[17]]),
                )
            }
            n => return Err(CompactError::PeerLength(n)),
        };
        Ok(Self(addr))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = match self.0.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        out.extend_from_slice(&self.0.port().to_be_bytes());
        out
    }
}
