use crate::bencode::{self, BencodeError, Value};
use crate::compact::{CompactError, CompactNodeInfo, CompactPeer};
use crate::id::{InfoHash, NodeId};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KrpcDecodeError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    #[error(transparent)]
    Compact(#[from] CompactError),
    #[error("malformed KRPC message: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Transaction id.
    pub t: Vec<u8>,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Query { method: Vec<u8>, args: QueryArguments },
    Response(ResponseValues),
    Error(KrpcError),
}

/// The `a` dictionary of a query. Byte fields left empty are not emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryArguments {
    pub id: Vec<u8>,
    pub info_hash: Vec<u8>,
    pub target: Vec<u8>,
    pub token: Vec<u8>,
    pub port: Option<i64>,
    pub implied_port: Option<i64>,
    // BEP 33
    pub seed: Option<i64>,
    pub noseed: Option<i64>,
    pub scrape: Option<i64>,
}

/// The `r` dictionary of a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseValues {
    pub id: Vec<u8>,
    pub nodes: Option<Vec<CompactNodeInfo>>,
    pub token: Option<Vec<u8>>,
    pub values: Option<Vec<CompactPeer>>,
    // BEP 51
    pub interval: Option<i64>,
    pub num: Option<i64>,
    pub samples: Option<Vec<u8>>,
    // BEP 33, 256-byte bloom filters
    pub bf_seeds: Option<Vec<u8>>,
    pub bf_peers: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcError {
    pub code: i64,
    pub message: Vec<u8>,
}

impl Message {
    pub fn find_node_query(id: &NodeId, target: &NodeId) -> Self {
        Self::query(
            b"aa",
            b"find_node",
            QueryArguments {
                id: id.as_bytes().to_vec(),
                target: target.as_bytes().to_vec(),
                ..Default::default()
            },
        )
    }

    pub fn get_peers_query(t: &[u8], id: &NodeId, info_hash: &InfoHash) -> Self {
        Self::query(
            t,
            b"get_peers",
            QueryArguments {
                id: id.as_bytes().to_vec(),
                info_hash: info_hash.as_bytes().to_vec(),
                ..Default::default()
            },
        )
    }

    pub fn sample_infohashes_query(t: &[u8], id: &NodeId, target: &NodeId) -> Self {
        Self::query(
            t,
            b"sample_infohashes",
            QueryArguments {
                id: id.as_bytes().to_vec(),
                target: target.as_bytes().to_vec(),
                ..Default::default()
            },
        )
    }

    pub fn ping_response(t: &[u8], id: &NodeId) -> Self {
        Self::response(
            t,
            ResponseValues {
                id: id.as_bytes().to_vec(),
                ..Default::default()
            },
        )
    }

    /// announce_peer and ping responses are indistinguishable on the wire.
    pub fn announce_peer_response(t: &[u8], id: &NodeId) -> Self {
        Self::ping_response(t, id)
    }

    pub fn get_peers_response_with_nodes(
        t: &[u8],
        id: &NodeId,
        token: &[u8],
        nodes: Vec<CompactNodeInfo>,
    ) -> Self {
        Self::response(
            t,
            ResponseValues {
                id: id.as_bytes().to_vec(),
                token: Some(token.to_vec()),
                nodes: Some(nodes),
                ..Default::default()
            },
        )
    }

    fn query(t: &[u8], method: &[u8], args: QueryArguments) -> Self {
        Self {
            t: t.to_vec(),
            body: Body::Query {
                method: method.to_vec(),
                args,
            },
        }
    }

    fn response(t: &[u8], values: ResponseValues) -> Self {
        Self {
            t: t.to_vec(),
            body: Body::Response(values),
        }
    }

    pub fn method(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Query { method, .. } => Some(method),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(b"t".to_vec(), Value::bytes(self.t.clone()));
        match &self.body {
            Body::Query { method, args } => {
                dict.insert(b"y".to_vec(), Value::bytes(*b"q"));
                dict.insert(b"q".to_vec(), Value::bytes(method.clone()));
                dict.insert(b"a".to_vec(), args.to_value());
            }
            Body::Response(values) => {
                dict.insert(b"y".to_vec(), Value::bytes(*b"r"));
                dict.insert(b"r".to_vec(), values.to_value());
            }
            Body::Error(err) => {
                dict.insert(b"y".to_vec(), Value::bytes(*b"e"));
                dict.insert(
                    b"e".to_vec(),
                    Value::List(vec![Value::Int(err.code), Value::bytes(err.message.clone())]),
                );
            }
        }
        Value::Dict(dict).encode()
    }

    /// Parses a datagram into a syntactically valid message. Semantic checks
    /// (id lengths and so on) are left to the protocol layer.
    pub fn decode(raw: &[u8]) -> Result<Self, KrpcDecodeError> {
        let root = bencode::decode(raw)?;
        if root.as_dict().is_none() {
            return Err(KrpcDecodeError::Malformed("message is not a dict"));
        }
        let t = root
            .get(b"t")
            .and_then(Value::as_bytes)
            .ok_or(KrpcDecodeError::Malformed("missing transaction id"))?
            .to_vec();
        let y = root
            .get(b"y")
            .and_then(Value::as_bytes)
            .ok_or(KrpcDecodeError::Malformed("missing message type"))?;

        let body = match y {
            b"q" => {
                let method = root
                    .get(b"q")
                    .and_then(Value::as_bytes)
                    .ok_or(KrpcDecodeError::Malformed("query without method"))?
                    .to_vec();
                let args = match root.get(b"a") {
                    Some(a) => QueryArguments::from_value(a)?,
                    None => QueryArguments::default(),
                };
                Body::Query { method, args }
            }
            b"r" => {
                let r = root
                    .get(b"r")
                    .ok_or(KrpcDecodeError::Malformed("response without values"))?;
                Body::Response(ResponseValues::from_value(r)?)
            }
            b"e" => {
                let e = root
                    .get(b"e")
                    .and_then(Value::as_list)
                    .ok_or(KrpcDecodeError::Malformed("error without list"))?;
                match e {
                    [code, message] => Body::Error(KrpcError {
                        code: code
                            .as_int()
                            .ok_or(KrpcDecodeError::Malformed("error code is not an integer"))?,
                        message: message
                            .as_bytes()
                            .ok_or(KrpcDecodeError::Malformed("error message is not a string"))?
                            .to_vec(),
                    }),
                    _ => return Err(KrpcDecodeError::Malformed("error list must have two items")),
                }
            }
            _ => return Err(KrpcDecodeError::Malformed("unknown message type")),
        };

        Ok(Self { t, body })
    }
}

impl QueryArguments {
    fn from_value(a: &Value) -> Result<Self, KrpcDecodeError> {
        if a.as_dict().is_none() {
            return Err(KrpcDecodeError::Malformed("arguments are not a dict"));
        }
        Ok(Self {
            id: opt_bytes(a, b"id")?.unwrap_or_default(),
            info_hash: opt_bytes(a, b"info_hash")?.unwrap_or_default(),
            target: opt_bytes(a, b"target")?.unwrap_or_default(),
            token: opt_bytes(a, b"token")?.unwrap_or_default(),
            port: opt_int(a, b"port")?,
            implied_port: opt_int(a, b"implied_port")?,
            seed: opt_int(a, b"seed")?,
            noseed: opt_int(a, b"noseed")?,
            scrape: opt_int(a, b"scrape")?,
        })
    }

    fn to_value(&self) -> Value {
        let mut dict = BTreeMap::new();
        dict.insert(b"id".to_vec(), Value::bytes(self.id.clone()));
        for (key, field) in [
            (&b"info_hash"[..], &self.info_hash),
            (&b"target"[..], &self.target),
            (&b"token"[..], &self.token),
        ] {
            if !field.is_empty() {
                dict.insert(key.to_vec(), Value::bytes(field.clone()));
            }
        }
        for (key, field) in [
            (&b"port"[..], self.port),
            (&b"implied_port"[..], self.implied_port),
            (&b"seed"[..], self.seed),
            (&b"noseed"[..], self.noseed),
            (&b"scrape"[..], self.scrape),
        ] {
            if let Some(v) = field {
                dict.insert(key.to_vec(), Value::Int(v));
            }
        }
        Value::Dict(dict)
    }
}

impl ResponseValues {
    fn from_value(r: &Value) -> Result<Self, KrpcDecodeError> {
        if r.as_dict().is_none() {
            return Err(KrpcDecodeError::Malformed("response values are not a dict"));
        }
        let nodes = opt_bytes(r, b"nodes")?
            .map(|raw| CompactNodeInfo::parse_many(&raw))
            .transpose()?;
        let values = match r.get(b"values") {
            None => None,
            Some(list) => {
                let list = list
                    .as_list()
                    .ok_or(KrpcDecodeError::Malformed("values is not a list"))?;
                let mut peers = Vec::with_capacity(list.len());
                for item in list {
                    let raw = item
                        .as_bytes()
                        .ok_or(KrpcDecodeError::Malformed("peer is not a string"))?;
                    peers.push(CompactPeer::parse(raw)?);
                }
                Some(peers)
            }
        };

        Ok(Self {
            id: opt_bytes(r, b"id")?.unwrap_or_default(),
            nodes,
            token: opt_bytes(r, b"token")?,
            values,
            interval: opt_int(r, b"interval")?,
            num: opt_int(r, b"num")?,
            samples: opt_bytes(r, b"samples")?,
            bf_seeds: opt_bytes(r, b"BFsd")?,
            bf_peers: opt_bytes(r, b"BFpe")?,
        })
    }

    fn to_value(&self) -> Value {
        let mut dict = BTreeMap::new();
        dict.insert(b"id".to_vec(), Value::bytes(self.id.clone()));
        if let Some(nodes) = &self.nodes {
            dict.insert(b"nodes".to_vec(), Value::bytes(CompactNodeInfo::encode_many(nodes)));
        }
        if let Some(values) = &self.values {
            dict.insert(
                b"values".to_vec(),
                Value::List(values.iter().map(|p| Value::bytes(p.encode())).collect()),
            );
        }
        for (key, field) in [
            (&b"token"[..], &self.token),
            (&b"samples"[..], &self.samples),
            (&b"BFsd"[..], &self.bf_seeds),
            (&b"BFpe"[..], &self.bf_peers),
        ] {
            if let Some(v) = field {
                dict.insert(key.to_vec(), Value::bytes(v.clone()));
            }
        }
        for (key, field) in [(&b"interval"[..], self.interval), (&b"num"[..], self.num)] {
            if let Some(v) = field {
                dict.insert(key.to_vec(), Value::Int(v));
            }
        }
        Value::Dict(dict)
    }
}

fn opt_bytes(dict: &Value, key: &[u8]) -> Result<Option<Vec<u8>>, KrpcDecodeError> {
    match dict.get(key) {
        None => Ok(None),
        Some(Value::Bytes(b)) => Ok(Some(b.clone())),
        Some(_) => Err(KrpcDecodeError::Malformed("expected a byte string")),
    }
}

fn opt_int(dict: &Value, key: &[u8]) -> Result<Option<i64>, KrpcDecodeError> {
    match dict.get(key) {
        None => Ok(None),
        Some(Value::Int(i)) => Ok(Some(*i)),
        Some(_) => Err(KrpcDecodeError::Malformed("expected an integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_ping_query_byte_exact() {
        let msg = Message {
            t: b"aa".to_vec(),
            body: Body::Query {
                method: b"ping".to_vec(),
                args: QueryArguments {
                    id: b"abcdefghij0123456789".to_vec(),
                    ..Default::default()
                },
            },
        };
        assert_eq!(
            msg.encode(),
            b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe".to_vec()
        );
    }

    #[test]
    fn decodes_announce_peer_query() {
        let raw = b"d1:ad2:id20:abcdefghij012345678912:implied_porti1e9:info_hash20:mnopqrstuvwxyz1234564:porti6881e5:token8:aoeusnthe1:q13:announce_peer1:t2:aa1:y1:qe";
        let msg = Message::decode(raw).unwrap();

        assert_eq!(msg.t, b"aa");
        assert_eq!(msg.method(), Some(&b"announce_peer"[..]));
        let Body::Query { args, .. } = &msg.body else {
            panic!("expected a query");
        };
        assert_eq!(args.id, b"abcdefghij0123456789");
        assert_eq!(args.info_hash, b"mnopqrstuvwxyz123456");
        assert_eq!(args.port, Some(6881));
        assert_eq!(args.implied_port, Some(1));
        assert_eq!(args.token, b"aoeusnth");

        // Re-encoding is canonical, so it reproduces the sorted input exactly.
        assert_eq!(msg.encode(), raw.to_vec());
    }

    #[test]
    fn get_peers_response_carries_empty_nodes_and_token() {
        let id = NodeId(*b"abcdefghij0123456789");
        let msg = Message::get_peers_response_with_nodes(b"xy", &id, b"tok", Vec::new());
        assert_eq!(
            msg.encode(),
            b"d1:rd2:id20:abcdefghij01234567895:nodes0:5:token3:toke1:t2:xy1:y1:re".to_vec()
        );
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn decodes_response_values_and_errors() {
        let mut r = BTreeMap::new();
        r.insert(b"id".to_vec(), Value::bytes([1u8; 20]));
        r.insert(b"token".to_vec(), Value::bytes(*b"tk"));
        r.insert(
            b"values".to_vec(),
            Value::List(vec![
                Value::bytes(vec![1, 2, 3, 4, 0x1A, 0xE1]),
                Value::bytes([0u8; 18]),
            ]),
        );
        let raw = Value::dict([
            ("r", Value::Dict(r)),
            ("t", Value::bytes(*b"ab")),
            ("y", Value::bytes(*b"r")),
        ])
        .encode();

        let msg = Message::decode(&raw).unwrap();
        let Body::Response(values) = msg.body else {
            panic!("expected a response");
        };
        let peers = values.values.unwrap();
        assert_eq!(peers[0].0, "1.2.3.4:6881".parse().unwrap());
        assert!(peers[1].0.is_ipv6());

        let err = Message::decode(b"d1:eli202e12:Server Errore1:t2:aa1:y1:ee").unwrap();
        assert_eq!(
            err.body,
            Body::Error(KrpcError {
                code: 202,
                message: b"Server Error".to_vec()
            })
        );
    }

    #[test]
    fn rejects_syntactically_invalid_datagrams() {
        assert!(Message::decode(b"not bencode").is_err());
        assert!(Message::decode(b"le").is_err());
        assert!(Message::decode(b"d1:y1:qe").is_err());
        assert!(Message::decode(b"d1:t2:aa1:y1:xe").is_err());
        assert!(Message::decode(b"d1:t2:aa1:y1:re").is_err());
        assert!(Message::decode(b"d1:eli201ee1:t2:aa1:y1:ee").is_err());
        // nodes must be a whole number of 26-byte entries
        assert!(matches!(
            Message::decode(b"d1:rd2:id20:abcdefghij01234567895:nodes3:abce1:t2:aa1:y1:re"),
            Err(KrpcDecodeError::Compact(_))
        ));
        // port must be an integer
        assert!(Message::decode(b"d1:ad2:id20:abcdefghij01234567894:port4:6881e1:q4:ping1:t2:aa1:y1:qe").is_err());
    }
}
