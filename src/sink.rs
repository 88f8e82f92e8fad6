use crate::dht::Discovery;
use crate::id::{ID_LEN, InfoHash};
use crate::leech::{Leech, Metadata, make_peer_id};
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Duration;

type InFlight = Arc<Mutex<HashSet<InfoHash>>>;

/// Holds an infohash in the in-flight set; dropping it releases the hash,
/// unwinding included.
struct InFlightClaim {
    in_flight: InFlight,
    info_hash: InfoHash,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.info_hash);
    }
}

/// Verified metadata waiting on the drain. The infohash stays in flight until
/// the consumer drops this.
pub struct Fetched {
    metadata: Metadata,
    _claim: InFlightClaim,
}

impl Deref for Fetched {
    type Target = Metadata;

    fn deref(&self) -> &Metadata {
        &self.metadata
    }
}

/// Turns discoveries into fetched metadata, at most `max_concurrent` leeches
/// at a time and never two for the same infohash.
pub struct MetadataSink {
    in_flight: InFlight,
    drain: Option<mpsc::Sender<Fetched>>,
    max_concurrent: usize,
    deadline: Duration,
    peer_id: [u8; ID_LEN],
}

impl MetadataSink {
    pub fn new(max_concurrent: usize, deadline: Duration) -> (Self, mpsc::Receiver<Fetched>) {
        // A finished leech waits here while the consumer is busy.
        let (tx, rx) = mpsc::channel(1);
        let sink = Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            drain: Some(tx),
            max_concurrent,
            deadline,
            peer_id: make_peer_id(),
        };
        (sink, rx)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn claim(&self, info_hash: InfoHash) -> Option<InFlightClaim> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.len() >= self.max_concurrent {
            tracing::trace!(hash = %info_hash, "sink: at capacity; dropping");
            return None;
        }
        if !in_flight.insert(info_hash) {
            return None;
        }
        Some(InFlightClaim {
            in_flight: Arc::clone(&self.in_flight),
            info_hash,
        })
    }

    /// Spawns a leech for `discovery` unless one is already running for the
    /// same infohash or the concurrency cap is reached.
    ///
    /// # Panics
    ///
    /// Panics if called after [`MetadataSink::terminate`].
    pub fn sink(&mut self, discovery: Discovery) {
        let Some(drain) = &self.drain else {
            panic!("sink called after terminate");
        };
        let Some(claim) = self.claim(discovery.info_hash) else {
            return;
        };

        let drain = drain.downgrade();
        let deadline = self.deadline;
        let mut leech = Leech::new(discovery.info_hash, discovery.peer, self.peer_id);
        tokio::spawn(async move {
            match leech.run(deadline).await {
                Ok(metadata) => {
                    if let Some(drain) = drain.upgrade() {
                        let _ = drain
                            .send(Fetched {
                                metadata,
                                _claim: claim,
                            })
                            .await;
                    }
                }
                Err(err) => {
                    tracing::debug!(
                        hash = %discovery.info_hash,
                        peer = %discovery.peer,
                        %err,
                        received = leech.bytes_received(),
                        "sink: leech failed"
                    );
                }
            }
        });
    }

    /// Closes the drain. Leeches still running finish on their own and their
    /// results are discarded.
    pub fn terminate(&mut self) {
        self.drain = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Value;
    use crate::leech::METADATA_PIECE_SIZE;
    use crate::leech::tests::{hash_of, info_dict_of_size, scripted_peer, serving};
    use tokio::net::TcpListener;

    fn piece(index: i64, data: &[u8]) -> Vec<u8> {
        let mut payload = Value::dict([("msg_type", Value::Int(1)), ("piece", Value::Int(index))]).encode();
        payload.extend_from_slice(data);
        let mut frame = ((2 + payload.len()) as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&[20, 1]);
        frame.extend_from_slice(&payload);
        frame
    }

    #[tokio::test]
    async fn second_discovery_for_the_same_hash_is_ignored() {
        // Accepts connections but never answers, so the first leech stays busy.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap();

        let (mut sink, _rx) = MetadataSink::new(10, Duration::from_secs(5));
        let discovery = Discovery {
            info_hash: InfoHash([3; 20]),
            peer,
        };
        sink.sink(discovery);
        sink.sink(discovery);
        assert_eq!(sink.in_flight(), 1);

        sink.sink(Discovery {
            info_hash: InfoHash([4; 20]),
            peer,
        });
        assert_eq!(sink.in_flight(), 2);
    }

    #[tokio::test]
    async fn capacity_bounds_concurrent_leeches() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap();

        let (mut sink, _rx) = MetadataSink::new(2, Duration::from_secs(5));
        for i in 0..5u8 {
            sink.sink(Discovery {
                info_hash: InfoHash([i; 20]),
                peer,
            });
        }
        assert_eq!(sink.in_flight(), 2);
    }

    #[tokio::test]
    async fn delivers_metadata_and_releases_the_hash_afterwards() {
        let metadata = info_dict_of_size(22528);
        let h = hash_of(&metadata);
        let replies = serving(
            metadata.len(),
            vec![
                piece(0, &metadata[..METADATA_PIECE_SIZE]),
                piece(1, &metadata[METADATA_PIECE_SIZE..]),
            ],
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Relay between the TCP socket and the scripted peer.
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            tokio::spawn(scripted_peer(theirs, replies));
            let (mut a, mut b) = (stream, ours);
            let _ = tokio::io::copy_bidirectional(&mut a, &mut b).await;
        });

        let (mut sink, mut rx) = MetadataSink::new(10, Duration::from_secs(5));
        sink.sink(Discovery { info_hash: h, peer });

        // The finished leech sits in the drain, unread; its hash stays claimed.
        tokio::time::timeout(Duration::from_secs(5), async {
            while rx.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.in_flight(), 1);
        sink.sink(Discovery { info_hash: h, peer });
        assert_eq!(sink.in_flight(), 1);

        let got = rx.recv().await.unwrap();
        assert_eq!(got.info_hash, h);
        assert_eq!(sink.in_flight(), 1);

        drop(got);
        assert_eq!(sink.in_flight(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_leech_releases_its_hash() {
        // Nothing listens here, so the connection is refused.
        let peer = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let (mut sink, mut rx) = MetadataSink::new(10, Duration::from_secs(5));
        sink.sink(Discovery {
            info_hash: InfoHash([5; 20]),
            peer,
        });
        assert_eq!(sink.in_flight(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.in_flight() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn panicking_task_releases_its_claim() {
        let (sink, _rx) = MetadataSink::new(1, Duration::from_secs(1));
        let h = InfoHash([6; 20]);
        let claim = sink.claim(h).unwrap();
        assert!(sink.claim(InfoHash([7; 20])).is_none());

        let task = tokio::spawn(async move {
            let _claim = claim;
            panic!("leech blew up");
        });
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(sink.in_flight(), 0);
        assert!(sink.claim(h).is_some());
    }

    #[tokio::test]
    #[should_panic(expected = "after terminate")]
    async fn sinking_after_terminate_panics() {
        let (mut sink, _rx) = MetadataSink::new(1, Duration::from_secs(1));
        sink.terminate();
        sink.sink(Discovery {
            info_hash: InfoHash([0; 20]),
            peer: "127.0.0.1:1".parse().unwrap(),
        });
    }
}
