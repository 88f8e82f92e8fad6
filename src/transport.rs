use crate::krpc::Message;
use anyhow::Context;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::sync::watch;

// Largest payload of a single IPv4 UDP datagram.
pub const MAX_DATAGRAM: usize = 65_507;

pub trait TransportHandler: Send + Sync {
    /// Called for every datagram that decodes as a KRPC message.
    fn on_message(&self, msg: Message, from: SocketAddrV4);
    /// Called when the kernel pushes back on a send or receive.
    fn on_congestion(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("socket send buffer is congested")]
    Congested,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One bound IPv4 UDP socket. Sends go through a non-blocking std handle so
/// they can be issued from synchronous handlers; receives are driven by tokio.
pub struct Transport {
    sender: std::net::UdpSocket,
    receiver: UdpSocket,
    local_addr: SocketAddrV4,
}

impl Transport {
    pub fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        if !addr.is_ipv4() {
            anyhow::bail!("DHT transport only supports IPv4 addresses, got {addr}");
        }
        let socket = std::net::UdpSocket::bind(addr)
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;
        socket.set_nonblocking(true)?;
        let sender = socket.try_clone()?;
        let receiver = UdpSocket::from_std(socket)?;

        let local_addr = match receiver.local_addr()? {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(a) => anyhow::bail!("socket unexpectedly bound to IPv6 address {a}"),
        };

        Ok(Self {
            sender,
            receiver,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn send(&self, msg: &Message, to: SocketAddrV4) -> Result<(), SendError> {
        match self.sender.send_to(&msg.encode(), to) {
            Ok(_) => Ok(()),
            Err(err) if is_congestion(&err) => Err(SendError::Congested),
            Err(err) => Err(SendError::Io(err)),
        }
    }

    /// Receives until `shutdown` flips (or its sender goes away). The socket is
    /// closed when the transport is dropped.
    pub async fn run(&self, handler: &dyn TransportHandler, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                recv = self.receiver.recv_from(&mut buf) => match recv {
                    Ok((n, SocketAddr::V4(from))) => {
                        // Anything that is not a well-formed KRPC message is dropped here.
                        if let Ok(msg) = Message::decode(&buf[..n]) {
                            handler.on_message(msg, from);
                        }
                    }
                    Ok(_) => {}
                    Err(err) if is_congestion(&err) => handler.on_congestion(),
                    Err(err) => {
                        tracing::debug!(%err, local = %self.local_addr, "transport: receive failed");
                    }
                },
            }
        }
        tracing::debug!(local = %self.local_addr, "transport: receive loop stopped");
    }
}

/// Kernel flow control surfaces as EPERM (netfilter), ENOBUFS, or a full
/// send buffer on a non-blocking socket.
fn is_congestion(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock
    ) || err.raw_os_error() == Some(libc::ENOBUFS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Collector(mpsc::UnboundedSender<(Message, SocketAddrV4)>);

    impl TransportHandler for Collector {
        fn on_message(&self, msg: Message, from: SocketAddrV4) {
            let _ = self.0.send((msg, from));
        }
        fn on_congestion(&self) {}
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn delivers_valid_messages_and_drops_garbage() {
        let receiver = Arc::new(Transport::bind(loopback()).unwrap());
        let sender = Transport::bind(loopback()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = {
            let receiver = receiver.clone();
            tokio::spawn(async move {
                let collector = Collector(tx);
                receiver.run(&collector, stop_rx).await;
            })
        };

        let std_sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        std_sock.send_to(b"garbage", receiver.local_addr()).unwrap();

        let id = NodeId([9u8; 20]);
        let ping = Message::ping_response(b"aa", &id);
        sender.send(&ping, receiver.local_addr()).unwrap();

        let (msg, from) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, ping);
        assert_eq!(from, sender.local_addr());

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn refuses_ipv6_binds() {
        assert!(Transport::bind("[::1]:0".parse().unwrap()).is_err());
    }

    #[test]
    fn classifies_congestion_errors() {
        assert!(is_congestion(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(is_congestion(&io::Error::from_raw_os_error(libc::ENOBUFS)));
        assert!(!is_congestion(&io::Error::from(io::ErrorKind::ConnectionRefused)));
    }
}
