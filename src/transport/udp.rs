use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{error, trace, warn};

use crate::transport::{DatagramHandler, Transport};

/// The largest payload of a UDP datagram over IPv4. The receive buffer has this size, so every
///  datagram is received completely.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// A [Transport] over a single UDP socket, which is used both for sending and receiving. That
///  way replies go out from the address the peer sent to.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    cancel_sender: broadcast::Sender<()>,
}
impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let (cancel_sender, _) = broadcast::channel(1);
        let socket = UdpSocket::bind(addr).await?;

        Ok(UdpTransport {
            socket: Arc::new(socket),
            cancel_sender,
        })
    }

    /// The bound address, with the actual port if the transport was bound to port 0
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!("starting UDP receive loop on {:?}", self.socket.local_addr());

        loop {
            tokio::select! {
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            handler.handle_datagram(&buf[..len], from).await;
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            return Err(e.into());
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        trace!("UDP receive loop stopped");
        Ok(())
    }

    fn cancel_recv_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collecting {
        received: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    #[async_trait]
    impl DatagramHandler for Collecting {
        async fn handle_datagram(&self, buf: &[u8], from: SocketAddr) {
            self.received.lock().unwrap().push((buf.to_vec(), from));
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let a = Arc::new(UdpTransport::bind(SocketAddr::from_str("127.0.0.1:0").unwrap()).await.unwrap());
        let b = Arc::new(UdpTransport::bind(SocketAddr::from_str("127.0.0.1:0").unwrap()).await.unwrap());
        let handler = Arc::new(Collecting::default());

        let b_loop = b.clone();
        let handler_for_loop = handler.clone();
        let recv = tokio::spawn(async move { b_loop.recv_loop(handler_for_loop).await });

        for _ in 0..50 {
            a.send(b.local_addr().unwrap(), b"hello").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !handler.received.lock().unwrap().is_empty() {
                break;
            }
        }

        b.cancel_recv_loop();
        recv.await.unwrap().unwrap();

        let received = handler.received.lock().unwrap();
        assert!(!received.is_empty());
        assert_eq!(received[0], (b"hello".to_vec(), a.local_addr().unwrap()));
    }
}
