//! The seam between the engine and the network: the engine hands datagrams to a [Transport],
//!  and the transport hands received datagrams to a [DatagramHandler].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

pub mod udp;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Sync + Send {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    /// Receives datagrams and passes them to the handler until the loop is cancelled
    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()>;

    fn cancel_recv_loop(&self);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramHandler: Sync + Send {
    async fn handle_datagram(&self, buf: &[u8], from: SocketAddr);
}
