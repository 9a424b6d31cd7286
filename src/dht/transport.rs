//! DHT transport module
//!
//! Datagram transport behind a trait so the dispatcher runs unchanged over
//! a real UDP socket or over an in-process simulated network.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, trace};

use crate::error::{DhtError, Result};

/// Unreliable datagram transport
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()>;

    /// Wait for the next datagram
    async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr)>;

    /// Address this transport is bound to
    fn local_addr(&self) -> SocketAddr;
}

/// Transport over a tokio UDP socket
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buf: Mutex<Vec<u8>>,
}

impl UdpTransport {
    /// Bind a UDP socket for datagrams of up to `max_datagram` bytes.
    /// Anything longer arrives truncated to `max_datagram + 1` bytes.
    pub async fn bind(bind_addr: SocketAddr, max_datagram: usize) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            error!("Failed to bind UDP socket to {}: {}", bind_addr, e);
            DhtError::network_error_full("Failed to bind UDP socket", bind_addr.to_string(), e.to_string())
        })?;
        let local_addr = socket.local_addr().map_err(|e| {
            error!("Failed to get local address: {}", e);
            DhtError::network_error_full("Failed to get local address", bind_addr.to_string(), e.to_string())
        })?;
        info!("DHT listening on: {}", local_addr);
        Ok(Self {
            socket,
            local_addr,
            recv_buf: Mutex::new(vec![0u8; max_datagram + 1]),
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        self.socket.send_to(data, target).await.map_err(|e| {
            DhtError::network_error_full("Failed to send datagram", target.to_string(), e.to_string())
        })?;
        trace!("Sent {} bytes to {}", data.len(), target);
        Ok(())
    }

    async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = self.recv_buf.lock().await;
        let (len, from) = self.socket.recv_from(&mut buf[..]).await?;
        Ok((buf[..len].to_vec(), from))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

type Datagram = (Vec<u8>, SocketAddr);

/// In-process datagram network for simulations and tests
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>,
    next_host: AtomicU32,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach an endpoint at `addr`
    pub fn bind(self: &Arc<Self>, addr: SocketAddr) -> Result<MemoryTransport> {
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(&addr) {
            return Err(DhtError::network_error_with_address("Address already in use", addr.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        endpoints.insert(addr, tx);
        Ok(MemoryTransport {
            addr,
            network: self.clone(),
            inbox: Mutex::new(rx),
        })
    }

    /// Attach an endpoint at the next free simulated address
    pub fn bind_next(self: &Arc<Self>) -> Result<MemoryTransport> {
        let host = self.next_host.fetch_add(1, Ordering::Relaxed) + 1;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(0x0A00_0000 | host), 6346));
        self.bind(addr)
    }

    /// Detach an endpoint; datagrams to it are silently lost afterwards
    pub fn disconnect(&self, addr: &SocketAddr) {
        self.endpoints.write().remove(addr);
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }

    fn deliver(&self, data: &[u8], from: SocketAddr, to: SocketAddr) {
        let endpoints = self.endpoints.read();
        match endpoints.get(&to) {
            Some(tx) => {
                let _ = tx.send((data.to_vec(), from));
            }
            None => trace!("Dropping datagram to unknown address {}", to),
        }
    }
}

/// Endpoint on a `MemoryNetwork`
#[derive(Debug)]
pub struct MemoryTransport {
    addr: SocketAddr,
    network: Arc<MemoryNetwork>,
    inbox: Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        self.network.deliver(data, self.addr, target);
        Ok(())
    }

    async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        inbox
            .recv()
            .await
            .ok_or_else(|| DhtError::network_error_with_address("Endpoint disconnected", self.addr.to_string()))
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.disconnect(&self.addr);
    }
}
