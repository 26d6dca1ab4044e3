//! Datagram transports for the collector channel.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::net::UdpSocket;

/// A fire-and-forget datagram transport to the local collector.
///
/// Sends are at-most-once with no acknowledgment or retry; trace loss is
/// an acceptable degradation, blocking production traffic is not.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use [`TransportBoxed`].
pub trait Transport: Send + Sync {
    /// Sends one complete datagram.
    fn send(&self, datagram: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Returns the transport name for logging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`Transport`] for dynamic dispatch.
pub trait TransportBoxed: Send + Sync {
    /// Sends one complete datagram (boxed future for object safety).
    fn send_boxed<'a>(
        &'a self,
        datagram: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;

    /// Returns the transport name for logging.
    fn name(&self) -> &str;
}

/// Blanket implementation: any `Transport` can be used as `TransportBoxed`.
impl<T: Transport> TransportBoxed for T {
    fn send_boxed<'a>(
        &'a self,
        datagram: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
        Box::pin(self.send(datagram))
    }

    fn name(&self) -> &str {
        Transport::name(self)
    }
}

/// UDP transport to the local collector daemon.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds an ephemeral local socket and connects it to the collector
    /// address.
    pub async fn connect(collector: SocketAddr) -> io::Result<Self> {
        let bind_addr = if collector.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(collector).await?;
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send(datagram).await.map(|_| ())
    }

    fn name(&self) -> &str {
        "udp"
    }
}

/// Test transport that records all sent datagrams for verification.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemoryTransport {
    sent: std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
}

#[cfg(test)]
impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn datagrams(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Parses the JSON body of each captured datagram.
    pub fn bodies(&self) -> Vec<serde_json::Value> {
        self.datagrams()
            .iter()
            .filter_map(|frame| {
                let newline = frame.iter().position(|&b| b == b'\n')?;
                serde_json::from_slice(&frame[newline + 1..]).ok()
            })
            .collect()
    }
}

#[cfg(test)]
impl Transport for MemoryTransport {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.sent.lock().unwrap().push(datagram.to_vec());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Test transport whose sends always fail.
#[cfg(test)]
pub struct FailingTransport;

#[cfg(test)]
impl Transport for FailingTransport {
    async fn send(&self, _datagram: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "collector unreachable",
        ))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Test transport that parks forever, for backpressure testing.
#[cfg(test)]
pub struct StuckTransport;

#[cfg(test)]
impl Transport for StuckTransport {
    async fn send(&self, _datagram: &[u8]) -> io::Result<()> {
        std::future::pending().await
    }

    fn name(&self) -> &str {
        "stuck"
    }
}
