//! Byte-identical query forwarding to the upstream resolver.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE: usize = 4096;

/// Relays raw query bytes to one upstream server, alternating TCP and UDP
/// per query.
#[derive(Debug)]
pub(crate) struct Forwarder {
    upstream: String,
    next: AtomicUsize,
}

impl Forwarder {
    pub(crate) fn new(upstream: String) -> Self {
        // A bare address queries the standard DNS port.
        let upstream = if upstream.contains(':') {
            upstream
        } else {
            format!("{upstream}:53")
        };
        Self {
            upstream,
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) async fn forward(&self, raw: &[u8]) -> io::Result<Vec<u8>> {
        let use_tcp = self.next.fetch_add(1, Ordering::Relaxed) % 2 == 0;
        let exchange = async {
            if use_tcp {
                self.forward_tcp(raw).await
            } else {
                self.forward_udp(raw).await
            }
        };
        tokio::time::timeout(FORWARD_TIMEOUT, exchange)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("upstream {} did not answer", self.upstream),
                )
            })?
    }

    async fn forward_tcp(&self, raw: &[u8]) -> io::Result<Vec<u8>> {
        let mut stream = TcpStream::connect(self.upstream.as_str()).await?;
        stream.write_all(&(raw.len() as u16).to_be_bytes()).await?;
        stream.write_all(raw).await?;

        let mut len_bytes = [0u8; 2];
        stream.read_exact(&mut len_bytes).await?;
        let mut response = vec![0u8; u16::from_be_bytes(len_bytes) as usize];
        stream.read_exact(&mut response).await?;
        Ok(response)
    }

    async fn forward_udp(&self, raw: &[u8]) -> io::Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.upstream.as_str()).await?;
        socket.send(raw).await?;

        let mut response = vec![0u8; MAX_RESPONSE];
        let len = socket.recv(&mut response).await?;
        response.truncate(len);
        Ok(response)
    }
}
