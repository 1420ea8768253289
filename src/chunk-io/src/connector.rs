use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::net::TcpStream;

use wire_proto::NetworkAddress;

use crate::{ChunkIoError, ChunkIoResult, ChunkserverStats, ChunkserverTimeouts};

/// How long an idle pooled socket stays reusable.
const IDLE_SOCKET_TTL: Duration = Duration::from_secs(3);

struct IdleSocket {
    stream: TcpStream,
    returned_at: Instant,
}

/// Pool of chunkserver connections keyed by address. The pool is the one
/// genuinely shared mutable structure of the I/O engine; a mutex around the
/// idle lists keeps it thread-safe.
pub struct ChunkConnector {
    idle: Mutex<HashMap<NetworkAddress, Vec<IdleSocket>>>,
    timeouts: ChunkserverTimeouts,
    stats: Arc<ChunkserverStats>,
}

impl ChunkConnector {
    pub fn new(timeouts: ChunkserverTimeouts, stats: Arc<ChunkserverStats>) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            timeouts,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ChunkserverStats> {
        &self.stats
    }

    pub fn timeouts(&self) -> ChunkserverTimeouts {
        self.timeouts
    }

    /// Get a live socket to `address`: an idle pooled one if available,
    /// otherwise a fresh connection bounded by the connect timeout.
    pub async fn start_using_connection(
        &self,
        address: NetworkAddress,
    ) -> ChunkIoResult<TcpStream> {
        loop {
            let candidate = {
                let mut idle = self.idle.lock().unwrap();
                idle.get_mut(&address).and_then(|sockets| sockets.pop())
            };
            let Some(socket) = candidate else {
                break;
            };
            if socket.returned_at.elapsed() < IDLE_SOCKET_TTL {
                return Ok(socket.stream);
            }
            // Stale; drop it and look again.
        }

        let deadline = Duration::from_millis(self.timeouts.connect_ms);
        let started = Instant::now();
        match tokio::time::timeout(deadline, TcpStream::connect(address.to_socket_addr())).await {
            Ok(Ok(stream)) => {
                self.stats
                    .register_read_time(address, started.elapsed().as_millis() as u64);
                Ok(stream)
            }
            Ok(Err(err)) => {
                self.stats.register_defect(address);
                Err(ChunkIoError::Connection(format!(
                    "connect to {} failed: {}",
                    address, err
                )))
            }
            Err(_) => {
                self.stats.register_defect(address);
                Err(ChunkIoError::Timeout(format!(
                    "connect to {} timed out after {}ms",
                    address, self.timeouts.connect_ms
                )))
            }
        }
    }

    /// Return a socket to the pool for reuse.
    pub fn end_using_connection(&self, stream: TcpStream, address: NetworkAddress) {
        let mut idle = self.idle.lock().unwrap();
        let sockets = idle.entry(address).or_default();
        if sockets.len() >= 8 {
            debug!("connection pool for {} full, dropping socket", address);
            return;
        }
        sockets.push(IdleSocket {
            stream,
            returned_at: Instant::now(),
        });
    }

    /// Drop a socket after an error and mark the server as defective.
    pub fn invalidate_connection(&self, address: NetworkAddress) {
        warn!("invalidating connection to {}", address);
        self.stats.register_defect(address);
        // The socket itself is simply dropped by the caller.
    }

    pub fn idle_count(&self, address: NetworkAddress) -> usize {
        let idle = self.idle.lock().unwrap();
        idle.get(&address).map(|sockets| sockets.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn local_address(port: u16) -> NetworkAddress {
        NetworkAddress::new(u32::from_be_bytes([127, 0, 0, 1]), port)
    }

    #[tokio::test]
    async fn connect_and_pool_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4];
                    if socket.read_exact(&mut buf).await.is_ok() {
                        let _ = socket.write_all(&buf).await;
                    }
                });
            }
        });

        let connector = ChunkConnector::new(
            ChunkserverTimeouts::default(),
            Arc::new(ChunkserverStats::default()),
        );
        let address = local_address(port);

        let mut stream = connector.start_using_connection(address).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        connector.end_using_connection(stream, address);
        assert_eq!(connector.idle_count(address), 1);

        // The pooled socket is handed back out.
        let _reused = connector.start_using_connection(address).await.unwrap();
        assert_eq!(connector.idle_count(address), 0);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let connector = ChunkConnector::new(
            ChunkserverTimeouts {
                connect_ms: 100,
                ..Default::default()
            },
            Arc::new(ChunkserverStats::default()),
        );
        // Port 1 is essentially guaranteed closed.
        let result = connector.start_using_connection(local_address(1)).await;
        assert!(result.is_err());
    }
}
