use crate::error::{KvError, KvResult};
use crate::resp::{RespParser, RespValue};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Upper bound on connecting to a peer and on each request round trip.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_IDLE: usize = 16;

/// One RESP connection to a peer node.
pub struct PeerClient {
    addr: String,
    stream: TcpStream,
    buf: BytesMut,
}

impl PeerClient {
    pub async fn connect(addr: &str) -> KvResult<Self> {
        let stream = timeout(PEER_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| KvError::peer(addr, "connect timed out"))?
            .map_err(|e| KvError::peer(addr, e))?;
        stream.set_nodelay(true).ok();
        debug!(peer = addr, "Connected to peer");
        Ok(PeerClient {
            addr: addr.to_string(),
            stream,
            buf: BytesMut::with_capacity(4096),
        })
    }

    /// Send one command and wait for its reply.
    pub async fn send(&mut self, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        timeout(PEER_TIMEOUT, self.round_trip(cmdline))
            .await
            .map_err(|_| KvError::peer(&self.addr, "request timed out"))?
    }

    async fn round_trip(&mut self, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        let request = RespValue::from_cmdline(cmdline).serialize();
        self.stream
            .write_all(&request)
            .await
            .map_err(|e| KvError::peer(&self.addr, e))?;
        loop {
            if let Some(reply) =
                RespParser::parse_strict(&mut self.buf).map_err(|e| KvError::peer(&self.addr, e))?
            {
                return Ok(reply);
            }
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| KvError::peer(&self.addr, e))?;
            if n == 0 {
                return Err(KvError::peer(&self.addr, "connection closed"));
            }
        }
    }
}

/// Idle connections to one peer, dialled lazily.
///
/// A connection goes back to the pool only after a successful round trip;
/// a failed one is dropped.
pub struct PeerPool {
    addr: String,
    idle: Mutex<Vec<PeerClient>>,
}

impl PeerPool {
    pub fn new(addr: impl Into<String>) -> Self {
        PeerPool {
            addr: addr.into(),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn request(&self, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        let pooled = self.idle.lock().pop();
        let mut client = match pooled {
            Some(client) => client,
            None => PeerClient::connect(&self.addr).await.inspect_err(|e| {
                warn!(peer = %self.addr, error = %e, "Peer connection failed");
            })?,
        };
        let reply = client.send(cmdline).await?;
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(client);
        }
        Ok(reply)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}
